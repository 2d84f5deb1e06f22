//! The universal carrier between pipeline stages.
//!
//! Every value travelling through a blueprint is a [`FlowResult`]: either a
//! value produced by the previous stage or an error that short-circuits
//! ordinary computation. Errors are data, not control flow: a calc stage
//! that receives an error forwards it untouched, and only the dedicated
//! recovery stages (`on_error`, `catch_fault`) may turn an error back into a
//! value.

/// A two-sided result carried between pipeline stages.
///
/// Unlike [`std::result::Result`], a `FlowResult` is the *normal* stage
/// currency, not an exceptional one: receivers observe a `FlowResult`, child
/// pipelines deliver a `FlowResult`, awaitables resume with a `FlowResult`.
///
/// The default state (when `E: Default`) is an error, matching the
/// aggregator slots that start out as "never delivered" sentinels.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlowResult<T, E> {
    /// The value side: the previous stage produced `T`.
    Value(T),
    /// The error side: some upstream stage failed with `E`.
    Error(E),
}

impl<T, E> FlowResult<T, E> {
    /// Creates a result holding a value.
    #[must_use]
    pub const fn value(value: T) -> Self {
        Self::Value(value)
    }

    /// Creates a result holding an error.
    #[must_use]
    pub const fn error(error: E) -> Self {
        Self::Error(error)
    }

    /// Returns true if this result holds a value.
    #[must_use]
    pub const fn has_value(&self) -> bool {
        matches!(self, Self::Value(_))
    }

    /// Returns true if this result holds an error.
    #[must_use]
    pub const fn has_error(&self) -> bool {
        matches!(self, Self::Error(_))
    }

    /// Borrows the held value, if any.
    #[must_use]
    pub const fn value_ref(&self) -> Option<&T> {
        match self {
            Self::Value(v) => Some(v),
            Self::Error(_) => None,
        }
    }

    /// Borrows the held error, if any.
    #[must_use]
    pub const fn error_ref(&self) -> Option<&E> {
        match self {
            Self::Value(_) => None,
            Self::Error(e) => Some(e),
        }
    }

    /// Moves the held value out, if any.
    pub fn into_value(self) -> Option<T> {
        match self {
            Self::Value(v) => Some(v),
            Self::Error(_) => None,
        }
    }

    /// Moves the held error out, if any.
    pub fn into_error(self) -> Option<E> {
        match self {
            Self::Value(_) => None,
            Self::Error(e) => Some(e),
        }
    }

    /// Replaces whatever is held with an error.
    pub fn emplace_error(&mut self, error: E) {
        *self = Self::Error(error);
    }

    /// Maps the value side, leaving errors untouched.
    pub fn map_value<U, F: FnOnce(T) -> U>(self, f: F) -> FlowResult<U, E> {
        match self {
            Self::Value(v) => FlowResult::Value(f(v)),
            Self::Error(e) => FlowResult::Error(e),
        }
    }

    /// Maps the error side, leaving values untouched.
    pub fn map_error<E2, F: FnOnce(E) -> E2>(self, f: F) -> FlowResult<T, E2> {
        match self {
            Self::Value(v) => FlowResult::Value(v),
            Self::Error(e) => FlowResult::Error(f(e)),
        }
    }

    /// Converts into a [`std::result::Result`].
    pub fn into_result(self) -> Result<T, E> {
        match self {
            Self::Value(v) => Ok(v),
            Self::Error(e) => Err(e),
        }
    }
}

impl<T, E: Default> Default for FlowResult<T, E> {
    fn default() -> Self {
        Self::Error(E::default())
    }
}

impl<T, E> From<Result<T, E>> for FlowResult<T, E> {
    fn from(r: Result<T, E>) -> Self {
        match r {
            Ok(v) => Self::Value(v),
            Err(e) => Self::Error(e),
        }
    }
}
