//! Error model and the customization points of the engine.
//!
//! The engine is generic over the error type `E` carried on the error side of
//! every [`FlowResult`](crate::FlowResult). It only ever needs to *mint*
//! errors for a handful of internal situations (cancellation, awaitable
//! creation failure, submission failure, aggregate failure), and the
//! [`ErrorFamily`] trait is the set of those constructors.
//!
//! A ready-made family, [`Fault`], is provided for users who do not bring
//! their own error type. It plays the role of the "captured exception"
//! default of the source model: a kind, an optional static message, and an
//! optional boxed source error that recovery stages can downcast.

use core::fmt;
use std::sync::Arc;

/// How a pipeline run is being cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum CancelKind {
    /// Cooperative: the in-flight awaitable is asked to stop and the
    /// remaining stages observe a cancel error on their inputs.
    Soft,
    /// Forced: in addition to soft behavior, intermediate stages are skipped
    /// and the run jumps straight to the `end` stage.
    Hard,
}

impl fmt::Display for CancelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Soft => write!(f, "soft"),
            Self::Hard => write!(f, "hard"),
        }
    }
}

/// The error constructors the engine requires of an error type.
///
/// Implementations must be cheap: these are called on cancellation and
/// failure paths that may run on arbitrary executor threads.
///
/// `Default` provides the "never delivered" sentinel that aggregator result
/// slots are initialized with.
pub trait ErrorFamily: Send + Default + 'static {
    /// An error describing a soft or hard cancellation.
    fn from_cancel(kind: CancelKind) -> Self;

    /// An error describing a failed awaitable construction.
    fn awaitable_creation() -> Self;

    /// An error describing an awaitable whose `submit` was refused.
    fn submission_failed() -> Self;

    /// The `when_any` terminal error: no child produced a value.
    fn all_failed() -> Self;

    /// The `when_all` terminal error: child `index` failed.
    fn any_failed(index: usize) -> Self;
}

/// Classification of a [`Fault`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum FaultKind {
    /// Sentinel: no result was ever delivered into this slot.
    #[error("unresolved")]
    Unresolved,
    /// The run was cancelled.
    #[error("flow {0}-canceled")]
    Canceled(CancelKind),
    /// An awaitable could not be created.
    #[error("failed to create awaitable")]
    AwaitableCreation,
    /// An awaitable refused submission.
    #[error("failed to submit async operation")]
    SubmissionFailed,
    /// Every branch of a `when_any` failed.
    #[error("all async operations failed")]
    AllFailed,
    /// Branch `{0}` of a `when_all` failed.
    #[error("async operation #{0} failed")]
    AnyFailed(usize),
    /// An error raised by user code.
    #[error("user error")]
    User,
}

/// The provided default error family.
///
/// A `Fault` carries its [`FaultKind`], an optional static message, and an
/// optional source error. The source is what [`catch_fault`] stages match
/// against by downcasting, giving the match-by-type recovery of the source
/// model's `catch_exception`.
///
/// [`catch_fault`]: crate::FlowBuilder::catch_fault
#[derive(Debug, Clone)]
pub struct Fault {
    kind: FaultKind,
    message: Option<&'static str>,
    source: Option<Arc<dyn std::error::Error + Send + Sync>>,
}

impl Fault {
    /// Creates a fault with the given kind and no message.
    #[must_use]
    pub const fn new(kind: FaultKind) -> Self {
        Self {
            kind,
            message: None,
            source: None,
        }
    }

    /// Creates a user fault with a static message.
    #[must_use]
    pub const fn user(message: &'static str) -> Self {
        Self {
            kind: FaultKind::User,
            message: Some(message),
            source: None,
        }
    }

    /// Creates a user fault wrapping a concrete source error.
    #[must_use]
    pub fn with_source<S>(source: S) -> Self
    where
        S: std::error::Error + Send + Sync + 'static,
    {
        Self {
            kind: FaultKind::User,
            message: None,
            source: Some(Arc::new(source)),
        }
    }

    /// Returns the fault's kind.
    #[must_use]
    pub const fn kind(&self) -> FaultKind {
        self.kind
    }

    /// Returns the static message, if one was attached.
    #[must_use]
    pub const fn message(&self) -> Option<&'static str> {
        self.message
    }

    /// Attempts to view the source error as a concrete type.
    #[must_use]
    pub fn source_as<S: std::error::Error + 'static>(&self) -> Option<&S> {
        self.source.as_deref().and_then(|s| s.downcast_ref::<S>())
    }

    /// Returns true if this fault records a cancellation of the given kind.
    #[must_use]
    pub fn is_canceled(&self, kind: CancelKind) -> bool {
        self.kind == FaultKind::Canceled(kind)
    }
}

impl Default for Fault {
    fn default() -> Self {
        Self::new(FaultKind::Unresolved)
    }
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.kind)?;
        if let Some(msg) = self.message {
            write!(f, ": {msg}")?;
        }
        Ok(())
    }
}

impl std::error::Error for Fault {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_deref()
            .map(|s| s as &(dyn std::error::Error + 'static))
    }
}

impl ErrorFamily for Fault {
    fn from_cancel(kind: CancelKind) -> Self {
        Self::new(FaultKind::Canceled(kind))
    }

    fn awaitable_creation() -> Self {
        Self::new(FaultKind::AwaitableCreation)
    }

    fn submission_failed() -> Self {
        Self::new(FaultKind::SubmissionFailed)
    }

    fn all_failed() -> Self {
        Self::new(FaultKind::AllFailed)
    }

    fn any_failed(index: usize) -> Self {
        Self::new(FaultKind::AnyFailed(index))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, thiserror::Error)]
    #[error("io glitch {code}")]
    struct IoGlitch {
        code: u32,
    }

    #[test]
    fn family_constructors_record_their_kind() {
        assert_eq!(
            Fault::from_cancel(CancelKind::Hard).kind(),
            FaultKind::Canceled(CancelKind::Hard)
        );
        assert_eq!(Fault::submission_failed().kind(), FaultKind::SubmissionFailed);
        assert_eq!(Fault::any_failed(2).kind(), FaultKind::AnyFailed(2));
        assert_eq!(Fault::all_failed().kind(), FaultKind::AllFailed);
        assert_eq!(Fault::awaitable_creation().kind(), FaultKind::AwaitableCreation);
    }

    #[test]
    fn default_is_the_unresolved_sentinel() {
        assert_eq!(Fault::default().kind(), FaultKind::Unresolved);
    }

    #[test]
    fn source_downcast_matches_by_type() {
        let fault = Fault::with_source(IoGlitch { code: 7 });
        assert_eq!(fault.source_as::<IoGlitch>().map(|g| g.code), Some(7));
        assert!(fault.source_as::<std::fmt::Error>().is_none());
    }

    #[test]
    fn display_includes_kind_and_message() {
        let fault = Fault::user("bad input");
        let text = fault.to_string();
        assert!(text.contains("user error"));
        assert!(text.contains("bad input"));

        let canceled = Fault::from_cancel(CancelKind::Soft);
        assert!(canceled.to_string().contains("soft-canceled"));
    }
}
