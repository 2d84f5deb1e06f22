//! Internal utilities shared by the crate and its test suites.

mod rng;

pub use rng::DetRng;
