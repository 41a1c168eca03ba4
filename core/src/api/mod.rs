//! Entry points for the presentation layer

pub mod trust;

pub use trust::{ApiError, TrustAPI, TrustEvent};
