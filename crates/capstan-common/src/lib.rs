//! Common types for capstan: errors, configuration, polling and utilities

#![deny(missing_docs)]

pub mod config;
pub mod credentials;
pub mod dynamic;
pub mod error;
pub mod kube_utils;
pub mod poll;
pub mod telemetry;

pub use config::{ConfigReader, Variables};
pub use error::Error;
pub use poll::{poll_until_converged, PollOutcome, PollSettings};

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;
