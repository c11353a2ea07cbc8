//! # Compass Common
//!
//! Shared utilities for the Compass host tools.
//!
//! ## Logging
//!
//! ```rust,no_run
//! use compass_common::{init_logging, LogFormat, LoggingOptions};
//!
//! init_logging(&LoggingOptions {
//!     level: "info".to_string(),
//!     format: LogFormat::Pretty,
//!     file: None,
//! })
//! .unwrap();
//! ```

pub mod logging;

pub use logging::{init_logging, LogFormat, LoggingOptions};
