//! Logging facade for the entity limit engine.
//!
//! # Setup
//!
//! To enable logging, invoke the [`init`] function with a [`LogConfig`]. The configuration
//! implements `serde` traits, so it can be obtained from configuration files. This requires the
//! `init` feature.
//!
//! ```ignore
//! use entity_limit_log::LogConfig;
//!
//! let log_config = LogConfig {
//!     enable_backtraces: true,
//!     ..LogConfig::default()
//! };
//!
//! entity_limit_log::init(&log_config);
//! ```
//!
//! # Logging
//!
//! The basic use of this crate is through the five logging macros: [`error!`], [`warn!`],
//! [`info!`], [`debug!`] and [`trace!`] where `error!` represents the highest-priority log messages
//! and `trace!` the lowest. Each of these macros accept format strings similarly to [`println!`]
//! and structured fields like [`tracing`].
//!
//! ## Conventions
//!
//! Log messages should start lowercase and end without punctuation. Prefer short and precise log
//! messages over verbose text. Choose the log level according to these rules:
//!
//! - [`error!`] for bugs and invalid behavior.
//! - [`warn!`] for undesirable behavior.
//! - [`info!`] for messages relevant to the average user.
//! - [`debug!`] for messages usually relevant to debugging, such as admission decisions.
//! - [`trace!`] for full auxiliary information.
//!
//! A denied entity creation is an expected outcome and never logged as an error.
//!
//! ## Logging Error Types
//!
//! To log errors with all their causes, use the [`LogError`] wrapper.
//!
//! ```
//! use std::io::{Error, ErrorKind};
//! use entity_limit_log::LogError;
//!
//! let custom_error = Error::new(ErrorKind::Other, "oh no!");
//! entity_limit_log::error!("operation failed: {}", LogError(&custom_error));
//! ```
//!
//! # Testing
//!
//! For unit testing, there is a separate initialization macro [`init_test!`] that should be called
//! at the beginning of test method. It enables test mode of the logger and customizes log levels
//! for the current crate. This requires the `test` feature.
//!
//! ```ignore
//! #[test]
//! fn test_something() {
//!     entity_limit_log::init_test!();
//! }
//! ```

#![warn(missing_docs)]

#[cfg(feature = "init")]
mod setup;
#[cfg(feature = "init")]
pub use setup::*;

#[cfg(feature = "test")]
pub use test::*;

mod utils;
pub use utils::*;

// Expose the minimal log facade.
#[doc(inline)]
pub use tracing::{debug, error, info, trace, warn};
