//! Configuration for the entity limit engine.
//!
//! The configuration file lists the registered condition kinds with their priorities, logging
//! options and the limit rules. It acts as the authority for rule configuration: rules are
//! validated when the file is loaded, so the engine only ever sees well-formed rules.
//!
//! ```yaml
//! logging:
//!   level: debug
//! conditions:
//!   - id: user_limit
//!     priority: 0
//!   - id: role_limit
//!     priority: 10
//! limits:
//!   - name: articles_per_user
//!     entityType: node
//!     bundles: [article]
//!     limit: 10
//!     conditions:
//!       - plugin: user_limit
//! ```

#![warn(missing_docs)]

mod config;

pub use self::config::*;
