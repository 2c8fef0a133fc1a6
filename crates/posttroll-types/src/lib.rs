//! # posttroll-types
//!
//! Shared data model for the PostTroll messaging substrate: the wire
//! message envelope and the process-wide configuration bag.
//!
//! ## Architecture
//!
//! ```text
//! Message (message.rs)   -- versioned, self-describing wire envelope
//!     |
//!     v
//! Config (config.rs)     -- process-wide config bag + scoped overrides
//! ```

pub mod config;
pub mod error;
pub mod message;

pub use config::{Config, ConfigScopeGuard};
pub use error::{ConfigError, MessageError};
pub use message::{Message, MessageData, MessageVersion};

/// Result type alias for message envelope operations.
pub type MessageResult<T> = std::result::Result<T, MessageError>;

/// Result type alias for configuration operations.
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;
