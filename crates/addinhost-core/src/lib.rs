//! Addinhost Core Library
//!
//! Shared runtime pieces used by the plugin host and by plugins themselves:
//! - Error taxonomy with stable codes
//! - Host configuration (TOML) and a key/value configuration store
//! - Service registry for optional collaborators
//! - Topic based message bus with request/response RPC and envelope pooling

pub mod bus;
pub mod config;
pub mod error;
pub mod services;

pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::bus::{MessageBus, PublishReport, RpcEnvelope, Subscription};
    pub use crate::config::{ConfigStore, HostConfig};
    pub use crate::error::{Error, Result};
    pub use crate::services::{ServiceRegistry, ServiceScope};
}
