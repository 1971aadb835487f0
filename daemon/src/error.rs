//! Daemon errors.

use thiserror::Error;

use telemd_common::config::ConfigError;

use crate::acl::AclError;

/// An error occurred while initializing or running the collector.
#[derive(Debug, Error)]
pub enum Error {
    /// An I/O error.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    /// A configuration error.
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// An allow-list error.
    #[error(transparent)]
    Acl(#[from] AclError),
}
