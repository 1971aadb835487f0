//! Source-address allow list gating `accept`.
//!
//! One textual CIDR entry per line, loaded once at start-up; lookups are
//! a linear scan, ordered as the file orders them.

use std::net::IpAddr;
use std::path::{Path, PathBuf};

use ipnet::IpNet;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AclError {
    #[error("unable to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("{}:{line}: invalid network '{entry}'", path.display())]
    Invalid {
        path: PathBuf,
        line: usize,
        entry: String,
    },
}

/// Ordered list of allowed source networks.
#[derive(Debug, Clone, Default)]
pub struct AllowList {
    nets: Vec<IpNet>,
}

impl AllowList {
    pub fn load(path: &Path) -> Result<Self, AclError> {
        let contents = std::fs::read_to_string(path).map_err(|source| AclError::Read {
            path: path.to_owned(),
            source,
        })?;

        let mut nets = Vec::new();
        for (lineno, line) in contents.lines().enumerate() {
            let entry = line.trim();
            if entry.is_empty() || entry.starts_with('#') {
                continue;
            }
            // Bare addresses count as host networks.
            let net = entry
                .parse::<IpNet>()
                .or_else(|_| entry.parse::<IpAddr>().map(IpNet::from))
                .map_err(|_| AclError::Invalid {
                    path: path.to_owned(),
                    line: lineno + 1,
                    entry: entry.to_owned(),
                })?;
            nets.push(net);
        }
        Ok(Self { nets })
    }

    pub fn len(&self) -> usize {
        self.nets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nets.is_empty()
    }

    pub fn contains(&self, addr: IpAddr) -> bool {
        self.nets.iter().any(|net| net.contains(&addr))
    }
}
