//! Errors that abort a provisioning run

use std::path::PathBuf;
use thiserror::Error;

type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Fatal provisioning errors. Everything else is reported per step and the
/// run carries on.
#[derive(Debug, Error)]
pub enum PxeError {
    #[error("no free VM name with prefix '{prefix}' after {attempts} attempts")]
    NameExhausted { prefix: String, attempts: u32 },

    #[error("failed to query hypervisor for VM '{name}'")]
    Probe {
        name: String,
        #[source]
        source: BoxError,
    },

    #[error("failed to create VM '{name}'")]
    Create {
        name: String,
        #[source]
        source: BoxError,
    },

    #[error("failed to create storage root {}", path.display())]
    StorageRoot {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid VM spec: {0}")]
    InvalidSpec(String),
}

impl PxeError {
    pub(crate) fn probe(name: &str, source: anyhow::Error) -> Self {
        Self::Probe {
            name: name.to_string(),
            source: source.into(),
        }
    }

    pub(crate) fn create(name: &str, source: anyhow::Error) -> Self {
        Self::Create {
            name: name.to_string(),
            source: source.into(),
        }
    }
}
