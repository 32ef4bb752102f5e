use std::io;
use thiserror::Error;

use crate::registry::ResourceKind;

pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("truncated record: need {needed} bytes at offset {offset}, only {available} available")]
    TruncatedRecord {
        offset: usize,
        needed: usize,
        available: usize,
    },
}

#[derive(Error, Debug)]
#[error("failed to release {kind} '{name}'")]
pub struct ReleaseError {
    pub kind: ResourceKind,
    pub name: String,
    #[source]
    pub source: BoxError,
}

#[derive(Error, Debug)]
pub enum ReadError {
    /// The reader was closed; the consumption loop ends cleanly on this.
    #[error("ring buffer reader closed")]
    Closed,
    #[error("ring buffer read failed")]
    Transient(#[source] io::Error),
}

/// Fatal agent errors. Everything here ends the process with status 1.
#[derive(Error, Debug)]
pub enum AgentError {
    #[error("failed to load {what}")]
    ResourceLoad {
        what: String,
        #[source]
        source: BoxError,
    },

    #[error("failed to open ring buffer reader on map '{map}'")]
    ReaderOpen {
        map: String,
        #[source]
        source: BoxError,
    },

    #[error("failed to attach program '{program}' to tracepoint {category}/{name}")]
    Attach {
        program: String,
        category: String,
        name: String,
        #[source]
        source: BoxError,
    },

    #[error(transparent)]
    Release(#[from] ReleaseError),

    #[error("failed to install signal handler")]
    Signal(#[source] io::Error),
}

impl AgentError {
    pub fn resource_load(what: impl Into<String>, source: impl Into<BoxError>) -> Self {
        AgentError::ResourceLoad {
            what: what.into(),
            source: source.into(),
        }
    }
}
