use std::io;
use std::path::PathBuf;

use ipnet::IpNet;
use thiserror::Error;

/// Why a raw queue message could not be turned into a request.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MalformedRequest {
    #[error("empty payload")]
    Empty,

    #[error("payload is not valid UTF-8")]
    NotUtf8,

    #[error("unknown message type {0}")]
    UnknownKind(i64),

    #[error("valid address expected, got: {0}")]
    InvalidAddress(String),

    #[error("invalid duration '{0}'")]
    InvalidDuration(String),

    #[error("unexpected trailing data '{0}'")]
    TrailingData(String),
}

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("failed to execute {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("{program} exited with {status}: {stderr}")]
    Command {
        program: String,
        status: std::process::ExitStatus,
        stderr: String,
    },

    #[error("firewall api error: {0}")]
    Api(String),

    #[error("backend configuration error: {0}")]
    Config(String),
}

#[derive(Debug, Error)]
pub enum BanError {
    #[error("no active ban for {0}")]
    NotFound(IpNet),

    #[error("{0} overlaps a trusted network")]
    Trusted(IpNet),

    #[error(transparent)]
    Backend(#[from] BackendError),
}

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("receive interrupted")]
    Interrupted,

    #[error("message longer than {limit} bytes")]
    Oversized { limit: usize },

    #[error("message queue unusable: {0}")]
    Fatal(#[source] io::Error),

    #[error("queue identity file {path}: {source}")]
    Identity {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

#[derive(Debug, Error)]
pub enum StateError {
    #[error("state file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("state file {path} line {line}: {source}")]
    Parse {
        path: PathBuf,
        line: usize,
        #[source]
        source: serde_json::Error,
    },

    #[error("encoding ban record: {0}")]
    Encode(#[source] serde_json::Error),
}
