// Copyright 2020 Joyent, Inc.

use std::time::Duration;

use thiserror::Error;

use crate::codec::{
    RpcError, ACCESS_DENIED, INVALID_PARAMS, INVALID_REQUEST, METHOD_NOT_FOUND, PARSE_ERROR,
    REMOTE_FAULT,
};

/// Classification of every way a call can fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    MalformedMessage,
    InvalidRequest,
    MethodNotFound,
    AccessDenied,
    InvalidParams,
    RemoteFault,
    Timeout,
    Shutdown,
    Other(i64),
}

impl ErrorKind {
    pub fn from_code(code: i64) -> ErrorKind {
        match code {
            PARSE_ERROR => ErrorKind::MalformedMessage,
            INVALID_REQUEST => ErrorKind::InvalidRequest,
            METHOD_NOT_FOUND => ErrorKind::MethodNotFound,
            ACCESS_DENIED => ErrorKind::AccessDenied,
            INVALID_PARAMS => ErrorKind::InvalidParams,
            REMOTE_FAULT => ErrorKind::RemoteFault,
            other => ErrorKind::Other(other),
        }
    }
}

/// What an error continuation receives.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CallError {
    #[error("remote error: {0}")]
    Remote(RpcError),

    /// Synthesized locally once the retry budget is spent; never sent on the
    /// wire.
    #[error("no response after {attempts} attempts")]
    Timeout { attempts: u32 },

    #[error("rpc engine shut down before the call resolved")]
    Shutdown,
}

impl CallError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CallError::Remote(err) => ErrorKind::from_code(err.code),
            CallError::Timeout { .. } => ErrorKind::Timeout,
            CallError::Shutdown => ErrorKind::Shutdown,
        }
    }
}

/// Usage errors, reported synchronously before anything is sent.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("number of retries must be 0 or higher, got {0}")]
    NegativeRetries(i32),

    #[error("timeout of {0:?} is longer than the maximum of one year")]
    TimeoutTooLarge(Duration),

    #[error("invalid origin pattern: {0}")]
    Pattern(#[from] regex::Error),

    #[error("failed to parse configuration: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("rpc engine is not running")]
    Closed,
}
