// Copyright 2020 Joyent, Inc.

use std::time::Duration;

use serde_derive::{Deserialize, Serialize};

use crate::acl::MATCH_ALL;
use crate::error::ConfigError;
use crate::scheduler::MAX_TIMEOUT;

pub const DEFAULT_RETRIES: i32 = 5;
pub const DEFAULT_TIMEOUT_MS: u64 = 1000;

/// Engine-wide defaults for outbound calls.  Any option a call leaves unset
/// is taken from here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RpcConfig {
    pub retries: i32,
    pub timeout_ms: u64,
    pub destination_origin: String,
}

impl RpcConfig {
    pub fn from_json(text: &str) -> Result<RpcConfig, ConfigError> {
        let config: RpcConfig = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_retries(self.retries)?;
        validate_timeout(self.timeout())?;
        Ok(())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl Default for RpcConfig {
    fn default() -> Self {
        RpcConfig {
            retries: DEFAULT_RETRIES,
            timeout_ms: DEFAULT_TIMEOUT_MS,
            destination_origin: String::from(MATCH_ALL),
        }
    }
}

pub fn validate_retries(retries: i32) -> Result<u32, ConfigError> {
    if retries < 0 {
        Err(ConfigError::NegativeRetries(retries))
    } else {
        Ok(retries as u32)
    }
}

pub fn validate_timeout(timeout: Duration) -> Result<Duration, ConfigError> {
    if timeout > MAX_TIMEOUT {
        Err(ConfigError::TimeoutTooLarge(timeout))
    } else {
        Ok(timeout)
    }
}
