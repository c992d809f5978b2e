// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::path::Path;
use std::time::Duration;

use serde_derive::{Deserialize, Serialize};
use thiserror::Error;

pub use truenas_vm::DeviceDeclaration;
use truenas_vm::{
    resolve_desired, InvalidDesiredState, PowerState, TransitionPolicy,
};

/// Configuration for managing one TrueNAS VM.
#[derive(Default, Serialize, Deserialize, Debug, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub connection: Connection,

    #[serde(default)]
    pub vm: Option<VmConfig>,

    #[serde(default)]
    pub transition: TransitionOverrides,

    #[serde(default, rename = "device")]
    pub devices: Vec<DeviceDeclaration>,
}

/// Where the TrueNAS API lives and how to authenticate to it.
#[derive(Default, Serialize, Deserialize, Debug, PartialEq, Eq)]
pub struct Connection {
    /// Scheme and host, e.g. `https://nas.example.com`.
    pub base_url: Option<String>,

    pub api_key: Option<String>,

    /// Name of an environment variable holding the API key. Ignored when
    /// `api_key` is set.
    pub api_key_env: Option<String>,

    pub timeout_secs: Option<u64>,
}

impl Connection {
    /// Resolves the API key, reading `api_key_env` if needed.
    pub fn resolve_api_key(&self) -> Result<Option<String>, ParseError> {
        if let Some(key) = &self.api_key {
            return Ok(Some(key.clone()));
        }
        match &self.api_key_env {
            Some(var) => std::env::var(var)
                .map(Some)
                .map_err(|_| ParseError::MissingEnv(var.clone())),
            None => Ok(None),
        }
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_secs.map(Duration::from_secs)
    }
}

/// The VM being managed.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq)]
pub struct VmConfig {
    pub id: u64,

    pub desired_state: Option<String>,

    /// Legacy switch; only consulted when `desired_state` is unset.
    pub start_on_create: Option<bool>,
}

impl VmConfig {
    pub fn desired_state(&self) -> Result<PowerState, InvalidDesiredState> {
        resolve_desired(self.desired_state.as_deref(), self.start_on_create)
    }
}

/// Optional overrides of the transition engine's timing, in seconds.
#[derive(Default, Serialize, Deserialize, Debug, PartialEq, Eq)]
pub struct TransitionOverrides {
    pub max_attempts: Option<u32>,
    pub retry_delay_secs: Option<u64>,
    pub settle_delay_secs: Option<u64>,
    pub poll_interval_secs: Option<u64>,
    pub poll_timeout_secs: Option<u64>,
}

impl TransitionOverrides {
    /// The default policy with any overrides applied.
    pub fn policy(&self) -> Result<TransitionPolicy, ParseError> {
        let mut policy = TransitionPolicy::default();
        if let Some(n) = self.max_attempts {
            if n == 0 {
                return Err(ParseError::InvalidValue(
                    "transition.max_attempts",
                    "must be at least 1".to_string(),
                ));
            }
            policy.max_attempts = n;
        }
        if let Some(s) = self.poll_interval_secs {
            if s == 0 {
                return Err(ParseError::InvalidValue(
                    "transition.poll_interval_secs",
                    "must be at least 1".to_string(),
                ));
            }
            policy.poll_interval = Duration::from_secs(s);
        }
        if let Some(s) = self.retry_delay_secs {
            policy.retry_delay = Duration::from_secs(s);
        }
        if let Some(s) = self.settle_delay_secs {
            policy.settle_delay = Duration::from_secs(s);
        }
        if let Some(s) = self.poll_timeout_secs {
            policy.poll_timeout = Duration::from_secs(s);
        }
        Ok(policy)
    }
}

/// Errors which may be returned when parsing the configuration.
#[derive(Error, Debug)]
pub enum ParseError {
    #[error("Cannot parse toml: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Environment variable {0} is not set")]
    MissingEnv(String),

    #[error("Invalid value for {0}: {1}")]
    InvalidValue(&'static str, String),

    #[error(transparent)]
    DesiredState(#[from] InvalidDesiredState),
}

impl Config {
    fn validate(&self) -> Result<(), ParseError> {
        self.transition.policy()?;
        if let Some(vm) = &self.vm {
            vm.desired_state()?;
        }
        Ok(())
    }
}

/// Parses TOML text into a validated configuration.
pub fn parse_str(contents: &str) -> Result<Config, ParseError> {
    let cfg = toml::from_str::<Config>(contents)?;
    cfg.validate()?;
    Ok(cfg)
}

/// Parses a TOML file into a configuration object.
pub fn parse<P: AsRef<Path>>(path: P) -> Result<Config, ParseError> {
    let contents = std::fs::read_to_string(path.as_ref())?;
    parse_str(&contents)
}
