use crate::tpm::DaParameters;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use thiserror::Error;
use tss_esapi::handles::PersistentTpmHandle;

/// Where the storage root key lives unless configured otherwise
pub const DEFAULT_SRK_HANDLE: u32 = 0x8100_0001;

pub const DEFAULT_LOCKOUT: DaParameters = DaParameters {
    max_auth_fail: 32,
    recovery_time: 7200,
    lockout_recovery_time: 86400,
};

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("cannot read config {0}: {1}")]
    Read(String, #[source] std::io::Error),
    #[error("invalid config: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("{0:#010x} is not a persistent handle")]
    NotPersistent(u32),
}

/// A handle in the persistent range 0x81000000..=0x81ffffff
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(try_from = "u32", into = "u32")]
pub struct SrkHandle(u32);

impl TryFrom<u32> for SrkHandle {
    type Error = ConfigError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        PersistentTpmHandle::new(value).map_err(|_| ConfigError::NotPersistent(value))?;
        Ok(Self(value))
    }
}

impl From<SrkHandle> for u32 {
    fn from(handle: SrkHandle) -> u32 {
        handle.0
    }
}

impl Default for SrkHandle {
    fn default() -> Self {
        Self(DEFAULT_SRK_HANDLE)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub srk_handle: SrkHandle,
    pub lockout: DaParameters,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            srk_handle: SrkHandle::default(),
            lockout: DEFAULT_LOCKOUT,
        }
    }
}

impl Config {
    pub fn srk(&self) -> Result<PersistentTpmHandle, ConfigError> {
        let handle = self.srk_handle.0;
        PersistentTpmHandle::new(handle).map_err(|_| ConfigError::NotPersistent(handle))
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents =
            fs::read_to_string(path).map_err(|e| ConfigError::Read(path.display().to_string(), e))?;
        Self::from_yaml(&contents)
    }

    pub fn from_yaml(contents: &str) -> Result<Self, ConfigError> {
        Ok(serde_yaml::from_str(contents)?)
    }
}
