use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Kind of driver behind a device. Drivers for other backends add variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[non_exhaustive]
pub enum BackendType {
    Host,
}

/// Address of a device: index of its driver, then index within that driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DeviceId {
    pub driver: usize,
    pub device: usize,
}

impl DeviceId {
    pub const fn new(driver: usize, device: usize) -> Self {
        Self { driver, device }
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.driver, self.device)
    }
}

/// Parses `"<driver>:<device>"`.
///
/// Range checks against the installed drivers happen later, in
/// `DeviceRegistry::resolve`.
impl FromStr for DeviceId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (driver, device) = s
            .trim()
            .split_once(':')
            .ok_or_else(|| Error::config(format!("device string `{s}` is not of the form driver:device")))?;
        let driver = driver
            .trim()
            .parse::<usize>()
            .map_err(|_| Error::config(format!("invalid driver index in `{s}`")))?;
        let device = device
            .trim()
            .parse::<usize>()
            .map_err(|_| Error::config(format!("invalid device index in `{s}`")))?;
        Ok(Self { driver, device })
    }
}
