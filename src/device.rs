//! Target volume to local block device resolution.
//!
//! The by-id namespace is managed by udev, not by us. A scan is a pure read
//! and can race with an attach in progress, so "no match" is an empty result
//! and the retrying wrapper owns the backoff.

use std::path::{Path, PathBuf};
use std::time::Duration;

use backoff::backoff::Backoff;

use crate::cancel::CancelToken;
use crate::config::{EngineConfig, retry_schedule};
use crate::error::{MigrationError, Result};
use crate::logging::SessionLog;

const MAX_BACKOFF: Duration = Duration::from_secs(8);

/// Maps volume identifiers to device paths by scanning a device namespace.
#[derive(Debug, Clone)]
pub struct DeviceResolver {
    namespace: PathBuf,
    prefix_len: usize,
    attempts: u32,
    backoff: Duration,
}

impl Default for DeviceResolver {
    fn default() -> Self {
        Self::from_config(&EngineConfig::default())
    }
}

impl DeviceResolver {
    pub fn new(namespace: impl Into<PathBuf>) -> Self {
        Self {
            namespace: namespace.into(),
            ..Self::default()
        }
    }

    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            namespace: config.device_namespace.clone(),
            prefix_len: config.volume_id_prefix_len,
            attempts: config.device_resolve_attempts.max(1),
            backoff: config.device_resolve_backoff(),
        }
    }

    pub fn with_retry(mut self, attempts: u32, backoff: Duration) -> Self {
        self.attempts = attempts.max(1);
        self.backoff = backoff;
        self
    }

    pub fn namespace(&self) -> &Path {
        &self.namespace
    }

    /// Every distinct device whose namespace entry contains the volume prefix,
    /// symlinks resolved, sorted. Dangling links are skipped.
    pub fn matches(&self, volume_id: &str) -> Result<Vec<PathBuf>> {
        let prefix = self.prefix(volume_id)?;
        if !self.namespace.is_dir() {
            return Ok(Vec::new());
        }

        let mut names = Vec::new();
        for entry in std::fs::read_dir(&self.namespace)? {
            let entry = entry?;
            if entry.file_name().to_string_lossy().contains(prefix) {
                names.push(entry.path());
            }
        }
        names.sort();

        let mut devices: Vec<PathBuf> = Vec::with_capacity(names.len());
        for name in names {
            let Ok(real) = std::fs::canonicalize(&name) else {
                continue;
            };
            if !devices.contains(&real) {
                devices.push(real);
            }
        }
        Ok(devices)
    }

    /// Resolve `volume_id` once. `None` means "not there yet", not failure.
    pub fn resolve(&self, volume_id: &str) -> Result<Option<PathBuf>> {
        Ok(self.matches(volume_id)?.into_iter().next())
    }

    /// Resolve with bounded exponential backoff.
    pub fn resolve_with_retry(
        &self,
        volume_id: &str,
        log: &SessionLog,
        cancel: &CancelToken,
    ) -> Result<PathBuf> {
        let mut schedule = retry_schedule(self.backoff, MAX_BACKOFF);
        for attempt in 1..=self.attempts {
            let devices = self.matches(volume_id)?;
            if let Some(device) = devices.first() {
                if devices.len() > 1 {
                    log.warn(format_args!(
                        "Volume {} matches {} devices, using {}",
                        volume_id,
                        devices.len(),
                        device.display()
                    ));
                }
                log.info(format_args!(
                    "Volume {} resolved to {} (attempt {})",
                    volume_id,
                    device.display(),
                    attempt
                ));
                return Ok(device.clone());
            }

            if attempt == self.attempts {
                break;
            }
            let Some(delay) = schedule.next_backoff() else {
                break;
            };
            log.debug(format_args!(
                "Volume {} not visible yet, retrying in {:?}",
                volume_id, delay
            ));
            if cancel.sleep(delay) {
                return Err(MigrationError::cancelled("device resolution"));
            }
        }

        Err(MigrationError::DeviceUnresolved {
            volume_id: volume_id.to_string(),
            attempts: self.attempts,
        })
    }

    fn prefix<'a>(&self, volume_id: &'a str) -> Result<&'a str> {
        let volume_id = volume_id.trim();
        match volume_id.char_indices().nth(self.prefix_len) {
            Some((idx, _)) => Ok(&volume_id[..idx]),
            None if volume_id.chars().count() == self.prefix_len => Ok(volume_id),
            None => Err(MigrationError::InvalidVolumeId(
                volume_id.to_string(),
                self.prefix_len,
            )),
        }
    }
}
