//! Engine configuration.
//!
//! Operator-tunable limits and tool locations. Every field has a default so a
//! request may omit the whole `engine` block or any part of it.

use backoff::ExponentialBackoff;
use serde::{Deserialize, Serialize};
use strum::Display;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{MigrationError, Result};

fn default_max_parallel_transfers() -> usize {
    4
}
fn default_ready_timeout_secs() -> u64 {
    30
}
fn default_ready_poll_interval_ms() -> u64 {
    2000
}
fn default_ready_connect_timeout_ms() -> u64 {
    2000
}
fn default_ready_retries() -> u32 {
    2
}
fn default_device_resolve_attempts() -> u32 {
    10
}
fn default_device_resolve_backoff_ms() -> u64 {
    500
}
fn default_device_namespace() -> PathBuf {
    PathBuf::from("/dev/disk/by-id")
}
fn default_volume_id_prefix_len() -> usize {
    18
}
fn default_nbdkit_program() -> String {
    "nbdkit".to_string()
}
fn default_nbdcopy_program() -> String {
    "/usr/bin/nbdcopy".to_string()
}
fn default_v2v_program() -> String {
    "virt-v2v-in-place".to_string()
}
fn default_listen_host() -> String {
    "127.0.0.1".to_string()
}
fn default_socket_dir() -> PathBuf {
    PathBuf::from("/tmp")
}
fn default_log_dir() -> PathBuf {
    PathBuf::from("/tmp")
}
fn default_stop_grace_ms() -> u64 {
    5000
}
fn default_stderr_tail_lines() -> usize {
    20
}

/// How exports accept NBD connections.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ExportTransport {
    /// A Unix socket private to the export process
    #[default]
    Unix,
    /// A TCP port on `listen_host`
    Tcp,
}

/// Tunables for one engine instance (shared by all sessions on the host).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EngineConfig {
    /// Export+copy pipelines allowed to run at once on this host
    #[serde(default = "default_max_parallel_transfers")]
    pub max_parallel_transfers: usize,

    /// How long one liveness wait may take before `Timeout`
    #[serde(default = "default_ready_timeout_secs")]
    pub ready_timeout_secs: u64,
    #[serde(default = "default_ready_poll_interval_ms")]
    pub ready_poll_interval_ms: u64,
    #[serde(default = "default_ready_connect_timeout_ms")]
    pub ready_connect_timeout_ms: u64,
    /// Extra liveness waits after the first timeout
    #[serde(default = "default_ready_retries")]
    pub ready_retries: u32,

    #[serde(default = "default_device_resolve_attempts")]
    pub device_resolve_attempts: u32,
    /// First backoff step; doubled per attempt, capped at 8s
    #[serde(default = "default_device_resolve_backoff_ms")]
    pub device_resolve_backoff_ms: u64,
    #[serde(default = "default_device_namespace")]
    pub device_namespace: PathBuf,
    #[serde(default = "default_volume_id_prefix_len")]
    pub volume_id_prefix_len: usize,

    #[serde(default = "default_nbdkit_program")]
    pub nbdkit_program: String,
    #[serde(default = "default_nbdcopy_program")]
    pub nbdcopy_program: String,
    #[serde(default = "default_v2v_program")]
    pub v2v_program: String,
    /// Incremental transfer helper; the running executable when unset
    #[serde(default)]
    pub extent_copy_program: Option<String>,

    #[serde(default)]
    pub export_transport: ExportTransport,
    /// Directory for export sockets (unix transport)
    #[serde(default = "default_socket_dir")]
    pub socket_dir: PathBuf,
    /// Address exports bind to (tcp transport)
    #[serde(default = "default_listen_host")]
    pub listen_host: String,
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
    #[serde(default = "default_stop_grace_ms")]
    pub stop_grace_ms: u64,
    #[serde(default = "default_stderr_tail_lines")]
    pub stderr_tail_lines: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_parallel_transfers: default_max_parallel_transfers(),
            ready_timeout_secs: default_ready_timeout_secs(),
            ready_poll_interval_ms: default_ready_poll_interval_ms(),
            ready_connect_timeout_ms: default_ready_connect_timeout_ms(),
            ready_retries: default_ready_retries(),
            device_resolve_attempts: default_device_resolve_attempts(),
            device_resolve_backoff_ms: default_device_resolve_backoff_ms(),
            device_namespace: default_device_namespace(),
            volume_id_prefix_len: default_volume_id_prefix_len(),
            nbdkit_program: default_nbdkit_program(),
            nbdcopy_program: default_nbdcopy_program(),
            v2v_program: default_v2v_program(),
            extent_copy_program: None,
            export_transport: ExportTransport::default(),
            socket_dir: default_socket_dir(),
            listen_host: default_listen_host(),
            log_dir: default_log_dir(),
            stop_grace_ms: default_stop_grace_ms(),
            stderr_tail_lines: default_stderr_tail_lines(),
        }
    }
}

/// Doubling retry schedule from `initial`, capped at `max_interval`.
///
/// No jitter and no elapsed-time limit: callers bound the number of
/// attempts themselves and sleep through their cancel token.
pub fn retry_schedule(initial: Duration, max_interval: Duration) -> ExponentialBackoff {
    ExponentialBackoff {
        current_interval: initial,
        initial_interval: initial,
        randomization_factor: 0.0,
        multiplier: 2.0,
        max_interval,
        max_elapsed_time: None,
        ..Default::default()
    }
}

impl EngineConfig {
    pub fn ready_timeout(&self) -> Duration {
        Duration::from_secs(self.ready_timeout_secs)
    }

    pub fn ready_poll_interval(&self) -> Duration {
        Duration::from_millis(self.ready_poll_interval_ms)
    }

    pub fn ready_connect_timeout(&self) -> Duration {
        Duration::from_millis(self.ready_connect_timeout_ms)
    }

    pub fn device_resolve_backoff(&self) -> Duration {
        Duration::from_millis(self.device_resolve_backoff_ms)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }

    /// Program used for incremental copies
    pub fn extent_copy_program(&self) -> Result<String> {
        if let Some(program) = &self.extent_copy_program {
            return Ok(program.clone());
        }
        let exe = std::env::current_exe()?;
        Ok(exe.to_string_lossy().into_owned())
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.max_parallel_transfers == 0 {
            return Err(MigrationError::config(
                "max_parallel_transfers must be at least 1",
            ));
        }
        if self.ready_timeout_secs == 0 {
            return Err(MigrationError::config("ready_timeout_secs must be positive"));
        }
        if self.ready_poll_interval_ms == 0 || self.ready_connect_timeout_ms == 0 {
            return Err(MigrationError::config(
                "ready poll interval and connect timeout must be positive",
            ));
        }
        if self.device_resolve_attempts == 0 {
            return Err(MigrationError::config(
                "device_resolve_attempts must be at least 1",
            ));
        }
        if self.volume_id_prefix_len == 0 {
            return Err(MigrationError::config(
                "volume_id_prefix_len must be positive",
            ));
        }
        for (name, value) in [
            ("nbdkit_program", &self.nbdkit_program),
            ("nbdcopy_program", &self.nbdcopy_program),
            ("v2v_program", &self.v2v_program),
            ("listen_host", &self.listen_host),
        ] {
            if value.trim().is_empty() {
                return Err(MigrationError::config(format!("{} must not be empty", name)));
            }
        }
        if let Some(program) = &self.extent_copy_program
            && program.trim().is_empty()
        {
            return Err(MigrationError::config(
                "extent_copy_program must not be empty when set",
            ));
        }
        Ok(())
    }
}
