//! Invocation contract: the request record in and the response record out.
//!
//! The orchestration tier hands us one JSON request per VM and reads back one
//! JSON response plus the exit status. Nothing else crosses that boundary.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use crate::config::EngineConfig;
use crate::conversion::ConversionJob;
use crate::export::ExportBackend;
use crate::types::SourceDisk;

/// One source disk and the target volume it lands on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskRequest {
    #[serde(flatten)]
    pub source: SourceDisk,
    /// Target volume, resolved to a local device through the by-id namespace
    pub volume_id: String,
}

/// Everything needed to migrate one VM's disks.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MigrationRequest {
    pub vm_name: String,
    pub disks: Vec<DiskRequest>,
    /// Disk that gets converted; the first disk when unset
    #[serde(default)]
    pub boot_disk_key: Option<String>,
    pub export: ExportBackend,
    /// Change-tracking manifest exported by the source; tracking is off without one
    #[serde(default)]
    pub change_manifest: Option<PathBuf>,

    #[serde(default)]
    pub assume_zero: bool,
    /// Warm sync pass; conversion waits for the cut-over run
    #[serde(default)]
    pub cbt_sync: bool,
    #[serde(default)]
    pub cutover: bool,
    #[serde(default)]
    pub skip_conversion: bool,
    #[serde(default)]
    pub debug: bool,

    #[serde(default)]
    pub run_script: Option<PathBuf>,
    #[serde(default)]
    pub boot_script: Option<PathBuf>,
    /// Extra converter options, whitespace separated
    #[serde(default)]
    pub extra_opts: Option<String>,

    #[serde(default)]
    pub engine: EngineConfig,
}

impl MigrationRequest {
    /// Load a request from a JSON file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read request from {:?}", path.as_ref()))?;

        let request: Self =
            serde_json::from_str(&content).context("Failed to parse request JSON")?;

        Ok(request)
    }

    /// Validate the request
    pub fn validate(&self) -> Result<()> {
        if self.vm_name.trim().is_empty() {
            anyhow::bail!("vm_name must be specified");
        }
        if self.disks.is_empty() {
            anyhow::bail!("At least one disk is required");
        }

        let mut keys = HashSet::new();
        let mut labels = HashSet::new();
        for disk in &self.disks {
            if disk.source.key.trim().is_empty() {
                anyhow::bail!("Every disk needs a key");
            }
            if !keys.insert(disk.source.key.as_str()) {
                anyhow::bail!("Duplicate disk key {}", disk.source.key);
            }
            if !labels.insert(disk.source.backing_label.as_str()) {
                anyhow::bail!("Duplicate backing label {}", disk.source.backing_label);
            }
            if disk.volume_id.trim().is_empty() {
                anyhow::bail!("Disk {} has no volume_id", disk.source.key);
            }
            if disk.volume_id.trim().chars().count() < self.engine.volume_id_prefix_len {
                anyhow::bail!(
                    "Volume ID {} of disk {} is shorter than {} characters",
                    disk.volume_id,
                    disk.source.key,
                    self.engine.volume_id_prefix_len
                );
            }
        }

        if let Some(boot) = &self.boot_disk_key
            && !keys.contains(boot.as_str())
        {
            anyhow::bail!("boot_disk_key {} does not name a disk in the request", boot);
        }

        self.export.validate().context("Invalid export")?;
        self.engine.validate().context("Invalid engine configuration")?;
        Ok(())
    }

    /// Conversion is skipped on warm sync passes and when asked to
    pub fn wants_conversion(&self) -> bool {
        !self.skip_conversion && !(self.cbt_sync && !self.cutover)
    }

    pub fn boot_disk_key(&self) -> Option<&str> {
        self.boot_disk_key
            .as_deref()
            .or_else(|| self.disks.first().map(|d| d.source.key.as_str()))
    }

    /// Conversion settings; the target device is filled in once known
    pub fn conversion_template(&self) -> Option<ConversionJob> {
        if !self.wants_conversion() {
            return None;
        }
        Some(ConversionJob {
            target_device: PathBuf::new(),
            run_script: self.run_script.clone(),
            firstboot_script: self.boot_script.clone(),
            extra_opts: self
                .extra_opts
                .as_deref()
                .map(|o| o.split_whitespace().map(String::from).collect())
                .unwrap_or_default(),
            debug: self.debug,
        })
    }
}

/// Per-disk part of the response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskOutcome {
    /// Target volume
    pub id: String,
    pub key: String,
    pub device: Option<String>,
    pub primary: bool,
    pub status: String,
    pub copy_mode: Option<String>,
    pub change_id: String,
    pub bytes: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// The single output record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleResponse {
    pub changed: bool,
    pub failed: bool,
    pub msg: String,
    /// Migrated volumes, boot volume first
    #[serde(default)]
    pub id: Vec<String>,
    #[serde(default)]
    pub disks: Vec<DiskOutcome>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_file: Option<String>,
}

impl ModuleResponse {
    /// Failure before any session work started
    pub fn failure(msg: impl Into<String>) -> Self {
        Self {
            changed: false,
            failed: true,
            msg: msg.into(),
            id: Vec::new(),
            disks: Vec::new(),
            log_file: None,
        }
    }

    /// Success that changed nothing
    pub fn unchanged(msg: impl Into<String>) -> Self {
        Self {
            failed: false,
            ..Self::failure(msg)
        }
    }

    pub fn exit_code(&self) -> i32 {
        if self.failed { 1 } else { 0 }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|e| {
            format!(
                r#"{{"changed":false,"failed":true,"msg":"failed to encode response: {}"}}"#,
                e
            )
        })
    }
}
