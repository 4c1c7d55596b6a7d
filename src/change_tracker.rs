//! Change tracking resolution.
//!
//! Asks the source platform whether a disk has a usable synchronisation
//! checkpoint and, if so, which byte ranges changed since. The diff itself
//! is the platform's; this module only normalises the answer into a
//! `ChangeState` and decides that anything odd about the prior checkpoint
//! means "copy everything".

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

use crate::error::{MigrationError, Result};
use crate::logging::SessionLog;
use crate::types::{ChangeId, ChangeState, Extent, SourceDisk, normalize_extents};

/// One page of the platform's changed-area query.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ChangedAreas {
    /// Start of the range this page covers
    pub start_offset: u64,
    /// Length of the range this page covers (not of the changes)
    pub length: u64,
    pub areas: Vec<Extent>,
}

/// The source platform's change-tracking facility.
pub trait ChangeSource: Send + Sync {
    /// Whether change tracking is switched on for the VM
    fn tracking_enabled(&self) -> Result<bool>;

    /// Current change ID of the backing device with this label.
    /// `None` when no backing device matches.
    fn current_change_id(&self, backing_label: &str) -> Result<Option<String>>;

    /// Areas changed since `since`, starting at `start_offset`.
    /// `None` when the platform does not recognise the checkpoint.
    fn changed_areas(
        &self,
        backing_label: &str,
        since: &ChangeId,
        start_offset: u64,
    ) -> Result<Option<ChangedAreas>>;
}

impl<T: ChangeSource + ?Sized> ChangeSource for &T {
    fn tracking_enabled(&self) -> Result<bool> {
        (**self).tracking_enabled()
    }

    fn current_change_id(&self, backing_label: &str) -> Result<Option<String>> {
        (**self).current_change_id(backing_label)
    }

    fn changed_areas(
        &self,
        backing_label: &str,
        since: &ChangeId,
        start_offset: u64,
    ) -> Result<Option<ChangedAreas>> {
        (**self).changed_areas(backing_label, since, start_offset)
    }
}

/// Resolves `ChangeState` for source disks.
pub struct ChangeTracker<S> {
    source: S,
}

impl<S: ChangeSource> ChangeTracker<S> {
    pub fn new(source: S) -> Self {
        Self { source }
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    pub fn resolve(&self, disk: &SourceDisk, log: &SessionLog) -> Result<ChangeState> {
        if !self.source.tracking_enabled()? {
            log.info("Change tracking disabled, full copy required");
            return Ok(ChangeState::without_prior(""));
        }

        let current = self
            .source
            .current_change_id(&disk.backing_label)?
            .ok_or_else(|| MigrationError::DiskNotFound {
                label: disk.backing_label.clone(),
            })?;
        if current.trim().is_empty() {
            log.warn("Change tracking enabled but disk has no change ID, full copy required");
            return Ok(ChangeState::without_prior(""));
        }

        let Some(prior) = self.usable_prior(disk, &current, log) else {
            return Ok(ChangeState::without_prior(current));
        };

        if prior.as_str() == current.trim() {
            log.info(format_args!("No change since {}, nothing to copy", prior));
            return Ok(ChangeState {
                has_prior_state: true,
                change_id: current,
                changed_extents: Vec::new(),
            });
        }

        let Some(extents) = self.collect_changes(disk, &prior, log)? else {
            log.warn(format_args!(
                "Source does not recognise checkpoint {}, full copy required",
                prior
            ));
            return Ok(ChangeState::without_prior(current));
        };

        let extents = clamp_to_disk(normalize_extents(extents), disk.size_bytes);
        log.info(format_args!(
            "Change ID {} -> {}: {} changed extent(s), {} bytes",
            prior,
            current,
            extents.len(),
            extents.iter().map(|e| e.length).sum::<u64>()
        ));
        Ok(ChangeState {
            has_prior_state: true,
            change_id: current,
            changed_extents: extents,
        })
    }

    fn usable_prior(&self, disk: &SourceDisk, current: &str, log: &SessionLog) -> Option<ChangeId> {
        let raw = disk.prior_change_id.as_deref()?.trim();
        if raw.is_empty() {
            return None;
        }
        let prior = match raw.parse::<ChangeId>() {
            Ok(prior) => prior,
            Err(e) => {
                log.warn(format_args!("Ignoring prior change ID: {}", e));
                return None;
            }
        };
        // The current ID is the platform's; if it doesn't parse we can still
        // compare for equality and let the platform diff
        if let Ok(current) = current.parse::<ChangeId>() {
            if current.epoch() != prior.epoch() {
                log.warn(format_args!(
                    "Change tracking was reset since {}, full copy required",
                    prior
                ));
                return None;
            }
            if prior.sequence() > current.sequence() {
                log.warn(format_args!(
                    "Prior change ID {} is newer than current {}, ignoring it",
                    prior, current
                ));
                return None;
            }
        }
        Some(prior)
    }

    fn collect_changes(
        &self,
        disk: &SourceDisk,
        prior: &ChangeId,
        log: &SessionLog,
    ) -> Result<Option<Vec<Extent>>> {
        let mut extents = Vec::new();
        let mut offset = 0u64;
        loop {
            let Some(page) = self
                .source
                .changed_areas(&disk.backing_label, prior, offset)?
            else {
                return Ok(None);
            };
            log.debug(format_args!(
                "Changed areas page at {}: {} area(s)",
                page.start_offset,
                page.areas.len()
            ));
            extents.extend(page.areas);

            let next = page.start_offset.saturating_add(page.length);
            if page.length == 0 || next <= offset || next >= disk.size_bytes {
                break;
            }
            offset = next;
        }
        Ok(Some(extents))
    }
}

fn clamp_to_disk(extents: Vec<Extent>, size: u64) -> Vec<Extent> {
    extents
        .into_iter()
        .filter(|e| e.offset < size)
        .map(|e| Extent::new(e.offset, e.length.min(size - e.offset)))
        .collect()
}

/// Per-disk section of a change manifest.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ManifestDisk {
    pub backing_label: String,
    #[serde(default)]
    pub change_id: String,
    /// Changed extents keyed by the checkpoint they are relative to
    #[serde(default)]
    pub changes_since: HashMap<String, Vec<Extent>>,
}

/// Change-tracking state exported by the source platform as JSON.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChangeManifest {
    #[serde(default)]
    pub tracking_enabled: bool,
    #[serde(default)]
    pub disks: Vec<ManifestDisk>,
}

impl ChangeManifest {
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Ok(serde_json::from_str(&content)?)
    }

    fn disk(&self, label: &str) -> Option<&ManifestDisk> {
        self.disks.iter().find(|d| d.backing_label == label)
    }
}

impl ChangeSource for ChangeManifest {
    fn tracking_enabled(&self) -> Result<bool> {
        Ok(self.tracking_enabled)
    }

    fn current_change_id(&self, backing_label: &str) -> Result<Option<String>> {
        Ok(self.disk(backing_label).map(|d| d.change_id.clone()))
    }

    fn changed_areas(
        &self,
        backing_label: &str,
        since: &ChangeId,
        start_offset: u64,
    ) -> Result<Option<ChangedAreas>> {
        let Some(disk) = self.disk(backing_label) else {
            return Err(MigrationError::DiskNotFound {
                label: backing_label.to_string(),
            });
        };
        Ok(disk.changes_since.get(since.as_str()).map(|areas| ChangedAreas {
            start_offset,
            length: u64::MAX - start_offset,
            areas: areas
                .iter()
                .filter(|a| a.end() > start_offset)
                .copied()
                .collect(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    const LABEL: &str = "[ds1] vm/vm.vmdk";

    fn disk(prior: Option<&str>) -> SourceDisk {
        SourceDisk {
            key: "2000".into(),
            backing_label: LABEL.into(),
            size_bytes: 1 << 20,
            prior_change_id: prior.map(String::from),
        }
    }

    fn manifest(enabled: bool, current: &str, since: &[(&str, Vec<Extent>)]) -> ChangeManifest {
        ChangeManifest {
            tracking_enabled: enabled,
            disks: vec![ManifestDisk {
                backing_label: LABEL.into(),
                change_id: current.into(),
                changes_since: since
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.clone()))
                    .collect(),
            }],
        }
    }

    fn log() -> SessionLog {
        SessionLog::detached("change-tracker-test")
    }

    #[test]
    fn test_tracking_disabled_means_full() {
        let tracker = ChangeTracker::new(manifest(false, "e/5", &[]));
        let state = tracker.resolve(&disk(Some("e/3")), &log()).expect("resolve");
        assert!(!state.has_prior_state);
        assert!(state.copy_mode().is_full());
    }

    #[test]
    fn test_unknown_label_is_disk_not_found() {
        let tracker = ChangeTracker::new(manifest(true, "e/5", &[]));
        let mut other = disk(None);
        other.backing_label = "[ds1] other.vmdk".into();
        let err = tracker.resolve(&other, &log()).unwrap_err();
        assert!(matches!(err, MigrationError::DiskNotFound { .. }));
    }

    #[test]
    fn test_missing_or_malformed_prior_is_full() {
        let tracker = ChangeTracker::new(manifest(true, "e/5", &[]));
        for prior in [None, Some(""), Some("garbage"), Some("e/"), Some("e/x")] {
            let state = tracker.resolve(&disk(prior), &log()).expect("resolve");
            assert!(!state.has_prior_state, "prior {:?}", prior);
            assert_eq!(state.change_id, "e/5");
        }
    }

    #[test]
    fn test_same_change_id_is_noop() {
        let tracker = ChangeTracker::new(manifest(true, "e/5", &[]));
        let state = tracker.resolve(&disk(Some("e/5")), &log()).expect("resolve");
        assert!(state.has_prior_state);
        assert!(state.changed_extents.is_empty());
        assert!(state.copy_mode().is_noop());
    }

    #[test]
    fn test_changed_extents_are_surfaced() {
        let changes = vec![Extent::new(8192, 4096), Extent::new(0, 4096)];
        let tracker = ChangeTracker::new(manifest(true, "e/5", &[("e/3", changes)]));
        let state = tracker.resolve(&disk(Some("e/3")), &log()).expect("resolve");
        assert!(state.has_prior_state);
        assert_eq!(
            state.changed_extents,
            vec![Extent::new(0, 4096), Extent::new(8192, 4096)]
        );
    }

    #[test]
    fn test_reset_epoch_forces_full() {
        let tracker = ChangeTracker::new(manifest(true, "f/1", &[("e/3", vec![])]));
        let state = tracker.resolve(&disk(Some("e/3")), &log()).expect("resolve");
        assert!(!state.has_prior_state);
    }

    #[test]
    fn test_unrecognised_checkpoint_forces_full() {
        let tracker = ChangeTracker::new(manifest(true, "e/5", &[]));
        let state = tracker.resolve(&disk(Some("e/2")), &log()).expect("resolve");
        assert!(!state.has_prior_state);
    }

    #[test]
    fn test_extents_clamped_to_disk_size() {
        let changes = vec![Extent::new((1 << 20) - 512, 4096), Extent::new(2 << 20, 10)];
        let tracker = ChangeTracker::new(manifest(true, "e/5", &[("e/3", changes)]));
        let state = tracker.resolve(&disk(Some("e/3")), &log()).expect("resolve");
        assert_eq!(state.changed_extents, vec![Extent::new((1 << 20) - 512, 512)]);
    }

    /// Platform fake that answers in fixed-size pages
    struct PagedSource {
        page: u64,
        areas: Vec<Extent>,
        queries: Mutex<Vec<u64>>,
    }

    impl ChangeSource for PagedSource {
        fn tracking_enabled(&self) -> Result<bool> {
            Ok(true)
        }

        fn current_change_id(&self, _label: &str) -> Result<Option<String>> {
            Ok(Some("e/9".into()))
        }

        fn changed_areas(
            &self,
            _label: &str,
            _since: &ChangeId,
            start_offset: u64,
        ) -> Result<Option<ChangedAreas>> {
            if let Ok(mut q) = self.queries.lock() {
                q.push(start_offset);
            }
            let end = start_offset + self.page;
            Ok(Some(ChangedAreas {
                start_offset,
                length: self.page,
                areas: self
                    .areas
                    .iter()
                    .filter(|a| a.offset >= start_offset && a.offset < end)
                    .copied()
                    .collect(),
            }))
        }
    }

    #[test]
    fn test_paginates_until_disk_end() {
        let source = PagedSource {
            page: 256 * 1024,
            areas: vec![Extent::new(4096, 4096), Extent::new(600 * 1024, 4096)],
            queries: Mutex::new(Vec::new()),
        };
        let tracker = ChangeTracker::new(source);
        let state = tracker.resolve(&disk(Some("e/1")), &log()).expect("resolve");

        assert_eq!(
            state.changed_extents,
            vec![Extent::new(4096, 4096), Extent::new(600 * 1024, 4096)]
        );
        let queries = tracker.source().queries.lock().expect("lock").clone();
        assert_eq!(queries, vec![0, 256 * 1024, 512 * 1024, 768 * 1024]);
    }

    #[test]
    fn test_manifest_round_trips_through_json() {
        let json = r#"{
            "tracking_enabled": true,
            "disks": [{
                "backing_label": "[ds1] vm/vm.vmdk",
                "change_id": "e/5",
                "changes_since": {"e/3": [{"offset": 0, "length": 4096}]}
            }]
        }"#;
        let manifest: ChangeManifest = serde_json::from_str(json).expect("parse");
        let tracker = ChangeTracker::new(manifest);
        let state = tracker.resolve(&disk(Some("e/3")), &log()).expect("resolve");
        assert_eq!(state.changed_extents, vec![Extent::new(0, 4096)]);
    }
}
