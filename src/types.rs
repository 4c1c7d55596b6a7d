//! Core data model for the disk data path.
//!
//! These types are shared by every component and carry no behaviour beyond
//! validation and small derived facts (byte counts, mode selection).

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// One virtual disk on the source VM. Read-only to the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceDisk {
    /// Stable device key assigned by the source platform
    pub key: String,
    /// Backing file label, e.g. `[datastore1] vm/vm.vmdk`
    pub backing_label: String,
    /// Capacity in bytes
    pub size_bytes: u64,
    /// Change ID recorded at the last successful synchronisation, if any
    #[serde(default)]
    pub prior_change_id: Option<String>,
}

impl SourceDisk {
    /// Host-wide identity of the disk for export bookkeeping.
    ///
    /// The backing label names the disk file on its datastore, which no two
    /// VMs share; the key is only unique within one VM.
    pub fn export_identity(&self) -> &str {
        &self.backing_label
    }

    /// Backing path with the `[datastore]` prefix removed.
    pub fn backing_path(&self) -> &str {
        match self.backing_label.split_once(' ') {
            Some((prefix, rest)) if prefix.starts_with('[') => rest.trim(),
            _ => self.backing_label.trim(),
        }
    }
}

/// Opaque change-tracking checkpoint of the form `<uuid>/<sequence>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ChangeId {
    raw: String,
    sequence: u64,
}

impl ChangeId {
    /// Monotonic sequence component
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Identifier part; changes whenever tracking is reset on the source
    pub fn epoch(&self) -> &str {
        self.raw
            .rsplit_once('/')
            .map(|(epoch, _)| epoch.trim())
            .unwrap_or_default()
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }
}

impl FromStr for ChangeId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let (uuid, seq) = trimmed
            .rsplit_once('/')
            .ok_or_else(|| format!("change ID '{}' has no sequence", s))?;
        if uuid.trim().is_empty() {
            return Err(format!("change ID '{}' has an empty identifier", s));
        }
        let sequence = seq
            .parse::<u64>()
            .map_err(|_| format!("change ID '{}' has a non-numeric sequence", s))?;
        Ok(Self {
            raw: trimmed.to_string(),
            sequence,
        })
    }
}

impl TryFrom<String> for ChangeId {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ChangeId> for String {
    fn from(id: ChangeId) -> Self {
        id.raw
    }
}

impl fmt::Display for ChangeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

/// A contiguous byte range within a disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Extent {
    pub offset: u64,
    pub length: u64,
}

impl Extent {
    pub const fn new(offset: u64, length: u64) -> Self {
        Self { offset, length }
    }

    /// One past the last byte
    pub fn end(&self) -> u64 {
        self.offset.saturating_add(self.length)
    }
}

impl fmt::Display for Extent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.offset, self.length)
    }
}

impl FromStr for Extent {
    type Err = String;

    /// Parses the `offset:length` form used on the extent-copy command line
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (offset, length) = s
            .split_once(':')
            .ok_or_else(|| format!("extent '{}' must be offset:length", s))?;
        let offset = offset
            .trim()
            .parse()
            .map_err(|_| format!("extent '{}' has an invalid offset", s))?;
        let length = length
            .trim()
            .parse()
            .map_err(|_| format!("extent '{}' has an invalid length", s))?;
        Ok(Self { offset, length })
    }
}

/// Extent list in the line-oriented form the extent-copy helper reads from
/// stdin: one `offset:length` per line.
pub fn render_extent_list(extents: &[Extent]) -> Vec<u8> {
    let mut out = String::with_capacity(extents.len() * 16);
    for extent in extents {
        out.push_str(&extent.to_string());
        out.push('\n');
    }
    out.into_bytes()
}

/// Parse an extent list written by `render_extent_list`. Blank lines are
/// ignored.
pub fn read_extent_list(reader: impl std::io::BufRead) -> Result<Vec<Extent>, String> {
    let mut extents = Vec::new();
    for (index, line) in reader.lines().enumerate() {
        let line = line.map_err(|e| format!("reading extent list: {}", e))?;
        if line.trim().is_empty() {
            continue;
        }
        let extent = line
            .parse()
            .map_err(|e| format!("line {}: {}", index + 1, e))?;
        extents.push(extent);
    }
    Ok(extents)
}

/// Sort extents, drop empty ones and merge ranges that overlap or touch.
pub fn normalize_extents(mut extents: Vec<Extent>) -> Vec<Extent> {
    extents.retain(|e| e.length > 0);
    extents.sort();

    let mut merged: Vec<Extent> = Vec::with_capacity(extents.len());
    for extent in extents {
        match merged.last_mut() {
            Some(last) if extent.offset <= last.end() => {
                let end = last.end().max(extent.end());
                last.length = end - last.offset;
            }
            _ => merged.push(extent),
        }
    }
    merged
}

/// Result of asking the change tracker about a disk.
///
/// `has_prior_state = true` with no extents is the no-op migration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeState {
    pub has_prior_state: bool,
    /// Current change ID, empty when tracking is disabled
    pub change_id: String,
    pub changed_extents: Vec<Extent>,
}

impl ChangeState {
    /// No usable checkpoint: the whole disk must move.
    pub fn without_prior(change_id: impl Into<String>) -> Self {
        Self {
            has_prior_state: false,
            change_id: change_id.into(),
            changed_extents: Vec::new(),
        }
    }

    /// Decide the transfer mode once; the result flows immutably downstream.
    pub fn copy_mode(&self) -> CopyMode {
        if self.has_prior_state {
            CopyMode::Incremental(self.changed_extents.clone())
        } else {
            CopyMode::Full
        }
    }
}

/// How much of the disk a copy job transfers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CopyMode {
    /// Stream the entire export
    Full,
    /// Only these extents. An empty list transfers nothing.
    Incremental(Vec<Extent>),
}

impl CopyMode {
    pub fn is_full(&self) -> bool {
        matches!(self, Self::Full)
    }

    /// True when nothing needs to move
    pub fn is_noop(&self) -> bool {
        matches!(self, Self::Incremental(extents) if extents.is_empty())
    }

    /// Bytes this mode transfers; `None` for full copies (size is the export's)
    pub fn planned_bytes(&self) -> Option<u64> {
        match self {
            Self::Full => None,
            Self::Incremental(extents) => Some(extents.iter().map(|e| e.length).sum()),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Full => "full",
            Self::Incremental(_) => "incremental",
        }
    }
}

impl fmt::Display for CopyMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Full => write!(f, "full"),
            Self::Incremental(extents) => write!(f, "incremental({} extents)", extents.len()),
        }
    }
}
