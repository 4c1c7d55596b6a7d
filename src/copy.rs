//! Copy stage: move bytes from an export into the target device.
//!
//! Full copies are streamed by `nbdcopy`. Incremental copies run this
//! binary's own `extent-copy` helper, which receives the changed extents on
//! stdin, reads only those and writes them in place. Either way the transfer is a supervised child
//! process: its output lands in the session log and cancellation kills it.

use std::path::PathBuf;

use crate::cancel::CancelToken;
use crate::config::EngineConfig;
use crate::error::Result;
use crate::logging::SessionLog;
use crate::supervisor::{ExternalCommand, ProcessOutcome, Supervisor};
use crate::types::{CopyMode, render_extent_list};

/// One transfer into one target device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CopyJob {
    /// NBD URI of the export
    pub export_address: String,
    pub target_device: PathBuf,
    pub mode: CopyMode,
    /// Target is known to be zero-filled (fresh volume)
    pub assume_zero: bool,
    /// Size of the source disk, reported for full copies
    pub disk_size: u64,
}

impl CopyJob {
    /// Bytes this job moves when it succeeds
    pub fn planned_bytes(&self) -> u64 {
        self.mode.planned_bytes().unwrap_or(self.disk_size)
    }
}

/// Outcome of a copy plus the bytes it accounts for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CopyResult {
    pub outcome: ProcessOutcome,
    /// Zero unless the outcome is `Succeeded`
    pub bytes: u64,
}

impl CopyResult {
    pub fn is_success(&self) -> bool {
        self.outcome.is_success()
    }
}

pub struct CopyEngine {
    nbdcopy_program: String,
    extent_copy_program: String,
    supervisor: Supervisor,
}

impl CopyEngine {
    pub fn new(config: &EngineConfig) -> Result<Self> {
        Ok(Self {
            nbdcopy_program: config.nbdcopy_program.clone(),
            extent_copy_program: config.extent_copy_program()?,
            supervisor: Supervisor::new(config.stop_grace(), config.stderr_tail_lines),
        })
    }

    /// Command for `job`; `None` when there is nothing to transfer.
    pub fn command(&self, job: &CopyJob) -> Option<ExternalCommand> {
        let target = job.target_device.to_string_lossy().into_owned();
        match &job.mode {
            CopyMode::Full => {
                let mut cmd = ExternalCommand::new(&self.nbdcopy_program)
                    .arg(&job.export_address)
                    .arg(target);
                if job.assume_zero {
                    cmd = cmd.arg("--destination-is-zero");
                }
                Some(cmd.arg("--progress"))
            }
            CopyMode::Incremental(extents) if extents.is_empty() => None,
            CopyMode::Incremental(extents) => {
                // The list can be far larger than the argument vector allows
                let cmd = ExternalCommand::new(&self.extent_copy_program)
                    .with_label("extent-copy")
                    .arg("extent-copy")
                    .arg("--source")
                    .arg(&job.export_address)
                    .arg("--target")
                    .arg(target)
                    .arg("--extent-list")
                    .arg("-")
                    .with_stdin(render_extent_list(extents));
                Some(cmd)
            }
        }
    }

    /// Run `job` to completion, failure or cancellation.
    ///
    /// `Err` means the transfer could not be launched at all.
    pub fn run(&self, job: &CopyJob, log: &SessionLog, cancel: &CancelToken) -> Result<CopyResult> {
        let Some(cmd) = self.command(job) else {
            log.info("No changed extents since the last sync, nothing to copy");
            return Ok(CopyResult {
                outcome: ProcessOutcome::Succeeded,
                bytes: 0,
            });
        };

        log.info(format_args!(
            "Copying {} into {} ({} mode, {} bytes planned)",
            job.export_address,
            job.target_device.display(),
            job.mode,
            job.planned_bytes()
        ));
        let outcome = self.supervisor.run(&cmd, log, cancel)?;
        let bytes = if outcome.is_success() {
            job.planned_bytes()
        } else {
            0
        };
        Ok(CopyResult { outcome, bytes })
    }

    /// `run`, folded into the error taxonomy.
    pub fn run_checked(&self, job: &CopyJob, log: &SessionLog, cancel: &CancelToken) -> Result<u64> {
        let program = match &job.mode {
            CopyMode::Full => self.nbdcopy_program.clone(),
            CopyMode::Incremental(_) => "extent-copy".to_string(),
        };
        let result = self.run(job, log, cancel)?;
        result.outcome.into_result(&program, "copy")?;
        Ok(result.bytes)
    }
}
