//! Migration orchestration
//!
//! Drives each VM's disks through change resolution, export, copy and
//! conversion. Sessions are independent of each other; the only thing they
//! share is the host's transfer slots, which bound how many export+copy
//! pipelines run at once.
//!
//! Within a session every disk runs its own pipeline thread. A disk failure
//! never stops its siblings, but the session only converts once every disk
//! has been copied. Exports are always stopped by the thread that started
//! them, on every exit path.

use std::path::PathBuf;
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use backoff::backoff::Backoff;

use crate::cancel::CancelToken;
use crate::change_tracker::{ChangeManifest, ChangeSource, ChangeTracker};
use crate::config::{EngineConfig, retry_schedule};
use crate::conversion::{ConversionJob, ConversionSupervisor};
use crate::copy::{CopyEngine, CopyJob};
use crate::device::DeviceResolver;
use crate::error::{MigrationError, Result};
use crate::export::{ExportHandle, ExportSupervisor, NbdkitExport};
use crate::logging::SessionLog;
use crate::request::{DiskOutcome, MigrationRequest, ModuleResponse};
use crate::session_state::{Stage, StageMachine};
use crate::types::{CopyMode, SourceDisk};

/// Host-wide limit on concurrent export+copy pipelines.
#[derive(Debug)]
pub struct HostSlots {
    limit: usize,
    state: Mutex<SlotState>,
    freed: Condvar,
}

#[derive(Debug, Default)]
struct SlotState {
    in_use: usize,
    peak: usize,
}

impl HostSlots {
    pub fn new(limit: usize) -> Arc<Self> {
        Arc::new(Self {
            limit: limit.max(1),
            state: Mutex::new(SlotState::default()),
            freed: Condvar::new(),
        })
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Most slots ever held at once
    pub fn peak(&self) -> usize {
        self.state.lock().map(|s| s.peak).unwrap_or(0)
    }

    /// Block until a slot is free or `cancel` fires.
    pub fn acquire(self: &Arc<Self>, cancel: &CancelToken) -> Result<SlotGuard> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| MigrationError::Transition("host slots poisoned".into()))?;
        while state.in_use >= self.limit {
            if cancel.is_cancelled() {
                return Err(MigrationError::cancelled("waiting for a transfer slot"));
            }
            state = self
                .freed
                .wait_timeout(state, Duration::from_millis(50))
                .map_err(|_| MigrationError::Transition("host slots poisoned".into()))?
                .0;
        }
        state.in_use += 1;
        state.peak = state.peak.max(state.in_use);
        Ok(SlotGuard {
            slots: Arc::clone(self),
        })
    }
}

/// A held transfer slot. Released on drop.
#[derive(Debug)]
pub struct SlotGuard {
    slots: Arc<HostSlots>,
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        if let Ok(mut state) = self.slots.state.lock() {
            state.in_use = state.in_use.saturating_sub(1);
        }
        self.slots.freed.notify_one();
    }
}

/// A source disk paired with its target volume.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiskPlan {
    pub source: SourceDisk,
    pub volume_id: String,
}

/// One VM's migration: its disks plus the collaborators that serve them.
pub struct MigrationSession {
    pub vm_name: String,
    pub disks: Vec<DiskPlan>,
    pub boot_disk_key: String,
    /// Conversion settings; `None` skips conversion
    pub conversion: Option<ConversionJob>,
    pub assume_zero: bool,
    pub change_source: Box<dyn ChangeSource>,
    pub exporter: Arc<dyn ExportSupervisor>,
}

impl MigrationSession {
    /// Session with conversion enabled and the first disk as boot disk.
    pub fn new(
        vm_name: impl Into<String>,
        disks: Vec<DiskPlan>,
        change_source: Box<dyn ChangeSource>,
        exporter: Arc<dyn ExportSupervisor>,
    ) -> Self {
        let boot_disk_key = disks
            .first()
            .map(|d| d.source.key.clone())
            .unwrap_or_default();
        Self {
            vm_name: vm_name.into(),
            disks,
            boot_disk_key,
            conversion: Some(ConversionJob::default()),
            assume_zero: false,
            change_source,
            exporter,
        }
    }

    pub fn from_request(request: &MigrationRequest) -> Result<Self> {
        let change_source: Box<dyn ChangeSource> = match &request.change_manifest {
            Some(path) => Box::new(ChangeManifest::load_from_file(path)?),
            None => Box::new(ChangeManifest::default()),
        };
        let exporter = Arc::new(
            NbdkitExport::new(request.export.clone(), &request.engine).for_vm(&request.vm_name),
        );
        let disks = request
            .disks
            .iter()
            .map(|d| DiskPlan {
                source: d.source.clone(),
                volume_id: d.volume_id.clone(),
            })
            .collect();

        let mut session = Self::new(&request.vm_name, disks, change_source, exporter);
        if let Some(boot) = request.boot_disk_key() {
            session.boot_disk_key = boot.to_string();
        }
        session.conversion = request.conversion_template();
        session.assume_zero = request.assume_zero;
        Ok(session)
    }

    pub fn with_conversion(mut self, conversion: Option<ConversionJob>) -> Self {
        self.conversion = conversion;
        self
    }

    pub fn with_boot_disk(mut self, key: impl Into<String>) -> Self {
        self.boot_disk_key = key.into();
        self
    }

    pub fn assume_zero(mut self, assume_zero: bool) -> Self {
        self.assume_zero = assume_zero;
        self
    }
}

/// Final state of one disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiskReport {
    pub key: String,
    pub volume_id: String,
    pub stage: Stage,
    pub device: Option<PathBuf>,
    pub copy_mode: Option<CopyMode>,
    pub change_id: String,
    pub bytes: u64,
    pub primary: bool,
    pub error: Option<String>,
}

/// Final state of one session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionReport {
    pub vm_name: String,
    pub stage: Stage,
    pub message: String,
    pub disks: Vec<DiskReport>,
    pub history: Vec<(Stage, u64)>,
}

impl SessionReport {
    pub fn is_success(&self) -> bool {
        self.stage == Stage::Completed
    }

    pub fn bytes_copied(&self) -> u64 {
        self.disks.iter().map(|d| d.bytes).sum()
    }

    pub fn into_response(self, log_file: Option<String>) -> ModuleResponse {
        let success = self.is_success();
        let mut disks: Vec<&DiskReport> = self.disks.iter().collect();
        disks.sort_by_key(|d| !d.primary);
        let id = if success {
            disks.iter().map(|d| d.volume_id.clone()).collect()
        } else {
            Vec::new()
        };
        let outcomes = self
            .disks
            .iter()
            .map(|d| DiskOutcome {
                id: d.volume_id.clone(),
                key: d.key.clone(),
                device: d.device.as_ref().map(|p| p.to_string_lossy().into_owned()),
                primary: d.primary,
                status: d.stage.to_string(),
                copy_mode: d.copy_mode.as_ref().map(|m| m.as_str().to_string()),
                change_id: d.change_id.clone(),
                bytes: d.bytes,
                error: d.error.clone(),
            })
            .collect();
        ModuleResponse {
            changed: success,
            failed: !success,
            msg: self.message,
            id,
            disks: outcomes,
            log_file,
        }
    }
}

/// Per-disk working state while a session runs.
struct DiskRun {
    plan: DiskPlan,
    machine: StageMachine,
    mode: Option<CopyMode>,
    change_id: String,
    device: Option<PathBuf>,
    bytes: u64,
    error: Option<String>,
}

impl DiskRun {
    fn new(plan: DiskPlan) -> Self {
        Self {
            plan,
            machine: StageMachine::for_disk(),
            mode: None,
            change_id: String::new(),
            device: None,
            bytes: 0,
            error: None,
        }
    }

    /// Move to Failed or Cancelled depending on `err`
    fn abort(&mut self, err: &MigrationError, log: &SessionLog) {
        let reason = err.to_string();
        let result = if err.is_cancelled() {
            log.warn(format_args!("Disk pipeline cancelled: {}", reason));
            self.machine.cancel(&reason)
        } else {
            log.error(format_args!("Disk pipeline failed: {}", reason));
            self.machine.fail(&reason)
        };
        if result.is_ok() {
            self.error = Some(reason);
        }
    }

    fn report(&self, boot_disk_key: &str) -> DiskReport {
        DiskReport {
            key: self.plan.source.key.clone(),
            volume_id: self.plan.volume_id.clone(),
            stage: self.machine.current(),
            device: self.device.clone(),
            copy_mode: self.mode.clone(),
            change_id: self.change_id.clone(),
            bytes: self.bytes,
            primary: self.plan.source.key == boot_disk_key,
            error: self.error.clone(),
        }
    }
}

/// State the disk threads of one session share.
struct SessionShared {
    machine: Mutex<StageMachine>,
    first_failure: Mutex<Option<String>>,
}

impl SessionShared {
    fn note_copying(&self) {
        if let Ok(mut machine) = self.machine.lock()
            && machine.current() == Stage::Exporting
        {
            let _ = machine.transition_to(Stage::Copying);
        }
    }

    fn note_failure(&self, reason: &str) {
        if let Ok(mut first) = self.first_failure.lock()
            && first.is_none()
        {
            *first = Some(reason.to_string());
        }
    }
}

/// Runs migration sessions against the shared host resources.
pub struct Orchestrator {
    config: EngineConfig,
    copy: CopyEngine,
    conversion: ConversionSupervisor,
    resolver: DeviceResolver,
    slots: Arc<HostSlots>,
}

impl Orchestrator {
    pub fn new(config: EngineConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            copy: CopyEngine::new(&config)?,
            conversion: ConversionSupervisor::new(&config),
            resolver: DeviceResolver::from_config(&config),
            slots: HostSlots::new(config.max_parallel_transfers),
            config,
        })
    }

    pub fn slots(&self) -> &Arc<HostSlots> {
        &self.slots
    }

    /// Run several sessions concurrently. Reports come back in input order.
    pub fn run_sessions(
        &self,
        sessions: Vec<(MigrationSession, SessionLog)>,
        cancel: &CancelToken,
    ) -> Vec<SessionReport> {
        std::thread::scope(|scope| {
            let handles: Vec<_> = sessions
                .iter()
                .map(|(session, log)| {
                    let cancel = cancel.child();
                    scope.spawn(move || self.run_session(session, log, &cancel))
                })
                .collect();
            handles
                .into_iter()
                .zip(&sessions)
                .map(|(handle, (session, _))| {
                    handle.join().unwrap_or_else(|_| SessionReport {
                        vm_name: session.vm_name.clone(),
                        stage: Stage::Failed,
                        message: format!("Migration of {} panicked", session.vm_name),
                        disks: Vec::new(),
                        history: Vec::new(),
                    })
                })
                .collect()
        })
    }

    /// Drive one session to a terminal stage.
    pub fn run_session(
        &self,
        session: &MigrationSession,
        log: &SessionLog,
        cancel: &CancelToken,
    ) -> SessionReport {
        let cancel = cancel.child();
        log.info(format_args!(
            "Migrating {} ({} disk(s), boot disk {})",
            session.vm_name,
            session.disks.len(),
            session.boot_disk_key
        ));

        if session.disks.is_empty() {
            let mut machine = StageMachine::for_session(session.conversion.is_some());
            let _ = machine.fail("Session has no disks");
            let message = self.summary(session, &[], &machine);
            log.error(&message);
            return SessionReport {
                vm_name: session.vm_name.clone(),
                stage: machine.current(),
                message,
                disks: Vec::new(),
                history: machine.history().to_vec(),
            };
        }

        let mut disks: Vec<DiskRun> = session.disks.iter().cloned().map(DiskRun::new).collect();
        let shared = SessionShared {
            machine: Mutex::new(StageMachine::for_session(session.conversion.is_some())),
            first_failure: Mutex::new(None),
        };

        self.resolve_changes(session, &mut disks, &shared, log, &cancel);
        self.transition(&shared, Stage::ChangeResolved);

        if disks.iter().any(|d| !d.machine.is_terminal()) && !cancel.is_cancelled() {
            self.transition(&shared, Stage::Exporting);
            std::thread::scope(|scope| {
                for disk in disks.iter_mut().filter(|d| !d.machine.is_terminal()) {
                    let log = log.for_disk(&disk.plan.source.key);
                    let exporter = session.exporter.as_ref();
                    let shared = &shared;
                    let cancel = cancel.child();
                    let assume_zero = session.assume_zero;
                    scope.spawn(move || {
                        self.run_disk(disk, exporter, assume_zero, shared, &log, &cancel)
                    });
                }
            });
        }

        let mut machine = match shared.machine.into_inner() {
            Ok(machine) => machine,
            Err(poisoned) => poisoned.into_inner(),
        };
        let first_failure = shared.first_failure.into_inner().ok().flatten();
        self.finish(session, &disks, &mut machine, first_failure, log, &cancel);

        let message = self.summary(session, &disks, &machine);
        if machine.current() == Stage::Completed {
            log.info(&message);
        } else {
            log.error(&message);
        }
        SessionReport {
            vm_name: session.vm_name.clone(),
            stage: machine.current(),
            message,
            disks: disks
                .iter()
                .map(|d| d.report(&session.boot_disk_key))
                .collect(),
            history: machine.history().to_vec(),
        }
    }

    fn transition(&self, shared: &SessionShared, stage: Stage) {
        if let Ok(mut machine) = shared.machine.lock() {
            let _ = machine.transition_to(stage);
        }
    }

    fn resolve_changes(
        &self,
        session: &MigrationSession,
        disks: &mut [DiskRun],
        shared: &SessionShared,
        log: &SessionLog,
        cancel: &CancelToken,
    ) {
        let tracker = ChangeTracker::new(session.change_source.as_ref());
        for disk in disks.iter_mut() {
            let disk_log = log.for_disk(&disk.plan.source.key);
            if cancel.is_cancelled() {
                disk.abort(&MigrationError::cancelled("change resolution"), &disk_log);
                continue;
            }
            match tracker.resolve(&disk.plan.source, &disk_log) {
                Ok(state) => {
                    let mode = state.copy_mode();
                    disk_log.info(format_args!("Copy mode: {}", mode));
                    disk.change_id = state.change_id;
                    disk.mode = Some(mode);
                    let _ = disk.machine.advance();
                }
                Err(e) => {
                    disk.abort(&e, &disk_log);
                    shared.note_failure(&format!("Disk {}: {}", disk.plan.source.key, e));
                }
            }
        }
    }

    fn run_disk(
        &self,
        disk: &mut DiskRun,
        exporter: &dyn ExportSupervisor,
        assume_zero: bool,
        shared: &SessionShared,
        log: &SessionLog,
        cancel: &CancelToken,
    ) {
        if let Err(e) = self.export_and_copy(disk, exporter, assume_zero, shared, log, cancel) {
            disk.abort(&e, log);
            if !e.is_cancelled() {
                shared.note_failure(&format!("Disk {}: {}", disk.plan.source.key, e));
            }
        }
    }

    fn export_and_copy(
        &self,
        disk: &mut DiskRun,
        exporter: &dyn ExportSupervisor,
        assume_zero: bool,
        shared: &SessionShared,
        log: &SessionLog,
        cancel: &CancelToken,
    ) -> Result<()> {
        let mode = disk
            .mode
            .clone()
            .ok_or_else(|| MigrationError::Transition("copy mode not resolved".into()))?;

        let device = self
            .resolver
            .resolve_with_retry(&disk.plan.volume_id, log, cancel)?;
        disk.device = Some(device.clone());
        disk.machine.transition_to(Stage::Exporting)?;

        if mode.is_noop() {
            log.info("Nothing changed since the last sync, no export needed");
            disk.machine.transition_to(Stage::Copying)?;
            shared.note_copying();
            disk.machine.transition_to(Stage::Completed)?;
            return Ok(());
        }

        let _slot = self.slots.acquire(cancel)?;
        if cancel.is_cancelled() {
            return Err(MigrationError::cancelled("export"));
        }
        let mut handle = exporter.start(&disk.plan.source, log)?;
        let result = self.copy_through(
            disk,
            &mut handle,
            exporter,
            &device,
            mode,
            assume_zero,
            shared,
            log,
            cancel,
        );
        let stopped = exporter.stop(handle, log);

        result?;
        stopped?;
        disk.machine.transition_to(Stage::Completed)?;
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn copy_through(
        &self,
        disk: &mut DiskRun,
        handle: &mut ExportHandle,
        exporter: &dyn ExportSupervisor,
        device: &std::path::Path,
        mode: CopyMode,
        assume_zero: bool,
        shared: &SessionShared,
        log: &SessionLog,
        cancel: &CancelToken,
    ) -> Result<()> {
        self.await_export(handle, exporter, log, cancel)?;

        disk.machine.transition_to(Stage::Copying)?;
        shared.note_copying();
        let job = CopyJob {
            export_address: handle.uri(),
            target_device: device.to_path_buf(),
            mode,
            assume_zero,
            disk_size: disk.plan.source.size_bytes,
        };
        disk.bytes = self.copy.run_checked(&job, log, cancel)?;
        Ok(())
    }

    /// Liveness wait with a bounded number of retries on timeout
    fn await_export(
        &self,
        handle: &mut ExportHandle,
        exporter: &dyn ExportSupervisor,
        log: &SessionLog,
        cancel: &CancelToken,
    ) -> Result<()> {
        let attempts = self.config.ready_retries + 1;
        let mut schedule = retry_schedule(
            self.config.ready_poll_interval(),
            self.config.ready_timeout(),
        );
        for attempt in 1..=attempts {
            match exporter.await_ready(handle, self.config.ready_timeout(), log, cancel) {
                Ok(()) => return Ok(()),
                Err(e) if e.is_retryable() && attempt < attempts => {
                    let delay = schedule
                        .next_backoff()
                        .unwrap_or_else(|| self.config.ready_poll_interval());
                    log.warn(format_args!(
                        "{} (attempt {}/{}), waiting again in {:?}",
                        e, attempt, attempts, delay
                    ));
                    if cancel.sleep(delay) {
                        return Err(MigrationError::cancelled("export"));
                    }
                }
                Err(e) => return Err(e),
            }
        }
        Err(MigrationError::timeout(
            format!("export of disk {}", handle.disk_key()),
            self.config.ready_timeout(),
        ))
    }

    /// Conversion and the session's terminal transition
    fn finish(
        &self,
        session: &MigrationSession,
        disks: &[DiskRun],
        machine: &mut StageMachine,
        first_failure: Option<String>,
        log: &SessionLog,
        cancel: &CancelToken,
    ) {
        let all_copied = disks.iter().all(|d| d.machine.current() == Stage::Completed);
        if !all_copied {
            if cancel.is_cancelled() || disks.iter().any(|d| d.machine.current() == Stage::Cancelled) {
                let _ = machine.cancel("Migration cancelled");
            } else {
                let reason = first_failure.unwrap_or_else(|| "A disk failed to copy".to_string());
                let _ = machine.fail(reason);
            }
            return;
        }

        // A session whose disks were all no-ops never saw a copy start
        if machine.current() == Stage::Exporting {
            let _ = machine.transition_to(Stage::Copying);
        }

        let Some(template) = &session.conversion else {
            log.info("Conversion skipped for this run");
            let _ = machine.advance();
            return;
        };

        if cancel.is_cancelled() {
            let _ = machine.cancel("Migration cancelled before conversion");
            return;
        }

        let Some(device) = disks
            .iter()
            .find(|d| d.plan.source.key == session.boot_disk_key)
            .and_then(|d| d.device.clone())
        else {
            let _ = machine.fail(format!(
                "Boot disk {} has no target device",
                session.boot_disk_key
            ));
            return;
        };

        let _ = machine.transition_to(Stage::Converting);
        let job = ConversionJob {
            target_device: device,
            ..template.clone()
        };
        let result = self
            .conversion
            .run(&job, log, cancel)
            .and_then(|outcome| outcome.into_result("virt-v2v-in-place", "conversion"));
        match result {
            Ok(()) => {
                let _ = machine.advance();
            }
            Err(e) if e.is_cancelled() => {
                let _ = machine.cancel(e.to_string());
            }
            Err(e) => {
                let _ = machine.fail(format!("Conversion failed: {}", e));
            }
        }
    }

    fn summary(&self, session: &MigrationSession, disks: &[DiskRun], machine: &StageMachine) -> String {
        match machine.current() {
            Stage::Completed => {
                let bytes: u64 = disks.iter().map(|d| d.bytes).sum();
                format!(
                    "Migration of {} completed: {} disk(s), {} bytes copied",
                    session.vm_name,
                    disks.len(),
                    bytes
                )
            }
            _ => format!(
                "Migration of {} {}: {}",
                session.vm_name,
                machine.current().to_string().to_lowercase(),
                machine.reason().unwrap_or("unknown cause")
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn test_slots_bound_concurrency() {
        let slots = HostSlots::new(2);
        let cancel = CancelToken::new();
        std::thread::scope(|scope| {
            for _ in 0..6 {
                let slots = Arc::clone(&slots);
                let cancel = cancel.clone();
                scope.spawn(move || {
                    let _guard = slots.acquire(&cancel).expect("slot");
                    std::thread::sleep(Duration::from_millis(30));
                });
            }
        });
        assert_eq!(slots.peak(), 2);
    }

    #[test]
    fn test_slot_wait_honours_cancel() {
        let slots = HostSlots::new(1);
        let cancel = CancelToken::new();
        let _held = slots.acquire(&cancel).expect("first");

        let waiter = cancel.child();
        let remote = waiter.clone();
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(80));
            remote.cancel();
        });
        let started = Instant::now();
        let err = slots.acquire(&waiter).unwrap_err();
        assert!(err.is_cancelled());
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_response_lists_boot_volume_first() {
        let disk = |key: &str, volume: &str, primary: bool| DiskReport {
            key: key.into(),
            volume_id: volume.into(),
            stage: Stage::Completed,
            device: Some(PathBuf::from(format!("/dev/{}", volume))),
            copy_mode: Some(CopyMode::Full),
            change_id: String::new(),
            bytes: 10,
            primary,
            error: None,
        };
        let report = SessionReport {
            vm_name: "vm".into(),
            stage: Stage::Completed,
            message: "done".into(),
            disks: vec![disk("2000", "vdb", false), disk("2001", "vdc", true)],
            history: Vec::new(),
        };
        assert_eq!(report.bytes_copied(), 20);
        let response = report.into_response(None);
        assert_eq!(response.id, vec!["vdc", "vdb"]);
        assert!(response.changed);
        assert_eq!(response.exit_code(), 0);
        assert_eq!(response.disks[0].status, "Completed");
        assert_eq!(response.disks[0].copy_mode.as_deref(), Some("full"));
    }
}
