//! Block-device exports of source disks.
//!
//! An export is an `nbdkit` process serving one source disk read-only over
//! NBD. Two backends exist (VDDK against the source platform, and a local
//! VMDK file) and both go through the same `ExportSupervisor` interface.
//!
//! An export listens either on a Unix socket private to its process (the
//! default) or on a TCP port. A socket path carries a fresh UUID, so a
//! connection to it can only ever reach the export that created it.
//!
//! At most one live export may exist per source disk. `ExportRegistry` holds
//! the set of disks with a live export; a handle owns its slot and releases
//! it when stopped or dropped.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::{Duration, Instant};
use strum::Display;

use crate::cancel::CancelToken;
use crate::config::{EngineConfig, ExportTransport};
use crate::error::{MigrationError, Result};
use crate::logging::{SessionLog, safe_vm_name};
use crate::supervisor::{ExternalCommand, RunningProcess, Supervisor};
use crate::types::SourceDisk;

fn default_libdir() -> PathBuf {
    PathBuf::from("/usr/lib/vmware-vix-disklib")
}

fn default_compression() -> String {
    "fastlz".to_string()
}

/// Connection parameters for the VDDK backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VddkSource {
    pub server: String,
    pub user: String,
    pub password: String,
    /// SHA1 fingerprint of the server certificate
    pub thumbprint: String,
    #[serde(default = "default_libdir")]
    pub libdir: PathBuf,
    /// Managed object reference of the VM, e.g. `vm-1234`
    pub vm_moref: String,
    /// Managed object reference of the migration snapshot
    pub snapshot_moref: String,
    #[serde(default = "default_compression")]
    pub compression: String,
}

/// Where an export reads its bytes from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(tag = "kind", rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ExportBackend {
    /// Live source platform through VDDK
    Vddk(VddkSource),
    /// Copied VMDK files below `local_disk_path`
    File {
        local_disk_path: PathBuf,
        #[serde(default = "default_libdir")]
        libdir: PathBuf,
    },
}

impl ExportBackend {
    pub fn validate(&self) -> Result<()> {
        match self {
            Self::Vddk(source) => {
                for (name, value) in [
                    ("server", &source.server),
                    ("user", &source.user),
                    ("thumbprint", &source.thumbprint),
                    ("vm_moref", &source.vm_moref),
                    ("snapshot_moref", &source.snapshot_moref),
                ] {
                    if value.trim().is_empty() {
                        return Err(MigrationError::config(format!(
                            "vddk export requires {}",
                            name
                        )));
                    }
                }
                Ok(())
            }
            Self::File {
                local_disk_path, ..
            } => {
                if local_disk_path.as_os_str().is_empty() {
                    return Err(MigrationError::config("file export requires local_disk_path"));
                }
                Ok(())
            }
        }
    }

    /// Plugin arguments for serving `disk`
    fn plugin_args(&self, disk: &SourceDisk) -> Vec<String> {
        match self {
            Self::Vddk(source) => vec![
                "vddk".to_string(),
                format!("server={}", source.server),
                format!("user={}", source.user),
                format!("password={}", source.password),
                format!("thumbprint={}", source.thumbprint),
                format!("libdir={}", source.libdir.display()),
                format!("vm=moref={}", source.vm_moref),
                format!("snapshot={}", source.snapshot_moref),
                format!("compression={}", source.compression),
                "transports=file:nbdssl:nbd".to_string(),
                format!("file={}", disk.backing_label),
            ],
            Self::File {
                local_disk_path,
                libdir,
            } => vec![
                "vddk".to_string(),
                format!("libdir={}", libdir.display()),
                format!("file={}", local_disk_path.join(disk.backing_path()).display()),
            ],
        }
    }
}

/// Disks that currently have a live export.
///
/// Keyed by `SourceDisk::export_identity`. Disk keys repeat across VMs
/// (every VM has a disk 2000), so two sessions on one host would otherwise
/// block each other.
#[derive(Debug, Default)]
pub struct ExportRegistry {
    live: Mutex<HashSet<String>>,
}

static GLOBAL_EXPORTS: OnceLock<Arc<ExportRegistry>> = OnceLock::new();

impl ExportRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Registry shared by every export on this host
    pub fn global() -> Arc<Self> {
        Arc::clone(GLOBAL_EXPORTS.get_or_init(Self::new))
    }

    /// Claim the export slot for `disk`, failing if it is taken.
    pub fn claim(self: &Arc<Self>, disk: &SourceDisk) -> Result<LiveSlot> {
        let mut live = self
            .live
            .lock()
            .map_err(|_| MigrationError::Transition("export registry poisoned".into()))?;
        let identity = disk.export_identity().to_string();
        if !live.insert(identity.clone()) {
            return Err(MigrationError::ExportAlreadyActive {
                disk_key: disk.key.clone(),
            });
        }
        Ok(LiveSlot {
            registry: Arc::clone(self),
            identity,
        })
    }

    pub fn is_live(&self, disk: &SourceDisk) -> bool {
        self.live
            .lock()
            .map(|l| l.contains(disk.export_identity()))
            .unwrap_or(false)
    }

    pub fn live_count(&self) -> usize {
        self.live.lock().map(|l| l.len()).unwrap_or(0)
    }
}

/// Ownership of one disk's export slot. Released on drop.
#[derive(Debug)]
pub struct LiveSlot {
    registry: Arc<ExportRegistry>,
    identity: String,
}

impl Drop for LiveSlot {
    fn drop(&mut self) {
        if let Ok(mut live) = self.registry.live.lock() {
            live.remove(&self.identity);
        }
    }
}

/// Where an export accepts NBD connections.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExportEndpoint {
    Tcp(SocketAddr),
    Unix(PathBuf),
}

impl ExportEndpoint {
    /// NBD URI clients connect to
    pub fn uri(&self) -> String {
        match self {
            Self::Tcp(address) => format!("nbd://{}", address),
            Self::Unix(path) => format!("nbd+unix:///?socket={}", path.display()),
        }
    }

    /// One connection attempt
    pub fn accepts(&self, connect_timeout: Duration) -> bool {
        match self {
            Self::Tcp(address) => TcpStream::connect_timeout(address, connect_timeout).is_ok(),
            // Local connects either succeed or fail at once
            Self::Unix(path) => path.exists() && UnixStream::connect(path).is_ok(),
        }
    }
}

impl fmt::Display for ExportEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp(address) => write!(f, "{}", address),
            Self::Unix(path) => write!(f, "{}", path.display()),
        }
    }
}

impl From<SocketAddr> for ExportEndpoint {
    fn from(address: SocketAddr) -> Self {
        Self::Tcp(address)
    }
}

impl From<PathBuf> for ExportEndpoint {
    fn from(path: PathBuf) -> Self {
        Self::Unix(path)
    }
}

/// Removes a socket file when dropped.
#[derive(Debug)]
struct SocketFile(PathBuf);

impl Drop for SocketFile {
    fn drop(&mut self) {
        match std::fs::remove_file(&self.0) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!("Failed to remove socket {}: {}", self.0.display(), e),
        }
    }
}

/// A live export. Owned by the pipeline that started it.
///
/// Dropping or terminating it kills the process first, then removes the
/// socket file (unix endpoints) and releases the registry slot.
pub struct ExportHandle {
    disk_key: String,
    endpoint: ExportEndpoint,
    process: RunningProcess,
    _socket: Option<SocketFile>,
    _slot: LiveSlot,
}

impl ExportHandle {
    pub fn new(
        disk_key: impl Into<String>,
        endpoint: impl Into<ExportEndpoint>,
        process: RunningProcess,
        slot: LiveSlot,
    ) -> Self {
        let endpoint = endpoint.into();
        let socket = match &endpoint {
            ExportEndpoint::Unix(path) => Some(SocketFile(path.clone())),
            ExportEndpoint::Tcp(_) => None,
        };
        Self {
            disk_key: disk_key.into(),
            endpoint,
            process,
            _socket: socket,
            _slot: slot,
        }
    }

    pub fn pid(&self) -> u32 {
        self.process.pid()
    }

    pub fn disk_key(&self) -> &str {
        &self.disk_key
    }

    pub fn endpoint(&self) -> &ExportEndpoint {
        &self.endpoint
    }

    /// NBD URI clients connect to
    pub fn uri(&self) -> String {
        self.endpoint.uri()
    }

    pub fn process_mut(&mut self) -> &mut RunningProcess {
        &mut self.process
    }

    /// Terminate the export process and release the slot.
    pub fn terminate(self) -> Result<()> {
        self.process.stop()?;
        Ok(())
    }
}

/// Starts, checks and stops exports.
///
/// `stop` must be called exactly once for every handle `start` returned.
pub trait ExportSupervisor: Send + Sync {
    fn start(&self, disk: &SourceDisk, log: &SessionLog) -> Result<ExportHandle>;

    /// Poll the export's endpoint until it accepts a connection.
    fn await_ready(
        &self,
        handle: &mut ExportHandle,
        timeout: Duration,
        log: &SessionLog,
        cancel: &CancelToken,
    ) -> Result<()>;

    fn stop(&self, handle: ExportHandle, log: &SessionLog) -> Result<()>;
}

/// Poll `handle` with connects until one succeeds, the process dies, or
/// `timeout` elapses.
pub fn wait_for_listener(
    handle: &mut ExportHandle,
    timeout: Duration,
    poll_interval: Duration,
    connect_timeout: Duration,
    log: &SessionLog,
    cancel: &CancelToken,
) -> Result<()> {
    let started = Instant::now();
    let endpoint = handle.endpoint().clone();
    loop {
        if let Some(status) = handle.process_mut().try_status()? {
            return Err(MigrationError::SubprocessFailed {
                program: handle.process_mut().label().to_string(),
                exit_code: status.code(),
                stderr_tail: handle.process_mut().stderr_tail(),
            });
        }

        if endpoint.accepts(connect_timeout) {
            log.info(format_args!(
                "Export for disk {} is ready on {} after {:?}",
                handle.disk_key(),
                endpoint,
                started.elapsed()
            ));
            return Ok(());
        }

        let elapsed = started.elapsed();
        if elapsed >= timeout {
            return Err(MigrationError::timeout(
                format!("export of disk {} on {}", handle.disk_key(), endpoint),
                timeout,
            ));
        }
        if cancel.sleep(poll_interval.min(timeout - elapsed)) {
            return Err(MigrationError::cancelled("export"));
        }
    }
}

/// Ask the kernel for a free port on `host`.
///
/// The port is released before the export binds it. The unix transport
/// has no such window.
pub fn allocate_listen_address(host: &str) -> Result<SocketAddr> {
    let candidate = (host, 0)
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| MigrationError::config(format!("cannot resolve listen host {}", host)))?;
    let listener = TcpListener::bind(candidate)?;
    Ok(listener.local_addr()?)
}

/// Longest path `sun_path` holds, terminator excluded
const MAX_SOCKET_PATH: usize = 107;

/// `<dir>/nbdkit-<safe vm name>-<uuid>.sock`
pub fn socket_path(dir: &Path, vm_name: &str) -> Result<PathBuf> {
    let mut name = safe_vm_name(vm_name);
    name.truncate(32);
    let path = dir.join(format!(
        "nbdkit-{}-{}.sock",
        name.trim_end_matches('_'),
        uuid::Uuid::new_v4()
    ));
    if path.as_os_str().len() > MAX_SOCKET_PATH {
        return Err(MigrationError::config(format!(
            "socket path {} is longer than {} bytes",
            path.display(),
            MAX_SOCKET_PATH
        )));
    }
    Ok(path)
}

/// `nbdkit`-based exports.
pub struct NbdkitExport {
    backend: ExportBackend,
    program: String,
    vm_name: String,
    transport: ExportTransport,
    socket_dir: PathBuf,
    listen_host: String,
    poll_interval: Duration,
    connect_timeout: Duration,
    supervisor: Supervisor,
    registry: Arc<ExportRegistry>,
}

impl NbdkitExport {
    pub fn new(backend: ExportBackend, config: &EngineConfig) -> Self {
        Self {
            backend,
            program: config.nbdkit_program.clone(),
            vm_name: "export".to_string(),
            transport: config.export_transport,
            socket_dir: config.socket_dir.clone(),
            listen_host: config.listen_host.clone(),
            poll_interval: config.ready_poll_interval(),
            connect_timeout: config.ready_connect_timeout(),
            supervisor: Supervisor::new(config.stop_grace(), config.stderr_tail_lines),
            registry: ExportRegistry::global(),
        }
    }

    /// Name socket files after `vm_name`
    pub fn for_vm(mut self, vm_name: impl Into<String>) -> Self {
        self.vm_name = vm_name.into();
        self
    }

    pub fn with_registry(mut self, registry: Arc<ExportRegistry>) -> Self {
        self.registry = registry;
        self
    }

    pub fn backend(&self) -> &ExportBackend {
        &self.backend
    }

    pub fn command(&self, disk: &SourceDisk, endpoint: &ExportEndpoint) -> ExternalCommand {
        let cmd = ExternalCommand::new(&self.program).args([
            "--readonly",
            "--exit-with-parent",
            "--foreground",
        ]);
        let cmd = match endpoint {
            ExportEndpoint::Unix(path) => cmd.arg("--unix").arg(path.to_string_lossy()),
            ExportEndpoint::Tcp(listen) => cmd
                .arg("--ipaddr")
                .arg(listen.ip().to_string())
                .arg("--port")
                .arg(listen.port().to_string()),
        };
        cmd.args(self.backend.plugin_args(disk))
    }

    fn endpoint(&self) -> Result<ExportEndpoint> {
        Ok(match self.transport {
            ExportTransport::Unix => ExportEndpoint::Unix(socket_path(&self.socket_dir, &self.vm_name)?),
            ExportTransport::Tcp => ExportEndpoint::Tcp(allocate_listen_address(&self.listen_host)?),
        })
    }
}

impl ExportSupervisor for NbdkitExport {
    fn start(&self, disk: &SourceDisk, log: &SessionLog) -> Result<ExportHandle> {
        let slot = self.registry.claim(disk)?;
        let endpoint = self.endpoint()?;
        log.info(format_args!(
            "Starting {} export of {} on {}",
            self.backend, disk.backing_label, endpoint
        ));
        let process = self.supervisor.spawn(&self.command(disk, &endpoint), log)?;
        Ok(ExportHandle::new(&disk.key, endpoint, process, slot))
    }

    fn await_ready(
        &self,
        handle: &mut ExportHandle,
        timeout: Duration,
        log: &SessionLog,
        cancel: &CancelToken,
    ) -> Result<()> {
        wait_for_listener(
            handle,
            timeout,
            self.poll_interval,
            self.connect_timeout,
            log,
            cancel,
        )
    }

    fn stop(&self, handle: ExportHandle, log: &SessionLog) -> Result<()> {
        let pid = handle.pid();
        let key = handle.disk_key().to_string();
        handle.terminate()?;
        log.info(format_args!("Stopped export of disk {} (PID {})", key, pid));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process_guard;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    fn disk(key: &str) -> SourceDisk {
        SourceDisk {
            key: key.into(),
            backing_label: format!("[ds1] vm/vm_{}.vmdk", key),
            size_bytes: 1 << 20,
            prior_change_id: None,
        }
    }

    fn file_backend() -> ExportBackend {
        ExportBackend::File {
            local_disk_path: PathBuf::from("/var/lib/migrate"),
            libdir: default_libdir(),
        }
    }

    /// Stand-in for nbdkit that starts but never listens
    fn silent_nbdkit(dir: &TempDir) -> String {
        let path = dir.path().join("nbdkit");
        std::fs::write(&path, "#!/bin/sh\nexec sleep 30\n").expect("write");
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).expect("chmod");
        path.to_string_lossy().into_owned()
    }

    fn fast_config(program: String) -> EngineConfig {
        EngineConfig {
            nbdkit_program: program,
            ready_poll_interval_ms: 20,
            ready_connect_timeout_ms: 50,
            stop_grace_ms: 500,
            ..EngineConfig::default()
        }
    }

    #[test]
    fn test_vddk_command_line() {
        let backend = ExportBackend::Vddk(VddkSource {
            server: "vcenter.local".into(),
            user: "admin".into(),
            password: "secret".into(),
            thumbprint: "AA:BB".into(),
            libdir: default_libdir(),
            vm_moref: "vm-42".into(),
            snapshot_moref: "snapshot-7".into(),
            compression: default_compression(),
        });
        let export = NbdkitExport::new(backend, &EngineConfig::default());
        let listen: SocketAddr = "127.0.0.1:10809".parse().expect("addr");
        let cmd = export.command(&disk("2000"), &listen.into());

        let args = cmd.arguments();
        assert_eq!(&args[..4], ["--readonly", "--exit-with-parent", "--foreground", "--ipaddr"]);
        assert!(args.contains(&"vm=moref=vm-42".to_string()));
        assert!(args.contains(&"snapshot=snapshot-7".to_string()));
        assert!(args.contains(&"transports=file:nbdssl:nbd".to_string()));
        assert_eq!(args.last().map(String::as_str), Some("file=[ds1] vm/vm_2000.vmdk"));
        assert!(!cmd.display().contains("secret"));
    }

    #[test]
    fn test_file_command_strips_datastore() {
        let export = NbdkitExport::new(file_backend(), &EngineConfig::default());
        let listen: SocketAddr = "127.0.0.1:10900".parse().expect("addr");
        let cmd = export.command(&disk("2001"), &listen.into());
        assert_eq!(
            cmd.arguments().last().map(String::as_str),
            Some("file=/var/lib/migrate/vm/vm_2001.vmdk")
        );
        assert!(cmd.arguments().contains(&"10900".to_string()));
    }

    #[test]
    fn test_unix_command_line() {
        let export = NbdkitExport::new(file_backend(), &EngineConfig::default());
        let socket = PathBuf::from("/tmp/nbdkit-web01-1.sock");
        let cmd = export.command(&disk("2000"), &socket.clone().into());

        let args = cmd.arguments();
        assert_eq!(&args[..5], ["--readonly", "--exit-with-parent", "--foreground", "--unix", "/tmp/nbdkit-web01-1.sock"]);
        assert!(!args.iter().any(|a| a == "--port"));
        assert_eq!(
            ExportEndpoint::Unix(socket).uri(),
            "nbd+unix:///?socket=/tmp/nbdkit-web01-1.sock"
        );
    }

    #[test]
    fn test_socket_path_is_unique_and_bounded() {
        let a = socket_path(Path::new("/tmp"), "Web Server 01").expect("path");
        let b = socket_path(Path::new("/tmp"), "Web Server 01").expect("path");
        assert_ne!(a, b);
        let name = a.file_name().and_then(|n| n.to_str()).unwrap_or_default();
        assert!(name.starts_with("nbdkit-Web_Server_01-"));
        assert!(name.ends_with(".sock"));

        let long = socket_path(Path::new("/tmp"), &"v".repeat(200)).expect("path");
        assert!(long.as_os_str().len() <= MAX_SOCKET_PATH);

        let deep = PathBuf::from(format!("/{}", "d".repeat(100)));
        assert!(matches!(
            socket_path(&deep, "vm"),
            Err(MigrationError::Config(_))
        ));
    }

    #[test]
    fn test_backend_json_shape() {
        let backend: ExportBackend =
            serde_json::from_str(r#"{"kind": "file", "local_disk_path": "/data"}"#).expect("parse");
        assert_eq!(backend.to_string(), "file");
        assert!(backend.validate().is_ok());

        let missing: ExportBackend = serde_json::from_str(
            r#"{"kind": "vddk", "server": "", "user": "u", "password": "p", "thumbprint": "t",
                "vm_moref": "vm-1", "snapshot_moref": "s-1"}"#,
        )
        .expect("parse");
        assert!(missing.validate().is_err());
    }

    #[test]
    fn test_registry_rejects_second_claim() {
        let registry = ExportRegistry::new();
        let d = disk("2000");
        let slot = registry.claim(&d).expect("first claim");
        assert!(registry.is_live(&d));

        let err = registry.claim(&d).unwrap_err();
        assert!(matches!(err, MigrationError::ExportAlreadyActive { .. }));

        drop(slot);
        assert!(!registry.is_live(&d));
        assert!(registry.claim(&d).is_ok());
    }

    #[test]
    fn test_same_key_on_different_vms_does_not_conflict() {
        let registry = ExportRegistry::new();
        let first = disk("2000");
        let other_vm = SourceDisk {
            backing_label: "[ds1] db/db.vmdk".into(),
            ..disk("2000")
        };

        let _a = registry.claim(&first).expect("first vm");
        let _b = registry.claim(&other_vm).expect("second vm");
        assert_eq!(registry.live_count(), 2);
        assert!(registry.claim(&first).is_err());
    }

    #[test]
    fn test_second_start_rejected_while_live() {
        let dir = TempDir::new().expect("tempdir");
        let registry = ExportRegistry::new();
        let export = NbdkitExport::new(file_backend(), &fast_config(silent_nbdkit(&dir)))
            .with_registry(Arc::clone(&registry));
        let log = SessionLog::detached("export-test");
        let d = disk("2000");

        let handle = export.start(&d, &log).expect("start");
        let err = export.start(&d, &log).err().expect("second start rejected");
        assert!(matches!(err, MigrationError::ExportAlreadyActive { .. }));

        export.stop(handle, &log).expect("stop");
        assert_eq!(registry.live_count(), 0);
        let again = export.start(&d, &log).expect("restart after stop");
        export.stop(again, &log).expect("stop");
    }

    #[test]
    fn test_await_ready_times_out_and_stop_leaves_no_orphan() {
        let dir = TempDir::new().expect("tempdir");
        let export = NbdkitExport::new(file_backend(), &fast_config(silent_nbdkit(&dir)))
            .with_registry(ExportRegistry::new());
        let log = SessionLog::detached("export-test");

        let mut handle = export.start(&disk("2002"), &log).expect("start");
        let pid = handle.pid();
        let err = export
            .await_ready(&mut handle, Duration::from_millis(200), &log, &CancelToken::new())
            .unwrap_err();
        assert!(matches!(err, MigrationError::Timeout { .. }));
        assert!(err.is_retryable());

        export.stop(handle, &log).expect("stop");
        assert!(!process_guard::is_process_alive(pid));
    }

    #[test]
    fn test_await_ready_detects_listener() {
        let registry = ExportRegistry::new();
        let d = disk("2003");
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let address = listener.local_addr().expect("addr");
        let log = SessionLog::detached("export-test");
        let process = Supervisor::default()
            .spawn(&ExternalCommand::new("sleep").arg("30"), &log)
            .expect("spawn");
        let mut handle = ExportHandle::new(&d.key, address, process, registry.claim(&d).expect("claim"));

        wait_for_listener(
            &mut handle,
            Duration::from_secs(5),
            Duration::from_millis(20),
            Duration::from_millis(200),
            &log,
            &CancelToken::new(),
        )
        .expect("ready");
        assert_eq!(handle.uri(), format!("nbd://{}", address));
        handle.terminate().expect("terminate");
        assert_eq!(registry.live_count(), 0);
    }

    #[test]
    fn test_unix_endpoint_ready_and_socket_removed() {
        let dir = TempDir::new().expect("tempdir");
        let registry = ExportRegistry::new();
        let d = disk("2005");
        let socket = socket_path(dir.path(), "vm").expect("path");
        let log = SessionLog::detached("export-test");
        let process = Supervisor::default()
            .spawn(&ExternalCommand::new("sleep").arg("30"), &log)
            .expect("spawn");
        let mut handle = ExportHandle::new(&d.key, socket.clone(), process, registry.claim(&d).expect("claim"));

        // Nothing listens yet: a missing socket is not ready
        let err = wait_for_listener(
            &mut handle,
            Duration::from_millis(100),
            Duration::from_millis(20),
            Duration::from_millis(50),
            &log,
            &CancelToken::new(),
        )
        .unwrap_err();
        assert!(matches!(err, MigrationError::Timeout { .. }));

        let _listener = std::os::unix::net::UnixListener::bind(&socket).expect("bind");
        wait_for_listener(
            &mut handle,
            Duration::from_secs(5),
            Duration::from_millis(20),
            Duration::from_millis(50),
            &log,
            &CancelToken::new(),
        )
        .expect("ready");
        assert!(handle.uri().starts_with("nbd+unix:///?socket="));

        handle.terminate().expect("terminate");
        assert!(!socket.exists());
        assert_eq!(registry.live_count(), 0);
    }

    #[test]
    fn test_await_ready_fails_fast_when_export_exits() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("nbdkit");
        std::fs::write(&path, "#!/bin/sh\necho 'bind: Address in use' >&2\nexit 1\n").expect("write");
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).expect("chmod");

        let export = NbdkitExport::new(
            file_backend(),
            &fast_config(path.to_string_lossy().into_owned()),
        )
        .with_registry(ExportRegistry::new());
        let log = SessionLog::detached("export-test");
        let mut handle = export.start(&disk("2004"), &log).expect("start");

        let started = Instant::now();
        let err = export
            .await_ready(&mut handle, Duration::from_secs(10), &log, &CancelToken::new())
            .unwrap_err();
        assert!(matches!(err, MigrationError::SubprocessFailed { exit_code: Some(1), .. }));
        assert!(started.elapsed() < Duration::from_secs(5));
        export.stop(handle, &log).expect("stop");
    }
}
