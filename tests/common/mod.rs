//! Shared fixtures for the integration tests: an in-process NBD server,
//! a stand-in export supervisor, fake external tools and a device namespace.

#![allow(dead_code)]

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tempfile::TempDir;

use diskmigrate::export::{ExportRegistry, ExportSupervisor, wait_for_listener};
use diskmigrate::{
    CancelToken, EngineConfig, ExportHandle, ExternalCommand, Result, SessionLog, SourceDisk,
    Supervisor,
};

const NBDMAGIC: u64 = 0x4e42_444d_4147_4943;
const IHAVEOPT: u64 = 0x4948_4156_454f_5054;
const SIMPLE_REPLY_MAGIC: u32 = 0x6744_6698;

/// Deterministic, never-zero disk content
pub fn image(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8 + 1).collect()
}

/// Serve `image` read-only to any number of clients until the test exits.
/// Connections that hang up mid-handshake (liveness checks) are ignored.
pub fn serve_image(image: Arc<Vec<u8>>) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    let address = listener.local_addr().expect("addr");
    std::thread::spawn(move || {
        for stream in listener.incoming() {
            let Ok(stream) = stream else {
                return;
            };
            let image = Arc::clone(&image);
            std::thread::spawn(move || {
                let _ = serve_client(stream, &image);
            });
        }
    });
    address
}

fn serve_client(mut s: TcpStream, image: &[u8]) -> std::io::Result<()> {
    s.write_all(&NBDMAGIC.to_be_bytes())?;
    s.write_all(&IHAVEOPT.to_be_bytes())?;
    // fixed newstyle, no zeroes
    s.write_all(&3u16.to_be_bytes())?;

    let mut client_flags = [0u8; 4];
    s.read_exact(&mut client_flags)?;
    let mut option = [0u8; 16];
    s.read_exact(&mut option)?;
    let name_len = u32::from_be_bytes([option[12], option[13], option[14], option[15]]) as usize;
    let mut name = vec![0u8; name_len];
    s.read_exact(&mut name)?;
    s.write_all(&(image.len() as u64).to_be_bytes())?;
    s.write_all(&1u16.to_be_bytes())?;

    loop {
        let mut req = [0u8; 28];
        s.read_exact(&mut req)?;
        if u16::from_be_bytes([req[6], req[7]]) == 2 {
            return Ok(());
        }
        let mut offset = [0u8; 8];
        offset.copy_from_slice(&req[16..24]);
        let offset = u64::from_be_bytes(offset) as usize;
        let length = u32::from_be_bytes([req[24], req[25], req[26], req[27]]) as usize;
        s.write_all(&SIMPLE_REPLY_MAGIC.to_be_bytes())?;
        s.write_all(&0u32.to_be_bytes())?;
        s.write_all(&req[8..16])?;
        s.write_all(&image[offset..offset + length])?;
    }
}

/// Export supervisor that serves an in-memory image and keeps a `sleep`
/// process as the export's lifetime, so the handle goes through the same
/// supervised start and stop path as a real exporter.
pub struct FakeExport {
    image: Arc<Vec<u8>>,
    registry: Arc<ExportRegistry>,
    supervisor: Supervisor,
    /// Never opens the listener when set
    pub silent: bool,
    pub starts: AtomicUsize,
    pub stops: AtomicUsize,
}

impl FakeExport {
    pub fn new(image: Vec<u8>) -> Arc<Self> {
        Self::build(image, false)
    }

    pub fn silent() -> Arc<Self> {
        Self::build(Vec::new(), true)
    }

    fn build(image: Vec<u8>, silent: bool) -> Arc<Self> {
        Arc::new(Self {
            image: Arc::new(image),
            registry: ExportRegistry::new(),
            supervisor: Supervisor::new(Duration::from_millis(500), 20),
            silent,
            starts: AtomicUsize::new(0),
            stops: AtomicUsize::new(0),
        })
    }

    pub fn registry(&self) -> &Arc<ExportRegistry> {
        &self.registry
    }

    pub fn starts(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    pub fn stops(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }
}

impl ExportSupervisor for FakeExport {
    fn start(&self, disk: &SourceDisk, log: &SessionLog) -> Result<ExportHandle> {
        let slot = self.registry.claim(disk)?;
        let address = if self.silent {
            diskmigrate::export::allocate_listen_address("127.0.0.1")?
        } else {
            serve_image(Arc::clone(&self.image))
        };
        let process = self.supervisor.spawn(
            &ExternalCommand::new("sleep")
                .arg("30")
                .with_label("fake-export"),
            log,
        )?;
        self.starts.fetch_add(1, Ordering::SeqCst);
        Ok(ExportHandle::new(&disk.key, address, process, slot))
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
            Duration::from_millis(20),
            Duration::from_millis(200),
            log,
            cancel,
        )
    }

    fn stop(&self, handle: ExportHandle, _log: &SessionLog) -> Result<()> {
        self.stops.fetch_add(1, Ordering::SeqCst);
        handle.terminate()
    }
}

/// Write an executable shell script
pub fn script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).expect("write script");
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).expect("chmod");
    path
}

/// Lines a recording script appended to `name` in `dir`
pub fn calls(dir: &Path, name: &str) -> Vec<String> {
    std::fs::read_to_string(dir.join(name))
        .map(|s| s.lines().map(String::from).collect())
        .unwrap_or_default()
}

/// A scratch host: device namespace, target "devices" and fake tools.
pub struct Host {
    pub dir: TempDir,
}

impl Host {
    pub fn new() -> Self {
        let dir = TempDir::new().expect("tempdir");
        std::fs::create_dir(dir.path().join("by-id")).expect("namespace");
        std::fs::create_dir(dir.path().join("dev")).expect("dev");
        Self { dir }
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn namespace(&self) -> PathBuf {
        self.path().join("by-id")
    }

    /// Attach a zero-filled target volume and return its device path
    pub fn attach(&self, volume_id: &str, size: u64) -> PathBuf {
        let device = self.path().join("dev").join(&volume_id[..8]);
        let file = std::fs::File::create(&device).expect("device");
        file.set_len(size).expect("size");
        std::os::unix::fs::symlink(
            &device,
            self.namespace().join(format!("virtio-{}", &volume_id[..20])),
        )
        .expect("symlink");
        std::fs::canonicalize(device).expect("canonical")
    }

    /// nbdcopy stand-in that records its arguments and then runs `body`
    pub fn nbdcopy(&self, body: &str) -> PathBuf {
        let record = self.path().join("nbdcopy.calls");
        script(
            self.path(),
            "nbdcopy",
            &format!("echo \"$@\" >> {}\n{}", record.display(), body),
        )
    }

    /// virt-v2v-in-place stand-in that records its arguments and backend
    pub fn v2v(&self, body: &str) -> PathBuf {
        let record = self.path().join("v2v.calls");
        script(
            self.path(),
            "virt-v2v-in-place",
            &format!(
                "echo \"$LIBGUESTFS_BACKEND $@\" >> {}\n{}",
                record.display(),
                body
            ),
        )
    }

    /// Engine tuned for tests: short waits, fake tools, real extent-copy helper
    pub fn config(&self, nbdcopy: &Path, v2v: &Path) -> EngineConfig {
        EngineConfig {
            max_parallel_transfers: 2,
            ready_timeout_secs: 5,
            ready_poll_interval_ms: 20,
            ready_connect_timeout_ms: 200,
            ready_retries: 0,
            device_resolve_attempts: 3,
            device_resolve_backoff_ms: 10,
            device_namespace: self.namespace(),
            nbdcopy_program: nbdcopy.to_string_lossy().into_owned(),
            v2v_program: v2v.to_string_lossy().into_owned(),
            extent_copy_program: Some(env!("CARGO_BIN_EXE_diskmigrate").to_string()),
            log_dir: self.path().to_path_buf(),
            stop_grace_ms: 500,
            ..EngineConfig::default()
        }
    }
}

pub fn source_disk(key: &str, size: u64, prior: Option<&str>) -> SourceDisk {
    SourceDisk {
        key: key.into(),
        backing_label: format!("[ds1] vm/vm_{}.vmdk", key),
        size_bytes: size,
        prior_change_id: prior.map(String::from),
    }
}
