//! Conversion stage: `virt-v2v-in-place` against a copied boot disk.
//!
//! Conversion rewrites guest configuration only (drivers, boot loader,
//! first-boot hooks), so re-running it after an interruption is safe. The
//! orchestrator guarantees every disk of the VM is fully copied first.

use std::path::{Path, PathBuf};

use crate::cancel::CancelToken;
use crate::config::EngineConfig;
use crate::error::{MigrationError, Result};
use crate::logging::SessionLog;
use crate::supervisor::{ExternalCommand, ProcessOutcome, Supervisor};

/// Uniform outcome shared with the copy stage
pub type ConversionResult = ProcessOutcome;

/// Conversion of one target device in place.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConversionJob {
    pub target_device: PathBuf,
    /// Script run inside the guest image during conversion
    pub run_script: Option<PathBuf>,
    /// Script installed to run at the guest's first boot
    pub firstboot_script: Option<PathBuf>,
    /// Passed through to the converter before `-i disk`
    pub extra_opts: Vec<String>,
    /// Enable libguestfs debug and trace output
    pub debug: bool,
}

impl ConversionJob {
    pub fn new(target_device: impl Into<PathBuf>) -> Self {
        Self {
            target_device: target_device.into(),
            ..Self::default()
        }
    }
}

pub struct ConversionSupervisor {
    program: String,
    supervisor: Supervisor,
}

impl ConversionSupervisor {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            program: config.v2v_program.clone(),
            supervisor: Supervisor::new(config.stop_grace(), config.stderr_tail_lines),
        }
    }

    pub fn command(&self, job: &ConversionJob) -> ExternalCommand {
        let mut cmd = ExternalCommand::new(&self.program)
            .arg("--no-selinux-relabel")
            .env("LIBGUESTFS_BACKEND", "direct");
        if let Some(script) = &job.run_script {
            cmd = cmd.arg("--run").arg(script.to_string_lossy());
        }
        if let Some(script) = &job.firstboot_script {
            cmd = cmd.arg("--firstboot").arg(script.to_string_lossy());
        }
        if job.debug {
            cmd = cmd
                .env("LIBGUESTFS_DEBUG", "1")
                .env("LIBGUESTFS_TRACE", "1");
        }
        cmd.args(job.extra_opts.iter().cloned())
            .arg("-i")
            .arg("disk")
            .arg(job.target_device.to_string_lossy())
    }

    /// Check the converter and the job's scripts exist before launching.
    pub fn preflight(&self, job: &ConversionJob) -> Result<PathBuf> {
        for (what, script) in [
            ("run script", &job.run_script),
            ("firstboot script", &job.firstboot_script),
        ] {
            if let Some(script) = script
                && !script.is_file()
            {
                return Err(MigrationError::config(format!(
                    "{} {} not found",
                    what,
                    script.display()
                )));
            }
        }
        locate_program(&self.program).ok_or_else(|| {
            MigrationError::config(format!("{} not found on the file system", self.program))
        })
    }

    pub fn run(
        &self,
        job: &ConversionJob,
        log: &SessionLog,
        cancel: &CancelToken,
    ) -> Result<ConversionResult> {
        let program = self.preflight(job)?;
        log.info(format_args!(
            "Converting {} in place with {}",
            job.target_device.display(),
            program.display()
        ));
        self.supervisor.run(&self.command(job), log, cancel)
    }
}

/// Absolute or relative paths are taken as is; bare names are looked up in `PATH`.
fn locate_program(program: &str) -> Option<PathBuf> {
    let candidate = Path::new(program);
    if candidate.components().count() > 1 {
        return candidate.is_file().then(|| candidate.to_path_buf());
    }
    let path = std::env::var_os("PATH")?;
    std::env::split_paths(&path)
        .map(|dir| dir.join(program))
        .find(|p| p.is_file())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logging::MemorySink;
    use std::os::unix::fs::PermissionsExt;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn fake_v2v(dir: &TempDir, body: &str) -> String {
        let path = dir.path().join("virt-v2v-in-place");
        std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).expect("write");
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).expect("chmod");
        path.to_string_lossy().into_owned()
    }

    fn supervisor(program: String) -> ConversionSupervisor {
        ConversionSupervisor::new(&EngineConfig {
            v2v_program: program,
            stop_grace_ms: 500,
            ..EngineConfig::default()
        })
    }

    #[test]
    fn test_command_shape() {
        let job = ConversionJob {
            target_device: PathBuf::from("/dev/vdb"),
            run_script: Some(PathBuf::from("/opt/run.sh")),
            firstboot_script: Some(PathBuf::from("/opt/net.sh")),
            extra_opts: vec!["--root".into(), "first".into()],
            debug: true,
        };
        let cmd = supervisor("virt-v2v-in-place".into()).command(&job);
        assert_eq!(
            cmd.arguments(),
            [
                "--no-selinux-relabel",
                "--run",
                "/opt/run.sh",
                "--firstboot",
                "/opt/net.sh",
                "--root",
                "first",
                "-i",
                "disk",
                "/dev/vdb",
            ]
        );
        let env = cmd.env_vars();
        assert!(env.contains(&("LIBGUESTFS_BACKEND".into(), "direct".into())));
        assert!(env.contains(&("LIBGUESTFS_DEBUG".into(), "1".into())));
    }

    #[test]
    fn test_no_debug_env_by_default() {
        let cmd = supervisor("virt-v2v-in-place".into()).command(&ConversionJob::new("/dev/vdc"));
        assert_eq!(cmd.env_vars().len(), 1);
        assert_eq!(cmd.arguments().last().map(String::as_str), Some("/dev/vdc"));
    }

    #[test]
    fn test_missing_script_rejected_before_launch() {
        let dir = TempDir::new().expect("tempdir");
        let marker = dir.path().join("ran");
        let program = fake_v2v(&dir, &format!("touch {}", marker.display()));
        let job = ConversionJob {
            firstboot_script: Some(dir.path().join("missing.sh")),
            ..ConversionJob::new("/dev/vdb")
        };

        let err = supervisor(program)
            .run(&job, &SessionLog::detached("v2v-test"), &CancelToken::new())
            .unwrap_err();
        assert!(matches!(err, MigrationError::Config(_)));
        assert!(!marker.exists());
    }

    #[test]
    fn test_missing_program_rejected() {
        let err = supervisor("/nonexistent/virt-v2v-in-place".into())
            .preflight(&ConversionJob::new("/dev/vdb"))
            .unwrap_err();
        assert!(err.to_string().contains("not found"));
    }

    #[test]
    fn test_bare_name_found_on_path() {
        assert!(locate_program("sh").is_some());
        assert!(locate_program("definitely-not-a-real-program-name").is_none());
    }

    #[test]
    fn test_run_receives_device_and_env() {
        let dir = TempDir::new().expect("tempdir");
        let program = fake_v2v(&dir, "echo \"backend=$LIBGUESTFS_BACKEND last=$(eval echo \\${$#})\"");
        let sink = Arc::new(MemorySink::new());
        let log = SessionLog::new("v2v-test", sink.clone());

        let outcome = supervisor(program)
            .run(&ConversionJob::new("/dev/vdq"), &log, &CancelToken::new())
            .expect("run");
        assert!(outcome.is_success());
        assert!(sink.contains("backend=direct last=/dev/vdq"));
    }

    #[test]
    fn test_failure_maps_to_subprocess_failed() {
        let dir = TempDir::new().expect("tempdir");
        let program = fake_v2v(&dir, "echo 'virt-v2v: error: inspection failed' >&2; exit 1");
        let outcome = supervisor(program)
            .run(&ConversionJob::new("/dev/vdb"), &SessionLog::detached("v2v"), &CancelToken::new())
            .expect("run");
        let err = outcome.into_result("virt-v2v-in-place", "conversion").unwrap_err();
        assert!(err.to_string().contains("inspection failed"));
    }
}
