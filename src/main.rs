//! diskmigrate - main entry point
//!
//! stdout carries exactly one record per command (the JSON response for
//! `migrate`/`validate`, a device path for `resolve-device`, progress for
//! `extent-copy`); all logging goes to stderr and the per-VM log file.

use std::path::Path;

use anyhow::Context;
use tracing::{debug, error, info, warn};

use diskmigrate::cli::{Cli, Commands};
use diskmigrate::logging::{self, SessionLog};
use diskmigrate::{
    CancelToken, DeviceResolver, Extent, MigrationRequest, MigrationSession, ModuleResponse,
    Orchestrator, nbd, process_guard,
};
use diskmigrate::types::read_extent_list;

fn main() {
    let cli = Cli::parse_args();
    logging::init_tracing(cli.verbose);
    debug!("CLI arguments parsed");

    // Cancelled by the first SIGINT/SIGTERM/SIGHUP
    let root = CancelToken::new();
    if let Err(e) = process_guard::init_signal_handlers(root.clone()) {
        warn!("Failed to initialize signal handlers: {}", e);
    }

    let code = match cli.command {
        Commands::Migrate { request } => {
            let response = run_migrate(&request, &root);
            println!("{}", response.to_json());
            response.exit_code()
        }
        Commands::Validate { request } => {
            let response = match validate(&request) {
                Ok(request) => ModuleResponse::unchanged(format!(
                    "Request for {} is valid ({} disk(s))",
                    request.vm_name,
                    request.disks.len()
                )),
                Err(e) => {
                    error!("Request validation failed: {:#}", e);
                    ModuleResponse::failure(format!("{:#}", e))
                }
            };
            println!("{}", response.to_json());
            response.exit_code()
        }
        Commands::ResolveDevice {
            volume_id,
            namespace,
            wait,
        } => resolve_device(&volume_id, &namespace, wait, &root),
        Commands::ExtentCopy {
            source,
            target,
            extents,
            extent_list,
        } => extent_copy(&source, &target, extents, extent_list.as_deref(), &root),
    };

    std::process::exit(code);
}

fn validate(path: &Path) -> anyhow::Result<MigrationRequest> {
    let request = MigrationRequest::load_from_file(path)?;
    request.validate()?;
    Ok(request)
}

/// Run one migration request and build the response record.
fn run_migrate(path: &Path, root: &CancelToken) -> ModuleResponse {
    let request = match validate(path) {
        Ok(request) => request,
        Err(e) => {
            error!("Invalid request {:?}: {:#}", path, e);
            return ModuleResponse::failure(format!("{:#}", e));
        }
    };

    let (log, log_file) = match logging::session_log_file(&request.engine.log_dir, &request.vm_name) {
        Ok((appender, path)) => {
            info!("Session log: {}", path.display());
            (
                SessionLog::new(&request.vm_name, appender),
                Some(path.to_string_lossy().into_owned()),
            )
        }
        Err(e) => {
            warn!(
                "Cannot open a log file in {:?}: {}, logging to stderr only",
                request.engine.log_dir, e
            );
            (SessionLog::detached(&request.vm_name), None)
        }
    };

    let prepared = Orchestrator::new(request.engine.clone())
        .and_then(|o| Ok((o, MigrationSession::from_request(&request)?)))
        .with_context(|| format!("Failed to prepare migration of {}", request.vm_name));
    let (orchestrator, session) = match prepared {
        Ok(prepared) => prepared,
        Err(e) => {
            log.error(format_args!("{:#}", e));
            return ModuleResponse {
                log_file,
                ..ModuleResponse::failure(format!("{:#}", e))
            };
        }
    };

    let report = orchestrator.run_session(&session, &log, root);
    report.into_response(log_file)
}

/// The incremental copy helper. Extents come from `--extent` flags and the
/// optional list file (stdin when the path is `-`).
fn extent_copy(
    source: &str,
    target: &Path,
    mut extents: Vec<Extent>,
    extent_list: Option<&Path>,
    root: &CancelToken,
) -> i32 {
    if let Some(path) = extent_list {
        let listed = if path == Path::new("-") {
            read_extent_list(std::io::stdin().lock())
        } else {
            std::fs::File::open(path)
                .map_err(|e| format!("{}: {}", path.display(), e))
                .and_then(|file| read_extent_list(std::io::BufReader::new(file)))
        };
        match listed {
            Ok(listed) => extents.extend(listed),
            Err(e) => {
                error!("Invalid extent list: {}", e);
                return 1;
            }
        }
    }

    match nbd::extent_copy(source, target, &extents, root) {
        Ok(bytes) => {
            info!("Copied {} bytes in {} extent(s)", bytes, extents.len());
            0
        }
        Err(e) => {
            error!("Extent copy failed: {}", e);
            1
        }
    }
}

fn resolve_device(volume_id: &str, namespace: &Path, wait: bool, root: &CancelToken) -> i32 {
    let resolver = DeviceResolver::new(namespace);
    let result = if wait {
        resolver
            .resolve_with_retry(volume_id, &SessionLog::detached(volume_id), root)
            .map(Some)
    } else {
        resolver.resolve(volume_id)
    };
    match result {
        Ok(device) => {
            // An empty line means "not attached yet"
            println!(
                "{}",
                device.map(|d| d.display().to_string()).unwrap_or_default()
            );
            0
        }
        Err(e) => {
            error!("{}", e);
            1
        }
    }
}
