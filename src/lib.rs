//! diskmigrate library
//!
//! The data path of a VM disk migration: resolve what changed, export the
//! source disk over NBD, copy it into the target volume, and convert the
//! guest in place. Several VMs can be migrated at once on one conversion host.

pub mod cancel;
pub mod change_tracker;
pub mod cli;
pub mod config;
pub mod conversion;
pub mod copy;
pub mod device;
pub mod error;
pub mod export;
pub mod logging;
pub mod nbd;
pub mod orchestrator;
pub mod process_guard;
pub mod request;
pub mod session_state;
pub mod supervisor;
pub mod types;

// Re-export main types for convenience
pub use cancel::CancelToken;
pub use change_tracker::{ChangeManifest, ChangeSource, ChangeTracker, ChangedAreas};
pub use config::{EngineConfig, ExportTransport};
pub use conversion::{ConversionJob, ConversionResult, ConversionSupervisor};
pub use copy::{CopyEngine, CopyJob, CopyResult};
pub use device::DeviceResolver;
pub use error::{MigrationError, Result};
pub use export::{
    ExportBackend, ExportEndpoint, ExportHandle, ExportRegistry, ExportSupervisor, NbdkitExport,
};
pub use logging::{MemorySink, SessionLog};
pub use orchestrator::{
    DiskPlan, DiskReport, HostSlots, MigrationSession, Orchestrator, SessionReport,
};
pub use process_guard::{ChildRegistry, CommandProcessGroup};
pub use request::{MigrationRequest, ModuleResponse};
pub use session_state::{Stage, StageMachine};
pub use supervisor::{ExternalCommand, ProcessOutcome, RunningProcess, Supervisor};
pub use types::{ChangeId, ChangeState, CopyMode, Extent, SourceDisk};
