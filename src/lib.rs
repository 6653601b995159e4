pub mod commit;
pub mod config;
pub mod control_loop;
pub mod datalog;
pub mod error;
pub mod instrument;
pub mod run_state;
pub mod settings;
pub mod shutdown;
pub mod telemetry;
pub mod transport;
pub mod types;

pub use commit::CommitOrchestrator;
pub use config::{load_config, AppConfig, PumpConfig, PumpDirection};
pub use control_loop::{ControlLoop, Controller, Event};
pub use datalog::DataLogger;
pub use error::{ControlError, ErrorKind};
pub use instrument::{
    BootFailure, ChannelHandle, Command, DeviceRole, InstrumentChannel, Instruments, Query,
};
pub use run_state::RunStateMachine;
pub use settings::SettingsStore;
pub use shutdown::{ShutdownReport, ShutdownSequencer};
pub use telemetry::{Field, TelemetryPoller, TelemetryView};
pub use types::{
    CandidateEdit, CommitResult, Outcome, Quantity, QuantitySetting, RunState, SkipReason,
    TelemetrySample, ValidRange,
};
