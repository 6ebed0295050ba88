pub mod aggregator;
pub mod backoff;
pub mod codec;
pub mod config;
pub mod diagnostics;
pub mod error;
pub mod metrics;
pub mod protocol;
pub mod remote;
pub mod state;

pub use aggregator::{Decision, RecognitionAggregator, WindowConfig, WindowOutcome};
pub use backoff::Backoff;
pub use codec::FrameCodec;
pub use config::ControllerConfig;
pub use diagnostics::{DiagnosticsSnapshot, SharedDiagnostics};
pub use error::{CommandError, ConfigError, FrameError, LinkError, ProtocolError};
pub use metrics::MetricsRecorder;
pub use protocol::{BoundingBox, Command, FeatureId, RecognitionEvent, SensorMessage, UserId};
pub use remote::{LogType, OutboundEvent, RemoteCommand, Report};
pub use state::{ControllerState, DoorState, HealthCell, LinkHealth};
