pub mod config;
pub mod error;
pub mod link;
pub mod discovery;
pub mod gateway;
pub mod detector;
pub mod classifier;
pub mod telemetry;
pub mod orchestrator;

#[cfg(test)]
pub(crate) mod testutil;

pub use config::SortbinConfig;
pub use error::{Result, SortbinError};
pub use classifier::{Classification, Classifier, HttpClassifier};
pub use detector::{FrameSource, StubFrameSource, TriggerDetector};
pub use discovery::{ControllerDirectory, PortMap, PortScanner, SystemPortScanner};
pub use gateway::{CommandGateway, Compartment, SensorReading};
pub use link::{Command, CommandResponse, ControllerLink, ControllerRole};
pub use orchestrator::{CycleOutcome, Orchestrator, SessionState};
pub use telemetry::{FileTelemetrySink, TelemetryRecord, TelemetrySink};

#[cfg(feature = "camera-v4l2")]
pub use detector::V4l2Source;
