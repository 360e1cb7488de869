pub mod command;
pub mod error;
pub mod events;
pub mod process;
pub mod version;

pub use command::EngineRequest;
pub use error::EngineError;
pub use events::{EngineEvent, ErrorEvent, StatusEvent, SummaryEvent};
pub use process::{cancel_flag, CancelFlag, EngineClient, EngineOutput, ResticEngine};
pub use version::{parse_version_output, EngineVersion, MIN_ENGINE_VERSION};
