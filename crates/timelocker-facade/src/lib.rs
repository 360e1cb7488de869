pub mod error;
pub mod service;

pub use error::FacadeError;
pub use service::{IntegrationService, SystemStatus};
