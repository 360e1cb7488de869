pub mod bus;
pub mod error;
pub mod store;

pub use bus::{StatusBus, StatusSink};
pub use error::EventsError;
pub use store::JsonlStatusStore;
