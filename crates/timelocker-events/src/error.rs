use thiserror::Error;

#[derive(Debug, Error)]
pub enum EventsError {
    #[error("io error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("status record error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("sink error: {0}")]
    Sink(String),
}
