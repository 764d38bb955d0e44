use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("failed to map row: {0}")]
    Mapping(String),
}

/// Failures raised by the AI and outbound adapters.
#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("missing configuration: {0}")]
    Config(String),
    #[error("{service} request failed: {message}")]
    Request {
        service: &'static str,
        message: String,
    },
    #[error("{service} returned {status}: {body}")]
    Api {
        service: &'static str,
        status: u16,
        body: String,
    },
    #[error("{service} response invalid: {message}")]
    InvalidResponse {
        service: &'static str,
        message: String,
    },
    #[error("config store error: {0}")]
    Store(#[from] StoreError),
}

impl AdapterError {
    pub fn request(service: &'static str, err: impl std::fmt::Display) -> Self {
        AdapterError::Request {
            service,
            message: err.to_string(),
        }
    }

    pub fn invalid(service: &'static str, message: impl Into<String>) -> Self {
        AdapterError::InvalidResponse {
            service,
            message: message.into(),
        }
    }
}

/// Anything that sends a job down the failure path.
#[derive(Debug, Error)]
pub enum JobError {
    #[error("No message content")]
    EmptyContent,
    #[error("Processing timed out")]
    TimedOut,
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Adapter(#[from] AdapterError),
}

impl JobError {
    pub fn is_config(&self) -> bool {
        matches!(self, JobError::Adapter(AdapterError::Config(_)))
    }
}
