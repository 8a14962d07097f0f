use thiserror::Error;

#[derive(Error, Debug)]
pub enum EtlError {
    #[error("missing required environment variable {0}")]
    MissingVar(&'static str),

    #[error("invalid value for {name}: {reason}")]
    InvalidVar { name: &'static str, reason: String },

    #[error("google authentication failed: {0}")]
    Auth(String),

    #[error(transparent)]
    Http(#[from] reqwest::Error),

    #[error("{service} returned HTTP {status}: {body}")]
    Api {
        service: &'static str,
        status: u16,
        body: String,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Csv(#[from] csv::Error),

    #[error(transparent)]
    Storage(#[from] object_store::Error),

    #[error("snowflake error {code}: {message}")]
    Warehouse { code: String, message: String },

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Date(#[from] jiff::Error),
}
