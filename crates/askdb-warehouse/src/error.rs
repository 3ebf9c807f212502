use thiserror::Error;

#[derive(Error, Debug)]
pub enum WarehouseError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("query task failed: {0}")]
    Task(#[from] tokio::task::JoinError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("backend returned {status}: {message}")]
    Backend { status: u16, message: String },

    #[error("unexpected backend response: {0}")]
    InvalidResponse(String),
}

pub type WarehouseResult<T> = Result<T, WarehouseError>;
