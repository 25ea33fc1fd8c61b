use thiserror::Error;

pub type Result<T> = std::result::Result<T, StoreError>;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("user store request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("conflicting concurrent write for key: {0}")]
    Conflict(String),
}
