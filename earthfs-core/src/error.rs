//! Error types for earthfs operations

#[derive(Debug, thiserror::Error)]
pub enum EfsError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Peer responded with status {0}")]
    Status(u16),

    #[error("Authentication required")]
    AuthRequired,

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Config parse error: {0}")]
    ConfigParse(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Invalid submission state: {0}")]
    InvalidState(&'static str),
}
