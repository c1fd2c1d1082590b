use thiserror::Error;

#[derive(Debug, Error)]
pub enum VaultError {
    #[error("Invalid encryption key: {0}")]
    InvalidKey(String),

    #[error("Encryption failed: {0}")]
    Encryption(String),

    #[error("Decryption failed: {0}")]
    Decryption(String),

    #[error("Invalid encrypted data format: {0}")]
    InvalidFormat(String),

    #[error("Keyring error: {0}")]
    Keyring(String),
}

/// Errors raised by a remote mailbox. The pipeline decides which are fatal.
#[derive(Debug, Error)]
pub enum MailboxError {
    #[error("Invalid mailbox credentials: {0}")]
    InvalidCredentials(String),

    #[error("No refresh token stored for this mailbox")]
    MissingRefreshToken,

    #[error("Failed to refresh access token: {0}")]
    Refresh(String),

    #[error("Failed to {operation}: {message}")]
    Api { operation: &'static str, message: String },

    #[error("Mailbox transport error: {0}")]
    Transport(String),
}

impl MailboxError {
    pub fn api(operation: &'static str, err: impl std::fmt::Display) -> Self {
        MailboxError::Api {
            operation,
            message: err.to_string(),
        }
    }
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Narration failed: {0}")]
    Narration(String),

    #[error("Database error: {0}")]
    Persistence(#[from] sqlx::Error),

    #[error(transparent)]
    Vault(#[from] VaultError),
}

pub type PipelineResult<T> = Result<T, PipelineError>;

#[derive(Debug, Error)]
#[error("Configuration errors:\n{}", .missing.join("\n"))]
pub struct ConfigError {
    pub missing: Vec<String>,
}
