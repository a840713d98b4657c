use thiserror::Error;

#[derive(Debug, Error)]
pub enum PortError {
    #[error("no free port in range {min}-{max}")]
    NoCapacity { min: u16, max: u16 },

    #[error("no active allocation for port {port}{}", owner_suffix(.owner))]
    NotFound { port: u16, owner: Option<String> },

    #[error("port {port} is outside the managed range {min}-{max}")]
    OutOfRange { port: u16, min: u16, max: u16 },

    #[error("allocation store unavailable: {0}")]
    StoreUnavailable(#[from] rusqlite::Error),

    #[error("failed to encode stored field: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

fn owner_suffix(owner: &Option<String>) -> String {
    match owner {
        Some(owner) => format!(" owned by {}", owner),
        None => String::new(),
    }
}

impl PortError {
    pub fn not_found(port: u16) -> Self {
        PortError::NotFound { port, owner: None }
    }

    pub fn not_found_for(port: u16, owner: &str) -> Self {
        PortError::NotFound {
            port,
            owner: Some(owner.to_string()),
        }
    }

    /// True when the store rejected an insert on one of the active-row unique indexes.
    pub fn is_unique_violation(&self) -> bool {
        match self {
            PortError::StoreUnavailable(rusqlite::Error::SqliteFailure(err, _)) => {
                err.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
            }
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, PortError>;
