use std::fmt;

/// Custom error types for the analysis cache and graph search
#[derive(Debug, Clone)]
pub enum GraphSearchError {
    /// Invalid chess position, FEN string or move
    InvalidPosition(String),
    /// Database operation failed
    DatabaseError(String),
    /// Oracle engine failed to launch, crashed, or spoke bad UCI
    OracleError(String),
    /// The store and the link graph disagree about a position
    StoreInconsistency(String),
    /// File I/O operation failed
    IoError(String),
    /// Configuration error
    ConfigurationError(String),
}

impl fmt::Display for GraphSearchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GraphSearchError::InvalidPosition(msg) => write!(f, "Invalid position: {}", msg),
            GraphSearchError::DatabaseError(msg) => write!(f, "Database error: {}", msg),
            GraphSearchError::OracleError(msg) => write!(f, "Oracle error: {}", msg),
            GraphSearchError::StoreInconsistency(msg) => {
                write!(f, "Store inconsistency: {}", msg)
            }
            GraphSearchError::IoError(msg) => write!(f, "I/O error: {}", msg),
            GraphSearchError::ConfigurationError(msg) => write!(f, "Configuration error: {}", msg),
        }
    }
}

impl std::error::Error for GraphSearchError {}

// Convenience type alias
pub type Result<T> = std::result::Result<T, GraphSearchError>;

// Convert from common error types
impl From<std::io::Error> for GraphSearchError {
    fn from(error: std::io::Error) -> Self {
        GraphSearchError::IoError(error.to_string())
    }
}

impl From<rusqlite::Error> for GraphSearchError {
    fn from(error: rusqlite::Error) -> Self {
        GraphSearchError::DatabaseError(error.to_string())
    }
}

impl From<serde_json::Error> for GraphSearchError {
    fn from(error: serde_json::Error) -> Self {
        GraphSearchError::ConfigurationError(format!("JSON error: {}", error))
    }
}

impl From<chess::Error> for GraphSearchError {
    fn from(error: chess::Error) -> Self {
        GraphSearchError::InvalidPosition(error.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = GraphSearchError::InvalidPosition("bad FEN".to_string());
        assert_eq!(err.to_string(), "Invalid position: bad FEN");

        let err = GraphSearchError::StoreInconsistency("edge to unknown key".to_string());
        assert!(err.to_string().contains("Store inconsistency"));
    }

    #[test]
    fn test_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        let err: GraphSearchError = io_err.into();
        assert!(matches!(err, GraphSearchError::IoError(_)));
    }
}
