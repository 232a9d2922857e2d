//! Error types for aptscout operations

use thiserror::Error;

/// Error type for aptscout operations
#[derive(Error, Debug)]
pub enum Error {
    /// The decompiler could not produce pseudocode for a function
    #[error("Decompilation of {function} failed: {message}")]
    Decompile {
        /// Name of the function
        function: String,
        /// Message reported by the decompiler
        message: String,
    },

    /// The API database could not be loaded or has an unexpected layout
    #[error("API database error: {0}")]
    ApiDatabase(String),

    /// A program dump is missing data the analysis needs
    #[error("Invalid program dump: {0}")]
    ProgramDump(String),

    /// PE parsing failed
    #[error("PE parse error: {0}")]
    Pe(String),

    /// Invalid parameter provided
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    /// JSON (de)serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// IO error while reading inputs or writing logs
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<object::read::Error> for Error {
    fn from(err: object::read::Error) -> Self {
        Error::Pe(err.to_string())
    }
}

/// Result type for aptscout operations
pub type Result<T> = std::result::Result<T, Error>;
