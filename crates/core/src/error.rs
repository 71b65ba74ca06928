use std::path::PathBuf;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid config: {message}")]
    InvalidConfig { message: String },

    #[error("invalid settings file {path:?}: {message}")]
    Settings { path: PathBuf, message: String },

    #[error("source directory does not exist: {path:?}")]
    SourceNotFound { path: PathBuf },

    #[error("destination must start with '{}': {destination}", crate::DESTINATION_SCHEME)]
    InvalidDestination { destination: String },

    #[error("no files found to transfer under {path:?}")]
    NoFiles { path: PathBuf },

    #[error("failed to start {program:?}: {source}")]
    Spawn {
        program: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("walkdir error: {0}")]
    Walkdir(#[from] walkdir::Error),
}
