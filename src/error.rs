//! Error types shared by every stage of the warp-consistency pipeline.

use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    /// Tensor, flow or mask dimensions do not line up.
    #[error("shape mismatch: {0}")]
    Shape(String),

    /// A batch field required by the configured pipeline is absent.
    #[error("missing batch field `{0}`")]
    MissingField(&'static str),

    /// Invalid configuration, detected before any step runs.
    #[error("configuration error: {0}")]
    Config(String),

    /// Requested capability is not available in this build.
    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("image error: {0}")]
    Image(#[from] image::ImageError),
}

impl Error {
    pub fn shape<S: Into<String>>(msg: S) -> Self {
        Error::Shape(msg.into())
    }

    pub fn config<S: Into<String>>(msg: S) -> Self {
        Error::Config(msg.into())
    }
}
