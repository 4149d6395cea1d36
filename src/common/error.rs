use tch::TchError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CopyRnnError {
    #[error("Invalid configuration error: {0}")]
    InvalidConfigurationError(String),

    #[error("Shape mismatch error: {0}")]
    ShapeMismatch(String),

    #[error("Index out of range error: {0}")]
    IndexOutOfRange(String),

    #[error("Invalid batch error: {0}")]
    InvalidBatch(String),

    #[error("IO error: {0}")]
    IOError(String),

    #[error("Tch tensor error: {0}")]
    TchError(String),
}

impl From<std::io::Error> for CopyRnnError {
    fn from(error: std::io::Error) -> Self {
        CopyRnnError::IOError(error.to_string())
    }
}

impl From<TchError> for CopyRnnError {
    fn from(error: TchError) -> Self {
        CopyRnnError::TchError(error.to_string())
    }
}
