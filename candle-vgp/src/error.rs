use thiserror::Error;

/// Failures of the variational GP core
///
/// Shape errors are raised at construction or on the first call with
/// a bad input. Singular and numeric errors come out of a forward pass
/// and are left for the caller to handle (skip the batch, lower the
/// learning rate, ...).
#[derive(Debug, Error)]
pub enum VgpError {
    #[error("shape error: {0}")]
    Shape(String),

    #[error("singular matrix: {0}")]
    SingularMatrix(String),

    #[error("numeric instability: {0}")]
    NumericInstability(String),

    #[error(transparent)]
    Candle(#[from] candle_core::Error),
}

impl VgpError {
    pub fn shape(msg: impl Into<String>) -> Self {
        VgpError::Shape(msg.into())
    }

    pub fn singular(msg: impl Into<String>) -> Self {
        VgpError::SingularMatrix(msg.into())
    }

    pub fn unstable(msg: impl Into<String>) -> Self {
        VgpError::NumericInstability(msg.into())
    }

    /// A batch hitting this can be skipped and training resumed
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            VgpError::NumericInstability(_) | VgpError::SingularMatrix(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, VgpError>;
