use std::fmt;
use std::path::PathBuf;

use modelpack::PackError;
use thiserror::Error;

use crate::engine::EngineError;
use crate::types::LifecycleState;

/// Stable codes carried by error notifications so hosts can branch without
/// parsing messages.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    InvalidArgument,
    FileNotFound,
    AssetLoadFailed,
    ModelLoadFailed,
    MotionError,
    ExpressionError,
    EngineError,
    GlInitError,
    LifecycleError,
    Disconnected,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::InvalidArgument => "INVALID_ARGUMENT",
            Self::FileNotFound => "FILE_NOT_FOUND",
            Self::AssetLoadFailed => "ASSET_LOAD_FAILED",
            Self::ModelLoadFailed => "MODEL_LOAD_FAILED",
            Self::MotionError => "MOTION_ERROR",
            Self::ExpressionError => "EXPRESSION_ERROR",
            Self::EngineError => "ENGINE_ERROR",
            Self::GlInitError => "GL_INIT_ERROR",
            Self::LifecycleError => "LIFECYCLE_ERROR",
            Self::Disconnected => "DISCONNECTED",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum StageError {
    #[error("invalid {what}: {reason}")]
    Validation { what: &'static str, reason: String },

    #[error("model file not found: {}", .0.display())]
    FileNotFound(PathBuf),

    #[error("failed to load model assets: {0}")]
    AssetLoad(#[from] PackError),

    #[error("failed to decode texture {}: {source}", path.display())]
    TextureDecode {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },

    #[error("{operation} failed: {message}")]
    EngineOperation {
        operation: String,
        code: ErrorCode,
        message: String,
    },

    #[error("cannot {event} while {state}")]
    InvalidTransition {
        state: LifecycleState,
        event: &'static str,
    },

    #[error("render thread is no longer running")]
    Disconnected,
}

impl StageError {
    pub(crate) fn validation(what: &'static str, reason: impl Into<String>) -> Self {
        Self::Validation {
            what,
            reason: reason.into(),
        }
    }

    pub(crate) fn engine(operation: impl Into<String>, code: ErrorCode, err: EngineError) -> Self {
        Self::EngineOperation {
            operation: operation.into(),
            code,
            message: err.to_string(),
        }
    }

    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Validation { .. } => ErrorCode::InvalidArgument,
            Self::FileNotFound(_) => ErrorCode::FileNotFound,
            Self::AssetLoad(_) | Self::TextureDecode { .. } => ErrorCode::AssetLoadFailed,
            Self::EngineOperation { code, .. } => *code,
            Self::InvalidTransition { .. } => ErrorCode::LifecycleError,
            Self::Disconnected => ErrorCode::Disconnected,
        }
    }
}
