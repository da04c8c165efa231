//! Error handling for the avatar mesh engine.
//!
//! All native-boundary failures are converted into [`AvatarError`] at the
//! call site; no panic crosses the bridge. Programming errors (double-attach,
//! attach-after-destroy) surface as `InvalidState` and additionally
//! `debug_assert!` in debug builds.

use std::error::Error as StdError;
use std::fmt;

use crate::bridge::{BridgeError, NativeResult};

/// Main error type for the avatar mesh engine.
#[derive(Debug)]
pub enum AvatarError {
    /// A native bridge call failed.
    Bridge(BridgeError),

    /// An operation was attempted in a stage it is not legal in.
    InvalidState {
        expected: &'static str,
        actual: &'static str,
    },

    /// The native primitive enumeration itself failed; fatal to the LOD build.
    PrimitiveEnumeration {
        lod_level: u8,
        code: NativeResult,
    },

    /// The native skeleton could not be resolved for a LOD.
    SkeletonUnavailable {
        lod_level: u8,
    },

    /// A merged-mesh build step failed; the LOD falls back to unmerged rendering.
    MergeAborted {
        reason: String,
    },

    /// A material property name could not be resolved to a native id.
    PropertyUnresolved {
        name: &'static str,
    },

    /// A null native handle was passed where a live object is required.
    NullHandle {
        context: &'static str,
    },

    /// Engine configuration failed to parse.
    ConfigParse {
        error: String,
    },

    /// Generic fallback for unexpected errors.
    Internal {
        message: String,
    },
}

impl fmt::Display for AvatarError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AvatarError::Bridge(err) => write!(f, "native bridge error: {}", err),
            AvatarError::InvalidState { expected, actual } => {
                write!(f, "invalid state: expected {}, actual {}", expected, actual)
            }
            AvatarError::PrimitiveEnumeration { lod_level, code } => write!(
                f,
                "primitive enumeration failed for LOD {}: {:?}",
                lod_level, code
            ),
            AvatarError::SkeletonUnavailable { lod_level } => {
                write!(f, "skeleton unavailable for LOD {}", lod_level)
            }
            AvatarError::MergeAborted { reason } => write!(f, "mesh merge aborted: {}", reason),
            AvatarError::PropertyUnresolved { name } => {
                write!(f, "material property '{}' not resolved", name)
            }
            AvatarError::NullHandle { context } => {
                write!(f, "null native handle in {}", context)
            }
            AvatarError::ConfigParse { error } => write!(f, "config parse error: {}", error),
            AvatarError::Internal { message } => write!(f, "internal error: {}", message),
        }
    }
}

impl StdError for AvatarError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            AvatarError::Bridge(err) => Some(err),
            _ => None,
        }
    }
}

impl From<BridgeError> for AvatarError {
    fn from(err: BridgeError) -> Self {
        AvatarError::Bridge(err)
    }
}

/// Type alias for results in the avatar mesh engine.
pub type AvatarResult<T> = Result<T, AvatarError>;

/// Extension trait for adding context to errors.
pub trait ErrorContext<T> {
    fn context(self, msg: &str) -> AvatarResult<T>;
}

impl<T, E> ErrorContext<T> for Result<T, E>
where
    E: fmt::Display,
{
    fn context(self, msg: &str) -> AvatarResult<T> {
        self.map_err(|e| AvatarError::Internal {
            message: format!("{}: {}", msg, e),
        })
    }
}
