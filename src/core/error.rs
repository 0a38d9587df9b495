use crate::core::wrapper::Capability;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// Pipeline stage in which an export job can fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Resolving,
    Wrapping,
    Tracing,
    Converting,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Resolving => "resolving",
            Stage::Wrapping => "wrapping",
            Stage::Tracing => "tracing",
            Stage::Converting => "converting",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TraceError {
    #[error("data-dependent control flow in `{op}`: {reason}")]
    DataDependentControlFlow { op: String, reason: String },
    #[error("`{op}` cannot be expressed over dynamic axis `{symbol}`")]
    SymbolicShape { op: String, symbol: String },
    #[error("invalid operand for `{op}`: {reason}")]
    InvalidOperand { op: String, reason: String },
    #[error("wrapper has no input named `{0}`")]
    UnknownInput(String),
}

#[derive(Debug, Error)]
pub enum ExportError {
    #[error("access to {model} denied: {reason}")]
    AccessDenied { model: String, reason: String },
    #[error("failed to load {model}: {reason}")]
    Load { model: String, reason: String },
    #[error("trace failed: {0}")]
    Trace(#[from] TraceError),
    #[error("shape mismatch on `{tensor}`: {reason}")]
    ShapeMismatch { tensor: String, reason: String },
    #[error("invalid shape declaration: {0}")]
    InvalidShape(String),
    #[error("{family} wrapper does not offer {capability}")]
    UnsupportedCapability {
        family: String,
        capability: Capability,
    },
    #[error("conversion failed: {0}")]
    Conversion(String),
    #[error("i/o error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid job transition: {0}")]
    InvalidTransition(String),
}

impl ExportError {
    pub fn shape_mismatch(tensor: impl Into<String>, reason: impl Into<String>) -> Self {
        ExportError::ShapeMismatch {
            tensor: tensor.into(),
            reason: reason.into(),
        }
    }

    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        ExportError::Io {
            path: path.into(),
            source,
        }
    }

    /// Only trace failures leave the process free to carry on; everything
    /// else terminates the job as a hard failure.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, ExportError::Trace(_))
    }
}
