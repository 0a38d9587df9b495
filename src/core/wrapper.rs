use crate::core::error::TraceError;
use crate::core::graph::{Bindings, TraceScope, Traced};
use crate::core::shape::DType;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Export mode a wrapper can expose for its model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    /// One forward computation, e.g. next-token logits or one decoder step.
    SingleStep,
    /// The model's own autoregressive loop.
    FullGeneration,
    /// A non-autoregressive encoder pass.
    Encode,
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Capability::SingleStep => "single-step",
            Capability::FullGeneration => "full-generation",
            Capability::Encode => "encode",
        };
        f.write_str(name)
    }
}

/// What the wrapped model itself requires of one axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AxisConstraint {
    Any,
    /// Any extent, as long as it is fixed at export time.
    Static,
    Exact(usize),
    AtMost(usize),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortSignature {
    pub name: String,
    pub dtype: DType,
    pub axes: Vec<AxisConstraint>,
}

impl PortSignature {
    pub fn new(name: impl Into<String>, dtype: DType, axes: Vec<AxisConstraint>) -> Self {
        Self {
            name: name.into(),
            dtype,
            axes,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Signature {
    pub inputs: Vec<PortSignature>,
    pub outputs: Vec<PortSignature>,
}

/// A model presented as one deterministic function from tensors to tensors.
pub trait TraceableWrapper {
    fn family(&self) -> &'static str;

    fn capability(&self) -> Capability;

    fn signature(&self) -> Signature;

    /// Half-open value range for an integer input's dummy data.
    fn sample_value_range(&self, _input: &str) -> Option<(i64, i64)> {
        None
    }

    fn forward(
        &self,
        scope: &mut TraceScope,
        inputs: &Bindings,
    ) -> Result<Vec<(String, Traced)>, TraceError>;
}
