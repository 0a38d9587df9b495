pub mod descriptor;
pub mod error;
pub mod graph;
pub mod shape;
pub mod spec;
pub mod tracer;
pub mod wrapper;

pub use descriptor::{ModelDescriptor, ModelLocation, Precision};
pub use error::{ExportError, Stage, TraceError};
pub use graph::{Bindings, Graph, Node, TraceScope, Traced, ValueInfo};
pub use shape::{DType, Dim, ShapeRange};
pub use spec::{ShapeContract, TensorSpec};
pub use tracer::Tracer;
pub use wrapper::{AxisConstraint, Capability, PortSignature, Signature, TraceableWrapper};
