pub mod app;
pub mod core;
pub mod envconfig;
pub mod infra;
pub mod models;
pub mod progress;

pub use app::{ExportJob, JobName, JobOutcome, JobState};
pub use core::{
    Capability, DType, ExportError, ModelDescriptor, Precision, ShapeContract, ShapeRange,
    TensorSpec, TraceError, Tracer,
};
pub use envconfig::EnvConfig;
pub use infra::{HubSource, LocalSource, PackageExporter};
pub use models::{LoadFailure, LoadedModel, ModelFamily, ModelSource, ResolvedModel};
