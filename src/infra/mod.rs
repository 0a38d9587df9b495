pub mod hub;
pub mod package;

pub use hub::{HubSource, LocalSource, ModelFiles};
pub use package::{
    ComputeUnits, DeploymentTarget, ExportTarget, Manifest, PackageExporter, PackageRequest,
};
