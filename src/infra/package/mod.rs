pub mod manifest;

pub use manifest::{
    ComputeUnits, DeploymentTarget, ExportTarget, Manifest, Platform, WeightsInfo,
    FORMAT_VERSION,
};

use crate::core::{Capability, ExportError, Graph, ShapeContract};
use crate::models::{LoadedModel, ModelFamily, ResolvedModel};
use candle_core::Tensor;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

pub const PACKAGE_EXTENSION: &str = "modelpkg";
pub const MANIFEST_FILE: &str = "manifest.json";
pub const WEIGHTS_FILE: &str = "weights.safetensors";

/// Everything the exporter needs from a finished trace.
pub struct PackageRequest<'a> {
    pub name: &'a str,
    pub model: &'a ResolvedModel,
    pub family: ModelFamily,
    pub capability: Capability,
    pub contract: &'a ShapeContract,
    pub graph: &'a Graph,
    pub target: &'a ExportTarget,
}

/// Writes packages into one output directory. A package either appears
/// complete at its final path or not at all.
pub struct PackageExporter {
    output_dir: PathBuf,
}

impl PackageExporter {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
        }
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    pub fn package_path(&self, name: &str) -> PathBuf {
        self.output_dir
            .join(format!("{}.{}", name, PACKAGE_EXTENSION))
    }

    pub fn export(&self, request: &PackageRequest<'_>) -> Result<PathBuf, ExportError> {
        validate_name(request.name)?;
        fs::create_dir_all(&self.output_dir)
            .map_err(|e| ExportError::io(&self.output_dir, e))?;

        let weights = collect_weights(
            &request.model.model,
            request.graph,
            request.target.precision,
        )?;

        let staging = Staging::create(&self.output_dir, request.name)?;
        let weights_path = staging.path().join(WEIGHTS_FILE);
        candle_core::safetensors::save(&weights, &weights_path)
            .map_err(|e| ExportError::Conversion(format!("writing weights: {}", e)))?;
        let sha256 = file_digest(&weights_path)?;
        debug!("Wrote {} tensors ({})", weights.len(), sha256);

        let manifest = Manifest {
            format_version: FORMAT_VERSION,
            created_at: chrono::Utc::now(),
            model: request.model.descriptor().clone(),
            fell_back: request.model.fell_back,
            family: request.family,
            capability: request.capability,
            compute_units: request.target.compute_units,
            deployment_target: request.target.deployment_target,
            precision: request.target.precision,
            inputs: request.contract.inputs().to_vec(),
            outputs: request.contract.outputs().to_vec(),
            graph: request.graph.clone(),
            weights: WeightsInfo {
                file: WEIGHTS_FILE.to_string(),
                tensors: weights.len(),
                sha256,
            },
        };
        let manifest_path = staging.path().join(MANIFEST_FILE);
        let json = serde_json::to_vec_pretty(&manifest)
            .map_err(|e| ExportError::Conversion(format!("serializing manifest: {}", e)))?;
        fs::write(&manifest_path, json).map_err(|e| ExportError::io(&manifest_path, e))?;

        verify(staging.path())?;

        let dest = self.package_path(request.name);
        staging.commit(&dest)?;
        info!("Saved {} package to {}", request.name, dest.display());
        Ok(dest)
    }
}

fn validate_name(name: &str) -> Result<(), ExportError> {
    let valid = !name.is_empty()
        && !name.starts_with('.')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if !valid {
        return Err(ExportError::Conversion(format!(
            "invalid package name `{}`",
            name
        )));
    }
    Ok(())
}

/// Weights referenced by graph nodes, cast to the package precision. A
/// prefix with no matching weight means the wrapper and the checkpoint
/// disagree.
fn collect_weights(
    model: &LoadedModel,
    graph: &Graph,
    precision: crate::core::Precision,
) -> Result<HashMap<String, Tensor>, ExportError> {
    let mut weights = HashMap::new();
    for prefix in graph.weight_prefixes() {
        let before = weights.len();
        for (name, tensor) in model.weights_with_prefix(prefix) {
            let tensor = if tensor.dtype().is_float() {
                tensor.to_dtype(precision.to_candle()).map_err(|e| {
                    ExportError::Conversion(format!("casting {} to {}: {}", name, precision, e))
                })?
            } else {
                tensor.clone()
            };
            weights.insert(name.clone(), tensor);
        }
        if weights.len() == before {
            return Err(ExportError::Conversion(format!(
                "graph references `{}` but {} has no such weights",
                prefix,
                model.descriptor.id()
            )));
        }
    }

    let skipped = model.weights.len() - weights.len();
    if skipped > 0 {
        debug!("{} weights are not referenced by the graph", skipped);
    }
    Ok(weights)
}

pub fn file_digest(path: &Path) -> Result<String, ExportError> {
    let mut file = fs::File::open(path).map_err(|e| ExportError::io(path, e))?;
    let mut hasher = Sha256::new();
    std::io::copy(&mut file, &mut hasher).map_err(|e| ExportError::io(path, e))?;
    Ok(format!("sha256:{:x}", hasher.finalize()))
}

pub fn read_manifest(package: &Path) -> Result<Manifest, ExportError> {
    let path = package.join(MANIFEST_FILE);
    let text = fs::read_to_string(&path).map_err(|e| ExportError::io(&path, e))?;
    serde_json::from_str(&text)
        .map_err(|e| ExportError::Conversion(format!("{}: {}", path.display(), e)))
}

/// Re-reads a written package: the manifest must parse and the weights file
/// must hold exactly the tensors the manifest announces.
pub fn verify(package: &Path) -> Result<Manifest, ExportError> {
    let manifest = read_manifest(package)?;

    let weights_path = package.join(&manifest.weights.file);
    let file = fs::File::open(&weights_path).map_err(|e| ExportError::io(&weights_path, e))?;
    // SAFETY: the file is not modified while mapped.
    let mmap = unsafe { memmap2::Mmap::map(&file) }
        .map_err(|e| ExportError::io(&weights_path, e))?;
    let tensors = safetensors::SafeTensors::deserialize(&mmap).map_err(|e| {
        ExportError::Conversion(format!("{}: {}", weights_path.display(), e))
    })?;

    let count = tensors.names().len();
    if count != manifest.weights.tensors {
        return Err(ExportError::Conversion(format!(
            "{} holds {} tensors, manifest announces {}",
            weights_path.display(),
            count,
            manifest.weights.tensors
        )));
    }
    Ok(manifest)
}

/// Hidden directory next to the destination. Removed on drop unless it was
/// renamed into place.
struct Staging {
    path: PathBuf,
    committed: bool,
}

impl Staging {
    fn create(output_dir: &Path, name: &str) -> Result<Self, ExportError> {
        let path = output_dir.join(format!(".{}.{}.partial", name, uuid::Uuid::new_v4()));
        fs::create_dir(&path).map_err(|e| ExportError::io(&path, e))?;
        Ok(Self {
            path,
            committed: false,
        })
    }

    fn path(&self) -> &Path {
        &self.path
    }

    fn commit(mut self, dest: &Path) -> Result<(), ExportError> {
        let previous = if dest.exists() {
            let parent = dest.parent().unwrap_or_else(|| Path::new("."));
            let old = parent.join(format!(".{}.old", uuid::Uuid::new_v4()));
            fs::rename(dest, &old).map_err(|e| ExportError::io(dest, e))?;
            Some(old)
        } else {
            None
        };

        if let Err(e) = fs::rename(&self.path, dest) {
            if let Some(old) = &previous {
                if let Err(restore) = fs::rename(old, dest) {
                    warn!("Failed to restore {}: {}", dest.display(), restore);
                }
            }
            return Err(ExportError::io(dest, e));
        }
        self.committed = true;

        if let Some(old) = previous {
            if let Err(e) = fs::remove_dir_all(&old) {
                warn!("Failed to remove replaced package {}: {}", old.display(), e);
            }
        }
        Ok(())
    }
}

impl Drop for Staging {
    fn drop(&mut self) {
        if !self.committed && self.path.exists() {
            if let Err(e) = fs::remove_dir_all(&self.path) {
                warn!("Failed to remove staging dir {}: {}", self.path.display(), e);
            }
        }
    }
}
