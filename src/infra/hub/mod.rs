pub mod files;

pub use files::{shards_from_index, ModelFiles};

use crate::core::{ModelDescriptor, ModelLocation};
use crate::models::{LoadFailure, LoadedModel, ModelFamily, ModelSource};
use anyhow::{anyhow, Context};
use hf_hub::api::sync::{Api, ApiBuilder};
use reqwest::blocking::Client;
use reqwest::{header, StatusCode};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info, warn};

pub const DEFAULT_ENDPOINT: &str = "https://huggingface.co";

pub const ERROR_CODE_HEADER: &str = "x-error-code";
const GATED_REPO: &str = "GatedRepo";
const REPO_NOT_FOUND: &str = "RepoNotFound";

/// Maps the access check's status and `X-Error-Code` to a load failure.
/// Without a token the hub answers 401 for gated, private and missing repos
/// alike; only the error code marks a gated one.
pub fn classify_access(status: StatusCode, error_code: Option<&str>) -> Option<LoadFailure> {
    if status.is_success() {
        return None;
    }
    match (status, error_code) {
        (_, Some(REPO_NOT_FOUND)) => Some(LoadFailure::Unavailable(anyhow!(
            "repository not found (HTTP {})",
            status.as_u16()
        ))),
        (StatusCode::FORBIDDEN, _) | (StatusCode::UNAUTHORIZED, Some(GATED_REPO)) => {
            Some(LoadFailure::AccessDenied {
                status: status.as_u16(),
            })
        }
        (StatusCode::UNAUTHORIZED, _) => Some(LoadFailure::Unavailable(anyhow!(
            "hub answered HTTP 401 without a gated-repo marker \
             (private or missing repository)"
        ))),
        (s, code) => Some(LoadFailure::Unavailable(anyhow!(
            "hub answered HTTP {}{}",
            s,
            code.map(|c| format!(" ({})", c)).unwrap_or_default()
        ))),
    }
}

/// Loads models from a local directory.
#[derive(Debug, Default, Clone)]
pub struct LocalSource;

impl ModelSource for LocalSource {
    fn load(
        &self,
        descriptor: &ModelDescriptor,
        family: ModelFamily,
    ) -> Result<LoadedModel, LoadFailure> {
        let dir = match &descriptor.location {
            ModelLocation::Local(dir) => dir,
            ModelLocation::Hub(id) => {
                return Err(LoadFailure::Unavailable(anyhow!(
                    "{} is a hub model, not a local directory",
                    id
                )))
            }
        };
        let files = ModelFiles::in_dir(dir, family)?;
        Ok(files.load(descriptor, family)?)
    }
}

/// Downloads models from the Hugging Face hub into the local cache.
pub struct HubSource {
    endpoint: String,
    token: Option<String>,
    cache_dir: Option<PathBuf>,
    client: Client,
}

impl HubSource {
    pub fn new() -> Self {
        Self {
            endpoint: DEFAULT_ENDPOINT.to_string(),
            token: None,
            cache_dir: None,
            client: Client::builder()
                .timeout(Duration::from_secs(30))
                .build()
                .unwrap_or_else(|_| Client::new()),
        }
    }

    pub fn endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into().trim_end_matches('/').to_string();
        self
    }

    pub fn token(mut self, token: Option<String>) -> Self {
        self.token = token.filter(|t| !t.is_empty());
        self
    }

    pub fn cache_dir(mut self, cache_dir: Option<PathBuf>) -> Self {
        self.cache_dir = cache_dir;
        self
    }

    /// Falls back to the token stored by `huggingface-cli login`.
    pub fn with_cached_token(mut self) -> Self {
        if self.token.is_none() {
            self.token = hf_hub::Cache::default().token();
        }
        self
    }

    fn access_url(&self, repo_id: &str) -> String {
        format!("{}/{}/resolve/main/{}", self.endpoint, repo_id, files::CONFIG_FILE)
    }

    /// Checks entitlement before downloading anything. The decision rests on
    /// the HTTP status and the hub's error code header, never on error text.
    pub fn check_access(&self, repo_id: &str) -> Result<(), LoadFailure> {
        let url = self.access_url(repo_id);
        debug!("Checking access: HEAD {}", url);

        let mut request = self.client.head(&url);
        if let Some(token) = &self.token {
            request = request.header(header::AUTHORIZATION, format!("Bearer {}", token));
        }
        let response = request
            .send()
            .with_context(|| format!("Failed to reach {}", url))?;

        let error_code = response
            .headers()
            .get(ERROR_CODE_HEADER)
            .and_then(|value| value.to_str().ok());
        match classify_access(response.status(), error_code) {
            Some(failure) => {
                warn!("Access check for {} failed: {}", repo_id, failure);
                Err(failure)
            }
            None => Ok(()),
        }
    }

    fn api(&self) -> anyhow::Result<Api> {
        let mut builder = ApiBuilder::new()
            .with_endpoint(self.endpoint.clone())
            .with_token(self.token.clone())
            .with_progress(true);
        if let Some(dir) = &self.cache_dir {
            builder = builder.with_cache_dir(dir.clone());
        }
        builder
            .build()
            .context("Failed to initialize HuggingFace Hub API")
    }

    pub fn download(&self, repo_id: &str, family: ModelFamily) -> anyhow::Result<ModelFiles> {
        let repo = self.api()?.model(repo_id.to_string());
        let fetch = |file: &str| {
            debug!("Fetching {}/{}", repo_id, file);
            repo.get(file)
                .with_context(|| format!("Failed to download {} from {}", file, repo_id))
        };

        let config = fetch(files::CONFIG_FILE)?;
        let processor = fetch(family.processor_file())?;
        let weights = match fetch(files::SINGLE_WEIGHTS_FILE) {
            Ok(path) => vec![path],
            Err(single_err) => {
                debug!("No single weights file ({:#}), trying sharded index", single_err);
                let index_path = fetch(files::WEIGHTS_INDEX_FILE)?;
                let index = std::fs::read_to_string(&index_path)
                    .with_context(|| format!("Failed to read {}", index_path.display()))?;
                shards_from_index(&index)?
                    .iter()
                    .map(|shard| fetch(shard.as_str()))
                    .collect::<anyhow::Result<Vec<_>>>()?
            }
        };

        Ok(ModelFiles {
            config,
            processor,
            weights,
        })
    }
}

impl Default for HubSource {
    fn default() -> Self {
        Self::new()
    }
}

impl ModelSource for HubSource {
    fn load(
        &self,
        descriptor: &ModelDescriptor,
        family: ModelFamily,
    ) -> Result<LoadedModel, LoadFailure> {
        let repo_id = match &descriptor.location {
            ModelLocation::Hub(repo_id) => repo_id,
            ModelLocation::Local(_) => return LocalSource.load(descriptor, family),
        };

        self.check_access(repo_id)?;
        info!("Downloading {} from {}", repo_id, self.endpoint);
        let files = self.download(repo_id, family)?;
        Ok(files.load(descriptor, family)?)
    }
}
