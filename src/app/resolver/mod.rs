use crate::core::{ExportError, ModelDescriptor};
use crate::models::{LoadFailure, ModelFamily, ModelSource, ResolvedModel};
use tracing::{info, warn};

/// Obtains a loaded model for a job, substituting the open fallback exactly
/// once when the primary is access-restricted.
pub struct ModelAccessResolver<'a> {
    source: &'a dyn ModelSource,
}

impl<'a> ModelAccessResolver<'a> {
    pub fn new(source: &'a dyn ModelSource) -> Self {
        Self { source }
    }

    pub fn resolve(
        &self,
        primary: &ModelDescriptor,
        fallback: Option<&ModelDescriptor>,
        family: ModelFamily,
    ) -> Result<ResolvedModel, ExportError> {
        info!("Loading {}", primary);
        match self.source.load(primary, family) {
            Ok(model) => Ok(ResolvedModel {
                model,
                fell_back: false,
            }),
            Err(LoadFailure::AccessDenied { status }) => {
                let Some(fallback) = fallback else {
                    return Err(access_denied(primary, status));
                };
                warn!(
                    "Access to {} denied (HTTP {}), falling back to {}",
                    primary.id(),
                    status,
                    fallback
                );
                match self.source.load(fallback, family) {
                    Ok(model) => Ok(ResolvedModel {
                        model,
                        fell_back: true,
                    }),
                    Err(LoadFailure::AccessDenied { status }) => {
                        Err(access_denied(fallback, status))
                    }
                    Err(LoadFailure::Unavailable(e)) => Err(unavailable(fallback, e)),
                }
            }
            Err(LoadFailure::Unavailable(e)) => Err(unavailable(primary, e)),
        }
    }
}

fn access_denied(descriptor: &ModelDescriptor, status: u16) -> ExportError {
    ExportError::AccessDenied {
        model: descriptor.id(),
        reason: format!(
            "HTTP {}; accept the license on the hub and set HF_TOKEN",
            status
        ),
    }
}

fn unavailable(descriptor: &ModelDescriptor, error: anyhow::Error) -> ExportError {
    ExportError::Load {
        model: descriptor.id(),
        reason: format!("{:#}", error),
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::models::{testing as fixtures, LoadedModel};
    use parking_lot::Mutex;
    use std::collections::HashMap;

    pub enum Outcome {
        Load(serde_json::Value, Vec<(&'static str, &'static [usize])>),
        Denied(u16),
        Missing,
    }

    /// Serves canned results per model id and records every load attempt.
    #[derive(Default)]
    pub struct FakeSource {
        outcomes: HashMap<String, Outcome>,
        pub attempts: Mutex<Vec<String>>,
    }

    impl FakeSource {
        pub fn with(mut self, id: &str, outcome: Outcome) -> Self {
            self.outcomes.insert(id.to_string(), outcome);
            self
        }

        pub fn attempts(&self) -> Vec<String> {
            self.attempts.lock().clone()
        }
    }

    impl ModelSource for FakeSource {
        fn load(
            &self,
            descriptor: &ModelDescriptor,
            _family: ModelFamily,
        ) -> Result<LoadedModel, LoadFailure> {
            self.attempts.lock().push(descriptor.id());
            match self.outcomes.get(&descriptor.id()) {
                Some(Outcome::Load(config, weights)) => {
                    let mut model = fixtures::model(config.clone(), weights);
                    model.descriptor = descriptor.clone();
                    Ok(model)
                }
                Some(Outcome::Denied(status)) => Err(LoadFailure::AccessDenied { status: *status }),
                Some(Outcome::Missing) | None => Err(LoadFailure::Unavailable(anyhow::anyhow!(
                    "{} not found",
                    descriptor.id()
                ))),
            }
        }
    }
}
