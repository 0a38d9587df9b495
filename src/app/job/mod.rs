use crate::app::events::{EventBus, EventHandler, JobEvent};
use crate::app::resolver::ModelAccessResolver;
use crate::core::{Capability, ExportError, ModelDescriptor, ShapeContract, Stage, Tracer};
use crate::infra::{ExportTarget, PackageExporter, PackageRequest};
use crate::models::{ModelFamily, ModelSource};
use std::fmt;
use std::path::PathBuf;
use tracing::{error, info};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobState {
    Created,
    Resolving,
    Wrapping,
    Tracing,
    Converting,
    Saved(PathBuf),
    Failed { stage: Stage, reason: String },
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Saved(_) | JobState::Failed { .. })
    }

    /// Stage a failure in this state is attributed to.
    pub fn stage(&self) -> Option<Stage> {
        match self {
            JobState::Resolving => Some(Stage::Resolving),
            JobState::Wrapping => Some(Stage::Wrapping),
            JobState::Tracing => Some(Stage::Tracing),
            JobState::Converting => Some(Stage::Converting),
            _ => None,
        }
    }

    pub fn can_advance_to(&self, next: &JobState) -> bool {
        match (self, next) {
            (JobState::Created, JobState::Resolving)
            | (JobState::Resolving, JobState::Wrapping)
            | (JobState::Wrapping, JobState::Tracing)
            | (JobState::Tracing, JobState::Converting)
            | (JobState::Converting, JobState::Saved(_)) => true,
            (current, JobState::Failed { stage, .. }) => current.stage() == Some(*stage),
            _ => false,
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobState::Created => f.write_str("created"),
            JobState::Resolving => f.write_str("resolving"),
            JobState::Wrapping => f.write_str("wrapping"),
            JobState::Tracing => f.write_str("tracing"),
            JobState::Converting => f.write_str("converting"),
            JobState::Saved(path) => write!(f, "saved({})", path.display()),
            JobState::Failed { stage, reason } => write!(f, "failed({}: {})", stage, reason),
        }
    }
}

#[derive(Debug)]
pub enum JobOutcome {
    Saved { path: PathBuf, fell_back: bool },
    Failed { stage: Stage, error: ExportError },
}

impl JobOutcome {
    /// 0 on success, 2 when tracing failed recoverably, 1 otherwise.
    pub fn exit_code(&self) -> i32 {
        match self {
            JobOutcome::Saved { .. } => 0,
            JobOutcome::Failed { error, .. } if error.is_recoverable() => 2,
            JobOutcome::Failed { .. } => 1,
        }
    }

    pub fn is_saved(&self) -> bool {
        matches!(self, JobOutcome::Saved { .. })
    }

    pub fn diagnosis(&self) -> String {
        match self {
            JobOutcome::Saved { path, fell_back } => {
                let mut text = format!("saved {}", path.display());
                if *fell_back {
                    text.push_str(" (from the open fallback model)");
                }
                text
            }
            JobOutcome::Failed { stage, error } if error.is_recoverable() => format!(
                "{} failed: {}. The model cannot be exported as a static graph in this mode; \
                 export a single step instead",
                stage, error
            ),
            JobOutcome::Failed { stage, error } => format!("{} failed: {}", stage, error),
        }
    }
}

/// One conversion from model to package. Runs once; the state only moves
/// forward.
pub struct ExportJob {
    name: String,
    primary: ModelDescriptor,
    fallback: Option<ModelDescriptor>,
    family: ModelFamily,
    capability: Capability,
    contract: ShapeContract,
    target: ExportTarget,
    output_dir: PathBuf,
    state: JobState,
    history: Vec<JobState>,
    events: EventBus,
}

impl ExportJob {
    pub fn new(
        name: impl Into<String>,
        primary: ModelDescriptor,
        family: ModelFamily,
        capability: Capability,
        contract: ShapeContract,
    ) -> Self {
        Self {
            name: name.into(),
            primary,
            fallback: None,
            family,
            capability,
            contract,
            target: ExportTarget::default(),
            output_dir: PathBuf::from("."),
            state: JobState::Created,
            history: vec![JobState::Created],
            events: EventBus::new(),
        }
    }

    pub fn fallback(mut self, fallback: ModelDescriptor) -> Self {
        self.fallback = Some(fallback);
        self
    }

    pub fn target(mut self, target: ExportTarget) -> Self {
        self.target = target;
        self
    }

    pub fn output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.output_dir = dir.into();
        self
    }

    pub fn subscribe<H: EventHandler + 'static>(&mut self, handler: H) {
        self.events.subscribe(handler);
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn primary(&self) -> &ModelDescriptor {
        &self.primary
    }

    pub fn fallback_descriptor(&self) -> Option<&ModelDescriptor> {
        self.fallback.as_ref()
    }

    pub fn family(&self) -> ModelFamily {
        self.family
    }

    pub fn capability(&self) -> Capability {
        self.capability
    }

    pub fn contract(&self) -> &ShapeContract {
        &self.contract
    }

    pub fn export_target(&self) -> &ExportTarget {
        &self.target
    }

    pub fn state(&self) -> &JobState {
        &self.state
    }

    pub fn history(&self) -> &[JobState] {
        &self.history
    }

    pub fn output_path(&self) -> PathBuf {
        self.exporter().package_path(&self.name)
    }

    fn exporter(&self) -> PackageExporter {
        PackageExporter::new(&self.output_dir)
    }

    pub fn advance(&mut self, next: JobState) -> Result<(), ExportError> {
        if !self.state.can_advance_to(&next) {
            return Err(ExportError::InvalidTransition(format!(
                "{}: {} -> {}",
                self.name, self.state, next
            )));
        }
        info!("[{}] {} -> {}", self.name, self.state, next);
        let from = std::mem::replace(&mut self.state, next.clone());
        self.history.push(next.clone());
        self.events.publish(JobEvent::Transition {
            job: self.name.clone(),
            from,
            to: next,
        });
        Ok(())
    }

    fn fail(&mut self, stage: Stage, error: ExportError) -> Result<JobOutcome, ExportError> {
        let reason = error.to_string();
        if error.is_recoverable() {
            error!("[{}] {} failed (recoverable): {}", self.name, stage, reason);
        } else {
            error!("[{}] {} failed: {}", self.name, stage, reason);
        }
        self.advance(JobState::Failed { stage, reason })?;
        Ok(JobOutcome::Failed { stage, error })
    }

    /// Drives the job to a terminal state. `Err` only for an illegal
    /// transition, e.g. running a job twice; pipeline failures come back as
    /// `JobOutcome::Failed`.
    pub fn run(
        &mut self,
        source: &dyn ModelSource,
        tracer: &Tracer,
    ) -> Result<JobOutcome, ExportError> {
        self.advance(JobState::Resolving)?;
        let resolved = match ModelAccessResolver::new(source).resolve(
            &self.primary,
            self.fallback.as_ref(),
            self.family,
        ) {
            Ok(resolved) => resolved,
            Err(e) => return self.fail(Stage::Resolving, e),
        };
        if resolved.fell_back {
            self.events.publish(JobEvent::FellBack {
                job: self.name.clone(),
                primary: self.primary.clone(),
                fallback: resolved.descriptor().clone(),
            });
        }

        self.advance(JobState::Wrapping)?;
        let wrapper = match self
            .family
            .wrap(&resolved.model, self.capability)
            .and_then(|wrapper| {
                self.contract.check_signature(&wrapper.signature())?;
                Ok(wrapper)
            }) {
            Ok(wrapper) => wrapper,
            Err(e) => return self.fail(Stage::Wrapping, e),
        };

        self.advance(JobState::Tracing)?;
        let graph = match tracer.trace(wrapper.as_ref(), &self.contract) {
            Ok(graph) => graph,
            Err(e) => return self.fail(Stage::Tracing, e),
        };

        self.advance(JobState::Converting)?;
        let exported = self.exporter().export(&PackageRequest {
            name: &self.name,
            model: &resolved,
            family: self.family,
            capability: self.capability,
            contract: &self.contract,
            graph: &graph,
            target: &self.target,
        });
        let path = match exported {
            Ok(path) => path,
            Err(e) => return self.fail(Stage::Converting, e),
        };

        self.advance(JobState::Saved(path.clone()))?;
        Ok(JobOutcome::Saved {
            path,
            fell_back: resolved.fell_back,
        })
    }
}

impl fmt::Debug for ExportJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExportJob")
            .field("name", &self.name)
            .field("primary", &self.primary)
            .field("fallback", &self.fallback)
            .field("family", &self.family)
            .field("capability", &self.capability)
            .field("state", &self.state)
            .finish()
    }
}
