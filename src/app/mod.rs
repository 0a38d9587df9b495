pub mod catalog;
pub mod events;
pub mod job;
pub mod resolver;
pub mod server;

pub use catalog::JobName;
pub use events::{EventBus, EventHandler, JobEvent};
pub use job::{ExportJob, JobOutcome, JobState};
pub use resolver::ModelAccessResolver;
pub use server::{Server, ServiceContext, Shutdown};
