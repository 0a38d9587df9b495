use crate::app::job::JobState;
use crate::core::ModelDescriptor;

#[derive(Debug, Clone, PartialEq)]
pub enum JobEvent {
    Transition {
        job: String,
        from: JobState,
        to: JobState,
    },
    FellBack {
        job: String,
        primary: ModelDescriptor,
        fallback: ModelDescriptor,
    },
}

pub trait EventHandler: Send + Sync {
    fn handle(&self, event: &JobEvent);
}

/// Fan-out of job events to the handlers registered on one job.
#[derive(Default)]
pub struct EventBus {
    handlers: Vec<Box<dyn EventHandler>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<H: EventHandler + 'static>(&mut self, handler: H) {
        self.handlers.push(Box::new(handler));
    }

    pub fn publish(&self, event: JobEvent) {
        for handler in &self.handlers {
            handler.handle(&event);
        }
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;

    /// Keeps every event it sees; clones share the same log.
    #[derive(Clone, Default)]
    pub struct Recorder {
        pub events: Arc<Mutex<Vec<JobEvent>>>,
    }

    impl EventHandler for Recorder {
        fn handle(&self, event: &JobEvent) {
            self.events.lock().push(event.clone());
        }
    }
}
