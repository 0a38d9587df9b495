use crate::app::events::{EventHandler, JobEvent};
use crate::app::job::JobState;
use indicatif::{ProgressBar, ProgressStyle};
use parking_lot::Mutex;
use std::time::Duration;

/// Terminal spinner that follows a job through its stages.
pub struct StageSpinner {
    spinner: Mutex<Option<ProgressBar>>,
}

impl StageSpinner {
    pub fn new() -> Self {
        Self {
            spinner: Mutex::new(None),
        }
    }

    fn start(&self, message: String) {
        let spinner = ProgressBar::new_spinner();
        spinner.set_style(
            ProgressStyle::default_spinner()
                .template("{spinner:.green} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner()),
        );
        spinner.set_message(message);
        spinner.enable_steady_tick(Duration::from_millis(100));

        if let Some(previous) = self.spinner.lock().replace(spinner) {
            previous.finish_and_clear();
        }
    }

    fn finish(&self, message: String) {
        if let Some(spinner) = self.spinner.lock().take() {
            spinner.finish_with_message(message);
        }
    }
}

impl Default for StageSpinner {
    fn default() -> Self {
        Self::new()
    }
}

impl EventHandler for StageSpinner {
    fn handle(&self, event: &JobEvent) {
        match event {
            JobEvent::Transition { job, to, .. } => match to {
                JobState::Saved(path) => self.finish(format!("{}: saved {}", job, path.display())),
                JobState::Failed { .. } => self.finish(format!("{}: {}", job, to)),
                _ => self.start(format!("{}: {}", job, to)),
            },
            JobEvent::FellBack { job, fallback, .. } => {
                if let Some(spinner) = self.spinner.lock().as_ref() {
                    spinner.println(format!("{}: using {}", job, fallback));
                }
            }
        }
    }
}
