//! User-visible operations with progress reporting.
//!
//! An [`Action`] wraps a long-running operation and reports its lifecycle
//! through a [`StatusReporter`]:
//!
//! ```text
//! Fetching playlist...
//! Fetching playlist...40%
//! Fetching playlist...done            (Ok)
//! Fetching playlist...failed\tmsg     (ActionError::Failed, handled)
//! Fetching playlist...error\tmsg      (ActionError::Error, propagated)
//! ```

use std::fmt::Display;

/// Sink for short status messages shown to the user.
pub trait StatusReporter: Send + Sync {
    fn show_msg(&self, msg: &str);
}

/// Reporter that writes status messages to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogReporter;

impl StatusReporter for LogReporter {
    fn show_msg(&self, msg: &str) {
        tracing::info!(target: "cadence::status", "{msg}");
    }
}

/// Ways an action block can end early.
#[derive(Debug)]
pub enum ActionError<E> {
    /// Handled failure; reported and swallowed.
    Failed(String),
    /// Unhandled error; reported and returned to the caller.
    Error(E),
}

impl<E> From<E> for ActionError<E> {
    fn from(err: E) -> Self {
        ActionError::Error(err)
    }
}

/// Outcome of an action that did not hit an unhandled error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActionOutcome<T> {
    Done(T),
    Failed(String),
}

impl<T> ActionOutcome<T> {
    pub fn is_done(&self) -> bool {
        matches!(self, ActionOutcome::Done(_))
    }
}

pub struct Action<'a> {
    title: String,
    reporter: &'a dyn StatusReporter,
}

impl<'a> Action<'a> {
    /// Report the start of `title` and return the running action.
    pub fn begin(reporter: &'a dyn StatusReporter, title: impl Into<String>) -> Self {
        let title = title.into();
        reporter.show_msg(&format!("{title}..."));
        Self { title, reporter }
    }

    pub fn title(&self) -> &str {
        &self.title
    }

    /// Report progress; `fraction` is clamped into `[0, 1]`.
    pub fn set_progress(&self, fraction: f64) {
        let percent = (fraction.clamp(0.0, 1.0) * 100.0) as u32;
        self.reporter
            .show_msg(&format!("{}...{}%", self.title, percent));
    }

    /// Build the handled-failure value to return from the action block.
    pub fn fail<E>(&self, msg: impl Into<String>) -> ActionError<E> {
        ActionError::Failed(msg.into())
    }

    /// Report how the block ended and map it to the three-way result.
    pub fn finish<T, E: Display>(
        self,
        result: Result<T, ActionError<E>>,
    ) -> Result<ActionOutcome<T>, E> {
        match result {
            Ok(value) => {
                self.reporter.show_msg(&format!("{}...done", self.title));
                Ok(ActionOutcome::Done(value))
            }
            Err(ActionError::Failed(msg)) => {
                self.reporter
                    .show_msg(&format!("{}...failed\t{}", self.title, msg));
                Ok(ActionOutcome::Failed(msg))
            }
            Err(ActionError::Error(err)) => {
                self.reporter
                    .show_msg(&format!("{}...error\t{}", self.title, err));
                Err(err)
            }
        }
    }
}

/// Run `block` as a reported action.
pub fn with_action<T, E, F>(
    reporter: &dyn StatusReporter,
    title: &str,
    block: F,
) -> Result<ActionOutcome<T>, E>
where
    E: Display,
    F: FnOnce(&Action<'_>) -> Result<T, ActionError<E>>,
{
    let action = Action::begin(reporter, title);
    let result = block(&action);
    action.finish(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder(Mutex<Vec<String>>);

    impl StatusReporter for Recorder {
        fn show_msg(&self, msg: &str) {
            self.0.lock().unwrap().push(msg.to_string());
        }
    }

    impl Recorder {
        fn messages(&self) -> Vec<String> {
            self.0.lock().unwrap().clone()
        }
    }

    #[test]
    fn clean_completion_reports_done() {
        let recorder = Recorder::default();
        let outcome = with_action::<_, String, _>(&recorder, "Scanning", |action| {
            action.set_progress(0.5);
            action.set_progress(7.0);
            Ok(3)
        })
        .unwrap();

        assert_eq!(outcome, ActionOutcome::Done(3));
        assert_eq!(
            recorder.messages(),
            vec!["Scanning...", "Scanning...50%", "Scanning...100%", "Scanning...done"]
        );
    }

    #[test]
    fn handled_failure_is_reported_and_swallowed() {
        let recorder = Recorder::default();
        let outcome = with_action::<(), String, _>(&recorder, "Login", |action| {
            Err(action.fail("bad password"))
        })
        .unwrap();

        assert_eq!(outcome, ActionOutcome::Failed("bad password".into()));
        assert_eq!(recorder.messages().last().unwrap(), "Login...failed\tbad password");
    }

    #[test]
    fn unhandled_error_is_reported_and_propagated() {
        let recorder = Recorder::default();
        let result = with_action::<(), String, _>(&recorder, "Sync", |_| {
            Err::<(), _>(String::from("disk full"))?;
            Ok(())
        });

        assert_eq!(result.unwrap_err(), "disk full");
        assert_eq!(recorder.messages().last().unwrap(), "Sync...error\tdisk full");
    }
}
