//! Compensation engine
//!
//! A [`Saga`] is an ordered list of steps, each pairing an action with the
//! action that undoes it. Steps run in order; when one fails, every step that
//! was entered (the failing one included) is compensated in reverse order.
//! Compensations must therefore tolerate a step that was only partly applied,
//! which in practice means checking for an object before removing it.

use async_trait::async_trait;
use nsboot_common::Result;
use tracing::{debug, error, info, warn};

#[async_trait]
pub trait SagaStep<C: Send + Sync>: Send + Sync {
    fn name(&self) -> &'static str;

    async fn apply(&self, ctx: &mut C) -> Result<()>;

    /// Undo `apply`. The default is a step with nothing to undo.
    async fn compensate(&self, _ctx: &C) -> Result<()> {
        Ok(())
    }
}

pub struct Saga<C: Send + Sync> {
    name: String,
    steps: Vec<Box<dyn SagaStep<C>>>,
}

impl<C: Send + Sync> Saga<C> {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            steps: Vec::new(),
        }
    }

    pub fn step(mut self, step: impl SagaStep<C> + 'static) -> Self {
        self.steps.push(Box::new(step));
        self
    }

    /// Run every step. On failure the original error is returned with any
    /// compensation failures appended to it.
    pub async fn execute(&self, ctx: &mut C) -> Result<()> {
        for (i, step) in self.steps.iter().enumerate() {
            debug!(saga = %self.name, step = step.name(), "applying step");
            if let Err(err) = step.apply(ctx).await {
                warn!(saga = %self.name, step = step.name(), error = %err, "step failed, rolling back");
                let failures = self.unwind(i, ctx).await;
                return Err(err.with_rollback_failures(&failures));
            }
        }
        Ok(())
    }

    async fn unwind(&self, failed: usize, ctx: &C) -> Vec<String> {
        let mut failures = Vec::new();
        for step in self.steps[..=failed].iter().rev() {
            match step.compensate(ctx).await {
                Ok(()) => debug!(saga = %self.name, step = step.name(), "compensated step"),
                Err(err) => {
                    error!(saga = %self.name, step = step.name(), error = %err, "compensation failed");
                    failures.push(format!("{}: {}", step.name(), err));
                }
            }
        }
        if failures.is_empty() {
            info!(saga = %self.name, "rollback complete");
        }
        failures
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nsboot_common::Error;

    #[derive(Default)]
    struct Log {
        events: Vec<String>,
    }

    struct Record {
        name: &'static str,
        fail_apply: bool,
        fail_compensate: bool,
    }

    impl Record {
        fn ok(name: &'static str) -> Self {
            Self {
                name,
                fail_apply: false,
                fail_compensate: false,
            }
        }
    }

    #[async_trait]
    impl SagaStep<std::sync::Mutex<Log>> for Record {
        fn name(&self) -> &'static str {
            self.name
        }

        async fn apply(&self, ctx: &mut std::sync::Mutex<Log>) -> Result<()> {
            ctx.get_mut().unwrap().events.push(format!("apply {}", self.name));
            if self.fail_apply {
                return Err(Error::collaborator(format!("{} broke", self.name)));
            }
            Ok(())
        }

        async fn compensate(&self, ctx: &std::sync::Mutex<Log>) -> Result<()> {
            ctx.lock().unwrap().events.push(format!("undo {}", self.name));
            if self.fail_compensate {
                return Err(Error::collaborator("stuck"));
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_success_runs_no_compensation() {
        let saga = Saga::new("test").step(Record::ok("a")).step(Record::ok("b"));
        let mut log = std::sync::Mutex::new(Log::default());

        saga.execute(&mut log).await.unwrap();
        assert_eq!(log.into_inner().unwrap().events, vec!["apply a", "apply b"]);
    }

    #[tokio::test]
    async fn test_failure_unwinds_in_reverse() {
        let saga = Saga::new("test")
            .step(Record::ok("a"))
            .step(Record::ok("b"))
            .step(Record {
                name: "c",
                fail_apply: true,
                fail_compensate: false,
            })
            .step(Record::ok("d"));
        let mut log = std::sync::Mutex::new(Log::default());

        let err = saga.execute(&mut log).await.unwrap_err();
        assert_eq!(err.to_string(), "c broke");
        assert_eq!(
            log.into_inner().unwrap().events,
            vec!["apply a", "apply b", "apply c", "undo c", "undo b", "undo a"]
        );
    }

    #[tokio::test]
    async fn test_compensation_failures_are_appended() {
        let saga = Saga::new("test")
            .step(Record {
                name: "a",
                fail_apply: false,
                fail_compensate: true,
            })
            .step(Record {
                name: "b",
                fail_apply: true,
                fail_compensate: false,
            });
        let mut log = std::sync::Mutex::new(Log::default());

        let err = saga.execute(&mut log).await.unwrap_err();
        let text = err.to_string();
        assert!(text.starts_with("b broke"));
        assert!(text.contains("rollback failed: a: stuck"));
        assert_eq!(
            log.into_inner().unwrap().events,
            vec!["apply a", "apply b", "undo b", "undo a"]
        );
    }
}
