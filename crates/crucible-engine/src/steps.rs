//! Composition steps: ordering, concurrency, hooks, conditions, timeouts.

use crate::step::{Step, StepContext, StepOutcome};
use async_trait::async_trait;
use crucible_core::config::Condition;
use crucible_core::{Error, Result};
use std::time::Duration;

/// Does nothing; passes the prior overall success through.
pub struct NoopStep;

#[async_trait]
impl Step for NoopStep {
    async fn run(self: Box<Self>, ctx: StepContext) -> Result<StepOutcome> {
        Ok(StepOutcome::new(ctx.prior_succeeded.unwrap_or(true)))
    }
}

/// Runs `a`, then `b` with `a`'s success as its prior. Succeeds iff both do.
pub struct ComposeStep {
    pub a: Box<dyn Step>,
    pub b: Box<dyn Step>,
}

#[async_trait]
impl Step for ComposeStep {
    async fn run(self: Box<Self>, ctx: StepContext) -> Result<StepOutcome> {
        let a = self.a.run(ctx.clone()).await?;
        let b = self.b.run(ctx.with_prior(Some(a.succeeded))).await?;
        Ok(StepOutcome::new(a.succeeded && b.succeeded))
    }
}

/// Runs `step`, then exactly one of the success/failure hooks, then the
/// completion hook, then `next` with `step`'s success as its prior.
pub struct HookedComposeStep {
    pub step: Box<dyn Step>,
    pub next: Box<dyn Step>,
    pub on_failure: Box<dyn Step>,
    pub on_success: Box<dyn Step>,
    pub on_completion: Box<dyn Step>,
}

#[async_trait]
impl Step for HookedComposeStep {
    async fn run(self: Box<Self>, ctx: StepContext) -> Result<StepOutcome> {
        let outcome = match self.step.run(ctx.clone()).await {
            Ok(outcome) => outcome,
            Err(err) => {
                // The completion hook is an "ensure": it runs even when the
                // hooked step errors, then the error propagates.
                let _ = self
                    .on_completion
                    .run(ctx.with_prior(Some(false)))
                    .await;
                return Err(err);
            }
        };

        let hook_ctx = ctx.clone().with_prior(Some(outcome.succeeded));
        let hook = if outcome.succeeded {
            self.on_success
        } else {
            self.on_failure
        };
        let hook_outcome = hook.run(hook_ctx.clone()).await?;
        let completion_outcome = self.on_completion.run(hook_ctx.clone()).await?;
        let next_outcome = self.next.run(hook_ctx).await?;

        Ok(StepOutcome::new(
            outcome.succeeded
                && hook_outcome.succeeded
                && completion_outcome.succeeded
                && next_outcome.succeeded,
        ))
    }
}

/// Runs all children concurrently; succeeds iff every child does.
pub struct AggregateStep {
    pub children: Vec<Box<dyn Step>>,
}

#[async_trait]
impl Step for AggregateStep {
    async fn run(self: Box<Self>, ctx: StepContext) -> Result<StepOutcome> {
        let mut handles = Vec::with_capacity(self.children.len());
        for child in self.children {
            let child_ctx = ctx.clone();
            handles.push(tokio::spawn(child.run(child_ctx)));
        }

        let mut succeeded = true;
        let mut failure: Option<Error> = None;
        for handle in handles {
            match handle.await {
                Ok(Ok(outcome)) => succeeded &= outcome.succeeded,
                Ok(Err(err)) => {
                    // An abort outranks whatever else went wrong.
                    if matches!(err, Error::Aborted) || failure.is_none() {
                        failure = Some(err);
                    }
                }
                Err(join_err) => {
                    if failure.is_none() {
                        failure = Some(Error::Internal(join_err.to_string()));
                    }
                }
            }
        }

        match failure {
            Some(err) => Err(err),
            None => Ok(StepOutcome::new(succeeded)),
        }
    }
}

/// Runs the inner step iff the prior overall status is in `conditions`;
/// otherwise passes the prior status through untouched.
pub struct ConditionalStep {
    pub conditions: Vec<Condition>,
    pub step: Box<dyn Step>,
}

impl ConditionalStep {
    fn matches(&self, prior: Option<bool>) -> bool {
        match prior {
            // Nothing ran yet; an explicit conditional at the head of a
            // plan behaves as if the (empty) prior succeeded.
            None => self.conditions.contains(&Condition::Success),
            Some(true) => self.conditions.contains(&Condition::Success),
            Some(false) => self.conditions.contains(&Condition::Failure),
        }
    }
}

#[async_trait]
impl Step for ConditionalStep {
    async fn run(self: Box<Self>, ctx: StepContext) -> Result<StepOutcome> {
        if self.matches(ctx.prior_succeeded) {
            self.step.run(ctx).await
        } else {
            Ok(StepOutcome::new(ctx.prior_succeeded.unwrap_or(true)))
        }
    }
}

/// Runs the inner step and overrides its success to true. Aborts still
/// propagate.
pub struct TryStep {
    pub step: Box<dyn Step>,
}

#[async_trait]
impl Step for TryStep {
    async fn run(self: Box<Self>, ctx: StepContext) -> Result<StepOutcome> {
        match self.step.run(ctx).await {
            Err(Error::Aborted) => Err(Error::Aborted),
            _ => Ok(StepOutcome::new(true)),
        }
    }
}

/// Cancels the inner step and fails with a timeout if it does not complete
/// in time.
pub struct TimeoutStep {
    pub step: Box<dyn Step>,
    pub duration: Duration,
}

#[async_trait]
impl Step for TimeoutStep {
    async fn run(self: Box<Self>, ctx: StepContext) -> Result<StepOutcome> {
        match tokio::time::timeout(self.duration, self.step.run(ctx)).await {
            Ok(result) => result,
            Err(_) => Err(Error::StepTimedOut),
        }
    }
}
