//! Plan compilation.
//!
//! A single recursive descent turns a plan tree into an executable step
//! tree, assigning every step its origin location. Ids are pre-order;
//! aggregate members share their aggregate's id as a parallel group; hook
//! children hang off the hooked step's id sequentially.

use crate::delegate::BuildDelegate;
use crate::resource_steps::{GetStep, PutStep};
use crate::step::Step;
use crate::steps::{
    AggregateStep, ComposeStep, ConditionalStep, HookedComposeStep, NoopStep, TimeoutStep, TryStep,
};
use crate::task_step::TaskStep;
use crucible_core::events::OriginLocation;
use crucible_core::ids::BuildId;
use crucible_core::plan::Plan;
use crucible_core::ports::{VersionDb, WorkerPool};
use std::sync::Arc;

pub(crate) struct StepCompiler {
    pub build_id: BuildId,
    pub pipeline_name: Option<String>,
    pub pool: Arc<dyn WorkerPool>,
    pub versions: Arc<dyn VersionDb>,
    pub delegate: Arc<dyn BuildDelegate>,
}

impl StepCompiler {
    /// Compiles `plan` rooted at `location`, returning the step and how
    /// many origin ids the subtree consumed (so siblings can offset).
    pub fn compile(&self, plan: &Plan, mut location: OriginLocation) -> (Box<dyn Step>, u32) {
        match plan {
            Plan::Aggregate { steps: children } => {
                if location.parallel_group != 0 {
                    location.parent_id = location.parallel_group;
                }
                location.parallel_group = location.id;

                let mut steps = Vec::with_capacity(children.len());
                let mut offset: u32 = 1;
                for child in children {
                    let (step, increment) = self.compile(child, location.incr(offset));
                    steps.push(step);
                    offset += increment;
                }

                (Box::new(AggregateStep { children: steps }), offset)
            }

            Plan::Try(inner) => {
                let (step, increment) = self.compile(inner, location);
                (Box::new(TryStep { step }), increment)
            }

            Plan::Timeout { step, duration } => {
                let (step, increment) = self.compile(step, location);
                (
                    Box::new(TimeoutStep {
                        step,
                        duration: *duration,
                    }),
                    increment,
                )
            }

            Plan::Conditional { conditions, plan } => {
                let (step, increment) = self.compile(plan, location);
                (
                    Box::new(ConditionalStep {
                        conditions: conditions.clone(),
                        step,
                    }),
                    increment,
                )
            }

            Plan::Compose { a, b } => {
                let (a, a_increment) = self.compile(a, location);
                let (b, b_increment) = self.compile(b, location.incr(a_increment));
                (Box::new(ComposeStep { a, b }), a_increment + b_increment)
            }

            Plan::HookedCompose {
                step,
                next,
                on_failure,
                on_success,
                on_completion,
            } => {
                let (step, step_increment) = self.compile(step, location);

                location.parallel_group = 0;
                let hook_location = location.with_parent_id(location.id);

                let (on_failure, failure_increment) =
                    self.compile(on_failure, hook_location.incr(step_increment));
                let (on_success, success_increment) = self.compile(
                    on_success,
                    hook_location.incr(step_increment + failure_increment),
                );
                let (on_completion, completion_increment) = self.compile(
                    on_completion,
                    hook_location.incr(step_increment + failure_increment + success_increment),
                );
                let (next, next_increment) = self.compile(
                    next,
                    location.incr(
                        step_increment
                            + failure_increment
                            + success_increment
                            + completion_increment,
                    ),
                );

                (
                    Box::new(HookedComposeStep {
                        step,
                        next,
                        on_failure,
                        on_success,
                        on_completion,
                    }),
                    step_increment
                        + failure_increment
                        + success_increment
                        + completion_increment
                        + next_increment,
                )
            }

            Plan::PutGet { head, rest } => {
                let get_location = location
                    .incr(1)
                    .with_parent_id(location.id)
                    .with_parallel_group(0);
                let (rest, rest_increment) = self.compile(rest, location.incr(2));

                let put = Box::new(PutStep {
                    plan: head.clone(),
                    build_id: self.build_id,
                    pipeline_name: self.pipeline_name.clone(),
                    location,
                    pool: self.pool.clone(),
                    delegate: self.delegate.clone(),
                });

                let dependent_get = Box::new(GetStep {
                    plan: head.dependent_get(),
                    build_id: self.build_id,
                    pipeline_name: self.pipeline_name.clone(),
                    location: get_location,
                    pool: self.pool.clone(),
                    versions: self.versions.clone(),
                    delegate: self.delegate.clone(),
                });

                (
                    Box::new(HookedComposeStep {
                        step: put,
                        next: rest,
                        on_failure: Box::new(NoopStep),
                        on_success: dependent_get,
                        on_completion: Box::new(NoopStep),
                    }),
                    2 + rest_increment,
                )
            }

            Plan::Get(get) => (
                Box::new(GetStep {
                    plan: get.clone(),
                    build_id: self.build_id,
                    pipeline_name: self.pipeline_name.clone(),
                    location,
                    pool: self.pool.clone(),
                    versions: self.versions.clone(),
                    delegate: self.delegate.clone(),
                }),
                1,
            ),

            Plan::Put(put) => (
                Box::new(PutStep {
                    plan: put.clone(),
                    build_id: self.build_id,
                    pipeline_name: self.pipeline_name.clone(),
                    location,
                    pool: self.pool.clone(),
                    delegate: self.delegate.clone(),
                }),
                1,
            ),

            Plan::Task(task) => {
                if task.config.is_none() && task.config_path.is_none() {
                    return (Box::new(NoopStep), 0);
                }
                (
                    Box::new(TaskStep {
                        plan: task.clone(),
                        build_id: self.build_id,
                        pipeline_name: self.pipeline_name.clone(),
                        location,
                        pool: self.pool.clone(),
                        delegate: self.delegate.clone(),
                    }),
                    1,
                )
            }

            Plan::Noop => (Box::new(NoopStep), 0),
        }
    }
}
