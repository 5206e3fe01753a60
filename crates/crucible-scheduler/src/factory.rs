//! Compiling a job's plan sequence into a build plan.

use crucible_core::config::{
    Condition, JobConfig, PlanConfig, ResourceConfig,
};
use crucible_core::plan::{GetPlan, Plan, PutPlan, TaskPlan};
use crucible_core::versions::SavedBuildInput;
use crucible_core::{Error, Result};
use std::time::Duration;

/// Builds the plan for one build of a job, resolving resources from the
/// pipeline config and pinning get versions to the build's chosen inputs.
#[derive(Default)]
pub struct BuildFactory;

impl BuildFactory {
    pub fn new() -> Self {
        Self
    }

    pub fn create(
        &self,
        job: &JobConfig,
        resources: &[ResourceConfig],
        inputs: &[SavedBuildInput],
    ) -> Result<Plan> {
        self.compile_sequence(&job.plan, resources, inputs)
    }

    // Composed back-to-front so each continuation can be wrapped in its
    // run condition. The default is "after success"; items with explicit
    // conditions (or aggregates made entirely of them) break the chain.
    fn compile_sequence(
        &self,
        sequence: &[PlanConfig],
        resources: &[ResourceConfig],
        inputs: &[SavedBuildInput],
    ) -> Result<Plan> {
        let Some(last) = sequence.last() else {
            return Ok(Plan::Noop);
        };

        let mut plan = self.compile_step(last, resources, inputs)?;

        for step in sequence[..sequence.len() - 1].iter().rev() {
            if !condition_complete(&plan) {
                plan = Plan::Conditional {
                    conditions: vec![Condition::Success],
                    plan: plan.boxed(),
                };
            }
            plan = Plan::Compose {
                a: self.compile_step(step, resources, inputs)?.boxed(),
                b: plan.boxed(),
            };
        }

        Ok(plan)
    }

    fn compile_step(
        &self,
        step: &PlanConfig,
        resources: &[ResourceConfig],
        inputs: &[SavedBuildInput],
    ) -> Result<Plan> {
        let mut plan = if let Some(aggregate) = &step.aggregate {
            let members = aggregate
                .iter()
                .map(|member| self.compile_step(member, resources, inputs))
                .collect::<Result<Vec<_>>>()?;
            Plan::Aggregate { steps: members }
        } else if let Some(do_seq) = &step.do_seq {
            self.compile_sequence(do_seq, resources, inputs)?
        } else if let Some(get) = &step.get {
            let resource_name = step.resource.as_deref().unwrap_or(get);
            let resource = lookup_resource(resources, resource_name)?;
            let version = inputs
                .iter()
                .find(|input| &input.name == get)
                .map(|input| input.versioned_resource.version.clone())
                .or_else(|| step.version.clone());

            Plan::Get(GetPlan {
                name: get.clone(),
                resource: resource.name.clone(),
                resource_type: resource.resource_type.clone(),
                source: resource.source.clone(),
                params: step.params.clone(),
                version,
                tags: step.tags.clone(),
            })
        } else if let Some(put) = &step.put {
            let resource_name = step.resource.as_deref().unwrap_or(put);
            let resource = lookup_resource(resources, resource_name)?;

            Plan::PutGet {
                head: PutPlan {
                    name: put.clone(),
                    resource: resource.name.clone(),
                    resource_type: resource.resource_type.clone(),
                    source: resource.source.clone(),
                    params: step.params.clone(),
                    tags: step.tags.clone(),
                },
                rest: Plan::Noop.boxed(),
            }
        } else if let Some(task) = &step.task {
            Plan::Task(TaskPlan {
                name: task.clone(),
                privileged: step.privileged,
                config: step.task_config.clone(),
                config_path: step.task_config_path.clone(),
                tags: step.tags.clone(),
            })
        } else {
            Plan::Noop
        };

        if let Some(timeout) = step.timeout {
            plan = Plan::Timeout {
                step: plan.boxed(),
                duration: Duration::from_secs(timeout),
            };
        }

        if let Some(conditions) = &step.conditions {
            plan = Plan::Conditional {
                conditions: conditions.clone(),
                plan: plan.boxed(),
            };
        }

        Ok(plan)
    }
}

fn lookup_resource<'a>(
    resources: &'a [ResourceConfig],
    name: &str,
) -> Result<&'a ResourceConfig> {
    resources
        .iter()
        .find(|r| r.name == name)
        .ok_or_else(|| Error::Internal(format!("unknown resource: {name}")))
}

/// Whether a plan already decides for itself when to run: an explicit
/// conditional, or an aggregate made entirely of such plans.
fn condition_complete(plan: &Plan) -> bool {
    match plan {
        Plan::Conditional { .. } => true,
        Plan::Aggregate { steps } => steps.iter().all(condition_complete),
        _ => false,
    }
}
