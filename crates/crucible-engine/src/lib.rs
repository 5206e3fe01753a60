//! Build engine.
//!
//! Compiles a declarative plan into an executable step tree, supervises its
//! execution under cooperative cancellation, and reports everything that
//! happens through a delegate that appends to the build's event stream.

mod compile;
mod delegate;
mod engine;
mod resource_steps;
mod step;
mod steps;
mod task_step;
mod tracker;

pub use delegate::{BuildDelegate, DbBuildDelegate};
pub use engine::{Engine, Engines, ExecEngine, RunningBuild};
pub use step::{Artifact, Step, StepContext, StepOutcome, WorkingTree};
pub use tracker::BuildTracker;
