//! Pipeline definition, validation and planning.
//!
//! This module provides:
//! - Stage specifications and YAML pipeline definitions
//! - The validating pipeline builder
//! - The artifact DAG and its topological plan
//! - The planner that executes a plan stage by stage

mod builder;
mod dag;
mod definition;
mod planner;
mod retry;
mod spec;

pub use builder::PipelineBuilder;
pub use dag::{Pipeline, Plan};
pub use definition::{substitute_env_vars, LoadedPipeline, PipelineDefinition};
pub use planner::{Force, PlanOutcome, Planner, StagePreflight};
pub use retry::{with_retry, BackoffStrategy, JitterStrategy, RetryConfig};
pub use spec::{Binding, StageSpec};
