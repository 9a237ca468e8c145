//! Stage execution.
//!
//! A stage is one external transformation step. The [`StageExecutor`]
//! decides whether it must run, renders its command, runs it through a
//! [`CommandRunner`] and checks that it kept its output contract.

mod executor;
mod runner;
mod tail;
mod template;

pub use executor::{Satisfaction, StageExecutor};
pub use runner::{
    CommandExit, CommandResult, CommandRunner, CommandSpec, OutputCapture, OutputStream,
    ProcessRunner,
};
pub use tail::RollingTail;
pub use template::{check as check_template, render, TemplateContext, TemplateError};
