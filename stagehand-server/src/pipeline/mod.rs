//! Pipeline scheduling and execution

mod executor;
mod registry;

pub use executor::{build_execution_order, PipelineError, PipelineExecutor, StageExecution};
pub use registry::PipelineRegistry;
