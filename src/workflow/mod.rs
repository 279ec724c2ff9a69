//! Workflow definition, state, and execution.
//!
//! A workflow is a linear chain of phases, each guarded by programmatic
//! gates. The executor owns the loop: it calls the agent runner for each
//! phase, validates the gates itself, retries within the phase budget, and
//! guarantees a terminal state transition no matter how a run ends.

pub mod executor;
pub mod runner;
pub mod spec;
pub mod state;

pub use executor::{WorkflowExecutor, WorkflowResult};
pub use runner::{AgentRunner, CommandRunner, PhaseInput, PhaseOutput};
pub use spec::{OnFailure, PhaseSpec, PhaseType, WorkflowSpec};
pub use state::{StateStore, WorkflowState, WorkflowStatus};
