//! The session loop of Stepwise.
//!
//! Every session runs the same bounded cycle:
//!
//! 1. **Perceive** the request (intent, entities, capability hint)
//! 2. **Recall** the session's most relevant memories
//! 3. **Plan** exactly one action line
//! 4. **Validate** it against the capability registry
//! 5. **Execute** it through the dispatcher
//! 6. **Remember** the outcome and feed it into the next step
//!
//! The loop stops on a final answer, a repeated plan, a terminal error, or
//! an exhausted step budget.

pub mod llm;
pub mod loop_runner;
pub mod perception;
pub mod planner;
pub mod protocol;

#[cfg(test)]
pub(crate) mod test_helpers;

pub use llm::TextGenerator;
pub use loop_runner::{AgentLoop, DEGRADED_PREFIX, SessionOutcome, StepTrace};
pub use perception::Perceiver;
pub use planner::{PlanContext, Planner};
pub use protocol::{coerce, decide, normalize_quasi_json, parse_and_validate};
