//! The session loop: perceive → retrieve → plan → validate → execute → remember.
//!
//! One [`AgentLoop`] can run many sessions, concurrently if needed; every
//! piece of per-session state lives on the stack of [`AgentLoop::run`].
//! Collaborators are injected at construction.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use stepwise_core::capability::{CapabilityProvider, CapabilityRegistry, ToolCallResult};
use stepwise_core::event::{DomainEvent, EventBus};
use stepwise_core::memory::{LongTermMemory, MemoryItem, MemoryKind, Recalled, RetrieveQuery};
use stepwise_core::plan::{PerceptionResult, PlanDecision};
use stepwise_core::session::{Session, SessionId, SessionStatus};
use stepwise_memory::EphemeralStore;
use stepwise_tools::Dispatcher;
use tracing::{debug, error, info, warn};

use crate::llm::TextGenerator;
use crate::perception::Perceiver;
use crate::planner::{PlanContext, Planner};
use crate::protocol::{decide, parse_and_validate};

/// Prefix on every answer the loop had to synthesize.
pub const DEGRADED_PREFIX: &str = "[best effort] ";

const ERROR_ANSWER: &str = "I encountered an error while trying to solve this problem.";

/// What happened in one iteration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepTrace {
    pub step: usize,
    /// The action line, when planning succeeded.
    pub plan: Option<String>,
    pub tool_call: Option<ToolCallResult>,
    pub error: Option<String>,
}

/// The result of one session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionOutcome {
    pub session_id: SessionId,
    pub status: SessionStatus,
    pub final_answer: String,
    /// Iterations run, including the terminal one.
    pub iterations: usize,
    pub steps: Vec<StepTrace>,
}

/// Drives sessions over injected collaborators.
pub struct AgentLoop {
    perceiver: Perceiver,
    planner: Planner,
    capabilities: Arc<dyn CapabilityProvider>,
    dispatcher: Dispatcher,
    ephemeral: EphemeralStore,
    long_term: Arc<dyn LongTermMemory>,
    event_bus: Arc<EventBus>,
    max_steps: usize,
    recall_top_k: usize,
}

impl AgentLoop {
    pub fn new(
        generator: Arc<TextGenerator>,
        capabilities: Arc<dyn CapabilityProvider>,
        long_term: Arc<dyn LongTermMemory>,
        event_bus: Arc<EventBus>,
    ) -> Self {
        Self {
            perceiver: Perceiver::new(generator.clone()),
            planner: Planner::new(generator),
            dispatcher: Dispatcher::new(capabilities.clone()),
            capabilities,
            ephemeral: EphemeralStore::new(),
            long_term,
            event_bus,
            max_steps: 5,
            recall_top_k: 3,
        }
    }

    /// Set the per-session step budget.
    pub fn with_max_steps(mut self, max_steps: usize) -> Self {
        self.max_steps = max_steps.max(1);
        self
    }

    /// Set how many memories are recalled per step.
    pub fn with_recall_top_k(mut self, top_k: usize) -> Self {
        self.recall_top_k = top_k;
        self
    }

    /// Share an ephemeral store with other loops.
    pub fn with_ephemeral(mut self, store: EphemeralStore) -> Self {
        self.ephemeral = store;
        self
    }

    pub fn ephemeral(&self) -> &EphemeralStore {
        &self.ephemeral
    }

    /// Run one session to a terminal status. Never returns an error: every
    /// failure ends in a status and an answer string.
    pub async fn run(&self, user_input: &str, session_id: SessionId) -> SessionOutcome {
        let mut session = Session::new(session_id, self.max_steps);
        let key = session.id.as_str().to_string();
        self.ephemeral.clear(&key).await;

        info!(session_id = %session.id, max_steps = session.max_steps, "Session started");

        let registry = match CapabilityRegistry::fetch(self.capabilities.as_ref()).await {
            Ok(registry) => registry,
            Err(e) => {
                error!(session_id = %session.id, error = %e, "Could not fetch capabilities");
                self.publish_error("registry", &e.to_string());
                self.record(
                    &key,
                    MemoryItem::new(format!("Capability fetch failed: {e}"), MemoryKind::System, &key)
                        .with_tags(["error"]),
                )
                .await;
                session.finish(SessionStatus::Error);
                let answer = format!(
                    "{DEGRADED_PREFIX}I could not reach the capability provider, so I could not work on this problem."
                );
                return self.teardown(session, answer, Vec::new()).await;
            }
        };

        self.event_bus.publish(DomainEvent::SessionStarted {
            session_id: key.clone(),
            max_steps: session.max_steps,
            capabilities: registry.len(),
            timestamp: Utc::now(),
        });

        self.record(
            &key,
            MemoryItem::new(user_input, MemoryKind::Query, &key)
                .with_user_query(user_input)
                .with_tags(["user_query", "initial"]),
        )
        .await;

        let mut query = user_input.to_string();
        let mut previous_result: Option<String> = None;
        let mut seen_plans: HashSet<String> = HashSet::new();
        let mut steps: Vec<StepTrace> = Vec::new();
        let mut final_answer = String::new();

        while session.can_continue() {
            let step = session.step + 1;
            let step_tag = format!("step-{step}");
            self.event_bus.publish(DomainEvent::StepStarted {
                session_id: key.clone(),
                step,
                timestamp: Utc::now(),
            });
            debug!(session_id = %key, step, "Step started");

            // PERCEIVE
            let perception = self.perceiver.extract_for(&query, &registry).await;
            self.remember(
                MemoryItem::new(
                    format!(
                        "Intent: {}, Tool hint: {}",
                        perception.intent.as_deref().unwrap_or("None"),
                        perception.tool_hint.as_deref().unwrap_or("None")
                    ),
                    MemoryKind::System,
                    &key,
                )
                .with_tags(["perception", step_tag.as_str()]),
            )
            .await;

            // RETRIEVE
            let memories = self.recall(user_input, &key).await;

            // PLAN
            let session_log = self.ephemeral.get_all(&key).await;
            let plan = match self
                .planner
                .plan(&PlanContext {
                    perception: &perception,
                    memories: &memories,
                    registry: &registry,
                    step,
                    max_steps: session.max_steps,
                    previous_result: previous_result.as_deref(),
                    session_log: &session_log,
                })
                .await
            {
                Ok(plan) => plan,
                Err(e) => {
                    warn!(session_id = %key, step, error = %e, "Planning failed, abandoning step");
                    let message = format!("Planning failed: {e}");
                    self.publish_error("plan", &message);
                    self.record(
                        &key,
                        MemoryItem::new(&message, MemoryKind::System, &key)
                            .with_tags(["error", step_tag.as_str()]),
                    )
                    .await;
                    steps.push(StepTrace {
                        step,
                        plan: None,
                        tool_call: None,
                        error: Some(message),
                    });
                    session.advance();
                    continue;
                }
            };

            self.event_bus.publish(DomainEvent::PlanProduced {
                session_id: key.clone(),
                step,
                plan: plan.clone(),
                timestamp: Utc::now(),
            });
            self.remember(
                MemoryItem::new(format!("Plan: {plan}"), MemoryKind::System, &key)
                    .with_tags(["plan", step_tag.as_str()]),
            )
            .await;

            let mut trace = StepTrace {
                step,
                plan: Some(plan.clone()),
                tool_call: None,
                error: None,
            };

            if let Ok(PlanDecision::FinalAnswer { text }) = decide(&plan) {
                info!(session_id = %key, step, answer = %text, "Final answer");
                self.record(
                    &key,
                    MemoryItem::new(&text, MemoryKind::System, &key)
                        .with_user_query(user_input)
                        .with_tags(["final_answer"]),
                )
                .await;
                final_answer = text;
                steps.push(trace);
                session.advance();
                session.finish(SessionStatus::FinalAnswer);
                break;
            }

            if !seen_plans.insert(plan.clone()) {
                warn!(session_id = %key, step, plan = %plan, "Repeated plan, forcing final answer");
                final_answer = loop_forced_answer(&perception, previous_result.as_deref());
                self.record(
                    &key,
                    MemoryItem::new(
                        format!("Loop detected with plan: {plan}. Forcing final answer."),
                        MemoryKind::System,
                        &key,
                    )
                    .with_tags(["loop_detection", step_tag.as_str()]),
                )
                .await;
                self.record(
                    &key,
                    MemoryItem::new(&final_answer, MemoryKind::System, &key)
                        .with_tags(["final_answer", "loop_forced"]),
                )
                .await;
                steps.push(trace);
                session.advance();
                session.finish(SessionStatus::LoopDetected);
                break;
            }

            // PARSE + VALIDATE
            let (name, args) = match parse_and_validate(&plan, &registry) {
                Ok(call) => call,
                Err(e) => {
                    let message = format!("Invalid action: {e}");
                    warn!(session_id = %key, step, error = %e, "Plan rejected");
                    self.publish_error("protocol", &message);
                    self.record(
                        &key,
                        MemoryItem::new(&message, MemoryKind::System, &key)
                            .with_tags(["error", step_tag.as_str()]),
                    )
                    .await;
                    trace.error = Some(message.clone());
                    steps.push(trace);

                    if session.remaining() == 0 {
                        final_answer = format!("{DEGRADED_PREFIX}{ERROR_ANSWER}");
                        self.record_forced_answer(&key, &final_answer, "error_forced").await;
                        session.advance();
                        session.finish(SessionStatus::Error);
                        break;
                    }
                    query = format!(
                        "Original task: {user_input}\n\
                         Previous steps: Step {step} was rejected: {message}\n\
                         What should I do next? Use a listed capability with valid arguments, or give the final answer."
                    );
                    session.advance();
                    continue;
                }
            };

            // EXECUTE
            let started = Instant::now();
            let outcome = self.dispatcher.execute(&name, args).await;
            self.event_bus.publish(DomainEvent::ToolExecuted {
                tool_name: name.clone(),
                success: outcome.is_ok(),
                duration_ms: started.elapsed().as_millis() as u64,
                timestamp: Utc::now(),
            });

            let result = match outcome {
                Ok(result) => result,
                Err(e) => {
                    let message = format!("Tool execution failed: {e}");
                    error!(session_id = %key, step, tool = %name, error = %e, "Dispatch failed");
                    self.publish_error("dispatch", &message);
                    self.record(
                        &key,
                        MemoryItem::new(&message, MemoryKind::System, &key)
                            .with_tool(&name)
                            .with_tags(["error", step_tag.as_str()]),
                    )
                    .await;
                    trace.error = Some(message);
                    steps.push(trace);
                    final_answer = format!("{DEGRADED_PREFIX}{ERROR_ANSWER}");
                    self.record_forced_answer(&key, &final_answer, "error_forced").await;
                    session.advance();
                    session.finish(SessionStatus::Error);
                    break;
                }
            };

            // UPDATE MEMORY
            let rendered = result.result.to_string();
            info!(session_id = %key, step, tool = %name, result = %rendered, "Capability returned");
            self.ephemeral
                .add(&key, format!("Step {step}: {name} returned {rendered}"))
                .await;
            self.remember(
                MemoryItem::new(&rendered, MemoryKind::ToolOutput, &key)
                    .with_tool(&name)
                    .with_user_query(user_input)
                    .with_tags(["tool_result", step_tag.as_str(), name.as_str()]),
            )
            .await;

            query = format!(
                "Original task: {user_input}\n\
                 Previous steps: Step {step} used tool {name} and got result: {rendered}\n\
                 What should I do next? Consider carefully if you now have enough information to provide a final answer."
            );
            previous_result = Some(rendered);
            trace.tool_call = Some(result);
            steps.push(trace);
            session.advance();
        }

        if session.status == SessionStatus::Running {
            warn!(session_id = %key, steps = session.step, "Step budget exhausted");
            final_answer = format!(
                "{DEGRADED_PREFIX}I ran out of steps before reaching a final answer. The last result was: {}",
                previous_result.as_deref().unwrap_or("No definitive answer found")
            );
            self.record_forced_answer(&key, &final_answer, "step_exhausted").await;
            session.finish(SessionStatus::StepExhausted);
        }

        self.teardown(session, final_answer, steps).await
    }

    async fn teardown(&self, session: Session, final_answer: String, steps: Vec<StepTrace>) -> SessionOutcome {
        self.ephemeral.clear(session.id.as_str()).await;
        self.event_bus.publish(DomainEvent::SessionFinished {
            session_id: session.id.to_string(),
            status: session.status.to_string(),
            iterations: session.step,
            timestamp: Utc::now(),
        });
        info!(
            session_id = %session.id,
            status = %session.status,
            iterations = session.step,
            "Session finished"
        );
        SessionOutcome {
            session_id: session.id,
            status: session.status,
            final_answer,
            iterations: session.step,
            steps,
        }
    }

    async fn recall(&self, text: &str, session_id: &str) -> Vec<Recalled> {
        let query = RetrieveQuery::new(text, self.recall_top_k).in_session(session_id);
        match self.long_term.retrieve(&query).await {
            Ok(found) => {
                self.event_bus.publish(DomainEvent::MemoryAccessed {
                    operation: "retrieve".into(),
                    count: found.len(),
                    timestamp: Utc::now(),
                });
                debug!(count = found.len(), "Recalled memories");
                found
            }
            Err(e) => {
                warn!(error = %e, "Memory retrieval failed, continuing without memories");
                self.publish_error("memory.retrieve", &e.to_string());
                Vec::new()
            }
        }
    }

    /// Store in long-term memory only.
    async fn remember(&self, item: MemoryItem) {
        match self.long_term.add(item).await {
            Ok(_) => self.event_bus.publish(DomainEvent::MemoryAccessed {
                operation: "add".into(),
                count: 1,
                timestamp: Utc::now(),
            }),
            Err(e) => {
                warn!(error = %e, "Failed to store memory");
                self.publish_error("memory.add", &e.to_string());
            }
        }
    }

    /// Store in both the session log and long-term memory.
    async fn record(&self, key: &str, item: MemoryItem) {
        self.ephemeral.add(key, item.text.clone()).await;
        self.remember(item).await;
    }

    async fn record_forced_answer(&self, key: &str, answer: &str, reason: &str) {
        self.record(
            key,
            MemoryItem::new(answer, MemoryKind::System, key).with_tags(["final_answer", reason]),
        )
        .await;
    }

    fn publish_error(&self, context: &str, message: &str) {
        self.event_bus.publish(DomainEvent::ErrorOccurred {
            context: context.to_string(),
            error_message: message.to_string(),
            timestamp: Utc::now(),
        });
    }
}

fn loop_forced_answer(perception: &PerceptionResult, previous_result: Option<&str>) -> String {
    format!(
        "{DEGRADED_PREFIX}Based on my analysis, I found that {}. The available information suggests: {}",
        perception.intent.as_deref().unwrap_or("the task could not be completed"),
        previous_result.unwrap_or("No definitive answer found")
    )
}
