//! End-to-end integration tests for the Stepwise agent.
//!
//! These tests exercise the full pipeline from user input to final answer:
//! perception, recall, planning, protocol validation, dispatch to the
//! built-in capabilities, and persistence of long-term memory.

use std::sync::Arc;

use serde_json::json;
use stepwise_agent::perception::PERCEPTION_HEADER;
use stepwise_agent::{AgentLoop, DEGRADED_PREFIX, TextGenerator, decide, parse_and_validate};
use stepwise_config::AppConfig;
use stepwise_core::capability::{CapabilityRegistry, ToolOutput};
use stepwise_core::error::ProviderError;
use stepwise_core::event::{DomainEvent, EventBus};
use stepwise_core::memory::{LongTermMemory, MemoryKind, RetrieveQuery};
use stepwise_core::message::Message;
use stepwise_core::plan::PlanDecision;
use stepwise_core::provider::{Provider, ProviderRequest, ProviderResponse, Usage};
use stepwise_core::session::{SessionId, SessionStatus};
use stepwise_memory::{HashEmbedder, VectorStore};
use stepwise_tools::{Dispatcher, builtin_capabilities};

// ── Mock Provider ────────────────────────────────────────────────────────

/// A mock provider that answers perception prompts with a fixed object and
/// planning prompts with scripted lines in sequence.
struct ScriptedProvider {
    perception: String,
    plans: std::sync::Mutex<Vec<String>>,
    plan_calls: std::sync::Mutex<usize>,
}

impl ScriptedProvider {
    fn new(perception: &str, plans: &[&str]) -> Self {
        Self {
            perception: perception.to_string(),
            plans: std::sync::Mutex::new(plans.iter().map(|p| p.to_string()).collect()),
            plan_calls: std::sync::Mutex::new(0),
        }
    }

    fn plans(plans: &[&str]) -> Self {
        Self::new(
            r#"{"intent": "answer the question", "entities": [], "tool_hint": null}"#,
            plans,
        )
    }

    fn plan_calls(&self) -> usize {
        *self.plan_calls.lock().unwrap()
    }
}

#[async_trait::async_trait]
impl Provider for ScriptedProvider {
    fn name(&self) -> &str {
        "e2e_mock"
    }

    async fn complete(&self, request: ProviderRequest) -> Result<ProviderResponse, ProviderError> {
        let prompt = request.messages.last().map(|m| m.content.clone()).unwrap_or_default();
        if prompt.starts_with(PERCEPTION_HEADER) {
            return Ok(text_response(&self.perception));
        }

        let mut count = self.plan_calls.lock().unwrap();
        let plans = self.plans.lock().unwrap();
        if *count >= plans.len() {
            panic!("ScriptedProvider exhausted: plan call #{}, have {}", *count, plans.len());
        }
        let plan = plans[*count].clone();
        *count += 1;
        Ok(text_response(&plan))
    }
}

fn text_response(text: &str) -> ProviderResponse {
    ProviderResponse {
        message: Message::assistant(text),
        usage: Some(Usage {
            prompt_tokens: 10,
            completion_tokens: 5,
            total_tokens: 15,
        }),
        model: "mock".into(),
    }
}

fn agent(provider: Arc<ScriptedProvider>, memory: Arc<VectorStore>, max_steps: usize) -> AgentLoop {
    AgentLoop::new(
        Arc::new(TextGenerator::new(provider, "mock")),
        Arc::new(builtin_capabilities()),
        memory,
        Arc::new(EventBus::default()),
    )
    .with_max_steps(max_steps)
}

fn memory() -> Arc<VectorStore> {
    Arc::new(VectorStore::in_memory(Arc::new(HashEmbedder::new(128)), 128))
}

// ── E2E: Scenarios ───────────────────────────────────────────────────────

#[tokio::test]
async fn e2e_single_tool_call_then_answer() {
    let provider = Arc::new(ScriptedProvider::plans(&[
        r#"FUNCTION_CALL: {"name": "add", "args": {"a": 2, "b": 3}}"#,
        "FINAL_ANSWER: 5",
    ]));
    let memory = memory();
    let outcome = agent(provider.clone(), memory.clone(), 5)
        .run("What is 2 + 3?", SessionId::from("e2e-a"))
        .await;

    assert_eq!(outcome.status, SessionStatus::FinalAnswer);
    assert_eq!(outcome.final_answer, "5");
    assert_eq!(outcome.iterations, 2);
    assert_eq!(provider.plan_calls(), 2);

    let call = outcome.steps[0].tool_call.as_ref().unwrap();
    assert_eq!(call.tool_name, "add");
    assert_eq!(call.result, ToolOutput::List(vec!["5".into()]));

    let outputs = memory
        .retrieve(&RetrieveQuery::new("add", 5).of_kind(MemoryKind::ToolOutput).in_session("e2e-a"))
        .await
        .unwrap();
    assert_eq!(outputs.len(), 1);
    assert_eq!(outputs[0].item.text, "5");
    assert_eq!(outputs[0].item.user_query.as_deref(), Some("What is 2 + 3?"));
}

#[tokio::test]
async fn e2e_direct_answer_no_tools() {
    let provider = Arc::new(ScriptedProvider::plans(&["FINAL_ANSWER: 42 meters"]));
    let outcome = agent(provider, memory(), 5)
        .run("How tall is the tower?", SessionId::from("e2e-b"))
        .await;

    assert_eq!(outcome.status, SessionStatus::FinalAnswer);
    assert_eq!(outcome.final_answer, "42 meters");
    assert_eq!(outcome.iterations, 1);
    assert!(outcome.steps[0].tool_call.is_none());
}

#[tokio::test]
async fn e2e_unknown_capability_is_recovered() {
    let provider = Arc::new(ScriptedProvider::plans(&[
        r#"FUNCTION_CALL: {"name":"unknown_tool","args":{}}"#,
        r#"FUNCTION_CALL: {"name": "multiply", "args": {"a": 6, "b": 7}}"#,
        "FINAL_ANSWER: 42",
    ]));
    let outcome = agent(provider, memory(), 3)
        .run("What is six times seven?", SessionId::from("e2e-c"))
        .await;

    assert_eq!(outcome.status, SessionStatus::FinalAnswer);
    assert_eq!(outcome.final_answer, "42");
    assert!(outcome.steps[0].error.as_deref().unwrap().contains("unknown_tool"));
    assert_eq!(outcome.steps[1].tool_call.as_ref().unwrap().result.to_string(), "42");
}

#[tokio::test]
async fn e2e_step_budget_is_exhausted() {
    let provider = Arc::new(ScriptedProvider::plans(&[
        r#"FUNCTION_CALL: {"name": "fibonacci_numbers", "args": {"n": 3}}"#,
        r#"FUNCTION_CALL: {"name": "fibonacci_numbers", "args": {"n": 4}}"#,
        r#"FUNCTION_CALL: {"name": "fibonacci_numbers", "args": {"n": 5}}"#,
    ]));
    let outcome = agent(provider.clone(), memory(), 3)
        .run("Think about fibonacci forever", SessionId::from("e2e-d"))
        .await;

    assert_eq!(outcome.status, SessionStatus::StepExhausted);
    assert_eq!(outcome.iterations, 3);
    assert_eq!(provider.plan_calls(), 3);
    assert!(outcome.final_answer.starts_with(DEGRADED_PREFIX));
    assert!(outcome.final_answer.contains("[0, 1, 1, 2, 3]"));
}

#[tokio::test]
async fn e2e_string_pipeline_with_quasi_json() {
    let provider = Arc::new(ScriptedProvider::new(
        r#"{'intent': 'sum of exponentials of ASCII values', 'entities': ['INDIA'], 'tool_hint': 'strings_to_chars_to_int'}"#,
        &[
            "FUNCTION_CALL: {'name': 'strings_to_chars_to_int', 'args': {'string': 'INDIA'}}",
            "FUNCTION_CALL: {'name': 'int_list_to_exponential_sum', 'args': {'int_list': [73, 78, 68, 73, 65]}}",
            "FINAL_ANSWER: done",
        ],
    ));
    let outcome = agent(provider, memory(), 5)
        .run("Sum the exponentials of the ASCII values of INDIA", SessionId::from("e2e-ascii"))
        .await;

    assert_eq!(outcome.status, SessionStatus::FinalAnswer);
    assert_eq!(
        outcome.steps[0].tool_call.as_ref().unwrap().result,
        ToolOutput::List(vec!["73".into(), "78".into(), "68".into(), "73".into(), "65".into()])
    );
    assert!(outcome.steps[1].tool_call.is_some());
}

#[tokio::test]
async fn e2e_events_cover_the_session() {
    let provider = Arc::new(ScriptedProvider::plans(&[
        r#"FUNCTION_CALL: {"name": "sqrt", "args": {"a": 16}}"#,
        "FINAL_ANSWER: 4",
    ]));
    let bus = Arc::new(EventBus::default());
    let mut rx = bus.subscribe();
    let agent = AgentLoop::new(
        Arc::new(TextGenerator::new(provider, "mock")),
        Arc::new(builtin_capabilities()),
        memory(),
        bus,
    );
    agent.run("square root of 16", SessionId::from("e2e-ev")).await;

    let mut tools = Vec::new();
    let mut finished = None;
    while let Ok(event) = rx.try_recv() {
        match event.as_ref() {
            DomainEvent::ToolExecuted { tool_name, success, .. } => tools.push((tool_name.clone(), *success)),
            DomainEvent::SessionFinished { status, iterations, .. } => {
                finished = Some((status.clone(), *iterations))
            }
            _ => {}
        }
    }
    assert_eq!(tools, vec![("sqrt".to_string(), true)]);
    assert_eq!(finished, Some(("FINAL_ANSWER".to_string(), 2)));
}

// ── E2E: Memory persistence ─────────────────────────────────────────────

#[tokio::test]
async fn e2e_memory_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let open = || {
        Arc::new(
            VectorStore::open(dir.path(), "agent_memory", Arc::new(HashEmbedder::new(64)), 64)
                .unwrap()
                .with_oversample(5),
        )
    };

    let provider = Arc::new(ScriptedProvider::plans(&[
        r#"FUNCTION_CALL: {"name": "factorial", "args": {"a": 5}}"#,
        "FINAL_ANSWER: 120",
    ]));
    let first = open();
    agent(provider, first.clone(), 5)
        .run("What is 5 factorial?", SessionId::from("persist-1"))
        .await;
    let stored = first.len().await;
    assert!(stored > 0);
    drop(first);

    let reopened = open();
    assert_eq!(reopened.len().await, stored);
    let answers = reopened
        .retrieve(
            &RetrieveQuery::new("120", 5)
                .in_session("persist-1")
                .with_tags(["final_answer"]),
        )
        .await
        .unwrap();
    assert_eq!(answers[0].item.text, "120");

    assert_eq!(reopened.delete_session("persist-1").await.unwrap(), stored);
    assert_eq!(reopened.len().await, 0);
}

// ── E2E: Protocol + dispatch without the loop ───────────────────────────

#[tokio::test]
async fn e2e_protocol_and_dispatch_agree() {
    let provider = builtin_capabilities();
    let registry = CapabilityRegistry::fetch(&provider).await.unwrap();

    let line = r#"FUNCTION_CALL: {"name": "power", "args": {"a": "2", "b": 10}}"#;
    assert!(matches!(decide(line).unwrap(), PlanDecision::FunctionCall { .. }));
    let (name, args) = parse_and_validate(line, &registry).unwrap();
    assert_eq!(args.get("a"), Some(&json!(2)));

    let dispatcher = Dispatcher::new(Arc::new(provider));
    let result = dispatcher.execute(&name, args).await.unwrap();
    assert_eq!(result.result.to_string(), "1024");
}

#[tokio::test]
async fn e2e_config_defaults_and_validation() {
    let config = AppConfig::default();
    assert_eq!(config.agent.max_steps, 5);
    assert_eq!(config.agent.recall_top_k, 3);
    assert_eq!(config.memory.embedding_provider, "hash");
    assert!(config.capability_servers.is_empty());

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.toml");
    std::fs::write(&path, "[agent]\nmax_steps = 0\n").unwrap();
    assert!(AppConfig::load_from(&path).is_err());

    std::fs::write(
        &path,
        "[agent]\nmax_steps = 3\n\n[[capability_servers]]\nname = \"math\"\ncommand = \"python\"\nargs = [\"server.py\"]\n",
    )
    .unwrap();
    let config = AppConfig::load_from(&path).unwrap();
    assert_eq!(config.agent.max_steps, 3);
    assert_eq!(config.capability_servers[0].args, vec!["server.py"]);
}
