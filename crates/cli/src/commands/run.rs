//! `stepwise run`: Solve one request, or one per stdin line.

use std::sync::Arc;
use std::time::Duration;

use stepwise_agent::{AgentLoop, SessionOutcome, TextGenerator};
use stepwise_config::AppConfig;
use stepwise_core::event::EventBus;
use stepwise_core::session::SessionId;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

use super::{CliResult, build_capabilities, load_config, open_store};

const KEYLESS_PROVIDERS: &[&str] = &["ollama", "vllm", "lmstudio", "llamacpp", "llama.cpp"];

pub async fn run(
    message: Option<String>,
    local: bool,
    session: Option<String>,
    max_steps: Option<usize>,
    trace: bool,
) -> CliResult {
    let config = load_config()?;

    if config.api_key.is_none()
        && !KEYLESS_PROVIDERS.contains(&config.default_provider.as_str())
        && !config.providers.contains_key(&config.default_provider)
    {
        eprintln!();
        eprintln!("  ERROR: No API key configured for '{}'!", config.default_provider);
        eprintln!();
        eprintln!("  Set STEPWISE_API_KEY (or OPENROUTER_API_KEY / OPENAI_API_KEY),");
        eprintln!("  or switch to a local backend with STEPWISE_PROVIDER=ollama.");
        eprintln!();
        eprintln!("  Config file: {}", AppConfig::config_dir().join("config.toml").display());
        eprintln!();
        return Err("No API key found. See above for setup instructions.".into());
    }

    let agent = build_agent(&config, local, max_steps)?;

    if let Some(message) = message {
        let session_id = session.as_deref().map(SessionId::from).unwrap_or_default();
        let outcome = agent.run(&message, session_id).await;
        print_outcome(&outcome, trace)?;
        return Ok(());
    }

    eprintln!("  Stepwise ({} / {})", config.default_provider, config.default_model);
    eprintln!("  One request per line. Ctrl+D to quit.");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stderr = tokio::io::stderr();
    loop {
        stderr.write_all(b"  > ").await?;
        stderr.flush().await?;
        let Some(line) = lines.next_line().await? else {
            break;
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if line == "exit" || line == "quit" {
            break;
        }
        // --session makes every request share one id
        let session_id = session.as_deref().map(SessionId::from).unwrap_or_default();
        let outcome = agent.run(line, session_id).await;
        print_outcome(&outcome, trace)?;
    }

    Ok(())
}

fn build_agent(
    config: &AppConfig,
    local: bool,
    max_steps: Option<usize>,
) -> Result<AgentLoop, Box<dyn std::error::Error>> {
    let router = stepwise_providers::router::build_from_config(config);
    let provider = router.default().ok_or("No default provider configured")?;

    let generator = TextGenerator::new(provider, &config.default_model)
        .with_temperature(config.default_temperature)
        .with_max_tokens(config.default_max_tokens)
        .with_timeout(Duration::from_secs(config.agent.llm_timeout_secs));

    let memory = open_store(config, &router)?;
    let capabilities = build_capabilities(config, local);

    Ok(AgentLoop::new(Arc::new(generator), capabilities, memory, Arc::new(EventBus::default()))
        .with_max_steps(max_steps.unwrap_or(config.agent.max_steps))
        .with_recall_top_k(config.agent.recall_top_k))
}

fn print_outcome(outcome: &SessionOutcome, trace: bool) -> CliResult {
    println!("{}", outcome.final_answer);
    eprintln!(
        "  [{}] {} step(s), session {}",
        outcome.status, outcome.iterations, outcome.session_id
    );
    if trace {
        println!("{}", serde_json::to_string_pretty(&outcome.steps)?);
    }
    Ok(())
}
