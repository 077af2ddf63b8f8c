//! `stepwise memory`: Long-term memory management commands.

use stepwise_core::memory::{LongTermMemory, RetrieveQuery};

use super::{CliResult, load_config, open_store};

pub async fn stats() -> CliResult {
    let config = load_config()?;
    let router = stepwise_providers::router::build_from_config(&config);
    let store = open_store(&config, &router)?;
    let stats = store.stats().await;

    println!("Memory Statistics");
    println!("=================");
    println!("  Directory:  {}", config.memory_dir().display());
    println!("  Collection: {}", config.memory.collection);
    println!("  Embeddings: {}", config.memory.embedding_provider);
    println!("  Records:    {}", stats.records);
    println!("  Sessions:   {}", stats.sessions);
    println!("  Dimension:  {}", stats.dimension);
    Ok(())
}

pub async fn search(query: &str, top_k: usize, session: Option<String>, tag: Option<String>) -> CliResult {
    let config = load_config()?;
    let router = stepwise_providers::router::build_from_config(&config);
    let store = open_store(&config, &router)?;

    let mut request = RetrieveQuery::new(query, top_k);
    if let Some(session) = session {
        request = request.in_session(session);
    }
    if let Some(tag) = tag {
        request = request.with_tags([tag]);
    }

    let results = store.retrieve(&request).await?;
    if results.is_empty() {
        println!("No memories found.");
        return Ok(());
    }
    for (i, found) in results.iter().enumerate() {
        let text: String = found.item.text.chars().take(80).collect();
        println!(
            "  {:>2}. [{:.3}] ({}, {}) {text}",
            i + 1,
            found.distance,
            found.item.kind.as_str(),
            found.item.session_id
        );
        if !found.item.tags.is_empty() {
            let tags: Vec<&str> = found.item.tags.iter().map(String::as_str).collect();
            println!("      tags: {}", tags.join(", "));
        }
    }
    Ok(())
}

pub async fn purge(session: &str) -> CliResult {
    let config = load_config()?;
    let router = stepwise_providers::router::build_from_config(&config);
    let store = open_store(&config, &router)?;
    let removed = store.delete_session(session).await?;
    println!("Removed {removed} item(s) of session {session}.");
    Ok(())
}

pub async fn clear(confirm: bool) -> CliResult {
    if !confirm {
        println!("This will delete ALL memories permanently.");
        println!("Run with --confirm to proceed:");
        println!("  stepwise memory clear --confirm");
        return Ok(());
    }

    let config = load_config()?;
    let router = stepwise_providers::router::build_from_config(&config);
    let store = open_store(&config, &router)?;
    store.reset().await?;
    println!("All memories cleared.");
    Ok(())
}
