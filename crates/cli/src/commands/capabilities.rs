//! `stepwise capabilities`: List what the agent can call.

use stepwise_core::capability::CapabilityRegistry;

use super::{CliResult, build_capabilities, load_config};

pub async fn run(local: bool) -> CliResult {
    let config = load_config()?;
    let provider = build_capabilities(&config, local);
    let registry = CapabilityRegistry::fetch(provider.as_ref()).await?;

    println!("Capabilities from {} ({}):", provider.name(), registry.len());
    println!("{}", registry.catalogue());
    Ok(())
}
