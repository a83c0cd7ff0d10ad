//! `troupe check`: validate configuration and build every agent once.

use troupe_config::AppConfig;
use troupe_core::FactoryRegistry;

pub fn run(config: &AppConfig, registry: &FactoryRegistry) -> anyhow::Result<()> {
    println!("Configuration parsed and validated");

    let problems = problems(config, registry);
    for problem in &problems {
        println!("  ✗ {problem}");
    }

    println!();
    println!("  Agents:          {}", config.agents.len());
    println!(
        "  Concurrency:     {}",
        config
            .runtime
            .max_concurrency
            .map_or_else(|| "unlimited".to_string(), |n| n.to_string())
    );
    println!("  Fan-out width:   {}", config.runtime.fan_out_width());
    println!("  Send timeout:    {:?}", config.runtime.send_timeout());

    if !problems.is_empty() {
        anyhow::bail!("{} agent definition(s) failed to build", problems.len());
    }
    println!();
    println!("All checks passed");
    Ok(())
}

/// Agent definitions that do not build, one message each.
fn problems(config: &AppConfig, registry: &FactoryRegistry) -> Vec<String> {
    config
        .agents
        .iter()
        .filter_map(|def| registry.create(def).err().map(|e| format!("{}: {e}", def.name)))
        .collect()
}
