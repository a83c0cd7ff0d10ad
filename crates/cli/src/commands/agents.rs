//! `troupe agents`: list agent definitions and factories.

use troupe_config::AppConfig;
use troupe_core::FactoryRegistry;

pub fn run(config: &AppConfig, registry: &FactoryRegistry) -> anyhow::Result<()> {
    if config.agents.is_empty() {
        println!("No agents defined. Unknown names passed to `troupe run` use the echo factory.");
    } else {
        println!("{:<20} {:<16} {:<12} STATUS", "NAME", "ROLE", "FACTORY");
        for def in &config.agents {
            let factory = def.factory_name();
            let status = if registry.contains(factory) {
                "ok"
            } else {
                "missing factory"
            };
            println!("{:<20} {:<16} {:<12} {status}", def.name, def.role, factory);
        }
    }

    println!();
    println!("Factories: {}", registry.names().join(", "));
    Ok(())
}
