//! `coderun check`

use anyhow::Result;
use coderun_sandbox::ContainerRuntime;

use crate::server::{environment, load_config, validate_production_config};

pub async fn run() -> Result<()> {
    println!("coderun check\n");

    let config = load_config()?;
    let sandbox = config.sandbox_config();
    println!("Environment:      {}", environment());
    println!(
        "Listen:           {}:{}",
        config.server.host, config.server.port
    );
    println!(
        "Auth:             {} ({} static keys)",
        if config.server.auth.enabled {
            "enabled"
        } else {
            "DISABLED"
        },
        config.server.auth.api_keys.len()
    );

    let runtime = ContainerRuntime::from_preference(&sandbox.runtime_preference).await;
    println!(
        "Runtime:          {} (preference: {})",
        runtime.display_name(),
        sandbox.runtime_preference
    );
    println!("Image:            {}", sandbox.image);
    println!("Network:          {:?}", sandbox.network);

    let limits = &sandbox.limits;
    println!(
        "Limits:           {}s run, {}s compile, {} MB, {}% cpu, {} output bytes",
        limits.timeout.as_secs(),
        limits.compile_timeout.as_secs(),
        limits.memory_bytes / (1024 * 1024),
        limits.cpu_percent,
        limits.max_output_bytes
    );

    let mut languages: Vec<&String> = sandbox.languages.keys().collect();
    languages.sort();
    println!(
        "Languages:        {} (default: {})",
        languages
            .iter()
            .map(|s| s.as_str())
            .collect::<Vec<_>>()
            .join(", "),
        sandbox.default_language
    );
    println!();

    let mut all_ok = true;
    if let Err(e) = sandbox.validate() {
        println!("❌ Language profiles: {}", e);
        all_ok = false;
    }
    if let Err(e) = sandbox.select_runtime().await {
        println!("❌ {}", e);
        all_ok = false;
    } else if !runtime.is_isolated() {
        println!("⚠️  Programs will run directly on this host");
    }
    if let Err(e) = validate_production_config(&config) {
        println!("❌ {}", e);
        all_ok = false;
    }

    if all_ok {
        println!("✅ Configuration OK");
    } else {
        println!("⚠️  Some checks failed. Please fix the issues above.");
        std::process::exit(1);
    }
    Ok(())
}
