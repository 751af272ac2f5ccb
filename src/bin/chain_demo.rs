//==============================================================================
// Task Chain Demo
//==============================================================================
//
// Usage: chain_demo [config.toml]
//
// Without an argument, `chain_demo.toml` in the working directory is used if
// it exists, otherwise the built-in defaults.

use anyhow::Context;
use colored::Colorize;
use std::env;
use std::path::Path;
use task_chain::{demo, logging, DemoConfig, WorkerPool};
use tracing::info;

const DEFAULT_CONFIG: &str = "chain_demo.toml";

fn load_config() -> anyhow::Result<DemoConfig> {
    match env::args().nth(1) {
        Some(path) => DemoConfig::load(&path).with_context(|| format!("loading {}", path)),
        None if Path::new(DEFAULT_CONFIG).exists() => {
            DemoConfig::load(DEFAULT_CONFIG).with_context(|| format!("loading {}", DEFAULT_CONFIG))
        }
        None => Ok(DemoConfig::default()),
    }
}

fn main() -> anyhow::Result<()> {
    logging::init();
    let config = load_config()?;
    info!(workers = config.pool.workers, source = %config.driver.source, "configuration loaded");

    println!("{}", "=== Task Chain Demo ===".bold());
    println!("Main thread: {}", demo::current_thread_name());

    let pool = WorkerPool::with_config(&config.pool)?;
    let outcome = demo::run(&config.driver, &pool);
    // Stop the workers even if the chain could not be launched.
    pool.shutdown();

    let result = outcome?;
    if result == demo::FALLBACK_RESULT {
        println!("Final outcome: {}", result.red());
    } else {
        println!("Final outcome: {}", result.green());
    }
    Ok(())
}
