//! The fetch -> process -> finalize driver behind `chain_demo`.
//!
//! Stage functions print which thread ran them; that output is for
//! watching the demo and is not part of the logging setup.

use crate::chain::{Chain, ChainHandle};
use crate::config::DriverConfig;
use crate::error::{PoolError, TaskError};
use crate::pool::WorkerPool;
use std::thread;
use std::time::Duration;
use tracing::{info, warn};

pub const FALLBACK_RESULT: &str = "Error Result";

pub fn current_thread_name() -> String {
    thread::current().name().unwrap_or("unnamed").to_string()
}

/// Simulates a slow read from `source`.
pub fn fetch_data(source: &str, delay: Duration, fail: bool) -> Result<String, TaskError> {
    println!(
        "Fetching data from {} on thread: {}",
        source,
        current_thread_name()
    );
    thread::sleep(delay);
    if fail {
        return Err(TaskError::execution(format!("{} is unavailable", source)));
    }
    Ok(format!("Data from {}", source))
}

pub fn process_data(data: &str, delay: Duration) -> Result<String, TaskError> {
    println!(
        "Processing data '{}' on thread: {}",
        data,
        current_thread_name()
    );
    thread::sleep(delay);
    Ok(data.to_uppercase())
}

pub fn finalize(data: &str) -> Result<String, TaskError> {
    Ok(format!("Final Result: {}", data))
}

pub fn recover(err: TaskError) -> String {
    eprintln!("An error occurred: {}", err);
    FALLBACK_RESULT.to_string()
}

/// Builds and launches the three-stage chain described by `config`.
pub fn launch(config: &DriverConfig, pool: &WorkerPool) -> Result<ChainHandle<String>, PoolError> {
    let source = config.source.clone();
    let fetch_delay = config.fetch_delay();
    let fail_fetch = config.fail_fetch;
    let process_delay = config.process_delay();

    Chain::supply_async(pool, move || fetch_data(&source, fetch_delay, fail_fetch))
        .then_apply_async(move |data| process_data(&data, process_delay))
        .then_apply(|data| finalize(&data))
        .exceptionally(recover)
}

/// Submits the chain, does unrelated work, then blocks for the outcome.
///
/// Only a pool that is already closed produces an error; any stage failure
/// comes back as the fallback's value.
///
/// With `wait_timeout` set, the wait happens in two phases: a bounded wait,
/// then a warning and an unbounded wait, since running stages cannot be
/// cancelled. Without it there is a single blocking wait. Both paths return
/// the chain's one terminal value.
pub fn run(config: &DriverConfig, pool: &WorkerPool) -> Result<String, PoolError> {
    let handle = launch(config, pool)?;
    println!("Tasks submitted, main thread continuing...");
    thread::sleep(config.other_work());

    println!("Waiting for result...");
    let result = match config.wait_timeout() {
        Some(timeout) => match handle.join_timeout(timeout) {
            Ok(result) => result,
            Err(handle) => {
                // Stages cannot be cancelled, so keep waiting.
                warn!(
                    timeout_ms = timeout.as_millis() as u64,
                    "chain still running after timeout"
                );
                handle.join()
            }
        },
        None => handle.join(),
    };

    info!(result = %result, "chain finished");
    Ok(result)
}
