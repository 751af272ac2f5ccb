//! # Task Chain
//!
//! A fixed-size worker pool and a small task-chaining API on top of it:
//! stages run one after another, each consuming the previous stage's
//! output, and a single fallback turns any failure into a substitute final
//! value.
//!
//! ## Modules
//!
//! 1. **pool** - named worker threads, `submit`/`execute`/`shutdown`
//! 2. **chain** - `supply_async` -> `then_apply_async` -> `then_apply` -> `exceptionally`
//! 3. **demo** - the fetch/process/finalize driver used by `chain_demo`
//! 4. **config** - TOML settings for the pool and the driver
//! 5. **logging** - `tracing` subscriber setup
//!
//! ## Running
//!
//! ```bash
//! cargo run --bin chain_demo
//! cargo run --bin chain_demo -- chain_demo.toml
//! RUST_LOG=task_chain=debug cargo run --bin chain_demo
//! ```

pub mod chain;
pub mod config;
pub mod demo;
pub mod error;
mod guard;
pub mod logging;
pub mod pool;

pub use chain::{Chain, ChainHandle, ChainState};
pub use config::{DemoConfig, DriverConfig, PoolConfig};
pub use error::{ConfigError, PoolError, TaskError};
pub use pool::{TaskHandle, WorkerPool};
