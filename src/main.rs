//! sqlgate: a scriptable MySQL-protocol debug proxy
//!
//! Speaks the server side of the MySQL wire protocol and answers every
//! query by evaluating it as Lua in a shared, process-wide interpreter.
//! Scalars come back as a one-cell result set, flat tables as a single
//! row, nested tables as a multi-row result set.

mod config;
mod mysql;
mod net;
mod plugins;
mod proxy;
mod script;

use config::Config;
use plugins::debug::DebugHandler;
use std::rc::Rc;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::load()?;

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        address = %config.address,
        max_connections = config.max_connections,
        "Starting sqlgate debug proxy"
    );

    proxy::run(&config, Rc::new(DebugHandler))?;
    Ok(())
}
