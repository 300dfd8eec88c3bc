//! Connection state machine and the reactor that drives it.

pub mod connection;
pub mod event_loop;

use crate::config::Config;
use crate::net::socket::AddrError;
use crate::proxy::connection::ConnectionHooks;
use std::rc::Rc;

/// Startup and runtime failures of the proxy itself. All of these are
/// fatal to the process; per-connection failures never surface here.
#[derive(Debug)]
pub enum Error {
    /// The listen address did not parse.
    Address(AddrError),
    /// Binding the listener failed (address in use, permission, ...).
    Bind(std::io::Error),
    /// The event loop itself failed.
    Io(std::io::Error),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::Address(e) => write!(f, "invalid listen address: {e}"),
            Error::Bind(e) => write!(f, "failed to bind listener: {e}"),
            Error::Io(e) => write!(f, "event loop error: {e}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Address(e) => Some(e),
            Error::Bind(e) | Error::Io(e) => Some(e),
        }
    }
}

/// Run the proxy with the given hook table wired into every accepted
/// connection.
pub fn run(config: &Config, hooks: Rc<dyn ConnectionHooks>) -> Result<(), Error> {
    event_loop::run(config, hooks)
}
