//! Per-connection state machine and the hook protocol plugins implement.
//!
//! Each connection steps through handshake, auth and query phases. The
//! hooks for the input states receive one fully assembled packet at a
//! time; output states are drained by the event loop before the next
//! read, so a handler's response is always flushed before more input is
//! consumed.

use crate::net::packet::Packet;
use crate::net::socket::Socket;
use crate::script::ScriptEngine;
use std::rc::Rc;
use tracing::{debug, warn};

/// Connection lifecycle states.
///
/// `Init` is the only entry state; `Closed` is terminal. A full proxy
/// would add backend connect/handshake states between these.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Init,
    SendHandshake,
    ReadAuth,
    SendAuthResult,
    ReadQuery,
    SendQueryResult,
    Closed,
}

impl ConnState {
    /// Successor per the static transition table.
    pub fn next(self) -> ConnState {
        match self {
            ConnState::Init => ConnState::SendHandshake,
            ConnState::SendHandshake => ConnState::ReadAuth,
            ConnState::ReadAuth => ConnState::SendAuthResult,
            ConnState::SendAuthResult => ConnState::ReadQuery,
            ConnState::ReadQuery => ConnState::SendQueryResult,
            ConnState::SendQueryResult => ConnState::ReadQuery,
            ConnState::Closed => ConnState::Closed,
        }
    }

    /// States that consume an assembled packet.
    pub fn wants_input(self) -> bool {
        matches!(self, ConnState::ReadAuth | ConnState::ReadQuery)
    }

    /// States that must flush queued output before the machine advances.
    pub fn wants_output(self) -> bool {
        matches!(
            self,
            ConnState::SendHandshake | ConnState::SendAuthResult | ConnState::SendQueryResult
        )
    }
}

/// Outcome of one hook invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HookResult {
    /// Advance to the next state.
    Continue,
    /// Tear the connection down cleanly, no reply.
    Close,
    /// Tear the connection down with an error.
    Abort(String),
}

/// Per-state handlers a plugin supplies.
///
/// Every method defaults to success, so a handler overrides only the
/// states it participates in.
pub trait ConnectionHooks {
    /// Invoked once when the connection enters the machine; expected to
    /// queue the server greeting.
    fn on_init(&self, _con: &mut Connection, _scripts: &ScriptEngine) -> HookResult {
        HookResult::Continue
    }

    /// Invoked with the client's authentication packet.
    fn on_read_auth(
        &self,
        _con: &mut Connection,
        _packet: &Packet,
        _scripts: &ScriptEngine,
    ) -> HookResult {
        HookResult::Continue
    }

    /// Invoked with each command packet.
    fn on_read_query(
        &self,
        _con: &mut Connection,
        _packet: &Packet,
        _scripts: &ScriptEngine,
    ) -> HookResult {
        HookResult::Continue
    }
}

/// What the state machine is waiting for after advancing as far as it
/// can without blocking.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wait {
    /// Needs more inbound bytes.
    Read,
    /// Needs the send queue flushed.
    Write,
    /// The connection is finished; release its resources.
    Closed,
}

/// One proxied client connection.
pub struct Connection {
    /// Client-facing endpoint.
    pub client: Socket,
    /// Backend endpoint; wired by proxy plugins, unused by this core.
    pub backend: Option<Socket>,
    /// Current machine state.
    pub state: ConnState,
    hooks: Rc<dyn ConnectionHooks>,
}

impl Connection {
    /// Create a connection with its hook table wired in. The host calls
    /// this before the first readiness event.
    pub fn new(client: Socket, hooks: Rc<dyn ConnectionHooks>) -> Self {
        Self {
            client,
            backend: None,
            state: ConnState::Init,
            hooks,
        }
    }

    /// Drive the state machine until it needs I/O or terminates.
    ///
    /// Input states pop one assembled packet per step; if none is ready
    /// the machine simply waits (not an error). Output states report
    /// `Wait::Write` until the event loop has flushed the send queue.
    pub fn advance(&mut self, scripts: &ScriptEngine) -> Wait {
        loop {
            match self.state {
                ConnState::Init => {
                    let hooks = Rc::clone(&self.hooks);
                    let result = hooks.on_init(self, scripts);
                    if let Some(wait) = self.apply(result) {
                        return wait;
                    }
                }
                state if state.wants_output() => {
                    if self.client.has_pending_send() {
                        return Wait::Write;
                    }
                    self.state = state.next();
                }
                state if state.wants_input() => {
                    let packet = match self.client.next_packet() {
                        Some(packet) => packet,
                        None => return Wait::Read,
                    };
                    let hooks = Rc::clone(&self.hooks);
                    let result = match state {
                        ConnState::ReadAuth => hooks.on_read_auth(self, &packet, scripts),
                        _ => hooks.on_read_query(self, &packet, scripts),
                    };
                    if let Some(wait) = self.apply(result) {
                        return wait;
                    }
                }
                _ => return Wait::Closed,
            }
        }
    }

    /// Apply a hook result: advance, or terminate the connection.
    fn apply(&mut self, result: HookResult) -> Option<Wait> {
        match result {
            HookResult::Continue => {
                self.state = self.state.next();
                None
            }
            HookResult::Close => {
                debug!(peer = ?self.client.peer(), "connection closing");
                self.state = ConnState::Closed;
                Some(Wait::Closed)
            }
            HookResult::Abort(reason) => {
                warn!(peer = ?self.client.peer(), %reason, "connection aborted by hook");
                self.state = ConnState::Closed;
                Some(Wait::Closed)
            }
        }
    }

    /// Release the connection's sockets and buffers.
    pub fn close(&mut self) {
        self.state = ConnState::Closed;
        self.client.close();
        if let Some(backend) = self.backend.as_mut() {
            backend.close();
        }
    }
}
