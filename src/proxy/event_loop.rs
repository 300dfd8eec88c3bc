//! mio event loop.
//!
//! Readiness-based model: poll tells us when sockets are ready, then we
//! perform non-blocking read/write syscalls. One thread multiplexes the
//! listener and every accepted connection; hooks run to completion on
//! this thread, so the shared Lua context is never entered concurrently.

use crate::config::Config;
use crate::net::socket::{parse_addr, ReadState, SendState, Socket};
use crate::proxy::connection::{Connection, ConnectionHooks, Wait};
use crate::proxy::Error;
use crate::script::ScriptEngine;
use mio::net::TcpListener;
use mio::{Events, Interest, Poll, Token};
use slab::Slab;
use std::io;
use std::net::SocketAddr;
use std::rc::Rc;
use tracing::{debug, error, info, warn};

const LISTENER_TOKEN: Token = Token(usize::MAX);

/// Run the proxy until the process is terminated.
pub fn run(config: &Config, hooks: Rc<dyn ConnectionHooks>) -> Result<(), Error> {
    let addr = parse_addr(&config.address).map_err(Error::Address)?;

    let mut poll = Poll::new().map_err(Error::Io)?;
    let mut events = Events::with_capacity(256);

    let listener = create_listener(addr).map_err(Error::Bind)?;
    let mut listener = TcpListener::from_std(listener);
    poll.registry()
        .register(&mut listener, LISTENER_TOKEN, Interest::READABLE)
        .map_err(Error::Io)?;

    // One Lua state for the whole process, shared across connections.
    let scripts = ScriptEngine::new();
    let mut connections: Slab<Connection> = Slab::with_capacity(config.max_connections);

    info!(addr = %addr, "listening");

    loop {
        poll.poll(&mut events, None).map_err(Error::Io)?;

        for event in events.iter() {
            match event.token() {
                LISTENER_TOKEN => accept_connections(
                    &listener,
                    &mut poll,
                    &mut connections,
                    &hooks,
                    &scripts,
                    config.max_connections,
                ),
                Token(conn_id) => {
                    if let Err(e) =
                        handle_connection_event(conn_id, &mut poll, &mut connections, &scripts)
                    {
                        debug!(conn_id, error = %e, "connection error");
                        close_connection(&mut poll, &mut connections, conn_id);
                    }
                }
            }
        }
    }
}

fn accept_connections(
    listener: &TcpListener,
    poll: &mut Poll,
    connections: &mut Slab<Connection>,
    hooks: &Rc<dyn ConnectionHooks>,
    scripts: &ScriptEngine,
    max_connections: usize,
) {
    loop {
        match listener.accept() {
            Ok((stream, peer)) => {
                if connections.len() >= max_connections {
                    warn!(peer = %peer, "connection limit reached, rejecting");
                    continue;
                }

                let socket = Socket::from_stream(stream, peer);
                let conn_id = connections.insert(Connection::new(socket, Rc::clone(hooks)));

                let conn = &mut connections[conn_id];
                if let Some(stream) = conn.client.stream_mut() {
                    if let Err(e) =
                        poll.registry()
                            .register(stream, Token(conn_id), Interest::READABLE)
                    {
                        error!(conn_id, error = %e, "failed to register connection");
                        connections.remove(conn_id);
                        continue;
                    }
                }
                debug!(conn_id, peer = %peer, "accepted connection");

                // Run the machine through INIT so the greeting goes out
                // before the client's first bytes arrive.
                if let Err(e) = drive(conn_id, poll, connections, scripts) {
                    debug!(conn_id, error = %e, "connection failed during greeting");
                    close_connection(poll, connections, conn_id);
                }
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
            Err(e) => {
                error!(error = %e, "accept failed");
                break;
            }
        }
    }
}

fn handle_connection_event(
    conn_id: usize,
    poll: &mut Poll,
    connections: &mut Slab<Connection>,
    scripts: &ScriptEngine,
) -> io::Result<()> {
    let conn = match connections.get_mut(conn_id) {
        Some(conn) => conn,
        None => return Ok(()),
    };

    // Pull whatever arrived; reassembly is incremental and a partial
    // packet simply waits for the next readiness event.
    if conn.client.fill_recv()? == ReadState::Eof {
        return Err(io::Error::new(io::ErrorKind::ConnectionReset, "EOF"));
    }

    drive(conn_id, poll, connections, scripts)
}

/// Advance the state machine, flushing queued output between steps, then
/// point the readiness registration at whatever the machine waits for.
fn drive(
    conn_id: usize,
    poll: &mut Poll,
    connections: &mut Slab<Connection>,
    scripts: &ScriptEngine,
) -> io::Result<()> {
    let wait = {
        let conn = match connections.get_mut(conn_id) {
            Some(conn) => conn,
            None => return Ok(()),
        };
        loop {
            match conn.advance(scripts) {
                Wait::Write => match conn.client.drain_send()? {
                    SendState::Flushed => continue,
                    SendState::Partial => break Wait::Write,
                },
                other => break other,
            }
        }
    };

    if wait == Wait::Closed {
        close_connection(poll, connections, conn_id);
        return Ok(());
    }

    let interest = if wait == Wait::Read {
        Interest::READABLE
    } else {
        Interest::WRITABLE
    };
    if let Some(conn) = connections.get_mut(conn_id) {
        if let Some(stream) = conn.client.stream_mut() {
            poll.registry().reregister(stream, Token(conn_id), interest)?;
        }
    }
    Ok(())
}

/// Tear down one connection: deregister before the descriptor closes,
/// then release its queues and buffers. Other connections are unaffected.
fn close_connection(poll: &mut Poll, connections: &mut Slab<Connection>, conn_id: usize) {
    if let Some(mut conn) = connections.try_remove(conn_id) {
        if let Some(stream) = conn.client.stream_mut() {
            let _ = poll.registry().deregister(stream);
        }
        conn.close();
        debug!(conn_id, "connection closed");
    }
}

/// Create a non-blocking listener with address reuse enabled.
fn create_listener(addr: SocketAddr) -> io::Result<std::net::TcpListener> {
    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(128)?;

    Ok(socket.into())
}
