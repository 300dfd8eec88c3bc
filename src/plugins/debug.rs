//! Debug handler: a server-side persona that answers queries by
//! evaluating them as Lua.
//!
//! Gives access to anything the proxy exports into Lua. Every query is
//! evaluated as a chunk and the result comes back as a result set or an
//! error packet. Two introspection queries the stock mysql shell sends
//! on connect are answered with canned rows so the shell starts up
//! cleanly. All output is text; this handler is read-only tooling and
//! never verifies credentials.

use crate::mysql::response::{self, Field, Handshake, Row};
use crate::mysql::wire::{PacketReader, WireError};
use crate::mysql::{capability, command, status};
use crate::net::packet::{FrameError, Packet};
use crate::proxy::connection::{Connection, ConnectionHooks, HookResult};
use crate::script::{ScriptEngine, ScriptKey, ScriptValue};
use tracing::debug;

const SERVER_VERSION: &str = "5.1.20-proxy-debug";
const SCRAMBLE: [u8; 8] = *b"\x3a\x23\x3d\x4b\x43\x4a\x2e\x43";

/// Placeholder column name for keys that are neither strings nor numbers.
const OPAQUE_KEY_NAME: &str = "(hmm)";

/// The reference hook implementation.
#[derive(Debug, Default)]
pub struct DebugHandler;

impl ConnectionHooks for DebugHandler {
    fn on_init(&self, con: &mut Connection, _scripts: &ScriptEngine) -> HookResult {
        let handshake = Handshake {
            protocol_version: 10,
            server_version: SERVER_VERSION.to_string(),
            thread_id: 1,
            scramble: SCRAMBLE,
            capabilities: capability::CLIENT_PROTOCOL_41,
            language: 8,
            status: status::SERVER_STATUS_AUTOCOMMIT,
        };
        let payload = handshake.encode();
        con.client.scramble_seed = SCRAMBLE.to_vec();
        con.client.handshake_cache = Some(payload.clone());
        reply(con.client.queue_reply(&payload))
    }

    fn on_read_auth(
        &self,
        con: &mut Connection,
        packet: &Packet,
        _scripts: &ScriptEngine,
    ) -> HookResult {
        // Record what the client sent, but accept any credentials.
        if let Err(e) = parse_auth(con, packet) {
            debug!(error = %e, "could not parse auth packet, accepting anyway");
        }
        con.client.bump_packet_id();
        reply(response::send_ok(&mut con.client))
    }

    fn on_read_query(
        &self,
        con: &mut Connection,
        packet: &Packet,
        scripts: &ScriptEngine,
    ) -> HookResult {
        let mut reader = PacketReader::new(&packet.payload);
        let cmd = match reader.take_u8() {
            Ok(cmd) => cmd,
            Err(_) => return HookResult::Abort("empty command packet".to_string()),
        };

        match cmd {
            command::COM_QUERY => {
                let text = String::from_utf8_lossy(reader.take_rest()).into_owned();
                con.client.bump_packet_id();
                self.handle_query(con, &text, scripts)
            }
            command::COM_QUIT => HookResult::Close,
            command::COM_INIT_DB => {
                con.client.default_db = String::from_utf8_lossy(reader.take_rest()).into_owned();
                con.client.bump_packet_id();
                reply(response::send_ok(&mut con.client))
            }
            other => {
                debug!(command = other, "unrecognized command");
                con.client.bump_packet_id();
                reply(response::send_error(&mut con.client, "unknown COM_*"))
            }
        }
    }
}

impl DebugHandler {
    fn handle_query(
        &self,
        con: &mut Connection,
        text: &str,
        scripts: &ScriptEngine,
    ) -> HookResult {
        // The basic commands the mysql shell sends on startup.
        if text.eq_ignore_ascii_case("select @@version_comment limit 1") {
            return reply(response::send_resultset(
                &mut con.client,
                &[Field::named("@@version_comment")],
                &[vec![Some("MySQL Enterprise Agent".to_string())]],
            ));
        }
        if text.eq_ignore_ascii_case("select USER()") {
            return reply(response::send_resultset(
                &mut con.client,
                &[Field::named("USER()")],
                &[vec![Some("root".to_string())]],
            ));
        }

        match scripts.eval(text) {
            Ok(value) => {
                let (fields, rows) = value_to_resultset(value);
                reply(response::send_resultset(&mut con.client, &fields, &rows))
            }
            Err(e) => reply(response::send_error(&mut con.client, &e.to_string())),
        }
    }
}

/// Convert a classified script result into result-set fields and rows.
///
/// Scalars become a one-cell result set whose column is named `lua`.
/// Flat tables become a single row with one column per key. Nested
/// tables become one row per sub-table, with columns taken only from the
/// first sub-table's keys; later rows fill cells positionally in their
/// own iteration order even when their keys differ.
fn value_to_resultset(value: ScriptValue) -> (Vec<Field>, Vec<Row>) {
    match value {
        ScriptValue::Scalar(cell) => (vec![Field::named("lua")], vec![vec![cell]]),
        ScriptValue::Flat(entries) => {
            if entries.is_empty() {
                return (Vec::new(), Vec::new());
            }
            let mut fields = Vec::with_capacity(entries.len());
            let mut row = Vec::with_capacity(entries.len());
            for (key, cell) in entries {
                fields.push(Field::named(key_to_field_name(&key)));
                row.push(cell);
            }
            (fields, vec![row])
        }
        ScriptValue::Nested(raw_rows) => {
            let fields = match raw_rows.first() {
                Some(first) => first
                    .iter()
                    .map(|(key, _)| Field::named(key_to_field_name(key)))
                    .collect(),
                None => Vec::new(),
            };
            let rows = raw_rows
                .into_iter()
                .map(|entries| entries.into_iter().map(|(_, cell)| cell).collect())
                .collect();
            (fields, rows)
        }
    }
}

fn key_to_field_name(key: &ScriptKey) -> String {
    match key {
        ScriptKey::Str(s) => s.clone(),
        ScriptKey::Int(i) => i.to_string(),
        ScriptKey::Opaque => OPAQUE_KEY_NAME.to_string(),
    }
}

/// Best-effort extraction of the 4.1 auth packet into the socket scratch.
fn parse_auth(con: &mut Connection, packet: &Packet) -> Result<(), WireError> {
    let mut reader = PacketReader::new(&packet.payload);
    reader.take_u32_le()?; // client capabilities
    reader.take_u32_le()?; // max packet size
    reader.take_u8()?; // charset
    reader.skip(23)?; // filler
    con.client.username = reader.take_nul_str()?.to_string();
    let scramble_len = reader.take_lenenc_int()? as usize;
    con.client.scrambled_password = reader.take_bytes(scramble_len)?.to_vec();
    if reader.remaining() > 0 {
        con.client.default_db = reader.take_nul_str()?.to_string();
    }
    Ok(())
}

fn reply(result: Result<(), FrameError>) -> HookResult {
    match result {
        Ok(()) => HookResult::Continue,
        Err(e) => HookResult::Abort(e.to_string()),
    }
}
