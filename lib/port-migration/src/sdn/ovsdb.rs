// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! A minimal OVSDB (RFC 7047) JSON-RPC client.
//!
//! OVSDB messages are bare JSON objects written back-to-back on a TCP stream
//! with no length prefix or delimiter, so the framing layer has to find the
//! end of each value itself. [`JsonRpcFramer`] does that and hands complete
//! values to [`OvsdbClient`], which correlates replies to requests by id and
//! answers the server's `echo` keepalives.
//!
//! The client holds at most one connection. A connection is taken out of the
//! client for the duration of a call and only returned once the call has seen
//! its reply, so a call abandoned mid-flight (e.g. by a timeout) drops the
//! connection rather than leaving a half-read stream behind for the next
//! caller.

use std::sync::atomic::{AtomicU64, Ordering};

use bytes::{Buf, BufMut, BytesMut};
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use slog::{debug, warn, Logger};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio_util::codec::{self, Framed};

use super::SdnError;

/// Errors from the OVSDB framing layer.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed JSON: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<ProtocolError> for SdnError {
    fn from(err: ProtocolError) -> Self {
        match err {
            ProtocolError::Io(e) => SdnError::Transport(e.to_string()),
            ProtocolError::Json(e) => SdnError::Protocol(e.to_string()),
        }
    }
}

/// Splits a byte stream into consecutive JSON values.
#[derive(Debug, Default)]
pub struct JsonRpcFramer;

impl JsonRpcFramer {
    pub fn new() -> Self {
        Self
    }
}

impl codec::Encoder<Value> for JsonRpcFramer {
    type Error = ProtocolError;

    fn encode(&mut self, v: Value, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let bytes = serde_json::to_vec(&v)?;
        dst.reserve(bytes.len());
        dst.put(&bytes[..]);
        Ok(())
    }
}

impl codec::Decoder for JsonRpcFramer {
    type Item = Value;
    type Error = ProtocolError;

    fn decode(
        &mut self,
        src: &mut BytesMut,
    ) -> Result<Option<Self::Item>, Self::Error> {
        let mut stream =
            serde_json::Deserializer::from_slice(&src[..]).into_iter::<Value>();
        match stream.next() {
            Some(Ok(value)) => {
                let consumed = stream.byte_offset();
                src.advance(consumed);
                Ok(Some(value))
            }
            // The value is still arriving.
            Some(Err(e)) if e.is_eof() => Ok(None),
            Some(Err(e)) => Err(e.into()),
            None => {
                // Nothing but whitespace.
                src.clear();
                Ok(None)
            }
        }
    }
}

type Conn = Framed<TcpStream, JsonRpcFramer>;

/// A JSON-RPC client for a single OVSDB server.
pub struct OvsdbClient {
    addr: String,
    conn: tokio::sync::Mutex<Option<Conn>>,
    next_id: AtomicU64,
    log: Logger,
}

impl OvsdbClient {
    /// Creates a client for the server at `addr` (`host:port`). No connection
    /// is made until the first call.
    pub fn new(addr: impl Into<String>, log: &Logger) -> Self {
        let addr = addr.into();
        let log = log.new(slog::o!("ovsdb" => addr.clone()));
        Self {
            addr,
            conn: tokio::sync::Mutex::new(None),
            next_id: AtomicU64::new(1),
            log,
        }
    }

    /// Runs `ops` as one atomic transaction against `db` and returns the
    /// per-operation results.
    pub async fn transact(
        &self,
        db: &str,
        ops: Vec<Value>,
    ) -> Result<Vec<Value>, SdnError> {
        let count = ops.len();
        let mut params = Vec::with_capacity(count + 1);
        params.push(Value::from(db));
        params.extend(ops);

        let result = self.call("transact", Value::Array(params)).await?;
        let Value::Array(results) = result else {
            return Err(SdnError::Protocol(format!(
                "transact result is not an array: {result}"
            )));
        };

        // A failed transaction reports the error on the offending operation
        // (or on an extra trailing element for commit failures) and leaves
        // the remaining entries null.
        if let Some(err) = results.iter().find_map(op_error) {
            return Err(SdnError::Rpc(err));
        }
        if results.len() < count {
            return Err(SdnError::Protocol(format!(
                "expected {count} results, got {}",
                results.len()
            )));
        }

        Ok(results)
    }

    async fn call(&self, method: &str, params: Value) -> Result<Value, SdnError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut slot = self.conn.lock().await;
        let mut conn = match slot.take() {
            Some(conn) => conn,
            None => self.connect().await?,
        };

        let request = json!({ "method": method, "params": params, "id": id });
        conn.send(request).await?;

        loop {
            let msg = match conn.next().await {
                Some(msg) => msg?,
                None => {
                    return Err(SdnError::Transport(
                        "connection closed by server".to_string(),
                    ));
                }
            };

            if msg.get("method").and_then(Value::as_str) == Some("echo") {
                let reply = json!({
                    "result": msg.get("params").cloned().unwrap_or(json!([])),
                    "error": Value::Null,
                    "id": msg.get("id").cloned().unwrap_or(Value::Null),
                });
                conn.send(reply).await?;
                continue;
            }

            if msg.get("id").and_then(Value::as_u64) != Some(id) {
                debug!(self.log, "discarding unrelated message"; "msg" => %msg);
                continue;
            }

            *slot = Some(conn);
            return match msg.get("error") {
                Some(err) if !err.is_null() => Err(SdnError::Rpc(err.to_string())),
                _ => Ok(msg.get("result").cloned().unwrap_or(Value::Null)),
            };
        }
    }

    async fn connect(&self) -> Result<Conn, SdnError> {
        debug!(self.log, "connecting");
        let stream = TcpStream::connect(&self.addr).await.map_err(|e| {
            warn!(self.log, "failed to connect"; "error" => %e);
            SdnError::Transport(format!("connecting to {}: {e}", self.addr))
        })?;
        Ok(Framed::new(stream, JsonRpcFramer::new()))
    }
}

fn op_error(result: &Value) -> Option<String> {
    let err = result.get("error")?.as_str()?;
    match result.get("details").and_then(Value::as_str) {
        Some(details) => Some(format!("{err}: {details}")),
        None => Some(err.to_string()),
    }
}

/// Builds an OVSDB condition on `column`.
pub fn condition(column: &str, function: &str, value: Value) -> Value {
    json!([column, function, value])
}

pub fn select(table: &str, conditions: Vec<Value>, columns: &[&str]) -> Value {
    json!({
        "op": "select",
        "table": table,
        "where": conditions,
        "columns": columns,
    })
}

pub fn update(table: &str, conditions: Vec<Value>, row: Value) -> Value {
    json!({
        "op": "update",
        "table": table,
        "where": conditions,
        "row": row,
    })
}

pub fn mutate(table: &str, conditions: Vec<Value>, mutations: Vec<Value>) -> Value {
    json!({
        "op": "mutate",
        "table": table,
        "where": conditions,
        "mutations": mutations,
    })
}

/// Fails the whole transaction unless the rows matching `conditions` are
/// exactly `rows` (projected onto `columns`).
pub fn wait_until_equal(
    table: &str,
    conditions: Vec<Value>,
    columns: &[&str],
    rows: Vec<Value>,
) -> Value {
    json!({
        "op": "wait",
        "table": table,
        "where": conditions,
        "columns": columns,
        "until": "==",
        "rows": rows,
        "timeout": 0,
    })
}

/// Returns the `rows` of a `select` result.
pub fn result_rows(result: &Value) -> Result<&Vec<Value>, SdnError> {
    result.get("rows").and_then(Value::as_array).ok_or_else(|| {
        SdnError::Protocol(format!("select result has no rows: {result}"))
    })
}

/// Returns the `count` of an `update` or `mutate` result.
pub fn result_count(result: &Value) -> Result<u64, SdnError> {
    result.get("count").and_then(Value::as_u64).ok_or_else(|| {
        SdnError::Protocol(format!("result has no count: {result}"))
    })
}

/// Decodes a column holding an optional uuid, which OVSDB encodes either as
/// the atom `["uuid", "<id>"]` or as a set of zero or one such atoms.
pub fn optional_uuid(value: &Value) -> Result<Option<String>, SdnError> {
    let bad = || SdnError::Protocol(format!("not a uuid column: {value}"));
    let pair = value.as_array().ok_or_else(bad)?;
    match (pair.first().and_then(Value::as_str), pair.get(1)) {
        (Some("uuid"), Some(Value::String(id))) => Ok(Some(id.clone())),
        (Some("set"), Some(Value::Array(members))) => match members.as_slice() {
            [] => Ok(None),
            [only] => optional_uuid(only),
            _ => Err(bad()),
        },
        _ => Err(bad()),
    }
}
