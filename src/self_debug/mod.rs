use std::fmt;
use std::net::{SocketAddr, TcpStream};
use std::sync::mpsc::{self, Receiver};
use std::time::Duration;

use chrono::Utc;
use rmpv::Value;

use crate::broker::TicketFlags;
use crate::wire::codec::{CodecError, FrameRead, WireCodec};
use crate::wire::envelope::{
    EnvelopeError, PayloadMap, WireEnvelope, SERVER_ERR_MESSAGE_TYPE, SERVER_OK_MESSAGE_TYPE,
};
use crate::wire::handshake::{HELLO_MESSAGE_TYPE, HI_MESSAGE_TYPE};
use crate::wire::session::{
    GETTICKET_MESSAGE_TYPE, NO_MESSAGE_CODE, PING_MESSAGE_TYPE, PONG_MESSAGE_TYPE,
    RECEIVE_MESSAGE_TYPE, REGISTER_MESSAGE_TYPE, SEND_MESSAGE_TYPE, STATUS_MESSAGE_TYPE,
    UNMATCHED_TICKET_CODE,
};

const COLOR_HEADER: &str = "\x1b[38;5;214m";
const COLOR_OUT: &str = "\x1b[38;5;81m";
const COLOR_IN: &str = "\x1b[38;5;120m";
const COLOR_ERROR: &str = "\x1b[38;5;196m";
const COLOR_DIM: &str = "\x1b[2;90m";
const BOLD: &str = "\x1b[1m";
const RESET: &str = "\x1b[0m";

const SELF_DEBUG_FLAG: &str = "--self-debug";
const SELF_DEBUG_QUIET_FLAG: &str = "--self-debug-quiet";

#[derive(Debug)]
pub enum SelfDebugError {
    Io(std::io::Error),
    Codec(CodecError),
    Envelope(EnvelopeError),
    ConnectionClosed { request_id: String },
    MissingField(&'static str),
    UnexpectedResponse {
        request_id: String,
        expected: String,
        actual: String,
    },
}

impl fmt::Display for SelfDebugError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(source) => write!(f, "io error: {source}"),
            Self::Codec(source) => write!(f, "codec error: {source}"),
            Self::Envelope(source) => write!(f, "envelope error: {source}"),
            Self::ConnectionClosed { request_id } => {
                write!(f, "server closed the connection while waiting for rid='{request_id}'")
            }
            Self::MissingField(field) => write!(f, "response missing expected field '{field}'"),
            Self::UnexpectedResponse {
                request_id,
                expected,
                actual,
            } => write!(
                f,
                "unexpected response for rid='{request_id}': expected {expected}, got {actual}"
            ),
        }
    }
}

impl std::error::Error for SelfDebugError {}

impl From<std::io::Error> for SelfDebugError {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value)
    }
}

impl From<CodecError> for SelfDebugError {
    fn from(value: CodecError) -> Self {
        Self::Codec(value)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RuntimeFlags {
    pub enabled: bool,
    pub quiet: bool,
}

// Strips self-debug switches so the rest can go to the config loader.
pub fn extract_runtime_flags(args: Vec<String>) -> (RuntimeFlags, Vec<String>) {
    let mut flags = RuntimeFlags::default();
    let mut config_args = Vec::new();

    for arg in args {
        if arg == SELF_DEBUG_FLAG {
            flags.enabled = true;
        } else if arg == SELF_DEBUG_QUIET_FLAG {
            flags.enabled = true;
            flags.quiet = true;
        } else {
            config_args.push(arg);
        }
    }

    (flags, config_args)
}

pub fn spawn_runner(
    addr: SocketAddr,
    codec: WireCodec,
    flags: RuntimeFlags,
) -> Receiver<Result<(), SelfDebugError>> {
    let (tx, rx) = mpsc::channel();
    std::thread::spawn(move || {
        let result = run_self_debug(addr, codec, flags.quiet);
        let _ = tx.send(result);
    });
    rx
}

/// Drives one scripted client session against a running broker.
///
/// Every step checks the reply type (and the error code for expected
/// failures), so a successful run covers the handshake, both ticket paths,
/// ordered delivery, single-shot retirement and the status report.
pub fn run_self_debug(addr: SocketAddr, codec: WireCodec, quiet: bool) -> Result<(), SelfDebugError> {
    let mut client = ScriptedClient::connect(addr, codec, quiet)?;
    client.banner(&format!("{COLOR_HEADER}========== SELF DEBUG MODE =========={RESET}"));
    client.banner(&format!("{COLOR_DIM}connected to local xmsgd server at {addr}{RESET}"));

    let mut hello = PayloadMap::new();
    hello.insert("user".to_owned(), Value::String("self-debug".into()));
    hello.insert("client".to_owned(), Value::String(env!("CARGO_PKG_NAME").into()));
    client.expect_type(HELLO_MESSAGE_TYPE, hello, HI_MESSAGE_TYPE)?;
    client.expect_type(PING_MESSAGE_TYPE, PayloadMap::new(), PONG_MESSAGE_TYPE)?;

    let mut getticket = PayloadMap::new();
    getticket.insert("ttl".to_owned(), Value::from(60));
    getticket.insert(
        "flags".to_owned(),
        Value::from(TicketFlags::MULTI_MESSAGE.bits()),
    );
    let issued = client.expect_type(GETTICKET_MESSAGE_TYPE, getticket, SERVER_OK_MESSAGE_TYPE)?;
    let issued_rcv = require_u32(&issued.payload, "rcv")?;
    let issued_snd = require_u32(&issued.payload, "snd")?;

    for body in ["first", "second"] {
        client.expect_type(
            SEND_MESSAGE_TYPE,
            send_payload(issued_rcv, issued_snd, body),
            SERVER_OK_MESSAGE_TYPE,
        )?;
    }
    for body in ["first", "second"] {
        let received = client.expect_type(
            RECEIVE_MESSAGE_TYPE,
            receive_payload(issued_rcv),
            SERVER_OK_MESSAGE_TYPE,
        )?;
        let delivered = received.payload.get("msg").and_then(body_text);
        if delivered.as_deref() != Some(body) {
            return Err(SelfDebugError::UnexpectedResponse {
                request_id: received.request_id,
                expected: format!("msg '{body}'"),
                actual: format!("msg {delivered:?}"),
            });
        }
    }
    client.expect_error(RECEIVE_MESSAGE_TYPE, receive_payload(issued_rcv), NO_MESSAGE_CODE)?;

    // High bit keeps the id clear of the reserved low range.
    let single_rcv = Utc::now().timestamp_subsec_nanos() | 0x8000_0000;
    let single_snd = single_rcv ^ 0x00ff_ff00;
    let mut register = PayloadMap::new();
    register.insert("rcv".to_owned(), Value::from(single_rcv));
    register.insert("snd".to_owned(), Value::from(single_snd));
    register.insert("flags".to_owned(), Value::from(TicketFlags::SINGLE_SHOT.bits()));
    client.expect_type(REGISTER_MESSAGE_TYPE, register, SERVER_OK_MESSAGE_TYPE)?;

    client.expect_error(
        SEND_MESSAGE_TYPE,
        send_payload(single_rcv, single_snd.wrapping_add(1), "forged"),
        UNMATCHED_TICKET_CODE,
    )?;
    client.expect_type(
        SEND_MESSAGE_TYPE,
        send_payload(single_rcv, single_snd, "only"),
        SERVER_OK_MESSAGE_TYPE,
    )?;
    client.expect_type(
        RECEIVE_MESSAGE_TYPE,
        receive_payload(single_rcv),
        SERVER_OK_MESSAGE_TYPE,
    )?;
    client.expect_error(
        RECEIVE_MESSAGE_TYPE,
        receive_payload(single_rcv),
        UNMATCHED_TICKET_CODE,
    )?;

    let status = client.expect_type(STATUS_MESSAGE_TYPE, PayloadMap::new(), SERVER_OK_MESSAGE_TYPE)?;
    if !status.payload.contains_key("broker") {
        return Err(SelfDebugError::MissingField("broker"));
    }

    client.banner(&format!("{COLOR_HEADER}====== SELF DEBUG MODE COMPLETE ======{RESET}"));
    Ok(())
}

struct ScriptedClient {
    stream: TcpStream,
    codec: WireCodec,
    quiet: bool,
    next_rid: u32,
}

impl ScriptedClient {
    fn connect(addr: SocketAddr, codec: WireCodec, quiet: bool) -> Result<Self, SelfDebugError> {
        let stream = TcpStream::connect(addr)?;
        stream.set_read_timeout(Some(Duration::from_secs(3)))?;
        stream.set_write_timeout(Some(Duration::from_secs(3)))?;
        Ok(Self {
            stream,
            codec,
            quiet,
            next_rid: 0,
        })
    }

    fn banner(&self, line: &str) {
        if !self.quiet {
            println!("{line}");
        }
    }

    fn expect_type(
        &mut self,
        message_type: i64,
        payload: PayloadMap,
        expected_type: i64,
    ) -> Result<WireEnvelope, SelfDebugError> {
        let response = self.round_trip(message_type, payload)?;
        if response.message_type != expected_type {
            return Err(SelfDebugError::UnexpectedResponse {
                expected: message_type_name(expected_type).to_owned(),
                actual: describe(&response),
                request_id: response.request_id,
            });
        }
        Ok(response)
    }

    fn expect_error(
        &mut self,
        message_type: i64,
        payload: PayloadMap,
        expected_code: &str,
    ) -> Result<WireEnvelope, SelfDebugError> {
        let response = self.round_trip(message_type, payload)?;
        if response.error_code() != Some(expected_code) {
            return Err(SelfDebugError::UnexpectedResponse {
                expected: format!("ERR {expected_code}"),
                actual: describe(&response),
                request_id: response.request_id,
            });
        }
        Ok(response)
    }

    fn round_trip(
        &mut self,
        message_type: i64,
        payload: PayloadMap,
    ) -> Result<WireEnvelope, SelfDebugError> {
        self.next_rid += 1;
        let request_id = format!("sd-{}", self.next_rid);
        let outgoing = WireEnvelope::new(message_type, request_id.clone(), payload);
        self.print("OUT", &outgoing, COLOR_OUT);
        self.codec.write_envelope(&mut self.stream, &outgoing.into_raw())?;

        let raw = match self.codec.read_envelope(&mut self.stream)? {
            FrameRead::Envelope(raw) => raw,
            FrameRead::Closed | FrameRead::TimedOut => {
                return Err(SelfDebugError::ConnectionClosed { request_id })
            }
        };
        let incoming = WireEnvelope::from_raw(&raw).map_err(SelfDebugError::Envelope)?;
        incoming
            .validate_server_response(&request_id)
            .map_err(SelfDebugError::Envelope)?;
        self.print("IN ", &incoming, COLOR_IN);

        if incoming.message_type == SERVER_ERR_MESSAGE_TYPE && !self.quiet {
            println!(
                "{COLOR_ERROR}self-debug received ERR for rid='{}'{RESET}",
                incoming.request_id
            );
        }
        Ok(incoming)
    }

    fn print(&self, label: &str, envelope: &WireEnvelope, color: &str) {
        if self.quiet {
            return;
        }
        let message_name = message_type_name(envelope.message_type);
        println!(
            "{color}[{label}] {BOLD}{message_name}{RESET} {}",
            envelope_to_json_line(envelope)
        );
    }
}

fn send_payload(receive_id: u32, send_id: u32, body: &str) -> PayloadMap {
    let mut payload = PayloadMap::new();
    payload.insert("rcv".to_owned(), Value::from(receive_id));
    payload.insert("snd".to_owned(), Value::from(send_id));
    payload.insert("mt".to_owned(), Value::String("SELF_DEBUG".into()));
    payload.insert("msg".to_owned(), Value::Binary(body.as_bytes().to_vec()));
    payload
}

fn receive_payload(receive_id: u32) -> PayloadMap {
    let mut payload = PayloadMap::new();
    payload.insert("rcv".to_owned(), Value::from(receive_id));
    payload
}

fn body_text(value: &Value) -> Option<String> {
    match value {
        Value::Binary(bytes) => Some(String::from_utf8_lossy(bytes).into_owned()),
        Value::String(text) => text.as_str().map(str::to_owned),
        _ => None,
    }
}

fn describe(envelope: &WireEnvelope) -> String {
    match envelope.error_code() {
        Some(code) => format!("ERR {code}"),
        None => message_type_name(envelope.message_type).to_owned(),
    }
}

fn envelope_to_json_line(envelope: &WireEnvelope) -> String {
    let payload = value_to_json(&Value::Map(
        envelope
            .payload
            .iter()
            .map(|(k, v)| (Value::String(k.as_str().into()), v.clone()))
            .collect(),
    ));
    serde_json::json!({
        "v": envelope.version,
        "t": envelope.message_type,
        "rid": envelope.request_id,
        "p": payload
    })
    .to_string()
}

fn value_to_json(value: &Value) -> serde_json::Value {
    match value {
        Value::Nil => serde_json::Value::Null,
        Value::Boolean(v) => serde_json::Value::Bool(*v),
        Value::Integer(v) => v
            .as_i64()
            .map(|i| serde_json::json!(i))
            .or_else(|| v.as_u64().map(|u| serde_json::json!(u)))
            .unwrap_or(serde_json::Value::Null),
        Value::F32(v) => serde_json::json!(v),
        Value::F64(v) => serde_json::json!(v),
        Value::String(v) => serde_json::json!(v.as_str().unwrap_or_default()),
        Value::Binary(v) => match std::str::from_utf8(v) {
            Ok(text) => serde_json::json!({ "bin_utf8": text }),
            Err(_) => serde_json::json!({ "bin_hex": hex(v) }),
        },
        Value::Array(values) => serde_json::Value::Array(values.iter().map(value_to_json).collect()),
        Value::Map(entries) => serde_json::Value::Object(
            entries
                .iter()
                .map(|(k, v)| {
                    let key = k.as_str().map_or_else(|| format!("{k:?}"), str::to_owned);
                    (key, value_to_json(v))
                })
                .collect(),
        ),
        Value::Ext(_, data) => serde_json::json!({ "ext_hex": hex(data) }),
    }
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

fn require_u32(payload: &PayloadMap, key: &'static str) -> Result<u32, SelfDebugError> {
    payload
        .get(key)
        .and_then(Value::as_u64)
        .and_then(|value| u32::try_from(value).ok())
        .ok_or(SelfDebugError::MissingField(key))
}

fn message_type_name(message_type: i64) -> &'static str {
    match message_type {
        HELLO_MESSAGE_TYPE => "HELLO",
        SEND_MESSAGE_TYPE => "SEND",
        RECEIVE_MESSAGE_TYPE => "RECEIVE",
        REGISTER_MESSAGE_TYPE => "REGISTER",
        PING_MESSAGE_TYPE => "PING",
        STATUS_MESSAGE_TYPE => "STATUS",
        GETTICKET_MESSAGE_TYPE => "GETTICKET",
        SERVER_OK_MESSAGE_TYPE => "OK",
        SERVER_ERR_MESSAGE_TYPE => "ERR",
        HI_MESSAGE_TYPE => "HI",
        PONG_MESSAGE_TYPE => "PONG",
        _ => "UNKNOWN",
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use rmpv::Value;

    use crate::broker::{Broker, BrokerSettings};
    use crate::dispatcher::{RequestDispatcher, WorkerPool, UNBOUNDED};
    use crate::events::EventEmitter;
    use crate::logging::testing::memory_logger;
    use crate::logging::LogLevel;
    use crate::server::{ClientConnection, ServerConfig, TcpServer};
    use crate::wire::codec::WireCodec;
    use crate::wire::session::runtime::ConnectionWorker;

    use super::{extract_runtime_flags, message_type_name, spawn_runner, value_to_json, RuntimeFlags};

    #[test]
    fn extracts_self_debug_switches_and_keeps_config_args() {
        let (flags, rest) = extract_runtime_flags(vec![
            "--self-debug".to_owned(),
            "--server.port".to_owned(),
            "0".to_owned(),
        ]);
        assert_eq!(
            flags,
            RuntimeFlags {
                enabled: true,
                quiet: false
            }
        );
        assert_eq!(rest, vec!["--server.port".to_owned(), "0".to_owned()]);

        let (quiet, _) = extract_runtime_flags(vec!["--self-debug-quiet".to_owned()]);
        assert!(quiet.enabled && quiet.quiet);

        let (off, rest) = extract_runtime_flags(vec!["--logging.level".to_owned(), "debug".to_owned()]);
        assert!(!off.enabled);
        assert_eq!(rest.len(), 2);
    }

    #[test]
    fn renders_binary_bodies_readably() {
        assert_eq!(
            value_to_json(&Value::Binary(b"hi".to_vec())),
            serde_json::json!({"bin_utf8": "hi"})
        );
        assert_eq!(
            value_to_json(&Value::Binary(vec![0xff, 0x00])),
            serde_json::json!({"bin_hex": "ff00"})
        );
        assert_eq!(message_type_name(7), "GETTICKET");
        assert_eq!(message_type_name(42), "UNKNOWN");
    }

    #[test]
    fn scripted_session_passes_against_live_broker() {
        let server = TcpServer::bind(&ServerConfig {
            host: "127.0.0.1".to_owned(),
            port: 0,
        })
        .expect("server should bind");
        let addr = server.local_addr().expect("local addr should exist");

        let broker = Arc::new(Broker::new(BrokerSettings::default()));
        broker
            .bootstrap_reserved_channels(chrono::Utc::now())
            .expect("reserved channels should bootstrap");
        let (logger, _sink) = memory_logger(LogLevel::Error);
        let dispatcher: Arc<RequestDispatcher<ClientConnection>> =
            Arc::new(RequestDispatcher::new(UNBOUNDED));
        let worker = ConnectionWorker::new(
            broker,
            WireCodec::default(),
            Arc::new(EventEmitter::new()),
            logger,
            Arc::clone(&dispatcher),
            Duration::from_secs(5),
        );
        let pool = WorkerPool::spawn(1, Arc::clone(&dispatcher), Arc::new(worker))
            .expect("pool should spawn");

        let results = spawn_runner(
            addr,
            WireCodec::default(),
            RuntimeFlags {
                enabled: true,
                quiet: true,
            },
        );

        let mut outcome = None;
        for _ in 0..500 {
            if let Some(connection) = server.try_accept().expect("accept poll should not fail") {
                dispatcher
                    .submit(connection)
                    .map_err(|_| "dispatcher rejected connection")
                    .expect("connection should queue");
            }
            if let Ok(result) = results.try_recv() {
                outcome = Some(result);
                break;
            }
            std::thread::sleep(Duration::from_millis(10));
        }

        let outcome = outcome.expect("self-debug run should finish");
        assert!(outcome.is_ok(), "self-debug failed: {outcome:?}");

        dispatcher.close();
        server.shutdown_all_connections();
        pool.join().expect("workers should join");
    }
}
