use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::{json, Value};

use crate::broker::{Broker, BrokerError, OutgoingMessage, RegisterRequest};
use crate::config::AppConfig;
use crate::diagnostics::{build_status_payload, STATUS_UNDELIVERED_LIMIT};
use crate::dispatcher::{RequestDispatcher, RequestHandler};
use crate::events::{
    EventEmitter, CHANNEL_REGISTERED_EVENT, CHANNEL_RETIRED_EVENT, MESSAGE_ADMITTED_EVENT,
    MESSAGE_RETIRED_EVENT,
};
use crate::logging::{LogLevel, Logger};
use crate::server::ClientConnection;
use crate::wire::codec::{CodecError, FrameRead, MessageEnvelope, WireCodec};
use crate::wire::envelope::WireEnvelope;
use crate::wire::handshake::{accept_hello, hi_response, ClientHello, AGENT_INIT_ERROR_CODE};

use super::{
    broker_error_response, delivered_payload, evaluate_client_frame, pong_response,
    sequence_payload, ticket_payload, ClientCommand, PROTOCOL_VIOLATION_CODE,
};

pub const ANONYMOUS_SENDER: &str = "anonymous";
// Used on ERR frames when the offending frame carried no readable rid.
const UNKNOWN_REQUEST_ID: &str = "0";
const LOG_CONTEXT: &str = "wire::session";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionEnd {
    ClientClosed,
    IdleTimeout,
    HandshakeRejected,
    ProtocolViolation,
    TransportError,
}

impl SessionEnd {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ClientClosed => "client_closed",
            Self::IdleTimeout => "idle_timeout",
            Self::HandshakeRejected => "handshake_rejected",
            Self::ProtocolViolation => "protocol_violation",
            Self::TransportError => "transport_error",
        }
    }
}

/// Serves one accepted connection from HELLO to close on a pool worker.
pub struct ConnectionWorker {
    broker: Arc<Broker>,
    codec: WireCodec,
    emitter: Arc<EventEmitter>,
    logger: Arc<Logger>,
    dispatcher: Arc<RequestDispatcher<ClientConnection>>,
    idle_timeout: Duration,
    app_started_at: DateTime<Utc>,
}

impl ConnectionWorker {
    pub fn new(
        broker: Arc<Broker>,
        codec: WireCodec,
        emitter: Arc<EventEmitter>,
        logger: Arc<Logger>,
        dispatcher: Arc<RequestDispatcher<ClientConnection>>,
        idle_timeout: Duration,
    ) -> Self {
        Self {
            broker,
            codec,
            emitter,
            logger,
            dispatcher,
            idle_timeout,
            app_started_at: Utc::now(),
        }
    }

    pub fn from_app_config(
        app_config: &AppConfig,
        broker: Arc<Broker>,
        codec: WireCodec,
        emitter: Arc<EventEmitter>,
        logger: Arc<Logger>,
        dispatcher: Arc<RequestDispatcher<ClientConnection>>,
    ) -> Self {
        Self::new(
            broker,
            codec,
            emitter,
            logger,
            dispatcher,
            Duration::from_secs(app_config.wire.idle_timeout_seconds),
        )
    }

    pub fn with_started_at(mut self, app_started_at: DateTime<Utc>) -> Self {
        self.app_started_at = app_started_at;
        self
    }

    pub fn serve(&self, worker_index: usize, mut connection: ClientConnection) -> SessionEnd {
        let connection_id = connection.id();
        // Writes share the idle bound so a peer that stops reading cannot pin a worker.
        let armed = connection
            .set_read_timeout(Some(self.idle_timeout))
            .and_then(|()| connection.set_write_timeout(Some(self.idle_timeout)));
        let end = match armed {
            Ok(()) => match self.handshake(&mut connection) {
                Ok(hello) => self.command_loop(&mut connection, &hello),
                Err(end) => end,
            },
            Err(error) => {
                self.logger.warn(
                    Some(LOG_CONTEXT),
                    &format!("failed to arm idle timeouts on connection {connection_id}: {error}"),
                );
                SessionEnd::TransportError
            }
        };

        self.logger.log(
            LogLevel::Info,
            Some(LOG_CONTEXT),
            "Session ended",
            Some(json!({
                "connection_id": connection_id,
                "peer_addr": connection.peer_addr().to_string(),
                "worker": worker_index,
                "reason": end.as_str(),
                "duration_ms": (Utc::now() - connection.accepted_at()).num_milliseconds()
            })),
        );
        end
    }

    fn handshake(&self, connection: &mut ClientConnection) -> Result<ClientHello, SessionEnd> {
        let raw = match self.next_frame(connection)? {
            Ok(raw) => raw,
            Err(error) => {
                self.reply_error(connection, UNKNOWN_REQUEST_ID, AGENT_INIT_ERROR_CODE, &error.to_string());
                return Err(SessionEnd::HandshakeRejected);
            }
        };

        match accept_hello(&raw) {
            Ok(hello) => {
                if !self.reply(connection, hi_response(&hello)) {
                    return Err(SessionEnd::TransportError);
                }
                self.logger.log(
                    LogLevel::Debug,
                    Some(LOG_CONTEXT),
                    "HELLO handshake completed",
                    Some(json!({
                        "connection_id": connection.id(),
                        "user": hello.user,
                        "client": hello.client
                    })),
                );
                Ok(hello)
            }
            Err(error) => {
                let request_id = error.request_id().unwrap_or(UNKNOWN_REQUEST_ID).to_owned();
                self.reply_error(connection, &request_id, AGENT_INIT_ERROR_CODE, &error.to_string());
                self.logger.warn(
                    Some(LOG_CONTEXT),
                    &format!(
                        "handshake rejected on connection {}: {error}; closing connection",
                        connection.id()
                    ),
                );
                Err(SessionEnd::HandshakeRejected)
            }
        }
    }

    fn command_loop(&self, connection: &mut ClientConnection, hello: &ClientHello) -> SessionEnd {
        loop {
            let raw = match self.next_frame(connection) {
                Ok(Ok(raw)) => raw,
                Ok(Err(error)) => {
                    self.violation(connection, UNKNOWN_REQUEST_ID, &error.to_string());
                    return SessionEnd::ProtocolViolation;
                }
                Err(end) => return end,
            };

            let command = match evaluate_client_frame(&raw) {
                Ok(command) => command,
                Err(error) => {
                    let request_id = error.request_id().unwrap_or(UNKNOWN_REQUEST_ID).to_owned();
                    self.violation(connection, &request_id, &error.to_string());
                    return SessionEnd::ProtocolViolation;
                }
            };

            if self.logger.enabled(LogLevel::Verbose) {
                self.logger.verbose(
                    Some(LOG_CONTEXT),
                    &format!(
                        "{} rid={} on connection {}",
                        command.name(),
                        command.request_id(),
                        connection.id()
                    ),
                );
            }

            let response = self.execute(command, hello, Utc::now());
            if !self.reply(connection, response) {
                return SessionEnd::TransportError;
            }
        }
    }

    // Outer Err ends the session quietly; inner Err is a frame the peer got
    // wrong and deserves an ERR reply.
    fn next_frame(
        &self,
        connection: &mut ClientConnection,
    ) -> Result<Result<MessageEnvelope, CodecError>, SessionEnd> {
        match self.codec.read_envelope(connection) {
            Ok(FrameRead::Envelope(raw)) => Ok(Ok(raw)),
            Ok(FrameRead::Closed) => Err(SessionEnd::ClientClosed),
            Ok(FrameRead::TimedOut) => Err(SessionEnd::IdleTimeout),
            Err(error @ (CodecError::Io(_) | CodecError::TruncatedFrame { .. })) => {
                self.logger.debug(
                    Some(LOG_CONTEXT),
                    &format!("read failed on connection {}: {error}", connection.id()),
                );
                Err(SessionEnd::TransportError)
            }
            Err(error) => Ok(Err(error)),
        }
    }

    pub fn execute(
        &self,
        command: ClientCommand,
        hello: &ClientHello,
        now: DateTime<Utc>,
    ) -> WireEnvelope {
        match command {
            ClientCommand::Send {
                request_id,
                receive_id,
                send_id,
                message_type,
                sender,
                payload,
                message_number,
                receivers,
                deliveries,
            } => {
                let sender = sender
                    .or_else(|| hello.user.clone())
                    .unwrap_or_else(|| ANONYMOUS_SENDER.to_owned());
                let outgoing = OutgoingMessage::new(message_type.clone(), sender, payload)
                    .with_message_number(message_number)
                    .with_receivers(receivers)
                    .with_deliveries(deliveries);

                match self.broker.send(receive_id, send_id, outgoing, now) {
                    Ok(sequence_number) => {
                        self.emit(
                            MESSAGE_ADMITTED_EVENT,
                            json!({
                                "rcv": receive_id,
                                "seq": sequence_number,
                                "mt": message_type,
                                "num": message_number
                            }),
                        );
                        WireEnvelope::ok(request_id, Some(sequence_payload(sequence_number)))
                    }
                    Err(error) => self.rejected(&request_id, "SEND", error),
                }
            }
            ClientCommand::Receive {
                request_id,
                receive_id,
                message_number,
            } => match self.broker.receive(receive_id, message_number, now) {
                Ok(outcome) => {
                    let message = &outcome.receipt.message;
                    if outcome.receipt.message_retired {
                        self.emit(
                            MESSAGE_RETIRED_EVENT,
                            json!({"rcv": receive_id, "seq": message.sequence_number}),
                        );
                    }
                    if outcome.channel_retired {
                        self.emit(CHANNEL_RETIRED_EVENT, json!({"rcv": receive_id}));
                    }
                    WireEnvelope::ok(request_id, Some(delivered_payload(message)))
                }
                Err(error) => self.rejected(&request_id, "RECEIVE", error),
            },
            ClientCommand::Register {
                request_id,
                receive_id,
                send_id,
                expire_time,
                flags,
            } => {
                let registered = self.broker.register_ticket(
                    RegisterRequest {
                        receive_id,
                        send_id,
                        expire_time,
                        flags,
                    },
                    now,
                );
                match registered {
                    Ok(ticket) => {
                        self.emit(
                            CHANNEL_REGISTERED_EVENT,
                            json!({
                                "rcv": ticket.receive_id,
                                "exp": ticket.expire_time.to_rfc3339(),
                                "flags": ticket.flags.bits(),
                                "issued": false
                            }),
                        );
                        WireEnvelope::ok(request_id, Some(ticket_payload(&ticket)))
                    }
                    Err(error) => self.rejected(&request_id, "REGISTER", error),
                }
            }
            ClientCommand::GetTicket {
                request_id,
                ttl,
                flags,
            } => match self.broker.issue_ticket(ttl, flags, now) {
                Ok(ticket) => {
                    self.emit(
                        CHANNEL_REGISTERED_EVENT,
                        json!({
                            "rcv": ticket.receive_id,
                            "exp": ticket.expire_time.to_rfc3339(),
                            "flags": ticket.flags.bits(),
                            "issued": true
                        }),
                    );
                    WireEnvelope::ok(request_id, Some(ticket_payload(&ticket)))
                }
                Err(error) => self.rejected(&request_id, "GETTICKET", error),
            },
            ClientCommand::Ping { request_id } => pong_response(&request_id, now),
            ClientCommand::Status { request_id } => WireEnvelope::ok(
                request_id,
                Some(build_status_payload(
                    self.app_started_at,
                    now,
                    &self.dispatcher.stats(),
                    &self.broker.stats(),
                    &self.broker.undelivered(STATUS_UNDELIVERED_LIMIT),
                )),
            ),
        }
    }

    fn rejected(&self, request_id: &str, command: &str, error: BrokerError) -> WireEnvelope {
        let level = if error.is_not_found() {
            LogLevel::Debug
        } else {
            LogLevel::Warn
        };
        self.logger.log(
            level,
            Some(LOG_CONTEXT),
            &format!("{command} rejected: {error}"),
            None,
        );
        broker_error_response(request_id, &error)
    }

    fn emit(&self, event: &str, payload: Value) {
        if let Err(error) = self.emitter.emit(event, Some(payload)) {
            self.logger.warn(
                Some(LOG_CONTEXT),
                &format!("listener for '{event}' failed: {error}"),
            );
        }
    }

    fn violation(&self, connection: &mut ClientConnection, request_id: &str, message: &str) {
        self.reply_error(connection, request_id, PROTOCOL_VIOLATION_CODE, message);
        self.logger.warn(
            Some(LOG_CONTEXT),
            &format!(
                "protocol violation on connection {}: {message}; closing connection",
                connection.id()
            ),
        );
    }

    fn reply_error(
        &self,
        connection: &mut ClientConnection,
        request_id: &str,
        code: &str,
        message: &str,
    ) {
        let _ = self.reply(connection, WireEnvelope::err(request_id, code, message));
    }

    fn reply(&self, connection: &mut ClientConnection, response: WireEnvelope) -> bool {
        match self.codec.write_envelope(connection, &response.into_raw()) {
            Ok(()) => true,
            Err(error) => {
                self.logger.warn(
                    Some(LOG_CONTEXT),
                    &format!(
                        "failed to write response to connection {}: {error}",
                        connection.id()
                    ),
                );
                false
            }
        }
    }
}

impl RequestHandler<ClientConnection> for ConnectionWorker {
    fn handle(&self, worker_index: usize, connection: ClientConnection) {
        self.serve(worker_index, connection);
    }
}
