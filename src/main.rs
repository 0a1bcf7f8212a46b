mod broker;
mod config;
mod diagnostics;
mod dispatcher;
mod events;
mod heartbeat;
mod logging;
mod self_debug;
mod server;
mod shutdown;
mod utils;
mod wire;

use std::process;
use std::sync::mpsc::TryRecvError;
use std::sync::Arc;
use std::time::Duration;

use broker::{Broker, BrokerSettings};
use chrono::Utc;
use config::AppConfig;
use dispatcher::{DispatchError, DispatcherConfig, RequestDispatcher, WorkerPool};
use events::{EventEmitter, APP_STARTED_EVENT, BROKER_EVENTS};
use heartbeat::{ExpirySweeper, Heartbeat};
use logging::{LogLevel, Logger, LoggerConfig};
use serde_json::json;
use server::{ClientConnection, TcpServer};
use shutdown::ShutdownHooks;
use utils::runtime::ensure_posix_or_exit;
use utils::startup_banner::print_startup_banner;
use wire::codec::WireCodec;
use wire::envelope::WireEnvelope;
use wire::session::runtime::ConnectionWorker;
use wire::session::SERVER_BUSY_CODE;

const ACCEPT_IDLE_SLEEP: Duration = Duration::from_millis(50);
const LISTENER_DRAIN_TIMEOUT: Duration = Duration::from_secs(3);
const BUSY_REPLY_WRITE_TIMEOUT: Duration = Duration::from_secs(1);

fn main() {
    ensure_posix_or_exit();
    print_startup_banner();

    let (self_debug_flags, config_args) =
        self_debug::extract_runtime_flags(std::env::args().skip(1).collect());
    let app_config = load_config_or_exit(config_args);
    let logger_config = LoggerConfig::from_app_logging(&app_config.logging).unwrap_or_else(|| {
        eprintln!(
            "invalid logging.level '{}'. Allowed values: {}",
            app_config.logging.level,
            LogLevel::ALLOWED_VALUES
        );
        process::exit(2);
    });
    let logger = Arc::new(Logger::new(logger_config));
    let app_started_at = Utc::now();

    let broker = Arc::new(Broker::new(BrokerSettings::from(&app_config.broker)));
    if let Err(error) = broker.bootstrap_reserved_channels(app_started_at) {
        eprintln!("broker bootstrap error: {error}");
        process::exit(2);
    }
    let broker_settings = broker.settings();
    logger.log(
        LogLevel::Info,
        Some("main::broker"),
        "Broker initialized with reserved channels",
        Some(json!({
            "bucket_count": broker_settings.bucket_count,
            "retention_window_seconds": broker_settings.retention_window.num_seconds(),
            "default_ticket_lifetime_seconds": broker_settings.default_ticket_lifetime.num_seconds(),
            "max_ticket_lifetime_seconds": broker_settings.max_ticket_lifetime.num_seconds(),
            "channels": broker.stats().channels
        })),
    );

    let server = TcpServer::from_app_config(&app_config).unwrap_or_else(|error| {
        eprintln!("server startup error: {error}");
        process::exit(2);
    });
    let bound_addr = server.local_addr().unwrap_or_else(|error| {
        eprintln!("server startup error: failed to read local address: {error}");
        process::exit(2);
    });
    logger.log(
        LogLevel::Info,
        Some("main::server"),
        &format!(
            "{} v{} listening for xmsg clients",
            env!("CARGO_PKG_NAME"),
            env!("CARGO_PKG_VERSION")
        ),
        Some(json!({
            "bind_address": bound_addr.to_string(),
            "host": app_config.server.host,
            "port": app_config.server.port
        })),
    );

    let wire_codec = WireCodec::from_app_config(&app_config).unwrap_or_else(|error| {
        eprintln!("wire codec configuration error: {error}");
        process::exit(2);
    });
    logger.log(
        LogLevel::Info,
        Some("main::wire"),
        "Wire codec initialized",
        Some(json!({
            "max_envelope_size_bytes": wire_codec.max_envelope_size_bytes(),
            "idle_timeout_seconds": app_config.wire.idle_timeout_seconds
        })),
    );

    let emitter = Arc::new(EventEmitter::new());
    for event_name in BROKER_EVENTS {
        let listener_logger = Arc::clone(&logger);
        emitter.on(event_name, move |event| {
            listener_logger.log(
                LogLevel::Debug,
                Some("main::events"),
                &event.name,
                event.payload.clone(),
            );
            Ok(())
        });
    }
    let started_logger = Arc::clone(&logger);
    emitter.on_async(APP_STARTED_EVENT, move |event| {
        started_logger.log(
            LogLevel::Verbose,
            Some("main::events"),
            "async listener observed startup",
            event.payload,
        );
        Ok(())
    });

    let mut heartbeat =
        Heartbeat::from_app_config(Arc::clone(&emitter), &app_config).unwrap_or_else(|error| {
            eprintln!("heartbeat configuration error: {error}");
            process::exit(2);
        });
    ExpirySweeper::from_app_config(Arc::clone(&broker), Arc::clone(&logger), &app_config)
        .attach(&emitter);
    logger.log(
        LogLevel::Info,
        Some("main::heartbeat"),
        "Heartbeat initialized",
        Some(heartbeat.initial_metadata_payload()),
    );
    if let Err(error) = heartbeat.start() {
        eprintln!("heartbeat startup error: {error}");
        process::exit(2);
    }

    let dispatcher_config = DispatcherConfig::from(&app_config.dispatcher);
    let dispatcher: Arc<RequestDispatcher<ClientConnection>> =
        Arc::new(RequestDispatcher::new(dispatcher_config.max_pending));
    let connection_worker = ConnectionWorker::from_app_config(
        &app_config,
        Arc::clone(&broker),
        wire_codec,
        Arc::clone(&emitter),
        Arc::clone(&logger),
        Arc::clone(&dispatcher),
    )
    .with_started_at(app_started_at);
    let pool = WorkerPool::spawn(
        dispatcher_config.worker_threads,
        Arc::clone(&dispatcher),
        Arc::new(connection_worker),
    )
    .unwrap_or_else(|error| {
        eprintln!("worker pool startup error: {error}");
        process::exit(2);
    });
    logger.log(
        LogLevel::Info,
        Some("main::dispatcher"),
        "Connection worker pool started",
        Some(json!({
            "worker_threads": pool.size(),
            "max_pending": dispatcher_config.max_pending
        })),
    );

    emitter.emit_or_exit(
        APP_STARTED_EVENT,
        Some(json!({
            "component": "main",
            "started_at": app_started_at.to_rfc3339()
        })),
    );

    let shutdown_hooks = ShutdownHooks::install().unwrap_or_else(|error| {
        eprintln!("failed to install shutdown hooks: {error}");
        process::exit(2);
    });
    logger.info(
        Some("main::shutdown"),
        "Shutdown hooks installed for SIGINT/SIGTERM/SIGHUP",
    );

    let self_debug_results = self_debug_flags.enabled.then(|| {
        logger.info(Some("main::self_debug"), "Self-debug run scheduled");
        self_debug::spawn_runner(bound_addr, wire_codec, self_debug_flags)
    });
    let mut self_debug_failed = false;

    while !shutdown_hooks.is_triggered() {
        let accepted = match server.try_accept() {
            Ok(accepted) => accepted,
            Err(error) => {
                logger.error(Some("main::server"), &format!("accept failed: {error}"));
                None
            }
        };

        match accepted {
            Some(connection) => admit_connection(&dispatcher, connection, &wire_codec, &logger),
            None => {
                shutdown_hooks.pause(ACCEPT_IDLE_SLEEP);
            }
        }

        if let Some(results) = &self_debug_results {
            match results.try_recv() {
                Ok(Ok(())) => {
                    logger.info(Some("main::self_debug"), "Self-debug run passed");
                    shutdown_hooks.trigger();
                }
                Ok(Err(error)) => {
                    logger.error(
                        Some("main::self_debug"),
                        &format!("Self-debug run failed: {error}"),
                    );
                    self_debug_failed = true;
                    shutdown_hooks.trigger();
                }
                Err(TryRecvError::Empty) => {}
                Err(TryRecvError::Disconnected) => {
                    logger.error(
                        Some("main::self_debug"),
                        "Self-debug runner exited without reporting",
                    );
                    self_debug_failed = true;
                    shutdown_hooks.trigger();
                }
            }
        }
    }

    logger.info(
        Some("main::shutdown"),
        "Shutdown requested, starting graceful shutdown",
    );
    emitter.begin_shutdown();
    dispatcher.close();
    let closed = server.shutdown_all_connections();
    logger.log(
        LogLevel::Info,
        Some("main::shutdown"),
        "Open client connections closed",
        Some(json!({"connections": closed})),
    );
    if let Err(error) = pool.join() {
        logger.warn(Some("main::shutdown"), &format!("{error}"));
    }
    if let Err(error) = heartbeat.stop() {
        logger.warn(Some("main::shutdown"), &format!("{error}"));
    }

    if emitter.wait_for_idle(LISTENER_DRAIN_TIMEOUT) {
        logger.info(
            Some("main::shutdown"),
            "All running listeners completed before timeout",
        );
    } else {
        logger.warn(
            Some("main::shutdown"),
            "Listener drain timeout reached; continuing shutdown",
        );
    }

    let stats = broker.stats();
    logger.log(
        LogLevel::Info,
        Some("main::shutdown"),
        "Broker stopped",
        Some(json!({
            "channels": stats.channels,
            "messages_in_flight": stats.messages_in_flight,
            "admitted_total": stats.admitted_total,
            "retired_total": stats.retired_total,
            "purged_total": stats.purged_total
        })),
    );

    if self_debug_failed {
        process::exit(1);
    }
}

fn load_config_or_exit(args: Vec<String>) -> AppConfig {
    match AppConfig::load_with_discovery(args) {
        Ok(config) => config,
        Err(error) => {
            eprintln!("configuration error: {error}");
            process::exit(2);
        }
    }
}

// Hands a fresh connection to the worker pool, or turns it away with
// SERVER_BUSY when the pending queue is at its limit.
fn admit_connection(
    dispatcher: &RequestDispatcher<ClientConnection>,
    connection: ClientConnection,
    wire_codec: &WireCodec,
    logger: &Logger,
) {
    let connection_id = connection.id();
    let peer_addr = connection.peer_addr();

    match dispatcher.submit(connection) {
        Ok(()) => logger.log(
            LogLevel::Debug,
            Some("main::server"),
            "Accepted client connection",
            Some(json!({
                "connection_id": connection_id,
                "peer_addr": peer_addr.to_string()
            })),
        ),
        Err(DispatchError::QueueFull {
            request: mut connection,
            limit,
        }) => {
            let _ = connection.set_write_timeout(Some(BUSY_REPLY_WRITE_TIMEOUT));
            let busy = WireEnvelope::err(
                "0",
                SERVER_BUSY_CODE,
                format!("server busy: {limit} connections already waiting for a worker"),
            );
            if let Err(error) = wire_codec.write_envelope(&mut connection, &busy.into_raw()) {
                logger.debug(
                    Some("main::server"),
                    &format!("failed to send SERVER_BUSY to connection {connection_id}: {error}"),
                );
            }
            logger.warn(
                Some("main::server"),
                &format!("rejected connection {connection_id} from {peer_addr}: pending queue full"),
            );
        }
        Err(DispatchError::Closed {
            request: connection,
        }) => {
            logger.debug(
                Some("main::server"),
                &format!(
                    "dropped connection {connection_id} from {} accepted during shutdown",
                    connection.peer_addr()
                ),
            );
        }
    }
}
