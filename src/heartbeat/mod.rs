use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{json, Value};

use crate::broker::{self, Broker, SweepReport};
use crate::config;
use crate::events::EventEmitter;
use crate::logging::{LogLevel, Logger};
use crate::utils::timing::measure_execution;

pub const HEARTBEAT_EVENT: &str = "on-heartbeat";
pub const MIN_INTERVAL_MS: u64 = 100;
pub const MAX_INTERVAL_MS: u64 = 1_000;

#[derive(Clone, Copy, Debug)]
pub struct HeartbeatConfig {
    pub interval_ms: u64,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval_ms: MAX_INTERVAL_MS,
        }
    }
}

impl From<&config::HeartbeatConfig> for HeartbeatConfig {
    fn from(value: &config::HeartbeatConfig) -> Self {
        Self {
            interval_ms: value.interval_ms,
        }
    }
}

#[derive(Debug)]
pub enum HeartbeatError {
    InvalidInterval { provided_ms: u64 },
    AlreadyRunning,
    Spawn { source: std::io::Error },
    JoinFailed,
}

impl fmt::Display for HeartbeatError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidInterval { provided_ms } => write!(
                f,
                "heartbeat interval must be between {MIN_INTERVAL_MS}ms and {MAX_INTERVAL_MS}ms, got {provided_ms}ms"
            ),
            Self::AlreadyRunning => write!(f, "heartbeat is already running"),
            Self::Spawn { source } => write!(f, "failed to spawn heartbeat thread: {source}"),
            Self::JoinFailed => write!(f, "heartbeat worker thread join failed"),
        }
    }
}

impl std::error::Error for HeartbeatError {}

pub struct Heartbeat {
    pub initiated_at: DateTime<Utc>,
    interval_ms: u64,
    emitter: Arc<EventEmitter>,
    stop_signal: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

impl Heartbeat {
    pub fn new(emitter: Arc<EventEmitter>, config: HeartbeatConfig) -> Result<Self, HeartbeatError> {
        Self::validate_interval(config.interval_ms)?;

        Ok(Self {
            initiated_at: Utc::now(),
            interval_ms: config.interval_ms,
            emitter,
            stop_signal: Arc::new(AtomicBool::new(false)),
            worker: None,
        })
    }

    pub fn from_app_config(
        emitter: Arc<EventEmitter>,
        app_config: &config::AppConfig,
    ) -> Result<Self, HeartbeatError> {
        Self::new(emitter, HeartbeatConfig::from(&app_config.heartbeat))
    }

    pub fn start(&mut self) -> Result<(), HeartbeatError> {
        if self.worker.is_some() {
            return Err(HeartbeatError::AlreadyRunning);
        }

        self.stop_signal.store(false, Ordering::SeqCst);
        let stop_signal = Arc::clone(&self.stop_signal);
        let emitter = Arc::clone(&self.emitter);
        let initiated_at = self.initiated_at;
        let interval_ms = self.interval_ms;

        let spawned = thread::Builder::new()
            .name("xmsgd-heartbeat".to_owned())
            .spawn(move || loop {
                if stop_signal.load(Ordering::SeqCst) {
                    break;
                }

                let emitted_at = Utc::now();
                let payload = json!({
                    "initiated_at": initiated_at.to_rfc3339_opts(SecondsFormat::Millis, true),
                    "emitted_at": emitted_at.to_rfc3339_opts(SecondsFormat::Millis, true),
                    "interval_ms": interval_ms
                });

                emitter.emit_or_exit(HEARTBEAT_EVENT, Some(payload));
                thread::sleep(Duration::from_millis(interval_ms));
            })
            .map_err(|source| HeartbeatError::Spawn { source })?;

        self.worker = Some(spawned);
        Ok(())
    }

    pub fn stop(&mut self) -> Result<(), HeartbeatError> {
        self.stop_signal.store(true, Ordering::SeqCst);

        if let Some(handle) = self.worker.take() {
            return handle.join().map_err(|_| HeartbeatError::JoinFailed);
        }

        Ok(())
    }

    pub fn initial_metadata_payload(&self) -> Value {
        json!({
            "event": HEARTBEAT_EVENT,
            "initiated_at": self.initiated_at.to_rfc3339_opts(SecondsFormat::Millis, true),
            "interval_ms": self.interval_ms
        })
    }

    fn validate_interval(interval_ms: u64) -> Result<(), HeartbeatError> {
        if (MIN_INTERVAL_MS..=MAX_INTERVAL_MS).contains(&interval_ms) {
            Ok(())
        } else {
            Err(HeartbeatError::InvalidInterval {
                provided_ms: interval_ms,
            })
        }
    }
}

impl Drop for Heartbeat {
    fn drop(&mut self) {
        self.stop_signal.store(true, Ordering::SeqCst);
        if let Some(handle) = self.worker.take() {
            let _ = handle.join();
        }
    }
}

/// Heartbeat listener that retires expired channels.
///
/// Heartbeats arrive every `interval_ms`; the sweep itself runs at most once
/// per `every`.
pub struct ExpirySweeper {
    broker: Arc<Broker>,
    logger: Arc<Logger>,
    every: chrono::Duration,
    last_sweep: Mutex<DateTime<Utc>>,
}

impl ExpirySweeper {
    pub fn new(
        broker: Arc<Broker>,
        logger: Arc<Logger>,
        every: chrono::Duration,
        started_at: DateTime<Utc>,
    ) -> Self {
        Self {
            broker,
            logger,
            every,
            last_sweep: Mutex::new(started_at),
        }
    }

    pub fn from_app_config(
        broker: Arc<Broker>,
        logger: Arc<Logger>,
        app_config: &config::AppConfig,
    ) -> Self {
        Self::new(
            broker,
            logger,
            broker::seconds(app_config.heartbeat.sweep_interval_seconds),
            Utc::now(),
        )
    }

    pub fn attach(self, emitter: &EventEmitter) {
        let sweeper = Arc::new(self);
        emitter.on(HEARTBEAT_EVENT, move |_event| {
            sweeper.on_heartbeat(Utc::now());
            Ok(())
        });
    }

    pub fn on_heartbeat(&self, now: DateTime<Utc>) -> Option<SweepReport> {
        {
            let mut last_sweep = self.last_sweep.lock().expect("sweeper clock lock poisoned");
            if now - *last_sweep < self.every {
                return None;
            }
            *last_sweep = now;
        }

        let report = measure_execution("broker.purge_expired", Some("broker::sweep"), &self.logger, || {
            self.broker.purge_expired(now)
        });
        if !report.is_empty() {
            self.logger.log(
                LogLevel::Info,
                Some("broker::sweep"),
                "Expired channels retired",
                Some(json!({
                    "retired_channels": report.retired_channels,
                    "purged_messages": report.purged_messages
                })),
            );
        }
        Some(report)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::mpsc;
    use std::time::Duration;

    use chrono::SecondsFormat;
    use serde_json::Value;

    use chrono::{Duration as ChronoDuration, Utc};

    use crate::broker::{Broker, BrokerSettings, OutgoingMessage, Ticket, TicketFlags};
    use crate::config::AppConfig;
    use crate::events::EventEmitter;
    use crate::logging::testing::memory_logger;
    use crate::logging::LogLevel;

    use super::{
        ExpirySweeper, Heartbeat, HeartbeatConfig, HeartbeatError, HEARTBEAT_EVENT,
        MAX_INTERVAL_MS,
    };

    #[test]
    fn default_config_interval_is_one_second() {
        let config = HeartbeatConfig::default();
        assert_eq!(config.interval_ms, MAX_INTERVAL_MS);
    }

    #[test]
    fn rejects_intervals_outside_allowed_range() {
        let emitter = Arc::new(EventEmitter::new());

        let low = Heartbeat::new(Arc::clone(&emitter), HeartbeatConfig { interval_ms: 99 });
        let high = Heartbeat::new(Arc::clone(&emitter), HeartbeatConfig { interval_ms: 1_001 });

        assert!(matches!(
            low,
            Err(HeartbeatError::InvalidInterval { provided_ms: 99 })
        ));
        assert!(matches!(
            high,
            Err(HeartbeatError::InvalidInterval { provided_ms: 1_001 })
        ));
    }

    #[test]
    fn emits_heartbeat_with_initiated_timestamp() {
        let emitter = Arc::new(EventEmitter::new());
        let (tx, rx) = mpsc::channel::<String>();

        emitter.on(HEARTBEAT_EVENT, move |event| {
            let initiated_at = event
                .payload
                .as_ref()
                .and_then(|payload| payload.get("initiated_at"))
                .and_then(Value::as_str)
                .ok_or_else(|| "missing initiated_at in heartbeat payload".to_owned())?;

            tx.send(initiated_at.to_owned())
                .map_err(|send_error| send_error.to_string())
        });

        let mut heartbeat = Heartbeat::new(Arc::clone(&emitter), HeartbeatConfig { interval_ms: 100 })
            .expect("heartbeat should be created");
        let expected_initiated_at = heartbeat
            .initiated_at
            .to_rfc3339_opts(SecondsFormat::Millis, true);

        heartbeat.start().expect("heartbeat should start");
        let received = rx
            .recv_timeout(Duration::from_millis(350))
            .expect("heartbeat event should arrive");
        heartbeat.stop().expect("heartbeat should stop");

        assert_eq!(received, expected_initiated_at);
    }

    #[test]
    fn builds_from_app_config_and_validates_interval() {
        let emitter = Arc::new(EventEmitter::new());
        let mut app_config = AppConfig::default();
        assert!(Heartbeat::from_app_config(Arc::clone(&emitter), &app_config).is_ok());

        app_config.heartbeat.interval_ms = 5_000;
        assert!(matches!(
            Heartbeat::from_app_config(emitter, &app_config),
            Err(HeartbeatError::InvalidInterval { provided_ms: 5_000 })
        ));
    }

    #[test]
    fn sweeper_throttles_and_purges_expired_channels() {
        let started_at = Utc::now();
        let broker = Arc::new(Broker::new(BrokerSettings {
            retention_window: ChronoDuration::seconds(20),
            ..BrokerSettings::default()
        }));
        broker
            .register(Ticket::new(
                42,
                99,
                started_at + ChronoDuration::seconds(30),
                TicketFlags::MULTI_MESSAGE,
            ))
            .expect("ticket should register");
        broker
            .send(42, 99, OutgoingMessage::new("t", "rods", b"x".to_vec()), started_at)
            .expect("send should be admitted");

        let (logger, sink) = memory_logger(LogLevel::Debug);
        let sweeper = ExpirySweeper::new(
            Arc::clone(&broker),
            logger,
            ChronoDuration::seconds(60),
            started_at,
        );

        assert!(sweeper
            .on_heartbeat(started_at + ChronoDuration::seconds(10))
            .is_none());

        let report = sweeper
            .on_heartbeat(started_at + ChronoDuration::seconds(61))
            .expect("sweep should run once the interval elapsed");
        assert_eq!(report.retired_channels, vec![42]);
        assert_eq!(report.purged_messages, 1);
        assert_eq!(broker.stats().channels, 0);
        assert_eq!(broker.stats().messages_in_flight, 0);
        assert!(sink.contains("Expired channels retired"));
        assert!(sink.contains("task 'broker.purge_expired' finished in"));

        assert!(sweeper
            .on_heartbeat(started_at + ChronoDuration::seconds(62))
            .is_none());
    }

    #[test]
    fn attached_sweeper_runs_on_heartbeat_events() {
        let emitter = EventEmitter::new();
        let broker = Arc::new(Broker::new(BrokerSettings::default()));
        let past = Utc::now() - ChronoDuration::seconds(10);
        broker
            .register(Ticket::new(7, 8, past, TicketFlags::SINGLE_SHOT))
            .expect("ticket should register");

        let (logger, _sink) = memory_logger(LogLevel::Info);
        ExpirySweeper::new(
            Arc::clone(&broker),
            logger,
            ChronoDuration::zero(),
            past,
        )
        .attach(&emitter);

        emitter
            .emit(HEARTBEAT_EVENT, None)
            .expect("heartbeat listeners should succeed");
        assert_eq!(broker.stats().channels, 0);
    }
}
