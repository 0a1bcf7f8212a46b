use std::fs;

use chrono::{DateTime, Utc};
use rmpv::Value;

use crate::broker::{BrokerStats, Message};
use crate::dispatcher::DispatcherStats;
use crate::wire::envelope::PayloadMap;

/// Most recent undelivered messages listed in a STATUS reply.
pub const STATUS_UNDELIVERED_LIMIT: usize = 16;

pub fn build_status_payload(
    app_started_at: DateTime<Utc>,
    now: DateTime<Utc>,
    dispatcher: &DispatcherStats,
    broker: &BrokerStats,
    undelivered: &[Message],
) -> PayloadMap {
    let mut payload = PayloadMap::new();
    payload.insert(
        "application".to_owned(),
        application_status(app_started_at, now),
    );
    payload.insert("memory".to_owned(), memory_stats());
    payload.insert("dispatcher".to_owned(), dispatcher_stats(dispatcher));
    payload.insert("broker".to_owned(), broker_stats(broker));
    payload.insert("undelivered".to_owned(), undelivered_summary(undelivered));
    payload
}

pub fn application_status(app_started_at: DateTime<Utc>, now: DateTime<Utc>) -> Value {
    let uptime_seconds = (now - app_started_at).num_seconds().max(0);
    entries(vec![
        ("name", Value::String(env!("CARGO_PKG_NAME").into())),
        ("version", Value::String(env!("CARGO_PKG_VERSION").into())),
        (
            "build_date_utc",
            Value::String(env!("XMSGD_BUILD_DATE_UTC").into()),
        ),
        ("git_revision", Value::String(env!("XMSGD_GIT_REVISION").into())),
        (
            "started_at",
            Value::String(app_started_at.to_rfc3339().into()),
        ),
        ("now", Value::String(now.to_rfc3339().into())),
        ("uptime_seconds", Value::from(uptime_seconds)),
        ("pid", Value::from(std::process::id())),
    ])
}

pub fn memory_stats() -> Value {
    let status = fs::read_to_string("/proc/self/status").unwrap_or_default();
    memory_stats_from(&status)
}

fn memory_stats_from(status: &str) -> Value {
    let mut vm_rss_kb: Option<i64> = None;
    let mut vm_size_kb: Option<i64> = None;
    let mut vm_peak_kb: Option<i64> = None;

    for line in status.lines() {
        if line.starts_with("VmRSS:") {
            vm_rss_kb = parse_kb_field(line);
        } else if line.starts_with("VmSize:") {
            vm_size_kb = parse_kb_field(line);
        } else if line.starts_with("VmPeak:") {
            vm_peak_kb = parse_kb_field(line);
        }
    }

    let optional = |value: Option<i64>| value.map_or(Value::Nil, Value::from);
    entries(vec![
        ("source", Value::String("/proc/self/status".into())),
        (
            "available",
            Value::Boolean(vm_rss_kb.is_some() || vm_size_kb.is_some() || vm_peak_kb.is_some()),
        ),
        ("vm_rss_kb", optional(vm_rss_kb)),
        ("vm_size_kb", optional(vm_size_kb)),
        ("vm_peak_kb", optional(vm_peak_kb)),
    ])
}

pub fn dispatcher_stats(stats: &DispatcherStats) -> Value {
    entries(vec![
        ("queued", Value::from(stats.queued as u64)),
        ("in_service", Value::from(stats.in_service as u64)),
        ("served_total", Value::from(stats.served_total)),
        ("rejected_total", Value::from(stats.rejected_total)),
        ("panicked_total", Value::from(stats.panicked_total)),
        ("max_pending", Value::from(stats.max_pending as u64)),
        ("closed", Value::Boolean(stats.closed)),
    ])
}

pub fn broker_stats(stats: &BrokerStats) -> Value {
    entries(vec![
        ("bucket_count", Value::from(stats.bucket_count as u64)),
        ("channels", Value::from(stats.channels as u64)),
        ("deepest_bucket", Value::from(stats.deepest_bucket as u64)),
        (
            "messages_in_flight",
            Value::from(stats.messages_in_flight as u64),
        ),
        ("admitted_total", Value::from(stats.admitted_total)),
        ("retired_total", Value::from(stats.retired_total)),
        ("purged_total", Value::from(stats.purged_total)),
    ])
}

// Message metadata only; bodies stay out of STATUS replies.
pub fn undelivered_summary(messages: &[Message]) -> Value {
    Value::Array(
        messages
            .iter()
            .map(|message| {
                entries(vec![
                    ("rcv", Value::from(message.receive_id)),
                    ("seq", Value::from(message.sequence_number)),
                    ("mt", Value::String(message.message_type.as_str().into())),
                    ("from", Value::String(message.sender.as_str().into())),
                    ("num", Value::from(message.message_number)),
                    ("size", Value::from(message.payload.len() as u64)),
                    ("nrcv", Value::from(message.receivers_remaining)),
                    ("ndeli", Value::from(message.deliveries_remaining)),
                    ("sent_at", Value::String(message.sent_at.to_rfc3339().into())),
                ])
            })
            .collect(),
    )
}

fn entries(fields: Vec<(&str, Value)>) -> Value {
    Value::Map(
        fields
            .into_iter()
            .map(|(key, value)| (Value::String(key.into()), value))
            .collect(),
    )
}

fn parse_kb_field(line: &str) -> Option<i64> {
    line.split_whitespace().nth(1)?.parse::<i64>().ok()
}
