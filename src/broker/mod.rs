pub mod channel;
pub mod delivery;
pub mod error;
pub mod registry;
pub mod ticket;

use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::config::BrokerConfig;

pub use channel::{DeliveredMessage, Message, OutgoingMessage, Receipt, ANY_MESSAGE_NUMBER};
pub use error::BrokerError;
pub use ticket::{is_reserved_ticket_id, Ticket, TicketFlags, TicketId, RESERVED_TICKET_IDS};

use delivery::Deliveries;
use registry::TicketRegistry;

const ISSUE_TICKET_ATTEMPTS: usize = 64;
// Upper bound for any configured span so deadline arithmetic cannot overflow.
const MAX_CONFIGURED_SECONDS: u64 = 100 * 365 * 24 * 3_600;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BrokerSettings {
    pub bucket_count: usize,
    pub retention_window: Duration,
    pub default_ticket_lifetime: Duration,
    pub max_ticket_lifetime: Duration,
}

impl Default for BrokerSettings {
    fn default() -> Self {
        Self::from(&BrokerConfig::default())
    }
}

impl From<&BrokerConfig> for BrokerSettings {
    fn from(config: &BrokerConfig) -> Self {
        Self {
            bucket_count: config.bucket_count,
            retention_window: seconds(config.retention_window_seconds),
            default_ticket_lifetime: seconds(config.default_ticket_lifetime_seconds),
            max_ticket_lifetime: seconds(config.max_ticket_lifetime_seconds),
        }
    }
}

pub fn seconds(value: u64) -> Duration {
    Duration::seconds(value.min(MAX_CONFIGURED_SECONDS) as i64)
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RegisterRequest {
    pub receive_id: TicketId,
    pub send_id: TicketId,
    pub expire_time: Option<DateTime<Utc>>,
    pub flags: TicketFlags,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReceiveOutcome {
    pub receipt: Receipt,
    pub channel_retired: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub retired_channels: Vec<TicketId>,
    pub purged_messages: usize,
}

impl SweepReport {
    pub fn is_empty(&self) -> bool {
        self.retired_channels.is_empty() && self.purged_messages == 0
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct BrokerStats {
    pub bucket_count: usize,
    pub channels: usize,
    pub deepest_bucket: usize,
    pub messages_in_flight: usize,
    pub admitted_total: u64,
    pub retired_total: u64,
    pub purged_total: u64,
}

/// Channel registry plus the shared message store.
///
/// Every operation that touches both takes the owning bucket lock first and
/// the deliveries lock second; nothing ever acquires them the other way round.
#[derive(Debug)]
pub struct Broker {
    settings: BrokerSettings,
    registry: TicketRegistry,
    deliveries: Mutex<Deliveries>,
}

impl Broker {
    pub fn new(settings: BrokerSettings) -> Self {
        Self {
            registry: TicketRegistry::new(settings.bucket_count),
            deliveries: Mutex::new(Deliveries::new()),
            settings,
        }
    }

    pub fn settings(&self) -> &BrokerSettings {
        &self.settings
    }

    pub fn bootstrap_reserved_channels(&self, now: DateTime<Utc>) -> Result<(), BrokerError> {
        for receive_id in RESERVED_TICKET_IDS {
            self.register(Ticket::reserved(
                receive_id,
                now,
                self.settings.max_ticket_lifetime,
            ))?;
        }
        Ok(())
    }

    pub fn register(&self, ticket: Ticket) -> Result<(), BrokerError> {
        self.registry.register(ticket)
    }

    // Client-side registration: ids validated, lifetime defaulted and capped.
    pub fn register_ticket(
        &self,
        request: RegisterRequest,
        now: DateTime<Utc>,
    ) -> Result<Ticket, BrokerError> {
        if request.receive_id == 0 || request.send_id == 0 {
            return Err(BrokerError::InvalidTicket {
                reason: "ticket ids must be non-zero",
            });
        }
        if is_reserved_ticket_id(request.receive_id) {
            return Err(BrokerError::ReservedTicket {
                receive_id: request.receive_id,
            });
        }

        let ticket = Ticket::new(
            request.receive_id,
            request.send_id,
            self.bounded_expiry(request.expire_time, now),
            request.flags,
        );
        self.registry.register(ticket.clone())?;
        Ok(ticket)
    }

    pub fn issue_ticket(
        &self,
        ttl: Option<Duration>,
        flags: TicketFlags,
        now: DateTime<Utc>,
    ) -> Result<Ticket, BrokerError> {
        let expire_time = self.bounded_expiry(ttl.map(|ttl| now + ttl), now);

        for _ in 0..ISSUE_TICKET_ATTEMPTS {
            let receive_id = random_ticket_id();
            if receive_id == 0 || is_reserved_ticket_id(receive_id) {
                continue;
            }
            let send_id = random_ticket_id();
            if send_id == 0 {
                continue;
            }

            let ticket = Ticket::new(receive_id, send_id, expire_time, flags);
            match self.registry.register(ticket.clone()) {
                Ok(()) => return Ok(ticket),
                Err(BrokerError::DuplicateTicket { .. }) => continue,
                Err(err) => return Err(err),
            }
        }

        Err(BrokerError::TicketSpaceExhausted {
            attempts: ISSUE_TICKET_ATTEMPTS,
        })
    }

    fn bounded_expiry(&self, requested: Option<DateTime<Utc>>, now: DateTime<Utc>) -> DateTime<Utc> {
        let latest = now + self.settings.max_ticket_lifetime;
        match requested {
            Some(expire_time) if expire_time > now => expire_time.min(latest),
            _ => now + self.settings.default_ticket_lifetime,
        }
    }

    pub fn send(
        &self,
        receive_id: TicketId,
        send_id: TicketId,
        outgoing: OutgoingMessage,
        now: DateTime<Utc>,
    ) -> Result<u64, BrokerError> {
        let mut bucket = self.registry.bucket_for(receive_id);
        let channel = bucket.lookup(receive_id)?;
        if channel.ticket().send_id != send_id {
            return Err(BrokerError::UnmatchedTicket {
                receive_id,
                send_id,
            });
        }

        let mut deliveries = self.deliveries();
        Ok(channel.admit(
            &mut deliveries,
            outgoing,
            now,
            self.settings.retention_window,
        ))
    }

    pub fn receive(
        &self,
        receive_id: TicketId,
        message_number: u32,
        now: DateTime<Utc>,
    ) -> Result<ReceiveOutcome, BrokerError> {
        let mut bucket = self.registry.bucket_for(receive_id);
        let channel = bucket.lookup(receive_id)?;

        let receipt = {
            let mut deliveries = self.deliveries();
            channel.receive(&mut deliveries, message_number)?
        };

        let channel_retired = receipt.message_retired
            && channel.is_retirable(now)
            && bucket.unregister(receive_id).is_ok();

        Ok(ReceiveOutcome {
            receipt,
            channel_retired,
        })
    }

    // Drops expired channels together with anything still queued on them.
    pub fn purge_expired(&self, now: DateTime<Utc>) -> SweepReport {
        let mut report = SweepReport::default();

        for slot in 0..self.registry.bucket_count() {
            let mut bucket = self.registry.bucket_at(slot);
            let expired = bucket.detach_where(|channel| channel.ticket().is_expired_at(now));
            if expired.is_empty() {
                continue;
            }

            let mut deliveries = self.deliveries();
            for mut channel in expired {
                report.purged_messages += channel.purge_pending(&mut deliveries);
                report.retired_channels.push(channel.receive_id());
            }
        }

        report.retired_channels.sort_unstable();
        report
    }

    // Snapshot of queued messages across all channels, newest admission first.
    pub fn undelivered(&self, limit: usize) -> Vec<Message> {
        self.deliveries()
            .undelivered()
            .take(limit)
            .cloned()
            .collect()
    }

    pub fn stats(&self) -> BrokerStats {
        let channels = self.registry.channel_count();
        let deepest_bucket = self.registry.deepest_bucket();
        let deliveries = self.deliveries();
        let counters = deliveries.counters();

        BrokerStats {
            bucket_count: self.registry.bucket_count(),
            channels,
            deepest_bucket,
            messages_in_flight: deliveries.in_flight(),
            admitted_total: counters.admitted_total,
            retired_total: counters.retired_total,
            purged_total: counters.purged_total,
        }
    }

    fn deliveries(&self) -> MutexGuard<'_, Deliveries> {
        self.deliveries
            .lock()
            .expect("delivery store lock poisoned")
    }
}

impl Default for Broker {
    fn default() -> Self {
        Self::new(BrokerSettings::default())
    }
}

fn random_ticket_id() -> TicketId {
    Uuid::new_v4().as_u128() as TicketId
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Arc;
    use std::thread;

    use chrono::{DateTime, Duration, TimeZone, Utc};

    use super::{
        Broker, BrokerError, BrokerSettings, OutgoingMessage, RegisterRequest, Ticket,
        TicketFlags, ANY_MESSAGE_NUMBER,
    };

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
    }

    fn broker() -> Broker {
        Broker::new(BrokerSettings::default())
    }

    fn register(broker: &Broker, receive_id: u32, send_id: u32, flags: TicketFlags) {
        broker
            .register(Ticket::new(
                receive_id,
                send_id,
                now() + Duration::hours(1),
                flags,
            ))
            .expect("register should pass");
    }

    fn lookup(broker: &Broker, receive_id: u32) -> Result<Ticket, BrokerError> {
        broker
            .registry
            .bucket_for(receive_id)
            .lookup(receive_id)
            .map(|channel| channel.ticket().clone())
    }

    fn note(body: &str) -> OutgoingMessage {
        OutgoingMessage::new("note", "alice", body.as_bytes().to_vec())
    }

    #[test]
    fn multi_message_channel_drains_in_order_and_survives() {
        let broker = broker();
        register(&broker, 42, 99, TicketFlags::MULTI_MESSAGE);

        for body in ["m1", "m2", "m3"] {
            broker
                .send(42, 99, note(body), now())
                .expect("send should pass");
        }

        for body in ["m1", "m2", "m3"] {
            let outcome = broker
                .receive(42, ANY_MESSAGE_NUMBER, now())
                .expect("message should be pending");
            assert_eq!(outcome.receipt.message.payload, body.as_bytes().to_vec());
            assert!(!outcome.channel_retired);
        }

        assert_eq!(
            broker.receive(42, ANY_MESSAGE_NUMBER, now()),
            Err(BrokerError::NoMessage {
                receive_id: 42,
                message_number: ANY_MESSAGE_NUMBER
            })
        );
        assert!(lookup(&broker, 42).is_ok());
    }

    #[test]
    fn single_shot_channel_is_unregistered_after_last_receive() {
        let broker = broker();
        register(&broker, 7, 70, TicketFlags::SINGLE_SHOT);

        broker.send(7, 70, note("once"), now()).expect("send should pass");
        let outcome = broker
            .receive(7, ANY_MESSAGE_NUMBER, now())
            .expect("message should be pending");

        assert!(outcome.channel_retired);
        assert_eq!(
            lookup(&broker, 7),
            Err(BrokerError::TicketNotFound { receive_id: 7 })
        );
        assert_eq!(broker.stats().messages_in_flight, 0);
    }

    #[test]
    fn message_is_received_exactly_receiver_count_times() {
        let broker = broker();
        register(&broker, 50, 51, TicketFlags::SINGLE_SHOT);
        broker
            .send(50, 51, note("fan-out").with_receivers(4), now())
            .expect("send should pass");

        for _ in 0..4 {
            broker
                .receive(50, ANY_MESSAGE_NUMBER, now())
                .expect("receiver slot should remain");
        }

        assert_eq!(
            broker.receive(50, ANY_MESSAGE_NUMBER, now()),
            Err(BrokerError::TicketNotFound { receive_id: 50 })
        );
    }

    #[test]
    fn multi_message_channel_retires_when_drained_after_expiry() {
        let broker = broker();
        broker
            .register(Ticket::new(60, 61, now(), TicketFlags::MULTI_MESSAGE))
            .expect("register should pass");
        broker.send(60, 61, note("late"), now()).expect("send should pass");

        let after_retention = now() + Duration::hours(5);
        let outcome = broker
            .receive(60, ANY_MESSAGE_NUMBER, after_retention)
            .expect("message should be pending");
        assert!(outcome.channel_retired);
        assert!(lookup(&broker, 60).is_err());
    }

    #[test]
    fn out_of_range_receiver_count_retires_after_one_receive() {
        let broker = broker();
        register(&broker, 42, 43, TicketFlags::MULTI_MESSAGE);
        register(&broker, 50, 51, TicketFlags::MULTI_MESSAGE);

        broker
            .send(42, 43, note("floor").with_receivers(i32::MIN), now())
            .expect("send should pass");
        let outcome = broker
            .receive(42, ANY_MESSAGE_NUMBER, now())
            .expect("message should be pending");
        assert!(outcome.receipt.message_retired);
        assert_eq!(outcome.receipt.message.receivers_remaining, i32::MIN);

        broker.send(50, 51, note("after"), now()).expect("send should pass");
        let stats = broker.stats();
        assert_eq!(stats.messages_in_flight, 1);
        assert_eq!(stats.retired_total, 1);
        assert!(broker.receive(50, ANY_MESSAGE_NUMBER, now()).is_ok());
    }

    #[test]
    fn send_requires_registered_channel_and_matching_send_id() {
        let broker = broker();
        register(&broker, 20, 21, TicketFlags::MULTI_MESSAGE);

        assert_eq!(
            broker.send(20, 22, note("x"), now()),
            Err(BrokerError::UnmatchedTicket {
                receive_id: 20,
                send_id: 22
            })
        );
        assert_eq!(
            broker.send(30, 21, note("x"), now()),
            Err(BrokerError::TicketNotFound { receive_id: 30 })
        );
        assert_eq!(broker.stats().admitted_total, 0);
    }

    #[test]
    fn unregister_is_refused_while_messages_are_pending() {
        let broker = broker();
        register(&broker, 25, 26, TicketFlags::MULTI_MESSAGE);
        broker.send(25, 26, note("held"), now()).expect("send should pass");

        let unregister = |broker: &Broker| {
            broker
                .registry
                .bucket_for(25)
                .unregister(25)
                .map(|channel| channel.receive_id())
        };
        assert_eq!(
            unregister(&broker),
            Err(BrokerError::ChannelNotEmpty {
                receive_id: 25,
                pending: 1
            })
        );

        broker
            .receive(25, ANY_MESSAGE_NUMBER, now())
            .expect("message should be pending");
        assert_eq!(unregister(&broker), Ok(25));
    }

    #[test]
    fn reserved_channels_are_bootstrapped_once() {
        let broker = broker();
        broker
            .bootstrap_reserved_channels(now())
            .expect("bootstrap should pass");

        for id in [1, 2, 3] {
            let ticket = lookup(&broker, id).expect("reserved channel should exist");
            assert_eq!(ticket.send_id, id);
            assert!(ticket.is_multi_message());
            assert_eq!(ticket.expire_time, now() + Duration::hours(48 * 500));
        }

        assert_eq!(
            broker.bootstrap_reserved_channels(now()),
            Err(BrokerError::DuplicateTicket { receive_id: 1 })
        );
    }

    #[test]
    fn register_ticket_validates_ids_and_bounds_lifetime() {
        let broker = broker();
        let request = |receive_id, send_id, expire_time| RegisterRequest {
            receive_id,
            send_id,
            expire_time,
            flags: TicketFlags::SINGLE_SHOT,
        };

        assert!(matches!(
            broker.register_ticket(request(0, 5, None), now()),
            Err(BrokerError::InvalidTicket { .. })
        ));
        assert_eq!(
            broker.register_ticket(request(2, 5, None), now()),
            Err(BrokerError::ReservedTicket { receive_id: 2 })
        );

        let defaulted = broker
            .register_ticket(request(100, 5, Some(now() - Duration::minutes(1))), now())
            .expect("past expiry should be defaulted");
        assert_eq!(defaulted.expire_time, now() + Duration::hours(4));

        let clamped = broker
            .register_ticket(request(101, 5, Some(now() + Duration::days(30))), now())
            .expect("distant expiry should be clamped");
        assert_eq!(clamped.expire_time, now() + Duration::hours(48));

        let kept = broker
            .register_ticket(request(102, 5, Some(now() + Duration::hours(10))), now())
            .expect("expiry within bounds should be kept");
        assert_eq!(kept.expire_time, now() + Duration::hours(10));
    }

    #[test]
    fn issued_tickets_are_registered_and_never_reserved() {
        let broker = broker();
        let mut seen = Vec::new();

        for _ in 0..32 {
            let ticket = broker
                .issue_ticket(Some(Duration::hours(1)), TicketFlags::MULTI_MESSAGE, now())
                .expect("ticket should be issued");
            assert!(ticket.receive_id > 3);
            assert_ne!(ticket.send_id, 0);
            assert_eq!(ticket.expire_time, now() + Duration::hours(1));
            assert_eq!(lookup(&broker, ticket.receive_id), Ok(ticket.clone()));
            assert!(!seen.contains(&ticket.receive_id));
            seen.push(ticket.receive_id);
        }

        let capped = broker
            .issue_ticket(Some(Duration::days(10)), TicketFlags::SINGLE_SHOT, now())
            .expect("ticket should be issued");
        assert_eq!(capped.expire_time, now() + Duration::hours(48));
    }

    #[test]
    fn expiry_sweep_purges_expired_channels_from_both_queues() {
        let broker = broker();
        register(&broker, 10, 11, TicketFlags::MULTI_MESSAGE);
        register(&broker, 12, 13, TicketFlags::SINGLE_SHOT);
        broker
            .bootstrap_reserved_channels(now())
            .expect("bootstrap should pass");

        broker.send(10, 11, note("a"), now()).expect("send should pass");
        broker.send(10, 11, note("b"), now()).expect("send should pass");

        assert!(broker.purge_expired(now()).is_empty());

        let report = broker.purge_expired(now() + Duration::hours(5));
        assert_eq!(report.retired_channels, vec![10, 12]);
        assert_eq!(report.purged_messages, 2);

        let stats = broker.stats();
        assert_eq!(stats.channels, 3);
        assert_eq!(stats.messages_in_flight, 0);
        assert_eq!(stats.purged_total, 2);
        assert!(broker.undelivered(10).is_empty());
    }

    #[test]
    fn undelivered_lists_newest_admission_first_across_channels() {
        let broker = broker();
        register(&broker, 10, 11, TicketFlags::MULTI_MESSAGE);
        register(&broker, 20, 21, TicketFlags::MULTI_MESSAGE);

        broker.send(10, 11, note("a"), now()).expect("send should pass");
        broker.send(20, 21, note("b"), now()).expect("send should pass");
        broker.send(10, 11, note("c"), now()).expect("send should pass");

        let order = broker
            .undelivered(usize::MAX)
            .into_iter()
            .map(|message| (message.receive_id, message.payload))
            .collect::<Vec<_>>();
        assert_eq!(
            order,
            vec![
                (10, b"c".to_vec()),
                (20, b"b".to_vec()),
                (10, b"a".to_vec())
            ]
        );
        assert_eq!(broker.undelivered(1).len(), 1);
    }

    #[test]
    fn concurrent_sends_on_distinct_channels_are_neither_lost_nor_duplicated() {
        const CHANNELS: u32 = 8;
        const PER_CHANNEL: usize = 50;
        const RECEIVERS: i32 = 2;

        let broker = Arc::new(Broker::new(BrokerSettings {
            bucket_count: 3,
            ..BrokerSettings::default()
        }));
        for id in 0..CHANNELS {
            register(&broker, 100 + id, 200 + id, TicketFlags::MULTI_MESSAGE);
        }

        let senders = (0..CHANNELS)
            .map(|id| {
                let broker = Arc::clone(&broker);
                thread::spawn(move || {
                    for i in 0..PER_CHANNEL {
                        broker
                            .send(
                                100 + id,
                                200 + id,
                                note(&i.to_string()).with_receivers(RECEIVERS),
                                now(),
                            )
                            .expect("concurrent send should pass");
                    }
                })
            })
            .collect::<Vec<_>>();
        for sender in senders {
            sender.join().expect("sender thread should finish");
        }

        let receivers = (0..CHANNELS)
            .map(|id| {
                let broker = Arc::clone(&broker);
                thread::spawn(move || {
                    let mut seen: HashMap<u64, i32> = HashMap::new();
                    while let Ok(outcome) = broker.receive(100 + id, ANY_MESSAGE_NUMBER, now()) {
                        *seen.entry(outcome.receipt.message.sequence_number).or_default() += 1;
                    }
                    seen
                })
            })
            .collect::<Vec<_>>();

        let mut total = 0;
        for receiver in receivers {
            let seen = receiver.join().expect("receiver thread should finish");
            assert_eq!(seen.len(), PER_CHANNEL);
            assert!(seen.values().all(|count| *count == RECEIVERS));
            total += seen.values().sum::<i32>();
        }

        assert_eq!(total, CHANNELS as i32 * PER_CHANNEL as i32 * RECEIVERS);
        let stats = broker.stats();
        assert_eq!(stats.messages_in_flight, 0);
        assert_eq!(stats.admitted_total, (CHANNELS as u64) * PER_CHANNEL as u64);
        assert_eq!(stats.retired_total, stats.admitted_total);
    }

    #[test]
    fn competing_receivers_on_one_channel_each_get_distinct_messages() {
        let broker = Arc::new(broker());
        register(&broker, 77, 78, TicketFlags::SINGLE_SHOT);
        for i in 0..200 {
            broker
                .send(77, 78, note(&i.to_string()), now())
                .expect("send should pass");
        }

        let workers = (0..4)
            .map(|_| {
                let broker = Arc::clone(&broker);
                thread::spawn(move || {
                    let mut sequences = Vec::new();
                    while let Ok(outcome) = broker.receive(77, ANY_MESSAGE_NUMBER, now()) {
                        sequences.push(outcome.receipt.message.sequence_number);
                    }
                    sequences
                })
            })
            .collect::<Vec<_>>();

        let mut all = workers
            .into_iter()
            .flat_map(|worker| worker.join().expect("receiver thread should finish"))
            .collect::<Vec<_>>();
        all.sort_unstable();
        assert_eq!(all, (0..200).collect::<Vec<u64>>());
        assert!(lookup(&broker, 77).is_err());
    }
}
