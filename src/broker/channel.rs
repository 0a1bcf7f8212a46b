use std::collections::VecDeque;

use chrono::{DateTime, Duration, Utc};

use super::delivery::{Deliveries, MessageHandle};
use super::error::BrokerError;
use super::ticket::{Ticket, TicketId};

pub const ANY_MESSAGE_NUMBER: u32 = 0;

// What a producer hands to the broker on SEND.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OutgoingMessage {
    pub message_type: String,
    pub sender: String,
    pub payload: Vec<u8>,
    pub message_number: u32,
    pub receivers: i32,
    pub deliveries: i32,
}

impl OutgoingMessage {
    pub fn new(
        message_type: impl Into<String>,
        sender: impl Into<String>,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            message_type: message_type.into(),
            sender: sender.into(),
            payload,
            message_number: ANY_MESSAGE_NUMBER,
            receivers: 1,
            deliveries: 0,
        }
    }

    pub fn with_message_number(mut self, message_number: u32) -> Self {
        self.message_number = message_number;
        self
    }

    pub fn with_receivers(mut self, receivers: i32) -> Self {
        self.receivers = receivers;
        self
    }

    pub fn with_deliveries(mut self, deliveries: i32) -> Self {
        self.deliveries = deliveries;
        self
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Message {
    pub receive_id: TicketId,
    pub sequence_number: u64,
    pub message_type: String,
    pub sender: String,
    pub payload: Vec<u8>,
    pub message_number: u32,
    pub receivers_remaining: i32,
    pub deliveries_remaining: i32,
    pub sent_at: DateTime<Utc>,
}

impl Message {
    pub fn admitted(
        receive_id: TicketId,
        sequence_number: u64,
        outgoing: OutgoingMessage,
        sent_at: DateTime<Utc>,
    ) -> Self {
        Self {
            receive_id,
            sequence_number,
            message_type: outgoing.message_type,
            sender: outgoing.sender,
            payload: outgoing.payload,
            message_number: outgoing.message_number,
            receivers_remaining: outgoing.receivers,
            deliveries_remaining: outgoing.deliveries,
            sent_at,
        }
    }

    fn matches(&self, message_number: u32) -> bool {
        message_number == ANY_MESSAGE_NUMBER || self.message_number == message_number
    }

    // Retired only once both countdowns are spent.
    pub fn is_exhausted(&self) -> bool {
        self.receivers_remaining <= 0 && self.deliveries_remaining <= 0
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeliveredMessage {
    pub payload: Vec<u8>,
    pub message_type: String,
    pub sender: String,
    pub sequence_number: u64,
    pub message_number: u32,
    pub receivers_remaining: i32,
}

impl DeliveredMessage {
    fn copied_from(message: &Message) -> Self {
        Self {
            payload: message.payload.clone(),
            message_type: message.message_type.clone(),
            sender: message.sender.clone(),
            sequence_number: message.sequence_number,
            message_number: message.message_number,
            receivers_remaining: message.receivers_remaining,
        }
    }

    fn taken_from(message: Message) -> Self {
        Self {
            payload: message.payload,
            message_type: message.message_type,
            sender: message.sender,
            sequence_number: message.sequence_number,
            message_number: message.message_number,
            receivers_remaining: message.receivers_remaining,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Receipt {
    pub message: DeliveredMessage,
    pub message_retired: bool,
}

/// One registered channel: its ticket, sequence counter and the FIFO of
/// pending messages (handles into the shared arena).
#[derive(Debug)]
pub struct ChannelState {
    ticket: Ticket,
    next_sequence_number: u64,
    pending: VecDeque<MessageHandle>,
}

impl ChannelState {
    pub fn new(ticket: Ticket) -> Self {
        Self {
            ticket,
            next_sequence_number: 0,
            pending: VecDeque::new(),
        }
    }

    pub fn ticket(&self) -> &Ticket {
        &self.ticket
    }

    pub fn receive_id(&self) -> TicketId {
        self.ticket.receive_id
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn is_retirable(&self, now: DateTime<Utc>) -> bool {
        self.pending.is_empty() && (!self.ticket.is_multi_message() || self.ticket.is_expired_at(now))
    }

    pub fn admit(
        &mut self,
        deliveries: &mut Deliveries,
        outgoing: OutgoingMessage,
        sent_at: DateTime<Utc>,
        retention_window: Duration,
    ) -> u64 {
        let sequence_number = self.next_sequence_number;
        self.next_sequence_number += 1;
        self.ticket.extend_expiry(sent_at + retention_window);

        let message = Message::admitted(self.receive_id(), sequence_number, outgoing, sent_at);
        let handle = deliveries.admit(message);
        self.pending.push_back(handle);
        sequence_number
    }

    pub fn receive(
        &mut self,
        deliveries: &mut Deliveries,
        message_number: u32,
    ) -> Result<Receipt, BrokerError> {
        let position = self
            .pending
            .iter()
            .position(|handle| {
                deliveries
                    .get(*handle)
                    .is_some_and(|message| message.matches(message_number))
            })
            .ok_or(BrokerError::NoMessage {
                receive_id: self.receive_id(),
                message_number,
            })?;
        let handle = self.pending[position];

        let message = deliveries
            .get_mut(handle)
            .ok_or(BrokerError::NoMessage {
                receive_id: self.receive_id(),
                message_number,
            })?;
        message.receivers_remaining = message.receivers_remaining.saturating_sub(1);

        if !message.is_exhausted() {
            return Ok(Receipt {
                message: DeliveredMessage::copied_from(message),
                message_retired: false,
            });
        }

        self.pending.remove(position);
        let message = deliveries.retire(handle).ok_or(BrokerError::NoMessage {
            receive_id: self.receive_id(),
            message_number,
        })?;
        Ok(Receipt {
            message: DeliveredMessage::taken_from(message),
            message_retired: true,
        })
    }

    // Drops every pending message regardless of remaining counters.
    pub fn purge_pending(&mut self, deliveries: &mut Deliveries) -> usize {
        let mut purged = 0;
        for handle in self.pending.drain(..) {
            if deliveries.purge(handle).is_some() {
                purged += 1;
            }
        }
        purged
    }
}
