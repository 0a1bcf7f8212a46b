use chrono::{DateTime, Duration, Utc};

pub type TicketId = u32;

pub const RESERVED_TICKET_IDS: [TicketId; 3] = [1, 2, 3];
pub const RESERVED_LIFETIME_MULTIPLIER: i32 = 500;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct TicketFlags(u32);

impl TicketFlags {
    pub const SINGLE_SHOT: Self = Self(0);
    pub const MULTI_MESSAGE: Self = Self(1);

    pub fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    pub fn bits(self) -> u32 {
        self.0
    }

    pub fn is_multi_message(self) -> bool {
        self.0 & Self::MULTI_MESSAGE.0 != 0
    }
}

/// Channel credential: consumers address the channel by `receive_id`,
/// producers must also present the matching `send_id`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Ticket {
    pub receive_id: TicketId,
    pub send_id: TicketId,
    pub expire_time: DateTime<Utc>,
    pub flags: TicketFlags,
}

impl Ticket {
    pub fn new(
        receive_id: TicketId,
        send_id: TicketId,
        expire_time: DateTime<Utc>,
        flags: TicketFlags,
    ) -> Self {
        Self {
            receive_id,
            send_id,
            expire_time,
            flags,
        }
    }

    // Well-known broadcast channel; send id mirrors the receive id.
    pub fn reserved(receive_id: TicketId, now: DateTime<Utc>, max_lifetime: Duration) -> Self {
        Self::new(
            receive_id,
            receive_id,
            now + max_lifetime * RESERVED_LIFETIME_MULTIPLIER,
            TicketFlags::MULTI_MESSAGE,
        )
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expire_time
    }

    pub fn is_multi_message(&self) -> bool {
        self.flags.is_multi_message()
    }

    // Traffic keeps a channel alive: expiry only ever moves forward.
    pub fn extend_expiry(&mut self, candidate: DateTime<Utc>) -> bool {
        if candidate > self.expire_time {
            self.expire_time = candidate;
            return true;
        }
        false
    }
}

pub fn is_reserved_ticket_id(receive_id: TicketId) -> bool {
    RESERVED_TICKET_IDS.contains(&receive_id)
}
