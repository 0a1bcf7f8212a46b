use std::fmt;

use super::ticket::TicketId;

#[derive(Debug, PartialEq, Eq)]
pub enum BrokerError {
    DuplicateTicket {
        receive_id: TicketId,
    },
    TicketNotFound {
        receive_id: TicketId,
    },
    UnmatchedTicket {
        receive_id: TicketId,
        send_id: TicketId,
    },
    NoMessage {
        receive_id: TicketId,
        message_number: u32,
    },
    ChannelNotEmpty {
        receive_id: TicketId,
        pending: usize,
    },
    ReservedTicket {
        receive_id: TicketId,
    },
    InvalidTicket {
        reason: &'static str,
    },
    TicketSpaceExhausted {
        attempts: usize,
    },
}

impl BrokerError {
    // Not-found outcomes are routine for polling receivers.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::TicketNotFound { .. } | Self::NoMessage { .. })
    }
}

impl fmt::Display for BrokerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DuplicateTicket { receive_id } => {
                write!(f, "ticket {receive_id} is already registered")
            }
            Self::TicketNotFound { receive_id } => write!(f, "ticket {receive_id} not found"),
            Self::UnmatchedTicket {
                receive_id,
                send_id,
            } => write!(
                f,
                "send ticket {send_id} does not match registered channel {receive_id}"
            ),
            Self::NoMessage {
                receive_id,
                message_number,
            } => {
                if *message_number == 0 {
                    write!(f, "no pending message on channel {receive_id}")
                } else {
                    write!(
                        f,
                        "no pending message with number {message_number} on channel {receive_id}"
                    )
                }
            }
            Self::ChannelNotEmpty {
                receive_id,
                pending,
            } => write!(
                f,
                "channel {receive_id} still holds {pending} pending message(s)"
            ),
            Self::ReservedTicket { receive_id } => {
                write!(f, "ticket {receive_id} is reserved for broadcast channels")
            }
            Self::InvalidTicket { reason } => write!(f, "invalid ticket: {reason}"),
            Self::TicketSpaceExhausted { attempts } => write!(
                f,
                "could not allocate a free ticket id after {attempts} attempts"
            ),
        }
    }
}

impl std::error::Error for BrokerError {}
