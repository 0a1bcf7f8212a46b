use std::sync::{Mutex, MutexGuard};

use super::channel::ChannelState;
use super::error::BrokerError;
use super::ticket::{Ticket, TicketId};

pub const DEFAULT_BUCKET_COUNT: usize = 47;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum BucketSlot {
    Occupied(usize),
    Vacant(usize),
}

/// Channels hashed to one slot, kept in strictly descending `receive_id` order.
#[derive(Debug, Default)]
pub struct RegistryBucket {
    channels: Vec<ChannelState>,
}

impl RegistryBucket {
    // Scans from the head; an entry smaller than the target ends the search.
    fn locate(&self, receive_id: TicketId) -> BucketSlot {
        for (index, channel) in self.channels.iter().enumerate() {
            let current = channel.receive_id();
            if current == receive_id {
                return BucketSlot::Occupied(index);
            }
            if current < receive_id {
                return BucketSlot::Vacant(index);
            }
        }
        BucketSlot::Vacant(self.channels.len())
    }

    pub fn insert(&mut self, channel: ChannelState) -> Result<(), BrokerError> {
        match self.locate(channel.receive_id()) {
            BucketSlot::Occupied(_) => Err(BrokerError::DuplicateTicket {
                receive_id: channel.receive_id(),
            }),
            BucketSlot::Vacant(index) => {
                self.channels.insert(index, channel);
                Ok(())
            }
        }
    }

    pub fn lookup(&mut self, receive_id: TicketId) -> Result<&mut ChannelState, BrokerError> {
        match self.locate(receive_id) {
            BucketSlot::Occupied(index) => Ok(&mut self.channels[index]),
            BucketSlot::Vacant(_) => Err(BrokerError::TicketNotFound { receive_id }),
        }
    }

    // Only a channel with nothing pending may leave the bucket.
    pub fn unregister(&mut self, receive_id: TicketId) -> Result<ChannelState, BrokerError> {
        let BucketSlot::Occupied(index) = self.locate(receive_id) else {
            return Err(BrokerError::TicketNotFound { receive_id });
        };
        let channel = &self.channels[index];
        if !channel.is_empty() {
            return Err(BrokerError::ChannelNotEmpty {
                receive_id,
                pending: channel.pending_len(),
            });
        }
        Ok(self.channels.remove(index))
    }

    // Detaches every channel matching `predicate`, preserving order of the rest.
    pub fn detach_where(
        &mut self,
        mut predicate: impl FnMut(&ChannelState) -> bool,
    ) -> Vec<ChannelState> {
        let mut detached = Vec::new();
        let mut kept = Vec::with_capacity(self.channels.len());
        for channel in self.channels.drain(..) {
            if predicate(&channel) {
                detached.push(channel);
            } else {
                kept.push(channel);
            }
        }
        self.channels = kept;
        detached
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }
}

#[derive(Debug)]
pub struct TicketRegistry {
    buckets: Vec<Mutex<RegistryBucket>>,
}

impl TicketRegistry {
    pub fn new(bucket_count: usize) -> Self {
        let bucket_count = bucket_count.max(1);
        Self {
            buckets: (0..bucket_count)
                .map(|_| Mutex::new(RegistryBucket::default()))
                .collect(),
        }
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    pub fn slot_for(&self, receive_id: TicketId) -> usize {
        receive_id as usize % self.buckets.len()
    }

    pub fn bucket_for(&self, receive_id: TicketId) -> MutexGuard<'_, RegistryBucket> {
        self.bucket_at(self.slot_for(receive_id))
    }

    pub fn bucket_at(&self, slot: usize) -> MutexGuard<'_, RegistryBucket> {
        self.buckets[slot]
            .lock()
            .expect("registry bucket lock poisoned")
    }

    pub fn register(&self, ticket: Ticket) -> Result<(), BrokerError> {
        self.bucket_for(ticket.receive_id)
            .insert(ChannelState::new(ticket))
    }

    pub fn channel_count(&self) -> usize {
        (0..self.buckets.len())
            .map(|slot| self.bucket_at(slot).len())
            .sum()
    }

    pub fn deepest_bucket(&self) -> usize {
        (0..self.buckets.len())
            .map(|slot| self.bucket_at(slot).len())
            .max()
            .unwrap_or(0)
    }
}

impl Default for TicketRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_BUCKET_COUNT)
    }
}
