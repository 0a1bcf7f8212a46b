use std::collections::{BTreeMap, HashMap};

use super::channel::Message;

/// Stable reference to a message held in the [`MessageArena`].
///
/// The generation guards against a stale handle resolving to a slot that
/// was freed and later reused by another message.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct MessageHandle {
    index: u32,
    generation: u32,
}

#[derive(Debug, Default)]
struct Slot {
    generation: u32,
    message: Option<Message>,
}

#[derive(Debug, Default)]
pub struct MessageArena {
    slots: Vec<Slot>,
    free: Vec<u32>,
    live: usize,
}

impl MessageArena {
    pub fn insert(&mut self, message: Message) -> MessageHandle {
        self.live += 1;
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.message = Some(message);
            return MessageHandle {
                index,
                generation: slot.generation,
            };
        }

        let index = self.slots.len() as u32;
        self.slots.push(Slot {
            generation: 0,
            message: Some(message),
        });
        MessageHandle {
            index,
            generation: 0,
        }
    }

    pub fn get(&self, handle: MessageHandle) -> Option<&Message> {
        self.slots
            .get(handle.index as usize)
            .filter(|slot| slot.generation == handle.generation)
            .and_then(|slot| slot.message.as_ref())
    }

    pub fn get_mut(&mut self, handle: MessageHandle) -> Option<&mut Message> {
        self.slots
            .get_mut(handle.index as usize)
            .filter(|slot| slot.generation == handle.generation)
            .and_then(|slot| slot.message.as_mut())
    }

    pub fn remove(&mut self, handle: MessageHandle) -> Option<Message> {
        let slot = self
            .slots
            .get_mut(handle.index as usize)
            .filter(|slot| slot.generation == handle.generation)?;
        let message = slot.message.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(handle.index);
        self.live -= 1;
        Some(message)
    }

    pub fn len(&self) -> usize {
        self.live
    }
}

// Cross-channel index of undelivered messages, newest admission first.
// Admission keys only grow, so unlinking any handle is a pair of map removals.
#[derive(Debug, Default)]
pub struct GlobalDeliveryQueue {
    next_key: u64,
    order: BTreeMap<u64, MessageHandle>,
    keys: HashMap<MessageHandle, u64>,
}

impl GlobalDeliveryQueue {
    pub fn push_front(&mut self, handle: MessageHandle) {
        let key = self.next_key;
        self.next_key += 1;
        self.order.insert(key, handle);
        self.keys.insert(handle, key);
    }

    pub fn remove(&mut self, handle: MessageHandle) -> bool {
        match self.keys.remove(&handle) {
            Some(key) => self.order.remove(&key).is_some(),
            None => false,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &MessageHandle> {
        self.order.values().rev()
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DeliveryCounters {
    pub admitted_total: u64,
    pub retired_total: u64,
    pub purged_total: u64,
}

/// Message storage plus the global queue; always mutated under one lock so a
/// message is linked into, or unlinked from, both indexes atomically.
#[derive(Debug, Default)]
pub struct Deliveries {
    arena: MessageArena,
    queue: GlobalDeliveryQueue,
    counters: DeliveryCounters,
}

impl Deliveries {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn admit(&mut self, message: Message) -> MessageHandle {
        let handle = self.arena.insert(message);
        self.queue.push_front(handle);
        self.counters.admitted_total += 1;
        handle
    }

    pub fn get(&self, handle: MessageHandle) -> Option<&Message> {
        self.arena.get(handle)
    }

    pub fn get_mut(&mut self, handle: MessageHandle) -> Option<&mut Message> {
        self.arena.get_mut(handle)
    }

    pub fn retire(&mut self, handle: MessageHandle) -> Option<Message> {
        let message = self.unlink(handle)?;
        self.counters.retired_total += 1;
        Some(message)
    }

    // Forced removal of a message that was never fully consumed.
    pub fn purge(&mut self, handle: MessageHandle) -> Option<Message> {
        let message = self.unlink(handle)?;
        self.counters.purged_total += 1;
        Some(message)
    }

    fn unlink(&mut self, handle: MessageHandle) -> Option<Message> {
        let message = self.arena.remove(handle)?;
        self.queue.remove(handle);
        Some(message)
    }

    pub fn undelivered(&self) -> impl Iterator<Item = &Message> {
        self.queue.iter().filter_map(|handle| self.arena.get(*handle))
    }

    pub fn in_flight(&self) -> usize {
        debug_assert_eq!(self.arena.len(), self.queue.len());
        self.arena.len()
    }

    pub fn counters(&self) -> DeliveryCounters {
        self.counters
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use crate::broker::channel::{Message, OutgoingMessage};

    use super::{Deliveries, GlobalDeliveryQueue, MessageArena};

    fn message(receive_id: u32, sequence_number: u64) -> Message {
        Message::admitted(
            receive_id,
            sequence_number,
            OutgoingMessage::new("test", "alice", b"hello".to_vec()),
            Utc::now(),
        )
    }

    #[test]
    fn arena_rejects_stale_handles_after_slot_reuse() {
        let mut arena = MessageArena::default();
        let first = arena.insert(message(10, 0));
        assert!(arena.remove(first).is_some());

        let second = arena.insert(message(10, 1));
        assert_ne!(first, second);
        assert!(arena.get(first).is_none());
        assert!(arena.remove(first).is_none());
        assert_eq!(arena.get(second).map(|m| m.sequence_number), Some(1));
        assert_eq!(arena.len(), 1);
    }

    #[test]
    fn global_queue_enumerates_most_recent_admission_first() {
        let mut deliveries = Deliveries::new();
        deliveries.admit(message(10, 0));
        deliveries.admit(message(20, 0));
        deliveries.admit(message(10, 1));

        let order = deliveries
            .undelivered()
            .map(|m| (m.receive_id, m.sequence_number))
            .collect::<Vec<_>>();
        assert_eq!(order, vec![(10, 1), (20, 0), (10, 0)]);
    }

    #[test]
    fn removing_from_the_middle_keeps_the_rest_in_admission_order() {
        let mut arena = MessageArena::default();
        let mut queue = GlobalDeliveryQueue::default();
        let handles = (0..6)
            .map(|seq| {
                let handle = arena.insert(message(10, seq));
                queue.push_front(handle);
                handle
            })
            .collect::<Vec<_>>();

        assert!(queue.remove(handles[2]));
        assert!(queue.remove(handles[4]));
        assert!(!queue.remove(handles[2]));

        let recycled = {
            arena.remove(handles[2]);
            arena.insert(message(10, 6))
        };
        queue.push_front(recycled);

        let order = queue
            .iter()
            .filter_map(|handle| arena.get(*handle))
            .map(|m| m.sequence_number)
            .collect::<Vec<_>>();
        assert_eq!(order, vec![6, 5, 3, 1, 0]);
        assert_eq!(queue.len(), 5);
    }

    #[test]
    fn retire_and_purge_unlink_from_both_indexes() {
        let mut deliveries = Deliveries::new();
        let a = deliveries.admit(message(10, 0));
        let b = deliveries.admit(message(20, 0));

        assert!(deliveries.retire(a).is_some());
        assert!(deliveries.retire(a).is_none());
        assert!(deliveries.purge(b).is_some());

        assert_eq!(deliveries.in_flight(), 0);
        assert_eq!(deliveries.undelivered().count(), 0);
        let counters = deliveries.counters();
        assert_eq!(counters.admitted_total, 2);
        assert_eq!(counters.retired_total, 1);
        assert_eq!(counters.purged_total, 1);
    }
}
