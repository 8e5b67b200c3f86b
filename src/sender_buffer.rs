use std::cmp::Reverse;
use std::sync::Arc;
use std::time::Duration;
use rustc_hash::FxHashMap;
use tokio::time::Instant;
use tracing::{trace, warn};
use crate::message::{Channel, Message, SequenceNumber};

struct Entry {
    message: Arc<Message>,
    /// time of the most recent (re)transmission - the entry is eligible for retransmission
    ///  once an RTO has passed since then
    registration_time: Instant,
    first_transmission: Instant,
    transmissions: u32,
    /// tie-breaker for entries registered at the same instant
    registration_order: u64,
}

/// An entry that was removed from the buffer because the peer acknowledged it
pub struct AcknowledgedMessage {
    pub message: Arc<Message>,
    pub first_transmission: Instant,
    /// number of times the message was put on the wire, including the initial transmission
    pub transmissions: u32,
}

/// Holds every message a connection transmitted that the peer has not acknowledged yet, keyed
///  by channel and sequence number.
///
/// The buffer never drops a message on its own: entries leave only through [SenderBuffer::acknowledge]
///  or [SenderBuffer::clear] (or by dropping the buffer), so every registered message keeps being
///  retransmitted until it is acknowledged or the connection goes away.
pub struct SenderBuffer {
    entries: FxHashMap<(Channel, SequenceNumber), Entry>,
    registered_bytes: usize,
    next_registration_order: u64,
}

impl Default for SenderBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl SenderBuffer {
    pub fn new() -> SenderBuffer {
        SenderBuffer {
            entries: FxHashMap::default(),
            registered_bytes: 0,
            next_registration_order: 0,
        }
    }

    /// Takes ownership of `message`, with `now` as the time of its first transmission. A message
    ///  with the same channel and sequence number as a registered one is handed back unchanged.
    pub fn register(&mut self, message: Arc<Message>, now: Instant) -> Result<(), Arc<Message>> {
        let key = (message.channel(), message.sequence_number());
        if self.entries.contains_key(&key) {
            warn!("duplicate registration of message {:?} - this is a bug", message);
            return Err(message);
        }

        trace!("registering {:?}", message);
        self.registered_bytes += message.approximate_size();
        self.entries.insert(key, Entry {
            message,
            registration_time: now,
            first_transmission: now,
            transmissions: 1,
            registration_order: self.next_registration_order,
        });
        self.next_registration_order += 1;
        Ok(())
    }

    /// Removes the entry for an acked message. Unknown keys are ignored since acks can be
    ///  duplicated or arrive late.
    pub fn acknowledge(&mut self, channel: Channel, sequence_number: SequenceNumber) -> Option<AcknowledgedMessage> {
        let entry = self.entries.remove(&(channel, sequence_number))?;
        self.registered_bytes -= entry.message.approximate_size();

        trace!("acknowledged {:?} after {} transmission(s)", entry.message, entry.transmissions);
        Some(AcknowledgedMessage {
            message: entry.message,
            first_transmission: entry.first_transmission,
            transmissions: entry.transmissions,
        })
    }

    /// Selects all messages that were last (re)transmitted at least `rto` ago, highest priority
    ///  first and oldest first within the same priority. Every message the returned iterator
    ///  yields is re-armed with `now`, so it becomes eligible again only after another `rto`.
    ///  Messages the caller does not consume stay eligible.
    pub fn collect_retransmissions(&mut self, now: Instant, rto: Duration) -> Retransmissions<'_> {
        let mut due = self.entries.iter()
            .filter(|(_, e)| now.saturating_duration_since(e.registration_time) >= rto)
            .map(|(&key, e)| (Reverse(e.message.priority()), e.registration_time, e.registration_order, key))
            .collect::<Vec<_>>();
        due.sort_unstable_by_key(|&(priority, registration_time, registration_order, _)| (priority, registration_time, registration_order));

        Retransmissions {
            buffer: self,
            due: due.into_iter()
                .map(|(_, _, _, key)| key)
                .collect::<Vec<_>>()
                .into_iter(),
            now,
        }
    }

    pub fn contains(&self, channel: Channel, sequence_number: SequenceNumber) -> bool {
        self.entries.contains_key(&(channel, sequence_number))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// sum of the approximate sizes of all registered messages
    pub fn registered_bytes(&self) -> usize {
        self.registered_bytes
    }

    /// Drops all registered messages, returning their number
    pub fn clear(&mut self) -> usize {
        let num_dropped = self.entries.len();
        self.entries.clear();
        self.registered_bytes = 0;
        num_dropped
    }
}

pub struct Retransmissions<'a> {
    buffer: &'a mut SenderBuffer,
    due: std::vec::IntoIter<(Channel, SequenceNumber)>,
    now: Instant,
}

impl Iterator for Retransmissions<'_> {
    type Item = Arc<Message>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let key = self.due.next()?;
            if let Some(entry) = self.buffer.entries.get_mut(&key) {
                entry.registration_time = self.now;
                entry.transmissions += 1;
                return Some(entry.message.clone());
            }
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (0, Some(self.due.len()))
    }
}
