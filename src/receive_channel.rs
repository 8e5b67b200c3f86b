use bytes::Bytes;
use rustc_hash::FxHashMap;
use tracing::trace;
use crate::message::SequenceNumber;

#[derive(Debug, Eq, PartialEq)]
pub enum ReceiveOutcome {
    /// The message was the next expected one. It is returned together with all directly
    ///  following messages that were buffered before, in sequence order.
    Delivered(Vec<Bytes>),
    /// The message arrived ahead of a gap and is held back until the gap is filled
    Buffered,
    /// The message was received before. The sender apparently missed the ack.
    Duplicate,
    /// Too far ahead to be buffered. It is dropped without ack so the sender retransmits it later.
    OutOfWindow,
}

impl ReceiveOutcome {
    /// Everything except messages beyond the receive window is acknowledged
    pub fn should_ack(&self) -> bool {
        !matches!(self, ReceiveOutcome::OutOfWindow)
    }
}

/// Receive side of a single channel: restores sequence order and filters duplicates.
pub struct ReceiveChannel {
    next_expected: SequenceNumber,
    pending: FxHashMap<SequenceNumber, Bytes>,
    window_size: u16,
}

impl ReceiveChannel {
    pub fn new(window_size: u16) -> ReceiveChannel {
        ReceiveChannel {
            next_expected: SequenceNumber::ZERO,
            pending: FxHashMap::default(),
            window_size,
        }
    }

    pub fn next_expected(&self) -> SequenceNumber {
        self.next_expected
    }

    pub fn num_pending(&self) -> usize {
        self.pending.len()
    }

    pub fn on_message(&mut self, sequence_number: SequenceNumber, payload: Bytes) -> ReceiveOutcome {
        let distance = sequence_number.distance_from(self.next_expected);

        if distance < 0 {
            trace!("duplicate message {} (expecting {})", sequence_number, self.next_expected);
            return ReceiveOutcome::Duplicate;
        }
        if distance >= self.window_size as i32 {
            trace!("message {} is beyond the receive window (expecting {})", sequence_number, self.next_expected);
            return ReceiveOutcome::OutOfWindow;
        }

        if distance > 0 {
            if self.pending.contains_key(&sequence_number) {
                return ReceiveOutcome::Duplicate;
            }
            self.pending.insert(sequence_number, payload);
            return ReceiveOutcome::Buffered;
        }

        let mut delivered = vec![payload];
        self.next_expected = self.next_expected.next();
        while let Some(p) = self.pending.remove(&self.next_expected) {
            delivered.push(p);
            self.next_expected = self.next_expected.next();
        }
        ReceiveOutcome::Delivered(delivered)
    }
}
