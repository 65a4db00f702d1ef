//! Per-direction message sequencing.
//!
//! A `Sequencer` turns an unreliable stream of indexed messages (duplicated,
//! reordered) into an in-order, at-most-once stream. Indices start at 0.
//! At most `window` indices past the next expected one are held back; later
//! ones are refused, which bounds the reorder buffer.

use std::collections::BTreeMap;

use crate::message::ServiceMessage;

/// How an index relates to what a `Sequencer` has already seen.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum Admission {
    Fresh,
    Duplicate,
    BeyondWindow,
}

pub(crate) struct Sequencer {
    next_expected: u64,
    window: u64,
    pending: BTreeMap<u64, ServiceMessage>,
}

impl Sequencer {
    pub(crate) fn new(window: u64) -> Self {
        Self {
            next_expected: 0,
            window: window.max(1),
            pending: BTreeMap::new(),
        }
    }

    /// Index of the next message that can be released.
    pub(crate) fn next_expected(&self) -> u64 {
        self.next_expected
    }

    /// Number of messages held back waiting for a gap to fill.
    pub(crate) fn buffered(&self) -> usize {
        self.pending.len()
    }

    pub(crate) fn admit(&self, index: u64) -> Admission {
        if index < self.next_expected || self.pending.contains_key(&index) {
            Admission::Duplicate
        } else if index - self.next_expected >= self.window {
            Admission::BeyondWindow
        } else {
            Admission::Fresh
        }
    }

    /// Accepts `message` and returns every message that is now deliverable,
    /// in index order. Duplicates and messages beyond the window are dropped
    /// and yield nothing.
    pub(crate) fn accept(&mut self, message: ServiceMessage) -> Vec<ServiceMessage> {
        if self.admit(message.index()) != Admission::Fresh {
            return Vec::new();
        }
        self.pending.insert(message.index(), message);

        let mut ready = Vec::new();
        while let Some(message) = self.pending.remove(&self.next_expected) {
            ready.push(message);
            self.next_expected += 1;
        }
        ready
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::ConversationId;
    use crate::message::Payload;

    fn data(index: u64, text: &str) -> ServiceMessage {
        ServiceMessage::data(ConversationId::from("c"), index, Payload::new(text.to_string()))
    }

    fn texts(messages: Vec<ServiceMessage>) -> Vec<String> {
        messages
            .into_iter()
            .filter_map(|m| m.into_payload())
            .filter_map(|p| p.downcast::<String>().ok())
            .collect()
    }

    #[test]
    fn test_in_order_with_duplicate() {
        let mut seq = Sequencer::new(16);
        let mut delivered = Vec::new();
        for (index, text) in [(0, "One"), (1, "Two"), (1, "Two"), (2, "Three")] {
            delivered.extend(texts(seq.accept(data(index, text))));
        }
        assert_eq!(delivered, vec!["One", "Two", "Three"]);
        assert_eq!(seq.next_expected(), 3);
    }

    #[test]
    fn test_out_of_order_is_buffered() {
        let mut seq = Sequencer::new(16);
        assert!(seq.accept(data(2, "Three")).is_empty());
        assert!(seq.accept(data(1, "Two")).is_empty());
        assert_eq!(seq.buffered(), 2);

        // A duplicate of a buffered index is still a duplicate.
        assert_eq!(seq.admit(2), Admission::Duplicate);
        assert!(seq.accept(data(2, "Three again")).is_empty());

        assert_eq!(texts(seq.accept(data(0, "One"))), vec!["One", "Two", "Three"]);
        assert_eq!(seq.buffered(), 0);
    }

    #[test]
    fn test_consumed_index_is_duplicate() {
        let mut seq = Sequencer::new(16);
        seq.accept(data(0, "One"));
        assert_eq!(seq.admit(0), Admission::Duplicate);
        assert_eq!(seq.admit(1), Admission::Fresh);
        assert!(seq.accept(data(0, "One")).is_empty());
    }

    #[test]
    fn test_window_bounds_the_buffer() {
        let mut seq = Sequencer::new(4);
        assert_eq!(seq.admit(3), Admission::Fresh);
        assert_eq!(seq.admit(4), Admission::BeyondWindow);
        assert_eq!(seq.admit(u64::MAX), Admission::BeyondWindow);

        assert!(seq.accept(data(u64::MAX, "far")).is_empty());
        assert!(seq.accept(data(9, "later")).is_empty());
        assert_eq!(seq.buffered(), 0);

        // The window slides with the expected index.
        seq.accept(data(0, "One"));
        seq.accept(data(1, "Two"));
        assert_eq!(seq.admit(5), Admission::Fresh);
        assert_eq!(seq.admit(6), Admission::BeyondWindow);
    }
}
