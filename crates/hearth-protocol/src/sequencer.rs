use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::message::Message;

/// What [`Sequencer::push`] did with a message.
#[derive(Debug, PartialEq, Eq)]
pub enum Sequenced {
    /// Messages now deliverable, in sender order. Empty while a gap is open.
    Deliver(Vec<Message>),
    /// The message's slot was already released; it can't be placed in order.
    Late(Message),
}

/// Per-conversation reorder buffer.
///
/// Messages are ordered by the sender's ratchet counter, one stream per
/// `(chat_id, sender_id)`. A message waits until every lower counter has been
/// released. If more than `max_pending` messages pile up behind a gap, the
/// gap is given up on and the buffer moves past it.
///
/// A counter whose frame can never be delivered (it failed to decrypt) is
/// marked with [`Sequencer::skip`] and passed over as soon as a later message
/// is waiting, so one bad frame doesn't hold up the rest of the conversation.
///
/// A stream also carries an epoch (the session's base key). When the sender
/// starts a new session its counter restarts, so a new epoch starts a fresh
/// stream after releasing whatever the old one still held.
pub struct Sequencer {
    streams: HashMap<(String, String), Stream>,
    max_pending: usize,
}

struct Stream {
    epoch: Vec<u8>,
    /// Next counter to release.
    next: u64,
    pending: BTreeMap<u64, Message>,
    /// Counters given up on, passed over once something later is waiting.
    skipped: BTreeSet<u64>,
}

impl Stream {
    fn new(epoch: &[u8]) -> Self {
        Self {
            epoch: epoch.to_vec(),
            next: 0,
            pending: BTreeMap::new(),
            skipped: BTreeSet::new(),
        }
    }

    fn release(&mut self, out: &mut Vec<Message>) {
        loop {
            if let Some(message) = self.pending.remove(&self.next) {
                out.push(message);
            } else if !self.pending.is_empty() && self.skipped.remove(&self.next) {
                tracing::debug!(seq = self.next, "passing over undeliverable message");
            } else {
                break;
            }
            self.next += 1;
        }
        let next = self.next;
        self.skipped.retain(|&seq| seq >= next);
    }
}

/// The stream for `(chat_id, sender_id)`, restarted if `epoch` is new. A
/// restart moves whatever the old stream still held into `out`.
fn stream_for<'a>(
    streams: &'a mut HashMap<(String, String), Stream>,
    chat_id: &str,
    sender_id: &str,
    epoch: &[u8],
    out: &mut Vec<Message>,
) -> &'a mut Stream {
    let stream = streams
        .entry((chat_id.to_string(), sender_id.to_string()))
        .or_insert_with(|| Stream::new(epoch));
    if stream.epoch != epoch {
        tracing::debug!(
            chat = %chat_id,
            sender = %sender_id,
            flushed = stream.pending.len(),
            "sender started a new session"
        );
        out.extend(std::mem::take(&mut stream.pending).into_values());
        *stream = Stream::new(epoch);
    }
    stream
}

impl Sequencer {
    pub fn new(max_pending: usize) -> Self {
        Self {
            streams: HashMap::new(),
            max_pending: max_pending.max(1),
        }
    }

    pub fn push(&mut self, epoch: &[u8], message: Message) -> Sequenced {
        let mut out = Vec::new();
        let stream = stream_for(
            &mut self.streams,
            &message.chat_id,
            &message.sender_id,
            epoch,
            &mut out,
        );

        let seq = message.sequence;
        if seq < stream.next {
            tracing::warn!(seq, expected = stream.next, sender = %message.sender_id, "late message");
            return Sequenced::Late(message);
        }
        stream.pending.insert(seq, message);
        stream.release(&mut out);

        while stream.pending.len() > self.max_pending {
            let Some(&resume) = stream.pending.keys().next() else {
                break;
            };
            tracing::warn!(
                from = stream.next,
                to = resume,
                waiting = stream.pending.len(),
                "skipping gap in message sequence"
            );
            stream.next = resume;
            stream.release(&mut out);
        }

        Sequenced::Deliver(out)
    }

    /// Give up on counter `seq`. Returns messages released because of it,
    /// which is none until a later message is waiting.
    pub fn skip(&mut self, epoch: &[u8], chat_id: &str, sender_id: &str, seq: u64) -> Vec<Message> {
        let mut out = Vec::new();
        let stream = stream_for(&mut self.streams, chat_id, sender_id, epoch, &mut out);
        if seq >= stream.next && stream.skipped.len() < self.max_pending {
            stream.skipped.insert(seq);
            stream.release(&mut out);
        }
        out
    }

    /// Messages waiting behind gaps, across all streams.
    pub fn pending(&self) -> usize {
        self.streams.values().map(|s| s.pending.len()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::MessageType;

    fn message(sender: &str, seq: u64) -> Message {
        Message {
            id: format!("{sender}-{seq}"),
            content: String::new(),
            sender_id: sender.into(),
            recipient_id: "me".into(),
            chat_id: format!("{sender}:me"),
            message_type: MessageType::Text,
            created_at: 0,
            is_encrypted: true,
            is_read: false,
            is_delivered: false,
            sequence: seq,
        }
    }

    fn seqs(result: Sequenced) -> Vec<u64> {
        match result {
            Sequenced::Deliver(messages) => messages.iter().map(|m| m.sequence).collect(),
            Sequenced::Late(m) => panic!("unexpected late message {}", m.sequence),
        }
    }

    #[test]
    fn in_order_passes_through() {
        let mut seq = Sequencer::new(8);
        assert_eq!(seqs(seq.push(b"e", message("bob", 0))), vec![0]);
        assert_eq!(seqs(seq.push(b"e", message("bob", 1))), vec![1]);
    }

    #[test]
    fn reordered_released_in_counter_order() {
        let mut seq = Sequencer::new(8);
        assert!(seqs(seq.push(b"e", message("bob", 2))).is_empty());
        assert!(seqs(seq.push(b"e", message("bob", 1))).is_empty());
        assert_eq!(seq.pending(), 2);
        assert_eq!(seqs(seq.push(b"e", message("bob", 0))), vec![0, 1, 2]);
        assert_eq!(seq.pending(), 0);
    }

    #[test]
    fn senders_are_independent() {
        let mut seq = Sequencer::new(8);
        assert!(seqs(seq.push(b"e", message("bob", 1))).is_empty());
        assert_eq!(seqs(seq.push(b"f", message("carol", 0))), vec![0]);
    }

    #[test]
    fn gap_skipped_past_max_pending() {
        let mut seq = Sequencer::new(2);
        assert!(seqs(seq.push(b"e", message("bob", 1))).is_empty());
        assert!(seqs(seq.push(b"e", message("bob", 2))).is_empty());
        assert_eq!(seqs(seq.push(b"e", message("bob", 3))), vec![1, 2, 3]);

        assert!(matches!(seq.push(b"e", message("bob", 0)), Sequenced::Late(_)));
        assert_eq!(seqs(seq.push(b"e", message("bob", 4))), vec![4]);
    }

    #[test]
    fn skipped_slot_passed_once_later_message_waits() {
        let mut seq = Sequencer::new(8);
        assert_eq!(seqs(seq.push(b"e", message("bob", 0))), vec![0]);
        assert!(seq.skip(b"e", "bob:me", "bob", 1).is_empty());
        assert_eq!(seqs(seq.push(b"e", message("bob", 2))), vec![2]);
        assert_eq!(seqs(seq.push(b"e", message("bob", 3))), vec![3]);
    }

    #[test]
    fn skipped_slot_still_taken_by_timely_arrival() {
        let mut seq = Sequencer::new(8);
        seqs(seq.push(b"e", message("bob", 0)));
        assert!(seq.skip(b"e", "bob:me", "bob", 1).is_empty());
        assert_eq!(seqs(seq.push(b"e", message("bob", 1))), vec![1]);
        assert_eq!(seqs(seq.push(b"e", message("bob", 2))), vec![2]);
    }

    #[test]
    fn skip_releases_messages_already_waiting() {
        let mut seq = Sequencer::new(8);
        assert!(seqs(seq.push(b"e", message("bob", 1))).is_empty());
        let released: Vec<u64> = seq
            .skip(b"e", "bob:me", "bob", 0)
            .iter()
            .map(|m| m.sequence)
            .collect();
        assert_eq!(released, vec![1]);
        assert_eq!(seq.pending(), 0);
    }

    #[test]
    fn new_epoch_restarts_counter() {
        let mut seq = Sequencer::new(8);
        seqs(seq.push(b"old", message("bob", 0)));
        assert!(seqs(seq.push(b"old", message("bob", 5))).is_empty());

        assert_eq!(seqs(seq.push(b"new", message("bob", 0))), vec![5, 0]);
        assert_eq!(seqs(seq.push(b"new", message("bob", 1))), vec![1]);
    }
}
