use std::collections::VecDeque;
use std::fmt;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::broadcast;

use super::{DEFAULT_FANOUT_CAPACITY, DEFAULT_MAX_LEN, EventLog};
use crate::error::Result;
use crate::types::{FeedFrame, LoggedFrame, Sequence};

struct Ring {
    entries: VecDeque<LoggedFrame>,
    last: Sequence,
}

/// Ring buffer used when no Redis is configured, and in tests.
pub struct InMemoryEventLog {
    ring: Mutex<Ring>,
    max_len: usize,
    sender: broadcast::Sender<LoggedFrame>,
}

impl fmt::Debug for InMemoryEventLog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InMemoryEventLog")
            .field("len", &self.ring.lock().entries.len())
            .field("max_len", &self.max_len)
            .field("subscribers", &self.sender.receiver_count())
            .finish()
    }
}

impl Default for InMemoryEventLog {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_LEN)
    }
}

impl InMemoryEventLog {
    pub fn new(max_len: usize) -> Self {
        let (sender, _) = broadcast::channel(DEFAULT_FANOUT_CAPACITY);
        Self {
            ring: Mutex::new(Ring {
                entries: VecDeque::new(),
                last: Sequence::ZERO,
            }),
            max_len: max_len.max(1),
            sender,
        }
    }

    /// Sequence of the oldest retained frame.
    pub fn first_sequence(&self) -> Option<Sequence> {
        self.ring.lock().entries.front().map(|entry| entry.sequence)
    }
}

#[async_trait]
impl EventLog for InMemoryEventLog {
    async fn append(&self, frame: FeedFrame) -> Result<Sequence> {
        let logged = {
            let mut ring = self.ring.lock();
            let now = Utc::now().timestamp_millis().max(0) as u64;
            let sequence = ring.last.next_after(now);
            ring.last = sequence;

            let logged = LoggedFrame { sequence, frame };
            ring.entries.push_back(logged.clone());
            while ring.entries.len() > self.max_len {
                ring.entries.pop_front();
            }
            logged
        };

        let sequence = logged.sequence;
        // No receivers is not an error; fanout is best effort.
        let _ = self.sender.send(logged);
        Ok(sequence)
    }

    async fn read_after(&self, after: Sequence, limit: usize) -> Result<Vec<LoggedFrame>> {
        let ring = self.ring.lock();
        let start = ring.entries.partition_point(|entry| entry.sequence <= after);
        Ok(ring.entries.iter().skip(start).take(limit).cloned().collect())
    }

    async fn len(&self) -> Result<usize> {
        Ok(self.ring.lock().entries.len())
    }

    fn fanout(&self) -> broadcast::Receiver<LoggedFrame> {
        self.sender.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{FeedChannel, FrameKind, PartitionId};

    fn frame(payload: &str) -> FeedFrame {
        FeedFrame::text(FeedChannel::Canvas(PartitionId(0)), payload)
    }

    #[tokio::test]
    async fn sequences_are_strictly_increasing() {
        let log = InMemoryEventLog::new(16);
        let mut last = Sequence::ZERO;
        for i in 0..10 {
            let seq = log.append(frame(&i.to_string())).await.expect("append");
            assert!(seq > last);
            last = seq;
        }
    }

    #[tokio::test]
    async fn read_after_returns_ordered_tail() {
        let log = InMemoryEventLog::new(16);
        let mut seqs = Vec::new();
        for i in 0..5 {
            seqs.push(log.append(frame(&i.to_string())).await.expect("append"));
        }

        let tail = log.read_after(seqs[1], 10).await.expect("read");
        let payloads: Vec<_> = tail
            .iter()
            .map(|f| String::from_utf8(f.frame.payload.clone()).expect("utf8"))
            .collect();
        assert_eq!(payloads, vec!["2", "3", "4"]);

        let limited = log.read_after(Sequence::ZERO, 2).await.expect("read");
        assert_eq!(limited.len(), 2);
        assert_eq!(limited[0].sequence, seqs[0]);
    }

    #[tokio::test]
    async fn fanout_sees_appends_made_after_subscribe() {
        let log = InMemoryEventLog::new(16);
        log.append(frame("before")).await.expect("append");
        let mut rx = log.fanout();
        let seq = log.append(frame("after")).await.expect("append");

        let got = rx.recv().await.expect("fanout delivers");
        assert_eq!(got.sequence, seq);
        assert_eq!(got.frame.payload, b"after".to_vec());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn capacity_bound_evicts_oldest_entry() {
        let cap = DEFAULT_MAX_LEN;
        let log = InMemoryEventLog::new(cap);
        let empty = FeedFrame {
            channel: FeedChannel::Configuration,
            kind: FrameKind::Binary,
            payload: Vec::new(),
            received_at: Utc::now(),
        };

        let first = log.append(empty.clone()).await.expect("append first");
        let second = log.append(empty.clone()).await.expect("append second");
        for _ in 2..=cap {
            log.append(empty.clone()).await.expect("append");
        }

        assert_eq!(log.len().await.expect("len"), cap);
        assert_ne!(log.first_sequence(), Some(first));
        assert_eq!(log.first_sequence(), Some(second));
    }
}
