//! Outbound reliability queues.
//!
//! - [`ReliableQueue`]: unordered. Every in-flight packet is tracked by id and acked
//!   independently.
//! - [`OrderedQueue`]: FIFO. Only the head is in flight; the next packet goes out when the
//!   head is acked. The receiver therefore sees ordered packets in send order without a
//!   reorder buffer.
//!
//! Both resend a packet once its age exceeds the ack deadline (ack-await delay plus the
//! current ping). There is no attempt cap; persistent silence ends in a connection timeout.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{trace, warn};

use crate::error::constants;

/// A sent datagram awaiting its ack.
#[derive(Debug, Clone)]
pub struct PendingPacket {
    pub id: u16,
    pub datagram: Arc<[u8]>,
    pub attempts: u32,
    pub last_attempt: Instant,
}

impl PendingPacket {
    fn new(id: u16, datagram: Arc<[u8]>, now: Instant) -> Self {
        Self {
            id,
            datagram,
            attempts: 1,
            last_attempt: now,
        }
    }

    fn is_overdue(&self, now: Instant, deadline: Duration) -> bool {
        now.saturating_duration_since(self.last_attempt) > deadline
    }
}

/// A datagram that has to be (re)sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resend {
    pub id: u16,
    pub datagram: Arc<[u8]>,
}

#[derive(Debug, Default)]
pub struct ReliableQueue {
    entries: DashMap<u16, PendingPacket>,
}

impl ReliableQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Starts tracking a packet that has just been sent.
    pub fn track(&self, id: u16, datagram: Arc<[u8]>, now: Instant) {
        self.entries
            .insert(id, PendingPacket::new(id, datagram, now));
    }

    /// Removes the acked packet. Returns `false` for unknown ids.
    pub fn ack(&self, id: u16) -> bool {
        self.entries.remove(&id).is_some()
    }

    pub fn contains(&self, id: u16) -> bool {
        self.entries.contains_key(&id)
    }

    /// Collects every packet past its deadline and stamps a new attempt on it.
    pub fn collect_overdue(&self, now: Instant, deadline: Duration) -> Vec<Resend> {
        let mut out = Vec::new();
        for mut entry in self.entries.iter_mut() {
            if entry.is_overdue(now, deadline) {
                entry.attempts += 1;
                entry.last_attempt = now;
                trace!(id = entry.id, attempts = entry.attempts, "Reliable resend");
                out.push(Resend {
                    id: entry.id,
                    datagram: Arc::clone(&entry.datagram),
                });
            }
        }
        out
    }
}

/// Result of an ack against the ordered queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrderedAck {
    /// The head was acked; the new head (if any) must be sent now.
    Released(Option<Resend>),
    /// The id is queued but not at the head.
    NotHead,
    /// The id is not in the queue.
    Unknown,
}

/// Queue entry; the head carries its in-flight state.
#[derive(Debug)]
struct Queued {
    id: u16,
    datagram: Arc<[u8]>,
}

#[derive(Debug, Default)]
struct OrderedState {
    queue: VecDeque<Queued>,
    head: Option<PendingPacket>,
}

#[derive(Debug, Default)]
pub struct OrderedQueue {
    state: Mutex<OrderedState>,
}

impl OrderedQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of packets waiting, including the head.
    pub fn len(&self) -> usize {
        let state = self.state.lock();
        state.queue.len() + usize::from(state.head.is_some())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Appends a packet. Returns `true` if it became the head and must be sent now.
    pub fn push(&self, id: u16, datagram: Arc<[u8]>, now: Instant) -> bool {
        let mut state = self.state.lock();
        if state.head.is_none() {
            state.head = Some(PendingPacket::new(id, datagram, now));
            true
        } else {
            state.queue.push_back(Queued { id, datagram });
            false
        }
    }

    pub fn ack(&self, id: u16, now: Instant) -> OrderedAck {
        let mut state = self.state.lock();
        match &state.head {
            Some(head) if head.id == id => {}
            _ => {
                return if state.queue.iter().any(|queued| queued.id == id) {
                    warn!(id, "{}", constants::WARN_NON_HEAD_ACK);
                    OrderedAck::NotHead
                } else {
                    OrderedAck::Unknown
                };
            }
        }

        let next = state
            .queue
            .pop_front()
            .map(|next| PendingPacket::new(next.id, next.datagram, now));
        state.head = next;
        OrderedAck::Released(state.head.as_ref().map(|head| Resend {
            id: head.id,
            datagram: Arc::clone(&head.datagram),
        }))
    }

    /// The head, if it is past its deadline, stamped with a new attempt.
    pub fn overdue_head(&self, now: Instant, deadline: Duration) -> Option<Resend> {
        let mut state = self.state.lock();
        let head = state.head.as_mut()?;
        if !head.is_overdue(now, deadline) {
            return None;
        }
        head.attempts += 1;
        head.last_attempt = now;
        trace!(id = head.id, attempts = head.attempts, "Ordered resend");
        Some(Resend {
            id: head.id,
            datagram: Arc::clone(&head.datagram),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn datagram(byte: u8) -> Arc<[u8]> {
        Arc::from(vec![byte; 4])
    }

    #[test]
    fn test_reliable_ack_removes() {
        let queue = ReliableQueue::new();
        let now = Instant::now();
        queue.track(1, datagram(1), now);
        queue.track(2, datagram(2), now);
        assert!(queue.ack(2));
        assert!(!queue.ack(2));
        assert_eq!(queue.len(), 1);
        assert!(queue.contains(1));
    }

    #[test]
    fn test_reliable_resend_after_deadline() {
        let queue = ReliableQueue::new();
        let start = Instant::now();
        let deadline = Duration::from_millis(100);
        queue.track(7, datagram(7), start);

        assert!(queue
            .collect_overdue(start + Duration::from_millis(50), deadline)
            .is_empty());
        let resends = queue.collect_overdue(start + Duration::from_millis(150), deadline);
        assert_eq!(resends.len(), 1);
        assert_eq!(resends[0].id, 7);

        // the attempt restarted the clock
        assert!(queue
            .collect_overdue(start + Duration::from_millis(200), deadline)
            .is_empty());
    }

    #[test]
    fn test_ordered_only_head_in_flight() {
        let queue = OrderedQueue::new();
        let now = Instant::now();
        assert!(queue.push(1, datagram(1), now));
        assert!(!queue.push(2, datagram(2), now));
        assert!(!queue.push(3, datagram(3), now));
        assert_eq!(queue.len(), 3);

        match queue.ack(1, now) {
            OrderedAck::Released(Some(next)) => assert_eq!(next.id, 2),
            other => panic!("unexpected {other:?}"),
        }
        match queue.ack(2, now) {
            OrderedAck::Released(Some(next)) => assert_eq!(next.id, 3),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(queue.ack(3, now), OrderedAck::Released(None));
        assert!(queue.is_empty());
    }

    #[test]
    fn test_ordered_non_head_ack_ignored() {
        let queue = OrderedQueue::new();
        let now = Instant::now();
        queue.push(1, datagram(1), now);
        queue.push(2, datagram(2), now);

        assert_eq!(queue.ack(2, now), OrderedAck::NotHead);
        assert_eq!(queue.ack(99, now), OrderedAck::Unknown);
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn test_ordered_resends_head_only() {
        let queue = OrderedQueue::new();
        let start = Instant::now();
        let deadline = Duration::from_millis(10);
        queue.push(1, datagram(1), start);
        queue.push(2, datagram(2), start);

        let resend = queue
            .overdue_head(start + Duration::from_millis(20), deadline)
            .map(|r| r.id);
        assert_eq!(resend, Some(1));
        assert!(queue
            .overdue_head(start + Duration::from_millis(25), deadline)
            .is_none());
    }
}
