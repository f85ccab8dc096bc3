//! Bounded outbound queue.
//!
//! Single producer (the dispatcher), single consumer (the connection's
//! writer task). The queue carries the configured overflow policy and a
//! close reason so the writer can emit the right close code after
//! flushing what remains.

use crate::frames::PushFrame;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Mutex;
use tokio::sync::Notify;

/// What to do when a connection's queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverflowPolicy {
    /// Drop the oldest queued frame; latest wins.
    DropOldest,
    /// Close the connection; the client replays from `last_event_id`.
    Disconnect,
    /// Apply backpressure to the dispatcher. Only safe when the
    /// dispatcher acks `all_connected`.
    Block,
}

impl OverflowPolicy {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "drop_oldest" => Some(OverflowPolicy::DropOldest),
            "disconnect" => Some(OverflowPolicy::Disconnect),
            "block" => Some(OverflowPolicy::Block),
            _ => None,
        }
    }
}

/// Why a connection is being closed; maps onto the wire close code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    Normal,
    Overflow,
    Evicted,
    CredentialExpired,
    Liveness,
    ServerError,
}

impl CloseReason {
    pub fn close_code(&self) -> u16 {
        match self {
            CloseReason::Normal => 1000,
            CloseReason::CredentialExpired => 1008,
            CloseReason::ServerError => 1011,
            // Tenant eviction and queue overflow share the private
            // eviction code; the client's recovery is identical.
            CloseReason::Overflow | CloseReason::Evicted => 4001,
            CloseReason::Liveness => 4002,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CloseReason::Normal => "normal",
            CloseReason::Overflow => "queue overflow",
            CloseReason::Evicted => "tenant evicted",
            CloseReason::CredentialExpired => "credential expired",
            CloseReason::Liveness => "liveness timeout",
            CloseReason::ServerError => "server error",
        }
    }
}

/// Outcome of a push.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Enqueued,
    /// Enqueued after evicting the oldest frame.
    DroppedOldest,
    /// Rejected: the queue is full and the policy says disconnect.
    Overflow,
}

#[derive(Debug)]
struct Inner {
    items: VecDeque<PushFrame>,
    closed: Option<CloseReason>,
}

/// Bounded frame queue between dispatcher and connection writer.
pub struct OutboundQueue {
    inner: Mutex<Inner>,
    capacity: usize,
    readable: Notify,
    writable: Notify,
}

impl OutboundQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                items: VecDeque::with_capacity(capacity.min(64)),
                closed: None,
            }),
            capacity,
            readable: Notify::new(),
            writable: Notify::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("lock poisoned").items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().expect("lock poisoned").closed.is_some()
    }

    /// Close the queue. The first reason sticks; the writer flushes
    /// remaining frames and then observes the reason.
    pub fn close(&self, reason: CloseReason) {
        let mut inner = self.inner.lock().expect("lock poisoned");
        if inner.closed.is_none() {
            inner.closed = Some(reason);
        }
        drop(inner);
        self.readable.notify_waiters();
        self.writable.notify_waiters();
    }

    /// Enqueue a frame under the given overflow policy.
    pub async fn push(
        &self,
        frame: PushFrame,
        policy: OverflowPolicy,
    ) -> Result<PushOutcome, CloseReason> {
        match policy {
            OverflowPolicy::DropOldest => {
                let mut inner = self.inner.lock().expect("lock poisoned");
                if let Some(reason) = inner.closed {
                    return Err(reason);
                }
                let outcome = if inner.items.len() >= self.capacity {
                    inner.items.pop_front();
                    PushOutcome::DroppedOldest
                } else {
                    PushOutcome::Enqueued
                };
                inner.items.push_back(frame);
                drop(inner);
                self.readable.notify_one();
                Ok(outcome)
            }
            OverflowPolicy::Disconnect => {
                let mut inner = self.inner.lock().expect("lock poisoned");
                if let Some(reason) = inner.closed {
                    return Err(reason);
                }
                if inner.items.len() >= self.capacity {
                    return Ok(PushOutcome::Overflow);
                }
                inner.items.push_back(frame);
                drop(inner);
                self.readable.notify_one();
                Ok(PushOutcome::Enqueued)
            }
            OverflowPolicy::Block => loop {
                let waiter = self.writable.notified();
                tokio::pin!(waiter);
                waiter.as_mut().enable();

                {
                    let mut inner = self.inner.lock().expect("lock poisoned");
                    if let Some(reason) = inner.closed {
                        return Err(reason);
                    }
                    if inner.items.len() < self.capacity {
                        inner.items.push_back(frame);
                        drop(inner);
                        self.readable.notify_one();
                        return Ok(PushOutcome::Enqueued);
                    }
                }

                waiter.await;
            },
        }
    }

    /// Enqueue a control frame regardless of capacity. Control traffic
    /// (pong, stats, errors) must not be starved by a full event queue.
    pub fn push_control(&self, frame: PushFrame) -> Result<(), CloseReason> {
        let mut inner = self.inner.lock().expect("lock poisoned");
        if let Some(reason) = inner.closed {
            return Err(reason);
        }
        inner.items.push_back(frame);
        drop(inner);
        self.readable.notify_one();
        Ok(())
    }

    /// Dequeue the next frame; once the queue is closed and drained,
    /// yields the close reason.
    pub async fn pop(&self) -> Result<PushFrame, CloseReason> {
        loop {
            let waiter = self.readable.notified();
            tokio::pin!(waiter);
            waiter.as_mut().enable();

            {
                let mut inner = self.inner.lock().expect("lock poisoned");
                if let Some(frame) = inner.items.pop_front() {
                    drop(inner);
                    self.writable.notify_one();
                    return Ok(frame);
                }
                if let Some(reason) = inner.closed {
                    return Err(reason);
                }
            }

            waiter.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    fn frame(n: i64) -> PushFrame {
        PushFrame::Pong { timestamp: Some(n) }
    }

    fn frame_number(frame: &PushFrame) -> i64 {
        match frame {
            PushFrame::Pong { timestamp } => timestamp.unwrap(),
            other => panic!("unexpected frame {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_fifo_order() {
        let queue = OutboundQueue::new(8);
        for n in 0..4 {
            queue.push(frame(n), OverflowPolicy::Disconnect).await.unwrap();
        }
        for n in 0..4 {
            assert_eq!(frame_number(&queue.pop().await.unwrap()), n);
        }
    }

    #[tokio::test]
    async fn test_disconnect_policy_reports_overflow() {
        let queue = OutboundQueue::new(2);
        assert_eq!(
            queue.push(frame(0), OverflowPolicy::Disconnect).await.unwrap(),
            PushOutcome::Enqueued
        );
        queue.push(frame(1), OverflowPolicy::Disconnect).await.unwrap();
        assert_eq!(
            queue.push(frame(2), OverflowPolicy::Disconnect).await.unwrap(),
            PushOutcome::Overflow
        );
        // The overflowing frame was not enqueued.
        assert_eq!(queue.len(), 2);
    }

    #[tokio::test]
    async fn test_drop_oldest_policy_keeps_latest() {
        let queue = OutboundQueue::new(2);
        queue.push(frame(0), OverflowPolicy::DropOldest).await.unwrap();
        queue.push(frame(1), OverflowPolicy::DropOldest).await.unwrap();
        assert_eq!(
            queue.push(frame(2), OverflowPolicy::DropOldest).await.unwrap(),
            PushOutcome::DroppedOldest
        );

        assert_eq!(frame_number(&queue.pop().await.unwrap()), 1);
        assert_eq!(frame_number(&queue.pop().await.unwrap()), 2);
    }

    #[tokio::test]
    async fn test_block_policy_waits_for_capacity() {
        let queue = Arc::new(OutboundQueue::new(1));
        queue.push(frame(0), OverflowPolicy::Block).await.unwrap();

        let producer = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.push(frame(1), OverflowPolicy::Block).await })
        };

        // The producer is parked on a full queue.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!producer.is_finished());

        // Draining one frame unblocks it.
        assert_eq!(frame_number(&queue.pop().await.unwrap()), 0);
        let outcome = tokio::time::timeout(Duration::from_secs(1), producer)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(outcome, PushOutcome::Enqueued);
    }

    #[tokio::test]
    async fn test_close_flushes_then_reports_reason() {
        let queue = OutboundQueue::new(8);
        queue.push(frame(0), OverflowPolicy::Disconnect).await.unwrap();
        queue.close(CloseReason::Overflow);

        // Queued frames still drain before the reason surfaces.
        assert_eq!(frame_number(&queue.pop().await.unwrap()), 0);
        assert_eq!(queue.pop().await.unwrap_err(), CloseReason::Overflow);

        // Pushes after close are rejected with the reason.
        let rejected = queue.push(frame(1), OverflowPolicy::Disconnect).await;
        assert_eq!(rejected.unwrap_err(), CloseReason::Overflow);
        assert_eq!(queue.push_control(frame(2)).unwrap_err(), CloseReason::Overflow);
    }

    #[tokio::test]
    async fn test_first_close_reason_wins() {
        let queue = OutboundQueue::new(8);
        queue.close(CloseReason::Liveness);
        queue.close(CloseReason::Normal);
        assert_eq!(queue.pop().await.unwrap_err(), CloseReason::Liveness);
    }

    #[tokio::test]
    async fn test_close_wakes_blocked_producer() {
        let queue = Arc::new(OutboundQueue::new(1));
        queue.push(frame(0), OverflowPolicy::Block).await.unwrap();

        let producer = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.push(frame(1), OverflowPolicy::Block).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        queue.close(CloseReason::Evicted);
        let result = tokio::time::timeout(Duration::from_secs(1), producer)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(result.unwrap_err(), CloseReason::Evicted);
    }

    #[tokio::test]
    async fn test_push_control_ignores_capacity() {
        let queue = OutboundQueue::new(1);
        queue.push(frame(0), OverflowPolicy::Disconnect).await.unwrap();
        queue.push_control(frame(99)).unwrap();
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn test_close_codes() {
        assert_eq!(CloseReason::Normal.close_code(), 1000);
        assert_eq!(CloseReason::CredentialExpired.close_code(), 1008);
        assert_eq!(CloseReason::ServerError.close_code(), 1011);
        assert_eq!(CloseReason::Overflow.close_code(), 4001);
        assert_eq!(CloseReason::Evicted.close_code(), 4001);
        assert_eq!(CloseReason::Liveness.close_code(), 4002);
    }

    #[test]
    fn test_overflow_policy_parse() {
        assert_eq!(OverflowPolicy::parse("drop_oldest"), Some(OverflowPolicy::DropOldest));
        assert_eq!(OverflowPolicy::parse("disconnect"), Some(OverflowPolicy::Disconnect));
        assert_eq!(OverflowPolicy::parse("block"), Some(OverflowPolicy::Block));
        assert_eq!(OverflowPolicy::parse("yolo"), None);
    }
}
