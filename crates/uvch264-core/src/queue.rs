//! Frame hand-off queue.
//!
//! FIFO of timestamped access units between the capture callback and the
//! pull-based consumer. The producer side never blocks under the default
//! policy; the consumer blocks until a unit arrives, the queue is flushed,
//! or every producer has gone away.

use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use crossbeam_channel::{
    bounded, unbounded, Receiver, RecvTimeoutError, SendTimeoutError, Sender, TrySendError,
};
use thiserror::Error;
use tracing::{debug, trace};

use crate::stats::SessionStats;
use crate::timing::Timing;

/// How often a blocked pop or push re-checks the control flags.
const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// One output buffer. Slices carry timing; other forwarded units (SEI,
/// delimiters) go out untimestamped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessUnit {
    pub data: Bytes,
    pub timing: Option<Timing>,
    pub keyframe: bool,
}

impl AccessUnit {
    pub fn pts(&self) -> Option<u64> {
        self.timing.map(|t| t.pts)
    }
}

/// What a bounded queue does when the consumer falls behind.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OverflowPolicy {
    /// Discard the oldest queued unit to make room.
    #[default]
    DropOldest,
    /// Stall the producer until there is room.
    Block,
}

impl OverflowPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            OverflowPolicy::DropOldest => "drop-oldest",
            OverflowPolicy::Block => "block",
        }
    }
}

impl FromStr for OverflowPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "drop-oldest" | "drop_oldest" => Ok(OverflowPolicy::DropOldest),
            "block" => Ok(OverflowPolicy::Block),
            other => Err(format!(
                "unknown overflow policy '{}', expected 'drop-oldest' or 'block'",
                other
            )),
        }
    }
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum PopError {
    #[error("streaming has not started")]
    NotStarted,
    #[error("queue is flushing")]
    Flushing,
    #[error("all producers have stopped")]
    Closed,
}

#[derive(Default)]
struct Shared {
    streaming: AtomicBool,
    flushing: AtomicBool,
    producers: AtomicUsize,
}

pub struct FrameQueue {
    tx: Sender<AccessUnit>,
    rx: Receiver<AccessUnit>,
    capacity: usize,
    policy: OverflowPolicy,
    shared: Arc<Shared>,
}

impl FrameQueue {
    /// `capacity == 0` means unbounded, in which case `policy` never applies.
    pub fn new(capacity: usize, policy: OverflowPolicy) -> Self {
        let (tx, rx) = if capacity == 0 {
            unbounded()
        } else {
            bounded(capacity)
        };
        Self {
            tx,
            rx,
            capacity,
            policy,
            shared: Arc::new(Shared::default()),
        }
    }

    pub fn unbounded() -> Self {
        Self::new(0, OverflowPolicy::default())
    }

    pub fn capacity(&self) -> Option<usize> {
        (self.capacity > 0).then_some(self.capacity)
    }

    pub fn policy(&self) -> OverflowPolicy {
        self.policy
    }

    pub fn producer(&self, stats: Arc<SessionStats>) -> FrameProducer {
        self.shared.producers.fetch_add(1, Ordering::AcqRel);
        FrameProducer {
            tx: self.tx.clone(),
            rx: self.rx.clone(),
            policy: self.policy,
            shared: self.shared.clone(),
            stats,
        }
    }

    /// Open the queue for a new session. Call before the device starts
    /// delivering frames; units pushed while stopped are discarded.
    pub fn start(&self) {
        self.shared.flushing.store(false, Ordering::Release);
        self.shared.streaming.store(true, Ordering::Release);
    }

    /// Close the session and discard anything still queued.
    pub fn stop(&self) {
        self.shared.streaming.store(false, Ordering::Release);
        let discarded = self.drain();
        if discarded > 0 {
            debug!("Discarded {} queued access units on stop", discarded);
        }
    }

    pub fn is_streaming(&self) -> bool {
        self.shared.streaming.load(Ordering::Acquire)
    }

    /// Wake blocked consumers and producers; pops fail with
    /// [`PopError::Flushing`] until cleared.
    pub fn set_flushing(&self, flushing: bool) {
        self.shared.flushing.store(flushing, Ordering::Release);
    }

    pub fn is_flushing(&self) -> bool {
        self.shared.flushing.load(Ordering::Acquire)
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    fn drain(&self) -> usize {
        self.rx.try_iter().count()
    }

    /// Next unit, blocking while streaming. Fails immediately when the
    /// session never started, and with [`PopError::Closed`] once every
    /// producer is gone and the backlog is empty.
    pub fn pop(&self) -> Result<AccessUnit, PopError> {
        loop {
            if self.shared.flushing.load(Ordering::Acquire) {
                return Err(PopError::Flushing);
            }
            if !self.shared.streaming.load(Ordering::Acquire) {
                return Err(PopError::NotStarted);
            }
            match self.rx.recv_timeout(POLL_INTERVAL) {
                Ok(unit) => return Ok(unit),
                Err(RecvTimeoutError::Timeout) => {
                    if self.shared.producers.load(Ordering::Acquire) == 0 {
                        // A producer's last push happens before it drops.
                        return self.rx.try_recv().map_err(|_| PopError::Closed);
                    }
                }
                Err(RecvTimeoutError::Disconnected) => return Err(PopError::Closed),
            }
        }
    }

    pub fn try_pop(&self) -> Option<AccessUnit> {
        self.rx.try_recv().ok()
    }
}

/// Producer half, owned by the capture context. Dropping the last producer
/// ends the stream for the consumer.
pub struct FrameProducer {
    tx: Sender<AccessUnit>,
    rx: Receiver<AccessUnit>,
    policy: OverflowPolicy,
    shared: Arc<Shared>,
    stats: Arc<SessionStats>,
}

impl FrameProducer {
    pub fn push(&self, unit: AccessUnit) {
        if !self.shared.streaming.load(Ordering::Acquire) {
            trace!("Queue stopped, discarding access unit");
            return;
        }
        match self.policy {
            OverflowPolicy::DropOldest => self.push_drop_oldest(unit),
            OverflowPolicy::Block => self.push_blocking(unit),
        }
    }

    fn push_drop_oldest(&self, mut unit: AccessUnit) {
        loop {
            match self.tx.try_send(unit) {
                Ok(()) => return,
                Err(TrySendError::Full(back)) => {
                    if self.rx.try_recv().is_ok() {
                        self.stats.queue_overflow_drop();
                        trace!("Queue full, dropped oldest access unit");
                    }
                    unit = back;
                }
                Err(TrySendError::Disconnected(_)) => return,
            }
        }
    }

    fn push_blocking(&self, mut unit: AccessUnit) {
        loop {
            match self.tx.send_timeout(unit, POLL_INTERVAL) {
                Ok(()) => return,
                Err(SendTimeoutError::Timeout(back)) => {
                    if !self.shared.streaming.load(Ordering::Acquire)
                        || self.shared.flushing.load(Ordering::Acquire)
                    {
                        trace!("Queue stopped while blocked, discarding access unit");
                        return;
                    }
                    unit = back;
                }
                Err(SendTimeoutError::Disconnected(_)) => return,
            }
        }
    }
}

impl Drop for FrameProducer {
    fn drop(&mut self) {
        self.shared.producers.fetch_sub(1, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Instant;

    fn unit(pts: u64) -> AccessUnit {
        AccessUnit {
            data: Bytes::from_static(&[0x00, 0x00, 0x00, 0x01, 0x41, 0x9A]),
            timing: Some(Timing {
                pts,
                dts: pts,
                duration: 1,
            }),
            keyframe: false,
        }
    }

    #[test]
    fn pop_before_start_is_not_started() {
        let queue = FrameQueue::unbounded();
        let start = Instant::now();
        assert_eq!(queue.pop(), Err(PopError::NotStarted));
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn fifo_order() {
        let queue = FrameQueue::unbounded();
        let producer = queue.producer(Arc::default());
        queue.start();
        for pts in 0..5 {
            producer.push(unit(pts));
        }
        for pts in 0..5 {
            assert_eq!(queue.pop().unwrap().pts(), Some(pts));
        }
    }

    #[test]
    fn pop_blocks_until_a_unit_arrives() {
        let queue = FrameQueue::unbounded();
        let producer = queue.producer(Arc::default());
        queue.start();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(60));
            producer.push(unit(7));
            producer
        });
        assert_eq!(queue.pop().unwrap().pts(), Some(7));
        drop(handle.join().unwrap());
    }

    #[test]
    fn closed_after_producers_drop_and_backlog_drains() {
        let queue = FrameQueue::unbounded();
        let producer = queue.producer(Arc::default());
        queue.start();
        producer.push(unit(1));
        drop(producer);
        assert_eq!(queue.pop().unwrap().pts(), Some(1));
        assert_eq!(queue.pop(), Err(PopError::Closed));
    }

    #[test]
    fn flushing_wakes_blocked_consumer() {
        let queue = Arc::new(FrameQueue::unbounded());
        let producer = queue.producer(Arc::default());
        queue.start();
        let q = queue.clone();
        let handle = thread::spawn(move || q.pop());
        thread::sleep(Duration::from_millis(50));
        queue.set_flushing(true);
        assert_eq!(handle.join().unwrap(), Err(PopError::Flushing));

        queue.set_flushing(false);
        producer.push(unit(3));
        assert_eq!(queue.pop().unwrap().pts(), Some(3));
    }

    #[test]
    fn stop_discards_backlog_and_late_pushes() {
        let queue = FrameQueue::unbounded();
        let producer = queue.producer(Arc::default());
        queue.start();
        producer.push(unit(1));
        producer.push(unit(2));
        queue.stop();
        assert!(queue.is_empty());
        producer.push(unit(3));
        assert!(queue.is_empty());
        assert_eq!(queue.pop(), Err(PopError::NotStarted));
    }

    #[test]
    fn drop_oldest_keeps_newest() {
        let stats = Arc::new(SessionStats::default());
        let queue = FrameQueue::new(2, OverflowPolicy::DropOldest);
        let producer = queue.producer(stats.clone());
        queue.start();
        for pts in 0..5 {
            producer.push(unit(pts));
        }
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.pop().unwrap().pts(), Some(3));
        assert_eq!(queue.pop().unwrap().pts(), Some(4));
        assert_eq!(stats.snapshot().queue_overflow_drops, 3);
    }

    #[test]
    fn block_policy_waits_for_room() {
        let queue = Arc::new(FrameQueue::new(1, OverflowPolicy::Block));
        let producer = queue.producer(Arc::default());
        queue.start();
        producer.push(unit(0));
        let handle = thread::spawn(move || {
            producer.push(unit(1));
        });
        thread::sleep(Duration::from_millis(50));
        assert_eq!(queue.pop().unwrap().pts(), Some(0));
        handle.join().unwrap();
        assert_eq!(queue.pop().unwrap().pts(), Some(1));
    }

    #[test]
    fn blocked_producer_gives_up_on_stop() {
        let queue = Arc::new(FrameQueue::new(1, OverflowPolicy::Block));
        let producer = queue.producer(Arc::default());
        queue.start();
        producer.push(unit(0));
        let handle = thread::spawn(move || producer.push(unit(1)));
        thread::sleep(Duration::from_millis(50));
        queue.stop();
        handle.join().unwrap();
        assert_eq!(queue.pop(), Err(PopError::NotStarted));
    }

    #[test]
    fn overflow_policy_names() {
        assert_eq!("drop-oldest".parse::<OverflowPolicy>(), Ok(OverflowPolicy::DropOldest));
        assert_eq!(" Block ".parse::<OverflowPolicy>(), Ok(OverflowPolicy::Block));
        assert!("newest".parse::<OverflowPolicy>().is_err());
        assert_eq!(OverflowPolicy::Block.as_str(), "block");
    }
}
