use std::{collections::HashMap, time::Duration};
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::trace;
use uuid::Uuid;

use crate::supervisor::Event;

/// What a scheduled task is for; at most one task per kind is pending
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    /// Scan auto-stop
    ScanTimeout,
    /// Periodic scan countdown report
    ScanCountdown,
    /// CCCD write acknowledgment deadline
    DescriptorWriteTimeout,
    /// Periodic status read
    Keepalive,
    /// Delayed automatic reconnect
    Reconnect,
    /// Delayed CCCD enable for one characteristic
    EnableNotifications(Uuid),
    /// Delayed communication interval request on the control point
    ControlPointQuery,
}

/// Delivered into the event loop when a task fires
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerToken {
    /// Kind of the task that fired
    pub kind: TimerKind,
    id: u64,
}

/// Scheduled tasks tracked by kind and generation
///
/// Each task sleeps on the tokio timer and then pushes its [`TimerToken`] into
/// the event loop. Cancelling aborts the task. A token is only acted upon if
/// [`Timers::claim`] accepts it, which rejects tokens of cancelled or replaced
/// tasks that were already queued.
#[derive(Debug)]
pub struct Timers {
    sender: mpsc::UnboundedSender<Event>,
    next_id: u64,
    pending: HashMap<TimerKind, (u64, JoinHandle<()>)>,
}

impl Timers {
    pub(crate) fn new(sender: mpsc::UnboundedSender<Event>) -> Self {
        Self {
            sender,
            next_id: 0,
            pending: HashMap::new(),
        }
    }

    /// Schedule a task, replacing any pending task of the same kind
    ///
    /// # Panics
    ///
    /// Panics if called outside of a tokio runtime.
    pub fn schedule(&mut self, kind: TimerKind, delay: Duration) -> TimerToken {
        self.cancel(kind);

        self.next_id += 1;
        let token = TimerToken {
            kind,
            id: self.next_id,
        };
        let sender = self.sender.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = sender.send(Event::Timer(token));
        });

        trace!("Scheduled {:?} in {:?}", kind, delay);
        self.pending.insert(kind, (token.id, task));
        token
    }

    /// Cancel the pending task of a kind; returns whether one was pending
    pub fn cancel(&mut self, kind: TimerKind) -> bool {
        self.pending.remove(&kind).is_some_and(|(_, task)| {
            task.abort();
            true
        })
    }

    /// Cancel every pending task whose kind matches
    pub fn cancel_where(&mut self, predicate: impl Fn(&TimerKind) -> bool) {
        self.pending.retain(|kind, (_, task)| {
            if predicate(kind) {
                task.abort();
                false
            } else {
                true
            }
        });
    }

    /// Cancel everything
    pub fn cancel_all(&mut self) {
        for (_, (_, task)) in self.pending.drain() {
            task.abort();
        }
    }

    /// Whether a task of this kind is pending
    #[must_use]
    pub fn is_pending(&self, kind: TimerKind) -> bool {
        self.pending.contains_key(&kind)
    }

    /// Number of pending tasks
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Accept a fired token if it belongs to the current task of its kind
    pub fn claim(&mut self, token: TimerToken) -> bool {
        match self.pending.get(&token.kind) {
            Some((id, _)) if *id == token.id => {
                self.pending.remove(&token.kind);
                true
            }
            _ => {
                trace!("Discarding stale {:?}", token.kind);
                false
            }
        }
    }
}

impl Drop for Timers {
    fn drop(&mut self) {
        self.cancel_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn next_token(rx: &mut mpsc::UnboundedReceiver<Event>) -> TimerToken {
        match rx.recv().await {
            Some(Event::Timer(token)) => token,
            other => panic!("expected timer event, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_fires_and_is_claimed_once() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut timers = Timers::new(tx);

        let scheduled = timers.schedule(TimerKind::Keepalive, Duration::from_secs(3));
        assert!(timers.is_pending(TimerKind::Keepalive));

        let fired = next_token(&mut rx).await;
        assert_eq!(fired, scheduled);
        assert!(timers.claim(fired));
        assert!(!timers.claim(fired));
        assert!(!timers.is_pending(TimerKind::Keepalive));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_timer_never_fires() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut timers = Timers::new(tx);

        timers.schedule(TimerKind::Reconnect, Duration::from_secs(2));
        assert!(timers.cancel(TimerKind::Reconnect));
        assert!(!timers.cancel(TimerKind::Reconnect));

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_replaced_timer_token_is_stale() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut timers = Timers::new(tx);

        let first = timers.schedule(TimerKind::DescriptorWriteTimeout, Duration::from_secs(5));
        let second = timers.schedule(TimerKind::DescriptorWriteTimeout, Duration::from_secs(5));
        assert_eq!(timers.pending_count(), 1);
        assert!(!timers.claim(first));

        let fired = next_token(&mut rx).await;
        assert_eq!(fired, second);
        assert!(timers.claim(fired));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_where_and_cancel_all() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut timers = Timers::new(tx);
        let measurement = Uuid::from_u128(1);
        let control_point = Uuid::from_u128(2);

        timers.schedule(TimerKind::EnableNotifications(measurement), Duration::from_millis(500));
        timers.schedule(TimerKind::EnableNotifications(control_point), Duration::from_millis(700));
        timers.schedule(TimerKind::ScanTimeout, Duration::from_secs(60));

        timers.cancel_where(|kind| matches!(kind, TimerKind::EnableNotifications(_)));
        assert_eq!(timers.pending_count(), 1);
        assert!(timers.is_pending(TimerKind::ScanTimeout));

        timers.cancel_all();
        assert_eq!(timers.pending_count(), 0);

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert!(rx.try_recv().is_err());
    }
}
