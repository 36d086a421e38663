use btleplug::api::CharPropFlags;
use std::collections::{HashMap, VecDeque};
use tracing::debug;
use uuid::Uuid;

use crate::types::{
    CharacteristicSubscription, DescriptorWriteJob, NotifyMode, SubscriptionState,
};

/// CCCD write bookkeeping for one link
///
/// Most BLE stacks reject a GATT operation issued while another one is still
/// pending, so notifications are enabled one descriptor write at a time. The
/// queue keeps the per-characteristic [`CharacteristicSubscription`] state and
/// decides which write goes out next; the supervisor performs the write and
/// owns the acknowledgment timeout.
#[derive(Debug, Default)]
pub struct DescriptorWriteQueue {
    subscriptions: HashMap<Uuid, CharacteristicSubscription>,
    queue: VecDeque<DescriptorWriteJob>,
    in_flight: Option<Uuid>,
}

impl DescriptorWriteQueue {
    /// Create an empty queue
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a characteristic, choosing notify or indicate from its properties
    ///
    /// Re-registering keeps the progress of an existing subscription.
    pub fn register(&mut self, uuid: Uuid, properties: CharPropFlags) {
        let mode = NotifyMode::for_properties(properties);
        self.subscriptions
            .entry(uuid)
            .and_modify(|s| s.mode = mode)
            .or_insert_with(|| CharacteristicSubscription::new(uuid, mode));
    }

    /// Ask for notifications on a characteristic
    ///
    /// Returns the job to issue right away, or `None` when the characteristic is
    /// unknown, already enabled or pending, or has been queued behind the write
    /// in flight.
    pub fn request_enable(&mut self, uuid: Uuid) -> Option<DescriptorWriteJob> {
        let in_flight = self.in_flight.is_some();
        let subscription = self.subscriptions.get_mut(&uuid)?;

        match subscription.state {
            SubscriptionState::Enabled
            | SubscriptionState::Queued
            | SubscriptionState::WriteInFlight => return None,
            SubscriptionState::NotRequested | SubscriptionState::Failed => {}
        }

        let job = DescriptorWriteJob {
            characteristic: uuid,
            value: subscription.mode.cccd_value(),
        };

        if in_flight {
            debug!("Queueing CCCD write for {}", uuid);
            subscription.state = SubscriptionState::Queued;
            self.queue.push_back(job);
            return None;
        }

        subscription.state = SubscriptionState::WriteInFlight;
        subscription.attempts += 1;
        self.in_flight = Some(uuid);
        self.check_invariant();
        Some(job)
    }

    /// Record the outcome of a descriptor write
    ///
    /// Returns the next job to issue when `uuid` was the write in flight. A late
    /// completion for anything else only updates that subscription.
    pub fn complete(&mut self, uuid: Uuid, success: bool) -> Option<DescriptorWriteJob> {
        if let Some(subscription) = self.subscriptions.get_mut(&uuid) {
            subscription.state = if success {
                SubscriptionState::Enabled
            } else {
                SubscriptionState::Failed
            };
        }

        if self.in_flight != Some(uuid) {
            debug!("Late CCCD completion for {}", uuid);
            return None;
        }

        self.in_flight = None;
        self.next_job()
    }

    /// The write in flight was not acknowledged in time
    ///
    /// Every in-flight subscription is marked failed and the next queued job, if
    /// any, is returned.
    pub fn on_timeout(&mut self) -> Option<DescriptorWriteJob> {
        self.in_flight = None;
        for subscription in self.subscriptions.values_mut() {
            if subscription.state == SubscriptionState::WriteInFlight {
                subscription.state = SubscriptionState::Failed;
            }
        }
        self.next_job()
    }

    fn next_job(&mut self) -> Option<DescriptorWriteJob> {
        while let Some(job) = self.queue.pop_front() {
            let Some(subscription) = self.subscriptions.get_mut(&job.characteristic) else {
                continue;
            };
            if matches!(
                subscription.state,
                SubscriptionState::Enabled | SubscriptionState::WriteInFlight
            ) {
                continue;
            }

            subscription.state = SubscriptionState::WriteInFlight;
            subscription.attempts += 1;
            self.in_flight = Some(job.characteristic);
            self.check_invariant();
            return Some(job);
        }
        None
    }

    /// Whether another write may be requested for a tracked subscription
    ///
    /// Only subscriptions that are neither enabled nor pending qualify, so a
    /// retry never stacks on top of a write already on its way.
    #[must_use]
    pub fn can_retry(&self, uuid: Uuid) -> bool {
        self.subscriptions.get(&uuid).is_some_and(|s| {
            matches!(
                s.state,
                SubscriptionState::Failed | SubscriptionState::NotRequested
            )
        })
    }

    /// Progress of a characteristic, `NotRequested` when untracked
    #[must_use]
    pub fn state(&self, uuid: Uuid) -> SubscriptionState {
        self.subscriptions
            .get(&uuid)
            .map_or(SubscriptionState::NotRequested, |s| s.state)
    }

    /// Subscription record of a characteristic
    #[must_use]
    pub fn subscription(&self, uuid: Uuid) -> Option<&CharacteristicSubscription> {
        self.subscriptions.get(&uuid)
    }

    /// Whether the characteristic is tracked
    #[must_use]
    pub fn is_registered(&self, uuid: Uuid) -> bool {
        self.subscriptions.contains_key(&uuid)
    }

    /// Whether the peripheral acknowledged the enable
    #[must_use]
    pub fn is_enabled(&self, uuid: Uuid) -> bool {
        self.state(uuid) == SubscriptionState::Enabled
    }

    /// Characteristic whose write is in flight
    #[must_use]
    pub const fn in_flight(&self) -> Option<Uuid> {
        self.in_flight
    }

    /// Jobs waiting behind the write in flight
    #[must_use]
    pub fn queued_len(&self) -> usize {
        self.queue.len()
    }

    /// Link dropped: every subscription returns to `NotRequested`
    pub fn reset(&mut self) {
        self.queue.clear();
        self.in_flight = None;
        for subscription in self.subscriptions.values_mut() {
            subscription.state = SubscriptionState::NotRequested;
            subscription.attempts = 0;
        }
    }

    /// Forget everything
    pub fn clear(&mut self) {
        self.queue.clear();
        self.in_flight = None;
        self.subscriptions.clear();
    }

    fn check_invariant(&self) {
        debug_assert!(
            self.subscriptions
                .values()
                .filter(|s| s.state == SubscriptionState::WriteInFlight)
                .count()
                <= 1,
            "more than one CCCD write in flight"
        );
    }
}
