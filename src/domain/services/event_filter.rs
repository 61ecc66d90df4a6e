//! Incoming Event Filter
//!
//! Decides whether a remote event may touch the local replica. Pure state
//! machine with no I/O so the propagator can drive it from any task.
//!
//! Stages, in order:
//! 1. loop-filter: the echo of the token still in flight
//! 2. self-filter: any other event emitted by this device
//! 3. age-filter: events older than the configured horizon
//! 4. duplicate-filter: tokens already accepted (reconnect replays)

use crate::domain::entities::SyncEvent;
use crate::domain::value_objects::{DeviceId, SyncToken};
use std::collections::{HashSet, VecDeque};

/// Default number of accepted tokens remembered for duplicate suppression.
pub const DEFAULT_SEEN_CAPACITY: usize = 4096;

/// Why an event was or was not accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterVerdict {
    Accept,
    SelfEmitted,
    Echo,
    Expired,
    Duplicate,
}

impl FilterVerdict {
    pub fn is_accept(&self) -> bool {
        matches!(self, Self::Accept)
    }

    /// Dropped events that still count towards `events_dropped`.
    pub fn is_counted_drop(&self) -> bool {
        matches!(self, Self::Expired | Self::Duplicate)
    }
}

/// Bounded FIFO set of sync tokens.
#[derive(Debug)]
pub struct SeenTokens {
    order: VecDeque<SyncToken>,
    set: HashSet<SyncToken>,
    capacity: usize,
}

impl SeenTokens {
    pub fn new(capacity: usize) -> Self {
        Self {
            order: VecDeque::with_capacity(capacity.min(1024)),
            set: HashSet::new(),
            capacity: capacity.max(1),
        }
    }

    pub fn contains(&self, token: &SyncToken) -> bool {
        self.set.contains(token)
    }

    /// Insert a token, evicting the oldest beyond capacity. Returns false if present.
    pub fn insert(&mut self, token: SyncToken) -> bool {
        if !self.set.insert(token.clone()) {
            return false;
        }
        self.order.push_back(token);
        while self.order.len() > self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.set.remove(&evicted);
            }
        }
        true
    }

    pub fn remove(&mut self, token: &SyncToken) {
        if self.set.remove(token) {
            self.order.retain(|t| t != token);
        }
    }

    pub fn len(&self) -> usize {
        self.set.len()
    }

    pub fn is_empty(&self) -> bool {
        self.set.is_empty()
    }
}

/// Filter state owned by one propagator.
#[derive(Debug)]
pub struct EventFilter {
    local_device: DeviceId,
    max_age_ms: u64,
    in_flight: Option<SyncToken>,
    seen: SeenTokens,
}

impl EventFilter {
    pub fn new(local_device: DeviceId, max_age_ms: u64) -> Self {
        Self::with_capacity(local_device, max_age_ms, DEFAULT_SEEN_CAPACITY)
    }

    pub fn with_capacity(local_device: DeviceId, max_age_ms: u64, capacity: usize) -> Self {
        Self {
            local_device,
            max_age_ms,
            in_flight: None,
            seen: SeenTokens::new(capacity),
        }
    }

    /// Remember the token of the event just emitted.
    pub fn mark_emitted(&mut self, token: SyncToken) {
        self.in_flight = Some(token);
    }

    pub fn in_flight(&self) -> Option<&SyncToken> {
        self.in_flight.as_ref()
    }

    /// Classify an event. Accepted tokens are reserved immediately so that a
    /// concurrent redelivery is seen as a duplicate.
    pub fn check(&mut self, event: &SyncEvent, now_ms: u64) -> FilterVerdict {
        if self.in_flight.as_ref() == Some(&event.sync_token) {
            self.in_flight = None;
            return FilterVerdict::Echo;
        }

        if event.device_id == self.local_device {
            return FilterVerdict::SelfEmitted;
        }

        if event.age_ms(now_ms) > self.max_age_ms {
            return FilterVerdict::Expired;
        }

        if !self.seen.insert(event.sync_token.clone()) {
            return FilterVerdict::Duplicate;
        }

        FilterVerdict::Accept
    }

    /// Release a reserved token after a failed application so a redelivery retries it.
    pub fn release(&mut self, token: &SyncToken) {
        self.seen.remove(token);
    }

    pub fn seen_count(&self) -> usize {
        self.seen.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::value_objects::{Operation, UserId, DAY_MS};

    const NOW: u64 = 30 * DAY_MS;

    fn event_from(device: &str, timestamp: u64) -> SyncEvent {
        SyncEvent::new(
            UserId::new("user-1"),
            DeviceId::new(device),
            Operation::Update,
            "medications",
            "m1",
            Some(serde_json::json!({"n": 1})),
            timestamp,
        )
    }

    fn filter() -> EventFilter {
        EventFilter::new(DeviceId::new("local"), 7 * DAY_MS)
    }

    #[test]
    fn test_accepts_remote_event() {
        let mut f = filter();
        assert_eq!(f.check(&event_from("remote", NOW), NOW), FilterVerdict::Accept);
    }

    #[test]
    fn test_drops_self_emitted() {
        let mut f = filter();
        assert_eq!(f.check(&event_from("local", NOW), NOW), FilterVerdict::SelfEmitted);
    }

    #[test]
    fn test_drops_in_flight_echo_once() {
        let mut f = filter();
        let event = event_from("local", NOW);
        f.mark_emitted(event.sync_token.clone());

        assert_eq!(f.check(&event, NOW), FilterVerdict::Echo);
        assert!(f.in_flight().is_none());
        // A later redelivery falls through to the self-filter.
        assert_eq!(f.check(&event, NOW), FilterVerdict::SelfEmitted);
    }

    #[test]
    fn test_drops_expired() {
        let mut f = filter();
        let old = event_from("remote", NOW - 8 * DAY_MS);
        let verdict = f.check(&old, NOW);
        assert_eq!(verdict, FilterVerdict::Expired);
        assert!(verdict.is_counted_drop());
    }

    #[test]
    fn test_age_horizon_is_inclusive() {
        let mut f = filter();
        let edge = event_from("remote", NOW - 7 * DAY_MS);
        assert_eq!(f.check(&edge, NOW), FilterVerdict::Accept);
    }

    #[test]
    fn test_drops_duplicate_token() {
        let mut f = filter();
        let event = event_from("remote", NOW);
        assert_eq!(f.check(&event, NOW), FilterVerdict::Accept);
        assert_eq!(f.check(&event, NOW), FilterVerdict::Duplicate);
    }

    #[test]
    fn test_release_allows_retry() {
        let mut f = filter();
        let event = event_from("remote", NOW);
        assert!(f.check(&event, NOW).is_accept());
        f.release(&event.sync_token);
        assert!(f.check(&event, NOW).is_accept());
    }

    #[test]
    fn test_seen_tokens_evicts_oldest() {
        let mut seen = SeenTokens::new(2);
        assert!(seen.insert(SyncToken::new("a")));
        assert!(seen.insert(SyncToken::new("b")));
        assert!(seen.insert(SyncToken::new("c")));

        assert_eq!(seen.len(), 2);
        assert!(!seen.contains(&SyncToken::new("a")));
        assert!(seen.contains(&SyncToken::new("c")));
        assert!(!seen.insert(SyncToken::new("c")));
    }
}
