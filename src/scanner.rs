use std::collections::HashSet;
use tracing::debug;

use crate::types::{DeviceAddress, DiscoveredDevice};

/// Bookkeeping for one scan session
///
/// Tracks whether a scan runs, which addresses were already reported and the
/// countdown shown to the user. The supervisor owns the platform scan and the
/// timers.
#[derive(Debug, Default)]
pub struct DeviceScanner {
    scanning: bool,
    seen: HashSet<DeviceAddress>,
    remaining_secs: u32,
}

impl DeviceScanner {
    /// Create an idle scanner
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a session lasting `total_secs`; forgets previously seen devices
    pub fn begin(&mut self, total_secs: u32) {
        self.scanning = true;
        self.seen.clear();
        self.remaining_secs = total_secs;
    }

    /// Record an advertisement; returns the device the first time its address is seen
    pub fn observe(
        &mut self,
        address: DeviceAddress,
        name: Option<String>,
        rssi: i16,
    ) -> Option<DiscoveredDevice> {
        if !self.scanning {
            return None;
        }
        if !self.seen.insert(address.clone()) {
            debug!("Ignoring repeated advertisement from {}", address);
            return None;
        }
        Some(DiscoveredDevice::new(address, name, rssi))
    }

    /// Advance the countdown; returns the seconds left while more than zero remain
    pub fn tick(&mut self, elapsed_secs: u32) -> Option<u32> {
        if !self.scanning {
            return None;
        }
        self.remaining_secs = self.remaining_secs.saturating_sub(elapsed_secs);
        (self.remaining_secs > 0).then_some(self.remaining_secs)
    }

    /// End the session; returns whether one was running
    pub fn end(&mut self) -> bool {
        self.remaining_secs = 0;
        std::mem::replace(&mut self.scanning, false)
    }

    /// Whether a session is running
    #[must_use]
    pub const fn is_scanning(&self) -> bool {
        self.scanning
    }

    /// Seconds left in the session
    #[must_use]
    pub const fn remaining_secs(&self) -> u32 {
        self.remaining_secs
    }

    /// Number of distinct devices reported this session
    #[must_use]
    pub fn seen_count(&self) -> usize {
        self.seen.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_advertisement_wins() {
        let mut scanner = DeviceScanner::new();
        scanner.begin(60);

        let first = scanner
            .observe("AA:01".into(), Some("CGM A".to_string()), -50)
            .unwrap();
        assert_eq!(first.display_name(), "CGM A");
        assert_eq!(first.rssi, -50);

        assert!(scanner.observe("AA:01".into(), Some("Renamed".to_string()), -40).is_none());
        assert!(scanner.observe("AA:02".into(), None, -80).is_some());
        assert_eq!(scanner.seen_count(), 2);
    }

    #[test]
    fn test_new_session_forgets_devices() {
        let mut scanner = DeviceScanner::new();
        scanner.begin(60);
        assert!(scanner.observe("AA:01".into(), None, -50).is_some());
        assert!(scanner.end());
        assert!(!scanner.end());
        assert!(scanner.observe("AA:01".into(), None, -50).is_none());

        scanner.begin(60);
        assert!(scanner.observe("AA:01".into(), None, -50).is_some());
    }

    #[test]
    fn test_countdown() {
        let mut scanner = DeviceScanner::new();
        scanner.begin(15);

        assert_eq!(scanner.tick(5), Some(10));
        assert_eq!(scanner.tick(5), Some(5));
        assert_eq!(scanner.tick(5), None);
        assert_eq!(scanner.tick(5), None);
        assert_eq!(scanner.remaining_secs(), 0);

        scanner.end();
        assert_eq!(scanner.tick(5), None);
    }
}
