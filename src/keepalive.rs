use tracing::debug;

/// Decides when to read the CGM Status characteristic
///
/// Some sensors drop an idle link before they start streaming. While no
/// measurement has arrived, the supervisor reads the Status characteristic on a
/// fixed interval. The first decoded measurement stops the probing for the rest
/// of the link.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct KeepaliveMonitor {
    running: bool,
    measurement_received: bool,
}

impl KeepaliveMonitor {
    /// Create an idle monitor
    #[must_use]
    pub const fn new() -> Self {
        Self {
            running: false,
            measurement_received: false,
        }
    }

    /// Start probing; returns `false` when already running or data already flows
    pub fn start(&mut self) -> bool {
        if self.running || self.measurement_received {
            return false;
        }
        debug!("Keepalive started");
        self.running = true;
        true
    }

    /// Whether the next tick should read the status characteristic
    ///
    /// Stops the monitor when the read precondition no longer holds, so a
    /// tick that returns `false` is not rescheduled.
    pub fn should_poll(&mut self, connected: bool, has_handle: bool) -> bool {
        if self.running && connected && has_handle && !self.measurement_received {
            true
        } else {
            self.running = false;
            false
        }
    }

    /// A measurement was decoded; returns whether probing was running
    pub fn record_measurement(&mut self) -> bool {
        self.measurement_received = true;
        std::mem::replace(&mut self.running, false)
    }

    /// Stop probing without marking data as received
    pub fn cancel(&mut self) {
        self.running = false;
    }

    /// New link: stopped, no measurement seen
    pub fn reset(&mut self) {
        *self = Self::new();
    }

    /// Whether probing is active
    #[must_use]
    pub const fn is_running(&self) -> bool {
        self.running
    }

    /// Whether a measurement arrived on this link
    #[must_use]
    pub const fn measurement_received(&self) -> bool {
        self.measurement_received
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_polls_until_measurement() {
        let mut monitor = KeepaliveMonitor::new();
        assert!(monitor.start());
        assert!(!monitor.start());

        assert!(monitor.should_poll(true, true));
        assert!(monitor.should_poll(true, true));

        assert!(monitor.record_measurement());
        assert!(!monitor.is_running());
        assert!(!monitor.should_poll(true, true));
        assert!(!monitor.start());
    }

    #[test]
    fn test_stops_without_link() {
        let mut monitor = KeepaliveMonitor::new();
        monitor.start();
        assert!(!monitor.should_poll(false, true));
        assert!(!monitor.is_running());

        monitor.start();
        assert!(!monitor.should_poll(true, false));
    }

    #[test]
    fn test_reset_allows_new_link() {
        let mut monitor = KeepaliveMonitor::new();
        monitor.start();
        assert!(monitor.record_measurement());
        assert!(!monitor.record_measurement());

        monitor.reset();
        assert!(!monitor.measurement_received());
        assert!(monitor.start());

        monitor.cancel();
        assert!(!monitor.should_poll(true, true));
    }
}
