//! SENDME flow control
//!
//! Windowed flow control at circuit and stream granularity. Outbound
//! credit starts at the initial window, drops by one per DATA cell sent,
//! and is topped up by the increment when a SENDME arrives. Inbound
//! accounting is a delta counter: after `increment` DATA cells received
//! we owe the peer a SENDME and the counter wraps to zero.

/// Circuit-level flow control.
#[derive(Debug, Clone)]
pub struct CircuitFlowControl {
    /// DATA cells we may still send on the circuit.
    send_window: u16,

    /// DATA cells received since we last sent a circuit SENDME.
    recv_counter: u16,
}

impl CircuitFlowControl {
    /// Initial circuit window size (1000 cells).
    pub const INITIAL_WINDOW: u16 = 1000;

    /// Window increment per SENDME (100 cells).
    pub const WINDOW_INCREMENT: u16 = 100;

    pub fn new() -> Self {
        Self {
            send_window: Self::INITIAL_WINDOW,
            recv_counter: 0,
        }
    }

    /// True while outbound credit remains.
    pub fn can_send(&self) -> bool {
        self.send_window > 0
    }

    /// Spend one unit of outbound credit.
    pub fn on_send(&mut self) {
        debug_assert!(self.send_window > 0);
        self.send_window = self.send_window.saturating_sub(1);
    }

    /// Credit arriving with a circuit-level SENDME.
    pub fn on_sendme_received(&mut self) {
        self.send_window = self.send_window.saturating_add(Self::WINDOW_INCREMENT);
        log::debug!("circuit send window now {}", self.send_window);
    }

    /// Account one received DATA cell; true when a SENDME is now owed.
    pub fn on_receive_data(&mut self) -> bool {
        self.recv_counter += 1;
        if self.recv_counter == Self::WINDOW_INCREMENT {
            self.recv_counter = 0;
            log::debug!("circuit window used up, SENDME due");
            return true;
        }
        false
    }

    #[cfg(test)]
    pub fn send_window(&self) -> u16 {
        self.send_window
    }
}

impl Default for CircuitFlowControl {
    fn default() -> Self {
        Self::new()
    }
}

/// Stream-level flow control.
///
/// The outbound window is tracked but not enforced: the source never
/// implemented stream-side outbound credit, so outbound credit is
/// assumed infinite and only the circuit window gates sends.
#[derive(Debug, Clone)]
pub struct StreamFlowControl {
    /// DATA cells the peer allows us to send on this stream.
    send_window: u16,

    /// DATA cells received since we last sent a stream SENDME.
    recv_counter: u16,
}

impl StreamFlowControl {
    /// Initial stream window size (500 cells).
    pub const INITIAL_WINDOW: u16 = 500;

    /// Window increment per SENDME (50 cells).
    pub const WINDOW_INCREMENT: u16 = 50;

    pub fn new() -> Self {
        Self {
            send_window: Self::INITIAL_WINDOW,
            recv_counter: 0,
        }
    }

    /// Record one DATA cell sent.
    pub fn on_send(&mut self) {
        self.send_window = self.send_window.saturating_sub(1);
    }

    /// Credit arriving with a stream-level SENDME.
    pub fn on_sendme_received(&mut self) {
        self.send_window = self.send_window.saturating_add(Self::WINDOW_INCREMENT);
    }

    /// Account one received DATA cell; true when a SENDME is now owed.
    pub fn on_receive_data(&mut self) -> bool {
        self.recv_counter += 1;
        if self.recv_counter == Self::WINDOW_INCREMENT {
            self.recv_counter = 0;
            return true;
        }
        false
    }

    #[cfg(test)]
    pub fn send_window(&self) -> u16 {
        self.send_window
    }
}

impl Default for StreamFlowControl {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn circuit_send_credit() {
        let mut fc = CircuitFlowControl::new();
        assert_eq!(fc.send_window(), 1000);
        assert!(fc.can_send());

        for _ in 0..1000 {
            fc.on_send();
        }
        assert!(!fc.can_send());

        fc.on_sendme_received();
        assert!(fc.can_send());
        assert_eq!(fc.send_window(), 100);
    }

    #[test]
    fn circuit_sendme_due_every_100() {
        let mut fc = CircuitFlowControl::new();
        let mut due = 0;
        for i in 1..=250 {
            if fc.on_receive_data() {
                due += 1;
                assert!(i % 100 == 0, "SENDME owed at cell {}", i);
            }
        }
        assert_eq!(due, 2);
    }

    #[test]
    fn stream_sendme_due_every_50() {
        let mut fc = StreamFlowControl::new();
        for i in 1..=49 {
            assert!(!fc.on_receive_data(), "no SENDME before 50, got one at {}", i);
        }
        assert!(fc.on_receive_data());
        // Counter wrapped: the next SENDME is 50 cells away again.
        for _ in 1..=49 {
            assert!(!fc.on_receive_data());
        }
        assert!(fc.on_receive_data());
    }

    #[test]
    fn stream_send_window_bookkeeping() {
        let mut fc = StreamFlowControl::new();
        for _ in 0..10 {
            fc.on_send();
        }
        assert_eq!(fc.send_window(), 490);
        fc.on_sendme_received();
        assert_eq!(fc.send_window(), 540);
    }
}
