//! Removes known-benign noise from captured server output
//!
//! Only failure messages are filtered. The persisted `server.log` always keeps
//! every line.

/// Lines containing any of these are dropped from failure messages
pub const DEFAULT_NOISY_MARKERS: &[&str] = &[
    // store client reconnect chatter during shutdown
    "grpc: addrConn.createTransport failed to connect to",
    // probes that connect and hang up before speaking
    "http2: server: error reading preface from client",
];

#[derive(Debug, Clone)]
pub struct LogFilter {
    markers: Vec<String>,
}

impl Default for LogFilter {
    fn default() -> Self {
        Self {
            markers: DEFAULT_NOISY_MARKERS.iter().map(|m| m.to_string()).collect(),
        }
    }
}

impl LogFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_marker(mut self, marker: impl Into<String>) -> Self {
        self.markers.push(marker.into());
        self
    }

    pub fn is_noisy(&self, line: &str) -> bool {
        self.markers.iter().any(|m| line.contains(m.as_str()))
    }

    /// Keep the non-noisy lines in their original order
    pub fn filter(&self, raw: &str) -> String {
        raw.lines()
            .filter(|line| !self.is_noisy(line))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Filter with the default marker set
pub fn filter_logs(raw: &str) -> String {
    LogFilter::default().filter(raw)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_drops_noisy_line_and_keeps_order() {
        let raw = "starting server\n\
                   W0101 grpc: addrConn.createTransport failed to connect to {127.0.0.1:2379}\n\
                   listening on :6443";

        assert_eq!(filter_logs(raw), "starting server\nlistening on :6443");
    }

    #[test]
    fn test_custom_marker() {
        let filter = LogFilter::new().with_marker("boring");
        assert_eq!(filter.filter("a\nboring b\nc"), "a\nc");
        assert!(filter.is_noisy("http2: server: error reading preface from client 1.2.3.4"));
    }

    #[test]
    fn test_empty_input() {
        assert_eq!(filter_logs(""), "");
    }
}
