//! Per-connection session state.
//!
//! A session lives exactly as long as one accepted connection. It captures
//! the client identity from the first request and accumulates counters that
//! are flushed as a single metrics record when the connection ends.

/// Accumulated state for one connection.
#[derive(Debug, Default)]
pub struct Session {
    client_id: Option<String>,
    first_send_timestamp: f64,
    messages_processed: u64,
    total_processing_time: f64,
}

/// Aggregate emitted when a session that served requests ends.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSummary {
    pub client_id: String,
    pub messages_processed: u64,
    /// Send timestamp of the first request seen on the connection.
    pub first_send_timestamp: f64,
    /// Mean server-side processing time across the session, in seconds.
    pub avg_processing_time: f64,
}

impl Session {
    /// Create an empty session.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one processed request.
    ///
    /// The client identifier and first-seen send timestamp are captured from
    /// the first request only; values on later requests are ignored.
    pub fn record_request(&mut self, client_id: &str, send_timestamp: f64, processing_time: f64) {
        if self.client_id.is_none() {
            self.client_id = Some(client_id.to_string());
            self.first_send_timestamp = send_timestamp;
        }
        self.messages_processed += 1;
        self.total_processing_time += processing_time;
    }

    /// Number of requests recorded so far.
    pub fn messages_processed(&self) -> u64 {
        self.messages_processed
    }

    /// Consume the session, yielding its aggregate.
    ///
    /// Returns `None` when no request was ever recorded; such sessions leave
    /// no trace in the metrics log.
    pub fn finish(self) -> Option<SessionSummary> {
        let client_id = self.client_id?;
        Some(SessionSummary {
            client_id,
            messages_processed: self.messages_processed,
            first_send_timestamp: self.first_send_timestamp,
            avg_processing_time: self.total_processing_time / self.messages_processed as f64,
        })
    }
}
