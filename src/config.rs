//! Tunnel configuration.

use std::time::Duration;

/// Default interval a read sleeps while the response has not arrived.
pub const DEFAULT_BACKOFF: Duration = Duration::from_millis(300);

/// Default number of consecutive empty reads before a stream gives up.
pub const DEFAULT_MAX_NOT_READY: usize = 100;

/// Configuration applied to every stream a [`Dialer`](crate::Dialer) produces.
///
/// The defaults mirror what long-lived relays expect: a 300ms backoff between
/// empty reads, giving up after 100 of them (roughly 30 seconds), a rendezvous
/// pipe for the request body, and `PUT` as the request method.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelConfig {
    /// How long a read waits before reporting "no data yet".
    pub backoff: Duration,

    /// Consecutive "no data yet" reads allowed before failing with
    /// [`Error::NoProgress`](crate::Error::NoProgress).
    pub max_not_ready: usize,

    /// Bytes the request-body pipe may buffer. Zero means writes wait on reads.
    pub pipe_capacity: usize,

    /// Method used for the streamed request.
    pub method: http::Method,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            backoff: DEFAULT_BACKOFF,
            max_not_ready: DEFAULT_MAX_NOT_READY,
            pipe_capacity: 0,
            method: http::Method::PUT,
        }
    }
}

impl TunnelConfig {
    /// Set the read backoff interval.
    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    /// Set the number of empty reads tolerated before giving up.
    pub fn with_max_not_ready(mut self, attempts: usize) -> Self {
        self.max_not_ready = attempts;
        self
    }

    /// Set the request-body pipe capacity.
    pub fn with_pipe_capacity(mut self, capacity: usize) -> Self {
        self.pipe_capacity = capacity;
        self
    }

    /// Set the request method.
    pub fn with_method(mut self, method: http::Method) -> Self {
        self.method = method;
        self
    }

    /// The longest a stream can sit without a response before failing.
    pub fn patience(&self) -> Duration {
        let attempts = u32::try_from(self.max_not_ready).unwrap_or(u32::MAX);
        self.backoff.saturating_mul(attempts.saturating_add(1))
    }
}
