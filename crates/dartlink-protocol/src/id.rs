/// Generator for per-connection request ids.
///
/// Ids combine a monotonic counter with a millisecond timestamp so that ids
/// from a connection's previous life can never collide with ids issued after
/// a reconnect.
#[derive(Debug, Default)]
pub struct RequestIdGen {
    counter: u64,
}

impl RequestIdGen {
    pub const fn new() -> Self {
        Self { counter: 0 }
    }

    /// Next unique request id.
    pub fn next_id(&mut self) -> String {
        self.counter += 1;
        format!("{}-{}", self.counter, chrono::Utc::now().timestamp_millis())
    }
}
