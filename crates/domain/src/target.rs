/// Logical destination: topic, optional server identity, fanout flag, exchange.
///
/// An immutable snapshot taken at Task creation time; never mutated after.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Target {
    pub topic: String,
    pub server: Option<String>,
    pub fanout: bool,
    pub exchange: Option<String>,
}

impl Target {
    pub fn new(topic: impl Into<String>) -> Self {
        Target {
            topic: topic.into(),
            server: None,
            fanout: false,
            exchange: None,
        }
    }

    pub fn with_server(mut self, server: impl Into<String>) -> Self {
        self.server = Some(server.into());
        self
    }

    pub fn fanout(mut self) -> Self {
        self.fanout = true;
        self
    }

    pub fn with_exchange(mut self, exchange: impl Into<String>) -> Self {
        self.exchange = Some(exchange.into());
        self
    }
}

/// Logical category of a target; influences address derivation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Service {
    Rpc,
    Notify,
}

/// Wire-level address string resolved from a Target + Service by an Addresser.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Address(pub String);

impl Address {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for Address {
    fn from(s: String) -> Self {
        Address(s)
    }
}

/// Terminal (or transport-suppressed) outcome of a delivery attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryState {
    Accepted,
    Rejected,
    Released,
    Modified,
    /// Transport-level timeout; SenderLink suppresses this in favor of its own timer
    /// (see `DriverError::Timeout`), so callers never observe it directly.
    TimedOut,
}

impl DeliveryState {
    pub fn is_accepted(&self) -> bool {
        matches!(self, DeliveryState::Accepted)
    }
}
