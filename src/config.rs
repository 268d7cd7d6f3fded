/// Default depth of the command channel.
pub const DEFAULT_CAPACITY: usize = 64;

/// Configuration for a [`SafeMap`](crate::SafeMap) actor.
///
/// ```rust
/// use safemap::SafeMapConfig;
///
/// let config = SafeMapConfig::default()
///     .with_capacity(128)
///     .with_name("sessions");
/// ```
#[derive(Debug, Clone)]
pub struct SafeMapConfig {
    /// How many commands may be queued before senders wait (default: 64).
    pub capacity: usize,
    /// Label attached to the actor's tracing span.
    pub name: Option<String>,
}

impl Default for SafeMapConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CAPACITY,
            name: None,
        }
    }
}

impl SafeMapConfig {
    /// Creates a new configuration with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the command channel depth.
    ///
    /// A full channel makes every sender wait until the actor catches up.
    /// Zero is not a valid mpsc capacity and is raised to one.
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity.max(1);
        self
    }

    /// Sets the name used in log output.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }
}
