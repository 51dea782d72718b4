/// Configuration for a [`Loop`](crate::Loop).
#[derive(Clone)]
pub struct Config {
    /// Number of submission queue entries. CQ will be 4x this.
    pub sq_entries: u32,
    /// Maximum number of concurrently armed timers (tickers + one-shots).
    pub timer_slots: u32,
    /// Receive buffer size for each hosted UDP socket.
    pub udp_recv_buffer_size: usize,
    /// Name given to the worker thread.
    pub thread_name: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            sq_entries: 128,
            timer_slots: 256,
            udp_recv_buffer_size: 65536,
            thread_name: "loon-loop".to_string(),
        }
    }
}

impl Config {
    /// Validate configuration values. Returns an error if any value is out of range.
    pub fn validate(&self) -> Result<(), crate::error::Error> {
        if self.sq_entries == 0 || !self.sq_entries.is_power_of_two() {
            return Err(crate::error::Error::Config(
                "sq_entries must be > 0 and a power of two".into(),
            ));
        }
        if self.timer_slots == 0 || self.timer_slots > 65535 {
            return Err(crate::error::Error::Config(
                "timer_slots must be in 1..=65535".into(),
            ));
        }
        if self.udp_recv_buffer_size < 2048 {
            return Err(crate::error::Error::Config(
                "udp_recv_buffer_size must be >= 2048".into(),
            ));
        }
        Ok(())
    }
}

/// Builder for [`Config`] with discoverable methods and `build()` validation.
///
/// # Example
///
/// ```rust
/// use loon::ConfigBuilder;
///
/// let config = ConfigBuilder::new()
///     .sq_entries(256)
///     .timer_slots(1024)
///     .build()
///     .expect("invalid config");
/// ```
#[derive(Default)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Create a new builder with default config values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the number of SQ entries. Must be a power of two.
    pub fn sq_entries(mut self, n: u32) -> Self {
        self.config.sq_entries = n;
        self
    }

    /// Set the maximum number of concurrently armed timers.
    pub fn timer_slots(mut self, n: u32) -> Self {
        self.config.timer_slots = n;
        self
    }

    /// Set the per-socket UDP receive buffer size.
    pub fn udp_recv_buffer_size(mut self, n: usize) -> Self {
        self.config.udp_recv_buffer_size = n;
        self
    }

    /// Set the worker thread name.
    pub fn thread_name(mut self, name: impl Into<String>) -> Self {
        self.config.thread_name = name.into();
        self
    }

    /// Validate and build the final [`Config`].
    pub fn build(self) -> Result<Config, crate::error::Error> {
        self.config.validate()?;
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_valid() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn rejects_non_power_of_two_sq() {
        let config = ConfigBuilder::new().sq_entries(100).build();
        assert!(config.is_err());
    }

    #[test]
    fn rejects_zero_timer_slots() {
        let config = ConfigBuilder::new().timer_slots(0).build();
        assert!(config.is_err());
    }

    #[test]
    fn rejects_oversized_timer_slots() {
        let config = ConfigBuilder::new().timer_slots(70_000).build();
        assert!(config.is_err());
    }
}
