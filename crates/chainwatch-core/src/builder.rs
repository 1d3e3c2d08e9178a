//! Fluent builder API for watcher configuration.
//!
//! # Example
//!
//! ```rust
//! use chainwatch_core::WatcherBuilder;
//!
//! let config = WatcherBuilder::new()
//!     .id("deal-watcher")
//!     .network("testnet")
//!     .floor(19_000_000)
//!     .build_config();
//! ```

use crate::types::Network;
use crate::watcher::WatcherConfig;

/// Fluent builder for `WatcherConfig`.
#[derive(Default)]
pub struct WatcherBuilder {
    config: WatcherConfig,
}

impl WatcherBuilder {
    pub fn new() -> Self {
        Self {
            config: WatcherConfig::default(),
        }
    }

    /// Set the watcher identifier (used in logs).
    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.config.id = id.into();
        self
    }

    /// Set the network to ingest from.
    pub fn network(mut self, network: impl Into<String>) -> Self {
        self.config.network = Network::new(network);
        self
    }

    /// Set the starting position used when no cursor exists.
    pub fn floor(mut self, position: u64) -> Self {
        self.config.floor = position;
        self
    }

    /// Build the `WatcherConfig`.
    pub fn build_config(self) -> WatcherConfig {
        self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_defaults() {
        let cfg = WatcherBuilder::new().build_config();
        assert_eq!(cfg.id, "default");
        assert_eq!(cfg.network.as_str(), "mainnet");
        assert_eq!(cfg.floor, 0);
    }

    #[test]
    fn builder_custom() {
        let cfg = WatcherBuilder::new()
            .id("deal-watcher")
            .network("testnet")
            .floor(5_000_000)
            .build_config();

        assert_eq!(cfg.id, "deal-watcher");
        assert_eq!(cfg.network.as_str(), "testnet");
        assert_eq!(cfg.floor, 5_000_000);
    }
}
