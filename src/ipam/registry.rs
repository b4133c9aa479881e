//! Strategy registry: one engine per strategy name, plus a default.

use std::collections::BTreeMap;
use std::sync::Arc;

use super::{AllocationStrategy, AnyStrategy, BothRequiredStrategy, BothStrategy, Ipam};
use crate::error::{IpamError, Result};
use crate::notify::Notifier;

/// Names every registry answers to
pub const STRATEGY_NAMES: [&str; 3] = ["ANY", "BOTH", "BOTH_REQUIRED"];

#[derive(Debug, Clone)]
pub struct StrategyRegistry {
    engines: BTreeMap<&'static str, Ipam>,
    default: Ipam,
}

impl StrategyRegistry {
    /// Build engines for every known strategy. Fails if `default_strategy`
    /// is not one of them.
    pub fn new(default_strategy: &str, notifier: Arc<dyn Notifier>) -> Result<Self> {
        let strategies: [Arc<dyn AllocationStrategy>; 3] = [
            Arc::new(AnyStrategy),
            Arc::new(BothStrategy),
            Arc::new(BothRequiredStrategy::default()),
        ];

        let engines: BTreeMap<_, _> = strategies
            .into_iter()
            .map(|strategy| (strategy.name(), Ipam::new(strategy, notifier.clone())))
            .collect();

        let default = engines
            .get(default_strategy)
            .cloned()
            .ok_or_else(|| IpamError::InvalidStrategy(default_strategy.to_string()))?;

        Ok(Self { engines, default })
    }

    pub fn is_valid(&self, name: &str) -> bool {
        self.engines.contains_key(name)
    }

    /// Engine for `name`, falling back to the default for unknown names
    pub fn resolve(&self, name: &str) -> &Ipam {
        match self.engines.get(name) {
            Some(engine) => engine,
            None => {
                log::warn!(
                    "IPAM strategy {} not found, using default {}",
                    name,
                    self.default.strategy_name()
                );
                &self.default
            }
        }
    }

    pub fn default_engine(&self) -> &Ipam {
        &self.default
    }

    pub fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.engines.keys().copied()
    }
}
