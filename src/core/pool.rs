//! Named slot pools limiting concurrent task instances.
//!
//! Every task definition names a pool and a slot weight. An instance
//! occupies its weight in the pool while queued or running; admission only
//! succeeds if the weight still fits under the pool's capacity.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Pool every task uses unless configured otherwise.
pub const DEFAULT_POOL: &str = "default_pool";

/// Capacity of the default pool unless configured otherwise.
pub const DEFAULT_POOL_SLOTS: u32 = 128;

/// A named pool with a fixed number of slots.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pool {
    pub name: String,
    pub slots: u32,
}

impl Pool {
    /// Create a pool.
    pub fn new(name: impl Into<String>, slots: u32) -> Self {
        Self {
            name: name.into(),
            slots,
        }
    }

    /// Returns true if `weight` more slots fit given `occupied` slots in use.
    pub fn fits(&self, occupied: u32, weight: u32) -> bool {
        occupied.saturating_add(weight) <= self.slots
    }
}

/// Registry of pools known to the scheduler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolRegistry {
    pools: HashMap<String, Pool>,
}

impl PoolRegistry {
    /// Registry containing only the default pool with `default_slots`.
    pub fn new(default_slots: u32) -> Self {
        let mut pools = HashMap::new();
        pools.insert(
            DEFAULT_POOL.to_string(),
            Pool::new(DEFAULT_POOL, default_slots),
        );
        Self { pools }
    }

    /// Builder: add or replace a pool.
    pub fn with_pool(mut self, name: impl Into<String>, slots: u32) -> Self {
        self.insert(Pool::new(name, slots));
        self
    }

    /// Add or replace a pool.
    pub fn insert(&mut self, pool: Pool) {
        self.pools.insert(pool.name.clone(), pool);
    }

    /// Look up a pool by name.
    pub fn get(&self, name: &str) -> Option<&Pool> {
        self.pools.get(name)
    }

    /// Number of registered pools.
    pub fn len(&self) -> usize {
        self.pools.len()
    }

    /// Always false: the default pool is always present.
    pub fn is_empty(&self) -> bool {
        self.pools.is_empty()
    }
}

impl Default for PoolRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_POOL_SLOTS)
    }
}
