//! # Planner
//!
//! Drives the two rewrite stages and selects the cheapest executable
//! physical tree. Selections are memoized in a bounded LRU keyed by the
//! logical tree's structural digest: a hit returns the identical
//! `Arc<PhysicalPlan>` that was installed, a property the plan-cache tests
//! rely on. The cache can be bypassed per call.

use super::logical::LogicalPlan;
use super::physical::PhysicalPlan;
use super::rules::{stage_one, stage_two};
use crate::catalog::Entity;
use crate::config::EngineConfig;
use crate::error::DbError;
use eyre::Result;
use hashbrown::HashMap;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;

struct PlanCache {
    map: HashMap<u64, Arc<PhysicalPlan>>,
    order: VecDeque<u64>,
    capacity: usize,
}

impl PlanCache {
    fn new(capacity: usize) -> Self {
        Self {
            map: HashMap::with_capacity(capacity),
            order: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
        }
    }

    fn get(&mut self, digest: u64) -> Option<Arc<PhysicalPlan>> {
        let plan = self.map.get(&digest).cloned()?;
        // Refresh recency.
        self.order.retain(|d| *d != digest);
        self.order.push_back(digest);
        Some(plan)
    }

    fn insert(&mut self, digest: u64, plan: Arc<PhysicalPlan>) {
        if self.map.len() >= self.capacity && !self.map.contains_key(&digest) {
            if let Some(evicted) = self.order.pop_front() {
                self.map.remove(&evicted);
            }
        }
        self.order.retain(|d| *d != digest);
        self.order.push_back(digest);
        self.map.insert(digest, plan);
    }
}

pub struct Planner {
    config: EngineConfig,
    cache: Mutex<PlanCache>,
}

impl Planner {
    pub fn new(config: EngineConfig) -> Self {
        let capacity = config.plan_cache_size;
        Self {
            config,
            cache: Mutex::new(PlanCache::new(capacity)),
        }
    }

    /// Stage 1 then stage 2: every executable physical alternative for the
    /// logical tree. Empty candidate sets are a planner error.
    pub fn plan(&self, logical: &LogicalPlan, entity: &Arc<Entity>) -> Result<Vec<PhysicalPlan>> {
        let mut physical = Vec::new();
        for variant in stage_one(logical, entity) {
            for candidate in stage_two(&variant, entity, &self.config) {
                if candidate.executable()
                    && !candidate.total_cost(entity).is_invalid()
                    && !physical.contains(&candidate)
                {
                    physical.push(candidate);
                }
            }
        }
        if physical.is_empty() {
            return Err(
                DbError::QueryPlanner(format!("no executable plan for {}", logical.entity()))
                    .into(),
            );
        }
        Ok(physical)
    }

    /// Returns the cached selection for the digest, or plans, selects the
    /// minimum-total-cost tree and installs it.
    pub fn plan_and_select(
        &self,
        logical: &LogicalPlan,
        entity: &Arc<Entity>,
        bypass_cache: bool,
    ) -> Result<Arc<PhysicalPlan>> {
        let digest = logical.digest();
        if !bypass_cache {
            if let Some(hit) = self.cache.lock().get(digest) {
                return Ok(hit);
            }
        }

        let candidates = self.plan(logical, entity)?;
        let best = candidates
            .into_iter()
            .min_by(|a, b| {
                a.total_cost(entity)
                    .total()
                    .total_cmp(&b.total_cost(entity).total())
            })
            .expect("plan() never returns an empty set");
        let best = Arc::new(best);
        if !bypass_cache {
            self.cache.lock().insert(digest, Arc::clone(&best));
        }
        Ok(best)
    }
}
