//! Unique resource allocation.
//!
//! Given one or more patterns, the allocator hands out names that are not
//! banned and not already recorded as in use. It first draws random
//! candidates so load spreads across the pool; once a pool rejects more than
//! `random_exhaustion_ratio` of its combinations it falls back to walking
//! the pools in order until one of them alone can satisfy the request.
//!
//! Names are produced in groups of `consecutive` taken back to back from one
//! pool, for callers that need contiguous blocks such as port ranges.

use std::collections::HashSet;

use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, trace, warn};

use crate::config::AllocatorConfig;
use crate::error::{ResourceError, StoreError};
use crate::resource::pattern::{ResourcePool, ResourceString};
use crate::store::PropertyStore;

/// Result type alias for allocation.
pub type Result<T> = std::result::Result<T, ResourceError>;

/// Decides whether a candidate is already taken.
#[async_trait]
pub trait ResourceLookup: Send + Sync {
    async fn is_in_use(&self, candidate: &str) -> std::result::Result<bool, StoreError>;
}

/// Treats a candidate as in use when `<prefix><candidate>` exists in a store.
pub struct StoreLookup<S> {
    store: S,
    prefix: String,
}

impl<S: PropertyStore> StoreLookup<S> {
    pub fn new(store: S, prefix: impl Into<String>) -> Self {
        Self {
            store,
            prefix: prefix.into(),
        }
    }
}

#[async_trait]
impl<S: PropertyStore> ResourceLookup for StoreLookup<S> {
    async fn is_in_use(&self, candidate: &str) -> std::result::Result<bool, StoreError> {
        self.store
            .exists(&format!("{}{}", self.prefix, candidate))
            .await
    }
}

/// Adapts a plain predicate.
pub struct FnLookup<F>(pub F);

#[async_trait]
impl<F> ResourceLookup for FnLookup<F>
where
    F: Fn(&str) -> bool + Send + Sync,
{
    async fn is_in_use(&self, candidate: &str) -> std::result::Result<bool, StoreError> {
        Ok((self.0)(candidate))
    }
}

/// What to allocate.
pub struct AllocationRequest<'a> {
    patterns: Vec<String>,
    pools: Vec<Box<dyn ResourcePool + 'a>>,
    banned: HashSet<String>,
    minimum: Option<usize>,
    consecutive: usize,
    lookup: Option<&'a dyn ResourceLookup>,
}

impl<'a> AllocationRequest<'a> {
    pub fn new<I, P>(patterns: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<String>,
    {
        Self {
            patterns: patterns.into_iter().map(Into::into).collect(),
            pools: Vec::new(),
            banned: HashSet::new(),
            minimum: None,
            consecutive: 1,
            lookup: None,
        }
    }

    /// Add a pool that is not described by a pattern string.
    pub fn pool(mut self, pool: Box<dyn ResourcePool + 'a>) -> Self {
        self.pools.push(pool);
        self
    }

    /// Names that must never be returned.
    pub fn banned<I, P>(mut self, banned: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<String>,
    {
        self.banned.extend(banned.into_iter().map(Into::into));
        self
    }

    /// How many names to return.
    pub fn minimum(mut self, minimum: usize) -> Self {
        self.minimum = Some(minimum);
        self
    }

    /// Size of each back-to-back group. `minimum` must be a multiple of it.
    pub fn consecutive(mut self, consecutive: usize) -> Self {
        self.consecutive = consecutive;
        self
    }

    /// Where to check whether a name is already in use.
    pub fn lookup(mut self, lookup: &'a dyn ResourceLookup) -> Self {
        self.lookup = Some(lookup);
        self
    }
}

/// Tracks what the current phase has accepted.
struct Selection<'r> {
    banned: &'r HashSet<String>,
    lookup: Option<&'r dyn ResourceLookup>,
    found: Vec<String>,
    taken: HashSet<String>,
}

impl Selection<'_> {
    async fn acceptable(&self, candidate: &str, pending: &[String]) -> Result<bool> {
        if self.banned.contains(candidate)
            || self.taken.contains(candidate)
            || pending.iter().any(|p| p == candidate)
        {
            return Ok(false);
        }
        match self.lookup {
            Some(lookup) => Ok(!lookup.is_in_use(candidate).await?),
            None => Ok(true),
        }
    }

    fn accept(&mut self, group: Vec<String>) {
        self.taken.extend(group.iter().cloned());
        self.found.extend(group);
    }

    fn clear(&mut self) {
        self.found.clear();
        self.taken.clear();
    }
}

/// Hands out unique resource names.
#[derive(Debug, Clone, Default)]
pub struct ResourceAllocator {
    config: AllocatorConfig,
}

impl ResourceAllocator {
    pub fn new(config: AllocatorConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &AllocatorConfig {
        &self.config
    }

    /// Allocate names for `request`.
    ///
    /// Returns exactly the requested number of distinct names or fails with
    /// [`ResourceError::InsufficientResources`]; partial lists are never
    /// returned.
    pub async fn obtain(&self, request: AllocationRequest<'_>) -> Result<Vec<String>> {
        let mut rng = StdRng::from_entropy();
        self.obtain_with_rng(request, &mut rng).await
    }

    /// Same as [`obtain`](Self::obtain) with a caller-supplied random source.
    pub async fn obtain_with_rng<R>(
        &self,
        request: AllocationRequest<'_>,
        rng: &mut R,
    ) -> Result<Vec<String>>
    where
        R: Rng + Send,
    {
        let minimum = request.minimum.unwrap_or(self.config.default_minimum);
        let consecutive = request.consecutive;
        if consecutive == 0 {
            return Err(ResourceError::InvalidRequest(
                "consecutive group size must be at least 1".to_string(),
            ));
        }
        if minimum % consecutive != 0 {
            return Err(ResourceError::InvalidRequest(format!(
                "minimum {minimum} is not a multiple of consecutive group size {consecutive}"
            )));
        }

        let AllocationRequest {
            patterns,
            pools: extra,
            banned,
            lookup,
            ..
        } = request;
        let mut pools: Vec<Box<dyn ResourcePool + '_>> = Vec::with_capacity(patterns.len());
        for pattern in &patterns {
            pools.push(Box::new(ResourceString::parse(pattern)?));
        }
        pools.extend(extra);
        if pools.is_empty() {
            return Err(ResourceError::InvalidRequest(
                "at least one resource pattern is required".to_string(),
            ));
        }
        if minimum == 0 {
            return Ok(Vec::new());
        }

        let mut selection = Selection {
            banned: &banned,
            lookup,
            found: Vec::new(),
            taken: HashSet::new(),
        };

        if self
            .random_phase(&mut pools, &mut selection, minimum, consecutive, rng)
            .await?
        {
            debug!(count = minimum, "resources allocated randomly");
            return Ok(selection.found);
        }

        selection.clear();
        let best = self
            .sequential_phase(&mut pools, &mut selection, minimum, consecutive)
            .await?;
        if selection.found.len() < minimum {
            warn!(requested = minimum, found = best, "insufficient resources");
            return Err(ResourceError::InsufficientResources {
                requested: minimum,
                found: best,
            });
        }
        debug!(count = minimum, "resources allocated sequentially");
        Ok(selection.found)
    }

    /// Returns true once `minimum` names are selected, false if abandoned.
    async fn random_phase<R>(
        &self,
        pools: &mut [Box<dyn ResourcePool + '_>],
        selection: &mut Selection<'_>,
        minimum: usize,
        consecutive: usize,
        rng: &mut R,
    ) -> Result<bool>
    where
        R: Rng + Send,
    {
        let mut rejected = vec![0u64; pools.len()];
        while selection.found.len() < minimum {
            let index = rng.gen_range(0..pools.len());
            let pool = &mut pools[index];
            let limit = (pool.combinations() as f64 * self.config.random_exhaustion_ratio) as u64;

            let mut group = Vec::with_capacity(consecutive);
            let mut candidate = Some(pool.random(rng));
            while let Some(name) = candidate {
                if !selection.acceptable(&name, &group).await? {
                    trace!(candidate = %name, "random candidate rejected");
                    break;
                }
                group.push(name);
                if group.len() == consecutive {
                    break;
                }
                candidate = pool.next();
            }

            if group.len() == consecutive {
                trace!(first = %group[0], size = consecutive, "random group accepted");
                selection.accept(group);
                continue;
            }

            rejected[index] += 1;
            if rejected[index] > limit {
                warn!(
                    pool = index,
                    rejected = rejected[index],
                    combinations = pool.combinations(),
                    "random allocation abandoned, falling back to sequential search"
                );
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Walk each pool from its first candidate until one of them alone
    /// yields `minimum` names.
    ///
    /// A pool that runs out first contributes nothing. Returns the most names
    /// any single pool could offer.
    async fn sequential_phase(
        &self,
        pools: &mut [Box<dyn ResourcePool + '_>],
        selection: &mut Selection<'_>,
        minimum: usize,
        consecutive: usize,
    ) -> Result<usize> {
        let mut best = 0;
        for (index, pool) in pools.iter_mut().enumerate() {
            selection.clear();
            let total = pool.combinations();
            let mut attempts = 0u64;
            let mut group = Vec::with_capacity(consecutive);
            let mut candidate = Some(pool.first());

            while let Some(name) = candidate {
                if selection.found.len() >= minimum || attempts >= total {
                    break;
                }
                attempts += 1;
                if selection.acceptable(&name, &group).await? {
                    group.push(name);
                    if group.len() == consecutive {
                        selection.accept(std::mem::take(&mut group));
                    }
                } else {
                    trace!(candidate = %name, "sequential candidate rejected");
                    group.clear();
                }
                candidate = pool.next();
            }

            if selection.found.len() >= minimum {
                return Ok(selection.found.len());
            }
            best = best.max(selection.found.len());
            debug!(
                pool = index,
                attempts,
                found = selection.found.len(),
                "pool exhausted"
            );
        }
        selection.clear();
        Ok(best)
    }
}

/// Allocate with default settings.
///
/// `lookup` is consulted for every candidate that is not banned.
pub async fn obtain_resources(
    patterns: &[&str],
    banned: &[&str],
    minimum: usize,
    consecutive: usize,
    lookup: Option<&dyn ResourceLookup>,
) -> Result<Vec<String>> {
    let mut request = AllocationRequest::new(patterns.iter().copied())
        .banned(banned.iter().copied())
        .minimum(minimum)
        .consecutive(consecutive);
    if let Some(lookup) = lookup {
        request = request.lookup(lookup);
    }
    ResourceAllocator::default().obtain(request).await
}
