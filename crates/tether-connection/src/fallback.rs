//! Host fallback policy
//!
//! Orders candidate hosts for one attempt sequence and remembers the last
//! fallback host that worked. The fallback list is shuffled once when the
//! policy is built and keeps that order for the policy's lifetime, so retries
//! walk the hosts in a stable sequence.

use rand::seq::SliceRandom;
use rand::Rng;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// Recently successful non-primary host
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FallbackHostEntry {
    /// Host that accepted a connection
    pub host: String,
    /// Instant after which the entry is ignored
    pub valid_until: Instant,
}

/// Orders hosts and caches a good fallback
#[derive(Debug, Clone)]
pub struct HostFallbackPolicy {
    primary: String,
    fallbacks: Vec<String>,
    cache_ttl: Duration,
    cached: Option<FallbackHostEntry>,
}

impl HostFallbackPolicy {
    /// Policy with fallbacks shuffled by the thread RNG
    pub fn new(primary: impl Into<String>, fallbacks: Vec<String>, cache_ttl: Duration) -> Self {
        Self::with_rng(primary, fallbacks, cache_ttl, &mut rand::thread_rng())
    }

    /// Policy with fallbacks shuffled by `rng`
    pub fn with_rng<R: Rng + ?Sized>(
        primary: impl Into<String>,
        mut fallbacks: Vec<String>,
        cache_ttl: Duration,
        rng: &mut R,
    ) -> Self {
        let primary = primary.into();
        fallbacks.retain(|host| *host != primary);
        fallbacks.shuffle(rng);
        Self {
            primary,
            fallbacks,
            cache_ttl,
            cached: None,
        }
    }

    /// Host order for a new attempt sequence
    ///
    /// A still-valid cached fallback comes first, then the primary, then the
    /// remaining fallbacks. With `force_fallback` the primary moves to the end.
    pub fn plan(&mut self, now: Instant, force_fallback: bool) -> HostPlan {
        let cached = self.cached_host(now).map(str::to_string);
        if cached.is_none() && self.cached.is_some() {
            debug!("fallback host cache expired");
            self.cached = None;
        }

        let mut order = Vec::with_capacity(self.fallbacks.len() + 1);
        order.extend(cached.iter().cloned());
        if !force_fallback {
            order.push(self.primary.clone());
        }
        order.extend(
            self.fallbacks
                .iter()
                .filter(|host| cached.as_ref() != Some(*host))
                .cloned(),
        );
        if force_fallback {
            order.push(self.primary.clone());
        }

        HostPlan {
            order,
            position: 0,
            cached,
        }
    }

    /// Remember `host` after a successful connection
    ///
    /// The primary is never cached.
    pub fn persist_success(&mut self, host: &str, now: Instant) {
        if host == self.primary {
            return;
        }
        debug!(host, ttl_ms = self.cache_ttl.as_millis() as u64, "caching fallback host");
        self.cached = Some(FallbackHostEntry {
            host: host.to_string(),
            valid_until: now + self.cache_ttl,
        });
    }

    /// Forget the cached host if it is `host`; true if something was discarded
    pub fn discard(&mut self, host: &str) -> bool {
        if self.cached.as_ref().is_some_and(|entry| entry.host == host) {
            debug!(host, "discarding cached fallback host");
            self.cached = None;
            return true;
        }
        false
    }

    /// Cached host if still valid at `now`
    pub fn cached_host(&self, now: Instant) -> Option<&str> {
        self.cached
            .as_ref()
            .filter(|entry| now < entry.valid_until)
            .map(|entry| entry.host.as_str())
    }

    /// Cached entry, valid or not
    pub fn cached_entry(&self) -> Option<&FallbackHostEntry> {
        self.cached.as_ref()
    }

    /// Primary host
    pub fn primary(&self) -> &str {
        &self.primary
    }

    /// Fallback hosts in their stable order
    pub fn fallbacks(&self) -> &[String] {
        &self.fallbacks
    }
}

/// Hosts for one attempt sequence, each returned at most once
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostPlan {
    order: Vec<String>,
    position: usize,
    cached: Option<String>,
}

impl HostPlan {
    /// Next untried host
    pub fn next_host(&mut self) -> Option<String> {
        let host = self.order.get(self.position).cloned();
        if host.is_some() {
            self.position += 1;
        }
        host
    }

    /// First host without consuming it
    pub fn peek(&self) -> Option<&str> {
        self.order.get(self.position).map(String::as_str)
    }

    /// Whether `host` came from the fallback cache
    pub fn is_cached(&self, host: &str) -> bool {
        self.cached.as_deref() == Some(host)
    }

    /// Hosts not yet returned
    pub fn remaining(&self) -> usize {
        self.order.len() - self.position
    }

    /// Full order of this plan
    pub fn hosts(&self) -> &[String] {
        &self.order
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::collections::HashSet;

    fn hosts(names: &[&str]) -> Vec<String> {
        names.iter().map(|name| name.to_string()).collect()
    }

    fn policy() -> HostFallbackPolicy {
        HostFallbackPolicy::with_rng(
            "primary",
            hosts(&["f1", "f2", "f3"]),
            Duration::from_secs(60),
            &mut StdRng::seed_from_u64(7),
        )
    }

    fn drain(mut plan: HostPlan) -> Vec<String> {
        std::iter::from_fn(|| plan.next_host()).collect()
    }

    #[test]
    fn test_primary_first_then_stable_fallbacks() {
        let mut policy = policy();
        let now = Instant::now();
        let first = drain(policy.plan(now, false));
        let second = drain(policy.plan(now, false));
        assert_eq!(first[0], "primary");
        assert_eq!(first, second);
        assert_eq!(first.len(), 4);
    }

    #[test]
    fn test_cached_host_tried_first_until_expiry() {
        let mut policy = policy();
        let now = Instant::now();
        policy.persist_success("f2", now);

        let plan = policy.plan(now + Duration::from_secs(59), false);
        assert!(plan.is_cached("f2"));
        let order = drain(plan);
        assert_eq!(order[0], "f2");
        assert_eq!(order[1], "primary");
        assert_eq!(order.iter().filter(|h| *h == "f2").count(), 1);

        let order = drain(policy.plan(now + Duration::from_secs(60), false));
        assert_eq!(order[0], "primary");
        assert!(policy.cached_entry().is_none());
    }

    #[test]
    fn test_primary_is_never_cached() {
        let mut policy = policy();
        policy.persist_success("primary", Instant::now());
        assert!(policy.cached_entry().is_none());
    }

    #[test]
    fn test_discard_only_matching_host() {
        let mut policy = policy();
        let now = Instant::now();
        policy.persist_success("f1", now);
        assert!(!policy.discard("f3"));
        assert_eq!(policy.cached_host(now), Some("f1"));
        assert!(policy.discard("f1"));
        assert_eq!(policy.cached_host(now), None);
    }

    #[test]
    fn test_force_fallback_moves_primary_last() {
        let mut policy = policy();
        let order = drain(policy.plan(Instant::now(), true));
        assert_eq!(order.last().map(String::as_str), Some("primary"));
        assert_ne!(order[0], "primary");
    }

    #[test]
    fn test_primary_duplicate_in_fallbacks_is_dropped() {
        let mut policy = HostFallbackPolicy::new(
            "primary",
            hosts(&["primary", "f1"]),
            Duration::from_secs(1),
        );
        assert_eq!(policy.fallbacks(), &["f1".to_string()]);
        let mut plan = policy.plan(Instant::now(), false);
        assert_eq!(plan.peek(), Some("primary"));
        assert_eq!(plan.remaining(), 2);
        plan.next_host();
        plan.next_host();
        assert_eq!(plan.next_host(), None);
        assert_eq!(plan.remaining(), 0);
    }

    proptest! {
        #[test]
        fn prop_plan_never_repeats_a_host(
            fallback_count in 0usize..8,
            cached_index in proptest::option::of(0usize..8),
            force in any::<bool>(),
            seed in any::<u64>(),
        ) {
            let fallbacks: Vec<String> = (0..fallback_count).map(|i| format!("f{i}")).collect();
            let mut policy = HostFallbackPolicy::with_rng(
                "primary",
                fallbacks.clone(),
                Duration::from_secs(10),
                &mut StdRng::seed_from_u64(seed),
            );
            let now = Instant::now();
            if let Some(host) = cached_index.and_then(|i| fallbacks.get(i)) {
                policy.persist_success(host, now);
            }

            let order = drain(policy.plan(now, force));
            let unique: HashSet<&String> = order.iter().collect();
            prop_assert_eq!(unique.len(), order.len());
            prop_assert_eq!(order.len(), fallback_count + 1);
        }
    }
}
