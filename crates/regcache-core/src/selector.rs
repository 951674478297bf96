//! Filter and select over the registry snapshot
//!
//! Every query is a pure read of the current snapshot; nothing here calls
//! the registry. Results are sorted by instance ID.

use std::sync::Arc;

use regcache_common::protocol::Instance;

use crate::random::RandomSource;
use crate::snapshot::RegistrySnapshot;
use crate::weighted::{WeightedItem, WeightedSelector};

/// Instance filter: service name, optionally narrowed by zone and tags.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstanceQuery {
    pub name: String,
    pub zone: Option<String>,
    /// All must be present on a match
    pub tags: Vec<String>,
}

impl InstanceQuery {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn zone(mut self, zone: impl Into<String>) -> Self {
        self.zone = Some(zone.into());
        self
    }

    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    pub fn tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags.extend(tags.into_iter().map(Into::into));
        self
    }

    pub fn matches(&self, instance: &Instance) -> bool {
        instance.service_name == self.name
            && self.zone.as_deref().map_or(true, |zone| instance.zone() == Some(zone))
            && instance.has_tags(&self.tags)
    }
}

/// Query and pick instances from a shared snapshot.
#[derive(Clone)]
pub struct InstanceSelector {
    snapshot: Arc<RegistrySnapshot>,
    random: Arc<RandomSource>,
    weighted: WeightedSelector,
}

impl InstanceSelector {
    pub fn new(snapshot: Arc<RegistrySnapshot>, random: Arc<RandomSource>) -> Self {
        let weighted = WeightedSelector::new(Arc::clone(&random));
        Self {
            snapshot,
            random,
            weighted,
        }
    }

    /// All instances matching `query`.
    pub fn by_query(&self, query: &InstanceQuery) -> Vec<Instance> {
        let items = self.snapshot.items();
        let mut found: Vec<Instance> = items
            .values()
            .filter(|instance| query.matches(instance))
            .cloned()
            .collect();
        found.sort_by(|a, b| a.id.cmp(&b.id));
        found
    }

    pub fn by_name(&self, name: &str) -> Vec<Instance> {
        self.by_query(&InstanceQuery::new(name))
    }

    pub fn by_name_and_zone(&self, name: &str, zone: &str) -> Vec<Instance> {
        self.by_query(&InstanceQuery::new(name).zone(zone))
    }

    /// Instances carrying every tag in `tags`; an empty list matches all.
    pub fn by_name_and_tags<S: AsRef<str>>(&self, name: &str, tags: &[S]) -> Vec<Instance> {
        self.by_query(&InstanceQuery::new(name).tags(tags.iter().map(|t| t.as_ref().to_string())))
    }

    pub fn addrs_by_name(&self, name: &str) -> Vec<String> {
        endpoints(self.by_name(name))
    }

    pub fn addrs_by_name_and_zone(&self, name: &str, zone: &str) -> Vec<String> {
        endpoints(self.by_name_and_zone(name, zone))
    }

    pub fn addrs_by_name_and_tags<S: AsRef<str>>(&self, name: &str, tags: &[S]) -> Vec<String> {
        endpoints(self.by_name_and_tags(name, tags))
    }

    /// Uniform pick; `None` on empty input.
    pub fn select_one<'a>(&self, candidates: &'a [Instance]) -> Option<&'a Instance> {
        if candidates.is_empty() {
            return None;
        }
        candidates.get(self.random.intn(candidates.len()))
    }

    /// Weighted pick using each instance's `weight` metadata.
    pub fn select_weighted<'a>(&self, candidates: &'a [Instance]) -> Option<&'a Instance> {
        let weighted: Vec<WeightedItem<&Instance>> = candidates
            .iter()
            .map(|instance| WeightedItem::new(instance, instance.weight()))
            .collect();
        self.weighted.select(&weighted).map(|(_, instance)| *instance)
    }
}

fn endpoints(instances: Vec<Instance>) -> Vec<String> {
    instances.iter().map(Instance::endpoint).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use regcache_common::protocol::{Metadata, META_WEIGHT, META_ZONE};
    use std::collections::HashMap;
    use std::time::Duration;

    fn instance(name: &str, host: &str, port: u16, meta: &[(&str, &str)]) -> Instance {
        let meta: Metadata = meta.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        Instance::new(name, host, port).with_meta(meta)
    }

    fn selector(instances: Vec<Instance>) -> InstanceSelector {
        let snapshot = Arc::new(RegistrySnapshot::new(Duration::from_secs(10)));
        snapshot.replace(
            instances
                .into_iter()
                .map(|i| (i.id.clone(), i))
                .collect::<HashMap<_, _>>(),
        );
        InstanceSelector::new(snapshot, Arc::new(RandomSource::seeded(21)))
    }

    fn fleet() -> InstanceSelector {
        selector(vec![
            instance("orders", "10.0.0.5", 9090, &[("scheme", "ws"), (META_ZONE, "eu"), ("env", "TEST")]),
            instance("orders", "10.0.0.6", 9090, &[("scheme", "tcp"), (META_ZONE, "us"), ("env", "TEST")]),
            instance("orders", "10.0.0.7", 9090, &[("scheme", "ws"), (META_ZONE, "us"), ("env", "PRODUCT")]),
            instance("billing", "10.0.1.1", 7000, &[("scheme", "ws"), (META_ZONE, "eu"), ("env", "TEST")]),
        ])
    }

    #[test]
    fn test_by_name_sorted() {
        let found = fleet().by_name("orders");
        let ids: Vec<&str> = found.iter().map(|i| i.id.as_str()).collect();
        assert_eq!(
            ids,
            vec!["orders#10.0.0.5:9090", "orders#10.0.0.6:9090", "orders#10.0.0.7:9090"]
        );
    }

    #[test]
    fn test_unknown_name_empty() {
        assert!(fleet().by_name("payments").is_empty());
    }

    #[test]
    fn test_by_name_and_zone() {
        let addrs = fleet().addrs_by_name_and_zone("orders", "us");
        assert_eq!(addrs, vec!["10.0.0.6:9090", "10.0.0.7:9090"]);
    }

    #[test]
    fn test_tags_and_semantics() {
        let s = fleet();
        assert_eq!(s.addrs_by_name_and_tags("orders", &["ws"]).len(), 2);
        assert_eq!(s.addrs_by_name_and_tags("orders", &["ws", "us"]), vec!["10.0.0.7:9090"]);
        assert_eq!(s.addrs_by_name_and_tags("orders", &["us", "ws"]), vec!["10.0.0.7:9090"]);
        assert!(s.addrs_by_name_and_tags("orders", &["ws", "grpc"]).is_empty());
        assert_eq!(s.addrs_by_name_and_tags::<&str>("orders", &[]).len(), 3);
    }

    #[test]
    fn test_query_builder() {
        let query = InstanceQuery::new("orders").zone("us").tag("TEST");
        assert_eq!(fleet().by_query(&query).len(), 1);
    }

    #[test]
    fn test_select_one_empty() {
        assert!(fleet().select_one(&[]).is_none());
        assert!(fleet().select_weighted(&[]).is_none());
    }

    #[test]
    fn test_select_one_covers_all() {
        let s = fleet();
        let candidates = s.by_name("orders");
        let mut seen = std::collections::HashSet::new();
        for _ in 0..300 {
            seen.insert(s.select_one(&candidates).unwrap().id.clone());
        }
        assert_eq!(seen.len(), 3);
    }

    #[test]
    fn test_select_weighted_skips_zero_weight() {
        let s = selector(vec![
            instance("api", "h1", 1, &[(META_WEIGHT, "0")]),
            instance("api", "h2", 1, &[(META_WEIGHT, "5")]),
        ]);
        let candidates = s.by_name("api");
        for _ in 0..200 {
            assert_eq!(s.select_weighted(&candidates).unwrap().address, "h2");
        }
    }

    #[test]
    fn test_select_weighted_all_zero() {
        let s = selector(vec![instance("api", "h1", 1, &[(META_WEIGHT, "0")])]);
        let candidates = s.by_name("api");
        assert!(s.select_weighted(&candidates).is_none());
    }
}
