//! Clusters: named groups of backend instances sharing a round-robin
//! cursor.

use portico_common::{GatewayError, Result, ServerInstance};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// A non-empty bag of live backend instances.
///
/// Instances that are not alive, or whose address does not parse as a
/// URL, are dropped at construction; they are invisible to
/// [`Cluster::distribute`]. Clusters are rebuilt from scratch on reload
/// and the previous object is discarded only after the table pointer has
/// been swapped, so in-flight requests keep a consistent view.
pub struct Cluster {
    idx: String,
    instances: Vec<Arc<ServerInstance>>,
    cursor: AtomicUsize,
}

impl Cluster {
    /// Build a cluster from store records. Fails when no usable instance
    /// remains.
    pub fn new(idx: impl Into<String>, instances: Vec<ServerInstance>) -> Result<Self> {
        let idx = idx.into();
        let mut cluster = Self {
            idx,
            instances: Vec::new(),
            cursor: AtomicUsize::new(0),
        };
        cluster.load(instances)?;
        Ok(cluster)
    }

    /// Replace the backing instance slice and reset the cursor.
    pub fn load(&mut self, instances: Vec<ServerInstance>) -> Result<()> {
        let usable: Vec<Arc<ServerInstance>> = instances
            .into_iter()
            .filter(|ins| {
                if !ins.is_alive {
                    tracing::debug!(cluster = %self.idx, instance = %ins.idx, "skipping dead instance");
                    return false;
                }
                if reqwest::Url::parse(&ins.addr).is_err() {
                    tracing::error!(cluster = %self.idx, instance = %ins.idx, addr = %ins.addr,
                        "skipping instance with unparseable address");
                    return false;
                }
                true
            })
            .map(Arc::new)
            .collect();

        if usable.is_empty() {
            return Err(GatewayError::ConfigInvalid(format!(
                "cluster {} has no live instance",
                self.idx
            )));
        }

        self.instances = usable;
        self.cursor.store(0, Ordering::Relaxed);
        Ok(())
    }

    /// Pick one live instance, round-robin, O(1).
    ///
    /// Concurrent callers each get a distinct cursor tick (atomic
    /// fetch-add modulo length); no further ordering is guaranteed.
    pub fn distribute(&self) -> Arc<ServerInstance> {
        let tick = self.cursor.fetch_add(1, Ordering::Relaxed);
        self.instances[tick % self.instances.len()].clone()
    }

    pub fn idx(&self) -> &str {
        &self.idx
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    pub fn instances(&self) -> &[Arc<ServerInstance>] {
        &self.instances
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn instance(idx: &str, alive: bool) -> ServerInstance {
        serde_json::from_str(&format!(
            r#"{{"idx":"{idx}","addr":"http://localhost:9091","is_alive":{alive}}}"#
        ))
        .unwrap()
    }

    #[test]
    fn test_empty_cluster_is_rejected() {
        assert!(Cluster::new("c1", vec![]).is_err());
    }

    #[test]
    fn test_dead_instances_are_invisible() {
        let cluster = Cluster::new(
            "c1",
            vec![instance("a", true), instance("b", false), instance("c", true)],
        )
        .unwrap();
        assert_eq!(cluster.len(), 2);
        for _ in 0..10 {
            assert_ne!(cluster.distribute().idx, "b");
        }
    }

    #[test]
    fn test_all_dead_is_rejected() {
        assert!(Cluster::new("c1", vec![instance("a", false)]).is_err());
    }

    #[test]
    fn test_unparseable_addr_is_skipped() {
        let mut bad = instance("a", true);
        bad.addr = "::not a url::".into();
        let cluster = Cluster::new("c1", vec![bad, instance("b", true)]).unwrap();
        assert_eq!(cluster.len(), 1);
        assert_eq!(cluster.distribute().idx, "b");
    }

    #[test]
    fn test_round_robin_cycles_in_order() {
        let cluster = Cluster::new(
            "c1",
            vec![instance("a", true), instance("b", true), instance("c", true)],
        )
        .unwrap();
        let picks: Vec<String> = (0..6).map(|_| cluster.distribute().idx.clone()).collect();
        assert_eq!(picks, ["a", "b", "c", "a", "b", "c"]);
    }

    #[test]
    fn test_round_robin_distributes_evenly() {
        let cluster = Cluster::new(
            "c1",
            vec![instance("a", true), instance("b", true), instance("c", true)],
        )
        .unwrap();

        let mut counts: HashMap<String, usize> = HashMap::new();
        for _ in 0..300 {
            *counts.entry(cluster.distribute().idx.clone()).or_insert(0) += 1;
        }

        assert_eq!(counts["a"], 100);
        assert_eq!(counts["b"], 100);
        assert_eq!(counts["c"], 100);
    }

    #[test]
    fn test_concurrent_distribute_is_fair() {
        let cluster = Arc::new(
            Cluster::new(
                "c1",
                vec![
                    instance("a", true),
                    instance("b", true),
                    instance("c", true),
                    instance("d", true),
                ],
            )
            .unwrap(),
        );

        let mut handles = Vec::new();
        for _ in 0..8 {
            let cluster = Arc::clone(&cluster);
            handles.push(std::thread::spawn(move || {
                let mut counts: HashMap<String, usize> = HashMap::new();
                for _ in 0..100 {
                    *counts.entry(cluster.distribute().idx.clone()).or_insert(0) += 1;
                }
                counts
            }));
        }

        let mut totals: HashMap<String, usize> = HashMap::new();
        for handle in handles {
            for (idx, n) in handle.join().unwrap() {
                *totals.entry(idx).or_insert(0) += n;
            }
        }

        // 800 calls over 4 instances: every instance is picked exactly
        // once per cursor cycle.
        assert_eq!(totals.values().sum::<usize>(), 800);
        for count in totals.values() {
            assert_eq!(*count, 200);
        }
    }

    #[test]
    fn test_load_replaces_backing_slice() {
        let mut cluster = Cluster::new("c1", vec![instance("a", true)]).unwrap();
        cluster
            .load(vec![instance("x", true), instance("y", true)])
            .unwrap();
        assert_eq!(cluster.len(), 2);
        assert_eq!(cluster.distribute().idx, "x");
    }
}
