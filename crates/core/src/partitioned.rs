//! The partitioned hashring.

use crate::{Hashring, JsonStore, Stencil};
use rdsys_api::{DynResource, RdResult, Registry, Resource, ResourceEvent};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

/// The reserved partition for resources that must not be distributed:
/// their operator either asked for no distribution, or asked for a
/// distributor we do not know.
pub const NONE_PARTITION: &str = "none";

/// A hashring split into one sub-ring per partition name.
///
/// A resource's partition is chosen, in order, by its declared
/// distributor, by the partition any of its relation identifiers is
/// already recorded in, and finally by the [Stencil]. Whenever a
/// resource lands in a real partition, all of its relation identifiers
/// are recorded there, so related resources stay co-located.
#[derive(Debug)]
pub struct PartitionedHashring {
    /// Partition names (for example distributor names) and their
    /// hashrings. The map itself is fixed at construction; only the
    /// rings mutate.
    partitions: HashMap<String, Arc<Hashring>>,

    /// Resource identifiers (like fingerprints or IPs) and their
    /// related partition names. Used to place a new resource in the
    /// partition where its relatives already live: two bridges with the
    /// same fingerprint should always be in the same partition.
    relations: Mutex<HashMap<String, String>>,

    stencil: Stencil,

    store: Option<JsonStore>,
    store_resources: bool,
}

impl PartitionedHashring {
    /// Construct a partitioned hashring with one partition per
    /// proportion entry, plus the reserved [NONE_PARTITION].
    pub fn new(proportions: &BTreeMap<String, u32>) -> Self {
        let mut partitions = HashMap::new();
        for name in proportions.keys() {
            partitions.insert(name.clone(), Arc::new(Hashring::new()));
        }
        partitions
            .insert(NONE_PARTITION.to_string(), Arc::new(Hashring::new()));
        Self {
            partitions,
            relations: Mutex::new(HashMap::new()),
            stencil: Stencil::build(proportions),
            store: None,
            store_resources: false,
        }
    }

    /// Add the given resource to the partition it maps to.
    pub fn add(&self, r: DynResource) -> RdResult<()> {
        let name = self.partition_name(&r);
        self.add_relation_identifiers(&r, &name);
        self.hashring(&name)
            .expect("partition name always maps to a ring")
            .add(r)
    }

    /// Add or update the given resource in the partition it maps to.
    pub fn add_or_update(&self, r: DynResource) -> ResourceEvent {
        let name = self.partition_name(&r);
        self.add_relation_identifiers(&r, &name);
        self.hashring(&name)
            .expect("partition name always maps to a ring")
            .add_or_update(r)
    }

    /// Remove the given resource from the partition it maps to.
    pub fn remove(&self, r: &DynResource) -> RdResult<()> {
        let name = self.partition_name(r);
        self.hashring(&name)
            .expect("partition name always maps to a ring")
            .remove(r)
    }

    /// The resources of all partitions that pass the given filter.
    pub fn filter<F>(&self, f: F) -> Vec<DynResource>
    where
        F: Fn(&DynResource) -> bool,
    {
        let mut resources = Vec::new();
        for h in self.partitions.values() {
            resources.extend(h.filter(&f));
        }
        resources
    }

    /// A snapshot of the resources of all partitions.
    pub fn get_all(&self) -> Vec<DynResource> {
        let mut resources = Vec::new();
        for h in self.partitions.values() {
            resources.extend(h.get_all());
        }
        resources
    }

    /// Prune expired resources from every partition.
    pub fn prune(&self) -> Vec<DynResource> {
        let mut resources = Vec::new();
        for h in self.partitions.values() {
            resources.extend(h.prune());
        }
        resources
    }

    /// The total number of resources across all partitions.
    pub fn len(&self) -> usize {
        self.partitions.values().map(|h| h.len()).sum()
    }

    /// Whether all partitions are empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Reset every partition to empty.
    pub fn clear(&self) {
        for h in self.partitions.values() {
            h.clear();
        }
    }

    /// The partition the given resource belongs to.
    ///
    /// A non-empty declared distributor always wins; an unknown declared
    /// distributor maps to [NONE_PARTITION]. Otherwise a recorded
    /// relation wins over the stencil, with the last matching relation
    /// identifier taking precedence.
    pub fn partition_name(&self, r: &DynResource) -> String {
        if let Some(dist_name) = r.distributor() {
            if self.partitions.contains_key(&dist_name)
                && dist_name != NONE_PARTITION
            {
                return dist_name;
            }
            return NONE_PARTITION.to_string();
        }

        let mut partition_name = String::new();
        {
            let relations = self.relations.lock().unwrap();
            for id in r.relation_identifiers() {
                if let Some(name) = relations.get(&id) {
                    if self.partitions.contains_key(name) {
                        partition_name = name.clone();
                    }
                }
            }
        }

        if partition_name.is_empty() {
            partition_name = self
                .stencil
                .partition_name(r)
                .unwrap_or(NONE_PARTITION)
                .to_string();
        }
        partition_name
    }

    /// The hashring backing the given partition.
    pub fn hashring(&self, partition_name: &str) -> Option<Arc<Hashring>> {
        self.partitions.get(partition_name).cloned()
    }

    fn add_relation_identifiers(&self, r: &DynResource, partition_name: &str) {
        if partition_name == NONE_PARTITION {
            return;
        }
        let mut relations = self.relations.lock().unwrap();
        for identifier in r.relation_identifiers() {
            relations.insert(identifier, partition_name.to_string());
        }
    }

    /// Load previously persisted relations (and resources, when this
    /// type stores them) and remember the store handle for future
    /// saves. Resources are re-added through the normal add path so
    /// they land in the right partition, driven by the restored
    /// relations map.
    pub(crate) fn init_store(
        &mut self,
        store: JsonStore,
        store_resources: bool,
        registry: &Registry,
    ) {
        self.store_resources = store_resources;
        match store.load() {
            Ok(value) => {
                if let Some(relations) = value.get("relations") {
                    if let Ok(relations) = serde_json::from_value::<
                        HashMap<String, String>,
                    >(relations.clone())
                    {
                        *self.relations.lock().unwrap() = relations;
                    }
                }
                if store_resources {
                    for raw in value
                        .get("resources")
                        .and_then(|r| r.as_array())
                        .into_iter()
                        .flatten()
                    {
                        match registry.decode(raw) {
                            Ok(r) => {
                                let _ = self.add(r);
                            }
                            Err(err) => tracing::warn!(
                                ?err,
                                "Error loading resource from hashring store",
                            ),
                        }
                    }
                }
            }
            Err(err) => {
                tracing::info!(?err, "Error loading data from hashring store")
            }
        }
        self.store = Some(store);
    }

    /// Persist the relations map and, when this type stores resources,
    /// the resources of every partition.
    pub fn save(&self) -> RdResult<()> {
        let Some(store) = self.store.as_ref() else {
            return Ok(());
        };
        let relations = self.relations.lock().unwrap().clone();
        let resources: Option<Vec<serde_json::Value>> =
            self.store_resources.then(|| {
                self.get_all().iter().map(|r| r.to_json()).collect()
            });
        store.save(&serde_json::json!({
            "relations": relations,
            "resources": resources,
        }))
    }
}

#[cfg(test)]
mod test;
