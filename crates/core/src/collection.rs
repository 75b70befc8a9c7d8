//! The typed resource collection.

use crate::{Hashring, JsonStore, PartitionedHashring};
use rdsys_api::{
    DynResource, RdError, RdResult, Registry, Resource, ResourceDiff,
    ResourceEvent,
};
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;

/// A group of resources of one type: either a single hashring or a
/// partitioned one.
#[derive(Debug)]
pub enum ResourceGroup {
    /// All resources of the type live in one ring; the partition
    /// argument of lookups is ignored.
    Unpartitioned(Arc<Hashring>),
    /// Resources of the type are split across the configured
    /// distributors.
    Partitioned(PartitionedHashring),
}

impl ResourceGroup {
    /// Add a resource to the group.
    pub fn add(&self, r: DynResource) -> RdResult<()> {
        match self {
            ResourceGroup::Unpartitioned(h) => h.add(r),
            ResourceGroup::Partitioned(p) => p.add(r),
        }
    }

    /// Add or update a resource in the group.
    pub fn add_or_update(&self, r: DynResource) -> ResourceEvent {
        match self {
            ResourceGroup::Unpartitioned(h) => h.add_or_update(r),
            ResourceGroup::Partitioned(p) => p.add_or_update(r),
        }
    }

    /// Remove a resource from the group.
    pub fn remove(&self, r: &DynResource) -> RdResult<()> {
        match self {
            ResourceGroup::Unpartitioned(h) => h.remove(r),
            ResourceGroup::Partitioned(p) => p.remove(r),
        }
    }

    /// The number of resources in the group.
    pub fn len(&self) -> usize {
        match self {
            ResourceGroup::Unpartitioned(h) => h.len(),
            ResourceGroup::Partitioned(p) => p.len(),
        }
    }

    /// Whether the group holds no resources.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove every resource from the group.
    pub fn clear(&self) {
        match self {
            ResourceGroup::Unpartitioned(h) => h.clear(),
            ResourceGroup::Partitioned(p) => p.clear(),
        }
    }

    /// The resources of the group that pass the given filter.
    pub fn filter<F>(&self, f: F) -> Vec<DynResource>
    where
        F: Fn(&DynResource) -> bool,
    {
        match self {
            ResourceGroup::Unpartitioned(h) => h.filter(f),
            ResourceGroup::Partitioned(p) => p.filter(f),
        }
    }

    /// A snapshot of the group's resources.
    pub fn get_all(&self) -> Vec<DynResource> {
        match self {
            ResourceGroup::Unpartitioned(h) => h.get_all(),
            ResourceGroup::Partitioned(p) => p.get_all(),
        }
    }

    /// Prune expired resources from the group.
    pub fn prune(&self) -> Vec<DynResource> {
        match self {
            ResourceGroup::Unpartitioned(h) => h.prune(),
            ResourceGroup::Partitioned(p) => p.prune(),
        }
    }

    /// The partition the given resource maps to; empty for
    /// unpartitioned groups.
    pub fn partition_name(&self, r: &DynResource) -> String {
        match self {
            ResourceGroup::Unpartitioned(_) => String::new(),
            ResourceGroup::Partitioned(p) => p.partition_name(r),
        }
    }

    /// The hashring backing the given partition. Unpartitioned groups
    /// ignore the partition name.
    pub fn hashring(&self, partition_name: &str) -> Option<Arc<Hashring>> {
        match self {
            ResourceGroup::Unpartitioned(h) => Some(h.clone()),
            ResourceGroup::Partitioned(p) => p.hashring(partition_name),
        }
    }

    /// Persist the group, if a store is attached.
    pub fn save(&self) -> RdResult<()> {
        match self {
            ResourceGroup::Unpartitioned(h) => h.save(),
            ResourceGroup::Partitioned(p) => p.save(),
        }
    }
}

/// The configuration of one resource type in a [Collection].
#[derive(Debug, Clone)]
pub struct TypeConfig {
    /// Type name of the resources, e.g. "obfs4".
    pub rtype: String,
    /// Whether the resources live in a single hashring instead of a
    /// partitioned one.
    pub unpartitioned: bool,
    /// For partitioned types: the partition names and the proportion of
    /// resources each should be assigned.
    pub proportions: BTreeMap<String, u32>,
    /// Whether resources of this type should be persisted.
    pub stored: bool,
}

/// The configuration to create a [Collection].
#[derive(Debug, Clone, Default)]
pub struct CollectionConfig {
    /// The directory where persisted state lives, if any.
    pub storage_dir: Option<PathBuf>,
    /// The resource types the collection holds.
    pub types: Vec<TypeConfig>,
}

/// Maps a resource type (e.g. "obfs4") to its corresponding
/// [ResourceGroup].
#[derive(Debug, Default)]
pub struct Collection {
    groups: HashMap<String, ResourceGroup>,
}

impl Collection {
    /// Create a collection from the given configuration, loading
    /// persisted state for stored types.
    pub fn new(cfg: &CollectionConfig, registry: &Registry) -> Self {
        let mut groups = HashMap::new();
        for tc in &cfg.types {
            if tc.unpartitioned {
                let h = Hashring::new();
                if tc.stored {
                    if let Some(dir) = &cfg.storage_dir {
                        h.init_store(JsonStore::new(&tc.rtype, dir), registry);
                    }
                }
                groups.insert(
                    tc.rtype.clone(),
                    ResourceGroup::Unpartitioned(Arc::new(h)),
                );
            } else {
                let mut p = PartitionedHashring::new(&tc.proportions);
                if let Some(dir) = &cfg.storage_dir {
                    p.init_store(
                        JsonStore::new(&tc.rtype, dir),
                        tc.stored,
                        registry,
                    );
                }
                groups.insert(tc.rtype.clone(), ResourceGroup::Partitioned(p));
            }
        }
        Self { groups }
    }

    /// Add a resource to the collection, dispatching on its type.
    pub fn add(&self, r: DynResource) -> RdResult<()> {
        let group = self.groups.get(r.resource_type()).ok_or_else(|| {
            RdError::not_implemented(r.resource_type())
        })?;
        group.add(r)
    }

    /// The group holding the given resource type.
    pub fn get(&self, rtype: &str) -> Option<&ResourceGroup> {
        self.groups.get(rtype)
    }

    /// Iterate the collection's types and their groups.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &ResourceGroup)> {
        self.groups.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// The hashring of the requested type for the given partition.
    pub fn hashring(
        &self,
        partition_name: &str,
        rtype: &str,
    ) -> Option<Arc<Hashring>> {
        let Some(group) = self.groups.get(rtype) else {
            tracing::warn!(
                "Requested resource type {rtype:?} not present in our \
                 resource collection.",
            );
            return None;
        };
        group.hashring(partition_name)
    }

    /// Update the collection with the resources changed in the given
    /// diff.
    pub fn apply_diff(&self, diff: &ResourceDiff) {
        if diff.full_update {
            for group in self.groups.values() {
                group.clear();
            }
        }

        for (rtype, resources) in diff.new.0.iter() {
            tracing::info!(
                "Adding {} resources of type {}.",
                resources.len(),
                rtype
            );
            for r in resources {
                if let Some(group) = self.groups.get(rtype) {
                    let _ = group.add(r.clone());
                }
            }
        }
        for (rtype, resources) in diff.changed.0.iter() {
            tracing::info!(
                "Changing {} resources of type {}.",
                resources.len(),
                rtype
            );
            for r in resources {
                if let Some(group) = self.groups.get(rtype) {
                    group.add_or_update(r.clone());
                }
            }
        }
        for (rtype, resources) in diff.gone.0.iter() {
            tracing::info!(
                "Removing {} resources of type {}.",
                resources.len(),
                rtype
            );
            for r in resources {
                if let Some(group) = self.groups.get(rtype) {
                    let _ = group.remove(r);
                }
            }
        }
    }

    /// Persist every stored type, logging failures.
    pub fn save(&self) {
        for (rtype, group) in self.groups.iter() {
            if let Err(err) = group.save() {
                tracing::warn!(?err, "Error saving {rtype} to store");
            }
        }
    }
}

impl std::fmt::Display for Collection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut keys: Vec<_> = self.groups.keys().collect();
        keys.sort();
        let mut first = true;
        for key in keys {
            if !first {
                f.write_str(", ")?;
            }
            first = false;
            write!(f, "{} {}", self.groups[key].len(), key)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod test;
