//! The resource hashring.

use crate::JsonStore;
use rdsys_api::{
    submit_test, DynResource, Hashkey, RdError, RdResult, Registry,
    Resource, ResourceDiff, ResourceEvent, SpeedState, TestState, Timestamp,
};
use std::sync::RwLock;

/// A node in a hashring.
#[derive(Debug)]
struct Hashnode {
    hashkey: Hashkey,
    elem: DynResource,
    last_update: Timestamp,
}

impl Hashnode {
    fn new(hashkey: Hashkey, elem: DynResource) -> Self {
        Self {
            hashkey,
            elem,
            last_update: Timestamp::now(),
        }
    }
}

#[derive(Debug, Default)]
struct Inner {
    nodes: Vec<Hashnode>,
    store: Option<JsonStore>,
}

/// A hashring of resources: an ordered sequence of nodes sorted
/// ascending by hashkey, with the resource's unique id as the hashkey.
///
/// A single reader-writer lock protects the sorted sequence and the
/// persistence handle. Mutations take the writer lock; readers take the
/// reader lock.
#[derive(Debug, Default)]
pub struct Hashring {
    inner: RwLock<Inner>,
}

impl Hashring {
    /// Construct a new, empty hashring.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add the given resource to the hashring. If the resource is
    /// already present, we refresh its timestamp and return
    /// [RdError::AlreadyPresent] without overwriting.
    pub fn add(&self, r: DynResource) -> RdResult<()> {
        let mut inner = self.inner.write().unwrap();
        if let Ok((i, true)) = inner.get_index(r.uid()) {
            inner.nodes[i].last_update = Timestamp::now();
            return Err(RdError::AlreadyPresent);
        }
        inner.maybe_test_resource(&r);
        inner.insert_sorted(r);
        Ok(())
    }

    /// Attempt to add the given resource to the hashring. If it already
    /// is in the hashring, we update it if (and only if) its object id
    /// changed.
    pub fn add_or_update(&self, r: DynResource) -> ResourceEvent {
        let mut inner = self.inner.write().unwrap();
        inner.maybe_test_resource(&r);
        match inner.get_index(r.uid()) {
            Ok((i, true)) => {
                inner.nodes[i].last_update = Timestamp::now();
                let mut event = ResourceEvent::Unchanged;
                if inner.nodes[i].elem.oid() != r.oid() {
                    inner.nodes[i].elem = r;
                    event = ResourceEvent::Changed;
                }
                let test = inner.nodes[i].elem.test_result();
                if test.state == TestState::Dysfunctional
                    || test.speed == SpeedState::Rejected
                {
                    // The resource is failing tests, mark it as gone.
                    event = ResourceEvent::IsGone;
                } else if test.state == TestState::Functional
                    && test.speed == SpeedState::Accepted
                {
                    inner.nodes[i]
                        .elem
                        .test_state()
                        .write()
                        .unwrap()
                        .last_passed = Some(Timestamp::now());
                }
                event
            }
            _ => {
                inner.insert_sorted(r);
                ResourceEvent::IsNew
            }
        }
    }

    /// Remove the given resource from the hashring, identified by its
    /// unique id.
    pub fn remove(&self, r: &DynResource) -> RdResult<()> {
        let mut inner = self.inner.write().unwrap();
        let (i, found) = inner.get_index(r.uid())?;
        if !found {
            return Err(RdError::NotFound);
        }
        inner.nodes.remove(i);
        Ok(())
    }

    /// Retrieve the element identified by the given hashkey. If there is
    /// no exact match, we return the element whose hashkey is the next
    /// one in ascending direction, wrapping around at the end of the
    /// ring. Fails only on an empty ring.
    pub fn get(&self, k: Hashkey) -> RdResult<DynResource> {
        let inner = self.inner.read().unwrap();
        let (i, _) = inner.get_index(k)?;
        Ok(inner.nodes[i].elem.clone())
    }

    /// Retrieve the element identified by the given hashkey, exact
    /// matches only.
    pub fn get_exact(&self, k: Hashkey) -> RdResult<DynResource> {
        let inner = self.inner.read().unwrap();
        let (i, found) = inner.get_index(k)?;
        if !found {
            return Err(RdError::NotFound);
        }
        Ok(inner.nodes[i].elem.clone())
    }

    /// Like [get](Self::get), but returns up to `num` elements, walking
    /// the ring in ascending order from the given hashkey and wrapping
    /// around at the end. If `num` exceeds the ring size, every element
    /// is returned.
    pub fn get_many(
        &self,
        k: Hashkey,
        num: usize,
    ) -> RdResult<Vec<DynResource>> {
        let inner = self.inner.read().unwrap();
        let len = inner.nodes.len();
        let (start, _) = inner.get_index(k)?;
        let num = num.min(len);
        Ok((start..start + num)
            .map(|j| inner.nodes[j % len].elem.clone())
            .collect())
    }

    /// Like [get_many](Self::get_many), but skips elements the filter
    /// rejects. May walk through more than `num` positions, bounded by
    /// one full traversal of the ring.
    pub fn get_many_filtered<F>(
        &self,
        k: Hashkey,
        f: F,
        num: usize,
    ) -> RdResult<Vec<DynResource>>
    where
        F: Fn(&DynResource) -> bool,
    {
        let inner = self.inner.read().unwrap();
        let len = inner.nodes.len();
        let (start, _) = inner.get_index(k)?;
        let num = num.min(len);

        let mut resources = Vec::new();
        let mut skipped = 0;
        let mut j = start;
        while j < start + num + skipped && skipped < len {
            let item = &inner.nodes[j % len].elem;
            if f(item) {
                resources.push(item.clone());
            } else {
                skipped += 1;
            }
            j += 1;
        }
        Ok(resources)
    }

    /// A snapshot of all of the hashring's resources, in ring order.
    pub fn get_all(&self) -> Vec<DynResource> {
        let inner = self.inner.read().unwrap();
        inner.nodes.iter().map(|n| n.elem.clone()).collect()
    }

    /// The resources that pass the given filter, in ring order.
    pub fn filter<F>(&self, f: F) -> Vec<DynResource>
    where
        F: Fn(&DynResource) -> bool,
    {
        let inner = self.inner.read().unwrap();
        inner
            .nodes
            .iter()
            .filter(|n| f(&n.elem))
            .map(|n| n.elem.clone())
            .collect()
    }

    /// Remove and return every resource whose last update lies further
    /// in the past than its declared expiry.
    pub fn prune(&self) -> Vec<DynResource> {
        let mut inner = self.inner.write().unwrap();
        let now = Timestamp::now();
        let mut pruned = Vec::new();
        inner.nodes.retain(|node| {
            if now.saturating_since(node.last_update) > node.elem.expiry() {
                pruned.push(node.elem.clone());
                false
            } else {
                true
            }
        });
        pruned
    }

    /// The number of resources in the hashring.
    pub fn len(&self) -> usize {
        self.inner.read().unwrap().nodes.len()
    }

    /// Whether the hashring holds no resources.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove every resource from the hashring.
    pub fn clear(&self) {
        self.inner.write().unwrap().nodes.clear();
    }

    /// Apply the given diff to the hashring. New resources are added,
    /// changed resources are updated, and gone resources are removed. A
    /// full update replaces the ring's content with the diff's `new`
    /// resources.
    pub fn apply_diff(&self, d: &ResourceDiff) {
        if d.full_update {
            let fresh = Hashring::new();
            fresh.apply_maps(d);
            let nodes = fresh.inner.into_inner().unwrap().nodes;
            self.inner.write().unwrap().nodes = nodes;
        } else {
            self.apply_maps(d);
        }
    }

    fn apply_maps(&self, d: &ResourceDiff) {
        for (rtype, resources) in d.new.0.iter() {
            tracing::info!(
                "Adding {} resources of type {}.",
                resources.len(),
                rtype
            );
            for r in resources {
                let _ = self.add(r.clone());
            }
        }
        for (rtype, resources) in d.changed.0.iter() {
            tracing::info!(
                "Changing {} resources of type {}.",
                resources.len(),
                rtype
            );
            for r in resources {
                self.add_or_update(r.clone());
            }
        }
        for (rtype, resources) in d.gone.0.iter() {
            tracing::info!(
                "Removing {} resources of type {}.",
                resources.len(),
                rtype
            );
            for r in resources {
                let _ = self.remove(r);
            }
        }
    }

    /// Load previously persisted resources through the normal add path
    /// and remember the store handle for future saves.
    pub(crate) fn init_store(&self, store: JsonStore, registry: &Registry) {
        match store.load() {
            Ok(value) => {
                for raw in value.as_array().into_iter().flatten() {
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
            Err(err) => {
                tracing::info!(?err, "Error loading data from hashring store")
            }
        }
        self.inner.write().unwrap().store = Some(store);
    }

    /// Persist the hashring's resources, if a store is attached.
    pub fn save(&self) -> RdResult<()> {
        let inner = self.inner.read().unwrap();
        let Some(store) = inner.store.as_ref() else {
            return Ok(());
        };
        let resources: Vec<serde_json::Value> =
            inner.nodes.iter().map(|n| n.elem.to_json()).collect();
        store.save(&serde_json::Value::Array(resources))
    }

    #[cfg(test)]
    pub(crate) fn backdate(&self, k: Hashkey, age: std::time::Duration) {
        let mut inner = self.inner.write().unwrap();
        if let Ok((i, true)) = inner.get_index(k) {
            inner.nodes[i].last_update = Timestamp::now() - age;
        }
    }
}

impl Inner {
    /// The index of the given hashkey. On an exact match, returns the
    /// index and `true`. Otherwise returns the index of the smallest
    /// hashkey greater than `k`, wrapping to index 0 if there is none,
    /// and `false`. Fails if the ring is empty.
    fn get_index(&self, k: Hashkey) -> RdResult<(usize, bool)> {
        if self.nodes.is_empty() {
            return Err(RdError::Empty);
        }
        match self.nodes.binary_search_by(|n| n.hashkey.cmp(&k)) {
            Ok(i) => Ok((i, true)),
            Err(i) if i >= self.nodes.len() => Ok((0, false)),
            Err(i) => Ok((i, false)),
        }
    }

    fn insert_sorted(&mut self, r: DynResource) {
        let uid = r.uid();
        let pos = self.nodes.partition_point(|n| n.hashkey < uid);
        self.nodes.insert(pos, Hashnode::new(uid, r));
    }

    /// May schedule a test for the given resource. The resource is *not*
    /// tested if an entry with the same unique id *and* object id is
    /// already functional and accepted, and was tested within the
    /// resource's expiry.
    fn maybe_test_resource(&self, r: &DynResource) {
        if let Ok((i, true)) = self.get_index(r.uid()) {
            let old = &self.nodes[i].elem;
            if old.oid() == r.oid() {
                let test = old.test_result();
                if test.state != TestState::Untested
                    && test.speed != SpeedState::Untested
                {
                    if let Some(last_tested) = test.last_tested {
                        if last_tested.elapsed() < old.expiry()
                            && test.state == TestState::Functional
                            && test.speed == SpeedState::Accepted
                        {
                            return;
                        }
                    }
                }
                submit_test(old);
                return;
            }
        }
        submit_test(r);
    }
}
