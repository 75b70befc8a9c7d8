//! The backend's resource collection with subscriber fan-out.

use crate::Collection;
use rdsys_api::{
    DynResource, Resource, ResourceDiff, ResourceEvent, ResourceMap,
    ResourceRequest, ResourceState, SpeedState, TestState,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use tokio::sync::mpsc;

/// The recipient of resource events, i.e. a distributor; or rather,
/// what we need to send updates to said distributor.
#[derive(Debug)]
pub struct EventRecipient {
    /// The request the distributor subscribed with. The first
    /// registration for a distributor wins.
    pub request: ResourceRequest,
    /// The channels updates are fanned out to.
    pub event_chans: Vec<mpsc::Sender<ResourceDiff>>,
}

/// A collection of resources for our backend: the typed [Collection]
/// plus the per-distributor subscriber registry and the gating flags
/// that decide which resources count as working.
///
/// The subscriber registry has its own lock, distinct from the
/// per-hashring locks inside the collection. Diffs are built after ring
/// operations complete, so fan-out never happens under a ring lock.
#[derive(Debug)]
pub struct BackendResources {
    collection: Collection,

    /// Only functional resources will be provided to distributors.
    only_functional: AtomicBool,

    /// Use the bandwidth ratio to decide which bridges to distribute.
    use_bandwidth_ratio: AtomicBool,

    /// Maps a distributor name (e.g. "moat") to its event recipient.
    recipients: Mutex<HashMap<String, EventRecipient>>,

    /// Diffs dropped because a subscriber channel was full.
    dropped_diffs: AtomicU64,
}

impl BackendResources {
    /// Wrap the given collection.
    pub fn new(collection: Collection) -> Self {
        Self {
            collection,
            only_functional: AtomicBool::new(false),
            use_bandwidth_ratio: AtomicBool::new(false),
            recipients: Mutex::new(HashMap::new()),
            dropped_diffs: AtomicU64::new(0),
        }
    }

    /// The underlying collection.
    pub fn collection(&self) -> &Collection {
        &self.collection
    }

    /// Add the given resource to the resource collection. If the
    /// resource already exists but has changed (i.e. its unique id
    /// remains the same but its object id changed), the existing
    /// resource is updated in place. Any observed state change is
    /// fanned out to the subscribers of the partition that owns the
    /// resource.
    pub fn add(&self, r: DynResource) {
        let Some(group) = self.collection.get(r.resource_type()) else {
            return;
        };
        let event = group.add_or_update(r.clone());
        if event != ResourceEvent::Unchanged {
            self.propagate_update(&r, event);
        }
    }

    /// Remove expired resources of the given type, emitting a gone diff
    /// for each.
    pub fn prune(&self, rtype: &str) -> Vec<DynResource> {
        let Some(group) = self.collection.get(rtype) else {
            return Vec::new();
        };
        let pruned = group.prune();
        for resource in &pruned {
            self.propagate_update(resource, ResourceEvent::IsGone);
        }
        pruned
    }

    /// Register a channel to be informed about resource updates.
    pub fn register_chan(
        &self,
        req: &ResourceRequest,
        recipient: mpsc::Sender<ResourceDiff>,
    ) {
        let mut recipients = self.recipients.lock().unwrap();
        let dist_name = req.request_origin.clone();
        tracing::info!(
            "Registered new channel for distributor {dist_name:?} to \
             receive updates.",
        );
        match recipients.entry(dist_name) {
            std::collections::hash_map::Entry::Occupied(mut e) => {
                e.get_mut().event_chans.push(recipient);
            }
            std::collections::hash_map::Entry::Vacant(e) => {
                e.insert(EventRecipient {
                    request: req.clone(),
                    event_chans: vec![recipient],
                });
            }
        }
    }

    /// Unregister a channel from resource updates.
    pub fn unregister_chan(
        &self,
        dist_name: &str,
        recipient: &mpsc::Sender<ResourceDiff>,
    ) {
        let mut recipients = self.recipients.lock().unwrap();
        if let Some(r) = recipients.get_mut(dist_name) {
            let before = r.event_chans.len();
            r.event_chans.retain(|c| !c.same_channel(recipient));
            if r.event_chans.len() < before {
                tracing::info!("Unregistering channel from recipients.");
            }
        }
    }

    /// The state of the given distributor's resources of the given
    /// type, classified by the currently active gates: with
    /// `only_functional` set, only functional resources are working;
    /// with `use_bandwidth_ratio` set, rejected-speed resources are
    /// not.
    pub fn get(&self, dist_name: &str, rtype: &str) -> ResourceState {
        let Some(hashring) = self.collection.hashring(dist_name, rtype)
        else {
            tracing::warn!(
                "Failed to get resources for distributor {dist_name:?}",
            );
            return ResourceState::default();
        };

        let only_functional = self.only_functional.load(Ordering::Relaxed);
        let use_bandwidth_ratio =
            self.use_bandwidth_ratio.load(Ordering::Relaxed);

        let mut state = ResourceState::default();
        for resource in hashring.get_all() {
            let test = resource.test_result();
            if (!only_functional || test.state == TestState::Functional)
                && (!use_bandwidth_ratio
                    || test.speed != SpeedState::Rejected)
            {
                state.working.push(resource);
            } else {
                state.not_working.push(resource);
            }
        }
        state
    }

    /// Replace the gating flags. Recomputed each ingest cycle from the
    /// fraction of functional and accepted resources.
    pub fn set_gates(&self, only_functional: bool, use_bandwidth_ratio: bool) {
        self.only_functional
            .store(only_functional, Ordering::Relaxed);
        self.use_bandwidth_ratio
            .store(use_bandwidth_ratio, Ordering::Relaxed);
    }

    /// The currently active gating flags, as
    /// `(only_functional, use_bandwidth_ratio)`.
    pub fn gates(&self) -> (bool, bool) {
        (
            self.only_functional.load(Ordering::Relaxed),
            self.use_bandwidth_ratio.load(Ordering::Relaxed),
        )
    }

    /// The number of diffs dropped on backed-up subscriber channels so
    /// far.
    pub fn dropped_diffs(&self) -> u64 {
        self.dropped_diffs.load(Ordering::Relaxed)
    }

    /// Send updates about new, changed, and gone resources to the
    /// subscriber channels of the distributor whose partition owns the
    /// resource.
    fn propagate_update(&self, r: &DynResource, event: ResourceEvent) {
        let Some(group) = self.collection.get(r.resource_type()) else {
            return;
        };

        let mut diff = ResourceDiff::new();
        let rm = ResourceMap::single(r.clone());
        match event {
            ResourceEvent::IsNew => diff.new = rm,
            ResourceEvent::Changed => diff.changed = rm,
            ResourceEvent::IsGone => diff.gone = rm,
            ResourceEvent::Unchanged => return,
        }

        let dist_name = group.partition_name(r);
        let recipients = self.recipients.lock().unwrap();
        let Some(recipient) = recipients.get(&dist_name) else {
            // No recipients for that resource.
            return;
        };
        if !recipient.request.has_resource_type(r.resource_type()) {
            return;
        }

        for chan in &recipient.event_chans {
            match chan.try_send(diff.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    // A non-consuming distributor; the diff is dropped
                    // rather than stalling ingest.
                    self.dropped_diffs.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(
                        "Dropping diff for lagging subscriber of \
                         {dist_name:?}.",
                    );
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {}
            }
        }
    }
}

#[cfg(test)]
mod test;
