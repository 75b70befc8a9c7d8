//! Resource-related types.

use crate::Timestamp;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, RwLock};

/// The CRC-64 flavour used for hashkeys. This is the same polynomial and
/// bit order that persisted hashkeys were computed with, so it must not
/// change: doing so would silently re-partition every known bridge.
const HASHKEY_CRC: crc::Crc<u64> = crc::Crc::<u64>::new(&crc::CRC_64_XZ);

/// A hashkey is an index in a hashring.
///
/// Unique ids and object ids are both hashkeys, derived from a canonical
/// identity string of the resource.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Default,
    serde::Serialize,
    serde::Deserialize,
)]
#[serde(transparent)]
pub struct Hashkey(pub u64);

impl Hashkey {
    /// Calculate the hashkey of the given identity string.
    pub fn new(id: &str) -> Self {
        Self(HASHKEY_CRC.checksum(id.as_bytes()))
    }
}

impl std::fmt::Display for Hashkey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The reachability states a resource can be in. Before the backend had
/// a chance to ask the reachability prober about a resource, it is
/// untested. Afterwards, it is either functional or dysfunctional.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Default,
    serde::Serialize,
    serde::Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum TestState {
    /// No reachability result yet.
    #[default]
    Untested,
    /// The prober reached the resource.
    Functional,
    /// The prober could not reach the resource.
    Dysfunctional,
}

impl std::fmt::Display for TestState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            TestState::Untested => "untested",
            TestState::Functional => "functional",
            TestState::Dysfunctional => "dysfunctional",
        })
    }
}

/// A crude representation of the bandwidth a resource offers: whether or
/// not its measured ratio meets the configured threshold, without
/// requiring the threshold as context.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Default,
    serde::Serialize,
    serde::Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum SpeedState {
    /// No bandwidth result yet.
    #[default]
    Untested,
    /// The measured ratio meets the threshold.
    Accepted,
    /// The measured ratio falls below the threshold.
    Rejected,
}

impl std::fmt::Display for SpeedState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            SpeedState::Untested => "untested",
            SpeedState::Accepted => "accepted",
            SpeedState::Rejected => "rejected",
        })
    }
}

/// The result of testing a resource, combining the reachability and the
/// bandwidth dimension.
///
/// Only `last_passed` crosses the wire; the remaining fields are backend
/// internal state.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResourceTest {
    /// Reachability state.
    pub state: TestState,
    /// Bandwidth state.
    pub speed: SpeedState,
    /// The measured bandwidth ratio, if any.
    pub ratio: Option<f64>,
    /// When the resource was last tested.
    pub last_tested: Option<Timestamp>,
    /// When the resource last passed both tests.
    pub last_passed: Option<Timestamp>,
    /// The error reported by the last test, empty if none.
    pub error: String,
}

/// The physical and topological location of a resource or requester.
#[derive(
    Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize,
)]
pub struct Location {
    /// ISO 3166-1 alpha-2 country code, e.g. "AR".
    pub country_code: String,
    /// Autonomous system number, e.g. 1234.
    pub asn: u32,
}

impl std::fmt::Display for Location {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.asn == 0 {
            write!(f, "{}", self.country_code)
        } else {
            write!(f, "{} ({})", self.country_code, self.asn)
        }
    }
}

/// A set of location identifiers, e.g. country codes.
///
/// On the wire this is a mapping of location to `true`, matching the
/// format the rest of the bridge pipeline expects.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LocationSet(BTreeSet<String>);

impl LocationSet {
    /// An empty location set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a location to the set.
    pub fn insert(&mut self, location: impl Into<String>) {
        self.0.insert(location.into());
    }

    /// Remove a location from the set.
    pub fn remove(&mut self, location: &str) {
        self.0.remove(location);
    }

    /// Whether the set contains the given location.
    pub fn contains(&self, location: &str) -> bool {
        self.0.contains(location)
    }

    /// Whether the set is empty.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterate the locations in the set.
    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }

    /// Merge every location of `other` into this set.
    pub fn extend_from(&mut self, other: &LocationSet) {
        for location in other.iter() {
            self.0.insert(location.to_string());
        }
    }
}

impl std::fmt::Display for LocationSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut first = true;
        for location in self.iter() {
            if !first {
                f.write_str(", ")?;
            }
            first = false;
            f.write_str(location)?;
        }
        Ok(())
    }
}

impl<S: Into<String>> FromIterator<S> for LocationSet {
    fn from_iter<T: IntoIterator<Item = S>>(iter: T) -> Self {
        Self(iter.into_iter().map(Into::into).collect())
    }
}

impl serde::Serialize for LocationSet {
    fn serialize<S: serde::Serializer>(
        &self,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        use serde::ser::SerializeMap;
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for location in self.0.iter() {
            map.serialize_entry(location, &true)?;
        }
        map.end()
    }
}

impl<'de> serde::Deserialize<'de> for LocationSet {
    fn deserialize<D: serde::Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Self, D::Error> {
        let map: BTreeMap<String, bool> =
            serde::Deserialize::deserialize(deserializer)?;
        Ok(Self(
            map.into_iter()
                .filter_map(|(k, v)| v.then_some(k))
                .collect(),
        ))
    }
}

/// A function that schedules a test for the given resource. The hashring
/// invokes it when a new or changed resource enters; the usual
/// implementation submits the resource to the process-wide test pool.
pub type TestFunc = Arc<dyn Fn(DynResource) + Send + Sync>;

/// Specifies the resources that rdsys hands out to users. This could be
/// a vanilla Tor bridge, an obfs4 bridge, or a Tor Browser download
/// link.
pub trait Resource: 'static + Send + Sync + std::fmt::Debug {
    /// The resource's type name, e.g. "obfs4". This is the discriminant
    /// the JSON codec and the collection route on.
    fn resource_type(&self) -> &str;

    /// The resource's canonical string form, e.g. a bridge line. The
    /// test pool deduplicates in-flight tests by this string.
    fn string_form(&self) -> String;

    /// Whether this resource is complete enough to hand out.
    fn is_valid(&self) -> bool;

    /// The resource's unique identifier. Bridges with different
    /// fingerprints have different unique identifiers; a bridge keeps
    /// its unique id when only its address changes.
    fn uid(&self) -> Hashkey;

    /// The resource's object identifier. Bridges with the *same*
    /// fingerprint but different, say, IP addresses have different
    /// object identifiers. If two resources have the same oid, they
    /// must have the same uid but not vice versa.
    fn oid(&self) -> Hashkey;

    /// Identifiers that represent a relation between resources, for
    /// example the fingerprint: two resources with the same fingerprint
    /// are related to each other and must be co-located in the same
    /// partition.
    fn relation_identifiers(&self) -> Vec<String>;

    /// The distributor the resource's operator requested, if any.
    fn distributor(&self) -> Option<String>;

    /// The duration after which the resource should be deleted from the
    /// backend if it has not received an update.
    fn expiry(&self) -> std::time::Duration;

    /// Shared handle to the resource's test result.
    fn test_state(&self) -> &RwLock<ResourceTest>;

    /// A snapshot of the resource's current test result.
    fn test_result(&self) -> ResourceTest {
        self.test_state().read().unwrap().clone()
    }

    /// The set of locations that block the resource.
    fn blocked_in(&self) -> LocationSet;

    /// Merge the given locations into the resource's blocked set.
    fn set_blocked_in(&self, locations: &LocationSet);

    /// The test scheduling function attached to this resource, if any.
    fn test_func(&self) -> Option<TestFunc>;

    /// Attach a test scheduling function to this resource.
    fn set_test_func(&self, f: TestFunc);

    /// The bridge fingerprint backing this resource, if it has one.
    fn fingerprint(&self) -> Option<String> {
        None
    }

    /// The resource's wire representation.
    fn to_json(&self) -> serde_json::Value;
}

/// Trait-object [Resource].
pub type DynResource = Arc<dyn Resource>;

/// Run the resource's attached test function, if any.
pub fn submit_test(r: &DynResource) {
    if let Some(f) = r.test_func() {
        f(r.clone());
    }
}

/// Plumbing that is shared across all of our resource variants: the type
/// discriminant plus the mutable parts of a resource (test result,
/// blocked locations, test scheduling function), each behind its own
/// lock so a resource can be mutated in place while it sits in a
/// hashring.
pub struct ResourceBase {
    rtype: String,
    blocked_in: RwLock<LocationSet>,
    test: RwLock<ResourceTest>,
    test_func: Mutex<Option<TestFunc>>,
}

impl std::fmt::Debug for ResourceBase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceBase")
            .field("rtype", &self.rtype)
            .field("blocked_in", &self.blocked_in)
            .field("test", &self.test)
            .finish()
    }
}

impl ResourceBase {
    /// Construct a new untested base of the given type.
    pub fn new(rtype: impl Into<String>) -> Self {
        Self::with_test(rtype, ResourceTest::default())
    }

    /// Construct a new base of the given type with an initial test
    /// result.
    pub fn with_test(rtype: impl Into<String>, test: ResourceTest) -> Self {
        Self {
            rtype: rtype.into(),
            blocked_in: RwLock::new(LocationSet::new()),
            test: RwLock::new(test),
            test_func: Mutex::new(None),
        }
    }

    /// The type discriminant.
    pub fn rtype(&self) -> &str {
        &self.rtype
    }

    /// Change the type discriminant.
    pub fn set_rtype(&mut self, rtype: impl Into<String>) {
        self.rtype = rtype.into();
    }

    /// Shared handle to the test result.
    pub fn test_state(&self) -> &RwLock<ResourceTest> {
        &self.test
    }

    /// A snapshot of the blocked locations.
    pub fn blocked_in(&self) -> LocationSet {
        self.blocked_in.read().unwrap().clone()
    }

    /// Merge the given locations into the blocked set.
    pub fn set_blocked_in(&self, locations: &LocationSet) {
        self.blocked_in.write().unwrap().extend_from(locations);
    }

    /// The attached test scheduling function, if any.
    pub fn test_func(&self) -> Option<TestFunc> {
        self.test_func.lock().unwrap().clone()
    }

    /// Attach a test scheduling function.
    pub fn set_test_func(&self, f: TestFunc) {
        *self.test_func.lock().unwrap() = Some(f);
    }
}
