//! A simple [Resource] implementation used in unit tests across the
//! workspace.

use crate::*;
use std::sync::{Arc, RwLock};
use std::time::Duration;

/// A minimal resource with directly settable ids, relations, declared
/// distributor, and expiry.
#[derive(Debug)]
pub struct Dummy {
    /// The object id returned by [Resource::oid].
    pub object_id: Hashkey,
    /// The unique id returned by [Resource::uid].
    pub unique_id: Hashkey,
    /// The expiry returned by [Resource::expiry].
    pub expiry_time: Duration,
    /// The declared distributor, empty for none.
    pub distribution: String,
    /// The relation identifiers.
    pub relation_ids: Vec<String>,
    base: ResourceBase,
}

impl Dummy {
    /// Construct a new dummy resource with the given ids. The dummy is
    /// born functional and accepted, with a one hour expiry.
    pub fn new(oid: u64, uid: u64) -> Self {
        Self {
            object_id: Hashkey(oid),
            unique_id: Hashkey(uid),
            expiry_time: Duration::from_secs(60 * 60),
            distribution: String::new(),
            relation_ids: Vec::new(),
            base: ResourceBase::with_test(
                "dummy",
                ResourceTest {
                    state: TestState::Functional,
                    speed: SpeedState::Accepted,
                    ..Default::default()
                },
            ),
        }
    }

    /// Replace the dummy's test result.
    pub fn set_test(&self, test: ResourceTest) {
        *self.base.test_state().write().unwrap() = test;
    }

    /// Decode a dummy from the wire form produced by
    /// [Resource::to_json], for use with a test [Registry].
    pub fn decode(value: &serde_json::Value) -> RdResult<DynResource> {
        let mut d = Dummy::new(
            value["oid"].as_u64().unwrap_or(0),
            value["uid"].as_u64().unwrap_or(0),
        );
        d.distribution =
            value["distribution"].as_str().unwrap_or("").to_string();
        if let Some(ids) = value["relation_ids"].as_array() {
            d.relation_ids = ids
                .iter()
                .filter_map(|v| v.as_str().map(String::from))
                .collect();
        }
        Ok(Arc::new(d))
    }

    /// A registry with only the dummy type registered, for unit tests.
    pub fn registry() -> Registry {
        let mut registry = Registry::new();
        registry.register(
            "dummy",
            TypeInfo {
                decode: Dummy::decode,
                needs_store: true,
                address_dummy: false,
            },
        );
        registry
    }
}

impl Resource for Dummy {
    fn resource_type(&self) -> &str {
        self.base.rtype()
    }

    fn string_form(&self) -> String {
        format!("dummy-{}-{}", self.unique_id, self.object_id)
    }

    fn is_valid(&self) -> bool {
        true
    }

    fn uid(&self) -> Hashkey {
        self.unique_id
    }

    fn oid(&self) -> Hashkey {
        self.object_id
    }

    fn relation_identifiers(&self) -> Vec<String> {
        self.relation_ids.clone()
    }

    fn distributor(&self) -> Option<String> {
        if self.distribution.is_empty() {
            None
        } else {
            Some(self.distribution.clone())
        }
    }

    fn expiry(&self) -> Duration {
        self.expiry_time
    }

    fn test_state(&self) -> &RwLock<ResourceTest> {
        self.base.test_state()
    }

    fn blocked_in(&self) -> LocationSet {
        self.base.blocked_in()
    }

    fn set_blocked_in(&self, locations: &LocationSet) {
        self.base.set_blocked_in(locations);
    }

    fn test_func(&self) -> Option<TestFunc> {
        self.base.test_func()
    }

    fn set_test_func(&self, f: TestFunc) {
        self.base.set_test_func(f);
    }

    fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "type": self.resource_type(),
            "oid": self.object_id,
            "uid": self.unique_id,
            "distribution": self.distribution,
            "relation_ids": self.relation_ids,
        })
    }
}
