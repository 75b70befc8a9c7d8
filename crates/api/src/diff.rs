//! Resource diff types.
//!
//! The backend informs distributors about its resources through diffs: a
//! diff contains new, changed, and gone resources, and can be applied
//! onto data structures that implement a collection of resources.

use crate::{DynResource, RdResult, Registry, Resource};
use std::collections::HashMap;

/// The event observed when a resource was handed to a collection: the
/// backend informs distributors if a resource is new, has changed, or
/// has disappeared.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceEvent {
    /// The resource was already present and did not change.
    Unchanged,
    /// The resource was not previously present.
    IsNew,
    /// The resource was present with a different object id.
    Changed,
    /// The resource is failing its tests and should no longer be
    /// distributed.
    IsGone,
}

/// Maps a resource type to the respective resources.
#[derive(Debug, Clone, Default)]
pub struct ResourceMap(pub HashMap<String, Vec<DynResource>>);

impl ResourceMap {
    /// An empty resource map.
    pub fn new() -> Self {
        Self::default()
    }

    /// A map holding a single resource under its own type.
    pub fn single(r: DynResource) -> Self {
        let mut map = HashMap::new();
        map.insert(r.resource_type().to_string(), vec![r]);
        Self(map)
    }

    /// Append a resource under its own type.
    pub fn insert(&mut self, r: DynResource) {
        self.0
            .entry(r.resource_type().to_string())
            .or_default()
            .push(r);
    }

    /// The total number of resources across all types.
    pub fn len(&self) -> usize {
        self.0.values().map(Vec::len).sum()
    }

    /// Whether the map holds no resources.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Decode a resource map from its wire form, dispatching each entry
    /// through the given registry.
    pub fn from_value(
        value: &serde_json::Value,
        registry: &Registry,
    ) -> RdResult<Self> {
        let mut out = Self::new();
        if value.is_null() {
            return Ok(out);
        }
        let obj = value.as_object().ok_or_else(|| {
            crate::RdError::bad_request("resource map is not an object")
        })?;
        for resources in obj.values() {
            let list = resources.as_array().ok_or_else(|| {
                crate::RdError::bad_request("resource list is not an array")
            })?;
            for raw in list {
                out.insert(registry.decode(raw)?);
            }
        }
        Ok(out)
    }
}

impl std::fmt::Display for ResourceMap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.0.is_empty() {
            return f.write_str("empty");
        }
        let mut types: Vec<_> = self.0.iter().collect();
        types.sort_by_key(|(rtype, _)| rtype.as_str());
        let mut first = true;
        for (rtype, resources) in types {
            if !first {
                f.write_str(", ")?;
            }
            first = false;
            write!(f, "{}: {}", rtype, resources.len())?;
        }
        Ok(())
    }
}

impl serde::Serialize for ResourceMap {
    fn serialize<S: serde::Serializer>(
        &self,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        use serde::ser::SerializeMap;
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (rtype, resources) in self.0.iter() {
            let values: Vec<serde_json::Value> =
                resources.iter().map(|r| r.to_json()).collect();
            map.serialize_entry(rtype, &values)?;
        }
        map.end()
    }
}

/// A diff that contains new, changed, and gone resources.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct ResourceDiff {
    /// Resources that were not previously present.
    pub new: ResourceMap,
    /// Resources whose object id changed.
    pub changed: ResourceMap,
    /// Resources that disappeared.
    pub gone: ResourceMap,
    /// Indicates that this diff contains the full list of resources on
    /// the `new` field, replacing the receiver's view entirely.
    pub full_update: bool,
}

impl ResourceDiff {
    /// An empty incremental diff.
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode a diff from its wire form.
    pub fn from_value(
        value: &serde_json::Value,
        registry: &Registry,
    ) -> RdResult<Self> {
        Ok(Self {
            new: ResourceMap::from_value(&value["new"], registry)?,
            changed: ResourceMap::from_value(&value["changed"], registry)?,
            gone: ResourceMap::from_value(&value["gone"], registry)?,
            full_update: value["full_update"].as_bool().unwrap_or(false),
        })
    }
}

impl std::fmt::Display for ResourceDiff {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Resource diff: ")?;
        let mut first = true;
        let mut part = |desc: &str,
                        map: &ResourceMap,
                        f: &mut std::fmt::Formatter<'_>|
         -> std::fmt::Result {
            for (rtype, resources) in map.0.iter() {
                if !first {
                    f.write_str(", ")?;
                }
                first = false;
                write!(f, "{} {} {}", resources.len(), desc, rtype)?;
            }
            Ok(())
        };
        part("new", &self.new, f)?;
        part("changed", &self.changed, f)?;
        part("gone", &self.gone, f)
    }
}

/// The state of a distributor's resources, split into the ones that are
/// considered working and the ones that are not.
#[derive(Debug, Clone, Default)]
pub struct ResourceState {
    /// Resources that pass the currently active gates.
    pub working: Vec<DynResource>,
    /// Resources that fail the currently active gates.
    pub not_working: Vec<DynResource>,
}

impl serde::Serialize for ResourceState {
    fn serialize<S: serde::Serializer>(
        &self,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        use serde::ser::SerializeStruct;
        let encode = |resources: &[DynResource]| -> Vec<serde_json::Value> {
            resources.iter().map(|r| r.to_json()).collect()
        };
        let mut s = serializer.serialize_struct("ResourceState", 2)?;
        s.serialize_field("working", &encode(&self.working))?;
        s.serialize_field("not_working", &encode(&self.not_working))?;
        s.end()
    }
}

/// A request for resources. Distributors use this to subscribe to the
/// backend's resource stream.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ResourceRequest {
    /// Name of the requesting distributor.
    pub request_origin: String,
    /// The resource types the distributor is interested in.
    pub resource_types: Vec<String>,
}

impl ResourceRequest {
    /// Whether the request contains the given resource type.
    pub fn has_resource_type(&self, rtype: &str) -> bool {
        self.resource_types.iter().any(|t| t == rtype)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::dummy::Dummy;
    use std::sync::Arc;

    #[test]
    fn resource_map_display() {
        let mut map = ResourceMap::new();
        assert_eq!("empty", map.to_string());
        map.insert(Arc::new(Dummy::new(1, 1)));
        map.insert(Arc::new(Dummy::new(2, 2)));
        assert_eq!("dummy: 2", map.to_string());
    }

    #[test]
    fn diff_display() {
        let mut diff = ResourceDiff::new();
        diff.new.insert(Arc::new(Dummy::new(1, 1)));
        diff.gone.insert(Arc::new(Dummy::new(2, 2)));
        assert_eq!(
            "Resource diff: 1 new dummy, 1 gone dummy",
            diff.to_string(),
        );
    }

    #[test]
    fn diff_wire_round_trip() {
        let mut diff = ResourceDiff::new();
        diff.new.insert(Arc::new(Dummy::new(1, 1)));
        diff.changed.insert(Arc::new(Dummy::new(9, 2)));
        diff.full_update = true;

        let value = serde_json::to_value(&diff).unwrap();
        let back =
            ResourceDiff::from_value(&value, &Dummy::registry()).unwrap();
        assert!(back.full_update);
        assert_eq!(1, back.new.len());
        assert_eq!(1, back.changed.len());
        assert!(back.gone.is_empty());
        assert_eq!(
            crate::Hashkey(9),
            back.changed.0["dummy"][0].oid(),
        );
    }

    #[test]
    fn request_resource_types() {
        let req = ResourceRequest {
            request_origin: "https".into(),
            resource_types: vec!["obfs4".into(), "vanilla".into()],
        };
        assert!(req.has_resource_type("obfs4"));
        assert!(!req.has_resource_type("snowflake"));
    }
}
