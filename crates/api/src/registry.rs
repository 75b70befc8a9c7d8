//! The resource type registry.
//!
//! New resource variants plug into the backend by registering a decode
//! constructor keyed by their type name. The registry decouples the
//! collection and the JSON codec from the concrete variants.

use crate::{DynResource, RdError, RdResult, Resource};
use std::collections::HashMap;

/// Everything the backend needs to know about one resource type.
#[derive(Clone)]
pub struct TypeInfo {
    /// Decode a resource of this type from its wire form.
    pub decode: fn(&serde_json::Value) -> RdResult<DynResource>,

    /// Whether resources of this type should be persisted across
    /// restarts.
    pub needs_store: bool,

    /// Whether this type carries a placeholder address that must be
    /// exempt from address validation (e.g. snowflake).
    pub address_dummy: bool,
}

impl std::fmt::Debug for TypeInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TypeInfo")
            .field("needs_store", &self.needs_store)
            .field("address_dummy", &self.address_dummy)
            .finish()
    }
}

/// Maps resource type names to their [TypeInfo].
#[derive(Debug, Clone, Default)]
pub struct Registry {
    types: HashMap<String, TypeInfo>,
}

impl Registry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a resource type.
    pub fn register(&mut self, rtype: impl Into<String>, info: TypeInfo) {
        self.types.insert(rtype.into(), info);
    }

    /// Look up a resource type.
    pub fn get(&self, rtype: &str) -> Option<&TypeInfo> {
        self.types.get(rtype)
    }

    /// Whether the given resource type is registered.
    pub fn contains(&self, rtype: &str) -> bool {
        self.types.contains_key(rtype)
    }

    /// Iterate the registered type names.
    pub fn type_names(&self) -> impl Iterator<Item = &str> {
        self.types.keys().map(String::as_str)
    }

    /// Decode a resource from its wire form, dispatching on the value's
    /// `type` field. The decoded resource must satisfy
    /// [is_valid](crate::Resource::is_valid).
    pub fn decode(&self, value: &serde_json::Value) -> RdResult<DynResource> {
        let rtype = value["type"].as_str().unwrap_or("");
        if rtype.is_empty() {
            return Err(RdError::bad_request("missing \"type\" field"));
        }
        let info = self
            .types
            .get(rtype)
            .ok_or_else(|| RdError::not_implemented(rtype))?;
        let resource = (info.decode)(value)?;
        if !resource.is_valid() {
            return Err(RdError::bad_request(format!(
                "resource {rtype:?} is not valid"
            )));
        }
        Ok(resource)
    }

    /// Decode a list of resources from a wire-form JSON array.
    pub fn decode_list(
        &self,
        value: &serde_json::Value,
    ) -> RdResult<Vec<DynResource>> {
        let list = value.as_array().ok_or_else(|| {
            RdError::bad_request("expected a JSON array of resources")
        })?;
        list.iter().map(|raw| self.decode(raw)).collect()
    }
}
