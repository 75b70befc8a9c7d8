//! Vanilla Tor bridges and the pieces shared by all bridge flavours.

use rdsys_api::{
    DynResource, Hashkey, Location, LocationSet, RdError, RdResult, Resource,
    ResourceBase, ResourceTest, TestFunc, Timestamp,
};
use std::collections::BTreeMap;
use std::net::IpAddr;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use crate::TYPE_VANILLA;

/// As of today all of our bridges and pluggable transports run over
/// TCP.
pub const PROTO_TCP: &str = "tcp";

/// The duration after which a bridge is deleted from the backend if the
/// bridge authority stopped reporting it.
pub const BRIDGE_EXPIRY: Duration = Duration::from_secs(3 * 60 * 60);

/// The flags the bridge authority assigned to a bridge.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    serde::Serialize,
    serde::Deserialize,
)]
pub struct Flags {
    /// The bridge is suitable for high-bandwidth circuits.
    #[serde(default)]
    pub fast: bool,
    /// The bridge is suitable for long-lived circuits.
    #[serde(default)]
    pub stable: bool,
    /// The bridge was reachable at the last consensus.
    #[serde(default)]
    pub running: bool,
    /// The bridge is considered valid by the authority.
    #[serde(default)]
    pub valid: bool,
}

/// One onion-routing address of a bridge.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct OrAddress {
    /// 4 or 6.
    #[serde(rename = "ip-version")]
    pub ip_version: u16,
    /// The OR port.
    pub port: u16,
    /// The OR address.
    pub address: IpAddr,
}

/// Whether the given address must not be handed out: unspecified,
/// private, loopback, multicast, or link-local addresses make a bridge
/// unreachable from the outside.
pub fn invalid_address(addr: &IpAddr) -> bool {
    match addr {
        IpAddr::V4(a) => {
            a.is_unspecified()
                || a.is_private()
                || a.is_loopback()
                || a.is_multicast()
                || a.is_link_local()
        }
        IpAddr::V6(a) => {
            a.is_unspecified()
                || a.is_loopback()
                || a.is_multicast()
                || (a.segments()[0] & 0xffc0) == 0xfe80
        }
    }
}

/// Render an address the way Tor expects it in a bridge line: IPv6
/// addresses are enclosed in square brackets.
pub fn print_tor_addr(addr: &IpAddr) -> String {
    match addr {
        IpAddr::V4(a) => a.to_string(),
        IpAddr::V6(a) => format!("[{a}]"),
    }
}

/// Hash a bridge's fingerprint using SHA-1, as discussed by Tor
/// Metrics: <https://metrics.torproject.org/onionoo.html#parameters_lookup>
pub fn hash_fingerprint(fingerprint: &str) -> RdResult<String> {
    use sha1::{Digest, Sha1};

    let raw = hex::decode(fingerprint.trim())
        .map_err(|err| RdError::bad_request(err))?;
    let hashed = Sha1::digest(&raw);
    Ok(hex::encode_upper(hashed))
}

/// A bridge's unique id: the hash over a concatenation of the bridge's
/// type and its hashed fingerprint. Stable across address and port
/// changes.
pub fn bridge_uid(rtype: &str, fingerprint: &str) -> Hashkey {
    // A malformed fingerprint still gets a stable (if unhashed) uid.
    let hashed = hash_fingerprint(fingerprint)
        .unwrap_or_else(|_| fingerprint.to_string());
    Hashkey::new(&format!("{rtype}{hashed}"))
}

/// The deterministic suffix that makes up a bridge's object id: the
/// parts of a bridge that can change while its identity stays the same.
pub(crate) fn oid_suffix(
    distribution: &str,
    or_addresses: &[OrAddress],
    flags: &Flags,
) -> String {
    format!("{distribution}|{or_addresses:?}|{flags:?}")
}

pub(crate) mod opt_addr {
    //! The wire form of an optional address: the empty string stands
    //! for "no address", everything else must parse.

    use std::net::IpAddr;

    pub fn serialize<S: serde::Serializer>(
        addr: &Option<IpAddr>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match addr {
            Some(addr) => serializer.serialize_str(&addr.to_string()),
            None => serializer.serialize_str(""),
        }
    }

    pub fn deserialize<'de, D: serde::Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<IpAddr>, D::Error> {
        let s: String = serde::Deserialize::deserialize(deserializer)?;
        if s.is_empty() {
            return Ok(None);
        }
        s.parse().map(Some).map_err(serde::de::Error::custom)
    }
}

/// The wire form shared by vanilla bridges and pluggable transports.
#[derive(Debug, Default, serde::Serialize, serde::Deserialize)]
pub(crate) struct BridgeWire {
    #[serde(rename = "type")]
    pub rtype: String,
    #[serde(default)]
    pub blocked_in: LocationSet,
    #[serde(default)]
    pub location: Option<Location>,
    #[serde(default)]
    pub test_result: Option<TestResultWire>,
    #[serde(default)]
    pub protocol: String,
    #[serde(default, with = "opt_addr")]
    pub address: Option<IpAddr>,
    #[serde(default)]
    pub port: u16,
    #[serde(default)]
    pub fingerprint: String,
    #[serde(rename = "or-addresses", default)]
    pub or_addresses: Vec<OrAddress>,
    #[serde(default)]
    pub distribution: String,
    #[serde(default)]
    pub flags: Flags,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<BTreeMap<String, String>>,
}

/// The slice of a test result that crosses the wire.
#[derive(Debug, Default, serde::Serialize, serde::Deserialize)]
pub(crate) struct TestResultWire {
    #[serde(default)]
    pub last_passed: Option<Timestamp>,
}

/// A vanilla Tor bridge.
#[derive(Debug)]
pub struct Bridge {
    base: ResourceBase,
    /// The transport protocol, always TCP for vanilla Tor.
    pub protocol: String,
    /// The bridge's advertised address.
    pub address: Option<IpAddr>,
    /// The bridge's OR port.
    pub port: u16,
    /// The bridge's fingerprint, hex uppercase.
    pub fingerprint: String,
    /// All OR addresses the bridge advertises.
    pub or_addresses: Vec<OrAddress>,
    /// The distribution mechanism the operator requested, empty for
    /// "any".
    pub distribution: String,
    /// The flags assigned by the bridge authority.
    pub flags: Flags,
    /// The bridge's location, if known.
    pub location: Option<Location>,
    /// The pluggable transports this bridge runs. Only the transports
    /// (or, if there are none, the vanilla flavour) are handed out.
    pub transports: Vec<crate::Transport>,
}

impl Default for Bridge {
    fn default() -> Self {
        Self::new()
    }
}

impl Bridge {
    /// Allocate a new vanilla bridge.
    pub fn new() -> Self {
        Self {
            base: ResourceBase::new(TYPE_VANILLA),
            protocol: PROTO_TCP.to_string(),
            address: None,
            port: 0,
            fingerprint: String::new(),
            or_addresses: Vec::new(),
            distribution: String::new(),
            flags: Flags::default(),
            location: None,
            transports: Vec::new(),
        }
    }

    /// The bridge's bridge line, e.g. `1.2.3.4:443 0123...89`.
    pub fn bridge_line(&self) -> String {
        let addr = self
            .address
            .as_ref()
            .map(print_tor_addr)
            .unwrap_or_default();
        format!("{}:{} {}", addr, self.port, self.fingerprint)
            .trim()
            .to_string()
    }

    /// Add the given transport to the bridge, unless an identical one
    /// is already on record.
    pub fn add_transport(&mut self, transport: crate::Transport) {
        let line = transport.string_form();
        if self.transports.iter().any(|t| t.string_form() == line) {
            return;
        }
        self.transports.push(transport);
    }

    /// Decode a vanilla bridge from its wire form.
    pub fn decode(value: &serde_json::Value) -> RdResult<DynResource> {
        let wire: BridgeWire = serde_json::from_value(value.clone())
            .map_err(RdError::bad_request)?;
        let bridge = Self::from_wire(wire);
        Ok(Arc::new(bridge))
    }

    pub(crate) fn from_wire(wire: BridgeWire) -> Self {
        let bridge = Self {
            base: ResourceBase::new(wire.rtype),
            protocol: if wire.protocol.is_empty() {
                PROTO_TCP.to_string()
            } else {
                wire.protocol
            },
            address: wire.address,
            port: wire.port,
            fingerprint: wire.fingerprint,
            or_addresses: wire.or_addresses,
            distribution: wire.distribution,
            flags: wire.flags,
            location: wire.location,
            transports: Vec::new(),
        };
        bridge.base.set_blocked_in(&wire.blocked_in);
        if let Some(test) = wire.test_result {
            bridge.base.test_state().write().unwrap().last_passed =
                test.last_passed;
        }
        bridge
    }

    fn wire(&self) -> BridgeWire {
        BridgeWire {
            rtype: self.base.rtype().to_string(),
            blocked_in: self.base.blocked_in(),
            location: self.location.clone(),
            test_result: Some(TestResultWire {
                last_passed: self.base.test_state().read().unwrap().last_passed,
            }),
            protocol: self.protocol.clone(),
            address: self.address,
            port: self.port,
            fingerprint: self.fingerprint.clone(),
            or_addresses: self.or_addresses.clone(),
            distribution: self.distribution.clone(),
            flags: self.flags,
            params: None,
        }
    }
}

impl Resource for Bridge {
    fn resource_type(&self) -> &str {
        self.base.rtype()
    }

    fn string_form(&self) -> String {
        self.bridge_line()
    }

    fn is_valid(&self) -> bool {
        !self.resource_type().is_empty()
            && self.address.is_some()
            && self.port != 0
    }

    fn uid(&self) -> Hashkey {
        bridge_uid(self.resource_type(), &self.fingerprint)
    }

    fn oid(&self) -> Hashkey {
        Hashkey::new(&format!(
            "{}|{}",
            self.bridge_line(),
            oid_suffix(&self.distribution, &self.or_addresses, &self.flags),
        ))
    }

    fn relation_identifiers(&self) -> Vec<String> {
        let mut ids = vec![self.fingerprint.clone()];
        if let Some(addr) = &self.address {
            ids.push(addr.to_string());
        }
        ids
    }

    fn distributor(&self) -> Option<String> {
        if self.distribution.is_empty() {
            None
        } else {
            Some(self.distribution.clone())
        }
    }

    fn expiry(&self) -> Duration {
        BRIDGE_EXPIRY
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

    fn fingerprint(&self) -> Option<String> {
        Some(self.fingerprint.clone())
    }

    fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self.wire()).expect("bridge wire form is json")
    }
}
