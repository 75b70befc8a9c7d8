//! Pluggable-transport bridges.

use crate::bridge::{
    oid_suffix, print_tor_addr, BridgeWire, Flags, OrAddress, TestResultWire,
    BRIDGE_EXPIRY, PROTO_TCP,
};
use rdsys_api::{
    DynResource, Hashkey, Location, LocationSet, RdError, RdResult, Resource,
    ResourceBase, ResourceTest, TestFunc,
};
use std::collections::BTreeMap;
use std::net::IpAddr;
use std::sync::{Arc, RwLock};
use std::time::Duration;

/// A Tor bridge's pluggable transport, e.g. an obfs4 listener.
#[derive(Debug)]
pub struct Transport {
    base: ResourceBase,
    /// The transport protocol.
    pub protocol: String,
    /// The transport's address.
    pub address: Option<IpAddr>,
    /// The transport's port.
    pub port: u16,
    /// The fingerprint of the bridge running this transport.
    pub fingerprint: String,
    /// The OR addresses of the bridge running this transport.
    pub or_addresses: Vec<OrAddress>,
    /// The distribution mechanism the operator requested, empty for
    /// "any".
    pub distribution: String,
    /// The flags of the bridge running this transport.
    pub flags: Flags,
    /// The transport's location, if known.
    pub location: Option<Location>,
    /// The transport's key=value arguments, e.g. obfs4's cert and
    /// iat-mode.
    pub params: BTreeMap<String, String>,
}

impl Transport {
    /// Allocate a new transport of the given type.
    pub fn new(rtype: impl Into<String>) -> Self {
        Self {
            base: ResourceBase::new(rtype),
            protocol: PROTO_TCP.to_string(),
            address: None,
            port: 0,
            fingerprint: String::new(),
            or_addresses: Vec::new(),
            distribution: String::new(),
            flags: Flags::default(),
            location: None,
            params: BTreeMap::new(),
        }
    }

    /// Parse a bridge line of the form
    /// `[Bridge] <type> <address>:<port> <fingerprint> [k=v ...]`.
    pub fn from_bridge_line(bridge_line: &str) -> RdResult<Self> {
        let line = bridge_line
            .trim()
            .strip_prefix("Bridge ")
            .unwrap_or(bridge_line)
            .trim();
        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.len() < 3 {
            return Err(RdError::bad_request(format!(
                "malformed bridge line {bridge_line:?}"
            )));
        }

        let mut transport = Transport::new(parts[0]);
        transport.fingerprint = parts[2].to_string();

        let (host, port) = parts[1].rsplit_once(':').ok_or_else(|| {
            RdError::bad_request(format!("malformed address {:?}", parts[1]))
        })?;
        let host = host.trim_start_matches('[').trim_end_matches(']');
        transport.address = Some(
            host.parse()
                .map_err(|err| RdError::bad_request(err))?,
        );
        transport.port = port
            .parse()
            .map_err(|err| RdError::bad_request(err))?;

        for param in &parts[3..] {
            let (key, value) = param.split_once('=').ok_or_else(|| {
                RdError::bad_request(format!("malformed param {param:?}"))
            })?;
            transport.params.insert(key.to_string(), value.to_string());
        }
        Ok(transport)
    }

    /// Decode a transport from its wire form.
    pub fn decode(value: &serde_json::Value) -> RdResult<DynResource> {
        let wire: BridgeWire = serde_json::from_value(value.clone())
            .map_err(RdError::bad_request)?;
        let transport = Self {
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
            params: wire.params.unwrap_or_default(),
        };
        transport.base.set_blocked_in(&wire.blocked_in);
        if let Some(test) = wire.test_result {
            transport.base.test_state().write().unwrap().last_passed =
                test.last_passed;
        }
        Ok(Arc::new(transport))
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
            params: Some(self.params.clone()),
        }
    }
}

impl Resource for Transport {
    fn resource_type(&self) -> &str {
        self.base.rtype()
    }

    /// The transport's bridge line. The key=value arguments are ordered
    /// by key, which guarantees a deterministic rendering; Tor itself
    /// does not care about the order.
    fn string_form(&self) -> String {
        let addr = self
            .address
            .as_ref()
            .map(print_tor_addr)
            .unwrap_or_default();
        let args: Vec<String> = self
            .params
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect();
        format!(
            "{} {}:{} {} {}",
            self.resource_type(),
            addr,
            self.port,
            self.fingerprint,
            args.join(" "),
        )
        .trim()
        .to_string()
    }

    fn is_valid(&self) -> bool {
        !self.resource_type().is_empty()
            && self.address.is_some()
            && self.port != 0
    }

    /// For pluggable transports we do not distinguish between unique
    /// and object ids, because some bridges run more than one transport
    /// of the same type; a fingerprint-derived uid would then keep
    /// flapping between the two listeners.
    fn uid(&self) -> Hashkey {
        Hashkey::new(&self.string_form())
    }

    fn oid(&self) -> Hashkey {
        Hashkey::new(&format!(
            "{}|{}",
            self.string_form(),
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
        serde_json::to_value(self.wire()).expect("transport wire form is json")
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::TYPE_OBFS4;

    const FP: &str = "0123456789ABCDEF0123456789ABCDEF01234567";

    fn transport() -> Transport {
        let mut t = Transport::new(TYPE_OBFS4);
        t.fingerprint = FP.to_string();
        t.address = Some("1.2.3.4".parse().unwrap());
        t.port = 443;
        t.params.insert("iat-mode".into(), "0".into());
        t.params.insert("cert".into(), "deadbeef".into());
        t
    }

    #[test]
    fn string_form_orders_params() {
        assert_eq!(
            format!("obfs4 1.2.3.4:443 {FP} cert=deadbeef iat-mode=0"),
            transport().string_form(),
        );
    }

    #[test]
    fn uid_covers_the_whole_listener() {
        // Two listeners of the same type on the same bridge must have
        // distinct uids.
        let t1 = transport();
        let mut t2 = transport();
        t2.address = Some("5.6.7.8".parse().unwrap());
        assert_ne!(t1.uid(), t2.uid());
    }

    #[test]
    fn from_bridge_line_round_trips() {
        let t = transport();
        let parsed =
            Transport::from_bridge_line(&format!("Bridge {}", t.string_form()))
                .unwrap();
        assert_eq!(t.string_form(), parsed.string_form());

        assert!(Transport::from_bridge_line("obfs4 1.2.3.4:443").is_err());
        assert!(
            Transport::from_bridge_line("obfs4 nonsense fingerprint").is_err()
        );
    }

    #[test]
    fn wire_round_trip_keeps_params() {
        let t = transport();
        let value = t.to_json();
        assert_eq!("obfs4", value["type"]);
        assert_eq!("deadbeef", value["params"]["cert"]);

        let back = crate::default_registry().decode(&value).unwrap();
        assert_eq!(t.uid(), back.uid());
        assert_eq!(t.string_form(), back.string_form());
    }

    #[test]
    fn decode_rejects_invalid_transports() {
        let value = serde_json::json!({
            "type": "obfs4",
            "address": "",
            "port": 0,
        });
        assert!(crate::default_registry().decode(&value).is_err());
    }
}
