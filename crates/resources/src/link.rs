//! Tor Browser download links.

use crate::TYPE_TBLINK;
use rdsys_api::{
    DynResource, Hashkey, LocationSet, RdError, RdResult, Resource,
    ResourceBase, ResourceTest, SpeedState, TestFunc, TestState,
};
use std::sync::{Arc, RwLock};
use std::time::Duration;

/// A Tor Browser version.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    serde::Serialize,
    serde::Deserialize,
)]
pub struct Version {
    /// Major version number.
    pub major: u32,
    /// Minor version number.
    pub minor: u32,
    /// Patch version number.
    pub patch: u32,
}

impl std::str::FromStr for Version {
    type Err = RdError;

    fn from_str(s: &str) -> RdResult<Self> {
        let mut version = Version::default();
        let mut parts = s.split('.');
        let parse = |part: Option<&str>| -> RdResult<Option<u32>> {
            part.map(|p| {
                p.parse().map_err(|err| {
                    RdError::bad_request(format!("bad version {s:?}: {err}"))
                })
            })
            .transpose()
        };
        version.major = parse(parts.next())?.ok_or_else(|| {
            RdError::bad_request(format!("bad version {s:?}"))
        })?;
        version.minor = parse(parts.next())?.unwrap_or(0);
        version.patch = parse(parts.next())?.unwrap_or(0);
        Ok(version)
    }
}

impl std::fmt::Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

#[derive(Debug, Default, serde::Serialize, serde::Deserialize)]
struct TbLinkWire {
    #[serde(rename = "type")]
    rtype: String,
    #[serde(default)]
    blocked_in: LocationSet,
    #[serde(default)]
    platform: String,
    #[serde(default)]
    version: Version,
    #[serde(default)]
    provider: String,
    #[serde(default)]
    file_name: String,
    #[serde(default)]
    link: String,
    #[serde(default)]
    sig_link: String,
    #[serde(default)]
    custom_oid: Option<Hashkey>,
    /// Seconds.
    #[serde(default)]
    custom_expiry: Option<u64>,
}

/// A link to download Tor Browser for a certain platform.
///
/// Links are born functional with a ratio of 1.0: there is nothing for
/// the probers to measure.
#[derive(Debug)]
pub struct TbLink {
    base: ResourceBase,
    /// The platform the download is built for, e.g. "linux64".
    pub platform: String,
    /// The Tor Browser version.
    pub version: Version,
    /// The storage provider hosting the download.
    pub provider: String,
    /// The file name of the download.
    pub file_name: String,
    /// The download link.
    pub link: String,
    /// The link to the download's signature.
    pub sig_link: String,
    /// An operator-supplied object id overriding the link-derived one.
    pub custom_oid: Option<Hashkey>,
    /// An operator-supplied expiry overriding the default.
    pub custom_expiry: Option<Duration>,
}

impl Default for TbLink {
    fn default() -> Self {
        Self::new()
    }
}

impl TbLink {
    /// Allocate a new Tor Browser link.
    pub fn new() -> Self {
        Self {
            base: ResourceBase::with_test(
                TYPE_TBLINK,
                ResourceTest {
                    state: TestState::Functional,
                    speed: SpeedState::Untested,
                    ratio: Some(1.0),
                    ..Default::default()
                },
            ),
            platform: String::new(),
            version: Version::default(),
            provider: String::new(),
            file_name: String::new(),
            link: String::new(),
            sig_link: String::new(),
            custom_oid: None,
            custom_expiry: None,
        }
    }

    /// Decode a link from its wire form.
    pub fn decode(value: &serde_json::Value) -> RdResult<DynResource> {
        let wire: TbLinkWire = serde_json::from_value(value.clone())
            .map_err(RdError::bad_request)?;
        let mut link = Self::new();
        link.platform = wire.platform;
        link.version = wire.version;
        link.provider = wire.provider;
        link.file_name = wire.file_name;
        link.link = wire.link;
        link.sig_link = wire.sig_link;
        link.custom_oid = wire.custom_oid;
        link.custom_expiry = wire.custom_expiry.map(Duration::from_secs);
        link.base.set_blocked_in(&wire.blocked_in);
        Ok(Arc::new(link))
    }
}

impl Resource for TbLink {
    fn resource_type(&self) -> &str {
        self.base.rtype()
    }

    fn string_form(&self) -> String {
        self.link.clone()
    }

    fn is_valid(&self) -> bool {
        true
    }

    /// Links have no identity beyond their content; uid and oid
    /// coincide.
    fn uid(&self) -> Hashkey {
        self.oid()
    }

    fn oid(&self) -> Hashkey {
        match self.custom_oid {
            Some(oid) => oid,
            None => Hashkey::new(&self.link),
        }
    }

    fn relation_identifiers(&self) -> Vec<String> {
        Vec::new()
    }

    fn distributor(&self) -> Option<String> {
        None
    }

    /// Links that are older than a year have long been superseded by a
    /// newer release.
    fn expiry(&self) -> Duration {
        self.custom_expiry
            .unwrap_or(Duration::from_secs(24 * 60 * 60 * 365))
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
        None
    }

    fn set_test_func(&self, _f: TestFunc) {}

    fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "type": self.resource_type(),
            "blocked_in": self.base.blocked_in(),
            "platform": self.platform,
            "version": self.version,
            "provider": self.provider,
            "file_name": self.file_name,
            "link": self.link,
            "sig_link": self.sig_link,
            "custom_oid": self.custom_oid,
            "custom_expiry": self.custom_expiry.map(|e| e.as_secs()),
        })
    }
}
