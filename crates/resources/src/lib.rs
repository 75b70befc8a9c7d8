#![deny(missing_docs)]
//! The concrete resources that rdsys hands out to users: vanilla Tor
//! bridges, pluggable-transport bridges, and Tor Browser download
//! links.
//!
//! Every variant implements [rdsys_api::Resource] and registers a
//! decode constructor in [default_registry], which is how the backend's
//! JSON codec and collection routing learn about it.

use rdsys_api::{Registry, TypeInfo};

mod bridge;
pub use bridge::*;

mod transport;
pub use transport::*;

mod link;
pub use link::*;

/// The resource type name of vanilla Tor bridges.
pub const TYPE_VANILLA: &str = "vanilla";
/// The resource type name of obfs4 bridges.
pub const TYPE_OBFS4: &str = "obfs4";
/// The resource type name of scramblesuit bridges.
pub const TYPE_SCRAMBLESUIT: &str = "scramblesuit";
/// The resource type name of snowflake proxies. Snowflake carries a
/// placeholder address, so it is exempt from address validation.
pub const TYPE_SNOWFLAKE: &str = "snowflake";
/// The resource type name of Tor Browser download links.
pub const TYPE_TBLINK: &str = "tblink";

/// The registry of all resource types this crate implements.
pub fn default_registry() -> Registry {
    let mut registry = Registry::new();
    registry.register(
        TYPE_VANILLA,
        TypeInfo {
            decode: Bridge::decode,
            needs_store: false,
            address_dummy: false,
        },
    );
    for transport in [TYPE_OBFS4, TYPE_SCRAMBLESUIT] {
        registry.register(
            transport,
            TypeInfo {
                decode: Transport::decode,
                needs_store: false,
                address_dummy: false,
            },
        );
    }
    registry.register(
        TYPE_SNOWFLAKE,
        TypeInfo {
            decode: Transport::decode,
            needs_store: false,
            address_dummy: true,
        },
    );
    registry.register(
        TYPE_TBLINK,
        TypeInfo {
            decode: TbLink::decode,
            needs_store: true,
            address_dummy: false,
        },
    );
    registry
}
