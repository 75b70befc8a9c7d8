#![deny(missing_docs)]
//! rdsys API contains the resource traits and the basic types required
//! to define the api of the rdsys bridge distribution backend.
//!
//! A "resource" is anything rdsys hands out to users: a vanilla Tor
//! bridge, a pluggable-transport bridge, or a Tor Browser download link.
//! Concrete resource variants live in the `rdsys_resources` crate; the
//! data structures that partition and distribute them live in
//! `rdsys_core`.

mod error;
pub use error::*;

mod timestamp;
pub use timestamp::*;

mod resource;
pub use resource::*;

mod diff;
pub use diff::*;

mod registry;
pub use registry::*;

pub mod dummy;
