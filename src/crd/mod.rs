//! Custom Resource Definitions consumed by the controller
//!
//! The attestation platform publishes one `HostAttributes` object per batch of
//! attested hosts; the controller only ever reads it.

mod host_attributes;


pub use host_attributes::{HostAttributes, HostAttributesSpec, HostTrustRecord};
