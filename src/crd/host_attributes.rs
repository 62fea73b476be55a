//! HostAttributes Custom Resource Definition
//!
//! Each entry of `spec.hostList` carries the latest attestation result for one
//! physical host, keyed by the name of the Kubernetes node running on it.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "crd.isecl.intel.com",
    version = "v1beta1",
    kind = "HostAttributes",
    plural = "hostattributes",
    namespaced,
    shortname = "ha",
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct HostAttributesSpec {
    #[serde(default)]
    pub host_list: Vec<HostTrustRecord>,
}

/// Attestation result for a single host
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct HostTrustRecord {
    /// Name of the node running on the attested host
    #[serde(rename = "hostName")]
    pub hostname: String,

    #[serde(default)]
    pub trusted: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hvs_trust_expiry: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sgx_trust_expiry: Option<DateTime<Utc>>,

    /// Signed platform trust report from the verification service
    #[serde(
        default,
        rename = "hvsSignedTrustReport",
        skip_serializing_if = "Option::is_none"
    )]
    pub hvs_signed_report: Option<String>,

    /// Signed SGX trust report from the SGX verification service
    #[serde(
        default,
        rename = "sgxSignedTrustReport",
        skip_serializing_if = "Option::is_none"
    )]
    pub sgx_signed_report: Option<String>,

    #[serde(default)]
    pub asset_tags: BTreeMap<String, String>,

    #[serde(default)]
    pub hardware_features: BTreeMap<String, String>,

    #[serde(default)]
    pub sgx_enabled: String,

    #[serde(default)]
    pub sgx_supported: String,

    #[serde(default)]
    pub tcb_up_to_date: String,

    #[serde(default)]
    pub epc_size: String,

    #[serde(default)]
    pub flc_enabled: String,
}

impl HostTrustRecord {
    /// Signed platform report, if one was published
    pub fn hvs_report(&self) -> Option<&str> {
        self.hvs_signed_report.as_deref().filter(|r| !r.is_empty())
    }

    /// Signed SGX report, if one was published
    pub fn sgx_report(&self) -> Option<&str> {
        self.sgx_signed_report.as_deref().filter(|r| !r.is_empty())
    }

    /// Records without any signed report carry no evidence either way
    pub fn has_signed_report(&self) -> bool {
        self.hvs_report().is_some() || self.sgx_report().is_some()
    }
}
