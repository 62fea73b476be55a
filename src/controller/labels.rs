//! Mapping of host trust records onto node labels and annotations

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, SecondsFormat, Utc};
use kube::api::ObjectMeta;

use crate::config::TagPrefix;
use crate::crd::HostTrustRecord;

pub const HVS_SIGNED_REPORT_ANNOTATION: &str = "HvsSignedTrustReport";
pub const SGX_SIGNED_REPORT_ANNOTATION: &str = "SgxSignedTrustReport";
pub const HVS_TRUST_EXPIRY_LABEL: &str = "HvsTrustExpiry";
pub const SGX_TRUST_EXPIRY_LABEL: &str = "SgxTrustExpiry";
pub const TRUSTED_LABEL: &str = "trusted";
pub const SGX_ENABLED_LABEL: &str = "SGX-Enabled";
pub const SGX_SUPPORTED_LABEL: &str = "SGX-Supported";
pub const FLC_ENABLED_LABEL: &str = "FLC-Enabled";
pub const TCB_UP_TO_DATE_LABEL: &str = "TCBUpToDate";
pub const EPC_MEMORY_LABEL: &str = "EPC-Memory";

/// Label and annotation changes for one node
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct NodeMetadataDelta {
    pub labels: BTreeMap<String, String>,
    pub annotations: BTreeMap<String, String>,
    /// Prefixed labels the node carries but the record no longer produces
    pub stale_labels: BTreeSet<String>,
}

impl NodeMetadataDelta {
    pub fn is_empty(&self) -> bool {
        self.labels.is_empty() && self.annotations.is_empty() && self.stale_labels.is_empty()
    }

    /// Merge into node metadata, leaving unrelated entries alone.
    /// Returns whether anything changed.
    pub fn apply_to(&self, meta: &mut ObjectMeta) -> bool {
        let mut changed = false;

        let labels = meta.labels.get_or_insert_with(BTreeMap::new);
        for key in &self.stale_labels {
            changed |= labels.remove(key).is_some();
        }
        for (key, value) in &self.labels {
            changed |= labels.insert(key.clone(), value.clone()).as_ref() != Some(value);
        }

        if !self.annotations.is_empty() {
            let annotations = meta.annotations.get_or_insert_with(BTreeMap::new);
            for (key, value) in &self.annotations {
                changed |= annotations.insert(key.clone(), value.clone()).as_ref() != Some(value);
            }
        }

        changed
    }
}

/// Label values may not contain `:`, so RFC3339 colons become dots
pub fn label_safe_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Secs, true).replace(':', ".")
}

/// Compute the metadata delta for a node from its host's trust record.
///
/// Returns `None` when the record carries no signed report at all: a missing
/// report is no evidence about the host, so its node is left untouched.
pub fn map_host(
    host: &HostTrustRecord,
    current_labels: &BTreeMap<String, String>,
    prefix: &TagPrefix,
) -> Option<NodeMetadataDelta> {
    if !host.has_signed_report() {
        return None;
    }

    let mut delta = NodeMetadataDelta::default();

    if let Some(report) = host.hvs_report() {
        delta
            .annotations
            .insert(HVS_SIGNED_REPORT_ANNOTATION.to_string(), report.to_string());
        if let Some(expiry) = &host.hvs_trust_expiry {
            delta
                .labels
                .insert(HVS_TRUST_EXPIRY_LABEL.to_string(), label_safe_timestamp(expiry));
        }
        delta
            .labels
            .insert(prefix.label(TRUSTED_LABEL), host.trusted.to_string());
        for (key, value) in host.asset_tags.iter().chain(&host.hardware_features) {
            delta.labels.insert(prefix.label(key), value.clone());
        }
    }

    delta.stale_labels = current_labels
        .keys()
        .filter(|key| prefix.owns(key) && !delta.labels.contains_key(*key))
        .cloned()
        .collect();

    if let Some(report) = host.sgx_report() {
        delta
            .annotations
            .insert(SGX_SIGNED_REPORT_ANNOTATION.to_string(), report.to_string());
        if let Some(expiry) = &host.sgx_trust_expiry {
            delta
                .labels
                .insert(SGX_TRUST_EXPIRY_LABEL.to_string(), label_safe_timestamp(expiry));
        }
        for (label, value) in [
            (SGX_ENABLED_LABEL, &host.sgx_enabled),
            (SGX_SUPPORTED_LABEL, &host.sgx_supported),
            (FLC_ENABLED_LABEL, &host.flc_enabled),
            (TCB_UP_TO_DATE_LABEL, &host.tcb_up_to_date),
            (EPC_MEMORY_LABEL, &host.epc_size),
        ] {
            delta.labels.insert(label.to_string(), value.clone());
        }
    }

    Some(delta)
}
