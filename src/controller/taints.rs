//! Node taint helpers
//!
//! A taint is identified by its full `(key, value, effect)` triple. Adding a
//! triple that is already present does nothing; removing deletes every taint
//! that matches all three fields.

use std::fmt;
use std::str::FromStr;

use chrono::Utc;
use k8s_openapi::api::core::v1::{Node, Taint};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;

use crate::error::{Error, Result};

/// Key of the taints applied to nodes pending or failing attestation
pub const UNTRUSTED_TAINT_KEY: &str = "untrusted";
pub const UNTRUSTED_TAINT_VALUE: &str = "true";

/// Role labels marking control-plane nodes, which are never tainted
pub const CONTROL_PLANE_ROLE_LABELS: [&str; 2] = [
    "node-role.kubernetes.io/master",
    "node-role.kubernetes.io/control-plane",
];

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TaintEffect {
    NoSchedule,
    PreferNoSchedule,
    NoExecute,
}

impl TaintEffect {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaintEffect::NoSchedule => "NoSchedule",
            TaintEffect::PreferNoSchedule => "PreferNoSchedule",
            TaintEffect::NoExecute => "NoExecute",
        }
    }
}

impl FromStr for TaintEffect {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "NoSchedule" => Ok(TaintEffect::NoSchedule),
            "PreferNoSchedule" => Ok(TaintEffect::PreferNoSchedule),
            "NoExecute" => Ok(TaintEffect::NoExecute),
            other => Err(Error::InvalidTaintEffect(other.to_string())),
        }
    }
}

impl fmt::Display for TaintEffect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A validated taint triple
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct TaintSpec {
    pub key: String,
    pub value: String,
    pub effect: TaintEffect,
}

impl TaintSpec {
    pub fn new(key: impl Into<String>, value: impl Into<String>, effect: TaintEffect) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            effect,
        }
    }

    /// The `(untrusted, true, effect)` taint
    pub fn untrusted(effect: TaintEffect) -> Self {
        Self::new(UNTRUSTED_TAINT_KEY, UNTRUSTED_TAINT_VALUE, effect)
    }

    fn matches(&self, taint: &Taint) -> bool {
        taint.key == self.key
            && taint.value.as_deref().unwrap_or_default() == self.value
            && taint.effect == self.effect.as_str()
    }

    fn to_taint(&self) -> Taint {
        Taint {
            key: self.key.clone(),
            value: Some(self.value.clone()),
            effect: self.effect.as_str().to_string(),
            // Only NoExecute taints carry an eviction timestamp
            time_added: (self.effect == TaintEffect::NoExecute).then(|| Time(Utc::now())),
        }
    }
}

/// Both untrusted taints, NoExecute first
pub fn untrusted_taints() -> [TaintSpec; 2] {
    [
        TaintSpec::untrusted(TaintEffect::NoExecute),
        TaintSpec::untrusted(TaintEffect::NoSchedule),
    ]
}

pub fn has_taint(node: &Node, spec: &TaintSpec) -> bool {
    node.spec
        .as_ref()
        .and_then(|s| s.taints.as_ref())
        .is_some_and(|taints| taints.iter().any(|t| spec.matches(t)))
}

/// Add a taint unless an identical triple is present. Returns whether the node changed.
pub fn add_taint(node: &mut Node, spec: &TaintSpec) -> bool {
    if has_taint(node, spec) {
        return false;
    }
    node.spec
        .get_or_insert_with(Default::default)
        .taints
        .get_or_insert_with(Vec::new)
        .push(spec.to_taint());
    true
}

/// Remove every taint matching the triple. Returns whether the node changed.
pub fn remove_taint(node: &mut Node, spec: &TaintSpec) -> bool {
    let Some(taints) = node.spec.as_mut().and_then(|s| s.taints.as_mut()) else {
        return false;
    };
    let before = taints.len();
    taints.retain(|t| !spec.matches(t));
    before != taints.len()
}

pub fn add_untrusted_taints(node: &mut Node) -> bool {
    untrusted_taints()
        .iter()
        .fold(false, |changed, spec| add_taint(node, spec) | changed)
}

pub fn remove_untrusted_taints(node: &mut Node) -> bool {
    untrusted_taints()
        .iter()
        .fold(false, |changed, spec| remove_taint(node, spec) | changed)
}

/// Whether the node carries a control-plane role label
pub fn is_control_plane(node: &Node) -> bool {
    node.metadata
        .labels
        .as_ref()
        .is_some_and(|labels| CONTROL_PLANE_ROLE_LABELS.iter().any(|l| labels.contains_key(*l)))
}
