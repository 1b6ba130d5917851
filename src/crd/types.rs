//! Supporting types for the ClusterConfig CRD

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// How far a peering relationship with a remote cluster has progressed
///
/// Ordered: a resource type is eligible for replication only when the current
/// phase is greater than or equal to the phase it requires.
#[derive(
    Clone,
    Copy,
    Debug,
    Default,
    Deserialize,
    Serialize,
    JsonSchema,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
)]
#[non_exhaustive]
pub enum PeeringPhase {
    /// No peering relationship
    None,
    /// Identities have been exchanged
    Authenticated,
    /// Outgoing or incoming peering is established
    #[default]
    Established,
    /// Peering is established in both directions
    Bidirectional,
}

impl std::str::FromStr for PeeringPhase {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "none" => Ok(Self::None),
            "authenticated" => Ok(Self::Authenticated),
            "established" => Ok(Self::Established),
            "bidirectional" => Ok(Self::Bidirectional),
            _ => Err(crate::Error::validation(format!(
                "invalid peering phase: {s}, expected one of: none, authenticated, established, bidirectional"
            ))),
        }
    }
}

impl std::fmt::Display for PeeringPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::None => write!(f, "None"),
            Self::Authenticated => write!(f, "Authenticated"),
            Self::Established => write!(f, "Established"),
            Self::Bidirectional => write!(f, "Bidirectional"),
        }
    }
}

/// A resource type listed in the dispatcher configuration
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Resource {
    /// API group (empty for the core group)
    #[serde(default)]
    pub group: String,

    /// API version
    pub version: String,

    /// Plural resource name
    pub resource: String,

    /// Minimum peering phase required before the type is replicated
    #[serde(default)]
    pub peering_phase: PeeringPhase,
}

impl Resource {
    /// Returns true if version and resource name are set
    pub fn is_complete(&self) -> bool {
        !self.version.is_empty() && !self.resource.is_empty()
    }
}

/// Dispatcher section of the cluster configuration
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DispatcherConfig {
    /// Resource types to mirror into peered clusters
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub resources_to_replicate: Vec<Resource>,
}

/// Identity of a resource type: group, version and plural resource name
///
/// Set comparisons in the dispatcher use this triple only; the required
/// peering phase is deliberately not part of the identity.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ResourceId {
    /// API group (empty for the core group)
    pub group: String,
    /// API version
    pub version: String,
    /// Plural resource name
    pub resource: String,
}

impl ResourceId {
    /// Create a resource id
    pub fn new(
        group: impl Into<String>,
        version: impl Into<String>,
        resource: impl Into<String>,
    ) -> Self {
        Self {
            group: group.into(),
            version: version.into(),
            resource: resource.into(),
        }
    }

    /// `apiVersion` string for this resource (`v1` for the core group)
    pub fn api_version(&self) -> String {
        if self.group.is_empty() {
            self.version.clone()
        } else {
            format!("{}/{}", self.group, self.version)
        }
    }

    /// Group/version pair for discovery
    pub fn group_version(&self) -> kube::core::GroupVersion {
        kube::core::GroupVersion::gv(&self.group, &self.version)
    }
}

impl std::fmt::Display for ResourceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.group.is_empty() {
            write!(f, "{}.{}", self.resource, self.version)
        } else {
            write!(f, "{}.{}.{}", self.resource, self.version, self.group)
        }
    }
}

/// A resource type to mirror, with the phase gating its replication
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReplicatedResource {
    /// Identity of the resource type
    pub id: ResourceId,
    /// Minimum peering phase for replication to be active
    pub peering_phase: PeeringPhase,
}

impl ReplicatedResource {
    /// Create a replicated resource
    pub fn new(id: ResourceId, peering_phase: PeeringPhase) -> Self {
        Self { id, peering_phase }
    }

    /// Returns true if replication is allowed in `current` phase
    pub fn is_eligible(&self, current: PeeringPhase) -> bool {
        current >= self.peering_phase
    }
}

impl From<&Resource> for ReplicatedResource {
    fn from(r: &Resource) -> Self {
        Self {
            id: ResourceId::new(&r.group, &r.version, &r.resource),
            peering_phase: r.peering_phase,
        }
    }
}
