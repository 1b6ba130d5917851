//! Forge functions: source object -> mirror object
//!
//! Every reflected kind is turned into its mirror by a plain function looked
//! up in a [`ForgeTable`]. The default forge works for any kind whose payload
//! can be copied verbatim; kinds needing special handling register an
//! override keyed by `(group, resource)`.

use std::collections::{BTreeMap, HashMap};
use std::str::FromStr;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::DynamicObject;

use crate::crd::ResourceId;
use crate::{
    reflection_labels, Error, ORIGIN_CLUSTER_LABEL, SOURCE_NAMESPACE_ANNOTATION,
    SOURCE_NAME_ANNOTATION, SOURCE_UID_ANNOTATION,
};

/// Top-level payload fields the target cluster owns
const SERVER_OWNED_FIELDS: &[&str] = &["status"];

/// Source namespace -> target namespace mapping
///
/// The mapping policy is decided elsewhere; the engine only executes it.
/// Namespaces without an entry keep their name.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct NamespaceMap(BTreeMap<String, String>);

impl NamespaceMap {
    /// Create a mapping from explicit entries
    pub fn new(entries: BTreeMap<String, String>) -> Self {
        Self(entries)
    }

    /// Target namespace for `source`
    pub fn target<'a>(&'a self, source: &'a str) -> &'a str {
        self.0.get(source).map(String::as_str).unwrap_or(source)
    }

    /// Source namespace for `target`, inverting the mapping
    pub fn source<'a>(&'a self, target: &'a str) -> &'a str {
        self.0
            .iter()
            .find(|(_, t)| t.as_str() == target)
            .map(|(s, _)| s.as_str())
            .unwrap_or(target)
    }
}

impl FromStr for NamespaceMap {
    type Err = Error;

    /// Parse `src=dst,src2=dst2`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut entries = BTreeMap::new();
        for pair in s.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let (src, dst) = pair.split_once('=').ok_or_else(|| {
                Error::validation(format!("invalid namespace mapping {pair:?}, expected src=dst"))
            })?;
            if src.is_empty() || dst.is_empty() {
                return Err(Error::validation(format!(
                    "invalid namespace mapping {pair:?}, namespaces cannot be empty"
                )));
            }
            entries.insert(src.to_string(), dst.to_string());
        }
        Ok(Self(entries))
    }
}

/// Inputs shared by every forge call of one reflector
#[derive(Clone, Debug, Default)]
pub struct ForgeContext {
    /// Id of the cluster the sources live in
    pub origin_cluster_id: String,
    /// Where mirrored objects are placed
    pub namespaces: NamespaceMap,
}

impl ForgeContext {
    /// Create a forge context
    pub fn new(origin_cluster_id: impl Into<String>, namespaces: NamespaceMap) -> Self {
        Self {
            origin_cluster_id: origin_cluster_id.into(),
            namespaces,
        }
    }
}

/// Transform a source object into its mirror.
///
/// `Ok(None)` means the object must not be reflected; an existing mirror for
/// it is removed.
pub type ForgeFn = fn(&DynamicObject, &ForgeContext) -> Result<Option<DynamicObject>, Error>;

/// Per-kind forge overrides with a generic fallback
#[derive(Clone)]
pub struct ForgeTable {
    overrides: HashMap<(String, String), ForgeFn>,
}

impl Default for ForgeTable {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl ForgeTable {
    /// A table with no overrides
    pub fn empty() -> Self {
        Self {
            overrides: HashMap::new(),
        }
    }

    /// A table with the built-in overrides registered
    pub fn with_defaults() -> Self {
        let mut table = Self::empty();
        table.register("", "secrets", forge_secret);
        table
    }

    /// Register `forge` for every version of `group`/`resource`
    pub fn register(&mut self, group: &str, resource: &str, forge: ForgeFn) {
        self.overrides
            .insert((group.to_string(), resource.to_string()), forge);
    }

    /// Forge function for `id`
    pub fn lookup(&self, id: &ResourceId) -> ForgeFn {
        self.overrides
            .get(&(id.group.clone(), id.resource.clone()))
            .copied()
            .unwrap_or(forge_mirror)
    }
}

/// Metadata of the mirror for `source`: name, mapped namespace, carried-over
/// labels and annotations, reflection labels and back-references.
///
/// Server-managed fields (resourceVersion, uid, managedFields, owners,
/// timestamps) are never copied: the source is the only source of truth and
/// nothing from the target flows back.
pub fn mirror_metadata(source: &DynamicObject, ctx: &ForgeContext) -> Result<ObjectMeta, Error> {
    let name = source
        .metadata
        .name
        .clone()
        .ok_or_else(|| Error::validation("source object has no name"))?;

    let mut labels = source.metadata.labels.clone().unwrap_or_default();
    labels.extend(reflection_labels());
    labels.insert(
        ORIGIN_CLUSTER_LABEL.to_string(),
        ctx.origin_cluster_id.clone(),
    );

    let mut annotations = source.metadata.annotations.clone().unwrap_or_default();
    annotations.remove("kubectl.kubernetes.io/last-applied-configuration");
    annotations.insert(SOURCE_NAME_ANNOTATION.to_string(), name.clone());
    if let Some(ns) = &source.metadata.namespace {
        annotations.insert(SOURCE_NAMESPACE_ANNOTATION.to_string(), ns.clone());
    }
    if let Some(uid) = &source.metadata.uid {
        annotations.insert(SOURCE_UID_ANNOTATION.to_string(), uid.clone());
    }

    Ok(ObjectMeta {
        name: Some(name),
        namespace: source
            .metadata
            .namespace
            .as_deref()
            .map(|ns| ctx.namespaces.target(ns).to_string()),
        labels: Some(labels),
        annotations: Some(annotations),
        ..Default::default()
    })
}

/// Default forge: copy the payload, drop status, rebuild metadata
pub fn forge_mirror(
    source: &DynamicObject,
    ctx: &ForgeContext,
) -> Result<Option<DynamicObject>, Error> {
    let mut data = source.data.clone();
    if let Some(obj) = data.as_object_mut() {
        for field in SERVER_OWNED_FIELDS {
            obj.remove(*field);
        }
    }

    Ok(Some(DynamicObject {
        types: source.types.clone(),
        metadata: mirror_metadata(source, ctx)?,
        data,
    }))
}

/// Secrets: service-account tokens are minted per cluster and never reflected
fn forge_secret(
    source: &DynamicObject,
    ctx: &ForgeContext,
) -> Result<Option<DynamicObject>, Error> {
    let is_sa_token = source
        .data
        .get("type")
        .and_then(|t| t.as_str())
        .map(|t| t == "kubernetes.io/service-account-token")
        .unwrap_or(false);
    if is_sa_token {
        return Ok(None);
    }
    forge_mirror(source, ctx)
}
