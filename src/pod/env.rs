//! Environment resolution before pods are handed to the provider
//!
//! The provider runs pods outside the local cluster, where the referenced
//! ConfigMaps, Secrets and downward-API fields are not available. Every
//! `valueFrom` and `envFrom` source is therefore resolved to literal values,
//! and `$(VAR)` references are expanded the way the kubelet does.

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{ConfigMap, Container, EnvVar, ObjectFieldSelector, Pod, Secret};
use kube::api::Api;
use kube::Client;
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use crate::Error;

/// Source of ConfigMap and Secret data in the local cluster
#[cfg_attr(test, automock)]
#[async_trait]
pub trait EnvSource: Send + Sync {
    /// Data of a ConfigMap, `None` if it does not exist
    async fn config_map(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<BTreeMap<String, String>>, Error>;

    /// Decoded data of a Secret, `None` if it does not exist
    async fn secret(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<BTreeMap<String, String>>, Error>;
}

/// Reads ConfigMaps and Secrets from the API server
pub struct KubeEnvSource {
    client: Client,
}

impl KubeEnvSource {
    /// Create a source backed by `client`
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl EnvSource for KubeEnvSource {
    async fn config_map(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<BTreeMap<String, String>>, Error> {
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?.map(|cm| cm.data.unwrap_or_default()))
    }

    async fn secret(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<BTreeMap<String, String>>, Error> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        let Some(secret) = api.get_opt(name).await? else {
            return Ok(None);
        };
        let mut data = secret.string_data.unwrap_or_default();
        for (key, value) in secret.data.unwrap_or_default() {
            let value = String::from_utf8(value.0).map_err(|_| {
                Error::validation(format!("secret {namespace}/{name} key {key} is not UTF-8"))
            })?;
            data.insert(key, value);
        }
        Ok(Some(data))
    }
}

/// Expand `$(VAR)` references in `input` against `vars`.
///
/// `$$` is an escaped `$`, so `$$(VAR)` yields the literal `$(VAR)`.
/// References to undefined variables are left untouched.
pub fn expand_references(input: &str, vars: &BTreeMap<String, String>) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(pos) = rest.find('$') {
        out.push_str(&rest[..pos]);
        let after = &rest[pos + 1..];

        if let Some(tail) = after.strip_prefix('$') {
            out.push('$');
            rest = tail;
        } else if let Some(body) = after.strip_prefix('(') {
            match body.find(')') {
                Some(end) => {
                    let name = &body[..end];
                    match vars.get(name) {
                        Some(value) => out.push_str(value),
                        None => {
                            out.push_str("$(");
                            out.push_str(name);
                            out.push(')');
                        }
                    }
                    rest = &body[end + 1..];
                }
                None => {
                    out.push('$');
                    rest = after;
                }
            }
        } else {
            out.push('$');
            rest = after;
        }
    }
    out.push_str(rest);
    out
}

fn field_value(pod: &Pod, selector: &ObjectFieldSelector) -> Result<Option<String>, Error> {
    let path = selector.field_path.as_str();
    let meta = &pod.metadata;
    let spec = pod.spec.as_ref();
    let status = pod.status.as_ref();

    let value = match path {
        "metadata.name" => meta.name.clone(),
        "metadata.namespace" => meta.namespace.clone(),
        "metadata.uid" => meta.uid.clone(),
        "spec.nodeName" => spec.and_then(|s| s.node_name.clone()),
        "spec.serviceAccountName" => spec.and_then(|s| s.service_account_name.clone()),
        "status.hostIP" => status.and_then(|s| s.host_ip.clone()),
        "status.podIP" => status.and_then(|s| s.pod_ip.clone()),
        _ => {
            let lookup = |prefix: &str, map: Option<&BTreeMap<String, String>>| {
                path.strip_prefix(prefix)
                    .and_then(|p| p.strip_suffix("']"))
                    .map(|key| map.and_then(|m| m.get(key).cloned()))
            };
            match lookup("metadata.labels['", meta.labels.as_ref())
                .or_else(|| lookup("metadata.annotations['", meta.annotations.as_ref()))
            {
                Some(value) => value,
                None => {
                    return Err(Error::validation(format!(
                        "unsupported fieldRef path {path:?}"
                    )))
                }
            }
        }
    };
    Ok(value)
}

async fn resolve_container(
    pod: &Pod,
    namespace: &str,
    container: &mut Container,
    source: &dyn EnvSource,
) -> Result<(), Error> {
    let mut vars: BTreeMap<String, String> = BTreeMap::new();
    let mut resolved: Vec<EnvVar> = Vec::new();

    for env_from in container.env_from.take().unwrap_or_default() {
        let prefix = env_from.prefix.unwrap_or_default();
        let (data, optional, kind, name) = if let Some(cm) = env_from.config_map_ref {
            let data = source.config_map(namespace, &cm.name).await?;
            (data, cm.optional.unwrap_or(false), "configmap", cm.name)
        } else if let Some(secret) = env_from.secret_ref {
            let data = source.secret(namespace, &secret.name).await?;
            (data, secret.optional.unwrap_or(false), "secret", secret.name)
        } else {
            continue;
        };

        match data {
            Some(data) => {
                for (key, value) in data {
                    let var = format!("{prefix}{key}");
                    vars.insert(var.clone(), value.clone());
                    resolved.retain(|e| e.name != var);
                    resolved.push(EnvVar {
                        name: var,
                        value: Some(value),
                        value_from: None,
                    });
                }
            }
            None if optional => debug!(%kind, %name, "Optional envFrom source missing"),
            None => {
                return Err(Error::validation(format!(
                    "{kind} {namespace}/{name} referenced by envFrom not found"
                )))
            }
        }
    }

    for mut var in container.env.take().unwrap_or_default() {
        let value = if let Some(value) = var.value.take() {
            Some(expand_references(&value, &vars))
        } else if let Some(from) = var.value_from.take() {
            if let Some(key_ref) = from.config_map_key_ref {
                let data = source.config_map(namespace, &key_ref.name).await?;
                let value = data.and_then(|d| d.get(&key_ref.key).cloned());
                if value.is_none() && !key_ref.optional.unwrap_or(false) {
                    return Err(Error::validation(format!(
                        "env {}: key {} of configmap {namespace}/{} not found",
                        var.name, key_ref.key, key_ref.name
                    )));
                }
                value
            } else if let Some(key_ref) = from.secret_key_ref {
                let data = source.secret(namespace, &key_ref.name).await?;
                let value = data.and_then(|d| d.get(&key_ref.key).cloned());
                if value.is_none() && !key_ref.optional.unwrap_or(false) {
                    return Err(Error::validation(format!(
                        "env {}: key {} of secret {namespace}/{} not found",
                        var.name, key_ref.key, key_ref.name
                    )));
                }
                value
            } else if let Some(field_ref) = from.field_ref {
                field_value(pod, &field_ref)?
            } else {
                // resourceFieldRef is evaluated where the pod runs
                var.value_from = Some(from);
                resolved.retain(|e| e.name != var.name);
                resolved.push(var);
                continue;
            }
        } else {
            Some(String::new())
        };

        let Some(value) = value else {
            // Missing optional reference: the variable is not set
            continue;
        };
        vars.insert(var.name.clone(), value.clone());
        resolved.retain(|e| e.name != var.name);
        resolved.push(EnvVar {
            name: var.name,
            value: Some(value),
            value_from: None,
        });
    }

    if !resolved.is_empty() {
        container.env = Some(resolved);
    }
    for list in [&mut container.command, &mut container.args] {
        if let Some(items) = list {
            for item in items.iter_mut() {
                *item = expand_references(item, &vars);
            }
        }
    }
    Ok(())
}

/// Resolve every environment source of `pod` to literal values, in place
pub async fn populate_environment_variables(
    pod: &mut Pod,
    source: &dyn EnvSource,
) -> Result<(), Error> {
    let namespace = pod.metadata.namespace.clone().unwrap_or_default();
    // fieldRefs read the pod as it was before resolution
    let snapshot = pod.clone();
    let Some(spec) = pod.spec.as_mut() else {
        return Ok(());
    };

    for container in spec
        .init_containers
        .iter_mut()
        .flatten()
        .chain(spec.containers.iter_mut())
    {
        resolve_container(&snapshot, &namespace, container, source).await?;
    }
    Ok(())
}
