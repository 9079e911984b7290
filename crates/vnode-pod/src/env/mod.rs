//! Container environment resolution
//!
//! Providers receive pods with every container's environment fully
//! materialized: `envFrom` sources expanded, `valueFrom` references read,
//! downward API fields substituted, service link variables added and
//! `$(VAR)` references expanded. Failures to read mandatory sources fail the
//! reconcile; optional sources that are missing are skipped with a warning
//! event on the pod.

pub mod expand;
pub mod service_links;

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{
    ConfigMap, ConfigMapKeySelector, Container, EnvVar, EnvVarSource, Pod, Secret,
    SecretKeySelector, Service,
};
use kube::api::{Api, ListParams};
use kube::runtime::events::EventType;
use kube::{Client, Resource};
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use vnode_common::events::{actions, reasons, EventPublisher};
use vnode_common::kube_utils::meta_key;
use vnode_common::{Error, Result};

use self::expand::{expand, is_env_var_name};
use self::service_links::{service_env, visible_services, MASTER_SERVICE_NAMESPACE};

/// Cluster objects environment resolution reads
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClusterResources: Send + Sync {
    /// ConfigMap by name, `None` if it does not exist
    async fn config_map(&self, namespace: &str, name: &str) -> Result<Option<ConfigMap>>;

    /// Secret by name, `None` if it does not exist
    async fn secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>>;

    /// Services in a namespace
    async fn services(&self, namespace: &str) -> Result<Vec<Service>>;
}

/// [`ClusterResources`] backed by kube-rs
pub struct KubeClusterResources {
    client: Client,
}

impl KubeClusterResources {
    /// Read cluster objects through `client`
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ClusterResources for KubeClusterResources {
    async fn config_map(&self, namespace: &str, name: &str) -> Result<Option<ConfigMap>> {
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn services(&self, namespace: &str) -> Result<Vec<Service>> {
        let api: Api<Service> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.list(&ListParams::default()).await?.items)
    }
}

/// Ordered variables where redefining a name replaces the earlier entry
#[derive(Default)]
struct EnvList {
    vars: Vec<(String, String)>,
}

impl EnvList {
    fn set(&mut self, name: String, value: String) {
        self.vars.retain(|(k, _)| *k != name);
        self.vars.push((name, value));
    }

    fn get(&self, name: &str) -> Option<&str> {
        self.vars
            .iter()
            .rev()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }
}

/// Objects fetched while resolving one pod
#[derive(Default)]
struct Lookups {
    config_maps: HashMap<String, Option<ConfigMap>>,
    secrets: HashMap<String, Option<Secret>>,
    invalid: BTreeSet<String>,
}

/// Materializes container environments before pods reach the provider
pub struct EnvResolver {
    resources: Arc<dyn ClusterResources>,
    events: Arc<dyn EventPublisher>,
}

impl EnvResolver {
    /// Resolver reading from `resources` and reporting through `events`
    pub fn new(resources: Arc<dyn ClusterResources>, events: Arc<dyn EventPublisher>) -> Self {
        Self { resources, events }
    }

    /// Copy of `pod` with every container's `env` resolved and `envFrom` cleared
    pub async fn resolve(&self, pod: &Pod) -> Result<Pod> {
        let mut resolved = pod.clone();
        let Some(spec) = resolved.spec.as_mut() else {
            return Ok(resolved);
        };

        let services = self.service_env(pod).await?;
        let mut lookups = Lookups::default();
        for container in spec
            .init_containers
            .iter_mut()
            .flatten()
            .chain(spec.containers.iter_mut())
        {
            let env = self.container_env(pod, container, &services, &mut lookups).await?;
            container.env = (!env.is_empty()).then_some(env);
            container.env_from = None;
        }

        if !lookups.invalid.is_empty() {
            let keys: Vec<&str> = lookups.invalid.iter().map(String::as_str).collect();
            self.warn(
                pod,
                reasons::INVALID_ENVIRONMENT_VARIABLE_NAMES,
                format!(
                    "Keys [{}] from envFrom sources were skipped since they are considered invalid environment variable names",
                    keys.join(", ")
                ),
            )
            .await;
        }
        Ok(resolved)
    }

    async fn service_env(&self, pod: &Pod) -> Result<Vec<(String, String)>> {
        let namespace = pod.metadata.namespace.as_deref().unwrap_or("default");
        let links = pod
            .spec
            .as_ref()
            .and_then(|s| s.enable_service_links)
            .unwrap_or(true);

        let mut services = self.resources.services(MASTER_SERVICE_NAMESPACE).await?;
        if links && namespace != MASTER_SERVICE_NAMESPACE {
            services.extend(self.resources.services(namespace).await?);
        }
        Ok(service_env(&visible_services(&services, namespace, links)))
    }

    async fn container_env(
        &self,
        pod: &Pod,
        container: &Container,
        services: &[(String, String)],
        lookups: &mut Lookups,
    ) -> Result<Vec<EnvVar>> {
        let mut env = EnvList::default();

        for source in container.env_from.iter().flatten() {
            let prefix = source.prefix.as_deref().unwrap_or_default();
            let mut data: Vec<(String, String)> = Vec::new();

            if let Some(cm_ref) = &source.config_map_ref {
                let optional = cm_ref.optional.unwrap_or(false);
                match self.config_map(pod, &cm_ref.name, optional, lookups).await? {
                    Some(cm) => data.extend(cm.data.unwrap_or_default()),
                    None => continue,
                }
            }
            if let Some(secret_ref) = &source.secret_ref {
                let optional = secret_ref.optional.unwrap_or(false);
                match self.secret(pod, &secret_ref.name, optional, lookups).await? {
                    Some(secret) => data.extend(secret_strings(&secret)),
                    None => continue,
                }
            }

            for (key, value) in data {
                let name = format!("{}{}", prefix, key);
                if !is_env_var_name(&name) {
                    lookups.invalid.insert(name);
                    continue;
                }
                env.set(name, value);
            }
        }

        for var in container.env.iter().flatten() {
            let value = match &var.value_from {
                Some(source) => match self.value_from(pod, source, lookups).await? {
                    Some(value) => value,
                    None => continue,
                },
                None => {
                    let raw = var.value.as_deref().unwrap_or_default();
                    expand(raw, |name| {
                        env.get(name)
                            .or_else(|| lookup(services, name))
                            .map(str::to_string)
                    })
                }
            };
            env.set(var.name.clone(), value);
        }

        let mut resolved: Vec<EnvVar> = services
            .iter()
            .filter(|(name, _)| env.get(name).is_none())
            .map(|(name, value)| env_var(name, value))
            .collect();
        resolved.extend(env.vars.iter().map(|(name, value)| env_var(name, value)));
        Ok(resolved)
    }

    async fn value_from(
        &self,
        pod: &Pod,
        source: &EnvVarSource,
        lookups: &mut Lookups,
    ) -> Result<Option<String>> {
        if let Some(selector) = &source.config_map_key_ref {
            return self.config_map_key(pod, selector, lookups).await;
        }
        if let Some(selector) = &source.secret_key_ref {
            return self.secret_key(pod, selector, lookups).await;
        }
        if let Some(field) = &source.field_ref {
            return match downward_field(pod, &field.field_path) {
                Some(value) => Ok(Some(value)),
                None => Err(Error::environment(
                    meta_key(&pod.metadata),
                    format!("unsupported fieldPath {:?}", field.field_path),
                )),
            };
        }
        if source.resource_field_ref.is_some() {
            debug!(pod = %meta_key(&pod.metadata), "Ignoring resourceFieldRef environment variable");
        }
        Ok(None)
    }

    async fn config_map_key(
        &self,
        pod: &Pod,
        selector: &ConfigMapKeySelector,
        lookups: &mut Lookups,
    ) -> Result<Option<String>> {
        let optional = selector.optional.unwrap_or(false);
        let Some(cm) = self.config_map(pod, &selector.name, optional, lookups).await? else {
            return Ok(None);
        };
        if let Some(value) = cm.data.as_ref().and_then(|d| d.get(&selector.key)) {
            return Ok(Some(value.clone()));
        }

        let note = format!(
            "Couldn't find key {} in configmap {}/{}",
            selector.key,
            pod.metadata.namespace.as_deref().unwrap_or_default(),
            selector.name
        );
        if optional {
            self.warn(pod, reasons::OPTIONAL_CONFIGMAP_KEY_NOT_FOUND, note).await;
            return Ok(None);
        }
        self.warn(pod, reasons::MANDATORY_CONFIGMAP_KEY_NOT_FOUND, note.clone())
            .await;
        Err(Error::environment(meta_key(&pod.metadata), note))
    }

    async fn secret_key(
        &self,
        pod: &Pod,
        selector: &SecretKeySelector,
        lookups: &mut Lookups,
    ) -> Result<Option<String>> {
        let optional = selector.optional.unwrap_or(false);
        let Some(secret) = self.secret(pod, &selector.name, optional, lookups).await? else {
            return Ok(None);
        };
        if let Some(value) = secret_strings(&secret)
            .into_iter()
            .find(|(k, _)| *k == selector.key)
            .map(|(_, v)| v)
        {
            return Ok(Some(value));
        }

        let note = format!(
            "Couldn't find key {} in secret {}/{}",
            selector.key,
            pod.metadata.namespace.as_deref().unwrap_or_default(),
            selector.name
        );
        if optional {
            self.warn(pod, reasons::OPTIONAL_SECRET_KEY_NOT_FOUND, note).await;
            return Ok(None);
        }
        self.warn(pod, reasons::MANDATORY_SECRET_KEY_NOT_FOUND, note.clone())
            .await;
        Err(Error::environment(meta_key(&pod.metadata), note))
    }

    /// Fetch a ConfigMap once per pod; `None` means an optional one is missing
    async fn config_map(
        &self,
        pod: &Pod,
        name: &str,
        optional: bool,
        lookups: &mut Lookups,
    ) -> Result<Option<ConfigMap>> {
        let namespace = pod.metadata.namespace.as_deref().unwrap_or("default");
        let cached = lookups.config_maps.get(name).cloned();
        let found = match cached {
            Some(cached) => cached,
            None => match self.resources.config_map(namespace, name).await {
                Ok(found) => {
                    lookups.config_maps.insert(name.to_string(), found.clone());
                    found
                }
                Err(e) => {
                    let note = format!("Failed to read configmap {}/{}: {}", namespace, name, e);
                    if !optional {
                        self.warn(pod, reasons::FAILED_TO_READ_MANDATORY_CONFIGMAP, note.clone())
                            .await;
                    }
                    return Err(Error::environment(meta_key(&pod.metadata), note));
                }
            },
        };

        match found {
            Some(cm) => Ok(Some(cm)),
            None if optional => {
                let note = format!("Skipping optional configmap {}/{} that was not found", namespace, name);
                self.warn(pod, reasons::OPTIONAL_CONFIGMAP_NOT_FOUND, note).await;
                Ok(None)
            }
            None => {
                let note = format!("configmap {}/{} not found", namespace, name);
                self.warn(pod, reasons::MANDATORY_CONFIGMAP_NOT_FOUND, note.clone())
                    .await;
                Err(Error::environment(meta_key(&pod.metadata), note))
            }
        }
    }

    /// Fetch a Secret once per pod; `None` means an optional one is missing
    async fn secret(
        &self,
        pod: &Pod,
        name: &str,
        optional: bool,
        lookups: &mut Lookups,
    ) -> Result<Option<Secret>> {
        let namespace = pod.metadata.namespace.as_deref().unwrap_or("default");
        let cached = lookups.secrets.get(name).cloned();
        let found = match cached {
            Some(cached) => cached,
            None => match self.resources.secret(namespace, name).await {
                Ok(found) => {
                    lookups.secrets.insert(name.to_string(), found.clone());
                    found
                }
                Err(e) => {
                    let note = format!("Failed to read secret {}/{}: {}", namespace, name, e);
                    if !optional {
                        self.warn(pod, reasons::FAILED_TO_READ_MANDATORY_SECRET, note.clone())
                            .await;
                    }
                    return Err(Error::environment(meta_key(&pod.metadata), note));
                }
            },
        };

        match found {
            Some(secret) => Ok(Some(secret)),
            None if optional => {
                let note = format!("Skipping optional secret {}/{} that was not found", namespace, name);
                self.warn(pod, reasons::OPTIONAL_SECRET_NOT_FOUND, note).await;
                Ok(None)
            }
            None => {
                let note = format!("secret {}/{} not found", namespace, name);
                self.warn(pod, reasons::MANDATORY_SECRET_NOT_FOUND, note.clone())
                    .await;
                Err(Error::environment(meta_key(&pod.metadata), note))
            }
        }
    }

    async fn warn(&self, pod: &Pod, reason: &str, note: String) {
        self.events
            .publish(
                &pod.object_ref(&()),
                EventType::Warning,
                reason,
                actions::RESOLVE_ENVIRONMENT,
                Some(note),
            )
            .await;
    }
}

fn env_var(name: &str, value: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value.to_string()),
        value_from: None,
    }
}

fn lookup<'a>(vars: &'a [(String, String)], name: &str) -> Option<&'a str> {
    vars.iter()
        .find(|(k, _)| k == name)
        .map(|(_, v)| v.as_str())
}

/// Secret data as strings; `stringData` wins over `data` for the same key
fn secret_strings(secret: &Secret) -> Vec<(String, String)> {
    let mut out: Vec<(String, String)> = secret
        .data
        .iter()
        .flatten()
        .map(|(k, v)| (k.clone(), String::from_utf8_lossy(&v.0).into_owned()))
        .collect();
    for (k, v) in secret.string_data.iter().flatten() {
        out.retain(|(existing, _)| existing != k);
        out.push((k.clone(), v.clone()));
    }
    out
}

/// Value of a downward API field, `None` for unsupported paths
fn downward_field(pod: &Pod, path: &str) -> Option<String> {
    let meta = &pod.metadata;
    let spec = pod.spec.as_ref();
    let status = pod.status.as_ref();
    let text = |v: Option<&String>| v.cloned().unwrap_or_default();

    let value = match path {
        "metadata.name" => text(meta.name.as_ref()),
        "metadata.namespace" => text(meta.namespace.as_ref()),
        "metadata.uid" => text(meta.uid.as_ref()),
        "metadata.labels" => format_map(meta.labels.as_ref()),
        "metadata.annotations" => format_map(meta.annotations.as_ref()),
        "spec.nodeName" => text(spec.and_then(|s| s.node_name.as_ref())),
        "spec.serviceAccountName" => text(spec.and_then(|s| s.service_account_name.as_ref())),
        "status.podIP" => text(status.and_then(|s| s.pod_ip.as_ref())),
        "status.hostIP" => text(status.and_then(|s| s.host_ip.as_ref())),
        _ => {
            if let Some(key) = subscript(path, "metadata.labels") {
                text(meta.labels.as_ref().and_then(|l| l.get(key)))
            } else if let Some(key) = subscript(path, "metadata.annotations") {
                text(meta.annotations.as_ref().and_then(|a| a.get(key)))
            } else {
                return None;
            }
        }
    };
    Some(value)
}

/// Key in `field['key']`
fn subscript<'a>(path: &'a str, field: &str) -> Option<&'a str> {
    path.strip_prefix(field)?
        .strip_prefix("['")?
        .strip_suffix("']")
}

/// `key="value"` lines, sorted by key
fn format_map(map: Option<&std::collections::BTreeMap<String, String>>) -> String {
    map.into_iter()
        .flatten()
        .map(|(k, v)| format!("{}={:?}", k, v))
        .collect::<Vec<_>>()
        .join("\n")
}
