//! Shared Kubernetes utilities using kube-rs
//!
//! Error taxonomy predicates, object key helpers, and client construction.

use std::time::Duration;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};

use crate::Error;

// =============================================================================
// Error taxonomy
// =============================================================================
//
// The API server reports failures as Status objects. kube-rs surfaces them as
// `kube::Error::Api(ErrorResponse)` carrying the HTTP code and the machine
// readable reason. Everything else (connection resets, TLS, timeouts) is a
// transport failure and is always worth retrying.
// =============================================================================

/// Reason reported with a 409 when a create hits an existing object
pub const REASON_ALREADY_EXISTS: &str = "AlreadyExists";
/// Reason reported with a 409 when an optimistic-lock precondition fails
pub const REASON_CONFLICT: &str = "Conflict";
/// Reason reported with a 404
pub const REASON_NOT_FOUND: &str = "NotFound";
/// Reason reported with a 422
pub const REASON_INVALID: &str = "Invalid";

/// Build a `kube::Error::Api` value
///
/// Used by in-memory API fakes and by code that needs to synthesize an API
/// failure with the same shape the server would return.
pub fn api_error(code: u16, reason: &str, message: &str) -> kube::Error {
    kube::Error::Api(kube::error::ErrorResponse {
        status: "Failure".to_string(),
        message: message.to_string(),
        reason: reason.to_string(),
        code,
    })
}

fn api_response(err: &kube::Error) -> Option<&kube::error::ErrorResponse> {
    match err {
        kube::Error::Api(resp) => Some(resp),
        _ => None,
    }
}

/// The object (or the resource type) does not exist
pub fn is_not_found(err: &kube::Error) -> bool {
    api_response(err).is_some_and(|r| r.code == 404)
}

/// A create hit an object that already exists
pub fn is_already_exists(err: &kube::Error) -> bool {
    api_response(err).is_some_and(|r| r.code == 409 && r.reason == REASON_ALREADY_EXISTS)
}

/// An update lost an optimistic-lock race (stale resourceVersion or UID precondition)
pub fn is_conflict(err: &kube::Error) -> bool {
    api_response(err).is_some_and(|r| r.code == 409 && r.reason != REASON_ALREADY_EXISTS)
}

/// The request body was rejected by validation
pub fn is_invalid(err: &kube::Error) -> bool {
    api_response(err).is_some_and(|r| r.code == 422 || (r.code == 400 && r.reason == "BadRequest"))
}

/// The failure is likely to go away on its own
///
/// Transport failures, throttling, server errors and optimistic-lock
/// conflicts are transient. Other 4xx responses are not.
pub fn is_transient(err: &kube::Error) -> bool {
    match api_response(err) {
        Some(r) if r.code == 409 => r.reason != REASON_ALREADY_EXISTS,
        Some(r) => r.code == 408 || r.code == 429 || r.code >= 500,
        None => true,
    }
}

/// Delay the server asked us to wait before retrying, if any
///
/// The API server answers 429 (and 503/504 for server timeouts) when it
/// wants clients to back off. kube-rs does not expose `retryAfterSeconds`,
/// so a one second floor is used.
pub fn suggested_backoff(err: &kube::Error) -> Option<Duration> {
    match api_response(err) {
        Some(r) if r.code == 429 => Some(Duration::from_secs(1)),
        Some(r) if (r.code == 503 || r.code == 504) && r.reason != "InternalError" => {
            Some(Duration::from_secs(1))
        }
        _ => None,
    }
}

// =============================================================================
// Object keys
// =============================================================================

/// Queue key for a namespaced object: `namespace/name`
pub fn object_key(namespace: &str, name: &str) -> String {
    if namespace.is_empty() {
        name.to_string()
    } else {
        format!("{}/{}", namespace, name)
    }
}

/// Queue key for an object's metadata
pub fn meta_key(meta: &ObjectMeta) -> String {
    object_key(
        meta.namespace.as_deref().unwrap_or_default(),
        meta.name.as_deref().unwrap_or_default(),
    )
}

/// Split a `namespace/name` key
///
/// A key without a slash is a cluster-scoped name with an empty namespace.
pub fn split_key(key: &str) -> Result<(String, String), Error> {
    let parts: Vec<&str> = key.split('/').collect();
    match parts.as_slice() {
        [name] if !name.is_empty() => Ok((String::new(), name.to_string())),
        [ns, name] if !name.is_empty() => Ok((ns.to_string(), name.to_string())),
        _ => Err(Error::invalid_input(format!("unexpected key format: {:?}", key))),
    }
}

/// Deletion-tracking key: `namespace/name/uid`
///
/// Includes the UID so a re-created object with the same name is never
/// confused with its predecessor.
pub fn uid_key(namespace: &str, name: &str, uid: &str) -> String {
    format!("{}/{}/{}", namespace, name, uid)
}

/// Split a `namespace/name/uid` key
pub fn split_uid_key(key: &str) -> Result<(String, String, String), Error> {
    let parts: Vec<&str> = key.split('/').collect();
    match parts.as_slice() {
        [ns, name, uid] if !name.is_empty() && !uid.is_empty() => {
            Ok((ns.to_string(), name.to_string(), uid.to_string()))
        }
        _ => Err(Error::invalid_input(format!(
            "unexpected deletion key format: {:?}",
            key
        ))),
    }
}

// =============================================================================
// Client construction
// =============================================================================

/// Default connection timeout for kube clients
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
/// Default read timeout for kube clients
///
/// Watches are opened with a server-side timeout below this value.
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Create a kube client with default timeouts, from the in-cluster or
/// current kubeconfig context, or from a named kubeconfig context
pub async fn create_client(context: Option<&str>) -> Result<Client, Error> {
    create_client_with_timeout(context, DEFAULT_CONNECT_TIMEOUT, DEFAULT_READ_TIMEOUT).await
}

/// Create a kube client with custom timeouts
pub async fn create_client_with_timeout(
    context: Option<&str>,
    connect_timeout: Duration,
    read_timeout: Duration,
) -> Result<Client, Error> {
    let mut config = match context {
        Some(context) => {
            let kubeconfig = Kubeconfig::read().map_err(|e| {
                Error::internal_with_context(
                    "create_client",
                    format!("failed to read kubeconfig: {}", e),
                )
            })?;
            let options = KubeConfigOptions {
                context: Some(context.to_string()),
                ..Default::default()
            };
            Config::from_custom_kubeconfig(kubeconfig, &options)
                .await
                .map_err(|e| {
                    Error::internal_with_context(
                        "create_client",
                        format!("failed to load context {}: {}", context, e),
                    )
                })?
        }
        None => Config::infer().await.map_err(|e| {
            Error::internal_with_context("create_client", format!("failed to infer config: {}", e))
        })?,
    };
    config.connect_timeout = Some(connect_timeout);
    config.read_timeout = Some(read_timeout);
    Client::try_from(config).map_err(|e| {
        Error::internal_with_context("create_client", format!("failed to create client: {}", e))
    })
}
