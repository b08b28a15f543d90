//! Shared Kubernetes utilities using kube-rs

use std::future::Future;
use std::path::Path;
use std::time::Duration;

use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::discovery::ApiResource;
use kube::{Client, Config};
use tracing::trace;

use crate::Error;

/// Default polling interval for wait operations
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Default connection timeout for kube clients
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
/// Default read timeout for kube clients
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(30);

/// True if the error is an API 404
pub fn is_not_found(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(ae) if ae.code == 404)
}

/// Poll until a condition is met or timeout is reached
///
/// Repeatedly calls `check_fn` until it returns `Ok(true)`. Retryable errors
/// from the check are logged and polling continues. A non-retryable error
/// (see [`Error::is_retryable`]) ends the loop and is returned as is. The
/// deadline ends the loop with a typed [`Error::Timeout`] naming `operation`.
pub async fn poll_until<F, Fut>(
    timeout: Duration,
    poll_interval: Duration,
    operation: impl Into<String>,
    mut check_fn: F,
) -> Result<(), Error>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<bool, Error>>,
{
    let start = tokio::time::Instant::now();
    let operation = operation.into();

    loop {
        match check_fn().await {
            Ok(true) => return Ok(()),
            Ok(false) => trace!(%operation, "condition not yet met"),
            Err(e) if e.is_retryable() => {
                trace!(%operation, error = %e, "polling check returned error (retrying)")
            }
            Err(e) => return Err(e),
        }

        if start.elapsed() >= timeout {
            return Err(Error::timeout(operation, timeout));
        }

        tokio::time::sleep(poll_interval).await;
    }
}

// =============================================================================
// HasApiResource Trait
// =============================================================================

/// Types whose API version and kind are known at compile time
///
/// Lets typed structs for third-party CRDs be read and written through
/// `DynamicObject` without hard-coding the `ApiResource` at each call site.
pub trait HasApiResource {
    /// Full API version (e.g., "velero.io/v1")
    const API_VERSION: &'static str;
    /// Resource kind (e.g., "BackupStorageLocation")
    const KIND: &'static str;

    /// Build an ApiResource from the type's constants.
    fn api_resource() -> ApiResource {
        build_api_resource(Self::API_VERSION, Self::KIND)
    }
}

/// Build an ApiResource from an apiVersion and kind
pub fn build_api_resource(api_version: &str, kind: &str) -> ApiResource {
    let (group, version) = match api_version.split_once('/') {
        Some((group, version)) => (group.to_string(), version.to_string()),
        None => (String::new(), api_version.to_string()),
    };
    ApiResource {
        group,
        version,
        kind: kind.to_string(),
        api_version: api_version.to_string(),
        plural: pluralize_kind(kind),
    }
}

/// Lowercase plural resource name for a kind
pub fn pluralize_kind(kind: &str) -> String {
    let lower = kind.to_lowercase();
    if lower.ends_with('s') || lower.ends_with("ch") || lower.ends_with("sh") {
        format!("{}es", lower)
    } else if lower.ends_with('y') && !lower.ends_with("ay") && !lower.ends_with("ey") {
        format!("{}ies", &lower[..lower.len() - 1])
    } else {
        format!("{}s", lower)
    }
}

/// Lowercase hex SHA-256 digest of `input`
pub fn sha256_hex(input: &[u8]) -> String {
    use aws_lc_rs::digest;
    to_hex(digest::digest(&digest::SHA256, input).as_ref())
}

/// Compute a deterministic hash of the input string, returning a 16-char hex digest.
///
/// Truncated SHA-256, stable across toolchains, for values persisted in
/// annotations.
pub fn deterministic_hash(input: &str) -> String {
    let full = sha256_hex(input.as_bytes());
    full[..16].to_string()
}

fn to_hex(bytes: &[u8]) -> String {
    bytes
        .iter()
        .fold(String::with_capacity(bytes.len() * 2), |mut s, b| {
            use std::fmt::Write;
            let _ = write!(s, "{:02x}", b);
            s
        })
}

/// Create a kube client from optional kubeconfig path with default timeouts
pub async fn create_client(kubeconfig: Option<&Path>) -> Result<Client, Error> {
    let mut config = match kubeconfig {
        Some(path) => {
            let kubeconfig = Kubeconfig::read_from(path).map_err(|e| {
                Error::internal_with_context(
                    "create_client",
                    format!("failed to read kubeconfig: {}", e),
                )
            })?;
            Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                .await
                .map_err(|e| {
                    Error::internal_with_context(
                        "create_client",
                        format!("failed to load kubeconfig: {}", e),
                    )
                })?
        }
        None => Config::infer().await.map_err(|e| {
            Error::internal_with_context("create_client", format!("failed to infer config: {}", e))
        })?,
    };
    config.connect_timeout = Some(DEFAULT_CONNECT_TIMEOUT);
    config.read_timeout = Some(DEFAULT_READ_TIMEOUT);
    Client::try_from(config).map_err(|e| {
        Error::internal_with_context("create_client", format!("failed to create client: {}", e))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[test]
    fn sha256_matches_known_vector() {
        assert_eq!(
            sha256_hex(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn deterministic_hash_is_short_and_stable() {
        let a = deterministic_hash("secret-data");
        assert_eq!(a.len(), 16);
        assert_eq!(a, deterministic_hash("secret-data"));
        assert_ne!(a, deterministic_hash("other-data"));
    }

    #[test]
    fn api_resource_from_constants() {
        struct Location;
        impl HasApiResource for Location {
            const API_VERSION: &'static str = "velero.io/v1";
            const KIND: &'static str = "BackupStorageLocation";
        }
        let ar = Location::api_resource();
        assert_eq!(ar.group, "velero.io");
        assert_eq!(ar.version, "v1");
        assert_eq!(ar.plural, "backupstoragelocations");

        assert_eq!(build_api_resource("v1", "ConfigMap").group, "");
        assert_eq!(pluralize_kind("Policy"), "policies");
    }

    #[test]
    fn not_found_detection() {
        let err = kube::Error::Api(kube::core::ErrorResponse {
            status: "Failure".to_string(),
            message: "not found".to_string(),
            reason: "NotFound".to_string(),
            code: 404,
        });
        assert!(is_not_found(&err));
    }

    #[tokio::test(start_paused = true)]
    async fn poll_until_returns_once_condition_holds() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let result = poll_until(
            Duration::from_secs(10),
            Duration::from_secs(1),
            "counter to reach 3",
            move || {
                let c = c.clone();
                async move { Ok(c.fetch_add(1, Ordering::SeqCst) + 1 >= 3) }
            },
        )
        .await;
        assert!(result.is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn poll_until_times_out_with_typed_error() {
        let result = poll_until(
            Duration::from_secs(3),
            Duration::from_secs(1),
            "never",
            || async { Ok(false) },
        )
        .await;
        match result {
            Err(Error::Timeout { operation, timeout }) => {
                assert_eq!(operation, "never");
                assert_eq!(timeout, Duration::from_secs(3));
            }
            other => panic!("expected timeout, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn poll_until_keeps_polling_through_errors() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let result = poll_until(
            Duration::from_secs(10),
            Duration::from_secs(1),
            "flaky",
            move || {
                let c = c.clone();
                async move {
                    if c.fetch_add(1, Ordering::SeqCst) == 0 {
                        Err(Error::internal("transient"))
                    } else {
                        Ok(true)
                    }
                }
            },
        )
        .await;
        assert!(result.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn poll_until_stops_on_permanent_error() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let result = poll_until(
            Duration::from_secs(10),
            Duration::from_secs(1),
            "forbidden",
            move || {
                let c = c.clone();
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Err::<bool, _>(Error::actionable("denied"))
                }
            },
        )
        .await;
        assert!(matches!(result, Err(Error::Actionable { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
