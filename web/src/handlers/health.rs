//! Health check endpoints.
//!
//! These endpoints are used by load balancers and monitoring systems
//! to verify service health.

use axum::{extract::State, http::StatusCode, Json};
use serde::Serialize;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

/// Simple health check endpoint (for basic liveness).
///
/// Returns 200 OK to indicate the service is running.
/// This endpoint does NOT check dependencies (database, etc.).
///
/// # Endpoint
///
/// ```text
/// GET /health
/// ```
#[allow(clippy::unused_async)]
pub async fn health_check() -> (StatusCode, Json<HealthResponse>) {
    (
        StatusCode::OK,
        Json(HealthResponse {
            status: "ok",
            version: env!("CARGO_PKG_VERSION"),
        }),
    )
}

/// Liveness response body.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    /// Always `"ok"`
    pub status: &'static str,
    /// Crate version
    pub version: &'static str,
}

/// A dependency the service cannot serve traffic without.
pub trait ReadinessProbe: Send + Sync {
    /// Name reported in the readiness body.
    fn name(&self) -> &'static str;

    /// Resolve to `Ok(())` when the dependency answers.
    fn check(&self) -> Pin<Box<dyn Future<Output = Result<(), String>> + Send + '_>>;
}

/// Result of one probe.
#[derive(Debug, Serialize)]
pub struct ProbeResult {
    /// Probe name
    pub component: &'static str,
    /// Whether it answered
    pub healthy: bool,
    /// Failure detail
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Readiness response body.
#[derive(Debug, Serialize)]
pub struct ReadinessResponse {
    /// `true` only if every probe is healthy
    pub ready: bool,
    /// Individual probe results
    pub checks: Vec<ProbeResult>,
}

/// Readiness check endpoint.
///
/// Runs every probe; 200 when all pass, 503 otherwise.
///
/// ```text
/// GET /ready
/// ```
pub async fn readiness_check(
    State(probes): State<Arc<Vec<Arc<dyn ReadinessProbe>>>>,
) -> (StatusCode, Json<ReadinessResponse>) {
    let mut checks = Vec::with_capacity(probes.len());
    for probe in probes.iter() {
        let outcome = probe.check().await;
        if let Err(error) = &outcome {
            tracing::warn!(component = probe.name(), %error, "Readiness probe failed");
        }
        checks.push(ProbeResult {
            component: probe.name(),
            healthy: outcome.is_ok(),
            error: outcome.err(),
        });
    }

    let ready = checks.iter().all(|c| c.healthy);
    let status = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (status, Json(ReadinessResponse { ready, checks }))
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Flaky(bool);

    impl ReadinessProbe for Flaky {
        fn name(&self) -> &'static str {
            "database"
        }

        fn check(&self) -> Pin<Box<dyn Future<Output = Result<(), String>> + Send + '_>> {
            let up = self.0;
            Box::pin(async move {
                if up {
                    Ok(())
                } else {
                    Err("connection refused".to_string())
                }
            })
        }
    }

    #[tokio::test]
    async fn test_health_check() {
        let (status, body) = health_check().await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.status, "ok");
    }

    #[tokio::test]
    async fn test_readiness_reports_failures() {
        let probes: Vec<Arc<dyn ReadinessProbe>> = vec![Arc::new(Flaky(false))];
        let (status, body) = readiness_check(State(Arc::new(probes))).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert!(!body.ready);
        assert_eq!(body.checks[0].error.as_deref(), Some("connection refused"));
    }

    #[tokio::test]
    async fn test_readiness_ok() {
        let probes: Vec<Arc<dyn ReadinessProbe>> = vec![Arc::new(Flaky(true))];
        let (status, body) = readiness_check(State(Arc::new(probes))).await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.ready);
    }
}
