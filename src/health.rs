use std::path::Path;
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde::Serialize;

use crate::config::Config;

// ---------------------------------------------------------------------------
// Response types
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: HealthStatus,
    pub checks: HealthChecks,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Ok,
    Degraded,
    Unhealthy,
}

#[derive(Debug, Serialize)]
pub struct HealthChecks {
    pub store: CheckResult,
    pub sites: CheckResult,
    pub work: CheckResult,
}

#[derive(Debug, Serialize)]
pub struct CheckResult {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl CheckResult {
    fn healthy() -> Self {
        Self {
            ok: true,
            detail: None,
        }
    }

    fn unhealthy(detail: impl Into<String>) -> Self {
        Self {
            ok: false,
            detail: Some(detail.into()),
        }
    }
}

/// Minimal subset of `AppState` required by the health-check handler.
#[derive(Clone)]
pub struct HealthState {
    pub config: Arc<Config>,
}

// ---------------------------------------------------------------------------
// Individual checks
// ---------------------------------------------------------------------------

/// `path` must be a directory we can list.
async fn check_dir(path: &Path) -> CheckResult {
    match tokio::fs::metadata(path).await {
        Ok(meta) if meta.is_dir() => match tokio::fs::read_dir(path).await {
            Ok(_) => CheckResult::healthy(),
            Err(e) => CheckResult::unhealthy(format!("{} is not readable: {e}", path.display())),
        },
        Ok(_) => CheckResult::unhealthy(format!("{} is not a directory", path.display())),
        Err(e) => CheckResult::unhealthy(format!("{}: {e}", path.display())),
    }
}

// ---------------------------------------------------------------------------
// Aggregate status
// ---------------------------------------------------------------------------

fn aggregate_status(checks: &HealthChecks) -> HealthStatus {
    let all_ok = checks.store.ok && checks.sites.ok && checks.work.ok;
    // Without the store no push can be served; pages problems only affect
    // deployments.
    let any_critical = !checks.store.ok;

    if all_ok {
        HealthStatus::Ok
    } else if any_critical {
        HealthStatus::Unhealthy
    } else {
        HealthStatus::Degraded
    }
}

pub async fn evaluate(config: &Config) -> HealthResponse {
    let (store, sites, work) = tokio::join!(
        check_dir(&config.store.root),
        check_dir(&config.pages.sites_root),
        check_dir(&config.pages.work_root),
    );

    let checks = HealthChecks { store, sites, work };
    let status = aggregate_status(&checks);
    HealthResponse { status, checks }
}

// ---------------------------------------------------------------------------
// Axum handler
// ---------------------------------------------------------------------------

/// `GET /healthz` handler.  Returns 200 on Ok/Degraded, 503 on Unhealthy.
pub async fn health_handler(State(state): State<HealthState>) -> impl IntoResponse {
    let body = evaluate(&state.config).await;

    let http_status = match body.status {
        HealthStatus::Ok | HealthStatus::Degraded => StatusCode::OK,
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };

    (http_status, Json(body))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(root: &Path) -> Config {
        let yaml = format!(
            "store:\n  root: {root}/repos\npages:\n  work_root: {root}/work\n  sites_root: {root}/sites\n",
            root = root.display()
        );
        serde_yaml::from_str(&yaml).unwrap()
    }

    #[tokio::test]
    async fn all_directories_present_is_ok() {
        let tmp = tempfile::tempdir().unwrap();
        for dir in ["repos", "work", "sites"] {
            std::fs::create_dir(tmp.path().join(dir)).unwrap();
        }

        let health = evaluate(&config(tmp.path())).await;
        assert_eq!(health.status, HealthStatus::Ok);
    }

    #[tokio::test]
    async fn missing_sites_root_is_degraded() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::create_dir(tmp.path().join("repos")).unwrap();
        std::fs::create_dir(tmp.path().join("work")).unwrap();

        let health = evaluate(&config(tmp.path())).await;
        assert_eq!(health.status, HealthStatus::Degraded);
        assert!(!health.checks.sites.ok);
    }

    #[tokio::test]
    async fn missing_store_is_unhealthy() {
        let tmp = tempfile::tempdir().unwrap();
        let health = evaluate(&config(tmp.path())).await;
        assert_eq!(health.status, HealthStatus::Unhealthy);

        let body = serde_json::to_value(&health).unwrap();
        assert_eq!(body["status"], "unhealthy");
        assert!(body["checks"]["store"]["detail"].is_string());
    }
}
