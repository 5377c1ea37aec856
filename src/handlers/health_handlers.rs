//! Health & readiness probes served over HTTP next to the session listener.
//!
//! - GET /healthz  -> liveness ("ok")
//! - GET /readyz   -> readiness: database reachable, schema applied, storage writable

use crate::services::storage_service::StorageService;
use axum::{Json, extract::State, http::StatusCode, response::IntoResponse};
use serde::Serialize;
use std::collections::BTreeMap;
use tokio::fs;
use uuid::Uuid;

/// `GET /healthz`. Never performs I/O.
pub async fn healthz() -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(HealthResponse {
            status: "ok".into(),
        }),
    )
}

/// `GET /readyz`
///
/// HTTP 200 when every check passes, 503 otherwise. The body reports each
/// check individually.
pub async fn readyz(State(service): State<StorageService>) -> impl IntoResponse {
    let mut checks = BTreeMap::new();
    checks.insert("sqlite", sqlite_check(&service).await);
    checks.insert("schema", schema_check(&service).await);
    checks.insert("disk", disk_check(&service).await);

    let overall_ok = checks.values().all(|c| c.ok);
    let status = if overall_ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    let body = ReadyResponse {
        status: if overall_ok { "ok" } else { "error" }.into(),
        checks,
    };
    (status, Json(body))
}

async fn sqlite_check(service: &StorageService) -> CheckStatus {
    match sqlx::query_scalar::<_, i64>("SELECT 1")
        .fetch_one(&*service.db)
        .await
    {
        Ok(1) => CheckStatus::pass(),
        Ok(v) => CheckStatus::fail(format!("unexpected result: {}", v)),
        Err(e) => CheckStatus::fail(format!("error: {}", e)),
    }
}

/// Every table the session handlers touch must exist.
async fn schema_check(service: &StorageService) -> CheckStatus {
    const TABLES: [&str; 6] = [
        "users",
        "public_keys",
        "feature_flags",
        "projects",
        "buckets",
        "objects",
    ];
    let found: Result<Vec<String>, _> =
        sqlx::query_scalar("SELECT name FROM sqlite_master WHERE type = 'table'")
            .fetch_all(&*service.db)
            .await;
    match found {
        Ok(names) => {
            let missing: Vec<&str> = TABLES
                .iter()
                .copied()
                .filter(|t| !names.iter().any(|n| n == t))
                .collect();
            if missing.is_empty() {
                CheckStatus::pass()
            } else {
                CheckStatus::fail(format!("missing tables: {} (run --migrate)", missing.join(", ")))
            }
        }
        Err(e) => CheckStatus::fail(format!("error: {}", e)),
    }
}

/// Write, read back and delete a temp file under the storage directory.
async fn disk_check(service: &StorageService) -> CheckStatus {
    let tmp_path = service
        .base_path
        .join(format!(".readyz-{}", Uuid::new_v4()));
    if let Err(e) = fs::write(&tmp_path, b"readyz").await {
        return CheckStatus::fail(format!("could not write tmp file: {}", e));
    }

    let status = match fs::read(&tmp_path).await {
        Ok(bytes) if bytes == b"readyz" => CheckStatus::pass(),
        Ok(_) => CheckStatus::fail("file content mismatch"),
        Err(e) => CheckStatus::fail(format!("could not read tmp file: {}", e)),
    };
    match fs::remove_file(&tmp_path).await {
        Err(e) if status.ok => CheckStatus {
            ok: true,
            error: Some(format!("could not remove tmp file: {}", e)),
        },
        _ => status,
    }
}

#[derive(Serialize)]
struct HealthResponse {
    status: String,
}

#[derive(Serialize)]
struct ReadyResponse {
    status: String,
    checks: BTreeMap<&'static str, CheckStatus>,
}

#[derive(Serialize, Debug)]
struct CheckStatus {
    ok: bool,
    error: Option<String>,
}

impl CheckStatus {
    fn pass() -> Self {
        Self {
            ok: true,
            error: None,
        }
    }

    fn fail(msg: impl Into<String>) -> Self {
        Self {
            ok: false,
            error: Some(msg.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::database::test_pool;
    use axum::response::IntoResponse;
    use std::sync::Arc;
    use tempfile::TempDir;

    #[tokio::test]
    async fn ready_when_database_and_disk_work() {
        let dir = TempDir::new().unwrap();
        let service = StorageService::new(Arc::new(test_pool().await), dir.path());

        let response = readyz(State(service)).await.into_response();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn not_ready_without_schema_or_disk() {
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        let service = StorageService::new(Arc::new(pool), "/nonexistent/asset-drop/objects");

        assert!(!schema_check(&service).await.ok);
        assert!(!disk_check(&service).await.ok);
        let response = readyz(State(service)).await.into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
