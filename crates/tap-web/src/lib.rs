//! Health and queue diagnostics over HTTP.

use std::collections::BTreeMap;
use std::future::Future;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tap_core::{Clock, ExtractionJob, JobState, PipelineVersion};
use tap_pipeline::{check_heartbeat, heartbeat_path, Health, HeartbeatReport, POOL_COMPONENT};
use tap_storage::{JobFilter, JobQueue, StateCount};
use tokio::net::TcpListener;
use tracing::{error, info};

pub const CRATE_NAME: &str = "tap-web";

const DEFAULT_JOB_LIMIT: usize = 100;

#[derive(Clone)]
pub struct AppState {
    pub queue: Arc<dyn JobQueue>,
    pub clock: Arc<dyn Clock>,
    pub heartbeat_dir: PathBuf,
    pub heartbeat_max_age: Duration,
    /// Heartbeat files that must be fresh for `/healthz` to pass.
    pub components: Vec<String>,
    /// Heartbeat files reported by `/healthz` without affecting its status.
    pub informational: Vec<String>,
}

impl AppState {
    pub fn new(
        queue: Arc<dyn JobQueue>,
        clock: Arc<dyn Clock>,
        heartbeat_dir: impl Into<PathBuf>,
        heartbeat_max_age: Duration,
    ) -> Self {
        Self {
            queue,
            clock,
            heartbeat_dir: heartbeat_dir.into(),
            heartbeat_max_age,
            components: vec![POOL_COMPONENT.to_string()],
            informational: Vec::new(),
        }
    }

    pub fn with_components(mut self, components: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.components = components.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_informational(mut self, components: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.informational = components.into_iter().map(Into::into).collect();
        self
    }
}

#[derive(Debug, Serialize)]
struct HealthBody {
    status: Health,
    components: BTreeMap<String, HeartbeatReport>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    informational: BTreeMap<String, HeartbeatReport>,
}

#[derive(Debug, Serialize)]
struct StatsBody {
    counts: Vec<StateCount>,
    oldest_pending_at: Option<DateTime<Utc>>,
    oldest_pending_age_secs: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct JobsQuery {
    state: Option<String>,
    version: Option<String>,
    limit: Option<usize>,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz_handler))
        .route("/queue/stats", get(queue_stats_handler))
        .route("/jobs", get(jobs_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(
    addr: &str,
    state: AppState,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!(addr, "web listening");
    axum::serve(listener, app(state))
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

async fn healthz_handler(State(state): State<Arc<AppState>>) -> Response {
    let components = heartbeat_reports(&state, &state.components).await;
    let informational = heartbeat_reports(&state, &state.informational).await;
    let status = components
        .values()
        .map(|r| r.health)
        .find(|h| *h != Health::Healthy)
        .unwrap_or(Health::Healthy);
    let code = if status == Health::Healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        code,
        Json(HealthBody {
            status,
            components,
            informational,
        }),
    )
        .into_response()
}

async fn heartbeat_reports(state: &AppState, names: &[String]) -> BTreeMap<String, HeartbeatReport> {
    let now = state.clock.now();
    let mut reports = BTreeMap::new();
    for name in names {
        let path = heartbeat_path(&state.heartbeat_dir, name);
        reports.insert(name.clone(), check_heartbeat(&path, state.heartbeat_max_age, now).await);
    }
    reports
}

async fn queue_stats_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.queue.stats().await {
        Ok(stats) => {
            let now = state.clock.now();
            Json(StatsBody {
                oldest_pending_age_secs: stats.oldest_pending_at.map(|at| (now - at).num_seconds()),
                oldest_pending_at: stats.oldest_pending_at,
                counts: stats.counts,
            })
            .into_response()
        }
        Err(err) => server_error(err),
    }
}

async fn jobs_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<JobsQuery>,
) -> Response {
    let job_state = match query.state.as_deref().map(JobState::from_str).transpose() {
        Ok(s) => s,
        Err(err) => return bad_request(err.to_string()),
    };
    let filter = JobFilter {
        state: job_state,
        version: query.version.map(PipelineVersion::new),
        completed_since: None,
        limit: query.limit.unwrap_or(DEFAULT_JOB_LIMIT),
    };
    match state.queue.list(filter).await {
        Ok(jobs) => Json::<Vec<ExtractionJob>>(jobs).into_response(),
        Err(err) => server_error(err),
    }
}

fn bad_request(message: String) -> Response {
    (StatusCode::BAD_REQUEST, Json(ErrorBody { error: message })).into_response()
}

fn server_error(err: impl std::fmt::Display) -> Response {
    error!(error = %err, "request failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(ErrorBody {
            error: err.to_string(),
        }),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use chrono::TimeZone;
    use http_body_util::BodyExt;
    use tap_core::{JobOutcome, ManualClock, ReleaseReason};
    use tap_pipeline::{write_heartbeat, Heartbeat, INGESTER_COMPONENT};
    use tap_storage::{MemoryJobQueue, QueueSettings};
    use tower::ServiceExt;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, 8, 0, 0).single().unwrap()
    }

    struct Fixture {
        clock: ManualClock,
        queue: Arc<MemoryJobQueue>,
        dir: tempfile::TempDir,
    }

    impl Fixture {
        fn new() -> Self {
            let clock = ManualClock::new(t0());
            let queue = Arc::new(MemoryJobQueue::new(
                Arc::new(clock.clone()),
                QueueSettings {
                    max_attempts: 1,
                    ..QueueSettings::default()
                },
            ));
            Self {
                clock,
                queue,
                dir: tempfile::tempdir().unwrap(),
            }
        }

        fn app(&self) -> Router {
            app(AppState::new(
                self.queue.clone(),
                Arc::new(self.clock.clone()),
                self.dir.path(),
                Duration::from_secs(120),
            ))
        }
    }

    async fn get_json(app: Router, uri: &str) -> (StatusCode, serde_json::Value) {
        let resp = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = resp.status();
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        (status, serde_json::from_slice(&body).unwrap())
    }

    #[tokio::test]
    async fn healthz_follows_the_pool_heartbeat() {
        let fx = Fixture::new();
        let (status, body) = get_json(fx.app(), "/healthz").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["status"], "missing");

        write_heartbeat(fx.dir.path(), &Heartbeat::new(POOL_COMPONENT, t0()))
            .await
            .unwrap();
        fx.clock.advance(chrono::Duration::seconds(30));
        let (status, body) = get_json(fx.app(), "/healthz").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["components"][POOL_COMPONENT]["age_secs"], 30);

        fx.clock.advance(chrono::Duration::minutes(10));
        let (status, body) = get_json(fx.app(), "/healthz").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["status"], "stale");
    }

    #[tokio::test]
    async fn quiet_ingester_is_reported_without_failing_health() {
        let fx = Fixture::new();
        let router = || {
            app(AppState::new(
                fx.queue.clone(),
                Arc::new(fx.clock.clone()),
                fx.dir.path(),
                Duration::from_secs(120),
            )
            .with_components([POOL_COMPONENT])
            .with_informational([INGESTER_COMPONENT]))
        };

        write_heartbeat(fx.dir.path(), &Heartbeat::new(POOL_COMPONENT, t0()))
            .await
            .unwrap();
        let (status, body) = get_json(router(), "/healthz").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["informational"][INGESTER_COMPONENT]["health"], "missing");

        write_heartbeat(fx.dir.path(), &Heartbeat::new(INGESTER_COMPONENT, t0()))
            .await
            .unwrap();
        fx.clock.advance(chrono::Duration::seconds(60));
        write_heartbeat(fx.dir.path(), &Heartbeat::new(POOL_COMPONENT, fx.clock.now()))
            .await
            .unwrap();
        fx.clock.advance(chrono::Duration::seconds(90));
        let (status, body) = get_json(router(), "/healthz").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["informational"][INGESTER_COMPONENT]["health"], "stale");
        assert_eq!(body["components"][POOL_COMPONENT]["health"], "healthy");
    }

    #[tokio::test]
    async fn queue_stats_and_job_listing() {
        let fx = Fixture::new();
        let v1 = PipelineVersion::new("v1");
        for source in ["S1", "S2", "S3"] {
            fx.queue.enqueue(source, &v1, false).await.unwrap();
        }
        let claimed = fx.queue.claim("w1", 2, Duration::from_secs(60)).await.unwrap();
        fx.queue
            .complete(claimed[0].job_id, "w1", JobOutcome::Failed("Permanent:source_missing".into()))
            .await
            .unwrap();
        fx.queue
            .release(claimed[1].job_id, "w1", ReleaseReason::Transient("timeout".into()))
            .await
            .unwrap();
        fx.clock.advance(chrono::Duration::seconds(90));

        let (status, stats) = get_json(fx.app(), "/queue/stats").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(stats["oldest_pending_age_secs"], 90);

        let (status, failed) = get_json(fx.app(), "/jobs?state=failed&version=v1").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(failed.as_array().map(Vec::len), Some(2));

        let (status, none) = get_json(fx.app(), "/jobs?version=v2").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(none.as_array().map(Vec::len), Some(0));

        let (status, _) = get_json(fx.app(), "/jobs?state=exploded").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }
}
