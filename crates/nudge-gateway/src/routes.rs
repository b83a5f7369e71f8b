//! API route handlers for the gateway.

use axum::{
    Json,
    extract::{Query, State},
};
use nudge_core::NudgeError;
use nudge_core::traits::RecordStore;
use nudge_core::types::{CompletionSubmission, Stage, StageKey};
use nudge_scheduler::PassScope;
use serde::Deserialize;
use std::sync::Arc;

use crate::server::AppState;

fn error_json(e: impl std::fmt::Display) -> Json<serde_json::Value> {
    Json(serde_json::json!({"ok": false, "error": e.to_string()}))
}

/// Health check endpoint.
pub async fn health_check() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "service": "nudge-gateway",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// Campaign status: per-stage counts, last pass, content state.
pub async fn status(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    match state.reconciler.status().await {
        Ok(status) => Json(serde_json::json!({
            "ok": true,
            "uptime_secs": state.start_time.elapsed().as_secs(),
            "status": status,
        })),
        Err(e) => error_json(e),
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct RecipientQuery {
    pub stage: Option<String>,
    pub limit: Option<usize>,
}

pub async fn list_recipients(
    State(state): State<Arc<AppState>>,
    Query(query): Query<RecipientQuery>,
) -> Json<serde_json::Value> {
    let stage = match query.stage.as_deref().map(str::parse::<Stage>).transpose() {
        Ok(stage) => stage,
        Err(e) => return error_json(e),
    };
    match state.reconciler.store().load_all().await {
        Ok(records) => {
            let recipients: Vec<_> = records
                .into_iter()
                .filter(|r| stage.is_none_or(|s| r.stage == s))
                .take(query.limit.unwrap_or(500))
                .collect();
            Json(serde_json::json!({
                "ok": true,
                "count": recipients.len(),
                "recipients": recipients,
            }))
        }
        Err(e) => error_json(e),
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct LimitQuery {
    pub limit: Option<usize>,
}

/// Recent campaign events, newest first.
pub async fn list_events(
    State(state): State<Arc<AppState>>,
    Query(query): Query<LimitQuery>,
) -> Json<serde_json::Value> {
    let events = state
        .reconciler
        .events()
        .recent(query.limit.unwrap_or(50).min(100));
    Json(serde_json::json!({"ok": true, "events": events}))
}

/// Recent completion submissions, newest first.
pub async fn list_responses(
    State(state): State<Arc<AppState>>,
    Query(query): Query<LimitQuery>,
) -> Json<serde_json::Value> {
    match state.db.recent_responses(query.limit.unwrap_or(50)).await {
        Ok(responses) => Json(serde_json::json!({"ok": true, "responses": responses})),
        Err(e) => error_json(e),
    }
}

#[derive(Debug, Deserialize)]
pub struct EnrollRequest {
    pub identities: Vec<String>,
}

pub async fn enroll(
    State(state): State<Arc<AppState>>,
    Json(body): Json<EnrollRequest>,
) -> Json<serde_json::Value> {
    match state.reconciler.store().enroll(&body.identities).await {
        Ok(added) => Json(serde_json::json!({"ok": true, "added": added})),
        Err(e) => error_json(e),
    }
}

#[derive(Debug, Deserialize)]
pub struct BlastRequest {
    #[serde(default = "default_blast_scope")]
    pub scope: PassScope,
    /// Wait for the pass and return its report instead of returning at once.
    #[serde(default)]
    pub wait: bool,
}

fn default_blast_scope() -> PassScope {
    PassScope::InitialOnly
}

/// Administrative trigger: run a pass now, outside the periodic cadence.
pub async fn blast(
    State(state): State<Arc<AppState>>,
    Json(body): Json<BlastRequest>,
) -> Json<serde_json::Value> {
    tracing::info!("📣 Blast requested ({:?})", body.scope);
    let reconciler = state.reconciler.clone();
    let mut shutdown = state.shutdown.clone();

    if body.wait {
        let report = reconciler.run_pass(body.scope, &mut shutdown).await;
        return Json(serde_json::json!({"ok": report.aborted.is_none(), "report": report}));
    }

    tokio::spawn(async move {
        reconciler.run_pass(body.scope, &mut shutdown).await;
    });
    Json(serde_json::json!({"ok": true, "started": true}))
}

/// Completion trigger: called by the form backend when a recipient submits.
pub async fn complete(
    State(state): State<Arc<AppState>>,
    Json(body): Json<CompletionSubmission>,
) -> Json<serde_json::Value> {
    match state.reconciler.complete(&body).await {
        Ok(result) => Json(serde_json::json!({"ok": true, "result": result})),
        Err(NudgeError::RecipientNotFound(id)) => {
            error_json(format!("Unknown recipient '{id}'"))
        }
        Err(e) => error_json(e),
    }
}

pub async fn rebase(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    match state.reconciler.rebase().await {
        Ok(report) => Json(serde_json::json!({"ok": true, "report": report})),
        Err(e) => error_json(e),
    }
}

#[derive(Debug, Deserialize)]
pub struct ContentRequest {
    pub key: String,
    pub content: String,
}

/// Replace one message template and reload.
pub async fn set_content(
    State(state): State<Arc<AppState>>,
    Json(body): Json<ContentRequest>,
) -> Json<serde_json::Value> {
    let Some(key) = StageKey::from_key(body.key.trim()) else {
        return error_json(format!("Unknown content key '{}'", body.key));
    };
    if let Err(e) = state.db.set_content(key.as_str(), &body.content).await {
        return error_json(e);
    }
    reload_content(State(state)).await
}

pub async fn reload_content(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    match state.reconciler.resolver().refresh().await {
        Ok(loaded) => Json(serde_json::json!({"ok": true, "templates": loaded})),
        Err(e) => error_json(e),
    }
}

#[derive(Debug, Deserialize)]
pub struct TestSendRequest {
    pub identity: String,
}

/// Send all three bodies to one identity. Record state is untouched.
pub async fn test_send(
    State(state): State<Arc<AppState>>,
    Json(body): Json<TestSendRequest>,
) -> Json<serde_json::Value> {
    let identity = body.identity.trim();
    if identity.is_empty() {
        return error_json("identity is required");
    }
    let results: Vec<_> = state
        .reconciler
        .test_send(identity)
        .await
        .into_iter()
        .map(|(key, outcome)| {
            serde_json::json!({
                "key": key,
                "outcome": format!("{outcome:?}"),
            })
        })
        .collect();
    Json(serde_json::json!({"ok": true, "results": results}))
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use nudge_core::NudgeConfig;
    use nudge_core::error::DeliveryError;
    use nudge_core::traits::Transport;
    use nudge_core::traits::eligibility::NoExclusions;
    use nudge_scheduler::{CampaignDb, Collaborators, Reconciler, Shutdown};
    use std::sync::Mutex;
    use tower::ServiceExt;

    #[derive(Default)]
    struct RecordingTransport {
        sent: Mutex<Vec<(String, String)>>,
    }

    #[async_trait]
    impl Transport for RecordingTransport {
        fn name(&self) -> &str {
            "recording"
        }

        async fn send(&self, identity: &str, body: &str) -> Result<(), DeliveryError> {
            self.sent
                .lock()
                .unwrap()
                .push((identity.to_string(), body.to_string()));
            Ok(())
        }
    }

    async fn test_app(admin_token: Option<&str>) -> (Arc<AppState>, Arc<RecordingTransport>) {
        let db = CampaignDb::open_in_memory(false).unwrap();
        db.enroll(&["1".to_string(), "2".to_string()]).await.unwrap();
        let transport = Arc::new(RecordingTransport::default());

        let mut config = NudgeConfig::default();
        config.campaign.initial_pacing_secs = 0;
        config.campaign.reminder_pacing_secs = 0;
        config.gateway.admin_token = admin_token.map(str::to_string);

        let reconciler = Reconciler::from_config(
            &config,
            Collaborators {
                store: Arc::new(db.clone()),
                content: Arc::new(db.clone()),
                transport: transport.clone(),
                oracle: Arc::new(NoExclusions),
                log: None,
            },
        );
        let state = AppState::new(
            config.gateway.clone(),
            Arc::new(reconciler),
            db,
            Shutdown::never(),
        );
        (Arc::new(state), transport)
    }

    async fn test_state() -> State<Arc<AppState>> {
        State(test_app(None).await.0)
    }

    #[tokio::test]
    async fn test_health_check() {
        let json = health_check().await.0;
        assert_eq!(json["status"], "ok");
        assert_eq!(json["service"], "nudge-gateway");
    }

    #[tokio::test]
    async fn test_status_counts() {
        let json = status(test_state().await).await.0;
        assert_eq!(json["ok"], true);
        assert_eq!(json["status"]["total"], 2);
        assert_eq!(json["status"]["stages"]["not_contacted"], 2);
    }

    #[tokio::test]
    async fn test_blast_wait_sends_initial() {
        let (state, transport) = test_app(None).await;
        let body = BlastRequest {
            scope: PassScope::InitialOnly,
            wait: true,
        };
        let json = blast(State(state.clone()), Json(body)).await.0;
        assert_eq!(json["ok"], true);
        assert_eq!(json["report"]["sent"], 2);
        assert_eq!(transport.sent.lock().unwrap().len(), 2);

        let json = list_recipients(
            State(state),
            Query(RecipientQuery {
                stage: Some("initial_sent".into()),
                limit: None,
            }),
        )
        .await
        .0;
        assert_eq!(json["count"], 2);
    }

    #[tokio::test]
    async fn test_blast_defaults_to_initial_only() {
        let body: BlastRequest = serde_json::from_str("{}").unwrap();
        assert_eq!(body.scope, PassScope::InitialOnly);
        assert!(!body.wait);
    }

    #[tokio::test]
    async fn test_complete_and_unknown() {
        let (state, _) = test_app(None).await;
        let sub = CompletionSubmission {
            identity: "1".into(),
            username: Some("one".into()),
            ..Default::default()
        };
        let json = complete(State(state.clone()), Json(sub)).await.0;
        assert_eq!(json["ok"], true);
        assert_eq!(json["result"]["result"], "completed");

        let sub = CompletionSubmission {
            identity: "404".into(),
            ..Default::default()
        };
        let json = complete(State(state.clone()), Json(sub)).await.0;
        assert_eq!(json["ok"], false);

        let json = list_events(State(state), Query(LimitQuery::default())).await.0;
        assert_eq!(json["events"][0]["type"], "completed");
    }

    #[tokio::test]
    async fn test_bad_stage_filter() {
        let json = list_recipients(
            test_state().await,
            Query(RecipientQuery {
                stage: Some("sent".into()),
                limit: None,
            }),
        )
        .await
        .0;
        assert_eq!(json["ok"], false);
    }

    #[tokio::test]
    async fn test_set_content_reloads() {
        let (state, transport) = test_app(None).await;
        let body = ContentRequest {
            key: "initial_dm".into(),
            content: "Welcome <@user>".into(),
        };
        let json = set_content(State(state.clone()), Json(body)).await.0;
        assert_eq!(json["ok"], true);
        assert_eq!(json["templates"], 1);

        test_send(
            State(state),
            Json(TestSendRequest {
                identity: "9".into(),
            }),
        )
        .await;
        let sent = transport.sent.lock().unwrap().clone();
        assert_eq!(sent.len(), 3);
        assert_eq!(sent[0].1, "Welcome <@9>");
    }

    #[tokio::test]
    async fn test_set_content_rejects_unknown_key() {
        let body = ContentRequest {
            key: "followup_1w".into(),
            content: "x".into(),
        };
        let json = set_content(test_state().await, Json(body)).await.0;
        assert_eq!(json["ok"], false);
    }

    #[tokio::test]
    async fn test_enroll() {
        let body = EnrollRequest {
            identities: vec!["2".into(), "3".into()],
        };
        let json = enroll(test_state().await, Json(body)).await.0;
        assert_eq!(json["added"], 1);
    }

    #[tokio::test]
    async fn test_admin_token_required() {
        let (state, _) = test_app(Some("s3cret")).await;
        let app = crate::server::build_router_from_arc(state);

        let resp = app
            .clone()
            .oneshot(Request::get("/api/v1/status").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

        let resp = app
            .clone()
            .oneshot(
                Request::get("/api/v1/status")
                    .header("X-Admin-Token", "s3cret")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let resp = app
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }
}
