//! Webhook endpoint handler.
//!
//! Classifies review-system event deliveries and republishes them as internal
//! events. A merged change carrying pick targets is persisted *before* the
//! delivery is acknowledged, so an acknowledged merge can never be lost to a
//! crash. Processing itself always happens asynchronously.

use axum::extract::{ConnectInfo, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use std::net::SocketAddr;
use thiserror::Error;
use tracing::{debug, info, warn};

use super::AppState;
use crate::engine::{Signal, Step};
use crate::store::StoreError;
use crate::types::{
    ChangeId, ChangeKey, EventKey, EventKind, MergeEvent, ProcessingRecord, RevisionId,
};

/// Errors that can occur while handling a delivery.
#[derive(Debug, Error)]
pub enum WebhookError {
    #[error("caller {0} is not on the allow-list")]
    ForbiddenCaller(std::net::IpAddr),

    #[error("delivery lacks required field: {0}")]
    MissingField(&'static str),

    #[error("cannot persist merge event: {0}")]
    Storage(#[from] StoreError),
}

impl IntoResponse for WebhookError {
    fn into_response(self) -> Response {
        let status = match &self {
            WebhookError::ForbiddenCaller(_) => StatusCode::FORBIDDEN,
            WebhookError::MissingField(_) => StatusCode::BAD_REQUEST,
            WebhookError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, self.to_string()).into_response()
    }
}

/// An inbound delivery. Fields beyond `type` vary per event kind, so they
/// are all optional here and checked per kind.
#[derive(Debug, Deserialize)]
pub struct Delivery {
    #[serde(rename = "type")]
    pub kind: String,
    pub project: Option<String>,
    pub branch: Option<String>,
    pub change: Option<ChangePayload>,
    #[serde(rename = "patchSet")]
    pub patch_set: Option<PatchSetPayload>,
    pub uploader: Option<UploaderPayload>,
}

#[derive(Debug, Deserialize)]
pub struct ChangePayload {
    pub id: String,
    pub number: Option<u64>,
    pub subject: Option<String>,
    pub url: Option<String>,
    pub owner: Option<String>,
    #[serde(rename = "commitMessage")]
    pub commit_message: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct PatchSetPayload {
    pub number: u64,
    pub revision: String,
}

#[derive(Debug, Deserialize)]
pub struct UploaderPayload {
    pub email: Option<String>,
}

pub async fn webhook_handler(
    State(app_state): State<AppState>,
    ConnectInfo(caller): ConnectInfo<SocketAddr>,
    Json(delivery): Json<Delivery>,
) -> Result<(StatusCode, &'static str), WebhookError> {
    if !app_state.caller_allowed(caller.ip()) {
        warn!(caller = %caller.ip(), "rejected delivery from unlisted caller");
        return Err(WebhookError::ForbiddenCaller(caller.ip()));
    }

    let Some(kind) = EventKind::parse(&delivery.kind) else {
        debug!(kind = %delivery.kind, "unrecognized event type acknowledged");
        return Ok((StatusCode::OK, "ignored"));
    };

    match kind {
        EventKind::ChangeMerged => handle_change_merged(&app_state, delivery).await,
        EventKind::PatchsetCreated => handle_patchset_created(&app_state, delivery),
        _ => {
            // Only live listeners care; no persistence.
            let key = change_key(&delivery)?;
            app_state.core().emit(EventKey::for_change(kind, &key));
            Ok((StatusCode::OK, "published"))
        }
    }
}

/// Persists a tracked merge before acknowledging it, then kicks off
/// classification. Redeliveries of an already-tracked change/revision are
/// acknowledged without creating a second record.
async fn handle_change_merged(
    app_state: &AppState,
    delivery: Delivery,
) -> Result<(StatusCode, &'static str), WebhookError> {
    let event = merge_event(delivery)?;
    let key = event.key();
    let core = app_state.core();

    // Whatever happens below, listeners awaiting this merge get woken.
    core.emit(EventKey::for_change(EventKind::ChangeMerged, &key));

    if event.pick_targets().is_empty() {
        debug!(change = %key, "merged change has no pick targets");
        return Ok((StatusCode::OK, "no pick targets"));
    }

    if core.store.live_record_for(&key, &event.revision)?.is_some() {
        info!(change = %key, "redelivery of tracked change acknowledged");
        return Ok((StatusCode::ACCEPTED, "already tracked"));
    }

    let record = ProcessingRecord::new(event);
    core.store.insert_record(&record)?;
    info!(
        run_id = %record.run_id,
        change = %key,
        "merge event persisted"
    );
    core.send(Signal::new(record.run_id, Step::DetermineProcessingPath));
    Ok((StatusCode::ACCEPTED, "accepted"))
}

/// A change's first patchset is the reliable signal that a cherry-pick
/// replica now exists; later patchsets are ordinary review activity.
fn handle_patchset_created(
    app_state: &AppState,
    delivery: Delivery,
) -> Result<(StatusCode, &'static str), WebhookError> {
    let patch_set = delivery
        .patch_set
        .as_ref()
        .ok_or(WebhookError::MissingField("patchSet"))?;
    if patch_set.number != 1 {
        return Ok((StatusCode::OK, "ignored"));
    }
    let key = change_key(&delivery)?;
    app_state
        .core()
        .emit(EventKey::for_change(EventKind::PatchsetCreated, &key));
    Ok((StatusCode::OK, "published"))
}

fn change_key(delivery: &Delivery) -> Result<ChangeKey, WebhookError> {
    let project = delivery
        .project
        .as_deref()
        .ok_or(WebhookError::MissingField("project"))?;
    let branch = delivery
        .branch
        .as_deref()
        .ok_or(WebhookError::MissingField("branch"))?;
    let change = delivery
        .change
        .as_ref()
        .ok_or(WebhookError::MissingField("change"))?;
    Ok(ChangeKey::new(project, branch, change.id.as_str()))
}

fn merge_event(delivery: Delivery) -> Result<MergeEvent, WebhookError> {
    let key = change_key(&delivery)?;
    let change = delivery.change.ok_or(WebhookError::MissingField("change"))?;
    let patch_set = delivery
        .patch_set
        .ok_or(WebhookError::MissingField("patchSet"))?;
    let owner = change.owner.ok_or(WebhookError::MissingField("change.owner"))?;
    let uploader = delivery
        .uploader
        .and_then(|u| u.email)
        .unwrap_or_else(|| owner.clone());

    Ok(MergeEvent {
        project: key.project,
        branch: key.branch,
        change_id: ChangeId::new(change.id),
        number: change.number.unwrap_or_default(),
        subject: change.subject.unwrap_or_default(),
        url: change.url.unwrap_or_default(),
        owner,
        commit_message: change
            .commit_message
            .ok_or(WebhookError::MissingField("change.commitMessage"))?,
        revision: RevisionId::new(patch_set.revision),
        uploader,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{Core, EngineMessage};
    use crate::server::{build_router, AppState};
    use crate::store::Store;
    use crate::test_utils::FakeGerrit;
    use crate::types::RecordState;
    use axum::body::Body;
    use axum::http::{header, Request, StatusCode};
    use std::sync::Arc;
    use tokio::sync::mpsc;
    use tower::ServiceExt;

    struct Harness {
        router: axum::Router,
        store: Store,
        rx: mpsc::UnboundedReceiver<EngineMessage>,
    }

    fn harness() -> Harness {
        let store = Store::open_in_memory().unwrap();
        let (tx, rx) = mpsc::unbounded_channel();
        let core = Core::new(
            store.clone(),
            Arc::new(FakeGerrit::new()),
            "admin@example.com".into(),
            tx,
        );
        let state = AppState::new(core, vec!["10.0.0.1".parse().unwrap()]);
        Harness {
            router: build_router(state),
            store,
            rx,
        }
    }

    fn request(body: serde_json::Value, caller: &str) -> Request<Body> {
        let mut request = Request::builder()
            .method("POST")
            .uri("/")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap();
        request.extensions_mut().insert(ConnectInfo(SocketAddr::new(
            caller.parse().unwrap(),
            34567,
        )));
        request
    }

    fn merged_delivery() -> serde_json::Value {
        serde_json::json!({
            "type": "change-merged",
            "project": "qt/base",
            "branch": "dev",
            "change": {
                "id": "Iaaa",
                "number": 42,
                "subject": "Fix",
                "url": "https://review.example/c/42",
                "owner": "owner@example.com",
                "commitMessage": "Fix\n\nPick-to: 6.5\nChange-Id: Iaaa"
            },
            "patchSet": {"number": 3, "revision": "revA"},
            "uploader": {"email": "dev@example.com"}
        })
    }

    #[tokio::test]
    async fn merged_change_is_persisted_before_acknowledgement() {
        let mut h = harness();
        let response = h
            .router
            .clone()
            .oneshot(request(merged_delivery(), "10.0.0.1"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);

        let records = h.store.records_in_state(RecordState::New).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].event.uploader, "dev@example.com");

        // A classification signal follows the stored event notification.
        let mut saw_classification = false;
        while let Ok(message) = h.rx.try_recv() {
            if let EngineMessage::Signal(signal) = message {
                assert_eq!(signal.step, Step::DetermineProcessingPath);
                saw_classification = true;
            }
        }
        assert!(saw_classification);
    }

    #[tokio::test]
    async fn redelivery_does_not_duplicate_the_record() {
        let h = harness();
        for _ in 0..2 {
            let response = h
                .router
                .clone()
                .oneshot(request(merged_delivery(), "10.0.0.1"))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::ACCEPTED);
        }
        assert_eq!(h.store.records_in_state(RecordState::New).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn merged_change_without_footer_is_not_persisted() {
        let mut body = merged_delivery();
        body["change"]["commitMessage"] = "Fix\n\nChange-Id: Iaaa".into();
        let h = harness();
        let response = h
            .router
            .clone()
            .oneshot(request(body, "10.0.0.1"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(h.store.records_in_state(RecordState::New).unwrap().is_empty());
    }

    #[tokio::test]
    async fn unlisted_caller_is_rejected() {
        let h = harness();
        let response = h
            .router
            .clone()
            .oneshot(request(merged_delivery(), "192.0.2.7"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        assert!(h.store.records_in_state(RecordState::New).unwrap().is_empty());
    }

    #[tokio::test]
    async fn first_patchset_publishes_replica_created_event() {
        let mut h = harness();
        let body = serde_json::json!({
            "type": "patchset-created",
            "project": "qt/base",
            "branch": "6.5",
            "change": {"id": "Iaaa"},
            "patchSet": {"number": 1, "revision": "pickA"}
        });
        let response = h
            .router
            .clone()
            .oneshot(request(body, "10.0.0.1"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        match h.rx.try_recv().unwrap() {
            EngineMessage::Event(key) => {
                assert_eq!(key.kind, EventKind::PatchsetCreated);
                assert_eq!(key.context, "qt/base~6.5~Iaaa");
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[tokio::test]
    async fn later_patchsets_are_ignored() {
        let mut h = harness();
        let body = serde_json::json!({
            "type": "patchset-created",
            "project": "qt/base",
            "branch": "6.5",
            "change": {"id": "Iaaa"},
            "patchSet": {"number": 2, "revision": "pickA2"}
        });
        h.router
            .clone()
            .oneshot(request(body, "10.0.0.1"))
            .await
            .unwrap();
        assert!(h.rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn unknown_event_types_are_acknowledged() {
        let h = harness();
        let body = serde_json::json!({"type": "ref-updated"});
        let response = h
            .router
            .clone()
            .oneshot(request(body, "10.0.0.1"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn abandon_events_are_published_keyed_by_change() {
        let mut h = harness();
        let body = serde_json::json!({
            "type": "change-abandoned",
            "project": "qt/base",
            "branch": "dev",
            "change": {"id": "Ibbb"}
        });
        h.router
            .clone()
            .oneshot(request(body, "10.0.0.1"))
            .await
            .unwrap();
        match h.rx.try_recv().unwrap() {
            EngineMessage::Event(key) => {
                assert_eq!(key.kind, EventKind::ChangeAbandoned);
                assert_eq!(key.context, "qt/base~dev~Ibbb");
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }
}
