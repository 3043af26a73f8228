//! HTTP API for the community feed.
//!
//! Every response uses the `{ok, data?, error?}` envelope. Write endpoints
//! accept only events signed by the caller; secret keys never reach the
//! server.

use anyhow::Result;
use axum::{
    extract::{
        rejection::{JsonRejection, QueryRejection},
        Query, State,
    },
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::{future::Future, net::SocketAddr, sync::Arc};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::info;

use crate::{
    community::{ClearReport, Community, QuestionQuery, CLEAR_ALL_LIMIT},
    error::AppError,
    event::Event,
    keys::{KeyPairDto, Keys},
    relay::PublishOutcome,
};

/// Uniform response wrapper.
#[derive(Debug, Serialize, Deserialize)]
#[serde(bound(deserialize = "T: Deserialize<'de>"))]
pub struct Envelope<T> {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T> Envelope<T> {
    pub fn success(data: T) -> Self {
        Self {
            ok: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            ok: false,
            data: None,
            error: Some(error.into()),
        }
    }
}

type ApiResult<T> = Result<Json<Envelope<T>>, AppError>;
type Created<T> = Result<(StatusCode, Json<Envelope<T>>), AppError>;

/// Body of `POST /community/questions` and `POST /community/delete`.
#[derive(Debug, Serialize, Deserialize)]
pub struct SubmitEvent {
    pub event: Event,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitReply {
    pub parent_id: String,
    pub event: Event,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ClearAll {
    pub events: Vec<Event>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ParentParams {
    parent_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AuthorParams {
    author: Option<String>,
}

#[derive(Debug, Deserialize)]
struct LimitParams {
    limit: Option<usize>,
}

/// Response body for the `/healthz` endpoint.
#[derive(Serialize, Deserialize)]
struct Health {
    /// Always "ok" when the server is running.
    status: String,
}

/// Build the application router.
pub fn router(community: Arc<Community>) -> Router {
    let api = Router::new()
        .route("/community/questions", post(submit_question).get(list_questions))
        .route("/community/replies", post(submit_reply).get(list_replies))
        .route("/community/replies-by-author", get(list_replies_by_author))
        .route("/community/delete", post(submit_deletion))
        .route("/community/clear-all", post(clear_all))
        .route("/community/events", get(list_events))
        .route("/community/keys", get(generate_keys));
    Router::new()
        .route("/healthz", get(healthz))
        .nest("/api", api)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(community)
}

/// Start the HTTP server and run until `shutdown` resolves.
pub async fn serve_http(
    addr: SocketAddr,
    community: Arc<Community>,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(addr = %listener.local_addr()?, "community api listening");
    axum::serve(listener, router(community).into_make_service())
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

/// Health check endpoint.
async fn healthz() -> Json<Health> {
    Json(Health {
        status: "ok".to_string(),
    })
}

async fn submit_question(
    State(community): State<Arc<Community>>,
    body: Result<Json<SubmitEvent>, JsonRejection>,
) -> Created<PublishOutcome> {
    let Json(body) = body?;
    let outcome = community.submit_question(body.event).await?;
    Ok((StatusCode::CREATED, Json(Envelope::success(outcome))))
}

async fn list_questions(
    State(community): State<Arc<Community>>,
    params: Result<Query<QuestionQuery>, QueryRejection>,
) -> ApiResult<Vec<Event>> {
    let Query(params) = params?;
    let events = community.list_questions(&params).await?;
    Ok(Json(Envelope::success(events)))
}

async fn submit_reply(
    State(community): State<Arc<Community>>,
    body: Result<Json<SubmitReply>, JsonRejection>,
) -> Created<PublishOutcome> {
    let Json(body) = body?;
    let outcome = community.submit_reply(&body.parent_id, body.event).await?;
    Ok((StatusCode::CREATED, Json(Envelope::success(outcome))))
}

async fn list_replies(
    State(community): State<Arc<Community>>,
    params: Result<Query<ParentParams>, QueryRejection>,
) -> ApiResult<Vec<Event>> {
    let Query(params) = params?;
    let parent_id = params.parent_id.unwrap_or_default();
    let events = community.list_replies(&parent_id).await?;
    Ok(Json(Envelope::success(events)))
}

async fn list_replies_by_author(
    State(community): State<Arc<Community>>,
    params: Result<Query<AuthorParams>, QueryRejection>,
) -> ApiResult<Vec<Event>> {
    let Query(params) = params?;
    let author = params.author.unwrap_or_default();
    let events = community.list_replies_by_author(&author).await?;
    Ok(Json(Envelope::success(events)))
}

async fn submit_deletion(
    State(community): State<Arc<Community>>,
    body: Result<Json<SubmitEvent>, JsonRejection>,
) -> ApiResult<PublishOutcome> {
    let Json(body) = body?;
    let outcome = community.submit_deletion(body.event).await?;
    Ok(Json(Envelope::success(outcome)))
}

async fn clear_all(
    State(community): State<Arc<Community>>,
    body: Result<Json<ClearAll>, JsonRejection>,
) -> ApiResult<ClearReport> {
    let Json(body) = body?;
    let report = community.clear_all(body.events).await?;
    Ok(Json(Envelope::success(report)))
}

async fn list_events(
    State(community): State<Arc<Community>>,
    params: Result<Query<LimitParams>, QueryRejection>,
) -> ApiResult<Vec<Event>> {
    let Query(params) = params?;
    let events = community
        .list_scoped(params.limit.unwrap_or(CLEAR_ALL_LIMIT))
        .await?;
    Ok(Json(Envelope::success(events)))
}

async fn generate_keys() -> Json<Envelope<KeyPairDto>> {
    Json(Envelope::success(Keys::generate().to_pair()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        tagging::{deletion_draft, Permission, QuestionForm, ReplyForm, Role, Scope},
        testing::{Behaviour, StubRelay, TestApi},
    };
    use reqwest::header::ACCESS_CONTROL_ALLOW_ORIGIN;
    use serde_json::{json, Value};

    async fn spawn(relay: &StubRelay) -> TestApi {
        TestApi::spawn(relay).await
    }

    fn math_question(keys: &Keys) -> Event {
        Scope::default()
            .question_draft(
                &QuestionForm {
                    content: "What is 2+2?".into(),
                    subject: Some("Math".into()),
                    grade: Some("Primary 3".into()),
                    allow: Some(Permission::Both),
                    role: Some(Role::Student),
                },
                &keys.public_hex(),
            )
            .unwrap()
            .sign(keys)
            .unwrap()
    }

    fn reply_to(keys: &Keys, parent: &str, content: &str) -> Event {
        Scope::default()
            .reply_draft(
                &ReplyForm {
                    content: content.into(),
                    parent_id: parent.into(),
                    role: Some(Role::Teacher),
                    extra_tags: vec![],
                },
                &keys.public_hex(),
            )
            .unwrap()
            .sign(keys)
            .unwrap()
    }

    #[tokio::test]
    async fn health_endpoint() {
        let relay = StubRelay::spawn(Behaviour::Accept).await;
        let h = spawn(&relay).await;
        let resp = reqwest::get(format!("{}/healthz", h.base)).await.unwrap();
        let body: Health = resp.json().await.unwrap();
        assert_eq!(body.status, "ok");
    }

    #[tokio::test]
    async fn cors_headers_present() {
        let relay = StubRelay::spawn(Behaviour::Accept).await;
        let h = spawn(&relay).await;
        let resp = reqwest::Client::new()
            .get(format!("{}/api/community/keys", h.base))
            .header("Origin", "http://localhost:3000")
            .send()
            .await
            .unwrap();
        assert!(resp.headers().get(ACCESS_CONTROL_ALLOW_ORIGIN).is_some());
    }

    #[tokio::test]
    async fn question_round_trip_by_subject_and_grade() {
        let relay = StubRelay::spawn(Behaviour::Accept).await;
        let h = spawn(&relay).await;
        let keys = Keys::generate();
        let ev = math_question(&keys);
        let client = reqwest::Client::new();
        let resp = client
            .post(format!("{}/api/community/questions", h.base))
            .json(&json!({ "event": ev }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::CREATED);
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["ok"], true);
        assert_eq!(body["data"]["id"], ev.id.as_str());
        assert_eq!(body["data"]["status"], "confirmed");

        let body: Value = client
            .get(format!("{}/api/community/questions", h.base))
            .query(&[("subject", "Math"), ("grade", "Primary 3")])
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        let data = body["data"].as_array().unwrap();
        assert_eq!(data.len(), 1);
        assert_eq!(data[0]["id"], ev.id.as_str());
        let tags = data[0]["tags"].as_array().unwrap();
        for tag in [
            json!(["t", "blueorb"]),
            json!(["t", "Math"]),
            json!(["g", "Primary 3"]),
            json!(["perm", "both"]),
        ] {
            assert!(tags.contains(&tag), "missing {tag}");
        }
    }

    #[tokio::test]
    async fn malformed_and_tampered_envelopes_are_bad_requests() {
        let relay = StubRelay::spawn(Behaviour::Accept).await;
        let h = spawn(&relay).await;
        let client = reqwest::Client::new();
        let url = format!("{}/api/community/questions", h.base);

        let resp = client
            .post(&url)
            .json(&json!({ "content": "no envelope" }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["ok"], false);
        assert!(body["error"].is_string());

        let mut ev = math_question(&Keys::generate());
        ev.content = "changed after signing".into();
        let resp = client
            .post(&url)
            .json(&json!({ "event": ev }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert!(relay.events().is_empty());
    }

    #[tokio::test]
    async fn replies_flow_with_deletion() {
        let relay = StubRelay::spawn(Behaviour::Accept).await;
        let h = spawn(&relay).await;
        let client = reqwest::Client::new();
        let keys = Keys::generate();
        let q = math_question(&keys);
        client
            .post(format!("{}/api/community/questions", h.base))
            .json(&json!({ "event": q }))
            .send()
            .await
            .unwrap();
        let r = reply_to(&keys, &q.id, "4");
        let resp = client
            .post(format!("{}/api/community/replies", h.base))
            .json(&json!({ "parentId": q.id, "event": r }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::CREATED);

        let list = |path: String| {
            let client = client.clone();
            async move {
                let body: Value = client.get(path).send().await.unwrap().json().await.unwrap();
                body["data"].as_array().unwrap().len()
            }
        };
        let replies_url = format!("{}/api/community/replies?parentId={}", h.base, q.id);
        let by_author_url = format!(
            "{}/api/community/replies-by-author?author={}",
            h.base,
            keys.public_hex()
        );
        assert_eq!(list(replies_url.clone()).await, 1);
        assert_eq!(list(by_author_url.clone()).await, 1);

        let del = deletion_draft(&r.id).unwrap().sign(&keys).unwrap();
        let resp = client
            .post(format!("{}/api/community/delete", h.base))
            .json(&json!({ "event": del }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(list(replies_url).await, 0);
        assert_eq!(list(by_author_url).await, 0);
    }

    #[tokio::test]
    async fn missing_parent_is_bad_request() {
        let relay = StubRelay::spawn(Behaviour::Accept).await;
        let h = spawn(&relay).await;
        let resp = reqwest::get(format!("{}/api/community/replies", h.base))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn relay_rejection_is_server_error() {
        let relay = StubRelay::spawn(Behaviour::Reject).await;
        let h = spawn(&relay).await;
        let resp = reqwest::Client::new()
            .post(format!("{}/api/community/questions", h.base))
            .json(&json!({ "event": math_question(&Keys::generate()) }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["ok"], false);
        assert!(body["error"].as_str().unwrap().contains("Failed to publish"));
    }

    #[tokio::test]
    async fn silent_relay_reports_unconfirmed() {
        let relay = StubRelay::spawn(Behaviour::Silent).await;
        let h = spawn(&relay).await;
        let resp = reqwest::Client::new()
            .post(format!("{}/api/community/questions", h.base))
            .json(&json!({ "event": math_question(&Keys::generate()) }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::CREATED);
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["data"]["status"], "unconfirmed");
    }

    #[tokio::test]
    async fn clear_all_reports_counts() {
        let relay = StubRelay::spawn(Behaviour::Accept).await;
        let h = spawn(&relay).await;
        let client = reqwest::Client::new();
        let keys = Keys::generate();
        let q = math_question(&keys);
        relay.insert(q.clone());
        relay.insert(reply_to(&keys, &q.id, "4"));

        let found: Envelope<Vec<Event>> = client
            .get(format!("{}/api/community/events?limit=1000", h.base))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        let found = found.data.unwrap();
        assert_eq!(found.len(), 2);
        let deletions: Vec<Event> = found
            .iter()
            .map(|ev| deletion_draft(&ev.id).unwrap().sign(&keys).unwrap())
            .collect();
        let report: Envelope<ClearReport> = client
            .post(format!("{}/api/community/clear-all", h.base))
            .json(&ClearAll { events: deletions })
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        let report = report.data.unwrap();
        assert_eq!(report.total_found, 2);
        assert_eq!(report.deleted_count + report.failed_count, 2);
    }

    #[tokio::test]
    async fn keys_endpoint_generates_fresh_pairs() {
        let relay = StubRelay::spawn(Behaviour::Accept).await;
        let h = spawn(&relay).await;
        let url = format!("{}/api/community/keys", h.base);
        let a: Envelope<KeyPairDto> = reqwest::get(&url).await.unwrap().json().await.unwrap();
        let b: Envelope<KeyPairDto> = reqwest::get(&url).await.unwrap().json().await.unwrap();
        let (a, b) = (a.data.unwrap(), b.data.unwrap());
        assert_eq!(a.nsec.len(), 64);
        assert_eq!(a.npub.len(), 64);
        assert_ne!(a.nsec, b.nsec);
        assert_eq!(Keys::from_secret_hex(&a.nsec).unwrap().public_hex(), a.npub);
    }
}
