//! HTTP client for the community API.

use reqwest::{Client, Response};
use serde::de::DeserializeOwned;
use thiserror::Error;

use crate::{
    community::{ClearReport, QuestionQuery},
    event::Event,
    relay::PublishOutcome,
    server::{ClearAll, Envelope, SubmitEvent, SubmitReply},
};

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("server answered {status}: {message}")]
    Server { status: u16, message: String },
}

#[derive(Debug, Clone)]
pub struct ApiClient {
    http: Client,
    base: String,
}

impl ApiClient {
    /// `base` is the API root, e.g. `http://127.0.0.1:4000/api`.
    pub fn new(base: impl Into<String>) -> Self {
        Self {
            http: Client::new(),
            base: base.into().trim_end_matches('/').to_string(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/community/{path}", self.base)
    }

    pub async fn submit_question(&self, event: &Event) -> Result<PublishOutcome, ApiError> {
        let resp = self
            .http
            .post(self.url("questions"))
            .json(&SubmitEvent {
                event: event.clone(),
            })
            .send()
            .await?;
        decode(resp).await
    }

    pub async fn list_questions(&self, query: &QuestionQuery) -> Result<Vec<Event>, ApiError> {
        let resp = self
            .http
            .get(self.url("questions"))
            .query(query)
            .send()
            .await?;
        decode(resp).await
    }

    pub async fn submit_reply(&self, parent_id: &str, event: &Event) -> Result<PublishOutcome, ApiError> {
        let resp = self
            .http
            .post(self.url("replies"))
            .json(&SubmitReply {
                parent_id: parent_id.to_string(),
                event: event.clone(),
            })
            .send()
            .await?;
        decode(resp).await
    }

    pub async fn list_replies(&self, parent_id: &str) -> Result<Vec<Event>, ApiError> {
        let resp = self
            .http
            .get(self.url("replies"))
            .query(&[("parentId", parent_id)])
            .send()
            .await?;
        decode(resp).await
    }

    pub async fn list_replies_by_author(&self, author: &str) -> Result<Vec<Event>, ApiError> {
        let resp = self
            .http
            .get(self.url("replies-by-author"))
            .query(&[("author", author)])
            .send()
            .await?;
        decode(resp).await
    }

    pub async fn submit_deletion(&self, event: &Event) -> Result<PublishOutcome, ApiError> {
        let resp = self
            .http
            .post(self.url("delete"))
            .json(&SubmitEvent {
                event: event.clone(),
            })
            .send()
            .await?;
        decode(resp).await
    }

    pub async fn clear_all(&self, events: Vec<Event>) -> Result<ClearReport, ApiError> {
        let resp = self
            .http
            .post(self.url("clear-all"))
            .json(&ClearAll { events })
            .send()
            .await?;
        decode(resp).await
    }

    /// Scope-tagged notes still live on the relays, at most `limit`.
    pub async fn list_events(&self, limit: usize) -> Result<Vec<Event>, ApiError> {
        let resp = self
            .http
            .get(self.url("events"))
            .query(&[("limit", limit)])
            .send()
            .await?;
        decode(resp).await
    }
}

/// Unwrap the `{ok, data, error}` envelope.
async fn decode<T: DeserializeOwned>(resp: Response) -> Result<T, ApiError> {
    let status = resp.status();
    let text = resp.text().await?;
    let envelope: Option<Envelope<T>> = serde_json::from_str(&text).ok();
    match envelope {
        Some(Envelope {
            ok: true,
            data: Some(data),
            ..
        }) => Ok(data),
        Some(Envelope { error, .. }) => Err(ApiError::Server {
            status: status.as_u16(),
            message: error.unwrap_or_else(|| "empty response".into()),
        }),
        None => Err(ApiError::Server {
            status: status.as_u16(),
            message: if text.is_empty() {
                status.to_string()
            } else {
                text
            },
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        keys::Keys,
        relay::PublishStatus,
        tagging::{deletion_draft, QuestionForm, ReplyForm, Scope},
        testing::{Behaviour, StubRelay, TestApi},
    };

    #[tokio::test]
    async fn client_covers_question_reply_and_delete() {
        let relay = StubRelay::spawn(Behaviour::Accept).await;
        let server = TestApi::spawn(&relay).await;
        let api = &server.client;
        let keys = Keys::generate();
        let scope = Scope::default();
        let q = scope
            .question_draft(
                &QuestionForm {
                    content: "Why is the sky blue?".into(),
                    subject: Some("Physics".into()),
                    grade: Some("SSS 1".into()),
                    ..Default::default()
                },
                &keys.public_hex(),
            )
            .unwrap()
            .sign(&keys)
            .unwrap();
        let out = api.submit_question(&q).await.unwrap();
        assert!(matches!(out.status, PublishStatus::Confirmed { .. }));

        let listed = api
            .list_questions(&QuestionQuery {
                subject: Some("Physics".into()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(listed.len(), 1);

        let r = scope
            .reply_draft(
                &ReplyForm {
                    content: "Rayleigh scattering".into(),
                    parent_id: q.id.clone(),
                    ..Default::default()
                },
                &keys.public_hex(),
            )
            .unwrap()
            .sign(&keys)
            .unwrap();
        api.submit_reply(&q.id, &r).await.unwrap();
        assert_eq!(api.list_replies(&q.id).await.unwrap(), vec![r.clone()]);
        assert_eq!(
            api.list_replies_by_author(&keys.public_hex()).await.unwrap(),
            vec![r.clone()]
        );
        assert_eq!(api.list_events(10).await.unwrap().len(), 2);

        api.submit_deletion(&deletion_draft(&r.id).unwrap().sign(&keys).unwrap())
            .await
            .unwrap();
        assert!(api.list_replies(&q.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn server_errors_carry_the_message() {
        let relay = StubRelay::spawn(Behaviour::Accept).await;
        let server = TestApi::spawn(&relay).await;
        let api = &server.client;
        let err = api.list_replies("").await.unwrap_err();
        match err {
            ApiError::Server { status, message } => {
                assert_eq!(status, 400);
                assert!(message.contains("parentId"));
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[tokio::test]
    async fn unreachable_server_is_transport_error() {
        let api = ApiClient::new("http://127.0.0.1:9/api");
        assert!(matches!(
            api.list_events(1).await,
            Err(ApiError::Transport(_))
        ));
    }
}
