//! Community Q&A operations on top of the relay pool.
//!
//! Writes arrive as envelopes already signed by the key holder; they are
//! checked against the tagging conventions before being published. Reads
//! translate query parameters into relay filters and project the raw results
//! (reply exclusion, soft deletes).

use std::{sync::Arc, time::Duration};

use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::{
    event::{Event, KIND_DELETION, KIND_NOTE},
    filter::Filter,
    projection::{
        exclude_by_reference, exclude_question_edits, exclude_replies, only_replies, require_tags,
        sort_newest_first,
    },
    relay::{PublishOutcome, PublishStatus, RelayError, RelayPool},
    tagging::{check_deletion, ConventionError, Scope, TAG_AUTHOR, TAG_GRADE, TAG_PARENT, TAG_TOPIC},
};

pub const QUESTION_LIMIT: usize = 50;
pub const REPLY_LIMIT: usize = 50;
pub const AUTHOR_REPLY_LIMIT: usize = 100;
pub const DELETION_LIMIT: usize = 200;
pub const CLEAR_ALL_LIMIT: usize = 1000;

#[derive(Debug, Error)]
pub enum CommunityError {
    #[error(transparent)]
    Convention(#[from] ConventionError),
    #[error(transparent)]
    Relay(#[from] RelayError),
    #[error("publish rejected by relays: {0}")]
    Rejected(String),
}

/// Query deadlines per call site.
#[derive(Debug, Clone)]
pub struct QueryTimeouts {
    pub list: Duration,
    pub deletions: Duration,
    pub discovery: Duration,
}

impl Default for QueryTimeouts {
    fn default() -> Self {
        Self {
            list: Duration::from_millis(3000),
            deletions: Duration::from_millis(2500),
            discovery: Duration::from_millis(5000),
        }
    }
}

impl QueryTimeouts {
    /// Use `list` for listings and derive the other deadlines from it.
    pub fn from_list(list: Duration) -> Self {
        Self {
            list,
            deletions: list.mul_f64(5.0 / 6.0),
            discovery: list.mul_f64(5.0 / 3.0),
        }
    }
}

/// Parameters of `GET /community/questions`.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct QuestionQuery {
    pub subject: Option<String>,
    pub grade: Option<String>,
    /// Author public key (hex), matched through the `p` tag.
    pub author: Option<String>,
}

/// Outcome of a bulk deletion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClearReport {
    pub message: String,
    pub deleted_count: usize,
    pub failed_count: usize,
    pub total_found: usize,
}

/// Community operations bound to one relay pool and scope marker.
pub struct Community {
    pool: Arc<RelayPool>,
    scope: Scope,
    timeouts: QueryTimeouts,
}

impl Community {
    pub fn new(pool: Arc<RelayPool>, scope: Scope, timeouts: QueryTimeouts) -> Self {
        Self {
            pool,
            scope,
            timeouts,
        }
    }

    /// Publish a signed question after checking its tags.
    pub async fn submit_question(&self, ev: Event) -> Result<PublishOutcome, CommunityError> {
        self.scope.check_question(&ev)?;
        self.publish(&ev).await
    }

    /// Publish a signed reply addressed to `parent_id`.
    pub async fn submit_reply(&self, parent_id: &str, ev: Event) -> Result<PublishOutcome, CommunityError> {
        self.scope.check_reply(&ev, parent_id)?;
        self.publish(&ev).await
    }

    /// Publish a signed kind-5 request. Authorship of the target is not
    /// checked; honouring the request is up to each relay.
    pub async fn submit_deletion(&self, ev: Event) -> Result<PublishOutcome, CommunityError> {
        let target = check_deletion(&ev)?;
        debug!(target = %target, "publishing deletion");
        self.publish(&ev).await
    }

    async fn publish(&self, ev: &Event) -> Result<PublishOutcome, CommunityError> {
        let outcome = self.pool.publish(ev).await?;
        match &outcome.status {
            PublishStatus::Rejected { reason } => Err(CommunityError::Rejected(reason.clone())),
            PublishStatus::Confirmed { relay } => {
                info!(id = %outcome.id, relay = %relay, "published");
                Ok(outcome)
            }
            PublishStatus::Unconfirmed { .. } => {
                info!(id = %outcome.id, "published without acknowledgement");
                Ok(outcome)
            }
        }
    }

    /// Top-level questions in scope, optionally narrowed by subject, grade
    /// and author. Replies and soft-deleted questions are never listed.
    pub async fn list_questions(&self, q: &QuestionQuery) -> Result<Vec<Event>, CommunityError> {
        let subject = non_blank(&q.subject);
        let grade = non_blank(&q.grade);
        let author = non_blank(&q.author);

        // Relays OR the values of one tag key, so only the most selective
        // topic goes to them; scope and subject are both re-checked below.
        let mut filter = Filter::new()
            .kind(KIND_NOTE)
            .tag(TAG_TOPIC, subject.unwrap_or(self.scope.marker()))
            .limit(QUESTION_LIMIT);
        if let Some(grade) = grade {
            filter = filter.tag(TAG_GRADE, grade);
        }
        if let Some(author) = author {
            filter = filter.tag(TAG_AUTHOR, author);
        }
        let events = self.pool.query(vec![filter], self.timeouts.list).await?;

        let mut required = vec![(TAG_TOPIC, self.scope.marker())];
        if let Some(subject) = subject {
            required.push((TAG_TOPIC, subject));
        }
        if let Some(grade) = grade {
            required.push((TAG_GRADE, grade));
        }
        if let Some(author) = author {
            required.push((TAG_AUTHOR, author));
        }
        let events = exclude_replies(require_tags(events, &required));
        let mut events = self.without_deleted(events).await?;
        sort_newest_first(&mut events);
        debug!(count = events.len(), "listed questions");
        Ok(events)
    }

    /// Replies to `parent_id`, minus the ones retracted by kind-5 events.
    pub async fn list_replies(&self, parent_id: &str) -> Result<Vec<Event>, CommunityError> {
        let parent_id = parent_id.trim();
        if parent_id.is_empty() {
            return Err(ConventionError::Missing("parentId").into());
        }
        let filter = Filter::new()
            .kind(KIND_NOTE)
            .tag(TAG_TOPIC, self.scope.marker())
            .tag(TAG_PARENT, parent_id)
            .limit(REPLY_LIMIT);
        let events = self.pool.query(vec![filter], self.timeouts.list).await?;
        let events = require_tags(events, &[(TAG_PARENT, parent_id), (TAG_TOPIC, self.scope.marker())]);
        let mut events = self.without_deleted(events).await?;
        sort_newest_first(&mut events);
        Ok(events)
    }

    /// Replies written by `author`, minus soft-deleted ones.
    pub async fn list_replies_by_author(&self, author: &str) -> Result<Vec<Event>, CommunityError> {
        let author = author.trim();
        if author.is_empty() {
            return Err(ConventionError::Missing("author").into());
        }
        let filter = Filter::new()
            .kind(KIND_NOTE)
            .tag(TAG_TOPIC, self.scope.marker())
            .tag(TAG_AUTHOR, author)
            .limit(AUTHOR_REPLY_LIMIT);
        let events = self.pool.query(vec![filter], self.timeouts.list).await?;
        let events = exclude_question_edits(only_replies(require_tags(events, &[(TAG_AUTHOR, author)])));
        let mut events = self.without_deleted(events).await?;
        sort_newest_first(&mut events);
        Ok(events)
    }

    /// Every live scope-tagged note, questions and replies alike.
    pub async fn list_scoped(&self, limit: usize) -> Result<Vec<Event>, CommunityError> {
        let filter = Filter::new()
            .kind(KIND_NOTE)
            .tag(TAG_TOPIC, self.scope.marker())
            .limit(limit.clamp(1, CLEAR_ALL_LIMIT));
        let events = self.pool.query(vec![filter], self.timeouts.discovery).await?;
        let mut events = self.without_deleted(events).await?;
        sort_newest_first(&mut events);
        Ok(events)
    }

    /// Publish a batch of signed deletion requests concurrently.
    ///
    /// Every request is validated first; publishing is best effort and
    /// partial failure is reported in the counts.
    pub async fn clear_all(&self, deletions: Vec<Event>) -> Result<ClearReport, CommunityError> {
        for ev in &deletions {
            check_deletion(ev)?;
        }
        let total_found = deletions.len();
        let results = join_all(deletions.iter().map(|ev| self.pool.publish(ev))).await;
        let mut deleted_count = 0;
        let mut failed_count = 0;
        for result in results {
            match result {
                Ok(outcome) if !outcome.is_rejected() => deleted_count += 1,
                _ => failed_count += 1,
            }
        }
        info!(deleted_count, failed_count, total_found, "clear-all finished");
        Ok(ClearReport {
            message: format!("Published {deleted_count} of {total_found} deletion requests"),
            deleted_count,
            failed_count,
            total_found,
        })
    }

    /// Drop events retracted by kind-5 requests visible within the deadline.
    async fn without_deleted(&self, events: Vec<Event>) -> Result<Vec<Event>, CommunityError> {
        if events.is_empty() {
            return Ok(events);
        }
        let mut filter = Filter::new()
            .kind(KIND_DELETION)
            .limit(events.len().max(DELETION_LIMIT));
        for ev in &events {
            filter = filter.tag(TAG_PARENT, ev.id.as_str());
        }
        let deletions = self.pool.query(vec![filter], self.timeouts.deletions).await?;
        Ok(exclude_by_reference(events, &deletions))
    }
}

fn non_blank(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}
