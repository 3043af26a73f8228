//! Client side of the community: feed loading, threading, unread tracking,
//! periodic refresh and the signed write flows (ask, reply, edit, delete,
//! clear-all).

use std::{future::Future, time::Duration};

use futures_util::future::join_all;
use thiserror::Error;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, warn};

use crate::{
    api::{ApiClient, ApiError},
    community::{ClearReport, QuestionQuery, CLEAR_ALL_LIMIT},
    event::{now, Event, EventError},
    projection::{assemble_thread, resolve_versions, Post, Thread},
    relay::PublishOutcome,
    session::{Session, SessionError, SessionStore},
    tagging::{
        deletion_draft, ConventionError, Permission, QuestionForm, ReplyForm, Role, Scope, TAG_PARENT,
    },
};

#[derive(Debug, Error)]
pub enum FeedError {
    #[error("teachers must choose both a subject and a grade, or neither")]
    IncompleteFilter,
    #[error("this question only accepts replies from {0}")]
    NotPermitted(&'static str),
    #[error("only the author can change this post")]
    NotAuthor,
    #[error("no post with id {0}")]
    NotFound(String),
    #[error(transparent)]
    Api(#[from] ApiError),
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error(transparent)]
    Convention(#[from] ConventionError),
    #[error(transparent)]
    Signing(#[from] EventError),
}

/// Subject/grade/author narrowing chosen in the feed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FeedFilter {
    pub subject: Option<String>,
    pub grade: Option<String>,
    pub author: Option<String>,
}

impl FeedFilter {
    fn to_query(&self) -> QuestionQuery {
        QuestionQuery {
            subject: self.subject.clone(),
            grade: self.grade.clone(),
            author: self.author.clone(),
        }
    }
}

/// Whether the feed may load for `role` with `filter`.
///
/// Teachers pick subject and grade together (or browse everything); students
/// can narrow freely.
pub fn can_load(role: Role, filter: &FeedFilter) -> bool {
    match role {
        Role::Student => true,
        Role::Teacher => is_set(&filter.subject) == is_set(&filter.grade),
    }
}

fn is_set(value: &Option<String>) -> bool {
    value.as_deref().is_some_and(|v| !v.trim().is_empty())
}

/// Whether `role` may answer `question`.
pub fn can_reply(question: &Event, role: Role) -> Result<bool, ConventionError> {
    Ok(Permission::of(question)?.allows(role))
}

/// One refresh of the feed.
#[derive(Debug, Clone, PartialEq)]
pub struct FeedSnapshot {
    /// Threads, newest question first.
    pub threads: Vec<Thread>,
    /// Newest `created_at` over every displayed post.
    pub newest: u64,
    /// Something newer than the watermark is on screen.
    pub unread: bool,
}

/// Feed bound to an API endpoint, a scope and the local session store.
#[derive(Debug, Clone)]
pub struct Feed {
    api: ApiClient,
    scope: Scope,
    store: SessionStore,
}

impl Feed {
    pub fn new(api: ApiClient, scope: Scope, store: SessionStore) -> Self {
        Self { api, scope, store }
    }

    /// Fetch questions, then every question's replies concurrently, and
    /// assemble threads.
    pub async fn load(&self, session: &Session, filter: &FeedFilter) -> Result<FeedSnapshot, FeedError> {
        if !can_load(session.role(), filter) {
            return Err(FeedError::IncompleteFilter);
        }
        let questions = self.api.list_questions(&filter.to_query()).await?;
        let replies = join_all(questions.iter().map(|q| self.api.list_replies(&q.id))).await;
        let mut threads = Vec::with_capacity(questions.len());
        for (question, replies) in questions.iter().zip(replies) {
            let replies = replies.unwrap_or_else(|e| {
                warn!(question = %question.id, error = %e, "reply fetch failed");
                Vec::new()
            });
            threads.push(assemble_thread(question, &replies));
        }
        threads.sort_by(|a, b| {
            b.question
                .created_at
                .cmp(&a.question.created_at)
                .then_with(|| a.question.id.cmp(&b.question.id))
        });
        let newest = threads
            .iter()
            .flat_map(|t| std::iter::once(&t.question).chain(&t.replies))
            .map(|p| p.updated_at)
            .max()
            .unwrap_or(0);
        let unread = newest > self.store.unread_since()?;
        debug!(threads = threads.len(), newest, unread, "feed loaded");
        Ok(FeedSnapshot {
            threads,
            newest,
            unread,
        })
    }

    /// Move the watermark to now.
    pub fn mark_all_read(&self) -> Result<u64, FeedError> {
        let ts = now();
        self.store.set_unread_since(ts)?;
        Ok(ts)
    }

    /// Refresh every `every` until `shutdown` resolves.
    ///
    /// A refresh is never started while the previous one is running; ticks
    /// missed during a slow refresh are delayed rather than bunched.
    pub async fn poll<S, F>(
        &self,
        session: &Session,
        filter: &FeedFilter,
        every: Duration,
        shutdown: S,
        mut on_refresh: F,
    ) where
        S: Future<Output = ()>,
        F: FnMut(Result<FeedSnapshot, FeedError>),
    {
        let mut ticker = interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                _ = ticker.tick() => {
                    let result = self.load(session, filter).await;
                    on_refresh(result);
                }
            }
        }
        debug!("feed polling stopped");
    }

    /// Sign and submit a question as the session's role.
    pub async fn ask(&self, session: &Session, mut form: QuestionForm) -> Result<PublishOutcome, FeedError> {
        form.role = Some(session.role());
        let ev = self
            .scope
            .question_draft(&form, session.pubkey())?
            .sign(&session.keys)?;
        Ok(self.api.submit_question(&ev).await?)
    }

    /// Sign and submit a reply, honouring the question's permission tag.
    pub async fn reply(&self, session: &Session, question: &Event, content: &str) -> Result<PublishOutcome, FeedError> {
        if !can_reply(question, session.role())? {
            return Err(FeedError::NotPermitted(Permission::of(question)?.as_str()));
        }
        let ev = self
            .scope
            .reply_draft(
                &ReplyForm {
                    content: content.to_string(),
                    parent_id: question.id.clone(),
                    role: Some(session.role()),
                    extra_tags: Vec::new(),
                },
                session.pubkey(),
            )?
            .sign(&session.keys)?;
        Ok(self.api.submit_reply(&question.id, &ev).await?)
    }

    /// Publish a new version of one of the session's own posts.
    pub async fn edit(&self, session: &Session, original: &Event, content: &str) -> Result<PublishOutcome, FeedError> {
        if original.pubkey != session.pubkey() {
            return Err(FeedError::NotAuthor);
        }
        let ev = self
            .scope
            .edit_draft(original, content, Some(session.role()), session.pubkey())?
            .sign(&session.keys)?;
        let parent = ev
            .first_tag(TAG_PARENT)
            .unwrap_or(original.id.as_str())
            .to_string();
        Ok(self.api.submit_reply(&parent, &ev).await?)
    }

    /// Retract every version of one of the session's own posts.
    pub async fn delete(&self, session: &Session, post: &Post) -> Result<Vec<PublishOutcome>, FeedError> {
        if post.pubkey != session.pubkey() {
            return Err(FeedError::NotAuthor);
        }
        let mut outcomes = Vec::with_capacity(post.versions.len());
        for id in &post.versions {
            let ev = deletion_draft(id)?.sign(&session.keys)?;
            outcomes.push(self.api.submit_deletion(&ev).await?);
        }
        Ok(outcomes)
    }

    /// Questions asked by the session's key, with edits folded in.
    pub async fn my_questions(&self, session: &Session) -> Result<Vec<Thread>, FeedError> {
        let filter = FeedFilter {
            author: Some(session.pubkey().to_string()),
            ..Default::default()
        };
        // Own questions are listed regardless of the teacher browsing gate.
        let questions = self.api.list_questions(&filter.to_query()).await?;
        let replies = join_all(questions.iter().map(|q| self.api.list_replies(&q.id))).await;
        Ok(questions
            .iter()
            .zip(replies)
            .map(|(q, r)| assemble_thread(q, &r.unwrap_or_default()))
            .collect())
    }

    /// Replies written by the session's key, edits folded in.
    pub async fn my_replies(&self, session: &Session) -> Result<Vec<Post>, FeedError> {
        let replies = self.api.list_replies_by_author(session.pubkey()).await?;
        Ok(resolve_versions(&replies))
    }

    /// Look up a live question by id among the scoped notes.
    pub async fn question(&self, id: &str) -> Result<Event, FeedError> {
        self.api
            .list_events(CLEAR_ALL_LIMIT)
            .await?
            .into_iter()
            .find(|ev| ev.id == id && ev.first_tag(TAG_PARENT).is_none())
            .ok_or_else(|| FeedError::NotFound(id.to_string()))
    }

    /// Locate one of the session's own events by id, as raw event and as
    /// displayed post.
    pub async fn find_own(&self, session: &Session, id: &str) -> Result<(Event, Post), FeedError> {
        let questions = self
            .api
            .list_questions(&QuestionQuery {
                author: Some(session.pubkey().to_string()),
                ..Default::default()
            })
            .await?;
        if let Some(q) = questions.into_iter().find(|q| q.id == id) {
            let replies = self.api.list_replies(&q.id).await?;
            let thread = assemble_thread(&q, &replies);
            return Ok((q, thread.question));
        }
        let replies = self.api.list_replies_by_author(session.pubkey()).await?;
        let post = resolve_versions(&replies)
            .into_iter()
            .find(|p| p.id == id)
            .ok_or_else(|| FeedError::NotFound(id.to_string()))?;
        let event = replies
            .into_iter()
            .find(|r| r.id == id)
            .ok_or_else(|| FeedError::NotFound(id.to_string()))?;
        Ok((event, post))
    }

    /// Discover every live scoped note, sign a deletion for each and submit
    /// them as one batch.
    pub async fn clear_all(&self, session: &Session) -> Result<ClearReport, FeedError> {
        let found = self.api.list_events(CLEAR_ALL_LIMIT).await?;
        let deletions = found
            .iter()
            .map(|ev| -> Result<Event, FeedError> { Ok(deletion_draft(&ev.id)?.sign(&session.keys)?) })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(self.api.clear_all(deletions).await?)
    }
}
