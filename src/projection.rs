//! Client-side projections over raw relay results: soft deletes, threading
//! and edit resolution. Relays never change stored events, so every listing
//! is recomputed from the raw event set.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::{
    event::{Event, Tag, KIND_DELETION},
    tagging::{TAG_EDIT_OF, TAG_PARENT},
};

/// Ids retracted by the `e` tags of kind-5 events in `deletions`.
pub fn deleted_ids(deletions: &[Event]) -> HashSet<&str> {
    deletions
        .iter()
        .filter(|d| d.kind == KIND_DELETION)
        .flat_map(|d| d.tag_values(TAG_PARENT))
        .collect()
}

/// Anti-join: drop every event referenced by a deletion request.
pub fn exclude_by_reference(events: Vec<Event>, deletions: &[Event]) -> Vec<Event> {
    let deleted = deleted_ids(deletions);
    if deleted.is_empty() {
        return events;
    }
    events
        .into_iter()
        .filter(|ev| !deleted.contains(ev.id.as_str()))
        .collect()
}

/// Keep top-level events only (no `e` tag).
pub fn exclude_replies(events: Vec<Event>) -> Vec<Event> {
    events
        .into_iter()
        .filter(|ev| ev.first_tag(TAG_PARENT).is_none())
        .collect()
}

/// Keep events that reference a parent.
pub fn only_replies(events: Vec<Event>) -> Vec<Event> {
    events
        .into_iter()
        .filter(|ev| ev.first_tag(TAG_PARENT).is_some())
        .collect()
}

/// Drop edits of questions. They travel on the reply path with the question
/// as both thread parent and edit target, but are not answers.
pub fn exclude_question_edits(events: Vec<Event>) -> Vec<Event> {
    events
        .into_iter()
        .filter(|ev| edit_target(ev).is_none() || edit_target(ev) != ev.first_tag(TAG_PARENT))
        .collect()
}

/// Keep events carrying every `(key, value)` pair.
pub fn require_tags(events: Vec<Event>, required: &[(&str, &str)]) -> Vec<Event> {
    events
        .into_iter()
        .filter(|ev| required.iter().all(|(k, v)| ev.has_tag(k, v)))
        .collect()
}

/// Newest first; ties broken by id so the order is stable across polls.
pub fn sort_newest_first(events: &mut [Event]) {
    events.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| a.id.cmp(&b.id)));
}

/// Target of an `edit-of` tag, if the event is an edit.
pub fn edit_target(ev: &Event) -> Option<&str> {
    ev.first_tag(TAG_EDIT_OF).filter(|t| !t.is_empty())
}

/// A post as displayed: the original event folded with its edits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Post {
    /// Id of the original event; replies and deletions target this.
    pub id: String,
    pub pubkey: String,
    pub created_at: u64,
    /// Timestamp of the displayed version.
    pub updated_at: u64,
    /// Content of the newest version.
    pub content: String,
    pub edited: bool,
    /// Tags of the original event.
    pub tags: Vec<Tag>,
    /// Every event id making up this post, original first.
    pub versions: Vec<String>,
}

impl Post {
    pub fn first_tag(&self, key: &str) -> Option<&str> {
        self.tags
            .iter()
            .find(|t| t.key() == Some(key))
            .and_then(Tag::value)
    }

    fn from_versions(original: &Event, edits: &[&Event]) -> Self {
        let latest = edits
            .iter()
            .copied()
            .max_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| b.id.cmp(&a.id)))
            .filter(|e| e.created_at >= original.created_at)
            .unwrap_or(original);
        let mut versions = vec![original.id.clone()];
        versions.extend(edits.iter().map(|e| e.id.clone()));
        Post {
            id: original.id.clone(),
            pubkey: original.pubkey.clone(),
            created_at: original.created_at,
            updated_at: latest.created_at,
            content: latest.content.clone(),
            edited: latest.id != original.id,
            tags: original.tags.clone(),
            versions,
        }
    }
}

/// Fold edits into the posts they supersede.
///
/// An event tagged `edit-of X` replaces `X` only when both share an author
/// and `X` is part of `events`; chains of edits collapse to their root and
/// the newest version is displayed. Edits of unknown targets stay standalone.
/// Output is ordered by the original's `created_at`, newest first.
pub fn resolve_versions(events: &[Event]) -> Vec<Post> {
    let by_id: HashMap<&str, &Event> = events.iter().map(|e| (e.id.as_str(), e)).collect();
    let mut roots: Vec<&Event> = Vec::new();
    let mut edits: HashMap<&str, Vec<&Event>> = HashMap::new();
    for ev in events {
        let root = root_of(&by_id, ev);
        if root.id == ev.id {
            roots.push(ev);
        } else {
            edits.entry(root.id.as_str()).or_default().push(ev);
        }
    }
    let mut posts: Vec<Post> = roots
        .into_iter()
        .map(|root| {
            let versions = edits.get(root.id.as_str()).map(Vec::as_slice).unwrap_or(&[]);
            Post::from_versions(root, versions)
        })
        .collect();
    posts.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| a.id.cmp(&b.id)));
    posts
}

/// The event `ev` replaces, when it is a same-author edit of a known event.
fn superseded<'a>(by_id: &HashMap<&'a str, &'a Event>, ev: &'a Event) -> Option<&'a Event> {
    let original = *by_id.get(edit_target(ev)?)?;
    (original.pubkey == ev.pubkey && original.id != ev.id).then_some(original)
}

/// Follow `edit-of` links back to the original; cycles stop at the first repeat.
fn root_of<'a>(by_id: &HashMap<&'a str, &'a Event>, ev: &'a Event) -> &'a Event {
    let mut current = ev;
    let mut seen = HashSet::new();
    while let Some(original) = superseded(by_id, current) {
        if !seen.insert(current.id.as_str()) {
            break;
        }
        current = original;
    }
    current
}

/// A question together with its visible replies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Thread {
    pub question: Post,
    pub replies: Vec<Post>,
}

/// Assemble a thread from a question and the raw events replying to it.
///
/// Edits of the question travel as replies; they are folded into the
/// question rather than listed as answers.
pub fn assemble_thread(question: &Event, replies: &[Event]) -> Thread {
    let (question_edits, answers): (Vec<&Event>, Vec<&Event>) = replies.iter().partition(|r| {
        edit_target(r) == Some(question.id.as_str()) && r.pubkey == question.pubkey
    });
    let answers: Vec<Event> = answers.into_iter().cloned().collect();
    Thread {
        question: Post::from_versions(question, &question_edits),
        replies: resolve_versions(&answers),
    }
}
