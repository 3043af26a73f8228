//! Tagging conventions of the community feed.
//!
//! Clients use the `*_draft` builders to produce correctly tagged events
//! before signing them locally; the HTTP layer uses the `check_*` functions to
//! refuse envelopes that would escape the community scope or break threading.

use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::event::{Event, EventDraft, EventError, Tag, KIND_DELETION, KIND_NOTE};

pub const DEFAULT_SCOPE: &str = "blueorb";

pub const TAG_TOPIC: &str = "t";
pub const TAG_GRADE: &str = "g";
pub const TAG_PERM: &str = "perm";
pub const TAG_ROLE: &str = "role";
pub const TAG_AUTHOR: &str = "p";
pub const TAG_PARENT: &str = "e";
pub const TAG_EDIT_OF: &str = "edit-of";

/// Subjects offered by the client pickers.
pub const SUBJECTS: [&str; 8] = [
    "Math",
    "Science",
    "English",
    "Biology",
    "Chemistry",
    "Physics",
    "History",
    "Geography",
];

/// Grades offered by the client pickers.
pub const GRADES: [&str; 12] = [
    "Primary 1",
    "Primary 2",
    "Primary 3",
    "Primary 4",
    "Primary 5",
    "Primary 6",
    "JSS 1",
    "JSS 2",
    "JSS 3",
    "SSS 1",
    "SSS 2",
    "SSS 3",
];

#[derive(Debug, Error)]
pub enum ConventionError {
    #[error("missing {0}")]
    Missing(&'static str),
    #[error("expected kind {expected}, got {got}")]
    WrongKind { expected: u32, got: u32 },
    #[error("event is not tagged with the community scope")]
    OutOfScope,
    #[error("a question must not reference a parent event")]
    UnexpectedParent,
    #[error("reply does not reference parent {0}")]
    ParentMismatch(String),
    #[error("author tag does not match the signing key")]
    AuthorMismatch,
    #[error("unknown {key} value: {value}")]
    UnknownValue { key: &'static str, value: String },
    #[error(transparent)]
    Invalid(#[from] EventError),
}

/// Author role at post time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    #[default]
    Student,
    Teacher,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::Student => "student",
            Role::Teacher => "teacher",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = ConventionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "student" => Ok(Role::Student),
            "teacher" => Ok(Role::Teacher),
            other => Err(ConventionError::UnknownValue {
                key: TAG_ROLE,
                value: other.to_string(),
            }),
        }
    }
}

/// Who may answer a question.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Permission {
    #[default]
    Both,
    Teachers,
    Students,
}

impl Permission {
    pub fn as_str(self) -> &'static str {
        match self {
            Permission::Both => "both",
            Permission::Teachers => "teachers",
            Permission::Students => "students",
        }
    }

    pub fn allows(self, role: Role) -> bool {
        match self {
            Permission::Both => true,
            Permission::Teachers => role == Role::Teacher,
            Permission::Students => role == Role::Student,
        }
    }

    /// Permission recorded on `question`; untagged questions accept anyone.
    pub fn of(question: &Event) -> Result<Self, ConventionError> {
        question
            .first_tag(TAG_PERM)
            .map_or(Ok(Permission::Both), str::parse)
    }
}

impl FromStr for Permission {
    type Err = ConventionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "both" => Ok(Permission::Both),
            "teachers" => Ok(Permission::Teachers),
            "students" => Ok(Permission::Students),
            other => Err(ConventionError::UnknownValue {
                key: TAG_PERM,
                value: other.to_string(),
            }),
        }
    }
}

/// Fields collected by the "ask a question" form.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QuestionForm {
    pub content: String,
    pub subject: Option<String>,
    pub grade: Option<String>,
    pub allow: Option<Permission>,
    pub role: Option<Role>,
}

/// Fields collected by the reply box.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReplyForm {
    pub content: String,
    pub parent_id: String,
    pub role: Option<Role>,
    /// Extra tags passed through verbatim (the edit flow adds `edit-of`).
    pub extra_tags: Vec<Tag>,
}

/// Community scope marker plus the rules derived from it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Scope {
    marker: String,
}

impl Default for Scope {
    fn default() -> Self {
        Self::new(DEFAULT_SCOPE)
    }
}

impl Scope {
    pub fn new(marker: impl Into<String>) -> Self {
        Self {
            marker: marker.into(),
        }
    }

    pub fn marker(&self) -> &str {
        &self.marker
    }

    fn scope_tag(&self) -> Tag {
        Tag::new(TAG_TOPIC, self.marker.as_str())
    }

    pub fn question_draft(&self, form: &QuestionForm, author: &str) -> Result<EventDraft, ConventionError> {
        let content = non_empty(&form.content, "content")?;
        let mut tags = vec![self.scope_tag()];
        if let Some(subject) = present(&form.subject) {
            tags.push(Tag::new(TAG_TOPIC, subject));
        }
        if let Some(grade) = present(&form.grade) {
            tags.push(Tag::new(TAG_GRADE, grade));
        }
        if let Some(allow) = form.allow {
            tags.push(Tag::new(TAG_PERM, allow.as_str()));
        }
        if let Some(role) = form.role {
            tags.push(Tag::new(TAG_ROLE, role.as_str()));
        }
        tags.push(Tag::new(TAG_AUTHOR, author));
        Ok(EventDraft::new(KIND_NOTE, content, tags))
    }

    pub fn reply_draft(&self, form: &ReplyForm, author: &str) -> Result<EventDraft, ConventionError> {
        let content = non_empty(&form.content, "content")?;
        let parent = non_empty(&form.parent_id, "parentId")?;
        let mut tags = vec![
            Tag::new(TAG_PARENT, parent),
            self.scope_tag(),
            Tag::new(TAG_ROLE, form.role.unwrap_or_default().as_str()),
            Tag::new(TAG_AUTHOR, author),
        ];
        tags.extend(
            form.extra_tags
                .iter()
                .filter(|t| t.key().is_some_and(|k| !k.is_empty()))
                .cloned(),
        );
        Ok(EventDraft::new(KIND_NOTE, content, tags))
    }

    /// Build a replacement for `original` published through the reply path.
    ///
    /// The edit keeps the original's thread parent; editing a question makes
    /// the question itself the parent so the edit travels with its thread.
    pub fn edit_draft(
        &self,
        original: &Event,
        content: &str,
        role: Option<Role>,
        author: &str,
    ) -> Result<EventDraft, ConventionError> {
        let parent = original.first_tag(TAG_PARENT).unwrap_or(original.id.as_str());
        self.reply_draft(
            &ReplyForm {
                content: content.to_string(),
                parent_id: parent.to_string(),
                role,
                extra_tags: vec![Tag::new(TAG_EDIT_OF, original.id.as_str())],
            },
            author,
        )
    }

    /// Validate a signed question envelope.
    pub fn check_question(&self, ev: &Event) -> Result<(), ConventionError> {
        self.check_note(ev)?;
        if ev.first_tag(TAG_PARENT).is_some() {
            return Err(ConventionError::UnexpectedParent);
        }
        if let Some(perm) = ev.first_tag(TAG_PERM) {
            perm.parse::<Permission>()?;
        }
        Ok(())
    }

    /// Validate a signed reply envelope addressed to `parent_id`.
    pub fn check_reply(&self, ev: &Event, parent_id: &str) -> Result<(), ConventionError> {
        non_empty(parent_id, "parentId")?;
        self.check_note(ev)?;
        if !ev.has_tag(TAG_PARENT, parent_id) {
            return Err(ConventionError::ParentMismatch(parent_id.to_string()));
        }
        Ok(())
    }

    fn check_note(&self, ev: &Event) -> Result<(), ConventionError> {
        if ev.kind != KIND_NOTE {
            return Err(ConventionError::WrongKind {
                expected: KIND_NOTE,
                got: ev.kind,
            });
        }
        non_empty(&ev.content, "content")?;
        if !ev.has_tag(TAG_TOPIC, &self.marker) {
            return Err(ConventionError::OutOfScope);
        }
        if let Some(role) = ev.first_tag(TAG_ROLE) {
            role.parse::<Role>()?;
        }
        if ev.tag_values(TAG_AUTHOR).any(|p| p != ev.pubkey) {
            return Err(ConventionError::AuthorMismatch);
        }
        ev.verify()?;
        Ok(())
    }
}

/// Kind-5 request retracting `target`.
pub fn deletion_draft(target: &str) -> Result<EventDraft, ConventionError> {
    let target = non_empty(target, "eventId")?;
    Ok(EventDraft::new(
        KIND_DELETION,
        String::new(),
        vec![Tag::new(TAG_PARENT, target)],
    ))
}

/// Validate a signed deletion request and return the id it retracts.
pub fn check_deletion(ev: &Event) -> Result<String, ConventionError> {
    if ev.kind != KIND_DELETION {
        return Err(ConventionError::WrongKind {
            expected: KIND_DELETION,
            got: ev.kind,
        });
    }
    let target = ev
        .first_tag(TAG_PARENT)
        .filter(|t| !t.is_empty())
        .ok_or(ConventionError::Missing("eventId"))?
        .to_string();
    ev.verify()?;
    Ok(target)
}

fn non_empty<'a>(value: &'a str, field: &'static str) -> Result<&'a str, ConventionError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        Err(ConventionError::Missing(field))
    } else {
        Ok(value)
    }
}

fn present(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}
