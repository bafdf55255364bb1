//! Records served by the Kazador backend.
//!
//! The backend owns these records and keeps them consistent. The client
//! deserializes them leniently and renders them.

use std::fmt;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Where a calendar event came from. Unknown origins are kept verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum EventOrigin {
    Google,
    Kazador,
    Other(String),
}

impl From<String> for EventOrigin {
    fn from(value: String) -> Self {
        match value.to_ascii_lowercase().as_str() {
            "google" => Self::Google,
            "kazador" | "internal" => Self::Kazador,
            _ => Self::Other(value),
        }
    }
}

impl From<EventOrigin> for String {
    fn from(value: EventOrigin) -> Self {
        match value {
            EventOrigin::Google => "google".to_string(),
            EventOrigin::Kazador => "kazador".to_string(),
            EventOrigin::Other(raw) => raw,
        }
    }
}

impl Default for EventOrigin {
    fn default() -> Self {
        Self::Kazador
    }
}

/// Calendar metadata attached to an event.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceRef {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub summary: Option<String>,
    #[serde(default)]
    pub calendar_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CalendarEvent {
    pub id: String,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub start_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub end_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub is_all_day: bool,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub origin: EventOrigin,
    #[serde(default)]
    pub source_id: Option<String>,
    #[serde(default)]
    pub source: Option<SourceRef>,
    #[serde(default)]
    pub project_id: Option<String>,
    #[serde(default)]
    pub raw: Option<Value>,
}

impl CalendarEvent {
    /// Start falling back to end, and end falling back to start.
    /// `None` when the event carries no timestamp at all.
    pub fn effective_span(&self) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
        let start = self.start_at.or(self.end_at)?;
        let end = self.end_at.or(self.start_at)?;
        Some((start, end))
    }

    /// Link into the provider's UI, taken from the raw payload.
    pub fn deep_link(&self) -> Option<&str> {
        self.raw
            .as_ref()?
            .get("htmlLink")?
            .as_str()
            .filter(|link| !link.trim().is_empty())
    }

    pub fn calendar_label(&self) -> Option<&str> {
        let source = self.source.as_ref()?;
        source
            .summary
            .as_deref()
            .or(source.calendar_id.as_deref())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CalendarSource {
    pub id: String,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub calendar_id: String,
    #[serde(default)]
    pub account_email: Option<String>,
    #[serde(default)]
    pub timezone: Option<String>,
    #[serde(default)]
    pub last_synced_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub metadata: Value,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateEventRequest {
    pub summary: String,
    pub start_at: DateTime<Utc>,
    pub end_at: DateTime<Utc>,
    pub is_all_day: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncSummary {
    #[serde(default)]
    pub source_id: String,
    #[serde(default)]
    pub created: usize,
    #[serde(default)]
    pub updated: usize,
    #[serde(default)]
    pub deleted: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ProjectStatus {
    Active,
    Paused,
    Archived,
    Other(String),
}

impl From<String> for ProjectStatus {
    fn from(value: String) -> Self {
        match value.to_ascii_lowercase().as_str() {
            "active" => Self::Active,
            "paused" => Self::Paused,
            "archived" => Self::Archived,
            _ => Self::Other(value),
        }
    }
}

impl From<ProjectStatus> for String {
    fn from(value: ProjectStatus) -> Self {
        value.to_string()
    }
}

impl fmt::Display for ProjectStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Active => f.write_str("active"),
            Self::Paused => f.write_str("paused"),
            Self::Archived => f.write_str("archived"),
            Self::Other(raw) => f.write_str(raw),
        }
    }
}

impl Default for ProjectStatus {
    fn default() -> Self {
        Self::Active
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Project {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub slug: Option<String>,
    #[serde(default)]
    pub status: ProjectStatus,
    #[serde(default)]
    pub color: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub start_date: Option<NaiveDate>,
    #[serde(default)]
    pub end_date: Option<NaiveDate>,
    #[serde(default)]
    pub labels: Vec<String>,
}

/// Partial update sent with `PATCH /projects/{id}`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<ProjectStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum TaskStatus {
    Todo,
    InProgress,
    Blocked,
    Done,
    Other(String),
}

impl From<String> for TaskStatus {
    fn from(value: String) -> Self {
        match value.to_ascii_lowercase().replace('-', "_").as_str() {
            "todo" => Self::Todo,
            "in_progress" => Self::InProgress,
            "blocked" => Self::Blocked,
            "done" => Self::Done,
            _ => Self::Other(value),
        }
    }
}

impl From<TaskStatus> for String {
    fn from(value: TaskStatus) -> Self {
        value.to_string()
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Todo => f.write_str("todo"),
            Self::InProgress => f.write_str("in_progress"),
            Self::Blocked => f.write_str("blocked"),
            Self::Done => f.write_str("done"),
            Self::Other(raw) => f.write_str(raw),
        }
    }
}

impl Default for TaskStatus {
    fn default() -> Self {
        Self::Todo
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectTask {
    pub id: String,
    pub project_id: String,
    pub title: String,
    #[serde(default)]
    pub status: TaskStatus,
    #[serde(default)]
    pub due_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub priority: Option<i32>,
    #[serde(default)]
    pub assignee_id: Option<String>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskCreate {
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub due_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub priority: Option<i32>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<TaskStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub due_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub priority: Option<i32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimelineItemKind {
    Event,
    Milestone,
    Task,
    Hold,
    Lead,
    Gate,
}

impl TimelineItemKind {
    pub fn from_key(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "event" => Some(Self::Event),
            "milestone" => Some(Self::Milestone),
            "task" => Some(Self::Task),
            "hold" => Some(Self::Hold),
            "lead" => Some(Self::Lead),
            "gate" => Some(Self::Gate),
            _ => None,
        }
    }
}

impl fmt::Display for TimelineItemKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Event => "event",
            Self::Milestone => "milestone",
            Self::Task => "task",
            Self::Hold => "hold",
            Self::Lead => "lead",
            Self::Gate => "gate",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimelineItem {
    pub id: String,
    pub project_id: String,
    #[serde(rename = "type")]
    pub kind: TimelineItemKind,
    pub title: String,
    #[serde(default)]
    pub starts_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub ends_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub lane: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub priority: Option<i32>,
    #[serde(default)]
    pub labels: Vec<String>,
}

impl TimelineItem {
    pub fn effective_start(&self) -> Option<DateTime<Utc>> {
        self.starts_at.or(self.ends_at)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimelineItemCreate {
    #[serde(rename = "type")]
    pub kind: TimelineItemKind,
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub starts_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ends_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lane: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum DependencyKind {
    #[default]
    #[serde(rename = "FS")]
    FinishToStart,
    #[serde(rename = "SS")]
    StartToStart,
}

impl DependencyKind {
    pub fn from_key(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_uppercase().as_str() {
            "FS" | "FINISH_TO_START" => Some(Self::FinishToStart),
            "SS" | "START_TO_START" => Some(Self::StartToStart),
            _ => None,
        }
    }
}

impl fmt::Display for DependencyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::FinishToStart => f.write_str("FS"),
            Self::StartToStart => f.write_str("SS"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimelineDependency {
    pub id: String,
    pub project_id: String,
    pub from_item_id: String,
    pub to_item_id: String,
    #[serde(default)]
    pub kind: DependencyKind,
    #[serde(default)]
    pub note: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DependencyCreate {
    pub from_item_id: String,
    pub to_item_id: String,
    pub kind: DependencyKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Declined,
}

impl ApprovalStatus {
    pub fn from_key(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "pending" => Some(Self::Pending),
            "approved" => Some(Self::Approved),
            "declined" => Some(Self::Declined),
            _ => None,
        }
    }

    pub fn as_key(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Declined => "declined",
        }
    }
}

impl fmt::Display for ApprovalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_key())
    }
}

/// Decision posted to `/approvals/{id}/{decision}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApprovalDecision {
    Approve,
    Decline,
}

impl ApprovalDecision {
    pub fn as_path(self) -> &'static str {
        match self {
            Self::Approve => "approve",
            Self::Decline => "decline",
        }
    }

    pub fn resulting_status(self) -> ApprovalStatus {
        match self {
            Self::Approve => ApprovalStatus::Approved,
            Self::Decline => ApprovalStatus::Declined,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApprovalRecord {
    pub id: String,
    #[serde(default)]
    pub project_id: Option<String>,
    #[serde(rename = "type")]
    pub kind: String,
    pub status: ApprovalStatus,
    #[serde(default)]
    pub summary: Option<String>,
    #[serde(default)]
    pub payload: Value,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub resolved_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub resolved_by: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DigestPeriod {
    #[default]
    Daily,
    Weekly,
}

impl DigestPeriod {
    pub fn as_key(self) -> &'static str {
        match self {
            Self::Daily => "daily",
            Self::Weekly => "weekly",
        }
    }

    pub fn from_key(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "daily" => Some(Self::Daily),
            "weekly" => Some(Self::Weekly),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DigestAction {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub kind: String,
    #[serde(default)]
    pub project_id: Option<String>,
    #[serde(default)]
    pub project_name: Option<String>,
    #[serde(default)]
    pub score: f64,
    #[serde(default)]
    pub due_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub rationale: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectMetrics {
    #[serde(default)]
    pub open_tasks: u32,
    #[serde(default)]
    pub upcoming_timeline: u32,
    #[serde(default)]
    pub linked_emails: u32,
    #[serde(default)]
    pub conflicts: u32,
    #[serde(default)]
    pub health_score: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectSummary {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub status: ProjectStatus,
    #[serde(default)]
    pub color: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectDigest {
    pub project: ProjectSummary,
    #[serde(default)]
    pub metrics: ProjectMetrics,
    #[serde(default)]
    pub top_actions: Vec<DigestAction>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DigestPayload {
    pub generated_at: DateTime<Utc>,
    #[serde(default)]
    pub period: DigestPeriod,
    #[serde(default)]
    pub top_actions: Vec<DigestAction>,
    #[serde(default)]
    pub projects: Vec<ProjectDigest>,
    #[serde(default)]
    pub meta: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmailRecord {
    pub id: String,
    #[serde(default)]
    pub from_name: Option<String>,
    pub from_email: String,
    #[serde(default)]
    pub subject: String,
    #[serde(default)]
    pub summary: Option<String>,
    pub received_at: DateTime<Utc>,
    #[serde(default)]
    pub labels: Vec<String>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub is_read: bool,
    #[serde(default)]
    pub priority_score: Option<f64>,
}

impl EmailRecord {
    pub fn sender(&self) -> &str {
        self.from_name
            .as_deref()
            .filter(|name| !name.trim().is_empty())
            .unwrap_or(&self.from_email)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UserRole {
    Admin,
    Member,
    Viewer,
}

impl UserRole {
    pub fn from_key(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "admin" => Some(Self::Admin),
            "member" => Some(Self::Member),
            "viewer" => Some(Self::Viewer),
            _ => None,
        }
    }
}

impl fmt::Display for UserRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Admin => f.write_str("admin"),
            Self::Member => f.write_str("member"),
            Self::Viewer => f.write_str("viewer"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdminUser {
    pub id: String,
    pub email: String,
    #[serde(default)]
    pub display_name: Option<String>,
    pub role: UserRole,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_sign_in_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdminUserPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<UserRole>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn event_tolerates_missing_fields_and_keeps_unknown_origin() {
        let event: CalendarEvent = serde_json::from_value(json!({
            "id": "e1",
            "summary": "Soundcheck",
            "startAt": null,
            "origin": "outlook",
            "someExtra": 3
        }))
        .expect("event should parse");

        assert_eq!(event.origin, EventOrigin::Other("outlook".to_string()));
        assert!(event.effective_span().is_none());
        assert!(!event.is_all_day);
    }

    #[test]
    fn effective_span_substitutes_missing_end() {
        let event: CalendarEvent = serde_json::from_value(json!({
            "id": "e2",
            "startAt": "2024-01-10T09:00:00Z"
        }))
        .expect("event should parse");

        let (start, end) = event.effective_span().expect("span");
        assert_eq!(start, end);
    }

    #[test]
    fn deep_link_reads_html_link_from_raw_payload() {
        let event: CalendarEvent = serde_json::from_value(json!({
            "id": "e3",
            "origin": "google",
            "raw": { "htmlLink": "https://calendar.google.com/event?eid=abc" }
        }))
        .expect("event should parse");

        assert_eq!(event.origin, EventOrigin::Google);
        assert_eq!(
            event.deep_link(),
            Some("https://calendar.google.com/event?eid=abc")
        );
    }

    #[test]
    fn task_status_accepts_dashed_spelling() {
        let status: TaskStatus =
            serde_json::from_value(json!("in-progress")).expect("status");
        assert_eq!(status, TaskStatus::InProgress);
        assert_eq!(String::from(status), "in_progress");
    }

    #[test]
    fn timeline_item_reads_type_field() {
        let item: TimelineItem = serde_json::from_value(json!({
            "id": "t1",
            "projectId": "p1",
            "type": "milestone",
            "title": "Album release"
        }))
        .expect("item should parse");
        assert_eq!(item.kind, TimelineItemKind::Milestone);
        assert!(item.effective_start().is_none());
    }
}
