//! In-process [`Backend`] over a JSON snapshot, for offline use and tests.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use anyhow::{Context, anyhow, bail};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tracing::{debug, info, instrument};
use uuid::Uuid;

use crate::client::{Backend, EventQuery};
use crate::digest::MAX_EMAIL_ROWS;
use crate::model::{
    AdminUser, AdminUserPatch, ApprovalDecision, ApprovalRecord, ApprovalStatus, CalendarEvent,
    CalendarSource, CreateEventRequest, DependencyCreate, DigestPayload, DigestPeriod, EmailRecord,
    EventOrigin, Project, ProjectPatch, ProjectTask, SourceRef, SyncSummary, TaskCreate, TaskPatch,
    TaskStatus, TimelineDependency, TimelineItem, TimelineItemCreate,
};

/// Every collection the backend serves.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Snapshot {
    pub events: Vec<CalendarEvent>,
    pub sources: Vec<CalendarSource>,
    pub projects: Vec<Project>,
    pub tasks: Vec<ProjectTask>,
    pub timeline: Vec<TimelineItem>,
    pub dependencies: Vec<TimelineDependency>,
    pub approvals: Vec<ApprovalRecord>,
    pub digests: Vec<DigestPayload>,
    pub emails: Vec<EmailRecord>,
    pub users: Vec<AdminUser>,
}

#[derive(Debug, Default)]
pub struct MemoryBackend {
    state: Mutex<Snapshot>,
    path: Option<PathBuf>,
}

impl MemoryBackend {
    pub fn new(snapshot: Snapshot) -> Self {
        Self {
            state: Mutex::new(snapshot),
            path: None,
        }
    }

    /// Loads `path`, or starts empty when it does not exist yet. Mutations
    /// are written back to the same file.
    #[instrument(skip(path), fields(path = %path.display()))]
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        let snapshot = if path.exists() {
            let text = fs::read_to_string(path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            serde_json::from_str::<Snapshot>(&text)
                .with_context(|| format!("failed parsing fixture {}", path.display()))?
        } else {
            info!("fixture does not exist yet; starting empty");
            Snapshot::default()
        };

        info!(
            events = snapshot.events.len(),
            projects = snapshot.projects.len(),
            emails = snapshot.emails.len(),
            "opened memory backend"
        );

        Ok(Self {
            state: Mutex::new(snapshot),
            path: Some(path.to_path_buf()),
        })
    }

    /// Copy of the current state.
    pub fn snapshot(&self) -> anyhow::Result<Snapshot> {
        Ok(self.lock()?.clone())
    }

    fn lock(&self) -> anyhow::Result<MutexGuard<'_, Snapshot>> {
        self.state
            .lock()
            .map_err(|_| anyhow!("memory backend state is poisoned"))
    }

    fn read<T>(&self, f: impl FnOnce(&Snapshot) -> anyhow::Result<T>) -> anyhow::Result<T> {
        let state = self.lock()?;
        f(&state)
    }

    fn mutate<T>(
        &self,
        f: impl FnOnce(&mut Snapshot) -> anyhow::Result<T>,
    ) -> anyhow::Result<T> {
        let mut state = self.lock()?;
        let value = f(&mut state)?;
        if let Some(path) = &self.path {
            save_json_atomic(path, &state)?;
        }
        Ok(value)
    }
}

#[instrument(skip(path, snapshot))]
fn save_json_atomic(path: &Path, snapshot: &Snapshot) -> anyhow::Result<()> {
    debug!(file = %path.display(), "saving fixture atomically");

    let dir = path
        .parent()
        .filter(|dir| !dir.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let mut temp = NamedTempFile::new_in(dir)?;
    serde_json::to_writer_pretty(&mut temp, snapshot)?;
    writeln!(temp)?;
    temp.flush()?;

    temp.persist(path)
        .map_err(|err| anyhow!("failed to persist {}: {}", path.display(), err))?;

    Ok(())
}

fn new_id() -> String {
    Uuid::new_v4().to_string()
}

fn require_text<'a>(value: &'a str, field: &str) -> anyhow::Result<&'a str> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        bail!("{field} is required");
    }
    Ok(trimmed)
}

fn find_project<'a>(state: &'a Snapshot, project_id: &str) -> anyhow::Result<&'a Project> {
    state
        .projects
        .iter()
        .find(|project| project.id == project_id)
        .ok_or_else(|| anyhow!("project {project_id} not found"))
}

impl Backend for MemoryBackend {
    #[instrument(skip(self))]
    async fn list_events(&self, query: &EventQuery) -> anyhow::Result<Vec<CalendarEvent>> {
        self.read(|state| {
            let mut events = state
                .events
                .iter()
                .filter(|event| {
                    query
                        .source_id
                        .as_deref()
                        .is_none_or(|source| event.source_id.as_deref() == Some(source))
                })
                .filter(|event| {
                    event
                        .effective_span()
                        .is_some_and(|(start, end)| end >= query.from && start < query.to)
                })
                .cloned()
                .collect::<Vec<_>>();
            events.sort_by_key(|event| event.start_at);
            debug!(count = events.len(), "listed events");
            Ok(events)
        })
    }

    #[instrument(skip(self, request), fields(summary = %request.summary))]
    async fn create_event(&self, request: &CreateEventRequest) -> anyhow::Result<CalendarEvent> {
        self.mutate(|state| {
            let summary = require_text(&request.summary, "summary")?;
            if request.end_at < request.start_at {
                bail!("event must not end before it starts");
            }

            let source = match request.source_id.as_deref() {
                Some(source_id) => {
                    let source = state
                        .sources
                        .iter()
                        .find(|source| source.id == source_id)
                        .ok_or_else(|| anyhow!("calendar source {source_id} not found"))?;
                    Some(SourceRef {
                        id: Some(source.id.clone()),
                        summary: Some(source.summary.clone()),
                        calendar_id: Some(source.calendar_id.clone()),
                    })
                }
                None => None,
            };

            let event = CalendarEvent {
                id: new_id(),
                summary: summary.to_string(),
                description: request.description.clone(),
                location: request.location.clone(),
                start_at: Some(request.start_at),
                end_at: Some(request.end_at),
                is_all_day: request.is_all_day,
                status: Some("confirmed".to_string()),
                origin: EventOrigin::Kazador,
                source_id: request.source_id.clone(),
                source,
                project_id: request.project_id.clone(),
                raw: None,
            };
            info!(id = %event.id, "created event");
            state.events.push(event.clone());
            Ok(event)
        })
    }

    async fn list_sources(&self) -> anyhow::Result<Vec<CalendarSource>> {
        self.read(|state| Ok(state.sources.clone()))
    }

    #[instrument(skip(self))]
    async fn sync_source(&self, source_id: &str) -> anyhow::Result<SyncSummary> {
        self.mutate(|state| {
            let source = state
                .sources
                .iter_mut()
                .find(|source| source.id == source_id)
                .ok_or_else(|| anyhow!("calendar source {source_id} not found"))?;
            source.last_synced_at = Some(Utc::now());
            Ok(SyncSummary {
                source_id: source_id.to_string(),
                ..SyncSummary::default()
            })
        })
    }

    async fn list_projects(&self) -> anyhow::Result<Vec<Project>> {
        self.read(|state| {
            let mut projects = state.projects.clone();
            projects.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.id.cmp(&b.id)));
            Ok(projects)
        })
    }

    async fn get_project(&self, project_id: &str) -> anyhow::Result<Project> {
        self.read(|state| find_project(state, project_id).cloned())
    }

    #[instrument(skip(self, patch))]
    async fn update_project(
        &self,
        project_id: &str,
        patch: &ProjectPatch,
    ) -> anyhow::Result<Project> {
        self.mutate(|state| {
            let project = state
                .projects
                .iter_mut()
                .find(|project| project.id == project_id)
                .ok_or_else(|| anyhow!("project {project_id} not found"))?;
            if let Some(name) = &patch.name {
                project.name = require_text(name, "name")?.to_string();
            }
            if let Some(status) = &patch.status {
                project.status = status.clone();
            }
            if let Some(description) = &patch.description {
                project.description = Some(description.clone());
            }
            if let Some(color) = &patch.color {
                project.color = Some(color.clone());
            }
            Ok(project.clone())
        })
    }

    async fn list_tasks(&self, project_id: &str) -> anyhow::Result<Vec<ProjectTask>> {
        self.read(|state| {
            find_project(state, project_id)?;
            Ok(state
                .tasks
                .iter()
                .filter(|task| task.project_id == project_id)
                .cloned()
                .collect())
        })
    }

    #[instrument(skip(self, task), fields(title = %task.title))]
    async fn create_task(&self, project_id: &str, task: &TaskCreate) -> anyhow::Result<ProjectTask> {
        self.mutate(|state| {
            find_project(state, project_id)?;
            let created = ProjectTask {
                id: new_id(),
                project_id: project_id.to_string(),
                title: require_text(&task.title, "title")?.to_string(),
                status: TaskStatus::Todo,
                due_at: task.due_at,
                priority: task.priority,
                assignee_id: None,
                created_at: Some(Utc::now()),
            };
            state.tasks.push(created.clone());
            Ok(created)
        })
    }

    #[instrument(skip(self, patch))]
    async fn update_task(&self, task_id: &str, patch: &TaskPatch) -> anyhow::Result<ProjectTask> {
        self.mutate(|state| {
            let task = state
                .tasks
                .iter_mut()
                .find(|task| task.id == task_id)
                .ok_or_else(|| anyhow!("task {task_id} not found"))?;
            if let Some(title) = &patch.title {
                task.title = require_text(title, "title")?.to_string();
            }
            if let Some(status) = &patch.status {
                task.status = status.clone();
            }
            if patch.due_at.is_some() {
                task.due_at = patch.due_at;
            }
            if patch.priority.is_some() {
                task.priority = patch.priority;
            }
            Ok(task.clone())
        })
    }

    async fn list_timeline(&self, project_id: &str) -> anyhow::Result<Vec<TimelineItem>> {
        self.read(|state| {
            find_project(state, project_id)?;
            Ok(state
                .timeline
                .iter()
                .filter(|item| item.project_id == project_id)
                .cloned()
                .collect())
        })
    }

    #[instrument(skip(self, item), fields(title = %item.title))]
    async fn create_timeline_item(
        &self,
        project_id: &str,
        item: &TimelineItemCreate,
    ) -> anyhow::Result<TimelineItem> {
        self.mutate(|state| {
            find_project(state, project_id)?;
            if let (Some(start), Some(end)) = (item.starts_at, item.ends_at)
                && end < start
            {
                bail!("timeline item must not end before it starts");
            }
            let created = TimelineItem {
                id: new_id(),
                project_id: project_id.to_string(),
                kind: item.kind,
                title: require_text(&item.title, "title")?.to_string(),
                starts_at: item.starts_at,
                ends_at: item.ends_at,
                lane: item.lane.clone(),
                status: None,
                priority: None,
                labels: vec![],
            };
            state.timeline.push(created.clone());
            Ok(created)
        })
    }

    async fn list_dependencies(
        &self,
        project_id: &str,
    ) -> anyhow::Result<Vec<TimelineDependency>> {
        self.read(|state| {
            find_project(state, project_id)?;
            Ok(state
                .dependencies
                .iter()
                .filter(|dependency| dependency.project_id == project_id)
                .cloned()
                .collect())
        })
    }

    #[instrument(skip(self, dependency))]
    async fn create_dependency(
        &self,
        project_id: &str,
        dependency: &DependencyCreate,
    ) -> anyhow::Result<TimelineDependency> {
        self.mutate(|state| {
            if dependency.from_item_id == dependency.to_item_id {
                bail!("a timeline item cannot depend on itself");
            }
            for item_id in [&dependency.from_item_id, &dependency.to_item_id] {
                let known = state
                    .timeline
                    .iter()
                    .any(|item| &item.id == item_id && item.project_id == project_id);
                if !known {
                    bail!("timeline item {item_id} not found in project {project_id}");
                }
            }
            let created = TimelineDependency {
                id: new_id(),
                project_id: project_id.to_string(),
                from_item_id: dependency.from_item_id.clone(),
                to_item_id: dependency.to_item_id.clone(),
                kind: dependency.kind,
                note: dependency.note.clone(),
            };
            state.dependencies.push(created.clone());
            Ok(created)
        })
    }

    async fn list_approvals(
        &self,
        status: Option<ApprovalStatus>,
    ) -> anyhow::Result<Vec<ApprovalRecord>> {
        self.read(|state| {
            Ok(state
                .approvals
                .iter()
                .filter(|approval| status.is_none_or(|status| approval.status == status))
                .cloned()
                .collect())
        })
    }

    #[instrument(skip(self))]
    async fn resolve_approval(
        &self,
        approval_id: &str,
        decision: ApprovalDecision,
    ) -> anyhow::Result<ApprovalRecord> {
        self.mutate(|state| {
            let approval = state
                .approvals
                .iter_mut()
                .find(|approval| approval.id == approval_id)
                .ok_or_else(|| anyhow!("approval {approval_id} not found"))?;
            if approval.status != ApprovalStatus::Pending {
                bail!("approval {approval_id} is already {}", approval.status);
            }
            approval.status = decision.resulting_status();
            approval.resolved_at = Some(Utc::now());
            Ok(approval.clone())
        })
    }

    async fn digest(&self, period: DigestPeriod) -> anyhow::Result<DigestPayload> {
        self.read(|state| {
            state
                .digests
                .iter()
                .filter(|digest| digest.period == period)
                .max_by_key(|digest| digest.generated_at)
                .cloned()
                .ok_or_else(|| anyhow!("no {} digest has been generated yet", period.as_key()))
        })
    }

    async fn recent_emails(&self, limit: usize) -> anyhow::Result<Vec<EmailRecord>> {
        self.read(|state| {
            let mut emails = state.emails.clone();
            emails.sort_by(|a, b| b.received_at.cmp(&a.received_at));
            emails.truncate(limit.min(MAX_EMAIL_ROWS));
            Ok(emails)
        })
    }

    async fn admin_users(&self, search: Option<&str>) -> anyhow::Result<Vec<AdminUser>> {
        let needle = search
            .map(|s| s.trim().to_lowercase())
            .filter(|s| !s.is_empty());
        self.read(|state| {
            Ok(state
                .users
                .iter()
                .filter(|user| match &needle {
                    Some(needle) => {
                        user.email.to_lowercase().contains(needle)
                            || user
                                .display_name
                                .as_deref()
                                .is_some_and(|name| name.to_lowercase().contains(needle))
                    }
                    None => true,
                })
                .cloned()
                .collect())
        })
    }

    #[instrument(skip(self, patch))]
    async fn update_admin_user(
        &self,
        user_id: &str,
        patch: &AdminUserPatch,
    ) -> anyhow::Result<AdminUser> {
        self.mutate(|state| {
            let user = state
                .users
                .iter_mut()
                .find(|user| user.id == user_id)
                .ok_or_else(|| anyhow!("user {user_id} not found"))?;
            if let Some(role) = patch.role {
                user.role = role;
            }
            if let Some(display_name) = &patch.display_name {
                user.display_name = Some(display_name.clone());
            }
            Ok(user.clone())
        })
    }

    async fn admin_projects(&self) -> anyhow::Result<Vec<Project>> {
        self.read(|state| Ok(state.projects.clone()))
    }
}
