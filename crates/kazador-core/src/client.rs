//! Client side of the Kazador backend API.

use std::time::Duration;

use anyhow::{Context, anyhow, bail};
use chrono::{DateTime, Utc};
use reqwest::{Method, RequestBuilder, StatusCode};
use serde::Deserialize;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, instrument, warn};
use url::Url;

use crate::model::{
    AdminUser, AdminUserPatch, ApprovalDecision, ApprovalRecord, ApprovalStatus, CalendarEvent,
    CalendarSource, CreateEventRequest, DependencyCreate, DigestPayload, DigestPeriod, EmailRecord,
    Project, ProjectPatch, ProjectTask, SyncSummary, TaskCreate, TaskPatch, TimelineDependency,
    TimelineItem, TimelineItemCreate,
};

pub const DEFAULT_BACKEND_URL: &str = "http://127.0.0.1:54321";
pub const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Window of calendar events to fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventQuery {
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
    pub source_id: Option<String>,
}

/// Every call the dashboard makes. Each either returns the records or an
/// error whose message is fit for display.
#[allow(async_fn_in_trait)]
pub trait Backend {
    async fn list_events(&self, query: &EventQuery) -> anyhow::Result<Vec<CalendarEvent>>;
    async fn create_event(&self, request: &CreateEventRequest) -> anyhow::Result<CalendarEvent>;
    async fn list_sources(&self) -> anyhow::Result<Vec<CalendarSource>>;
    async fn sync_source(&self, source_id: &str) -> anyhow::Result<SyncSummary>;

    async fn list_projects(&self) -> anyhow::Result<Vec<Project>>;
    async fn get_project(&self, project_id: &str) -> anyhow::Result<Project>;
    async fn update_project(&self, project_id: &str, patch: &ProjectPatch)
    -> anyhow::Result<Project>;

    async fn list_tasks(&self, project_id: &str) -> anyhow::Result<Vec<ProjectTask>>;
    async fn create_task(&self, project_id: &str, task: &TaskCreate)
    -> anyhow::Result<ProjectTask>;
    async fn update_task(&self, task_id: &str, patch: &TaskPatch) -> anyhow::Result<ProjectTask>;

    async fn list_timeline(&self, project_id: &str) -> anyhow::Result<Vec<TimelineItem>>;
    async fn create_timeline_item(
        &self,
        project_id: &str,
        item: &TimelineItemCreate,
    ) -> anyhow::Result<TimelineItem>;
    async fn list_dependencies(&self, project_id: &str)
    -> anyhow::Result<Vec<TimelineDependency>>;
    async fn create_dependency(
        &self,
        project_id: &str,
        dependency: &DependencyCreate,
    ) -> anyhow::Result<TimelineDependency>;

    async fn list_approvals(
        &self,
        status: Option<ApprovalStatus>,
    ) -> anyhow::Result<Vec<ApprovalRecord>>;
    async fn resolve_approval(
        &self,
        approval_id: &str,
        decision: ApprovalDecision,
    ) -> anyhow::Result<ApprovalRecord>;

    async fn digest(&self, period: DigestPeriod) -> anyhow::Result<DigestPayload>;
    async fn recent_emails(&self, limit: usize) -> anyhow::Result<Vec<EmailRecord>>;

    async fn admin_users(&self, search: Option<&str>) -> anyhow::Result<Vec<AdminUser>>;
    async fn update_admin_user(
        &self,
        user_id: &str,
        patch: &AdminUserPatch,
    ) -> anyhow::Result<AdminUser>;
    async fn admin_projects(&self) -> anyhow::Result<Vec<Project>>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendSettings {
    pub url: String,
    pub token: Option<String>,
    pub timeout: Duration,
}

impl Default for BackendSettings {
    fn default() -> Self {
        Self {
            url: DEFAULT_BACKEND_URL.to_string(),
            token: None,
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
        }
    }
}

#[derive(Deserialize)]
struct ErrorResponse {
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

/// [`Backend`] over HTTP with JSON bodies.
#[derive(Debug, Clone)]
pub struct HttpBackend {
    http: reqwest::Client,
    base_url: Url,
    token: Option<String>,
}

impl HttpBackend {
    #[instrument(skip(settings), fields(url = %settings.url, authenticated = settings.token.is_some()))]
    pub fn new(settings: &BackendSettings) -> anyhow::Result<Self> {
        let mut raw = settings.url.trim().to_string();
        if !raw.ends_with('/') {
            raw.push('/');
        }
        let base_url =
            Url::parse(&raw).with_context(|| format!("invalid backend url '{}'", settings.url))?;
        if base_url.cannot_be_a_base() {
            bail!("backend url '{}' cannot be used as a base", settings.url);
        }

        let http = reqwest::Client::builder()
            .timeout(settings.timeout)
            .user_agent(concat!("kazador/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("failed building HTTP client")?;

        Ok(Self {
            http,
            base_url,
            token: settings
                .token
                .as_ref()
                .map(|token| token.trim().to_string())
                .filter(|token| !token.is_empty()),
        })
    }

    /// Base URL plus percent-encoded path segments.
    pub fn endpoint(&self, segments: &[&str]) -> anyhow::Result<Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| anyhow!("backend url cannot take path segments"))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn request(&self, method: Method, segments: &[&str]) -> anyhow::Result<RequestBuilder> {
        let url = self.endpoint(segments)?;
        debug!(%method, %url, "backend request");
        let builder = self.http.request(method, url);
        Ok(match &self.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        })
    }

    fn events_request(&self, query: &EventQuery) -> anyhow::Result<RequestBuilder> {
        let mut params = vec![
            ("from", query.from.to_rfc3339()),
            ("to", query.to.to_rfc3339()),
        ];
        if let Some(source_id) = &query.source_id {
            params.push(("sourceId", source_id.clone()));
        }
        Ok(self
            .request(Method::GET, &["calendar", "events"])?
            .query(&params))
    }

    fn digest_request(&self, period: DigestPeriod) -> anyhow::Result<RequestBuilder> {
        Ok(self
            .request(Method::GET, &["digest"])?
            .query(&[("period", period.as_key())]))
    }

    fn emails_request(&self, limit: usize) -> anyhow::Result<RequestBuilder> {
        Ok(self
            .request(Method::GET, &["emails", "recent"])?
            .query(&[("limit", limit)]))
    }

    fn require_token(&self, what: &str) -> anyhow::Result<()> {
        if self.token.is_none() {
            bail!("{what} requires a bearer token; set backend.token or KAZADOR_TOKEN");
        }
        Ok(())
    }

    async fn send<T: DeserializeOwned>(
        &self,
        request: RequestBuilder,
        what: &str,
    ) -> anyhow::Result<T> {
        let response = request
            .send()
            .await
            .with_context(|| format!("failed to {what}: backend unreachable"))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let message = error_message(status, &body);
            warn!(%status, what, %message, "backend returned an error");
            bail!("failed to {what}: {message}");
        }

        response
            .json::<T>()
            .await
            .with_context(|| format!("failed to {what}: unexpected response body"))
    }

    async fn get<T: DeserializeOwned>(&self, segments: &[&str], what: &str) -> anyhow::Result<T> {
        let request = self.request(Method::GET, segments)?;
        self.send(request, what).await
    }

    async fn write<B: Serialize + ?Sized, T: DeserializeOwned>(
        &self,
        method: Method,
        segments: &[&str],
        body: &B,
        what: &str,
    ) -> anyhow::Result<T> {
        let request = self.request(method, segments)?.json(body);
        self.send(request, what).await
    }
}

/// Message for a non-2xx response: the server's `error` or `message`
/// field when the body carries one, the status line otherwise.
pub fn error_message(status: StatusCode, body: &str) -> String {
    serde_json::from_str::<ErrorResponse>(body)
        .ok()
        .and_then(|parsed| parsed.error.or(parsed.message))
        .map(|message| message.trim().to_string())
        .filter(|message| !message.is_empty())
        .unwrap_or_else(|| match status.canonical_reason() {
            Some(reason) => format!("HTTP {} {reason}", status.as_u16()),
            None => format!("HTTP {}", status.as_u16()),
        })
}

impl Backend for HttpBackend {
    #[instrument(skip(self))]
    async fn list_events(&self, query: &EventQuery) -> anyhow::Result<Vec<CalendarEvent>> {
        let request = self.events_request(query)?;
        self.send(request, "load calendar events").await
    }

    #[instrument(skip(self, request), fields(summary = %request.summary))]
    async fn create_event(&self, request: &CreateEventRequest) -> anyhow::Result<CalendarEvent> {
        self.write(
            Method::POST,
            &["calendar", "events"],
            request,
            "create calendar event",
        )
        .await
    }

    #[instrument(skip(self))]
    async fn list_sources(&self) -> anyhow::Result<Vec<CalendarSource>> {
        self.get(&["calendar", "sources"], "load calendar sources")
            .await
    }

    #[instrument(skip(self))]
    async fn sync_source(&self, source_id: &str) -> anyhow::Result<SyncSummary> {
        self.require_token("calendar sync")?;
        self.write(
            Method::POST,
            &["calendar", "sources", source_id, "sync"],
            &serde_json::json!({}),
            "sync calendar",
        )
        .await
    }

    #[instrument(skip(self))]
    async fn list_projects(&self) -> anyhow::Result<Vec<Project>> {
        self.get(&["projects"], "load projects").await
    }

    #[instrument(skip(self))]
    async fn get_project(&self, project_id: &str) -> anyhow::Result<Project> {
        self.get(&["projects", project_id], "load project").await
    }

    #[instrument(skip(self, patch))]
    async fn update_project(
        &self,
        project_id: &str,
        patch: &ProjectPatch,
    ) -> anyhow::Result<Project> {
        self.write(
            Method::PATCH,
            &["projects", project_id],
            patch,
            "update project",
        )
        .await
    }

    #[instrument(skip(self))]
    async fn list_tasks(&self, project_id: &str) -> anyhow::Result<Vec<ProjectTask>> {
        self.get(&["projects", project_id, "tasks"], "load tasks")
            .await
    }

    #[instrument(skip(self, task), fields(title = %task.title))]
    async fn create_task(&self, project_id: &str, task: &TaskCreate) -> anyhow::Result<ProjectTask> {
        self.write(
            Method::POST,
            &["projects", project_id, "tasks"],
            task,
            "create task",
        )
        .await
    }

    #[instrument(skip(self, patch))]
    async fn update_task(&self, task_id: &str, patch: &TaskPatch) -> anyhow::Result<ProjectTask> {
        self.write(Method::PATCH, &["tasks", task_id], patch, "update task")
            .await
    }

    #[instrument(skip(self))]
    async fn list_timeline(&self, project_id: &str) -> anyhow::Result<Vec<TimelineItem>> {
        self.get(&["projects", project_id, "timeline"], "load timeline")
            .await
    }

    #[instrument(skip(self, item), fields(title = %item.title))]
    async fn create_timeline_item(
        &self,
        project_id: &str,
        item: &TimelineItemCreate,
    ) -> anyhow::Result<TimelineItem> {
        self.write(
            Method::POST,
            &["projects", project_id, "timeline"],
            item,
            "create timeline item",
        )
        .await
    }

    #[instrument(skip(self))]
    async fn list_dependencies(
        &self,
        project_id: &str,
    ) -> anyhow::Result<Vec<TimelineDependency>> {
        self.get(
            &["projects", project_id, "timeline", "dependencies"],
            "load timeline dependencies",
        )
        .await
    }

    #[instrument(skip(self, dependency))]
    async fn create_dependency(
        &self,
        project_id: &str,
        dependency: &DependencyCreate,
    ) -> anyhow::Result<TimelineDependency> {
        self.write(
            Method::POST,
            &["projects", project_id, "timeline", "dependencies"],
            dependency,
            "create timeline dependency",
        )
        .await
    }

    #[instrument(skip(self))]
    async fn list_approvals(
        &self,
        status: Option<ApprovalStatus>,
    ) -> anyhow::Result<Vec<ApprovalRecord>> {
        let mut request = self.request(Method::GET, &["approvals"])?;
        if let Some(status) = status {
            request = request.query(&[("status", status.as_key())]);
        }
        self.send(request, "load approvals").await
    }

    #[instrument(skip(self))]
    async fn resolve_approval(
        &self,
        approval_id: &str,
        decision: ApprovalDecision,
    ) -> anyhow::Result<ApprovalRecord> {
        self.write(
            Method::POST,
            &["approvals", approval_id, decision.as_path()],
            &serde_json::json!({}),
            "resolve approval",
        )
        .await
    }

    #[instrument(skip(self))]
    async fn digest(&self, period: DigestPeriod) -> anyhow::Result<DigestPayload> {
        let request = self.digest_request(period)?;
        self.send(request, "load digest").await
    }

    #[instrument(skip(self))]
    async fn recent_emails(&self, limit: usize) -> anyhow::Result<Vec<EmailRecord>> {
        let request = self.emails_request(limit)?;
        self.send(request, "load recent emails").await
    }

    #[instrument(skip(self))]
    async fn admin_users(&self, search: Option<&str>) -> anyhow::Result<Vec<AdminUser>> {
        self.require_token("admin user listing")?;
        let mut request = self.request(Method::GET, &["admin", "users"])?;
        if let Some(search) = search.map(str::trim).filter(|s| !s.is_empty()) {
            request = request.query(&[("q", search)]);
        }
        self.send(request, "load users").await
    }

    #[instrument(skip(self, patch))]
    async fn update_admin_user(
        &self,
        user_id: &str,
        patch: &AdminUserPatch,
    ) -> anyhow::Result<AdminUser> {
        self.require_token("admin user update")?;
        self.write(
            Method::PATCH,
            &["admin", "users", user_id],
            patch,
            "update user",
        )
        .await
    }

    #[instrument(skip(self))]
    async fn admin_projects(&self) -> anyhow::Result<Vec<Project>> {
        self.require_token("admin project listing")?;
        self.get(&["admin", "projects"], "load admin projects")
            .await
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use reqwest::StatusCode;

    use super::*;

    fn backend(url: &str, token: Option<&str>) -> HttpBackend {
        HttpBackend::new(&BackendSettings {
            url: url.to_string(),
            token: token.map(str::to_string),
            ..BackendSettings::default()
        })
        .expect("backend should build")
    }

    #[test]
    fn endpoint_appends_encoded_segments_to_base_path() {
        let backend = backend("https://api.example.com/v1", None);
        let url = backend
            .endpoint(&["projects", "p 1/2", "tasks"])
            .expect("endpoint");
        assert_eq!(
            url.as_str(),
            "https://api.example.com/v1/projects/p%201%2F2/tasks"
        );
    }

    fn authorization(request: &reqwest::Request) -> Option<&str> {
        request
            .headers()
            .get(reqwest::header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
    }

    #[test]
    fn event_requests_carry_window_source_and_token() {
        let backend = backend("https://api.example.com/v1/", Some(" secret "));
        let query = EventQuery {
            from: Utc
                .with_ymd_and_hms(2024, 1, 7, 0, 0, 0)
                .single()
                .expect("from"),
            to: Utc
                .with_ymd_and_hms(2024, 1, 14, 0, 0, 0)
                .single()
                .expect("to"),
            source_id: Some("work cal".to_string()),
        };
        let request = backend
            .events_request(&query)
            .expect("request")
            .build()
            .expect("request builds");

        assert_eq!(request.method(), &Method::GET);
        assert_eq!(request.url().path(), "/v1/calendar/events");
        let params: Vec<(String, String)> = request
            .url()
            .query_pairs()
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();
        assert_eq!(
            params,
            vec![
                ("from".to_string(), "2024-01-07T00:00:00+00:00".to_string()),
                ("to".to_string(), "2024-01-14T00:00:00+00:00".to_string()),
                ("sourceId".to_string(), "work cal".to_string()),
            ]
        );
        assert_eq!(authorization(&request), Some("Bearer secret"));
    }

    #[test]
    fn digest_and_email_requests_carry_their_parameters() {
        let backend = backend("https://api.example.com", Some("secret"));
        let digest = backend
            .digest_request(DigestPeriod::Weekly)
            .expect("request")
            .build()
            .expect("request builds");
        assert_eq!(
            digest.url().as_str(),
            "https://api.example.com/digest?period=weekly"
        );
        assert_eq!(authorization(&digest), Some("Bearer secret"));

        let emails = backend
            .emails_request(25)
            .expect("request")
            .build()
            .expect("request builds");
        assert_eq!(
            emails.url().as_str(),
            "https://api.example.com/emails/recent?limit=25"
        );
    }

    #[test]
    fn anonymous_requests_have_no_authorization_header() {
        let backend = backend("https://api.example.com", None);
        let request = backend
            .digest_request(DigestPeriod::Daily)
            .expect("request")
            .build()
            .expect("request builds");
        assert_eq!(authorization(&request), None);
        assert_eq!(request.url().query(), Some("period=daily"));
    }

    #[test]
    fn rejects_unusable_urls() {
        assert!(
            HttpBackend::new(&BackendSettings {
                url: "not a url".to_string(),
                ..BackendSettings::default()
            })
            .is_err()
        );
    }

    #[test]
    fn blank_token_counts_as_missing() {
        let backend = backend("http://localhost:1", Some("   "));
        let err = backend
            .require_token("calendar sync")
            .expect_err("token should be required");
        assert!(err.to_string().contains("requires a bearer token"));
    }

    #[test]
    fn error_message_prefers_server_text() {
        assert_eq!(
            error_message(StatusCode::BAD_REQUEST, r#"{"error":"summary is required"}"#),
            "summary is required"
        );
        assert_eq!(
            error_message(StatusCode::FORBIDDEN, r#"{"message":"admins only"}"#),
            "admins only"
        );
        assert_eq!(
            error_message(StatusCode::BAD_GATEWAY, "<html>oops</html>"),
            "HTTP 502 Bad Gateway"
        );
    }

    #[tokio::test]
    async fn sync_without_token_fails_before_any_request() {
        let backend = backend("http://127.0.0.1:9", None);
        let err = backend
            .sync_source("primary")
            .await
            .expect_err("sync should need a token");
        assert!(format!("{err:#}").contains("calendar sync"));
    }
}
