use std::io::Write;

use anyhow::{Context, anyhow, bail};
use chrono::{DateTime, NaiveDate, Utc};
use chrono_tz::Tz;
use tracing::{debug, info, instrument, warn};

use crate::calendar::{DAY_KEY_FORMAT, ViewMode, bucket_events, shift, visible_range};
use crate::cli::{
    AdminCommand, CalendarArgs, Command, EmailArgs, EventAddArgs, EventCommand, ItemCommand,
    ProjectArgs, TaskCommand, TimelineArgs,
};
use crate::client::{Backend, EventQuery};
use crate::config::Config;
use crate::datetime::{midnight_in, parse_date_expr};
use crate::digest::{
    EmailFilter, HomeInputs, HomeSettings, HomeView, filter_emails, label_options,
    merge_top_actions, metric_totals,
};
use crate::form::{EchoedFields, EventForm};
use crate::model::{
    AdminUserPatch, ApprovalDecision, ApprovalStatus, CalendarEvent, DependencyCreate, DependencyKind,
    DigestPeriod, ProjectPatch, ProjectStatus, TaskCreate, TaskPatch, TaskStatus,
    TimelineItemCreate, TimelineItemKind, UserRole,
};
use crate::panel::Panel;
use crate::query::ViewQuery;
use crate::render::Renderer;
use crate::timeline::{TimelineFilter, group_by_lane, lane_options, resolve_dependencies};

/// Settings and clock shared by every command of one invocation.
#[derive(Debug, Clone)]
pub struct Session {
    pub renderer: Renderer,
    pub timezone: Tz,
    pub now: DateTime<Utc>,
    pub today: NaiveDate,
    pub default_view: ViewMode,
    pub digest_period: DigestPeriod,
    pub email_limit: usize,
    pub top_actions: usize,
}

impl Session {
    pub fn from_config(cfg: &Config, timezone: Tz, now: DateTime<Utc>) -> anyhow::Result<Self> {
        Ok(Self {
            renderer: Renderer::new(cfg, timezone)?,
            timezone,
            now,
            today: now.with_timezone(&timezone).date_naive(),
            default_view: cfg.default_view()?,
            digest_period: cfg.digest_period()?,
            email_limit: cfg.email_limit()?,
            top_actions: cfg.top_actions()?,
        })
    }

    fn parse_day(&self, raw: &str) -> anyhow::Result<NaiveDate> {
        parse_date_expr(raw, self.today)
    }

    fn parse_instant(&self, raw: Option<&str>) -> anyhow::Result<Option<DateTime<Utc>>> {
        raw.map(|raw| Ok(midnight_in(self.timezone, self.parse_day(raw)?)))
            .transpose()
    }
}

#[instrument(skip_all)]
pub async fn dispatch<B: Backend, W: Write>(
    backend: &B,
    session: &Session,
    command: Command,
    out: &mut W,
) -> anyhow::Result<()> {
    debug!(?command, "dispatching command");
    match command {
        Command::Calendar(args) => cmd_calendar(backend, session, args, out).await,
        Command::Event(EventCommand::Add(args)) => cmd_event_add(backend, session, args, out).await,
        Command::Sources => {
            let sources = backend.list_sources().await?;
            session.renderer.sources(out, &sources)
        }
        Command::Sync { source_id } => {
            let summary = backend.sync_source(&source_id).await?;
            info!(source = %source_id, created = summary.created, "calendar synced");
            session.renderer.sync_summary(out, &summary)
        }
        Command::Home(args) => cmd_home(backend, session, args, out).await,
        Command::Digest { period } => cmd_digest(backend, session, period.as_deref(), out).await,
        Command::Emails(args) => cmd_emails(backend, session, args, out).await,
        Command::Projects => {
            let projects = backend.list_projects().await?;
            session.renderer.projects(out, &projects)
        }
        Command::Project(args) => cmd_project(backend, session, args, out).await,
        Command::Tasks { project_id } => {
            let tasks = backend.list_tasks(&project_id).await?;
            session.renderer.tasks(out, &tasks, session.now)
        }
        Command::Task(task) => cmd_task(backend, session, task, out).await,
        Command::Timeline(args) => cmd_timeline(backend, session, args, out).await,
        Command::Item(item) => cmd_item(backend, session, item, out).await,
        Command::Approvals { status } => {
            let status = match status.trim().to_ascii_lowercase().as_str() {
                "all" => None,
                other => Some(ApprovalStatus::from_key(other).ok_or_else(|| {
                    anyhow!("unknown approval status '{other}'; expected pending, approved, declined or all")
                })?),
            };
            let approvals = backend.list_approvals(status).await?;
            session.renderer.approvals(out, &approvals)
        }
        Command::Approve { approval_id } => {
            let approval = backend
                .resolve_approval(&approval_id, ApprovalDecision::Approve)
                .await?;
            session.renderer.approval(out, &approval)
        }
        Command::Decline { approval_id } => {
            let approval = backend
                .resolve_approval(&approval_id, ApprovalDecision::Decline)
                .await?;
            session.renderer.approval(out, &approval)
        }
        Command::Admin(admin) => cmd_admin(backend, session, admin, out).await,
    }
}

/// Resolves the view and pivot date: explicit flags first, then the
/// shareable query, then the configured defaults.
pub fn calendar_state(
    session: &Session,
    args: &CalendarArgs,
) -> anyhow::Result<(ViewMode, NaiveDate, ViewQuery)> {
    let explicit = ViewQuery {
        view: args.view.as_deref().map(str::parse).transpose()?,
        date: args
            .date
            .as_deref()
            .map(|raw| session.parse_day(raw))
            .transpose()?,
        ..ViewQuery::default()
    };
    let shared = args.query.as_deref().map(ViewQuery::parse).unwrap_or_default();
    let fallback = ViewQuery::default()
        .with_view(session.default_view)
        .with_date(session.today);

    let merged = explicit.or(shared).or(fallback);
    let view = merged.view.unwrap_or(session.default_view);
    let start = merged.date.unwrap_or(session.today);
    let pivot = shift(start, view, i64::from(args.shift)).ok_or_else(|| {
        anyhow!(
            "shift out of range: cannot move {start} by {} {view} view(s)",
            args.shift
        )
    })?;
    let link = merged.with_view(view).with_date(pivot);
    Ok((view, pivot, link))
}

#[instrument(skip_all)]
async fn cmd_calendar<B: Backend, W: Write>(
    backend: &B,
    session: &Session,
    args: CalendarArgs,
    out: &mut W,
) -> anyhow::Result<()> {
    let (view, pivot, link) = calendar_state(session, &args)?;
    let range = visible_range(pivot, view);
    let query = EventQuery {
        from: range.start_instant(session.timezone),
        to: range.end_instant(session.timezone),
        source_id: args.source_id,
    };
    info!(%view, %pivot, start = %range.start, end = %range.end, "loading calendar");

    let events = Panel::from_result("calendar events", backend.list_events(&query).await);
    let buckets = events
        .as_ref()
        .map(|events| bucket_events(events, range, session.timezone));

    session.renderer.calendar(
        out,
        view,
        pivot,
        session.today,
        &buckets,
        &link.to_query_string(),
    )
}

#[instrument(skip_all, fields(summary = %args.summary))]
async fn cmd_event_add<B: Backend, W: Write>(
    backend: &B,
    session: &Session,
    args: EventAddArgs,
    out: &mut W,
) -> anyhow::Result<()> {
    let date = session.parse_day(&args.date)?;
    let form = EventForm {
        summary: args.summary,
        date: date.format(DAY_KEY_FORMAT).to_string(),
        start_time: args.start,
        end_time: args.end,
        duration_minutes: args.duration,
        all_day: args.all_day,
        location: args.location,
        description: args.description,
        source_id: args.source_id,
        project_id: args.project_id,
    };

    let (created, echoed) = create_and_reload(backend, &form, session.timezone).await?;
    session.renderer.created_event(out, &created, echoed.as_ref())
}

/// Validates `form`, creates the event, then reloads the day it landed on
/// and returns what the calendar now shows for it.
#[instrument(skip_all, fields(summary = %form.summary))]
pub async fn create_and_reload<B: Backend>(
    backend: &B,
    form: &EventForm,
    tz: Tz,
) -> anyhow::Result<(CalendarEvent, Option<EchoedFields>)> {
    let request = form.validate(tz)?;
    let expected = form.expected_echo(tz)?;

    let created = backend
        .create_event(&request)
        .await
        .context("failed to save event")?;
    info!(id = %created.id, "event created");

    let day = request.start_at.with_timezone(&tz).date_naive();
    let range = visible_range(day, ViewMode::Day);
    let reloaded = backend
        .list_events(&EventQuery {
            from: range.start_instant(tz),
            to: range.end_instant(tz),
            source_id: None,
        })
        .await
        .context("failed to reload events")?;

    let echoed = reloaded
        .iter()
        .find(|event| event.id == created.id)
        .and_then(|event| EchoedFields::from_event(event, tz));
    match &echoed {
        Some(fields) if fields != &expected => {
            warn!(?expected, actual = ?fields, "reloaded event differs from the form");
        }
        None => warn!(id = %created.id, "created event missing after reload"),
        Some(_) => {}
    }

    Ok((created, echoed))
}

fn email_filter(args: &EmailArgs) -> anyhow::Result<EmailFilter> {
    Ok(EmailFilter {
        label: args.label.clone().filter(|label| !label.trim().is_empty()),
        window: args
            .window
            .as_deref()
            .map(str::parse)
            .transpose()?
            .unwrap_or_default(),
    })
}

#[instrument(skip_all)]
async fn cmd_home<B: Backend, W: Write>(
    backend: &B,
    session: &Session,
    args: EmailArgs,
    out: &mut W,
) -> anyhow::Result<()> {
    let settings = HomeSettings {
        filter: email_filter(&args)?,
        top_actions: session.top_actions,
        today: session.today,
        now: session.now,
        timezone: session.timezone,
    };
    let range = visible_range(session.today, ViewMode::Day);
    let today_query = EventQuery {
        from: range.start_instant(session.timezone),
        to: range.end_instant(session.timezone),
        source_id: None,
    };

    let (digest, emails, events) = tokio::join!(
        backend.digest(session.digest_period),
        backend.recent_emails(session.email_limit),
        backend.list_events(&today_query),
    );
    let inputs = HomeInputs {
        digest: Panel::from_result("digest", digest),
        emails: Panel::from_result("recent emails", emails),
        events: Panel::from_result("today's events", events),
    };

    let view = HomeView::build(&inputs, &settings);
    session.renderer.home(out, &view)
}

#[instrument(skip_all)]
async fn cmd_digest<B: Backend, W: Write>(
    backend: &B,
    session: &Session,
    period: Option<&str>,
    out: &mut W,
) -> anyhow::Result<()> {
    let period = match period {
        Some(raw) => DigestPeriod::from_key(raw)
            .ok_or_else(|| anyhow!("unknown digest period '{raw}'; expected daily or weekly"))?,
        None => session.digest_period,
    };
    let digest = backend.digest(period).await?;

    let actions = merge_top_actions(&digest, session.top_actions);
    session.renderer.top_actions(out, &actions)?;
    writeln!(out)?;
    let totals = metric_totals(&digest.projects);
    session
        .renderer
        .project_metrics(out, &digest.projects, Some(&totals))
}

#[instrument(skip_all)]
async fn cmd_emails<B: Backend, W: Write>(
    backend: &B,
    session: &Session,
    args: EmailArgs,
    out: &mut W,
) -> anyhow::Result<()> {
    let filter = email_filter(&args)?;
    let emails = backend.recent_emails(session.email_limit).await?;
    let kept = filter_emails(&emails, &filter, session.now);
    session
        .renderer
        .emails(out, &kept, &label_options(&emails))
}

#[instrument(skip_all, fields(project = %args.project_id))]
async fn cmd_project<B: Backend, W: Write>(
    backend: &B,
    session: &Session,
    args: ProjectArgs,
    out: &mut W,
) -> anyhow::Result<()> {
    let patch = ProjectPatch {
        name: args.name,
        status: args.status.map(ProjectStatus::from),
        description: args.description,
        color: args.color,
    };
    let project = if patch == ProjectPatch::default() {
        backend.get_project(&args.project_id).await?
    } else {
        backend.update_project(&args.project_id, &patch).await?
    };
    session.renderer.project(out, &project)
}

#[instrument(skip_all)]
async fn cmd_task<B: Backend, W: Write>(
    backend: &B,
    session: &Session,
    command: TaskCommand,
    out: &mut W,
) -> anyhow::Result<()> {
    let task = match command {
        TaskCommand::Add {
            project_id,
            title,
            due,
            priority,
        } => {
            let task = TaskCreate {
                title,
                due_at: session.parse_instant(due.as_deref())?,
                priority,
            };
            backend.create_task(&project_id, &task).await?
        }
        TaskCommand::Status { task_id, status } => {
            let status = TaskStatus::from(status);
            if let TaskStatus::Other(raw) = &status {
                bail!("unknown task status '{raw}'; expected todo, in_progress, blocked or done");
            }
            let patch = TaskPatch {
                status: Some(status),
                ..TaskPatch::default()
            };
            backend.update_task(&task_id, &patch).await?
        }
    };
    session.renderer.tasks(out, &[task], session.now)
}

#[instrument(skip_all, fields(project = %args.project_id))]
async fn cmd_timeline<B: Backend, W: Write>(
    backend: &B,
    session: &Session,
    args: TimelineArgs,
    out: &mut W,
) -> anyhow::Result<()> {
    let shared = args.query.as_deref().map(ViewQuery::parse).unwrap_or_default();
    let state = ViewQuery {
        project_id: Some(args.project_id.clone()),
        lane: args.lane,
        ..ViewQuery::default()
    }
    .or(shared);

    let (items, dependencies) = tokio::join!(
        backend.list_timeline(&args.project_id),
        backend.list_dependencies(&args.project_id),
    );
    let items = items?;
    let dependencies = Panel::from_result("timeline dependencies", dependencies);

    let filter = TimelineFilter {
        project_id: state.project_id.clone(),
        lane: state.lane.clone(),
    };
    let groups = group_by_lane(&items, &filter);
    let links = dependencies
        .as_ref()
        .map(|dependencies| resolve_dependencies(&items, dependencies));

    session.renderer.timeline(
        out,
        &groups,
        &lane_options(&items),
        &links,
        &state.to_query_string(),
    )
}

#[instrument(skip_all)]
async fn cmd_item<B: Backend, W: Write>(
    backend: &B,
    session: &Session,
    command: ItemCommand,
    out: &mut W,
) -> anyhow::Result<()> {
    match command {
        ItemCommand::Add {
            project_id,
            title,
            kind,
            start,
            end,
            lane,
        } => {
            let item = TimelineItemCreate {
                kind: TimelineItemKind::from_key(&kind)
                    .ok_or_else(|| anyhow!("unknown timeline item type '{kind}'"))?,
                title,
                starts_at: session.parse_instant(start.as_deref())?,
                ends_at: session.parse_instant(end.as_deref())?,
                lane,
            };
            let created = backend.create_timeline_item(&project_id, &item).await?;
            writeln!(out, "Created {} {} ({})", created.kind, created.id, created.title)?;
        }
        ItemCommand::Link {
            project_id,
            from_item_id,
            to_item_id,
            kind,
            note,
        } => {
            let dependency = DependencyCreate {
                from_item_id,
                to_item_id,
                kind: DependencyKind::from_key(&kind)
                    .ok_or_else(|| anyhow!("unknown dependency type '{kind}'; expected FS or SS"))?,
                note,
            };
            let created = backend.create_dependency(&project_id, &dependency).await?;
            writeln!(
                out,
                "Linked {} -[{}]-> {} ({})",
                created.from_item_id, created.kind, created.to_item_id, created.id
            )?;
        }
    }
    Ok(())
}

#[instrument(skip_all)]
async fn cmd_admin<B: Backend, W: Write>(
    backend: &B,
    session: &Session,
    command: AdminCommand,
    out: &mut W,
) -> anyhow::Result<()> {
    match command {
        AdminCommand::Users { search } => {
            let users = backend.admin_users(search.as_deref()).await?;
            session.renderer.users(out, &users)
        }
        AdminCommand::Role { user_id, role } => {
            let patch = AdminUserPatch {
                role: Some(
                    UserRole::from_key(&role)
                        .ok_or_else(|| anyhow!("unknown role '{role}'; expected admin, member or viewer"))?,
                ),
                ..AdminUserPatch::default()
            };
            let user = backend.update_admin_user(&user_id, &patch).await?;
            session.renderer.users(out, &[user])
        }
        AdminCommand::Projects => {
            let projects = backend.admin_projects().await?;
            session.renderer.projects(out, &projects)
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn session() -> Session {
        let now = Utc
            .with_ymd_and_hms(2024, 1, 10, 12, 0, 0)
            .single()
            .expect("valid now");
        Session::from_config(&Config::defaults(), chrono_tz::UTC, now).expect("session")
    }

    #[test]
    fn explicit_flags_beat_shared_query() {
        let args = CalendarArgs {
            view: Some("day".to_string()),
            query: Some("view=week&date=2024-03-01".to_string()),
            ..CalendarArgs::default()
        };
        let (view, pivot, link) = calendar_state(&session(), &args).expect("state");
        assert_eq!(view, ViewMode::Day);
        assert_eq!(pivot, NaiveDate::from_ymd_opt(2024, 3, 1).expect("date"));
        assert_eq!(link.to_query_string(), "view=day&date=2024-03-01");
    }

    #[test]
    fn defaults_to_configured_view_and_today_with_shift() {
        let args = CalendarArgs {
            shift: -1,
            ..CalendarArgs::default()
        };
        let (view, pivot, _) = calendar_state(&session(), &args).expect("state");
        assert_eq!(view, ViewMode::Month);
        assert_eq!(pivot, NaiveDate::from_ymd_opt(2023, 12, 10).expect("date"));
    }

    #[test]
    fn oversized_shift_is_reported() {
        for view in ["day", "week", "month"] {
            let args = CalendarArgs {
                view: Some(view.to_string()),
                shift: i32::MAX,
                ..CalendarArgs::default()
            };
            let err = calendar_state(&session(), &args).expect_err("shift is rejected");
            assert!(err.to_string().starts_with("shift out of range"), "{view}: {err}");
        }

        let args = CalendarArgs {
            view: Some("month".to_string()),
            shift: i32::MIN,
            ..CalendarArgs::default()
        };
        assert!(calendar_state(&session(), &args).is_err());
    }

    #[test]
    fn invalid_view_flag_is_an_error() {
        let args = CalendarArgs {
            view: Some("year".to_string()),
            ..CalendarArgs::default()
        };
        assert!(calendar_state(&session(), &args).is_err());
    }
}
