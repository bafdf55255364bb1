use std::ffi::OsString;
use std::io::IsTerminal;
use std::path::PathBuf;

use anyhow::anyhow;
use clap::{ArgAction, Args, Parser, Subcommand};
use tracing::debug;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone)]
pub struct PreprocessedArgs {
    pub cleaned_args: Vec<OsString>,
    pub rc_overrides: Vec<(String, String)>,
}

#[derive(Debug, Clone)]
pub struct KeyVal {
    pub key: String,
    pub value: String,
}

impl std::str::FromStr for KeyVal {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (k, v) = s
            .split_once('=')
            .ok_or_else(|| anyhow!("expected KEY=VALUE, got: {s}"))?;
        Ok(Self {
            key: k.trim().to_string(),
            value: v.trim().to_string(),
        })
    }
}

#[derive(Parser, Debug, Clone)]
#[command(
    name = "kazador",
    version,
    about = "Kazador: calendar, digest and project dashboard in the terminal",
    disable_help_subcommand = true
)]
pub struct GlobalCli {
    #[arg(short = 'v', long = "verbose", action = ArgAction::Count, global = true)]
    pub verbose: u8,

    #[arg(short = 'q', long = "quiet", action = ArgAction::Count, global = true)]
    pub quiet: u8,

    #[arg(
        long = "rc",
        value_parser = clap::builder::ValueParser::new(|s: &str| s.parse::<KeyVal>()),
        action = ArgAction::Append,
        global = true
    )]
    pub rc_overrides: Vec<KeyVal>,

    #[arg(long = "kazadorrc", global = true)]
    pub kazadorrc: Option<PathBuf>,

    /// Backend base URL, overriding `backend.url`.
    #[arg(long = "backend", global = true)]
    pub backend: Option<String>,

    /// Serve everything from a local JSON snapshot instead of the backend.
    #[arg(long = "fixture", global = true, conflicts_with = "backend")]
    pub fixture: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Month, week or day view of calendar events.
    Calendar(CalendarArgs),
    /// Create calendar events.
    #[command(subcommand)]
    Event(EventCommand),
    /// List connected calendar sources.
    Sources,
    /// Pull a calendar source from its provider.
    Sync { source_id: String },
    /// Digest, today's events and recent email in one view.
    Home(EmailArgs),
    /// Top actions and per-project metrics.
    Digest {
        #[arg(long)]
        period: Option<String>,
    },
    /// Recent email, filtered by label and time window.
    Emails(EmailArgs),
    /// List projects.
    Projects,
    /// Show a project, or update it when any field is given.
    Project(ProjectArgs),
    /// List the tasks of a project.
    Tasks { project_id: String },
    /// Create or update tasks.
    #[command(subcommand)]
    Task(TaskCommand),
    /// Project timeline grouped by lane.
    Timeline(TimelineArgs),
    /// Create timeline items and dependencies.
    #[command(subcommand)]
    Item(ItemCommand),
    /// List approvals, pending by default.
    Approvals {
        /// pending, approved, declined or all
        #[arg(long, default_value = "pending")]
        status: String,
    },
    /// Approve a pending approval.
    Approve { approval_id: String },
    /// Decline a pending approval.
    Decline { approval_id: String },
    /// User and project administration.
    #[command(subcommand)]
    Admin(AdminCommand),
}

#[derive(Args, Debug, Clone, Default)]
pub struct CalendarArgs {
    /// day, week or month; defaults to `calendar.view`
    #[arg(long)]
    pub view: Option<String>,

    /// today, tomorrow, monday, +3d, 2024-01-10, ...
    #[arg(long)]
    pub date: Option<String>,

    /// Step back (negative) or forward by whole views.
    #[arg(long, allow_hyphen_values = true, default_value_t = 0)]
    pub shift: i32,

    #[arg(long = "source")]
    pub source_id: Option<String>,

    /// Shareable view state, e.g. `view=week&date=2024-01-10`.
    #[arg(long)]
    pub query: Option<String>,
}

#[derive(Subcommand, Debug, Clone)]
pub enum EventCommand {
    Add(EventAddArgs),
}

#[derive(Args, Debug, Clone)]
pub struct EventAddArgs {
    pub summary: String,

    #[arg(long)]
    pub date: String,

    #[arg(long)]
    pub start: Option<String>,

    #[arg(long)]
    pub end: Option<String>,

    /// Minutes; ignored when `--end` is given.
    #[arg(long)]
    pub duration: Option<i64>,

    #[arg(long)]
    pub all_day: bool,

    #[arg(long)]
    pub location: Option<String>,

    #[arg(long)]
    pub description: Option<String>,

    #[arg(long = "source")]
    pub source_id: Option<String>,

    #[arg(long = "project")]
    pub project_id: Option<String>,
}

#[derive(Args, Debug, Clone, Default)]
pub struct EmailArgs {
    #[arg(long)]
    pub label: Option<String>,

    /// 24h, 7d, 30d or all
    #[arg(long)]
    pub window: Option<String>,
}

#[derive(Args, Debug, Clone)]
pub struct ProjectArgs {
    pub project_id: String,

    #[arg(long)]
    pub name: Option<String>,

    #[arg(long)]
    pub status: Option<String>,

    #[arg(long)]
    pub description: Option<String>,

    #[arg(long)]
    pub color: Option<String>,
}

#[derive(Subcommand, Debug, Clone)]
pub enum TaskCommand {
    Add {
        project_id: String,
        title: String,
        #[arg(long)]
        due: Option<String>,
        #[arg(long)]
        priority: Option<i32>,
    },
    Status {
        task_id: String,
        /// todo, in_progress, blocked or done
        status: String,
    },
}

#[derive(Args, Debug, Clone)]
pub struct TimelineArgs {
    pub project_id: String,

    /// Lane name, or `unassigned`.
    #[arg(long)]
    pub lane: Option<String>,

    #[arg(long)]
    pub query: Option<String>,
}

#[derive(Subcommand, Debug, Clone)]
pub enum ItemCommand {
    Add {
        project_id: String,
        title: String,
        /// event, milestone, task, hold, lead or gate
        #[arg(long, default_value = "milestone")]
        kind: String,
        #[arg(long)]
        start: Option<String>,
        #[arg(long)]
        end: Option<String>,
        #[arg(long)]
        lane: Option<String>,
    },
    Link {
        project_id: String,
        from_item_id: String,
        to_item_id: String,
        /// FS (finish-to-start) or SS (start-to-start)
        #[arg(long, default_value = "FS")]
        kind: String,
        #[arg(long)]
        note: Option<String>,
    },
}

#[derive(Subcommand, Debug, Clone)]
pub enum AdminCommand {
    Users {
        #[arg(long)]
        search: Option<String>,
    },
    Role {
        user_id: String,
        /// admin, member or viewer
        role: String,
    },
    Projects,
}

pub fn init_tracing(verbose: u8, quiet: u8) -> anyhow::Result<()> {
    let default_level = if quiet >= 2 {
        "error"
    } else if quiet == 1 {
        "warn"
    } else if verbose >= 3 {
        "trace"
    } else if verbose == 2 {
        "debug"
    } else if verbose == 1 {
        "info"
    } else {
        "warn"
    };

    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_level))
        .map_err(|e| anyhow!("invalid RUST_LOG / log filter: {e}"))?;

    let init_result = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_level(true)
        .with_ansi(std::io::stderr().is_terminal())
        .try_init();

    if let Err(err) = init_result {
        debug!(error = %err, "tracing subscriber already set, continuing");
    }

    Ok(())
}

/// Pulls positional `rc.key=value` / `rc.key:value` overrides out of the
/// argument list before clap sees it.
#[tracing::instrument(skip_all)]
pub fn preprocess_args(raw: &[OsString]) -> anyhow::Result<PreprocessedArgs> {
    let mut cleaned = Vec::with_capacity(raw.len());
    let mut overrides: Vec<(String, String)> = Vec::new();

    let mut iter = raw.iter().cloned();
    if let Some(bin) = iter.next() {
        cleaned.push(bin);
    }

    for arg in iter {
        let s = arg.to_string_lossy();
        if let Some(rest) = s.strip_prefix("rc.") {
            let parsed = if let Some((k, v)) = rest.split_once('=') {
                Some((format!("rc.{k}"), v.to_string()))
            } else if let Some((k, v)) = rest.split_once(':') {
                Some((format!("rc.{k}"), v.to_string()))
            } else {
                None
            };

            if let Some((k, v)) = parsed {
                debug!(key = %k, value = %v, "captured positional rc override");
                overrides.push((k, v));
                continue;
            }
        }

        cleaned.push(arg);
    }

    Ok(PreprocessedArgs {
        cleaned_args: cleaned,
        rc_overrides: overrides,
    })
}
