use std::fs;

use chrono::{DateTime, TimeZone, Utc};
use kazador_core::calendar::{ViewMode, bucket_events, visible_range};
use kazador_core::cli::{CalendarArgs, Command, EmailArgs, TimelineArgs};
use kazador_core::client::{Backend, EventQuery};
use kazador_core::commands::{Session, create_and_reload, dispatch};
use kazador_core::config::Config;
use kazador_core::form::EventForm;
use kazador_core::memory::MemoryBackend;
use serde_json::json;
use tempfile::tempdir;

fn now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 10, 12, 0, 0)
        .single()
        .expect("valid now")
}

fn session() -> Session {
    let mut cfg = Config::defaults();
    cfg.apply_overrides([("rc.color".to_string(), "off".to_string())]);
    Session::from_config(&cfg, chrono_tz::UTC, now()).expect("session")
}

fn fixture() -> serde_json::Value {
    json!({
        "events": [
            { "id": "e1", "summary": "Soundcheck",
              "startAt": "2024-01-10T15:00:00Z", "endAt": "2024-01-10T16:00:00Z" },
            { "id": "e2", "summary": "Festival run",
              "startAt": "2024-01-30T10:00:00Z", "endAt": "2024-02-02T18:00:00Z" }
        ],
        "projects": [ { "id": "p1", "name": "Spring Tour" } ],
        "timeline": [
            { "id": "t1", "projectId": "p1", "type": "event", "title": "Rehearsal",
              "startsAt": "2024-03-18T10:00:00Z", "lane": "Live" },
            { "id": "t2", "projectId": "p1", "type": "milestone", "title": "Opening night",
              "startsAt": "2024-03-20T19:00:00Z", "lane": "live" },
            { "id": "t3", "projectId": "p1", "type": "task", "title": "Merch order" }
        ],
        "dependencies": [
            { "id": "d1", "projectId": "p1", "fromItemId": "t1", "toItemId": "t2", "kind": "FS" }
        ],
        "emails": [
            { "id": "m1", "fromEmail": "promoter@example.com", "fromName": "Promoter",
              "subject": "Hold confirmed", "receivedAt": "2024-01-09T08:00:00Z",
              "labels": ["booking"] },
            { "id": "m2", "fromEmail": "old@example.com", "subject": "Last year",
              "receivedAt": "2023-06-01T08:00:00Z", "labels": ["misc"] }
        ]
    })
}

fn render(backend: &MemoryBackend, command: Command) -> String {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("runtime");
    let mut out = Vec::new();
    runtime
        .block_on(dispatch(backend, &session(), command, &mut out))
        .expect("command succeeds");
    String::from_utf8(out).expect("utf8 output")
}

#[tokio::test]
async fn created_event_echoes_after_reload() {
    let temp = tempdir().expect("tempdir");
    let path = temp.path().join("kazador.json");
    fs::write(&path, fixture().to_string()).expect("write fixture");
    let backend = MemoryBackend::open(&path).expect("open fixture");

    let form = EventForm {
        summary: "Mixdown session".to_string(),
        date: "2024-01-11".to_string(),
        start_time: Some("2:30pm".to_string()),
        end_time: Some("17:00".to_string()),
        location: Some("Studio B".to_string()),
        ..EventForm::default()
    };
    let (created, echoed) = create_and_reload(&backend, &form, chrono_tz::UTC)
        .await
        .expect("event is created");

    let echoed = echoed.expect("event is visible after reload");
    assert_eq!(echoed.summary, "Mixdown session");
    assert_eq!(echoed.date, "2024-01-11");
    assert_eq!(echoed.time.as_deref(), Some("14:30"));
    assert_eq!(echoed, form.expected_echo(chrono_tz::UTC).expect("echo"));

    let reopened = MemoryBackend::open(&path).expect("reopen fixture");
    let range = visible_range(now().date_naive(), ViewMode::Week);
    let events = reopened
        .list_events(&EventQuery {
            from: range.start_instant(chrono_tz::UTC),
            to: range.end_instant(chrono_tz::UTC),
            source_id: None,
        })
        .await
        .expect("events");
    let buckets = bucket_events(&events, range, chrono_tz::UTC);
    assert_eq!(buckets.keys_for(&created.id), vec!["2024-01-11"]);
    assert_eq!(buckets.keys_for("e1"), vec!["2024-01-10"]);
}

#[tokio::test]
async fn invalid_form_never_reaches_the_backend() {
    let backend = MemoryBackend::default();
    let form = EventForm {
        summary: "Mixdown".to_string(),
        date: "2024-01-11".to_string(),
        start_time: Some("15:00".to_string()),
        end_time: Some("14:00".to_string()),
        ..EventForm::default()
    };

    let err = create_and_reload(&backend, &form, chrono_tz::UTC)
        .await
        .expect_err("form is rejected");
    assert_eq!(err.to_string(), "End time must be after start time");
    assert!(backend.snapshot().expect("snapshot").events.is_empty());
}

#[test]
fn month_view_places_multi_day_events_across_the_month_boundary() {
    let backend = MemoryBackend::new(serde_json::from_value(fixture()).expect("snapshot"));
    let output = render(
        &backend,
        Command::Calendar(CalendarArgs {
            query: Some("view=month&date=2024-01-15".to_string()),
            ..CalendarArgs::default()
        }),
    );

    assert!(output.starts_with("January 2024\n"));
    assert!(output.contains("15:00 Soundch…"));
    assert_eq!(output.matches("10:00 Festiva…").count(), 4);
    assert!(output.ends_with("link: ?view=month&date=2024-01-15\n"));
}

#[test]
fn home_keeps_rendering_when_the_digest_fails() {
    let backend = MemoryBackend::new(serde_json::from_value(fixture()).expect("snapshot"));
    let output = render(&backend, Command::Home(EmailArgs::default()));

    assert!(output.contains("! Top actions: no daily digest has been generated yet"));
    assert!(output.contains("! Projects: no daily digest has been generated yet"));
    assert!(output.contains("Soundcheck"));
    assert!(output.contains("Hold confirmed"));
    assert!(!output.contains("Last year"));
    assert!(output.contains("labels: booking, misc"));
}

#[test]
fn timeline_groups_lanes_and_resolves_dependencies() {
    let backend = MemoryBackend::new(serde_json::from_value(fixture()).expect("snapshot"));
    let output = render(
        &backend,
        Command::Timeline(TimelineArgs {
            project_id: "p1".to_string(),
            lane: None,
            query: None,
        }),
    );

    let live = output.find("\nLive\n").expect("live lane");
    let unassigned = output.find("Unassigned\n").expect("unassigned lane");
    assert!(live < unassigned);
    assert!(output.starts_with("lanes: Live\n"));
    assert!(output.contains("Rehearsal -[FS]-> Opening night"));
    assert!(output.ends_with("link: ?projectId=p1\n"));

    let only_unassigned = render(
        &backend,
        Command::Timeline(TimelineArgs {
            project_id: "p1".to_string(),
            lane: Some("unassigned".to_string()),
            query: None,
        }),
    );
    assert!(only_unassigned.contains("Merch order"));
    assert!(only_unassigned.starts_with("lanes: Live\n"));
    assert!(!only_unassigned.lines().any(|line| line == "Live"));
}

#[test]
fn config_file_and_overrides_shape_the_session() {
    let temp = tempdir().expect("tempdir");
    let rc = temp.path().join("kazadorrc");
    fs::write(
        &rc,
        "calendar.view = week\ndigest.top_actions = 3\ncolor = off\n",
    )
    .expect("write rc");

    let mut cfg = Config::load(Some(&rc)).expect("config loads");
    cfg.apply_overrides([("rc.digest.period".to_string(), "weekly".to_string())]);
    let session = Session::from_config(&cfg, chrono_tz::UTC, now()).expect("session");

    assert_eq!(session.default_view, ViewMode::Week);
    assert_eq!(session.top_actions, 3);
    assert_eq!(session.digest_period.as_key(), "weekly");
}
