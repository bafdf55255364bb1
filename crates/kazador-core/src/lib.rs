pub mod calendar;
pub mod cli;
pub mod client;
pub mod commands;
pub mod config;
pub mod datetime;
pub mod digest;
pub mod form;
pub mod memory;
pub mod model;
pub mod panel;
pub mod query;
pub mod render;
pub mod timeline;

use std::ffi::OsString;
use std::io;

use anyhow::Context;
use chrono::Utc;
use clap::Parser;
use tracing::{
  debug,
  info
};

#[tracing::instrument(skip_all)]
pub fn run(
  raw_args: Vec<OsString>
) -> anyhow::Result<()> {
  let pre =
    cli::preprocess_args(&raw_args)?;
  let cli = cli::GlobalCli::parse_from(
    pre.cleaned_args
  );

  cli::init_tracing(
    cli.verbose,
    cli.quiet
  )?;

  info!(
    verbose = cli.verbose,
    quiet = cli.quiet,
    "starting kazador CLI"
  );
  debug!(?pre.rc_overrides, "preprocessed rc overrides");

  let mut cfg = config::Config::load(
    cli.kazadorrc.as_deref()
  )?;
  cfg.apply_overrides(
    pre
      .rc_overrides
      .into_iter()
      .chain(
        cli
          .rc_overrides
          .into_iter()
          .map(|kv| (kv.key, kv.value))
      )
      .chain(cli.backend.map(|url| {
        ("backend.url".to_string(), url)
      }))
  );

  let timezone =
    datetime::display_timezone();
  let session =
    commands::Session::from_config(
      &cfg,
      timezone,
      Utc::now()
    )?;
  let command = cli
    .command
    .unwrap_or(cli::Command::Home(
      cli::EmailArgs::default()
    ));

  let runtime =
    tokio::runtime::Builder::new_current_thread()
      .enable_all()
      .build()
      .context(
        "failed to start async \
         runtime"
      )?;

  let mut out = io::stdout().lock();
  match cli.fixture {
    | Some(path) => {
      let path =
        config::expand_tilde(&path);
      let backend =
        memory::MemoryBackend::open(
          &path
        )
        .with_context(|| {
          format!(
            "failed to open fixture at \
             {}",
            path.display()
          )
        })?;
      runtime.block_on(
        commands::dispatch(
          &backend, &session, command,
          &mut out
        )
      )?;
    }
    | None => {
      let settings =
        cfg.backend_settings()?;
      let backend =
        client::HttpBackend::new(
          &settings
        )?;
      runtime.block_on(
        commands::dispatch(
          &backend, &session, command,
          &mut out
        )
      )?;
    }
  }

  info!("done");
  Ok(())
}
