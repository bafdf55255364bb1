use std::collections::HashMap;
use std::fs;
use std::path::{
  Path,
  PathBuf
};
use std::time::Duration;

use anyhow::{
  Context,
  anyhow
};
use tracing::{
  debug,
  info,
  trace,
  warn
};

use crate::calendar::ViewMode;
use crate::client::{
  BackendSettings,
  DEFAULT_BACKEND_URL,
  DEFAULT_TIMEOUT_SECS
};
use crate::digest::MAX_EMAIL_ROWS;
use crate::model::DigestPeriod;

pub const TOKEN_ENV: &str =
  "KAZADOR_TOKEN";
pub const RC_ENV: &str = "KAZADORRC";

const DEFAULT_TOP_ACTIONS: usize = 10;

#[derive(Debug, Clone)]
pub struct Config {
  map: HashMap<String, String>,
  pub loaded_files: Vec<PathBuf>
}

impl Config {
  #[tracing::instrument(skip(
    rc_override
  ))]
  pub fn load(
    rc_override: Option<&Path>
  ) -> anyhow::Result<Self> {
    let mut cfg = Config::defaults();

    let rc = resolve_rc_path(
      rc_override
    )?;
    if let Some(path) = rc {
      info!(kazadorrc = %path.display(), "loading kazadorrc");
      cfg.load_file(&path)?;
    } else {
      debug!(
        "no kazadorrc found; using \
         defaults"
      );
    }

    Ok(cfg)
  }

  /// Built-in values only, no file.
  pub fn defaults() -> Self {
    let mut map = HashMap::new();
    for (key, value) in [
      ("backend.url", DEFAULT_BACKEND_URL),
      ("calendar.view", "month"),
      ("color", "on"),
      ("digest.period", "daily")
    ] {
      map.insert(
        key.to_string(),
        value.to_string()
      );
    }
    Config {
      map,
      loaded_files: vec![]
    }
  }

  #[tracing::instrument(skip(
    self, overrides
  ))]
  pub fn apply_overrides<I>(
    &mut self,
    overrides: I
  ) where
    I: IntoIterator<
      Item = (String, String)
    >
  {
    for (k, v) in overrides {
      let key = k
        .strip_prefix("rc.")
        .unwrap_or(&k)
        .to_string();
      debug!(key = %key, value = %v, "applying override");
      self.map.insert(key, v);
    }
  }

  pub fn get(
    &self,
    key: &str
  ) -> Option<String> {
    self.map.get(key).cloned()
  }

  pub fn get_bool(
    &self,
    key: &str
  ) -> Option<bool> {
    self
      .map
      .get(key)
      .map(|v| parse_bool(v))
  }

  fn get_number(
    &self,
    key: &str
  ) -> anyhow::Result<Option<u64>> {
    self
      .map
      .get(key)
      .map(|raw| {
        raw.trim().parse::<u64>().map_err(
          |_| {
            anyhow!(
              "invalid {key}: expected \
               a whole number, got \
               '{raw}'"
            )
          }
        )
      })
      .transpose()
  }

  /// Backend URL, bearer token and
  /// timeout. The token falls back to
  /// `KAZADOR_TOKEN`.
  pub fn backend_settings(
    &self
  ) -> anyhow::Result<BackendSettings>
  {
    let token = self
      .get("backend.token")
      .filter(|t| !t.trim().is_empty())
      .or_else(|| {
        std::env::var(TOKEN_ENV)
          .ok()
          .filter(|t| {
            !t.trim().is_empty()
          })
      });

    let timeout_secs = self
      .get_number(
        "backend.timeout_secs"
      )?
      .unwrap_or(DEFAULT_TIMEOUT_SECS);
    if timeout_secs == 0 {
      return Err(anyhow!(
        "backend.timeout_secs must \
         be positive"
      ));
    }

    Ok(BackendSettings {
      url: self
        .get("backend.url")
        .unwrap_or_else(|| {
          DEFAULT_BACKEND_URL
            .to_string()
        }),
      token,
      timeout: Duration::from_secs(
        timeout_secs
      )
    })
  }

  pub fn default_view(
    &self
  ) -> anyhow::Result<ViewMode> {
    match self.get("calendar.view") {
      | Some(raw) => raw.parse(),
      | None => Ok(ViewMode::default())
    }
  }

  pub fn digest_period(
    &self
  ) -> anyhow::Result<DigestPeriod> {
    match self.get("digest.period") {
      | Some(raw) => {
        DigestPeriod::from_key(&raw)
          .ok_or_else(|| {
            anyhow!(
              "invalid digest.period \
               '{raw}': expected daily \
               or weekly"
            )
          })
      }
      | None => {
        Ok(DigestPeriod::default())
      }
    }
  }

  /// Row cap for the recent-email
  /// table, never above 500.
  pub fn email_limit(
    &self
  ) -> anyhow::Result<usize> {
    let limit = self
      .get_number("emails.limit")?
      .map(|n| {
        usize::try_from(n)
          .unwrap_or(usize::MAX)
      })
      .unwrap_or(MAX_EMAIL_ROWS);
    if limit > MAX_EMAIL_ROWS {
      warn!(
        limit,
        max = MAX_EMAIL_ROWS,
        "emails.limit capped"
      );
    }
    Ok(limit.min(MAX_EMAIL_ROWS))
  }

  pub fn top_actions(
    &self
  ) -> anyhow::Result<usize> {
    Ok(
      self
        .get_number(
          "digest.top_actions"
        )?
        .map(|n| {
          usize::try_from(n)
            .unwrap_or(usize::MAX)
        })
        .unwrap_or(DEFAULT_TOP_ACTIONS)
    )
  }

  #[tracing::instrument(skip(self))]
  fn load_file(
    &mut self,
    path: &Path
  ) -> anyhow::Result<()> {
    let path = expand_tilde(path);
    let text =
      fs::read_to_string(&path)
        .with_context(|| {
          format!(
            "failed to read {}",
            path.display()
          )
        })?;

    self
      .loaded_files
      .push(path.clone());

    let base_dir = path
      .parent()
      .map(|p| p.to_path_buf())
      .unwrap_or_else(|| {
        PathBuf::from(".")
      });

    for (line_num, raw_line) in
      text.lines().enumerate()
    {
      let line =
        strip_comment(raw_line).trim();

      if line.is_empty() {
        continue;
      }

      if let Some(include_rest) =
        line.strip_prefix("include ")
      {
        let include_path =
          resolve_include_path(
            &base_dir,
            include_rest.trim()
          )?;
        debug!(
            file = %path.display(),
            include = %include_path.display(),
            line = line_num + 1,
            "processing include"
        );

        if self
          .loaded_files
          .contains(&include_path)
        {
          warn!(include = %include_path.display(), "include cycle; skipping");
        } else if include_path.exists()
        {
          self
            .load_file(&include_path)?;
        } else {
          warn!(include = %include_path.display(), "include file does not exist; skipping");
        }
        continue;
      }

      let (k, v) = line
        .split_once('=')
        .ok_or_else(|| {
          anyhow!(
            "invalid config line \
             {}:{}: {}",
            path.display(),
            line_num + 1,
            raw_line
          )
        })?;

      let key = k.trim().to_string();
      let value = v.trim().to_string();
      trace!(key = %key, "loaded config key");
      self.map.insert(key, value);
    }

    Ok(())
  }
}

#[tracing::instrument(skip(
  override_path
))]
fn resolve_rc_path(
  override_path: Option<&Path>
) -> anyhow::Result<Option<PathBuf>> {
  if let Some(path) = override_path {
    return Ok(Some(path.to_path_buf()));
  }

  if let Ok(rc_env) =
    std::env::var(RC_ENV)
  {
    if rc_env == "/dev/null" {
      return Ok(None);
    }
    return Ok(Some(PathBuf::from(
      rc_env
    )));
  }

  let Some(home) = dirs::home_dir()
  else {
    warn!(
      "cannot determine home \
       directory"
    );
    return Ok(None);
  };
  let candidate =
    home.join(".kazadorrc");
  if candidate.exists() {
    return Ok(Some(candidate));
  }

  Ok(None)
}

/// Drops a `#` comment that starts the
/// line or follows whitespace; a `#`
/// inside a value is kept.
fn strip_comment(line: &str) -> &str {
  let mut prev_is_space = true;
  for (idx, ch) in line.char_indices() {
    if ch == '#' && prev_is_space {
      return &line[..idx];
    }
    prev_is_space = ch.is_whitespace();
  }
  line
}

fn resolve_include_path(
  base_dir: &Path,
  include: &str
) -> anyhow::Result<PathBuf> {
  if include.trim().is_empty() {
    return Err(anyhow!(
      "include path cannot be empty"
    ));
  }

  let raw = PathBuf::from(include);
  let expanded = expand_tilde(&raw);
  if expanded.is_absolute() {
    Ok(expanded)
  } else {
    Ok(base_dir.join(expanded))
  }
}

pub fn expand_tilde(
  path: &Path
) -> PathBuf {
  let text = path.to_string_lossy();
  if let Some(rest) =
    text.strip_prefix("~/")
    && let Some(home) = dirs::home_dir()
  {
    return home.join(rest);
  }
  path.to_path_buf()
}

fn parse_bool(s: &str) -> bool {
  matches!(
    s.trim()
      .to_ascii_lowercase()
      .as_str(),
    "1" | "y" | "yes" | "on" | "true"
  )
}

#[cfg(test)]
mod tests {
  use std::fs;

  use tempfile::tempdir;

  use super::*;

  #[test]
  fn hash_inside_a_value_is_kept() {
    let dir =
      tempdir().expect("tempdir");
    let rc = dir.path().join("main.rc");
    fs::write(
      &rc,
      [
        "backend.token = abc#123 # issued 2024",
        "backend.url = https://kazador.example/app#/api",
        "#calendar.view = day",
        ""
      ]
      .join("\n")
    )
    .expect("write rc");

    let cfg = Config::load(Some(&rc))
      .expect("config loads");

    assert_eq!(
      cfg.get("backend.token").as_deref(),
      Some("abc#123")
    );
    assert_eq!(
      cfg.get("backend.url").as_deref(),
      Some(
        "https://kazador.example/app#/api"
      )
    );
    assert_eq!(
      cfg.get("calendar.view").as_deref(),
      Some("month")
    );
    assert_eq!(
      strip_comment("\t# note"),
      "\t"
    );
  }

  #[test]
  fn reads_keys_comments_and_includes()
  {
    let dir =
      tempdir().expect("tempdir");
    let extra =
      dir.path().join("extra.rc");
    fs::write(
      &extra,
      "emails.limit = 50\n"
    )
    .expect("write include");
    let rc = dir.path().join("main.rc");
    fs::write(
      &rc,
      [
        "# dashboard",
        "backend.url = https://kazador.example/api # prod",
        "calendar.view=week",
        "include extra.rc",
        "include missing.rc",
        ""
      ]
      .join("\n")
    )
    .expect("write rc");

    let cfg = Config::load(Some(&rc))
      .expect("config loads");

    assert_eq!(
      cfg.get("backend.url").as_deref(),
      Some("https://kazador.example/api")
    );
    assert_eq!(
      cfg.default_view().expect("view"),
      ViewMode::Week
    );
    assert_eq!(
      cfg.email_limit().expect("limit"),
      50
    );
    assert_eq!(cfg.loaded_files.len(), 2);
  }

  #[test]
  fn overrides_win_over_file_values() {
    let dir =
      tempdir().expect("tempdir");
    let rc = dir.path().join("rc");
    fs::write(
      &rc,
      "digest.period = daily\ncolor = \
       on\n"
    )
    .expect("write rc");

    let mut cfg =
      Config::load(Some(&rc))
        .expect("config loads");
    cfg.apply_overrides([
      (
        "rc.digest.period".to_string(),
        "weekly".to_string()
      ),
      (
        "color".to_string(),
        "off".to_string()
      )
    ]);

    assert_eq!(
      cfg
        .digest_period()
        .expect("period"),
      DigestPeriod::Weekly
    );
    assert_eq!(
      cfg.get_bool("color"),
      Some(false)
    );
  }

  #[test]
  fn email_limit_is_capped() {
    let mut cfg = Config::defaults();
    assert_eq!(
      cfg.email_limit().expect("limit"),
      MAX_EMAIL_ROWS
    );
    cfg.apply_overrides([(
      "emails.limit".to_string(),
      "9000".to_string()
    )]);
    assert_eq!(
      cfg.email_limit().expect("limit"),
      MAX_EMAIL_ROWS
    );
  }

  #[test]
  fn rejects_bad_values() {
    let mut cfg = Config::defaults();
    cfg.apply_overrides([
      (
        "backend.timeout_secs"
          .to_string(),
        "soon".to_string()
      ),
      (
        "digest.period".to_string(),
        "hourly".to_string()
      ),
      (
        "calendar.view".to_string(),
        "year".to_string()
      )
    ]);

    assert!(
      cfg.backend_settings().is_err()
    );
    assert!(
      cfg.digest_period().is_err()
    );
    assert!(
      cfg.default_view().is_err()
    );
  }

  #[test]
  fn backend_settings_from_keys() {
    let mut cfg = Config::defaults();
    cfg.apply_overrides([
      (
        "backend.token".to_string(),
        "secret".to_string()
      ),
      (
        "backend.timeout_secs"
          .to_string(),
        "5".to_string()
      )
    ]);

    let settings = cfg
      .backend_settings()
      .expect("settings");
    assert_eq!(
      settings.url,
      DEFAULT_BACKEND_URL
    );
    assert_eq!(
      settings.token.as_deref(),
      Some("secret")
    );
    assert_eq!(
      settings.timeout,
      Duration::from_secs(5)
    );
  }

  #[test]
  fn malformed_line_is_an_error() {
    let dir =
      tempdir().expect("tempdir");
    let rc = dir.path().join("rc");
    fs::write(&rc, "just words\n")
      .expect("write rc");

    let err = Config::load(Some(&rc))
      .expect_err("should fail");
    assert!(
      err
        .to_string()
        .contains("invalid config line")
    );
  }
}
