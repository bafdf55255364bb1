//! Shareable view state carried in a URL query string.

use chrono::NaiveDate;
use tracing::{debug, warn};
use url::form_urlencoded;

use crate::calendar::{DAY_KEY_FORMAT, ViewMode};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ViewQuery {
    pub view: Option<ViewMode>,
    pub date: Option<NaiveDate>,
    pub project_id: Option<String>,
    pub lane: Option<String>,
}

impl ViewQuery {
    /// Parses `view`, `date`, `projectId` and `lane`. Unknown keys are
    /// ignored; malformed values fall back to unset.
    #[tracing::instrument]
    pub fn parse(raw: &str) -> Self {
        let trimmed = raw.trim().trim_start_matches('?');
        let mut query = Self::default();

        for (key, value) in form_urlencoded::parse(trimmed.as_bytes()) {
            let value = value.trim();
            if value.is_empty() {
                continue;
            }
            match &*key {
                "view" => {
                    query.view = ViewMode::from_key(value);
                    if query.view.is_none() {
                        warn!(value, "ignoring invalid view in query");
                    }
                }
                "date" => match NaiveDate::parse_from_str(value, DAY_KEY_FORMAT) {
                    Ok(date) => query.date = Some(date),
                    Err(err) => warn!(value, error = %err, "ignoring invalid date in query"),
                },
                "projectId" => query.project_id = Some(value.to_string()),
                "lane" => query.lane = Some(value.to_string()),
                other => debug!(key = other, "ignoring unknown query key"),
            }
        }

        query
    }

    /// Canonical form: keys in fixed order, unset values omitted.
    pub fn to_query_string(&self) -> String {
        let mut serializer = form_urlencoded::Serializer::new(String::new());
        if let Some(view) = self.view {
            serializer.append_pair("view", view.as_key());
        }
        if let Some(date) = self.date {
            serializer.append_pair("date", &date.format(DAY_KEY_FORMAT).to_string());
        }
        if let Some(project_id) = &self.project_id {
            serializer.append_pair("projectId", project_id);
        }
        if let Some(lane) = &self.lane {
            serializer.append_pair("lane", lane);
        }
        serializer.finish()
    }

    /// Fills unset fields from `fallback`.
    pub fn or(self, fallback: ViewQuery) -> Self {
        Self {
            view: self.view.or(fallback.view),
            date: self.date.or(fallback.date),
            project_id: self.project_id.or(fallback.project_id),
            lane: self.lane.or(fallback.lane),
        }
    }

    pub fn with_date(mut self, date: NaiveDate) -> Self {
        self.date = Some(date);
        self
    }

    pub fn with_view(mut self, view: ViewMode) -> Self {
        self.view = Some(view);
        self
    }
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;

    use super::ViewQuery;
    use crate::calendar::ViewMode;

    #[test]
    fn parses_known_keys_and_ignores_the_rest() {
        let query = ViewQuery::parse("?view=week&date=2024-01-10&projectId=p-1&lane=Live&utm=x");

        assert_eq!(query.view, Some(ViewMode::Week));
        assert_eq!(query.date, NaiveDate::from_ymd_opt(2024, 1, 10));
        assert_eq!(query.project_id.as_deref(), Some("p-1"));
        assert_eq!(query.lane.as_deref(), Some("Live"));
    }

    #[test]
    fn invalid_values_fall_back_to_unset() {
        let query = ViewQuery::parse("view=fortnight&date=2024-13-40&lane=");
        assert_eq!(query, ViewQuery::default());
    }

    #[test]
    fn canonical_string_round_trips() {
        let raw = "view=month&date=2024-02-01&projectId=abc&lane=Promo+%26+Press";
        let query = ViewQuery::parse(raw);
        assert_eq!(query.lane.as_deref(), Some("Promo & Press"));
        assert_eq!(query.to_query_string(), raw);
        assert_eq!(ViewQuery::parse(&query.to_query_string()), query);
    }

    #[test]
    fn fallback_fills_only_missing_fields() {
        let explicit = ViewQuery::parse("view=day");
        let fallback = ViewQuery::default()
            .with_view(ViewMode::Month)
            .with_date(NaiveDate::from_ymd_opt(2024, 5, 1).expect("valid date"));

        let merged = explicit.or(fallback);
        assert_eq!(merged.view, Some(ViewMode::Day));
        assert_eq!(merged.date, NaiveDate::from_ymd_opt(2024, 5, 1));
    }
}
