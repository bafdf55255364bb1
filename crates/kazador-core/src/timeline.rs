//! Project timeline page: lane filtering, grouping and dependency lookup.

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};

use crate::model::{DependencyKind, TimelineDependency, TimelineItem};

/// Lane filter value selecting items without a lane.
pub const UNASSIGNED_LANE: &str = "unassigned";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TimelineFilter {
    pub project_id: Option<String>,
    pub lane: Option<String>,
}

impl TimelineFilter {
    pub fn matches(&self, item: &TimelineItem) -> bool {
        if let Some(project_id) = self.project_id.as_deref()
            && item.project_id != project_id
        {
            return false;
        }

        match self.lane.as_deref().map(str::trim) {
            None | Some("") => true,
            Some(lane) if lane.eq_ignore_ascii_case(UNASSIGNED_LANE) => lane_of(item).is_none(),
            Some(lane) => lane_of(item).is_some_and(|own| own.eq_ignore_ascii_case(lane)),
        }
    }
}

fn lane_of(item: &TimelineItem) -> Option<&str> {
    item.lane
        .as_deref()
        .map(str::trim)
        .filter(|lane| !lane.is_empty())
}

#[derive(Debug, Clone)]
pub struct LaneGroup<'a> {
    /// `None` for the unassigned group.
    pub lane: Option<String>,
    pub items: Vec<&'a TimelineItem>,
}

impl LaneGroup<'_> {
    pub fn label(&self) -> &str {
        self.lane.as_deref().unwrap_or("Unassigned")
    }
}

/// Items passing `filter`, grouped by lane. Lanes are sorted by name with
/// the unassigned group last; items by start, undated last, then title.
#[tracing::instrument(skip(items), fields(items = items.len()))]
pub fn group_by_lane<'a>(items: &'a [TimelineItem], filter: &TimelineFilter) -> Vec<LaneGroup<'a>> {
    let mut lanes = BTreeMap::<String, LaneGroup<'a>>::new();
    let mut unassigned = Vec::new();

    for item in items.iter().filter(|item| filter.matches(item)) {
        match lane_of(item) {
            Some(lane) => lanes
                .entry(lane.to_ascii_lowercase())
                .or_insert_with(|| LaneGroup {
                    lane: Some(lane.to_string()),
                    items: Vec::new(),
                })
                .items
                .push(item),
            None => unassigned.push(item),
        }
    }

    let mut groups = lanes.into_values().collect::<Vec<_>>();
    if !unassigned.is_empty() {
        groups.push(LaneGroup {
            lane: None,
            items: unassigned,
        });
    }
    for group in &mut groups {
        group.items.sort_by(|a, b| compare_items(a, b));
    }

    tracing::debug!(lanes = groups.len(), "grouped timeline items");
    groups
}

fn compare_items(a: &TimelineItem, b: &TimelineItem) -> Ordering {
    match (a.effective_start(), b.effective_start()) {
        (Some(x), Some(y)) => x.cmp(&y),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
    .then_with(|| a.title.cmp(&b.title))
    .then_with(|| a.id.cmp(&b.id))
}

/// Distinct lanes, for the lane dropdown.
pub fn lane_options(items: &[TimelineItem]) -> Vec<String> {
    let mut lanes = BTreeMap::<String, String>::new();
    for lane in items.iter().filter_map(lane_of) {
        lanes
            .entry(lane.to_ascii_lowercase())
            .or_insert_with(|| lane.to_string());
    }
    lanes.into_values().collect()
}

#[derive(Debug, Clone, PartialEq)]
pub enum DependencyLink<'a> {
    Resolved {
        from: &'a TimelineItem,
        to: &'a TimelineItem,
        kind: DependencyKind,
    },
    Dangling {
        dependency: &'a TimelineDependency,
        missing: Vec<&'a str>,
    },
}

/// Resolves each dependency to the items it connects. Dependencies that
/// point at items not in `items` are reported, not dropped.
pub fn resolve_dependencies<'a>(
    items: &'a [TimelineItem],
    dependencies: &'a [TimelineDependency],
) -> Vec<DependencyLink<'a>> {
    let by_id = items
        .iter()
        .map(|item| (item.id.as_str(), item))
        .collect::<HashMap<_, _>>();

    dependencies
        .iter()
        .map(|dependency| {
            let from = by_id.get(dependency.from_item_id.as_str()).copied();
            let to = by_id.get(dependency.to_item_id.as_str()).copied();
            match (from, to) {
                (Some(from), Some(to)) => DependencyLink::Resolved {
                    from,
                    to,
                    kind: dependency.kind,
                },
                _ => {
                    let mut missing = Vec::new();
                    if from.is_none() {
                        missing.push(dependency.from_item_id.as_str());
                    }
                    if to.is_none() {
                        missing.push(dependency.to_item_id.as_str());
                    }
                    tracing::warn!(
                        dependency = %dependency.id,
                        missing = ?missing,
                        "timeline dependency references unknown items"
                    );
                    DependencyLink::Dangling {
                        dependency,
                        missing,
                    }
                }
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};

    use super::*;
    use crate::model::TimelineItemKind;

    fn item(id: &str, project: &str, lane: Option<&str>, day: Option<u32>) -> TimelineItem {
        TimelineItem {
            id: id.to_string(),
            project_id: project.to_string(),
            kind: TimelineItemKind::Event,
            title: format!("Item {id}"),
            starts_at: day.map(|d| {
                Utc.with_ymd_and_hms(2024, 3, d, 9, 0, 0)
                    .single()
                    .expect("valid instant")
            }),
            ends_at: None,
            lane: lane.map(str::to_string),
            status: None,
            priority: None,
            labels: vec![],
        }
    }

    fn items() -> Vec<TimelineItem> {
        vec![
            item("show", "p1", Some("Live"), Some(20)),
            item("rehearsal", "p1", Some("live"), Some(18)),
            item("tbd", "p1", Some("Live"), None),
            item("press", "p1", Some("Promo"), Some(1)),
            item("loose", "p1", None, Some(5)),
            item("other", "p2", Some("Live"), Some(2)),
        ]
    }

    #[test]
    fn groups_lanes_case_insensitively_with_unassigned_last() {
        let items = items();
        let filter = TimelineFilter {
            project_id: Some("p1".to_string()),
            lane: None,
        };
        let groups = group_by_lane(&items, &filter);

        let labels = groups.iter().map(LaneGroup::label).collect::<Vec<_>>();
        assert_eq!(labels, vec!["Live", "Promo", "Unassigned"]);

        let live = groups[0].items.iter().map(|i| i.id.as_str()).collect::<Vec<_>>();
        assert_eq!(live, vec!["rehearsal", "show", "tbd"]);
    }

    #[test]
    fn lane_filter_selects_one_lane_or_unassigned() {
        let items = items();
        let live = TimelineFilter {
            project_id: None,
            lane: Some("LIVE".to_string()),
        };
        assert_eq!(items.iter().filter(|i| live.matches(i)).count(), 4);

        let unassigned = TimelineFilter {
            project_id: None,
            lane: Some(UNASSIGNED_LANE.to_string()),
        };
        let ids = items
            .iter()
            .filter(|i| unassigned.matches(i))
            .map(|i| i.id.as_str())
            .collect::<Vec<_>>();
        assert_eq!(ids, vec!["loose"]);
    }

    #[test]
    fn lane_options_are_distinct() {
        assert_eq!(lane_options(&items()), vec!["Live", "Promo"]);
    }

    #[test]
    fn dangling_dependencies_are_reported() {
        let items = items();
        let dependencies = vec![
            TimelineDependency {
                id: "d1".to_string(),
                project_id: "p1".to_string(),
                from_item_id: "rehearsal".to_string(),
                to_item_id: "show".to_string(),
                kind: DependencyKind::FinishToStart,
                note: None,
            },
            TimelineDependency {
                id: "d2".to_string(),
                project_id: "p1".to_string(),
                from_item_id: "show".to_string(),
                to_item_id: "ghost".to_string(),
                kind: DependencyKind::StartToStart,
                note: None,
            },
        ];

        let links = resolve_dependencies(&items, &dependencies);
        assert!(matches!(
            &links[0],
            DependencyLink::Resolved { from, to, .. } if from.id == "rehearsal" && to.id == "show"
        ));
        assert!(matches!(
            &links[1],
            DependencyLink::Dangling { missing, .. } if missing == &vec!["ghost"]
        ));
    }
}
