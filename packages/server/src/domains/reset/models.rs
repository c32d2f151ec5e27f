use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use tracing::warn;

use crate::common::RuleId;
use crate::domains::crawl_jobs::models::{CrawlJob, JobSelection};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "reset_selection_type", rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SelectionType {
    All,
    ByTargetGroup,
    ByTargetPattern,
    ByTag,
}

/// Operator policy returning matching DONE jobs to PENDING every `frequency`.
#[derive(FromRow, Debug, Clone, PartialEq)]
pub struct ResetRule {
    pub id: RuleId,
    pub name: String,
    pub selection_type: SelectionType,
    pub selector: Option<String>,
    pub frequency_seconds: i64,
    pub enabled: bool,
    pub last_run_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, thiserror::Error)]
pub enum InvalidRule {
    #[error("rule {0} needs a selector")]
    MissingSelector(RuleId),

    #[error("rule {rule} has an invalid pattern: {source}")]
    BadPattern {
        rule: RuleId,
        #[source]
        source: regex::Error,
    },
}

impl ResetRule {
    pub fn new(
        name: impl Into<String>,
        selection_type: SelectionType,
        selector: Option<&str>,
        frequency: chrono::Duration,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: RuleId::new(),
            name: name.into(),
            selection_type,
            selector: selector.map(str::to_string),
            frequency_seconds: frequency.num_seconds().max(1),
            enabled: true,
            last_run_at: None,
            created_at: now,
        }
    }

    pub fn frequency(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.frequency_seconds)
    }

    /// `frequency` has passed since the last run, or since creation for a
    /// rule that has never run.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        let since = self.last_run_at.unwrap_or(self.created_at);
        now - since >= self.frequency()
    }

    pub fn selection(&self) -> Result<JobSelection, InvalidRule> {
        let selector = || {
            self.selector
                .clone()
                .filter(|s| !s.is_empty())
                .ok_or(InvalidRule::MissingSelector(self.id))
        };

        Ok(match self.selection_type {
            SelectionType::All => JobSelection::All,
            SelectionType::ByTargetGroup => JobSelection::TargetGroup(selector()?),
            SelectionType::ByTag => JobSelection::Tag(selector()?),
            SelectionType::ByTargetPattern => {
                let pattern = selector()?;
                let regex = Regex::new(&pattern).map_err(|source| InvalidRule::BadPattern {
                    rule: self.id,
                    source,
                })?;
                JobSelection::TargetPattern(regex)
            }
        })
    }
}

/// Enabled rules in precedence order, with their compiled selections.
///
/// Specific rules (tag, pattern, group) win over `ALL`; within each tier the
/// oldest rule wins.
pub struct RuleSet {
    rules: Vec<(ResetRule, JobSelection)>,
}

impl RuleSet {
    pub fn new(rules: Vec<ResetRule>) -> Self {
        let mut compiled: Vec<(ResetRule, JobSelection)> = rules
            .into_iter()
            .filter(|rule| rule.enabled)
            .filter_map(|rule| match rule.selection() {
                Ok(selection) => Some((rule, selection)),
                Err(e) => {
                    warn!(rule_id = %rule.id, error = %e, "skipping invalid reset rule");
                    None
                }
            })
            .collect();

        compiled.sort_by(|(a, _), (b, _)| {
            let tier = |r: &ResetRule| u8::from(r.selection_type == SelectionType::All);
            tier(a)
                .cmp(&tier(b))
                .then(a.created_at.cmp(&b.created_at))
                .then(a.id.cmp(&b.id))
        });

        Self { rules: compiled }
    }

    pub fn winner(&self, job: &CrawlJob) -> Option<&ResetRule> {
        self.rules
            .iter()
            .find(|(_, selection)| selection.matches(job))
            .map(|(rule, _)| rule)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ResetRule, &JobSelection)> {
        self.rules.iter().map(|(rule, selection)| (rule, selection))
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domains::crawl_jobs::models::NewCrawlJob;
    use chrono::{Duration, TimeZone};

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 2, 1, 0, 0, 0).unwrap() + Duration::seconds(secs)
    }

    fn job(url: &str, tag: Option<&str>) -> CrawlJob {
        let new = match tag {
            Some(tag) => NewCrawlJob::builder().target_ref(url).tag(tag).build(),
            None => NewCrawlJob::builder().target_ref(url).build(),
        };
        new.into_job(300, t(0))
    }

    #[test]
    fn specific_rules_beat_all_regardless_of_age() {
        let all = ResetRule::new("all", SelectionType::All, None, Duration::hours(1), t(0));
        let by_tag = ResetRule::new("base", SelectionType::ByTag, Some("base"), Duration::hours(24), t(10));
        let set = RuleSet::new(vec![all.clone(), by_tag.clone()]);

        assert_eq!(set.winner(&job("https://a.example/1", Some("base"))).unwrap().id, by_tag.id);
        assert_eq!(set.winner(&job("https://a.example/2", None)).unwrap().id, all.id);
    }

    #[test]
    fn oldest_specific_rule_wins_ties() {
        let pattern = ResetRule::new(
            "products",
            SelectionType::ByTargetPattern,
            Some(r"/p/\d+$"),
            Duration::hours(6),
            t(0),
        );
        let group = ResetRule::new(
            "shop",
            SelectionType::ByTargetGroup,
            Some("a.example"),
            Duration::hours(12),
            t(5),
        );
        let set = RuleSet::new(vec![group, pattern.clone()]);

        assert_eq!(set.winner(&job("https://a.example/p/1", None)).unwrap().id, pattern.id);
    }

    #[test]
    fn disabled_and_invalid_rules_are_ignored() {
        let mut disabled = ResetRule::new("off", SelectionType::All, None, Duration::hours(1), t(0));
        disabled.enabled = false;
        let broken = ResetRule::new("bad", SelectionType::ByTargetPattern, Some("("), Duration::hours(1), t(0));
        let missing = ResetRule::new("empty", SelectionType::ByTag, None, Duration::hours(1), t(0));

        let set = RuleSet::new(vec![disabled, broken, missing]);
        assert!(set.is_empty());
        assert!(set.winner(&job("https://a.example/1", None)).is_none());
    }

    #[test]
    fn rule_refires_only_after_its_frequency() {
        let mut rule = ResetRule::new("r", SelectionType::All, None, Duration::hours(1), t(0));
        assert!(!rule.is_due(t(0)));
        assert!(!rule.is_due(t(3599)));
        assert!(rule.is_due(t(3600)));

        rule.last_run_at = Some(t(3600));
        assert!(!rule.is_due(t(7199)));
        assert!(rule.is_due(t(7200)));
    }
}
