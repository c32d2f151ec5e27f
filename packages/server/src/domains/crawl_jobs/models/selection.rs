use regex::Regex;

use super::crawl_job::CrawlJob;

/// Predicate over jobs, as selected by a reset rule.
#[derive(Debug, Clone)]
pub enum JobSelection {
    All,
    TargetGroup(String),
    TargetPattern(Regex),
    Tag(String),
}

impl JobSelection {
    pub fn matches(&self, job: &CrawlJob) -> bool {
        match self {
            JobSelection::All => true,
            JobSelection::TargetGroup(group) => job.target_group.eq_ignore_ascii_case(group),
            JobSelection::TargetPattern(pattern) => pattern.is_match(&job.target_ref),
            JobSelection::Tag(tag) => job.tag.as_deref() == Some(tag.as_str()),
        }
    }
}
