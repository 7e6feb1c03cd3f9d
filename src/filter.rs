use crate::types::{Status, WorkflowRun, WorkflowRunJob};

/// Query over stored runs. Unset fields match everything.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunFilter {
    pub repo_id: Option<i64>,
    pub concurrency_group: Option<String>,
    pub statuses: Vec<Status>,
    pub exclude_ids: Vec<i64>,
}

impl RunFilter {
    pub fn repo(repo_id: i64) -> Self {
        Self {
            repo_id: Some(repo_id),
            ..Default::default()
        }
    }

    pub fn group(mut self, group: &str) -> Self {
        self.concurrency_group = Some(group.to_string());
        self
    }

    pub fn statuses(mut self, statuses: &[Status]) -> Self {
        self.statuses = statuses.to_vec();
        self
    }

    pub fn excluding(mut self, id: i64) -> Self {
        self.exclude_ids.push(id);
        self
    }

    pub fn matches(&self, run: &WorkflowRun) -> bool {
        self.repo_id.map_or(true, |id| run.repo_id == id)
            && self
                .concurrency_group
                .as_deref()
                .map_or(true, |g| run.concurrency_group == g)
            && (self.statuses.is_empty() || run.status.is_in(&self.statuses))
            && !self.exclude_ids.contains(&run.id)
    }
}

/// Query over stored jobs. Unset fields match everything.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobFilter {
    pub run_id: Option<i64>,
    pub repo_id: Option<i64>,
    pub concurrency_group: Option<String>,
    pub statuses: Vec<Status>,
    pub exclude_ids: Vec<i64>,
}

impl JobFilter {
    pub fn run(run_id: i64) -> Self {
        Self {
            run_id: Some(run_id),
            ..Default::default()
        }
    }

    pub fn repo(repo_id: i64) -> Self {
        Self {
            repo_id: Some(repo_id),
            ..Default::default()
        }
    }

    pub fn group(mut self, group: &str) -> Self {
        self.concurrency_group = Some(group.to_string());
        self
    }

    pub fn statuses(mut self, statuses: &[Status]) -> Self {
        self.statuses = statuses.to_vec();
        self
    }

    pub fn excluding(mut self, id: i64) -> Self {
        self.exclude_ids.push(id);
        self
    }

    pub fn matches(&self, job: &WorkflowRunJob) -> bool {
        self.run_id.map_or(true, |id| job.run_id == id)
            && self.repo_id.map_or(true, |id| job.repo_id == id)
            && self
                .concurrency_group
                .as_deref()
                .map_or(true, |g| job.concurrency_group == g)
            && (self.statuses.is_empty() || job.status.is_in(&self.statuses))
            && !self.exclude_ids.contains(&job.id)
    }
}

fn write_filter(
    f: &mut std::fmt::Formatter<'_>,
    scope: &[(&str, Option<i64>)],
    group: &Option<String>,
    statuses: &[Status],
) -> std::fmt::Result {
    let mut parts: Vec<String> = scope
        .iter()
        .filter_map(|(name, value)| value.map(|v| format!("{}={}", name, v)))
        .collect();
    if let Some(g) = group {
        parts.push(format!("group={}", g));
    }
    if !statuses.is_empty() {
        let names: Vec<&str> = statuses.iter().map(|s| s.as_str()).collect();
        parts.push(format!("status={}", names.join(",")));
    }
    write!(f, "{}", parts.join(" "))
}

impl std::fmt::Display for RunFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write_filter(
            f,
            &[("repo", self.repo_id)],
            &self.concurrency_group,
            &self.statuses,
        )
    }
}

impl std::fmt::Display for JobFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write_filter(
            f,
            &[("run", self.run_id), ("repo", self.repo_id)],
            &self.concurrency_group,
            &self.statuses,
        )
    }
}
