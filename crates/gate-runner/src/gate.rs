//! Tagged task gate.
//!
//! A gate is an ordered list of named tasks. Each task carries a non-empty
//! tag set; a [`TagFilter`] decides which tasks run. By default the gate is
//! fail-fast: the first failing task stops the sequence and every later task
//! stays `pending` in the report. [`GateMode::ContinueOnFailure`] keeps going
//! and still reports the gate as failed.

use crate::GateError;
use anyhow::Result;
use chrono::Utc;
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::{BTreeSet, HashSet};
use std::env;
use std::time::Instant;
use tracing::{debug, info};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TagFilter {
    include: BTreeSet<String>,
    exclude: BTreeSet<String>,
}

impl TagFilter {
    pub fn new<I, E, S, T>(include: I, exclude: E) -> Self
    where
        I: IntoIterator<Item = S>,
        E: IntoIterator<Item = T>,
        S: Into<String>,
        T: Into<String>,
    {
        Self {
            include: include.into_iter().map(Into::into).collect(),
            exclude: exclude.into_iter().map(Into::into).collect(),
        }
    }

    /// Parses comma separated tag lists as given on the command line.
    pub fn parse(include: Option<&str>, exclude: Option<&str>) -> Self {
        fn split(raw: Option<&str>) -> BTreeSet<String> {
            raw.map(|s| {
                s.split(',')
                    .map(str::trim)
                    .filter(|t| !t.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
        }
        Self {
            include: split(include),
            exclude: split(exclude),
        }
    }

    pub fn matches(&self, tags: &BTreeSet<String>) -> bool {
        let included = self.include.is_empty() || !self.include.is_disjoint(tags);
        included && self.exclude.is_disjoint(tags)
    }

    pub fn include(&self) -> &BTreeSet<String> {
        &self.include
    }

    pub fn exclude(&self) -> &BTreeSet<String> {
        &self.exclude
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Passed,
    Failed,
    Skipped,
}

impl TaskStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Passed => "passed",
            TaskStatus::Failed => "failed",
            TaskStatus::Skipped => "skipped",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GateMode {
    #[default]
    FailFast,
    ContinueOnFailure,
}

type TaskBody<'a, C> = Box<dyn FnOnce(&mut C) -> Result<()> + 'a>;

/// One unit of gate work. `C` is the state handed to every body.
pub struct GateTask<'a, C> {
    pub name: String,
    pub tags: BTreeSet<String>,
    body: TaskBody<'a, C>,
}

impl<'a, C> GateTask<'a, C> {
    pub fn new<S, T, F>(name: impl Into<String>, tags: T, body: F) -> Self
    where
        T: IntoIterator<Item = S>,
        S: Into<String>,
        F: FnOnce(&mut C) -> Result<()> + 'a,
    {
        Self {
            name: name.into(),
            tags: tags.into_iter().map(Into::into).collect(),
            body: Box::new(body),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TaskRecord {
    pub name: String,
    pub tags: Vec<String>,
    pub status: TaskStatus,
    pub duration_ms: Option<u128>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct GateReport {
    pub started_at: String,
    pub finished_at: String,
    pub include_tags: Vec<String>,
    pub exclude_tags: Vec<String>,
    pub tasks: Vec<TaskRecord>,
}

impl GateReport {
    pub fn succeeded(&self) -> bool {
        self.tasks.iter().all(|t| t.status != TaskStatus::Failed)
    }

    pub fn status_of(&self, name: &str) -> Option<TaskStatus> {
        self.tasks.iter().find(|t| t.name == name).map(|t| t.status)
    }

    pub fn first_failure(&self) -> Option<&TaskRecord> {
        self.tasks.iter().find(|t| t.status == TaskStatus::Failed)
    }

    pub fn count(&self, status: TaskStatus) -> usize {
        self.tasks.iter().filter(|t| t.status == status).count()
    }

    /// Converts a failed report into a `TaskFailure` naming the first failed task.
    pub fn into_result(self) -> Result<GateReport> {
        if let Some(failed) = self.first_failure() {
            return Err(GateError::TaskFailure {
                task: failed.name.clone(),
                message: failed.error.clone().unwrap_or_default(),
            }
            .into());
        }
        Ok(self)
    }

    pub fn to_json(&self) -> Value {
        json!({
            "schema_version": "gate_report_v1",
            "ok": self.succeeded(),
            "started_at": self.started_at,
            "finished_at": self.finished_at,
            "filter": { "include": self.include_tags, "exclude": self.exclude_tags },
            "counts": {
                "passed": self.count(TaskStatus::Passed),
                "failed": self.count(TaskStatus::Failed),
                "skipped": self.count(TaskStatus::Skipped),
                "pending": self.count(TaskStatus::Pending),
            },
            "tasks": self.tasks,
        })
    }
}

/// Log section around a running task. The footer is emitted on drop so it
/// appears even when the body fails.
struct TaskSection {
    name: String,
    github_actions: bool,
}

impl TaskSection {
    fn open(name: &str) -> Self {
        let github_actions = env::var("GITHUB_ACTIONS")
            .map(|v| v == "true")
            .unwrap_or(false);
        println!();
        if github_actions {
            println!("::group::{}", name);
        } else {
            println!("==> BEGIN: {}", name);
        }
        Self {
            name: name.to_string(),
            github_actions,
        }
    }
}

impl Drop for TaskSection {
    fn drop(&mut self) {
        if self.github_actions {
            println!("::endgroup::");
        } else {
            println!("<== END: {}", self.name);
        }
    }
}

fn validate_tasks<C>(tasks: &[GateTask<'_, C>]) -> Result<()> {
    let mut seen = HashSet::new();
    for task in tasks {
        if task.tags.is_empty() {
            return Err(GateError::config(format!(
                "gate task '{}' has an empty tag set",
                task.name
            )));
        }
        if !seen.insert(task.name.as_str()) {
            return Err(GateError::config(format!(
                "duplicate gate task name: {}",
                task.name
            )));
        }
    }
    Ok(())
}

/// Runs `tasks` in order against `ctx`.
///
/// Returns `Err` only for a malformed task list (duplicate names, empty tag
/// sets). Task failures are recorded in the report; use
/// [`GateReport::into_result`] to turn them into a `TaskFailure`.
pub fn run_gate<C>(
    tasks: Vec<GateTask<'_, C>>,
    filter: &TagFilter,
    mode: GateMode,
    ctx: &mut C,
) -> Result<GateReport> {
    validate_tasks(&tasks)?;
    let started_at = Utc::now().to_rfc3339();

    let mut records: Vec<TaskRecord> = tasks
        .iter()
        .map(|t| TaskRecord {
            name: t.name.clone(),
            tags: t.tags.iter().cloned().collect(),
            status: TaskStatus::Pending,
            duration_ms: None,
            error: None,
        })
        .collect();

    for (idx, task) in tasks.into_iter().enumerate() {
        let record = &mut records[idx];
        if !filter.matches(&task.tags) {
            debug!(task = %task.name, "skipping gate task (tags do not match)");
            record.status = TaskStatus::Skipped;
            continue;
        }

        record.status = TaskStatus::Running;
        let start = Instant::now();
        let outcome = {
            let _section = TaskSection::open(&task.name);
            (task.body)(&mut *ctx)
        };
        record.duration_ms = Some(start.elapsed().as_millis());

        match outcome {
            Ok(()) => {
                record.status = TaskStatus::Passed;
                info!(task = %record.name, "gate task passed");
            }
            Err(err) => {
                record.status = TaskStatus::Failed;
                record.error = Some(format!("{:#}", err));
                info!(task = %record.name, error = %format!("{:#}", err), "gate task failed");
                if mode == GateMode::FailFast {
                    break;
                }
            }
        }
    }

    let include_tags = filter.include().iter().cloned().collect();
    let exclude_tags = filter.exclude().iter().cloned().collect();
    Ok(GateReport {
        started_at,
        finished_at: Utc::now().to_rfc3339(),
        include_tags,
        exclude_tags,
        tasks: records,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;

    fn tags(list: &[&str]) -> BTreeSet<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    fn scenario<'a>() -> Vec<GateTask<'a, Vec<String>>> {
        vec![
            GateTask::new("A", ["x"], |ran: &mut Vec<String>| {
                ran.push("A".to_string());
                Ok(())
            }),
            GateTask::new("B", ["y"], |ran: &mut Vec<String>| {
                ran.push("B".to_string());
                Err(anyhow!("boom"))
            }),
            GateTask::new("C", ["x"], |ran: &mut Vec<String>| {
                ran.push("C".to_string());
                Ok(())
            }),
        ]
    }

    #[test]
    fn filter_include_and_exclude() {
        let f = TagFilter::new(["test"], ["ctw"]);
        assert!(f.matches(&tags(&["test", "fulltest"])));
        assert!(!f.matches(&tags(&["bootstrap"])));
        assert!(!f.matches(&tags(&["test", "ctw"])));
        let all = TagFilter::default();
        assert!(all.matches(&tags(&["anything"])));
        let only_exclude = TagFilter::parse(None, Some("style, javadoc"));
        assert!(only_exclude.matches(&tags(&["test"])));
        assert!(!only_exclude.matches(&tags(&["javadoc"])));
    }

    #[test]
    fn tasks_outside_filter_are_skipped_without_side_effects() {
        let mut ran = Vec::new();
        let report = run_gate(
            scenario(),
            &TagFilter::new(["x"], Vec::<String>::new()),
            GateMode::FailFast,
            &mut ran,
        )
        .expect("gate");
        assert_eq!(ran, vec!["A", "C"]);
        assert_eq!(report.status_of("A"), Some(TaskStatus::Passed));
        assert_eq!(report.status_of("B"), Some(TaskStatus::Skipped));
        assert_eq!(report.status_of("C"), Some(TaskStatus::Passed));
        assert!(report.succeeded());
        assert!(report.into_result().is_ok());
    }

    #[test]
    fn first_failure_stops_the_sequence() {
        let mut ran = Vec::new();
        let report = run_gate(
            scenario(),
            &TagFilter::new(["x", "y"], Vec::<String>::new()),
            GateMode::FailFast,
            &mut ran,
        )
        .expect("gate");
        assert_eq!(ran, vec!["A", "B"]);
        assert_eq!(report.status_of("A"), Some(TaskStatus::Passed));
        assert_eq!(report.status_of("B"), Some(TaskStatus::Failed));
        assert_eq!(report.status_of("C"), Some(TaskStatus::Pending));
        assert!(!report.succeeded());
        assert_eq!(
            report.first_failure().and_then(|t| t.error.as_deref()),
            Some("boom")
        );

        let err = report.into_result().expect_err("gate must fail");
        match crate::error::classify(&err) {
            Some(GateError::TaskFailure { task, message }) => {
                assert_eq!(task, "B");
                assert_eq!(message, "boom");
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn continue_mode_attempts_remaining_tasks() {
        let mut ran = Vec::new();
        let report = run_gate(
            scenario(),
            &TagFilter::default(),
            GateMode::ContinueOnFailure,
            &mut ran,
        )
        .expect("gate");
        assert_eq!(ran, vec!["A", "B", "C"]);
        assert_eq!(report.status_of("C"), Some(TaskStatus::Passed));
        assert!(!report.succeeded());
    }

    #[test]
    fn gate_without_matching_tasks_succeeds() {
        let mut ran = Vec::new();
        let report = run_gate(
            scenario(),
            &TagFilter::new(["nothing"], Vec::<String>::new()),
            GateMode::FailFast,
            &mut ran,
        )
        .expect("gate");
        assert!(ran.is_empty());
        assert_eq!(report.count(TaskStatus::Skipped), 3);
        assert!(report.succeeded());
    }

    #[test]
    fn duplicate_names_and_empty_tags_are_rejected() {
        let mut unit = ();
        let dup = vec![
            GateTask::new("A", ["x"], |_: &mut ()| Ok(())),
            GateTask::new("A", ["y"], |_: &mut ()| Ok(())),
        ];
        let err = run_gate(dup, &TagFilter::default(), GateMode::FailFast, &mut unit)
            .expect_err("duplicate");
        assert!(err.to_string().contains("duplicate gate task name: A"));

        let untagged = vec![GateTask::new("A", Vec::<String>::new(), |_: &mut ()| Ok(()))];
        let err = run_gate(untagged, &TagFilter::default(), GateMode::FailFast, &mut unit)
            .expect_err("empty tags");
        assert!(err.to_string().contains("empty tag set"));
    }

    #[test]
    fn report_json_carries_counts() {
        let mut ran = Vec::new();
        let report = run_gate(
            scenario(),
            &TagFilter::new(["x", "y"], Vec::<String>::new()),
            GateMode::FailFast,
            &mut ran,
        )
        .expect("gate");
        let v = report.to_json();
        assert_eq!(v["ok"], json!(false));
        assert_eq!(v["counts"]["passed"], json!(1));
        assert_eq!(v["counts"]["failed"], json!(1));
        assert_eq!(v["counts"]["pending"], json!(1));
        assert_eq!(v["tasks"][1]["status"], json!("failed"));
    }
}
