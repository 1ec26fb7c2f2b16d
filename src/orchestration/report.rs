//! Typed outputs of the planner and report-parser collaborators.
//!
//! Both collaborators read free text produced by an agent. When that text
//! does not contain the expected JSON, they fall back to a deterministic
//! minimal value instead of failing the session.

use crate::core::{Priority, Task};
use crate::orchestration::executor::WorkerExecutor;
use crate::util::truncate_chars;
use crate::{clog_debug, clog_warn};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const SUMMARY_LIMIT: usize = 200;

/// Find the last top-level balanced `{...}` in `text` that parses as a JSON
/// object.
///
/// Agents often wrap JSON in prose or code fences, and are asked to end with
/// their report, so earlier snippets quoted in the prose lose to it.
pub fn extract_json_object(text: &str) -> Option<serde_json::Map<String, serde_json::Value>> {
    let mut found = None;
    let mut pos = 0;
    while let Some(offset) = text[pos..].find('{') {
        let start = pos + offset;
        pos = start + 1;
        let Some(end) = balanced_end(&text[start..]) else {
            continue;
        };
        if let Ok(serde_json::Value::Object(map)) =
            serde_json::from_str::<serde_json::Value>(&text[start..start + end])
        {
            found = Some(map);
            pos = start + end;
        }
    }
    found
}

/// Byte length of the balanced object starting at `text[0] == '{'`.
fn balanced_end(text: &str) -> Option<usize> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (i, c) in text.char_indices() {
        if in_string {
            match c {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth = depth.checked_sub(1)?;
                if depth == 0 {
                    return Some(i + 1);
                }
            }
            _ => {}
        }
    }
    None
}

fn first_line(text: &str) -> String {
    let line = text
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .unwrap_or("");
    truncate_chars(line, SUMMARY_LIMIT)
}

/// Structured account of what a worker did.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerReport {
    pub summary: String,
    pub files_created: Vec<String>,
    pub files_modified: Vec<String>,
    pub components_created: Vec<String>,
    /// Interfaces or artifacts other workers can now rely on.
    pub provides_to_others: Vec<String>,
    /// Interfaces this worker still needs from someone else.
    pub dependencies_needed: Vec<String>,
    pub next_steps: Vec<String>,
    pub blockers: Vec<String>,
    pub success: bool,
}

impl WorkerReport {
    /// Minimal report built from raw text alone.
    pub fn fallback(raw: &str, success: bool) -> Self {
        Self {
            summary: first_line(raw),
            success,
            ..Self::default()
        }
    }

    /// Parse the last JSON object in `raw`; fall back when there is none.
    /// A report that omits `success` inherits the executor's verdict.
    pub fn parse_or_fallback(raw: &str, success: bool) -> Self {
        let Some(mut object) = extract_json_object(raw) else {
            return Self::fallback(raw, success);
        };
        object
            .entry("success")
            .or_insert(serde_json::Value::Bool(success));
        match serde_json::from_value::<WorkerReport>(serde_json::Value::Object(object)) {
            Ok(mut report) => {
                if report.summary.trim().is_empty() {
                    report.summary = first_line(raw);
                }
                report
            }
            Err(e) => {
                clog_warn!("Report did not match the expected shape ({}), using fallback", e);
                Self::fallback(raw, success)
            }
        }
    }

    /// All files the worker wrote.
    pub fn files_touched(&self) -> impl Iterator<Item = &String> {
        self.files_created.iter().chain(&self.files_modified)
    }
}

/// One task proposed by the planner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlannedTask {
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default = "default_phase")]
    pub phase: u32,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub assigned_to: Option<String>,
}

fn default_phase() -> u32 {
    1
}

/// Decomposition of a goal into tasks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    #[serde(default)]
    pub summary: String,
    pub tasks: Vec<PlannedTask>,
    #[serde(default)]
    pub execution_order: Vec<String>,
}

impl Plan {
    /// One high-priority phase-1 task carrying the whole goal.
    pub fn fallback(goal: &str) -> Self {
        let title = first_line(goal);
        let title = if title.is_empty() {
            "Complete the goal".to_string()
        } else {
            truncate_chars(&title, 80)
        };
        Self {
            summary: first_line(goal),
            tasks: vec![PlannedTask {
                title: title.clone(),
                description: goal.trim().to_string(),
                priority: Priority::High,
                phase: 1,
                dependencies: Vec::new(),
                assigned_to: None,
            }],
            execution_order: vec![title],
        }
    }

    /// Parse the last JSON object in `raw` as a plan with at least one task.
    pub fn parse_or_fallback(raw: &str, goal: &str) -> Self {
        let parsed = extract_json_object(raw)
            .and_then(|object| serde_json::from_value::<Plan>(serde_json::Value::Object(object)).ok())
            .filter(|plan| !plan.tasks.is_empty() && plan.tasks.iter().all(|t| !t.title.trim().is_empty()));
        match parsed {
            Some(mut plan) => {
                if plan.execution_order.is_empty() {
                    plan.execution_order = plan.tasks.iter().map(|t| t.title.clone()).collect();
                }
                plan
            }
            None => {
                clog_warn!("Planner output had no usable plan, falling back to a single task");
                Self::fallback(goal)
            }
        }
    }
}

/// Turns a goal into a plan.
pub trait Planner: Send + Sync {
    fn plan(&self, goal: &str, context: Option<&str>) -> impl Future<Output = Plan> + Send;
}

/// Turns raw worker output into a report.
pub trait ReportParser: Send + Sync {
    fn parse(&self, raw: &str, task: &Task, success: bool) -> WorkerReport;
}

/// Reads the JSON block a worker was asked to end its output with.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonReportParser;

impl ReportParser for JsonReportParser {
    fn parse(&self, raw: &str, task: &Task, success: bool) -> WorkerReport {
        let report = WorkerReport::parse_or_fallback(raw, success);
        clog_debug!(
            "Report for {}: success={} provides={:?} needs={:?}",
            task.id,
            report.success,
            report.provides_to_others,
            report.dependencies_needed
        );
        report
    }
}

/// Plans by asking the agent executor.
#[derive(Debug, Clone)]
pub struct ExecutorPlanner<E> {
    executor: E,
    timeout: Duration,
}

impl<E: WorkerExecutor> ExecutorPlanner<E> {
    pub fn new(executor: E, timeout: Duration) -> Self {
        Self { executor, timeout }
    }

    pub fn prompt(goal: &str, context: Option<&str>) -> String {
        let mut prompt = format!(
            "Break the following goal into tasks for parallel workers.\n\nGOAL:\n{}\n",
            goal.trim()
        );
        if let Some(context) = context.filter(|c| !c.trim().is_empty()) {
            prompt.push_str(&format!("\nCONTEXT:\n{}\n", context.trim()));
        }
        prompt.push_str(
            "\nReply with one JSON object: {\"summary\": string, \"tasks\": [{\"title\", \
             \"description\", \"priority\" (critical|high|medium|low), \"phase\" (0-3), \
             \"dependencies\" (titles)}], \"execution_order\": [titles]}.",
        );
        prompt
    }
}

impl<E: WorkerExecutor> Planner for ExecutorPlanner<E> {
    async fn plan(&self, goal: &str, context: Option<&str>) -> Plan {
        let prompt = Self::prompt(goal, context);
        match self
            .executor
            .execute(&prompt, self.timeout, CancellationToken::new())
            .await
        {
            Ok(raw) => Plan::parse_or_fallback(&raw, goal),
            Err(e) => {
                clog_warn!("Planner executor failed ({}), using fallback plan", e);
                Plan::fallback(goal)
            }
        }
    }
}
