// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Typed event payloads.
//!
//! Event sources describe what happened with an [`EventPayload`]; the
//! recorder turns it into the open payload map stored on a
//! [`CanonicalEntry`](crate::entry::CanonicalEntry), together with the
//! classifier tags, family components and listing visibility that belong to
//! its entry type. Storage never looks inside the map.

use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::entry::{EntryType, NewEntry};

/// Requests slower than this are tagged `slow`.
pub const SLOW_REQUEST_MS: f64 = 1000.0;
/// Queries (and view renders) slower than this are tagged `slow`.
pub const SLOW_QUERY_MS: f64 = 100.0;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestEvent {
    pub method: String,
    pub path: String,
    pub status: u16,
    pub duration_ms: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub controller: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub headers: Option<Map<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryEvent {
    pub sql: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub duration_ms: f64,
    #[serde(default)]
    pub cached: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub row_count: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExceptionEvent {
    pub class: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line: Option<u32>,
    #[serde(default)]
    pub backtrace: Vec<String>,
    /// What was running when it was raised ("request", "job", "command").
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

/// Shared by `job_enqueue` and `job_perform`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobEvent {
    pub job_id: String,
    pub job_class: String,
    pub queue_name: String,
    #[serde(default)]
    pub arguments: Vec<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub executions: Option<u32>,
    /// Set when the job raised.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exception: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandEvent {
    pub command: String,
    #[serde(default)]
    pub arguments: Vec<String>,
    pub duration_ms: f64,
    pub exit_code: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exception: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelEvent {
    pub model_class: String,
    /// "created", "updated" or "deleted".
    pub action: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_id: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub changes: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ViewEvent {
    pub name: String,
    pub path: String,
    pub duration_ms: f64,
    #[serde(default)]
    pub partial: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub layout: Option<String>,
}

/// One observed event, discriminated by entry type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "entry_type", rename_all = "snake_case")]
pub enum EventPayload {
    Request(RequestEvent),
    Query(QueryEvent),
    Exception(ExceptionEvent),
    JobEnqueue(JobEvent),
    JobPerform(JobEvent),
    Command(CommandEvent),
    Model(ModelEvent),
    View(ViewEvent),
}

impl EventPayload {
    pub fn entry_type(&self) -> EntryType {
        match self {
            Self::Request(_) => EntryType::Request,
            Self::Query(_) => EntryType::Query,
            Self::Exception(_) => EntryType::Exception,
            Self::JobEnqueue(_) => EntryType::JobEnqueue,
            Self::JobPerform(_) => EntryType::JobPerform,
            Self::Command(_) => EntryType::Command,
            Self::Model(_) => EntryType::Model,
            Self::View(_) => EntryType::View,
        }
    }

    /// Classifier tags derived from the event itself.
    pub fn tags(&self) -> Vec<String> {
        let mut tags: Vec<String> = Vec::new();
        match self {
            Self::Request(req) => {
                tags.push("request".into());
                if !req.method.is_empty() {
                    tags.push(req.method.to_lowercase());
                }
                if req.status >= 400 {
                    tags.push("error".into());
                }
                if req.duration_ms > SLOW_REQUEST_MS {
                    tags.push("slow".into());
                }
            }
            Self::Query(query) => {
                tags.push("query".into());
                if let Some(kind) = statement_kind(&query.sql) {
                    tags.push(kind.into());
                }
                if query.cached {
                    tags.push("cached".into());
                }
                if query.duration_ms > SLOW_QUERY_MS {
                    tags.push("slow".into());
                }
            }
            Self::Exception(exc) => {
                tags.push("exception".into());
                if let Some(ref source) = exc.source {
                    tags.push(source.clone());
                }
                tags.push(snake_case(&exc.class));
            }
            Self::JobEnqueue(job) | Self::JobPerform(job) => {
                let phase = if matches!(self, Self::JobEnqueue(_)) { "enqueue" } else { "perform" };
                tags.extend(["job".to_string(), phase.to_string(), job.queue_name.clone()]);
                if job.exception.is_some() {
                    tags.push("failed".into());
                }
                tags.push(snake_case(&job.job_class));
            }
            Self::Command(cmd) => {
                tags.push("command".into());
                if cmd.exit_code != 0 {
                    tags.push("failed".into());
                }
                if let Some((namespace, _)) = cmd.command.split_once(':') {
                    tags.push(namespace.to_string());
                }
            }
            Self::Model(model) => {
                tags.extend(["model".to_string(), model.action.clone(), snake_case(&model.model_class)]);
            }
            Self::View(view) => {
                tags.push("view".into());
                tags.push(if view.partial { "partial" } else { "template" }.into());
                if view.duration_ms > SLOW_QUERY_MS {
                    tags.push("slow".into());
                }
            }
        }
        tags.retain(|t| !t.is_empty());
        tags
    }

    /// Ordered family components, led by the entry type name.
    ///
    /// Requests have no family.
    pub fn family_components(&self) -> Vec<String> {
        let ty = self.entry_type().as_str().to_string();
        match self {
            Self::Request(_) => Vec::new(),
            Self::Query(query) => vec![ty, normalize_sql(&query.sql)],
            Self::Exception(exc) => vec![
                ty,
                exc.class.clone(),
                exc.file.clone().unwrap_or_default(),
                exc.line.map(|l| l.to_string()).unwrap_or_default(),
            ],
            Self::JobEnqueue(job) | Self::JobPerform(job) => vec![ty, job.job_class.clone()],
            Self::Command(cmd) => vec![ty, cmd.command.clone()],
            Self::Model(model) => vec![ty, model.model_class.clone(), model.action.clone()],
            Self::View(view) => vec![ty, view.name.clone()],
        }
    }

    /// Partial view renders exist only for drill-down from their batch.
    pub fn visible_in_listing(&self) -> bool {
        !matches!(self, Self::View(view) if view.partial)
    }

    /// The open payload map stored on the entry.
    pub fn to_map(&self) -> Map<String, Value> {
        let value = match self {
            Self::Request(e) => serde_json::to_value(e),
            Self::Query(e) => serde_json::to_value(e),
            Self::Exception(e) => serde_json::to_value(e),
            Self::JobEnqueue(e) | Self::JobPerform(e) => serde_json::to_value(e),
            Self::Command(e) => serde_json::to_value(e),
            Self::Model(e) => serde_json::to_value(e),
            Self::View(e) => serde_json::to_value(e),
        };
        match value {
            Ok(Value::Object(map)) => map,
            _ => Map::new(),
        }
    }

    /// Entry attributes for this event, occurring now. Family hash, batch id
    /// and context fields are filled in by the recorder.
    pub fn into_entry(self) -> NewEntry {
        NewEntry::new(self.entry_type())
            .with_payload(Value::Object(self.to_map()))
            .with_tags(self.tags())
            .with_visibility(self.visible_in_listing())
    }
}

/// `select` / `insert` / `update` / `delete` from the leading keyword.
pub fn statement_kind(sql: &str) -> Option<&'static str> {
    let keyword = sql.trim_start().split_whitespace().next()?.to_ascii_lowercase();
    match keyword.as_str() {
        "select" => Some("select"),
        "insert" => Some("insert"),
        "update" => Some("update"),
        "delete" => Some("delete"),
        _ => None,
    }
}

/// Collapse literals and whitespace so recurrences of a statement share a
/// family regardless of bound values.
pub fn normalize_sql(sql: &str) -> String {
    static STRINGS: OnceLock<Option<Regex>> = OnceLock::new();
    static NUMBERS: OnceLock<Option<Regex>> = OnceLock::new();
    static IN_LISTS: OnceLock<Option<Regex>> = OnceLock::new();
    static SPACES: OnceLock<Option<Regex>> = OnceLock::new();

    let mut out = sql.trim().to_string();
    let passes: [(&OnceLock<Option<Regex>>, &str, &str); 4] = [
        (&STRINGS, r"'(?:[^']|'')*'", "?"),
        (&NUMBERS, r"\b\d+(?:\.\d+)?\b", "?"),
        (&IN_LISTS, r"(?i)\bIN\s*\(\s*\?(?:\s*,\s*\?)*\s*\)", "IN (?)"),
        (&SPACES, r"\s+", " "),
    ];
    for (cell, pattern, replacement) in passes {
        if let Some(re) = cell.get_or_init(|| Regex::new(pattern).ok()) {
            out = re.replace_all(&out, replacement).into_owned();
        }
    }
    out
}

/// `Admin::UserError` -> `admin_user_error`.
fn snake_case(name: &str) -> String {
    let mut out = String::with_capacity(name.len() + 4);
    let mut prev: Option<char> = None;
    for c in name.chars() {
        if c == ':' || c == '/' {
            if prev != Some('_') && prev.is_some() {
                out.push('_');
            }
            prev = Some('_');
            continue;
        }
        if c.is_ascii_uppercase() {
            if matches!(prev, Some(p) if p.is_ascii_lowercase() || p.is_ascii_digit()) {
                out.push('_');
            }
            out.push(c.to_ascii_lowercase());
        } else {
            out.push(c);
        }
        prev = Some(c);
    }
    out
}
