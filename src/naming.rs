//! Name schemas for every blob the driver and workers exchange.
//!
//! A schema is a template like `result::{task_name}::{attempt_num:d}` plus
//! optional per-field permitted values. Schemas render names, parse them
//! back, and enumerate the shortest listing prefixes that match any legal
//! completion — the driver only ever discovers completions by prefix
//! listing against a flat blob store, so prefix enumeration has to be
//! deterministic.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use anyhow::{bail, Context, Result};

use crate::common::hash_value;
use crate::result::ResultType;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FieldKind {
    Text,
    Number,
}

#[derive(Debug)]
struct Field {
    name: &'static str,
    kind: FieldKind,
    valid: Option<Vec<&'static str>>,
}

/// One template piece: a literal run followed by an optional field.
#[derive(Debug)]
struct Piece {
    literal: String,
    field: Option<usize>,
}

#[derive(Debug)]
pub struct NameSchema {
    name: &'static str,
    template: &'static str,
    pieces: Vec<Piece>,
    fields: Vec<Field>,
}

pub type ParsedFields = BTreeMap<&'static str, String>;

impl NameSchema {
    /// Panics on a malformed template; all schemas are static literals.
    fn new(
        name: &'static str,
        template: &'static str,
        valid_values: &[(&'static str, &[&'static str])],
    ) -> Self {
        let mut pieces = Vec::new();
        let mut fields: Vec<Field> = Vec::new();

        let mut literal = String::new();
        let mut rest = template;
        while let Some(open) = rest.find('{') {
            literal.push_str(&rest[..open]);
            let close = rest[open..]
                .find('}')
                .map(|i| open + i)
                .unwrap_or_else(|| panic!("unclosed field in template: {template}"));
            let spec = &rest[open + 1..close];
            let (field_name, kind) = match spec.split_once(':') {
                Some((n, "d")) => (n, FieldKind::Number),
                Some(_) => panic!("unsupported format spec in template: {template}"),
                None => (spec, FieldKind::Text),
            };
            let field_name: &'static str = Box::leak(field_name.to_string().into_boxed_str());
            let idx = match fields.iter().position(|f| f.name == field_name) {
                Some(idx) => {
                    assert_eq!(fields[idx].kind, kind, "field {field_name} kind mismatch");
                    idx
                }
                None => {
                    let valid = valid_values
                        .iter()
                        .find(|(n, _)| *n == field_name)
                        .map(|(_, vs)| vs.to_vec());
                    fields.push(Field {
                        name: field_name,
                        kind,
                        valid,
                    });
                    fields.len() - 1
                }
            };
            pieces.push(Piece {
                literal: std::mem::take(&mut literal),
                field: Some(idx),
            });
            rest = &rest[close + 1..];
        }
        if !rest.is_empty() {
            pieces.push(Piece {
                literal: rest.to_string(),
                field: None,
            });
        }

        for (key, _) in valid_values {
            assert!(
                fields.iter().any(|f| f.name == *key),
                "valid_values key {key} not in template {template}"
            );
        }

        NameSchema {
            name,
            template,
            pieces,
            fields,
        }
    }

    pub fn field_names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.fields.iter().map(|f| f.name)
    }

    fn field(&self, name: &str) -> Result<&Field> {
        self.fields
            .iter()
            .find(|f| f.name == name)
            .with_context(|| format!("schema {}: unknown field {}", self.name, name))
    }

    fn check_value(&self, field: &Field, value: &str) -> Result<()> {
        if field.kind == FieldKind::Number
            && (value.is_empty() || !value.bytes().all(|b| b.is_ascii_digit()))
        {
            bail!(
                "schema {}: field {} must be numeric, got '{}'",
                self.name,
                field.name,
                value
            );
        }
        if let Some(valid) = &field.valid {
            if !valid.contains(&value) {
                bail!(
                    "schema {}: invalid value {}='{}', must be one of {}",
                    self.name,
                    field.name,
                    value,
                    valid.join(", ")
                );
            }
        }
        Ok(())
    }

    /// Substitute all fields into the template, validating each value.
    pub fn make_string(&self, values: &[(&str, &str)]) -> Result<String> {
        for field in &self.fields {
            if !values.iter().any(|(k, _)| *k == field.name) {
                bail!("schema {}: missing field {}", self.name, field.name);
            }
        }
        for (key, value) in values {
            let field = self.field(key)?;
            self.check_value(field, value)?;
        }
        let mut out = String::new();
        for piece in &self.pieces {
            out.push_str(&piece.literal);
            if let Some(idx) = piece.field {
                let name = self.fields[idx].name;
                let (_, value) = values.iter().find(|(k, _)| *k == name).unwrap();
                out.push_str(value);
            }
        }
        Ok(out)
    }

    /// Reverse-match a name against the template.
    ///
    /// Fields match non-greedily with backtracking; numeric fields only
    /// match digit runs and enumerated fields only their permitted
    /// values, which is what disambiguates task names containing the
    /// `::` separator.
    pub fn parse(&self, input: &str) -> Result<ParsedFields> {
        let mut bound: Vec<Option<String>> = vec![None; self.fields.len()];
        if !self.match_pieces(&self.pieces, input, &mut bound) {
            bail!(
                "schema {}: '{}' does not match template '{}'",
                self.name,
                input,
                self.template
            );
        }
        let mut out = ParsedFields::new();
        for (field, value) in self.fields.iter().zip(bound) {
            out.insert(field.name, value.unwrap_or_default());
        }
        Ok(out)
    }

    fn match_pieces(&self, pieces: &[Piece], input: &str, bound: &mut Vec<Option<String>>) -> bool {
        let Some((piece, rest_pieces)) = pieces.split_first() else {
            return input.is_empty();
        };
        let Some(input) = input.strip_prefix(piece.literal.as_str()) else {
            return false;
        };
        let Some(idx) = piece.field else {
            return rest_pieces.is_empty() && input.is_empty();
        };
        let field = &self.fields[idx];

        if let Some(existing) = bound[idx].clone() {
            // Repeated field: must repeat its earlier value.
            return match input.strip_prefix(existing.as_str()) {
                Some(rest) => self.match_pieces(rest_pieces, rest, bound),
                None => false,
            };
        }

        let candidates: Vec<&str> = match (&field.valid, field.kind) {
            (Some(valid), _) => valid
                .iter()
                .copied()
                .filter(|v| input.starts_with(v))
                .collect(),
            (None, FieldKind::Number) => {
                let digits = input.bytes().take_while(|b| b.is_ascii_digit()).count();
                (1..=digits).map(|end| &input[..end]).collect()
            }
            (None, FieldKind::Text) => (1..=input.len())
                .filter(|end| input.is_char_boundary(*end))
                .map(|end| &input[..end])
                .collect(),
        };

        for candidate in candidates {
            bound[idx] = Some(candidate.to_string());
            if self.match_pieces(rest_pieces, &input[candidate.len()..], bound) {
                return true;
            }
            bound[idx] = None;
        }
        false
    }

    /// The single prefix matching the given field constraints.
    pub fn prefix(&self, constraints: &[(&str, &[&str])]) -> Result<String> {
        let mut prefixes = self.prefixes(1, constraints)?;
        Ok(prefixes.remove(0))
    }

    /// Enumerate the shortest prefixes that match any legal completion.
    ///
    /// Each constraint restricts a field to a list of candidate values;
    /// unconstrained fields fall back to their permitted set, or end the
    /// prefix if they are unrestricted. Whenever enumerating a field
    /// would push the count past `max_prefixes`, the field collapses to
    /// the longest common prefix of its values and the walk stops there.
    pub fn prefixes(&self, max_prefixes: usize, constraints: &[(&str, &[&str])]) -> Result<Vec<String>> {
        for (key, _) in constraints {
            self.field(key)?;
        }
        let constraints: BTreeMap<&str, Vec<&str>> = constraints
            .iter()
            .map(|(k, vs)| (*k, vs.to_vec()))
            .collect();
        let result = self.expand(&self.pieces, max_prefixes as f64, &constraints);
        if result.len() > max_prefixes {
            bail!(
                "schema {}: {} prefixes exceed cap {}",
                self.name,
                result.len(),
                max_prefixes
            );
        }
        Ok(result)
    }

    fn expand(
        &self,
        pieces: &[Piece],
        budget: f64,
        constraints: &BTreeMap<&str, Vec<&str>>,
    ) -> Vec<String> {
        let Some((piece, rest)) = pieces.split_first() else {
            return vec![String::new()];
        };
        let base = piece.literal.clone();
        let Some(idx) = piece.field else {
            return vec![base];
        };
        let field = &self.fields[idx];
        let values: Vec<&str> = match constraints.get(field.name) {
            Some(values) => values.clone(),
            None => match &field.valid {
                Some(valid) => valid.clone(),
                None => return vec![base],
            },
        };
        if values.len() as f64 > budget {
            return vec![format!("{}{}", base, common_prefix(&values))];
        }
        let mut out = Vec::new();
        for value in &values {
            let mut narrowed = constraints.clone();
            narrowed.insert(field.name, vec![value]);
            for suffix in self.expand(rest, budget / values.len() as f64, &narrowed) {
                out.push(format!("{}{}{}", base, value, suffix));
            }
        }
        out
    }
}

fn common_prefix(values: &[&str]) -> String {
    let Some(first) = values.first() else {
        return String::new();
    };
    let mut end = first.len();
    for value in &values[1..] {
        end = end.min(
            first
                .bytes()
                .zip(value.bytes())
                .take_while(|(a, b)| a == b)
                .count(),
        );
    }
    while end > 0 && !first.is_char_boundary(end) {
        end -= 1;
    }
    first[..end].to_string()
}

pub static JOB: LazyLock<NameSchema> =
    LazyLock::new(|| NameSchema::new("Job", "{cache_key}::{randomness}", &[]));

pub static TASK: LazyLock<NameSchema> =
    LazyLock::new(|| NameSchema::new("Task", "{cache_key}::{task_num:d}", &[]));

pub static TASK_INPUT: LazyLock<NameSchema> =
    LazyLock::new(|| NameSchema::new("TaskInput", "input::{task_name}", &[]));

pub static TASK_RESULT: LazyLock<NameSchema> = LazyLock::new(|| {
    NameSchema::new(
        "TaskResult",
        "result::{task_name}::{attempt_num:d}::{queue_time:d}::{result_type}::{result_time:d}",
        &[("result_type", &["value", "exception"])],
    )
});

pub static JOB_STATUS_PAGE: LazyLock<NameSchema> = LazyLock::new(|| {
    NameSchema::new(
        "JobStatusPage",
        "{status}::{format}::{job_name}.{format}",
        &[
            ("format", &["html", "json"]),
            ("status", &["active", "done"]),
        ],
    )
});

pub static REMOTE_OBJECT: LazyLock<NameSchema> = LazyLock::new(|| {
    NameSchema::new(
        "RemoteObject",
        "object::{cache_key_prefix}::{node_id}::{object_num:d}",
        &[],
    )
});

/// Parsed `result::…` blob name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskResultName {
    pub task_name: String,
    pub attempt_num: u64,
    pub queue_time: u64,
    pub result_type: ResultType,
    pub result_time: u64,
}

impl TaskResultName {
    pub fn parse(name: &str) -> Result<Self> {
        let fields = TASK_RESULT.parse(name)?;
        Ok(TaskResultName {
            task_name: fields["task_name"].clone(),
            attempt_num: fields["attempt_num"].parse()?,
            queue_time: fields["queue_time"].parse()?,
            result_type: fields["result_type"].parse()?,
            result_time: fields["result_time"].parse()?,
        })
    }

    /// Worker-observed elapsed seconds from submission to completion.
    pub fn elapsed_seconds(&self) -> f64 {
        self.result_time.saturating_sub(self.queue_time) as f64
    }
}

/// Parsed `{status}::{format}::{job_name}.{format}` blob name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusPageName {
    pub status: String,
    pub format: String,
    pub job_name: String,
}

impl StatusPageName {
    pub fn parse(name: &str) -> Result<Self> {
        let fields = JOB_STATUS_PAGE.parse(name)?;
        Ok(StatusPageName {
            status: fields["status"].clone(),
            format: fields["format"].clone(),
            job_name: fields["job_name"].clone(),
        })
    }

    pub fn make_string(&self) -> Result<String> {
        JOB_STATUS_PAGE.make_string(&[
            ("status", &self.status),
            ("format", &self.format),
            ("job_name", &self.job_name),
        ])
    }

    pub fn cache_key(&self) -> Result<String> {
        let fields = JOB.parse(&self.job_name)?;
        Ok(fields["cache_key"].clone())
    }
}

/// Driver-local identifier: host, user, timestamp, and a random suffix.
pub fn make_cache_key_prefix() -> String {
    let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string());
    let host: String = host.chars().take(8).collect();
    let user = std::env::var("USER").unwrap_or_else(|_| "user".to_string());
    let timestamp = chrono::Local::now().format("%Y-%m-%d-%H:%M:%S");
    format!(
        "{}-{}-{}-{}",
        host,
        user,
        timestamp,
        hash_value(rand::random::<u64>().to_le_bytes(), 8)
    )
}

pub fn make_job_name(cache_key: &str) -> Result<String> {
    JOB.make_string(&[
        ("cache_key", cache_key),
        ("randomness", &hash_value(rand::random::<u64>().to_le_bytes(), 8)),
    ])
}

pub fn make_task_name(cache_key: &str, task_num: usize) -> Result<String> {
    TASK.make_string(&[("cache_key", cache_key), ("task_num", &task_num.to_string())])
}

pub fn task_input_name(task_name: &str) -> Result<String> {
    TASK_INPUT.make_string(&[("task_name", task_name)])
}

pub fn task_input_prefix(cache_key: &str) -> String {
    format!("input::{}", cache_key)
}

/// Listing prefix for result blobs, narrowed to the given running task
/// names when there are any (their common prefix never lists less than
/// the plain cache-key prefix).
pub fn task_result_prefix<'a>(
    cache_key: &str,
    task_names: impl IntoIterator<Item = &'a str>,
) -> String {
    let prefix = format!("result::{}", cache_key);
    let names: Vec<String> = task_names
        .into_iter()
        .map(|t| format!("result::{}::", t))
        .collect();
    if names.is_empty() {
        return prefix;
    }
    let refs: Vec<&str> = names.iter().map(|s| s.as_str()).collect();
    let better = common_prefix(&refs);
    if better.starts_with(&prefix) {
        better
    } else {
        prefix
    }
}

/// Result-blob template for one attempt. The driver fills the first
/// three fields; `{result_type}` and `{result_time}` are left for the
/// worker.
pub fn task_result_template(task_name: &str, attempt_num: usize, queue_time: u64) -> String {
    format!(
        "result::{}::{}::{}::{{result_type}}::{{result_time}}",
        task_name, attempt_num, queue_time
    )
}

pub fn status_page_name(job_name: &str, format: &str, status: &str) -> Result<String> {
    JOB_STATUS_PAGE.make_string(&[
        ("job_name", job_name),
        ("format", format),
        ("status", status),
    ])
}

pub fn status_prefixes(
    job_names: Option<&[String]>,
    formats: Option<&[&str]>,
    statuses: Option<&[&str]>,
) -> Result<Vec<String>> {
    let job_name_refs: Vec<&str>;
    let mut constraints: Vec<(&str, &[&str])> = Vec::new();
    if let Some(job_names) = job_names {
        job_name_refs = job_names.iter().map(|s| s.as_str()).collect();
        constraints.push(("job_name", &job_name_refs));
    }
    if let Some(formats) = formats {
        constraints.push(("format", formats));
    }
    if let Some(statuses) = statuses {
        constraints.push(("status", statuses));
    }
    JOB_STATUS_PAGE.prefixes(4, &constraints)
}

pub fn make_remote_object_name(
    cache_key_prefix: &str,
    node_id: &str,
    object_num: u64,
) -> Result<String> {
    REMOTE_OBJECT.make_string(&[
        ("cache_key_prefix", cache_key_prefix),
        ("node_id", node_id),
        ("object_num", &object_num.to_string()),
    ])
}

/// Identifier for this driver process, unique across drivers that share
/// a cache-key prefix.
pub fn node_id() -> String {
    let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string());
    format!("node-{}", hash_value(format!("{}-{}", host, std::process::id()), 8))
}

/// Make a name safe for container and pod identifiers.
pub fn sanitize(name: &str) -> String {
    name.to_lowercase()
        .replace(['.', ':', '_'], "-")
}
