//! # Error-signature extraction
//!
//! Normalizes error messages into equivalence classes by substituting
//! volatile substrings (UUIDs, timestamps, IPs, paths, remaining digit runs)
//! with placeholders, then groups and ranks by frequency. Order is
//! load-bearing — see [`normalize`] (spec.md §4.7, §9).

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::OnceLock;

fn uuid_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?i)[0-9a-f]{8}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{12}",
        )
        .expect("static uuid regex")
    })
}

fn timestamp_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\d{4}-\d{2}-\d{2}T\d{2}:\d{2}:\d{2}(\.\d+)?(Z|[+-]\d{2}:\d{2})?")
            .expect("static timestamp regex")
    })
}

fn ip_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\b\d{1,3}\.\d{1,3}\.\d{1,3}\.\d{1,3}\b").expect("static ip regex"))
}

fn path_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"/[\w./-]*\w").expect("static path regex"))
}

fn num_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\d+").expect("static num regex"))
}

/// Apply the fixed substitution pipeline, in order: UUID, timestamp, IP,
/// path, remaining digit runs. The order prevents digits inside a UUID/IP/
/// timestamp/path from being prematurely consumed by the NUM pass.
pub fn normalize(message: &str) -> String {
    let s = uuid_re().replace_all(message, "<UUID>");
    let s = timestamp_re().replace_all(&s, "<TS>");
    let s = ip_re().replace_all(&s, "<IP>");
    let s = path_re().replace_all(&s, "<PATH>");
    let s = num_re().replace_all(&s, "<NUM>");
    s.into_owned()
}

#[derive(Debug, Clone)]
pub struct ErrorLog {
    pub timestamp_ms: i64,
    pub operation: String,
    pub tool_name: Option<String>,
    pub error_type: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorSignature {
    pub pattern: String,
    pub count: u64,
    pub first_seen_ms: i64,
    pub last_seen_ms: i64,
    pub affected_operations: Vec<String>,
    pub affected_tools: Vec<String>,
}

/// Group `logs` by normalized pattern, sort by count descending then pattern
/// ascending (a deterministic tie-break), truncate to `top_n`.
pub fn extract_top_signatures(logs: &[ErrorLog], top_n: usize) -> Vec<ErrorSignature> {
    let mut groups: BTreeMap<String, ErrorSignature> = BTreeMap::new();

    for log in logs {
        if log.error_type.is_empty() {
            continue;
        }
        let pattern = normalize(&log.error_type);
        let entry = groups.entry(pattern.clone()).or_insert_with(|| ErrorSignature {
            pattern: pattern.clone(),
            count: 0,
            first_seen_ms: log.timestamp_ms,
            last_seen_ms: log.timestamp_ms,
            affected_operations: Vec::new(),
            affected_tools: Vec::new(),
        });
        entry.count += 1;
        entry.first_seen_ms = entry.first_seen_ms.min(log.timestamp_ms);
        entry.last_seen_ms = entry.last_seen_ms.max(log.timestamp_ms);
        if !entry.affected_operations.contains(&log.operation) {
            entry.affected_operations.push(log.operation.clone());
        }
        if let Some(tool) = &log.tool_name {
            if !entry.affected_tools.contains(tool) {
                entry.affected_tools.push(tool.clone());
            }
        }
    }

    let mut signatures: Vec<ErrorSignature> = groups.into_values().collect();
    for sig in &mut signatures {
        sig.affected_operations.sort();
        sig.affected_tools.sort();
    }
    signatures.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.pattern.cmp(&b.pattern)));
    signatures.truncate(top_n);
    signatures
}
