use chrono::{DateTime, Local, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::str::FromStr;

use crate::error::{ExperimentError, Result};

pub const METADATA_FILE: &str = "metadata.json";
pub const ARGS_FILE: &str = "args.json";
pub const DEFAULT_ARGS_FILE: &str = "default_args.json";
pub const STATUS_FILE: &str = "STATUS";
pub const SUMMARY_FILE: &str = "summary.json";
pub const LOG_FILE: &str = "log.json";
pub const STDOUT_FILE: &str = "stdout";
pub const STDERR_FILE: &str = "stderr";

/// Identity of an experiment, taken from its directory name.
///
/// Canonical non-negative integers (`"7"`, not `"007"`) are auto-assigned ids;
/// anything else is a caller-supplied name. Numbered ids order numerically and
/// before named ones.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ExperimentId {
    Numbered(u64),
    Named(String),
}

impl ExperimentId {
    pub fn from_name(name: &str) -> Self {
        match name.parse::<u64>() {
            Ok(n) if n.to_string() == name => Self::Numbered(n),
            _ => Self::Named(name.to_string()),
        }
    }

    pub fn from_dir(path: &Path) -> Result<Self> {
        path.file_name()
            .and_then(|s| s.to_str())
            .map(Self::from_name)
            .ok_or_else(|| {
                ExperimentError::io(
                    path,
                    std::io::Error::new(
                        std::io::ErrorKind::InvalidInput,
                        "experiment directory name is not valid utf-8",
                    ),
                )
            })
    }

    pub fn number(&self) -> Option<u64> {
        match self {
            Self::Numbered(n) => Some(*n),
            Self::Named(_) => None,
        }
    }
}

impl fmt::Display for ExperimentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Numbered(n) => write!(f, "{}", n),
            Self::Named(s) => f.write_str(s),
        }
    }
}

impl From<&str> for ExperimentId {
    fn from(value: &str) -> Self {
        Self::from_name(value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    Running,
    Success,
    Error,
    Unknown,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Running => "RUNNING",
            Status::Success => "SUCCESS",
            Status::Error => "ERROR",
            Status::Unknown => "UNKNOWN",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Status::Success | Status::Error)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Status {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(match s.trim() {
            "RUNNING" => Status::Running,
            "SUCCESS" => Status::Success,
            "ERROR" => Status::Error,
            _ => Status::Unknown,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusMarker {
    pub status: Status,
    pub message: String,
}

impl StatusMarker {
    pub fn new(status: Status, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn running() -> Self {
        Self::new(Status::Running, "")
    }

    pub fn parse(text: &str) -> Self {
        let mut lines = text.splitn(2, '\n');
        let status = lines
            .next()
            .map(|l| l.parse().unwrap_or(Status::Unknown))
            .unwrap_or(Status::Unknown);
        let message = lines.next().unwrap_or("").trim().to_string();
        Self { status, message }
    }

    pub fn render(&self) -> String {
        if self.message.is_empty() {
            self.status.to_string()
        } else {
            format!("{}\n{}\n", self.status, self.message.trim_end())
        }
    }
}

/// `metadata.json`. Keys that this crate does not know about are carried
/// through rewrites untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Metadata {
    #[serde(rename = "githead-sha", default)]
    pub githead_sha: String,
    #[serde(rename = "githead-message", default)]
    pub githead_message: String,
    #[serde(default)]
    pub description: String,
    #[serde(
        rename = "start-time",
        default,
        deserialize_with = "lenient_time",
        skip_serializing_if = "Option::is_none"
    )]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(
        rename = "end-time",
        default,
        deserialize_with = "lenient_time",
        skip_serializing_if = "Option::is_none"
    )]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub command: Vec<String>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl Metadata {
    pub fn short_sha(&self) -> &str {
        let end = self
            .githead_sha
            .char_indices()
            .nth(7)
            .map(|(i, _)| i)
            .unwrap_or(self.githead_sha.len());
        &self.githead_sha[..end]
    }

    pub fn headline(&self) -> &str {
        self.githead_message.lines().next().unwrap_or("").trim()
    }
}

/// Parses an ISO-8601 time. Times without an offset are taken as local time.
pub fn parse_time(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
        .and_then(|naive| Local.from_local_datetime(&naive).earliest())
        .map(|local| local.with_timezone(&Utc))
}

fn lenient_time<'de, D>(deserializer: D) -> std::result::Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<String>::deserialize(deserializer)? {
        None => Ok(None),
        Some(raw) => parse_time(&raw)
            .map(Some)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid timestamp {:?}", raw))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn ids_distinguish_canonical_numbers_from_names() {
        assert_eq!(ExperimentId::from_name("12"), ExperimentId::Numbered(12));
        assert_eq!(
            ExperimentId::from_name("007"),
            ExperimentId::Named("007".to_string())
        );
        assert_eq!(
            ExperimentId::from_name("baseline"),
            ExperimentId::Named("baseline".to_string())
        );
        let mut ids = vec![
            ExperimentId::from_name("b"),
            ExperimentId::from_name("10"),
            ExperimentId::from_name("9"),
        ];
        ids.sort();
        let rendered: Vec<String> = ids.iter().map(|i| i.to_string()).collect();
        assert_eq!(rendered, vec!["9", "10", "b"]);
    }

    #[test]
    fn status_marker_round_trips_messages() {
        let marker = StatusMarker::new(Status::Error, "exit(3)");
        assert_eq!(marker.render(), "ERROR\nexit(3)\n");
        assert_eq!(StatusMarker::parse(&marker.render()), marker);
        assert_eq!(StatusMarker::parse("SUCCESS"), StatusMarker::new(Status::Success, ""));
        assert_eq!(StatusMarker::parse("garbage").status, Status::Unknown);
    }

    #[test]
    fn status_marker_keeps_multi_line_details() {
        let parsed = StatusMarker::parse("ERROR\npanicked at main.rs:1:1: boom\n  0: frame\n");
        assert_eq!(parsed.status, Status::Error);
        assert_eq!(parsed.message, "panicked at main.rs:1:1: boom\n  0: frame");
    }

    #[test]
    fn metadata_uses_hyphenated_keys_and_keeps_extras() {
        let raw = json!({
            "githead-sha": "0123456789abcdef",
            "githead-message": "Tune lr\n\nlonger body",
            "description": "sweep",
            "command": ["train", "--lr", "0.1"],
            "host": "gpu-3"
        });
        let meta: Metadata = serde_json::from_value(raw).expect("metadata");
        assert_eq!(meta.short_sha(), "0123456");
        assert_eq!(meta.headline(), "Tune lr");
        assert!(meta.start_time.is_none());
        assert_eq!(meta.extra.get("host"), Some(&json!("gpu-3")));

        let back = serde_json::to_value(&meta).expect("serialize");
        assert_eq!(back["host"], json!("gpu-3"));
        assert!(back.get("end-time").is_none());
    }

    #[test]
    fn metadata_accepts_times_without_offset() {
        let raw = json!({
            "githead-sha": "abc",
            "start-time": "2020-05-01T12:34:56.789012",
            "end-time": "2020-05-01T13:00:00+02:00"
        });
        let meta: Metadata = serde_json::from_value(raw).expect("metadata");
        let start = meta.start_time.expect("start time");
        assert_eq!(
            start.with_timezone(&Local).naive_local(),
            NaiveDateTime::parse_from_str("2020-05-01 12:34:56.789012", "%Y-%m-%d %H:%M:%S%.f")
                .expect("naive")
        );
        assert_eq!(
            meta.end_time.expect("end time").to_rfc3339(),
            "2020-05-01T11:00:00+00:00"
        );
        assert!(parse_time("2020-05-01 12:34:56").is_some());
        assert!(parse_time("yesterday").is_none());

        let bad = json!({"start-time": "yesterday"});
        assert!(serde_json::from_value::<Metadata>(bad).is_err());
    }
}
