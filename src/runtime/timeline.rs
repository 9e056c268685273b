//! Run timeline: in-memory control events plus an optional NDJSON mirror.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write as _};
use std::path::{Path, PathBuf};
use std::time::Instant;

use crate::{SurfResult, wall_time_iso_utc};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogMode {
    /// Control events only.
    #[default]
    Minimal,
    /// Control events plus every step report.
    Full,
}

impl clap::ValueEnum for LogMode {
    fn value_variants<'a>() -> &'a [Self] {
        &[Self::Minimal, Self::Full]
    }

    fn to_possible_value(&self) -> Option<clap::builder::PossibleValue> {
        Some(match self {
            Self::Minimal => clap::builder::PossibleValue::new("minimal"),
            Self::Full => clap::builder::PossibleValue::new("full"),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimelineEntry {
    pub index: usize,
    /// Milliseconds since the run started.
    pub time_ms: u64,
    pub name: String,
    #[serde(default)]
    pub fields: Map<String, Value>,
}

/// Appends one JSON document per line, flushed per event so a crashed run keeps its log.
#[derive(Debug)]
pub struct NdjsonSink {
    path: PathBuf,
    writer: BufWriter<File>,
}

impl NdjsonSink {
    pub fn open(path: &Path) -> SurfResult<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            writer: BufWriter::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append<T: Serialize>(&mut self, record: &T) -> SurfResult<()> {
        serde_json::to_writer(&mut self.writer, record)?;
        self.writer.write_all(b"\n")?;
        self.writer.flush()?;
        Ok(())
    }
}

#[derive(Debug)]
pub struct Timeline {
    started: Instant,
    mode: LogMode,
    entries: Vec<TimelineEntry>,
    sink: Option<NdjsonSink>,
}

impl Timeline {
    pub fn new(log_path: Option<&Path>, mode: LogMode) -> SurfResult<Self> {
        let sink = log_path.map(NdjsonSink::open).transpose()?;
        Ok(Self {
            started: Instant::now(),
            mode,
            entries: Vec::new(),
            sink,
        })
    }

    pub fn emit(&mut self, name: &str, fields: Map<String, Value>) -> SurfResult<()> {
        let entry = TimelineEntry {
            index: self.entries.len(),
            time_ms: self.elapsed_ms(),
            name: name.to_string(),
            fields,
        };
        tracing::debug!(event = %entry.name, time_ms = entry.time_ms, "timeline");
        if let Some(sink) = self.sink.as_mut() {
            sink.append(&ndjson_line(&entry))?;
        }
        self.entries.push(entry);
        Ok(())
    }

    /// Step reports go to the NDJSON mirror in full mode only; they never enter the timeline.
    pub fn emit_report(&mut self, index: usize, id: &str, report: &Value) -> SurfResult<()> {
        self.append_report(json!({"index": index, "id": id, "report": report}))
    }

    /// Report of one repeat-until attempt, tagged with its 1-based attempt number.
    pub fn emit_attempt_report(&mut self, index: usize, id: &str, attempt: u64, report: &Value) -> SurfResult<()> {
        self.append_report(json!({"index": index, "id": id, "attempt": attempt, "report": report}))
    }

    fn append_report(&mut self, body: Value) -> SurfResult<()> {
        if self.mode != LogMode::Full {
            return Ok(());
        }
        let time_ms = self.elapsed_ms();
        if let Some(sink) = self.sink.as_mut() {
            let mut line = Map::new();
            line.insert("ts".to_string(), json!(wall_time_iso_utc()));
            line.insert("timeMs".to_string(), json!(time_ms));
            line.insert("event".to_string(), json!("step.report"));
            if let Value::Object(body) = body {
                line.extend(body);
            }
            sink.append(&line)?;
        }
        Ok(())
    }

    pub fn entries(&self) -> &[TimelineEntry] {
        &self.entries
    }

    pub fn into_entries(self) -> Vec<TimelineEntry> {
        self.entries
    }

    fn elapsed_ms(&self) -> u64 {
        self.started.elapsed().as_millis().min(u128::from(u64::MAX)) as u64
    }
}

fn ndjson_line(entry: &TimelineEntry) -> Value {
    let mut line = Map::new();
    line.insert("ts".to_string(), json!(wall_time_iso_utc()));
    line.insert("timeMs".to_string(), json!(entry.time_ms));
    line.insert("event".to_string(), json!(entry.name));
    for (k, v) in &entry.fields {
        line.entry(k.clone()).or_insert_with(|| v.clone());
    }
    Value::Object(line)
}

/// Shorthand for building event fields.
pub fn fields(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn read_lines(path: &Path) -> Vec<Value> {
        std::fs::read_to_string(path)
            .expect("read log")
            .lines()
            .map(|l| serde_json::from_str(l).expect("ndjson line"))
            .collect()
    }

    #[test]
    fn minimal_mode_mirrors_control_events_only() {
        let path = std::env::temp_dir().join(format!("sw-timeline-{}.ndjson", uuid::Uuid::new_v4()));
        let mut tl = Timeline::new(Some(&path), LogMode::Minimal).expect("timeline");
        tl.emit("run.start", fields(json!({"stepCount": 1}))).expect("emit");
        tl.emit_report(0, "list", &json!({"targets": []})).expect("report");
        tl.emit("run.end", fields(json!({"ok": true}))).expect("emit");

        let lines = read_lines(&path);
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["event"], "run.start");
        assert_eq!(lines[0]["stepCount"], 1);
        assert_eq!(tl.entries().len(), 2);
        assert_eq!(tl.entries()[1].index, 1);
    }

    #[test]
    fn full_mode_adds_step_reports() {
        let path = std::env::temp_dir().join(format!("sw-timeline-{}.ndjson", uuid::Uuid::new_v4()));
        let mut tl = Timeline::new(Some(&path), LogMode::Full).expect("timeline");
        tl.emit("step.start", fields(json!({"index": 0}))).expect("emit");
        tl.emit_report(0, "list", &json!({"count": 2})).expect("report");

        let lines = read_lines(&path);
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[1]["event"], "step.report");
        assert_eq!(lines[1]["report"]["count"], 2);
        assert_eq!(tl.into_entries().len(), 1);
    }
}
