//! fastrace reporter writing Chrome Trace Event Format JSON.
//!
//! One file per trace, named `{timestamp_ms}_{trace_id}.json`. Load it in
//! `chrome://tracing` or <https://ui.perfetto.dev> to see how a run's phases
//! (initialize, sample_phi, sweeps, sample_z) line up.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use fastrace::collector::{Reporter, SpanRecord};
use log::error;
use serde::Serialize;

pub struct TraceFileReporter {
    output_dir: PathBuf,
}

impl TraceFileReporter {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
        }
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }
}

#[derive(Debug, Serialize)]
struct TraceEvent {
    name: String,
    cat: &'static str,
    ph: &'static str,
    /// Microseconds.
    ts: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    dur: Option<f64>,
    pid: u64,
    tid: u64,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    args: BTreeMap<String, String>,
}

fn span_events(span: SpanRecord) -> Vec<TraceEvent> {
    let mut events: Vec<TraceEvent> = span
        .events
        .iter()
        .map(|e| TraceEvent {
            name: e.name.to_string(),
            cat: "event",
            ph: "i",
            ts: e.timestamp_unix_ns as f64 / 1000.0,
            dur: None,
            pid: 1,
            tid: 1,
            args: e
                .properties
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        })
        .collect();

    let mut args: BTreeMap<String, String> = span
        .properties
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    args.insert("span_id".into(), span.span_id.to_string());
    args.insert("parent_id".into(), span.parent_id.to_string());
    events.push(TraceEvent {
        name: span.name.into_owned(),
        cat: "span",
        ph: "X",
        ts: span.begin_time_unix_ns as f64 / 1000.0,
        dur: Some(span.duration_ns as f64 / 1000.0),
        pid: 1,
        tid: 1,
        args,
    });
    events
}

impl Reporter for TraceFileReporter {
    fn report(&mut self, spans: Vec<SpanRecord>) {
        if spans.is_empty() {
            return;
        }

        let mut traces: HashMap<String, Vec<TraceEvent>> = HashMap::new();
        for span in spans {
            let trace_id = span.trace_id.to_string();
            traces.entry(trace_id).or_default().extend(span_events(span));
        }

        let timestamp_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| d.as_millis());
        for (trace_id, mut events) in traces {
            events.sort_by(|a, b| a.ts.total_cmp(&b.ts));
            let path = self
                .output_dir
                .join(format!("{timestamp_ms}_{trace_id}.json"));
            match serde_json::to_string_pretty(&events) {
                Ok(json) => {
                    if let Err(e) = std::fs::write(&path, json) {
                        error!("Failed to write trace file {}: {}", path.display(), e);
                    }
                }
                Err(e) => error!("Failed to serialize trace: {}", e),
            }
        }
    }
}
