use anyhow::Result;
use chrono::Utc;
use serde::Serialize;
use serde_json::json;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

/// Env var that turns on stdout event echo when the config leaves the
/// stream flag unset.
pub const LOG_STREAM_ENV: &str = "CIP_LOG_STREAM";

/// Persist structured artifacts and an event stream for a single run
/// under `<base_dir>/<instance_id>/`.
pub struct RunLogger {
    run_dir: PathBuf,
    stream: bool,
}

impl RunLogger {
    /// `stream = None` defers to [`LOG_STREAM_ENV`]; an explicit flag wins.
    pub fn new(base_dir: &Path, instance_id: &str, stream: Option<bool>) -> Result<Self> {
        let run_dir = base_dir.join(instance_id);
        fs::create_dir_all(&run_dir)?;
        let stream = stream.unwrap_or_else(env_stream_enabled);
        Ok(Self { run_dir, stream })
    }

    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }

    /// Append one `{ts, ts_iso, kind, data}` object to `events.ndjson`,
    /// echoing to stdout when streaming is on.
    pub fn log_event(&self, kind: &str, data: serde_json::Value) -> Result<()> {
        let now = Utc::now();
        let event = json!({
            "ts": now.timestamp_millis() as f64 / 1000.0,
            "ts_iso": now.to_rfc3339(),
            "kind": kind,
            "data": data,
        });
        let line = serde_json::to_string(&event)?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.run_dir.join("events.ndjson"))?;
        writeln!(file, "{line}")?;
        if self.stream {
            println!("{line}");
        }
        Ok(())
    }

    /// Write `<name>.json` under the run directory.
    pub fn log_json<T: Serialize>(&self, name: &str, data: &T) -> Result<PathBuf> {
        let path = self.run_dir.join(format!("{name}.json"));
        fs::write(&path, serde_json::to_vec_pretty(data)?)?;
        Ok(path)
    }

    /// Write `<name>.txt` under the run directory.
    pub fn log_text(&self, name: &str, text: &str) -> Result<PathBuf> {
        let path = self.run_dir.join(format!("{name}.txt"));
        fs::write(&path, text)?;
        Ok(path)
    }
}

fn env_stream_enabled() -> bool {
    std::env::var(LOG_STREAM_ENV).is_ok_and(|v| is_truthy(&v))
}

fn is_truthy(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on" | "enable" | "enabled"
    )
}
