//! Per-link log of applied rates
//!
//! One line per phase transition, `"<unix_millis>, <rate_bps>\n"`, plus a
//! terminal line repeating the last applied rate when the link stops.
//! Timestamps never go backwards even if the wall clock does.

use crate::errors::Result;
use std::fs::File;
use std::io::{LineWriter, Write};
use std::path::Path;

pub struct RateLog {
    writer: Option<Box<dyn Write + Send>>,
    last_timestamp_ms: i64,
    last_rate_bps: Option<u64>,
    entries: usize,
}

impl RateLog {
    pub fn create(path: impl AsRef<Path>) -> Result<Self> {
        let file = File::create(path)?;
        Ok(Self::from_writer(LineWriter::new(file)))
    }

    pub fn from_writer(writer: impl Write + Send + 'static) -> Self {
        Self {
            writer: Some(Box::new(writer)),
            last_timestamp_ms: i64::MIN,
            last_rate_bps: None,
            entries: 0,
        }
    }

    /// A log that counts entries but writes nothing
    pub fn discard() -> Self {
        Self::from_writer(std::io::sink())
    }

    /// Record that `rate_bps` now holds on the link
    pub fn record(&mut self, rate_bps: u64) -> Result<()> {
        self.write_entry(rate_bps)?;
        self.last_rate_bps = Some(rate_bps);
        Ok(())
    }

    /// Write the terminal entry (if anything was applied) and close the sink
    ///
    /// Calling this more than once is a no-op.
    pub fn finish(&mut self) -> Result<()> {
        if self.writer.is_none() {
            return Ok(());
        }
        if let Some(rate) = self.last_rate_bps {
            self.write_entry(rate)?;
        }
        if let Some(mut writer) = self.writer.take() {
            writer.flush()?;
        }
        Ok(())
    }

    pub fn entries(&self) -> usize {
        self.entries
    }

    pub fn last_rate_bps(&self) -> Option<u64> {
        self.last_rate_bps
    }

    pub fn is_closed(&self) -> bool {
        self.writer.is_none()
    }

    fn write_entry(&mut self, rate_bps: u64) -> Result<()> {
        let now = chrono::Utc::now().timestamp_millis().max(self.last_timestamp_ms);
        if let Some(writer) = self.writer.as_mut() {
            writeln!(writer, "{}, {}", now, rate_bps)?;
            self.last_timestamp_ms = now;
            self.entries += 1;
        }
        Ok(())
    }
}

/// Parse a log back into `(timestamp_ms, rate_bps)` pairs
pub fn parse_entries(text: &str) -> Vec<(i64, u64)> {
    text.lines()
        .filter_map(|line| {
            let (ts, rate) = line.split_once(',')?;
            Some((ts.trim().parse().ok()?, rate.trim().parse().ok()?))
        })
        .collect()
}
