//! Scalar metrics sinks

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use anyhow::Result;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricRecord {
    pub name: String,
    /// `null` in JSON when not finite.
    pub value: f64,
    pub step: usize,
}

pub trait MetricsSink {
    fn record(&mut self, name: &str, value: f64, step: usize) -> Result<()>;

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}

/// One JSON object per line.
pub struct JsonlSink {
    writer: BufWriter<File>,
}

impl JsonlSink {
    /// Appends to `path`, creating parent directories.
    pub fn create(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = std::fs::OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            writer: BufWriter::new(file),
        })
    }
}

impl MetricsSink for JsonlSink {
    fn record(&mut self, name: &str, value: f64, step: usize) -> Result<()> {
        let record = MetricRecord {
            name: name.to_string(),
            value,
            step,
        };
        serde_json::to_writer(&mut self.writer, &record)?;
        self.writer.write_all(b"\n")?;
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }
}

/// Keeps every record in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    pub records: Vec<MetricRecord>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// `(step, value)` pairs recorded under `name`, in order.
    pub fn series(&self, name: &str) -> Vec<(usize, f64)> {
        self.records
            .iter()
            .filter(|r| r.name == name)
            .map(|r| (r.step, r.value))
            .collect()
    }
}

impl MetricsSink for MemorySink {
    fn record(&mut self, name: &str, value: f64, step: usize) -> Result<()> {
        self.records.push(MetricRecord {
            name: name.to_string(),
            value,
            step,
        });
        Ok(())
    }
}
