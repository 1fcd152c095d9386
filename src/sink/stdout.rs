use std::io::{self, BufWriter, Write};

use anyhow::{Context, Result};

use crate::report::PowerReport;

/// Writes power reports as newline-delimited JSON.
pub struct StdoutSink {
    name: String,
    writer: Box<dyn Write + Send>,
}

impl StdoutSink {
    pub fn new(name: String) -> Self {
        Self::with_writer(name, Box::new(BufWriter::new(io::stdout())))
    }

    /// Builds a sink writing to an arbitrary writer instead of stdout.
    pub fn with_writer(name: String, writer: Box<dyn Write + Send>) -> Self {
        Self { name, writer }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn send(&mut self, report: &PowerReport) -> Result<()> {
        serde_json::to_writer(&mut self.writer, report).context("encoding power report")?;
        self.writer.write_all(b"\n").context("writing power report")
    }

    pub fn flush(&mut self) -> Result<()> {
        self.writer.flush().context("flushing stdout sink")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    use chrono::DateTime;

    use crate::report::Metadata;

    #[derive(Clone, Default)]
    struct Shared(Arc<Mutex<Vec<u8>>>);

    impl Write for Shared {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_one_json_object_per_line() {
        let buf = Shared::default();
        let mut sink = StdoutSink::with_writer("stdout".to_string(), Box::new(buf.clone()));

        for (ms, power) in [(1_000, 2.5), (2_000, 0.25)] {
            let mut metadata = Metadata::new();
            metadata.insert("formula".to_string(), "naive".into());
            sink.send(&PowerReport {
                timestamp: DateTime::from_timestamp_millis(ms).unwrap(),
                sensor: "node".to_string(),
                target: "/web".to_string(),
                power,
                metadata,
            })
            .unwrap();
        }
        sink.flush().unwrap();

        let out = String::from_utf8(buf.0.lock().unwrap().clone()).unwrap();
        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(lines.len(), 2);

        let first: PowerReport = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first.timestamp.timestamp_millis(), 1_000);
        assert_eq!(first.power, 2.5);
        assert_eq!(first.metadata["formula"], "naive");

        let second: serde_json::Value = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(second["timestamp"], 2_000);
        assert_eq!(second["target"], "/web");
    }
}
