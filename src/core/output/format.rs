//! Output writer for text and JSON modes.

use crate::models::OutputFormat;
use serde::Serialize;
use std::io::{self, Write};

/// Human-readable rendering of a report.
pub trait TextReport {
    fn write_text(&self, out: &mut dyn Write) -> io::Result<()>;
}

/// Writer that formats reports according to the specified format.
pub struct OutputWriter<W: Write> {
    writer: W,
    format: OutputFormat,
}

impl<W: Write> OutputWriter<W> {
    pub fn new(writer: W, format: OutputFormat) -> Self {
        Self { writer, format }
    }

    pub fn format(&self) -> OutputFormat {
        self.format
    }

    /// Writes one report: pretty JSON document or its text rendering.
    pub fn write<T>(&mut self, report: &T) -> io::Result<()>
    where
        T: Serialize + TextReport + ?Sized,
    {
        match self.format {
            OutputFormat::Text => report.write_text(&mut self.writer)?,
            OutputFormat::Json => {
                serde_json::to_writer_pretty(&mut self.writer, report).map_err(io::Error::other)?;
                writeln!(self.writer)?;
            }
        }
        self.writer.flush()
    }

    /// Writes an error for the caller. JSON mode emits `{"error": ..., "kind": ...}`.
    pub fn write_error(&mut self, message: &str, kind: Option<&str>) -> io::Result<()> {
        match self.format {
            OutputFormat::Text => writeln!(self.writer, "✗ {}", message)?,
            OutputFormat::Json => {
                let value = serde_json::json!({ "error": message, "kind": kind });
                serde_json::to_writer_pretty(&mut self.writer, &value).map_err(io::Error::other)?;
                writeln!(self.writer)?;
            }
        }
        self.writer.flush()
    }
}
