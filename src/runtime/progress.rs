//! Newline-delimited JSON progress records from pull/build/push.

use serde::Deserialize;

use crate::runtime::error::{Result, RuntimeError};

/// Receives human-readable progress lines.
pub trait LogSink: Send + Sync {
    fn line(&self, line: &str);
}

impl<F> LogSink for F
where
    F: Fn(&str) + Send + Sync,
{
    fn line(&self, line: &str) {
        self(line)
    }
}

/// Sink that forwards lines to `tracing` at trace level only.
pub struct TraceSink;

impl LogSink for TraceSink {
    fn line(&self, line: &str) {
        tracing::trace!("{}", line);
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ErrorDetail {
    #[serde(default)]
    pub message: Option<String>,
}

/// One progress record.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProgressRecord {
    #[serde(default)]
    pub stream: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub progress: Option<String>,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default, rename = "errorDetail")]
    pub error_detail: Option<ErrorDetail>,
}

impl ProgressRecord {
    /// The error carried by this record, if any.
    pub fn error_message(&self) -> Option<String> {
        self.error.clone().filter(|e| !e.is_empty()).or_else(|| {
            self.error_detail
                .as_ref()
                .and_then(|d| d.message.clone())
                .filter(|m| !m.is_empty())
        })
    }

    /// The single log line this record contributes, if any.
    pub fn log_line(&self) -> Option<String> {
        if let Some(stream) = &self.stream {
            let trimmed = stream.trim_end();
            return (!trimmed.is_empty()).then(|| trimmed.to_string());
        }

        let status = self.status.as_deref()?.trim();
        if status.is_empty() {
            return None;
        }
        let mut line = match &self.id {
            Some(id) if !id.is_empty() => format!("{id}: {status}"),
            _ => status.to_string(),
        };
        if let Some(progress) = self.progress.as_deref().filter(|p| !p.is_empty()) {
            line.push(' ');
            line.push_str(progress);
        }
        Some(line)
    }
}

/// Splits a byte stream into records. Partial lines are buffered.
#[derive(Debug, Default)]
pub struct ProgressDecoder {
    buf: Vec<u8>,
}

impl ProgressDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &[u8]) -> Result<Vec<ProgressRecord>> {
        self.buf.extend_from_slice(chunk);
        let mut records = Vec::new();
        while let Some(pos) = self.buf.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buf.drain(..=pos).collect();
            if let Some(record) = parse_line(&line)? {
                records.push(record);
            }
        }
        Ok(records)
    }

    /// Flush a final record that was not newline-terminated.
    pub fn finish(mut self) -> Result<Option<ProgressRecord>> {
        let rest = std::mem::take(&mut self.buf);
        parse_line(&rest)
    }
}

fn parse_line(line: &[u8]) -> Result<Option<ProgressRecord>> {
    let text = String::from_utf8_lossy(line);
    let text = text.trim();
    if text.is_empty() {
        return Ok(None);
    }
    serde_json::from_str(text)
        .map(Some)
        .map_err(|e| RuntimeError::protocol(format!("bad progress record {text:?}: {e}")))
}

/// Apply one record: forward its line, or stop on an error record.
pub fn apply_record(record: &ProgressRecord, sink: &dyn LogSink) -> Result<()> {
    if let Some(message) = record.error_message() {
        sink.line(&message);
        return Err(RuntimeError::Progress { message });
    }
    if let Some(line) = record.log_line() {
        sink.line(&line);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    #[test]
    fn test_stream_record_line() {
        let record: ProgressRecord =
            serde_json::from_str(r#"{"stream":"Step 1/4 : FROM node:20\n"}"#).unwrap();
        assert_eq!(record.log_line().as_deref(), Some("Step 1/4 : FROM node:20"));
        assert!(record.error_message().is_none());
    }

    #[test]
    fn test_status_record_with_id_and_progress() {
        let record: ProgressRecord = serde_json::from_str(
            r#"{"status":"Downloading","id":"a1b2","progress":"[==>   ] 1MB/4MB"}"#,
        )
        .unwrap();
        assert_eq!(
            record.log_line().as_deref(),
            Some("a1b2: Downloading [==>   ] 1MB/4MB")
        );
    }

    #[test]
    fn test_blank_stream_contributes_nothing() {
        let record: ProgressRecord = serde_json::from_str(r#"{"stream":"\n"}"#).unwrap();
        assert!(record.log_line().is_none());
        let record: ProgressRecord = serde_json::from_str(r#"{"aux":{"ID":"sha256:1"}}"#).unwrap();
        assert!(record.log_line().is_none());
    }

    #[test]
    fn test_error_detail_only() {
        let record: ProgressRecord =
            serde_json::from_str(r#"{"errorDetail":{"message":"denied: access forbidden"}}"#)
                .unwrap();
        assert_eq!(
            record.error_message().as_deref(),
            Some("denied: access forbidden")
        );
    }

    #[test]
    fn test_decoder_buffers_partial_lines() {
        let mut decoder = ProgressDecoder::new();
        let first = decoder.push(br#"{"stream":"a"}
{"str"#).unwrap();
        assert_eq!(first.len(), 1);
        let second = decoder.push(br#"eam":"b"}"#).unwrap();
        assert!(second.is_empty());
        let last = decoder.finish().unwrap().unwrap();
        assert_eq!(last.stream.as_deref(), Some("b"));
    }

    #[test]
    fn test_apply_record_error_terminates() {
        let lines = Mutex::new(Vec::new());
        let sink = |l: &str| lines.lock().unwrap().push(l.to_string());

        let ok: ProgressRecord = serde_json::from_str(r#"{"stream":"ok"}"#).unwrap();
        apply_record(&ok, &sink).unwrap();

        let bad: ProgressRecord =
            serde_json::from_str(r#"{"error":"manifest unknown"}"#).unwrap();
        let err = apply_record(&bad, &sink).unwrap_err();
        assert!(matches!(err, RuntimeError::Progress { ref message } if message == "manifest unknown"));
        assert_eq!(lines.lock().unwrap().len(), 2);
    }

    #[test]
    fn test_garbage_line_is_protocol_error() {
        let mut decoder = ProgressDecoder::new();
        assert!(decoder.push(b"not json\n").is_err());
    }
}
