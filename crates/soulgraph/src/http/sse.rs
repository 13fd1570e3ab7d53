use crate::error::{Error, Result};
use crate::types::{ChangeSetEntry, GraphData};
use bytes::BytesMut;

/// One dispatched server-sent event.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SseEvent {
    pub id: Option<String>,
    pub event: Option<String>,
    pub data: String,
}

impl SseEvent {
    /// Changelog entry carried by this event. Named events other than
    /// `message` are not changes.
    pub fn into_entry(self) -> Result<Option<ChangeSetEntry>> {
        if self.event.as_deref().is_some_and(|e| e != "message") {
            return Ok(None);
        }
        let key = self
            .id
            .ok_or_else(|| Error::Protocol("change event without id".into()))?;
        let diff: GraphData = serde_json::from_str(&self.data)?;
        Ok(Some(ChangeSetEntry { key, diff }))
    }
}

/// Incremental `text/event-stream` decoder.
#[derive(Debug, Default)]
pub struct SseParser {
    buffer: BytesMut,
    current: SseEvent,
    has_data: bool,
}

impl SseParser {
    /// Consume a chunk and return every event it completed.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        self.buffer.extend_from_slice(chunk);
        let mut events = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let raw = self.buffer.split_to(pos + 1);
            let text = String::from_utf8_lossy(&raw[..pos]);
            let line = text.strip_suffix('\r').unwrap_or(&text);
            if let Some(event) = self.process_line(line) {
                events.push(event);
            }
        }
        events
    }

    fn process_line(&mut self, line: &str) -> Option<SseEvent> {
        if line.is_empty() {
            let event = std::mem::take(&mut self.current);
            let dispatch = std::mem::replace(&mut self.has_data, false);
            return dispatch.then_some(event);
        }
        if line.starts_with(':') {
            return None;
        }

        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        match field {
            "data" => {
                if self.has_data {
                    self.current.data.push('\n');
                }
                self.current.data.push_str(value);
                self.has_data = true;
            }
            "id" => self.current.id = Some(value.to_string()),
            "event" => self.current.event = Some(value.to_string()),
            _ => {}
        }
        None
    }
}
