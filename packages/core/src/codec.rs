//! Event codecs: the JSON form kept in the durable queue and the
//! text/event-stream frames written to observers.

use serde_json::{Value, json};

use crate::{CoreError, CoreResult, Event, EventKind};

/// Encode an event into its canonical JSON form.
pub fn encode_json(event: &Event) -> CoreResult<String> {
    Ok(serde_json::to_string(event)?)
}

/// Decode an event from its canonical JSON form.
///
/// Any failure is `Permanent`: redelivering the same bytes cannot help.
pub fn decode_json(raw: &str) -> CoreResult<Event> {
    Ok(serde_json::from_str(raw)?)
}

/// One Server-Sent Events frame.
///
/// `data` carries `{"timestamp": ..., "data": {...}}`, where the inner
/// `data` is the variant payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseFrame {
    pub id: Option<String>,
    pub event: String,
    pub data: String,
}

impl SseFrame {
    pub fn from_event(event: &Event) -> CoreResult<Self> {
        let mut body = serde_json::to_value(&event.body)?;
        let data = body
            .get_mut("data")
            .map(Value::take)
            .unwrap_or_else(|| json!({}));
        let payload = json!({
            "timestamp": event.timestamp,
            "data": data,
        });

        Ok(Self {
            id: Some(event.sequence_id.to_string()),
            event: event.kind().as_str().to_string(),
            data: serde_json::to_string(&payload)?,
        })
    }

    /// Render the frame in text/event-stream form, including the blank
    /// line terminator.
    pub fn encode(&self) -> String {
        let mut out = String::new();
        if let Some(id) = &self.id {
            out.push_str("id: ");
            out.push_str(id);
            out.push('\n');
        }
        out.push_str("event: ");
        out.push_str(&self.event);
        out.push('\n');
        for line in self.data.split('\n') {
            out.push_str("data: ");
            out.push_str(line);
            out.push('\n');
        }
        out.push('\n');
        out
    }

    /// Parse a single frame. Comment lines and unknown fields are ignored.
    pub fn parse(text: &str) -> CoreResult<Self> {
        let mut id = None;
        let mut event = None;
        let mut data: Vec<&str> = Vec::new();

        for line in text.lines() {
            if line.is_empty() || line.starts_with(':') {
                continue;
            }
            let (field, value) = match line.split_once(':') {
                Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
                None => (line, ""),
            };
            match field {
                "id" => id = Some(value.to_string()),
                "event" => event = Some(value.to_string()),
                "data" => data.push(value),
                _ => {}
            }
        }

        let event = event.ok_or_else(|| CoreError::Permanent("frame has no event field".into()))?;
        Ok(Self {
            id,
            event,
            data: data.join("\n"),
        })
    }

    /// Rebuild the event this frame was rendered from.
    pub fn to_event(&self) -> CoreResult<Event> {
        let kind: EventKind = self
            .event
            .parse()
            .map_err(|e: CoreError| CoreError::Permanent(e.to_string()))?;
        let payload: Value = serde_json::from_str(&self.data)?;
        let timestamp = serde_json::from_value(payload.get("timestamp").cloned().unwrap_or_default())?;

        let body_value = match (kind, payload.get("data")) {
            (EventKind::Heartbeat, _) | (_, None) => json!({ "type": kind.as_str() }),
            (_, Some(data)) => json!({ "type": kind.as_str(), "data": data }),
        };

        let sequence_id = match &self.id {
            Some(id) => id
                .parse()
                .map_err(|_| CoreError::Permanent(format!("invalid frame id '{}'", id)))?,
            None => 0,
        };

        Ok(Event {
            sequence_id,
            timestamp,
            body: serde_json::from_value(body_value)?,
        })
    }
}
