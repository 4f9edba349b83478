//! asciicast v2 wire types: one header object followed by line-delimited
//! `[t, kind, data]` event arrays (spec §3 "Recording format") — with one
//! exception: the terminal `exit` event is written as `["exit", code, ""]`,
//! per spec §4.4/§8 E2, not `[t, "exit", code]`.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Header {
    pub version: u8,
    pub width: u32,
    pub height: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub env: Option<HashMap<String, String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration: Option<f64>,
}

impl Header {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            version: 2,
            width,
            height,
            timestamp: None,
            env: None,
            command: None,
            title: None,
            duration: None,
        }
    }
}

/// An event kind as it appears on the wire (`data[1]` of an asciicast
/// line). Kept as a thin newtype over `char` rather than an enum so that
/// unrecognized kinds round-trip rather than failing to parse — a reader
/// of an existing recording should tolerate future kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Output,
    Input,
    Resize,
    Exit,
}

impl EventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::Output => "o",
            EventKind::Input => "i",
            EventKind::Resize => "r",
            EventKind::Exit => "exit",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "o" => Some(EventKind::Output),
            "i" => Some(EventKind::Input),
            "r" => Some(EventKind::Resize),
            "exit" => Some(EventKind::Exit),
            _ => None,
        }
    }
}

/// A single `[t, kind, data]` event record.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub time: f64,
    pub kind: EventKind,
    pub data: String,
}

impl Event {
    pub fn output(time: f64, data: impl Into<String>) -> Self {
        Self { time, kind: EventKind::Output, data: data.into() }
    }

    pub fn resize(time: f64, cols: u32, rows: u32) -> Self {
        Self { time, kind: EventKind::Resize, data: format!("{cols}x{rows}") }
    }

    pub fn exit(time: f64, code: i32) -> Self {
        Self { time, kind: EventKind::Exit, data: code.to_string() }
    }

    /// Re-stamps this event's time, used by the multiplexer to rewrite
    /// backlog timestamps to zero or to a per-subscriber clock (spec §4.6).
    pub fn with_time(&self, time: f64) -> Self {
        Self { time, kind: self.kind, data: self.data.clone() }
    }

    pub fn to_line(&self) -> String {
        // Every kind but "exit" is the generic `[t, kind, data]` triple.
        // "exit" is the one wire exception: `["exit", code, ""]`, per the
        // literal shape spelled out alongside it (exitCode as the second
        // element, an empty third element, no timestamp).
        let value = match self.kind {
            EventKind::Exit => serde_json::json!([self.kind.as_str(), self.data, ""]),
            _ => serde_json::json!([self.time, self.kind.as_str(), self.data]),
        };
        serde_json::to_string(&value).expect("event arrays are always representable as JSON")
    }

    pub fn parse_line(line: &str) -> anyhow::Result<Self> {
        let value: serde_json::Value = serde_json::from_str(line)?;
        let arr = value
            .as_array()
            .ok_or_else(|| anyhow::anyhow!("event record is not a JSON array"))?;
        if arr.len() != 3 {
            anyhow::bail!("event record must have exactly 3 elements");
        }
        if let Some("exit") = arr[0].as_str() {
            let data = arr[1]
                .as_str()
                .ok_or_else(|| anyhow::anyhow!("exit event code must be a string"))?
                .to_string();
            return Ok(Self { time: 0.0, kind: EventKind::Exit, data });
        }
        let time = arr[0]
            .as_f64()
            .ok_or_else(|| anyhow::anyhow!("event time must be numeric"))?;
        let kind_str = arr[1]
            .as_str()
            .ok_or_else(|| anyhow::anyhow!("event kind must be a string"))?;
        let kind = EventKind::parse(kind_str)
            .ok_or_else(|| anyhow::anyhow!("unknown event kind: {kind_str}"))?;
        let data = arr[2]
            .as_str()
            .ok_or_else(|| anyhow::anyhow!("event data must be a string"))?
            .to_string();
        Ok(Self { time, kind, data })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_roundtrip() {
        let h = Header::new(80, 24);
        let s = serde_json::to_string(&h).unwrap();
        let back: Header = serde_json::from_str(&s).unwrap();
        assert_eq!(h, back);
    }

    #[test]
    fn event_roundtrip() {
        let e = Event::output(1.5, "hello\n");
        let line = e.to_line();
        let back = Event::parse_line(&line).unwrap();
        assert_eq!(e, back);
    }

    #[test]
    fn exit_event_data_is_decimal_string() {
        let e = Event::exit(2.0, 137);
        assert_eq!(e.data, "137");
        assert_eq!(e.kind, EventKind::Exit);
    }

    #[test]
    fn exit_event_wire_shape_is_exit_code_empty() {
        let e = Event::exit(2.5, 7);
        assert_eq!(e.to_line(), r#"["exit","7",""]"#);
        let back = Event::parse_line(&e.to_line()).unwrap();
        assert_eq!(back.kind, EventKind::Exit);
        assert_eq!(back.data, "7");
    }

    #[test]
    fn resize_event_format() {
        let e = Event::resize(0.0, 120, 40);
        assert_eq!(e.data, "120x40");
    }

    #[test]
    fn rejects_malformed_event() {
        assert!(Event::parse_line("{}").is_err());
        assert!(Event::parse_line("[1, \"bogus\", \"x\"]").is_err());
        assert!(Event::parse_line("[1, \"o\"]").is_err());
    }
}
