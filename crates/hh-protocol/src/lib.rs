// hh-protocol: HelpHub wire-record model and line codec.
//
// Every client-facing channel (framed TLS and the web push socket) speaks
// the same encoding: one record per line, serialized as a flat JSON object
// with a fixed key order.  Parsing is deliberately tolerant so that a
// damaged field never kills a session — a line either yields a record
// (with server-assigned defaults filled in) or is discarded whole.

use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Record kinds and priorities
// ---------------------------------------------------------------------------

/// The kind of a wire record.
///
/// DIRECT and BROADCAST are routable payloads; STATUS, ACK and HEARTBEAT
/// are session-control records consumed by the per-session inbound loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordKind {
    Direct,
    Broadcast,
    Status,
    Ack,
    Heartbeat,
}

impl RecordKind {
    pub fn as_str(self) -> &'static str {
        match self {
            RecordKind::Direct => "DIRECT",
            RecordKind::Broadcast => "BROADCAST",
            RecordKind::Status => "STATUS",
            RecordKind::Ack => "ACK",
            RecordKind::Heartbeat => "HEARTBEAT",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "DIRECT" => Some(RecordKind::Direct),
            "BROADCAST" => Some(RecordKind::Broadcast),
            "STATUS" => Some(RecordKind::Status),
            "ACK" => Some(RecordKind::Ack),
            "HEARTBEAT" => Some(RecordKind::Heartbeat),
            _ => None,
        }
    }

    /// True for the kinds the router persists and delivers.
    pub fn is_routable(self) -> bool {
        matches!(self, RecordKind::Direct | RecordKind::Broadcast)
    }
}

/// Delivery priority.  Replay order is priority descending, then
/// creation time ascending.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Priority {
    Low,
    Normal,
    High,
}

impl Priority {
    pub fn as_i64(self) -> i64 {
        match self {
            Priority::Low => 0,
            Priority::Normal => 1,
            Priority::High => 2,
        }
    }

    pub fn from_i64(v: i64) -> Option<Self> {
        match v {
            0 => Some(Priority::Low),
            1 => Some(Priority::Normal),
            2 => Some(Priority::High),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Record
// ---------------------------------------------------------------------------

/// The unit of traffic and storage.
///
/// `to` is `None` for broadcasts and non-addressed kinds.  For an ACK the
/// body carries the id being acknowledged; for a HEARTBEAT the body is an
/// arbitrary sentinel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub id: String,
    pub kind: RecordKind,
    pub from: String,
    pub to: Option<String>,
    /// Millisecond timestamp at origination.
    pub timestamp: i64,
    pub body: String,
    pub priority: Priority,
    /// Stamped by the durable queue when the row transitions to DELIVERED.
    pub delivered_timestamp: Option<i64>,
}

/// Current time in milliseconds since the Unix epoch.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

fn fresh_id() -> String {
    Uuid::new_v4().to_string()
}

impl Record {
    pub fn direct(from: &str, to: &str, body: &str, priority: Priority) -> Self {
        Record {
            id: fresh_id(),
            kind: RecordKind::Direct,
            from: from.to_owned(),
            to: Some(to.to_owned()),
            timestamp: now_ms(),
            body: body.to_owned(),
            priority,
            delivered_timestamp: None,
        }
    }

    pub fn broadcast(from: &str, body: &str, priority: Priority) -> Self {
        Record {
            id: fresh_id(),
            kind: RecordKind::Broadcast,
            from: from.to_owned(),
            to: None,
            timestamp: now_ms(),
            body: body.to_owned(),
            priority,
            delivered_timestamp: None,
        }
    }

    pub fn status(from: &str, body: &str) -> Self {
        Record {
            id: fresh_id(),
            kind: RecordKind::Status,
            from: from.to_owned(),
            to: None,
            timestamp: now_ms(),
            body: body.to_owned(),
            priority: Priority::Normal,
            delivered_timestamp: None,
        }
    }

    /// Acknowledge receipt of the record with id `acked_id`.
    pub fn ack(from: &str, acked_id: &str) -> Self {
        Record {
            id: fresh_id(),
            kind: RecordKind::Ack,
            from: from.to_owned(),
            to: None,
            timestamp: now_ms(),
            body: acked_id.to_owned(),
            priority: Priority::Normal,
            delivered_timestamp: None,
        }
    }

    pub fn heartbeat(from: &str) -> Self {
        Record {
            id: fresh_id(),
            kind: RecordKind::Heartbeat,
            from: from.to_owned(),
            to: None,
            timestamp: now_ms(),
            body: "ping".to_owned(),
            priority: Priority::Normal,
            delivered_timestamp: None,
        }
    }

    // -----------------------------------------------------------------------
    // Wire codec
    // -----------------------------------------------------------------------

    /// Serialize to a single wire line (no trailing newline).
    ///
    /// Key order is fixed: `id, type, from, to, timestamp, body, priority`
    /// with `deliveredTimestamp` appended only once set.  `to` is the JSON
    /// `null` token when absent.
    pub fn to_wire(&self) -> String {
        let view = WireView {
            id: &self.id,
            kind: self.kind.as_str(),
            from: &self.from,
            to: self.to.as_deref(),
            timestamp: self.timestamp,
            body: &self.body,
            priority: self.priority.as_i64(),
            delivered_timestamp: self.delivered_timestamp,
        };
        // Serializing a plain struct of strings and integers cannot fail.
        serde_json::to_string(&view).unwrap_or_default()
    }

    /// Tolerant parse of one wire line.
    ///
    /// Required fields: `type` (a known kind), `from`, `body`.  Missing
    /// `id`, `timestamp` or `priority` are filled with a fresh id, the
    /// current time and NORMAL respectively.  `to` equal to JSON null or
    /// the string `"null"` becomes absent.  Unknown fields are ignored.
    /// Anything else — not an object, unknown kind, wrong field types on
    /// the required keys — yields `None` and the caller discards the line.
    pub fn from_wire(line: &str) -> Option<Record> {
        let value: Value = serde_json::from_str(line.trim()).ok()?;
        let obj = value.as_object()?;

        let kind = RecordKind::parse(obj.get("type")?.as_str()?)?;
        let from = obj.get("from")?.as_str()?.to_owned();
        let body = obj.get("body")?.as_str()?.to_owned();

        let id = match obj.get("id").and_then(Value::as_str) {
            Some(s) if !s.is_empty() => s.to_owned(),
            _ => fresh_id(),
        };
        let timestamp = obj
            .get("timestamp")
            .and_then(Value::as_i64)
            .unwrap_or_else(now_ms);
        let priority = obj
            .get("priority")
            .and_then(Value::as_i64)
            .and_then(Priority::from_i64)
            .unwrap_or(Priority::Normal);
        let to = match obj.get("to") {
            Some(Value::String(s)) if s != "null" => Some(s.clone()),
            _ => None,
        };
        let delivered_timestamp = obj.get("deliveredTimestamp").and_then(Value::as_i64);

        Some(Record {
            id,
            kind,
            from,
            to,
            timestamp,
            body,
            priority,
            delivered_timestamp,
        })
    }
}

/// Serialization view: fixes the wire key order and naming.
#[derive(Serialize)]
struct WireView<'a> {
    id: &'a str,
    #[serde(rename = "type")]
    kind: &'a str,
    from: &'a str,
    to: Option<&'a str>,
    timestamp: i64,
    body: &'a str,
    priority: i64,
    #[serde(rename = "deliveredTimestamp", skip_serializing_if = "Option::is_none")]
    delivered_timestamp: Option<i64>,
}

// ---------------------------------------------------------------------------
// Rejection frames
// ---------------------------------------------------------------------------

/// Frozen rejection codes sent as single error frames before closing.
pub mod reject_codes {
    pub const ID_TAKEN: &str = "ID_TAKEN";
    pub const EMPTY_ID: &str = "EMPTY_ID";
    pub const INVALID_RECORD: &str = "INVALID_RECORD";
}

#[derive(Serialize)]
struct ErrorFrame<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    body: &'a str,
}

/// A single-line error frame, e.g. `{"type":"ERROR","body":"ID_TAKEN"}`.
///
/// Error frames are not `Record`s: `from_wire` does not parse them, so a
/// client echoing one back is discarded like any malformed line.
pub fn error_line(code: &str) -> String {
    serde_json::to_string(&ErrorFrame {
        kind: "ERROR",
        body: code,
    })
    .unwrap_or_default()
}
