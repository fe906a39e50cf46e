//! Document content: the task list and the note.
//!
//! There is exactly one document per type per owner. Content has one
//! canonical JSON encoding (`to_canonical_json`) which is what gets persisted,
//! fingerprinted and compared for idempotence. Decoding is lenient: older
//! encodings found in storage or on the remote are upgraded on read.

use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize};
use serde_json::{Number, Value};
use std::fmt::{self, Display, Formatter};
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

/// Numeric ids above this are millisecond timestamps and double as `createdAt`.
const TIMESTAMP_ID_FLOOR: f64 = 1_600_000_000_000.0;

#[derive(Debug, Error)]
pub enum DocumentError {
    #[error("Invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Unexpected shape for {0}: {1}")]
    Shape(DocumentType, String),
}

pub type Result<T> = std::result::Result<T, DocumentError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum DocumentType {
    #[serde(rename = "TODO")]
    TaskList,
    #[serde(rename = "NOTES")]
    Note,
}

impl DocumentType {
    pub const ALL: [DocumentType; 2] = [DocumentType::TaskList, DocumentType::Note];

    /// Name used by the remote API (`typ`).
    pub fn wire_name(&self) -> &'static str {
        match self {
            DocumentType::TaskList => "TODO",
            DocumentType::Note => "NOTES",
        }
    }

    pub fn from_wire(name: &str) -> Option<Self> {
        match name {
            "TODO" => Some(DocumentType::TaskList),
            "NOTES" => Some(DocumentType::Note),
            _ => None,
        }
    }

    /// Segment used inside storage keys.
    pub fn key_segment(&self) -> &'static str {
        match self {
            DocumentType::TaskList => "tasks",
            DocumentType::Note => "notes",
        }
    }

    fn index(&self) -> usize {
        match self {
            DocumentType::TaskList => 0,
            DocumentType::Note => 1,
        }
    }
}

impl Display for DocumentType {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DocumentType::TaskList => "task list",
            DocumentType::Note => "note",
        })
    }
}

/// Fixed two-slot map keyed by document type.
#[derive(Debug, Clone, Default)]
pub struct PerType<T>([T; 2]);

impl<T> PerType<T> {
    pub fn new(mut f: impl FnMut(DocumentType) -> T) -> Self {
        Self([f(DocumentType::TaskList), f(DocumentType::Note)])
    }

    pub fn get(&self, ty: DocumentType) -> &T {
        &self.0[ty.index()]
    }

    pub fn get_mut(&mut self, ty: DocumentType) -> &mut T {
        &mut self.0[ty.index()]
    }
}

/// Task identifier. Keeps whatever representation it arrived with: old
/// clients used numeric timestamps, new tasks get UUID strings.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TaskId {
    Num(Number),
    Text(String),
}

impl TaskId {
    pub fn generate() -> Self {
        TaskId::Text(Uuid::new_v4().to_string())
    }

    fn as_timestamp(&self) -> Option<u64> {
        match self {
            TaskId::Num(n) => n
                .as_f64()
                .filter(|v| *v > TIMESTAMP_ID_FLOOR)
                .map(|v| v as u64),
            TaskId::Text(_) => None,
        }
    }
}

impl Display for TaskId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            TaskId::Num(n) => write!(f, "{n}"),
            TaskId::Text(s) => f.write_str(s),
        }
    }
}

impl FromStr for TaskId {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(match serde_json::from_str::<Number>(s) {
            Ok(n) => TaskId::Num(n),
            Err(_) => TaskId::Text(s.to_string()),
        })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
}

impl Priority {
    /// Unknown values read as `Normal`.
    pub fn parse_lenient(s: &str) -> Self {
        s.parse().unwrap_or_default()
    }
}

impl FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "low" => Ok(Priority::Low),
            "normal" => Ok(Priority::Normal),
            "high" => Ok(Priority::High),
            other => Err(format!("unknown priority {other:?}")),
        }
    }
}

impl<'de> Deserialize<'de> for Priority {
    fn deserialize<D: Deserializer<'de>>(d: D) -> std::result::Result<Self, D::Error> {
        let value = Value::deserialize(d)?;
        Ok(value
            .as_str()
            .map(Priority::parse_lenient)
            .unwrap_or_default())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AlarmPriority {
    #[default]
    Normal,
    High,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Alarm {
    /// Fire time, milliseconds since the Unix epoch.
    pub time: u64,
    pub priority: AlarmPriority,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

impl Alarm {
    pub fn at(time: u64) -> Self {
        Self {
            time,
            priority: AlarmPriority::Normal,
            note: None,
        }
    }

    /// Reads both the object form and the legacy bare-number form. The flag is
    /// true when the value was not already canonical.
    fn from_value(value: &Value) -> Option<(Self, bool)> {
        match value {
            Value::Number(n) => Some((Self::at(number_to_ms(n)?), true)),
            Value::Object(map) => {
                let time = map.get("time").and_then(Value::as_number).and_then(number_to_ms)?;
                let (priority, upgraded) = match map.get("priority").and_then(Value::as_str) {
                    Some("HIGH") => (AlarmPriority::High, false),
                    Some("NORMAL") => (AlarmPriority::Normal, false),
                    _ => (AlarmPriority::Normal, true),
                };
                let note = map.get("note").and_then(Value::as_str).map(str::to_string);
                Some((Self { time, priority, note }, upgraded))
            }
            _ => None,
        }
    }
}

impl<'de> Deserialize<'de> for Alarm {
    fn deserialize<D: Deserializer<'de>>(d: D) -> std::result::Result<Self, D::Error> {
        let value = Value::deserialize(d)?;
        Alarm::from_value(&value)
            .map(|(alarm, _)| alarm)
            .ok_or_else(|| de::Error::custom("alarm must be a number or {time, priority}"))
    }
}

fn number_to_ms(n: &Number) -> Option<u64> {
    n.as_u64()
        .or_else(|| n.as_f64().filter(|v| *v >= 0.0).map(|v| v as u64))
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: TaskId,
    pub text: String,
    #[serde(default)]
    pub done: bool,
    #[serde(default)]
    pub created_at: u64,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alarm: Option<Alarm>,
}

impl Task {
    pub fn new(text: impl Into<String>, now_ms: u64) -> Self {
        Self {
            id: TaskId::generate(),
            text: text.into(),
            done: false,
            created_at: now_ms,
            priority: Priority::Normal,
            alarm: None,
        }
    }
}

/// Lenient view of a stored task, used to upgrade old records.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawTask {
    id: Option<TaskId>,
    #[serde(default)]
    text: String,
    #[serde(default)]
    done: bool,
    created_at: Option<Value>,
    priority: Option<Value>,
    alarm: Option<Value>,
}

impl RawTask {
    fn normalize(self, now_ms: u64) -> (Task, bool) {
        let mut upgraded = false;

        let id = match self.id {
            Some(id) => id,
            None => {
                upgraded = true;
                TaskId::generate()
            }
        };

        let created_at = match self.created_at.as_ref().and_then(Value::as_number).and_then(number_to_ms) {
            Some(ts) if ts > 0 => ts,
            _ => {
                upgraded = true;
                id.as_timestamp().unwrap_or(now_ms)
            }
        };

        let priority = match self.priority.as_ref().and_then(Value::as_str) {
            Some(s) => match s.parse::<Priority>() {
                Ok(p) => p,
                Err(_) => {
                    upgraded = true;
                    Priority::Normal
                }
            },
            None => {
                upgraded = true;
                Priority::Normal
            }
        };

        let alarm = match self.alarm {
            None | Some(Value::Null) => None,
            Some(ref value) => match Alarm::from_value(value) {
                Some((alarm, up)) => {
                    upgraded |= up;
                    Some(alarm)
                }
                None => {
                    upgraded = true;
                    None
                }
            },
        };

        let task = Task {
            id,
            text: self.text,
            done: self.done,
            created_at,
            priority,
            alarm,
        };
        (task, upgraded)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NoteContent {
    #[serde(default)]
    pub notes: String,
    #[serde(default)]
    pub transcription: String,
}

impl NoteContent {
    pub fn new(notes: impl Into<String>, transcription: impl Into<String>) -> Self {
        Self {
            notes: notes.into(),
            transcription: transcription.into(),
        }
    }

    /// Total length in characters, as reported to the remote.
    pub fn char_len(&self) -> usize {
        self.notes.chars().count() + self.transcription.chars().count()
    }

    /// Reads an object with a `notes` field, unwrapping the double-encoded
    /// form where `notes` itself holds the JSON of a note.
    fn from_object(map: &serde_json::Map<String, Value>) -> Option<(Self, bool)> {
        if !map.contains_key("notes") {
            return None;
        }
        let field = |name: &str| {
            map.get(name)
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string()
        };
        let notes = field("notes");
        if let Ok(Value::Object(inner)) = serde_json::from_str::<Value>(&notes) {
            if let Some((inner, _)) = Self::from_object(&inner) {
                return Some((inner, true));
            }
        }
        let canonical = map.keys().all(|k| k == "notes" || k == "transcription");
        Some((Self::new(notes, field("transcription")), !canonical))
    }

    /// Reads a stored note in any encoding it has been written in.
    fn decode(raw: &str) -> (Self, bool) {
        match serde_json::from_str::<Value>(raw) {
            Ok(Value::Object(map)) => {
                if let Some(found) = Self::from_object(&map) {
                    return found;
                }
            }
            Ok(Value::String(text)) => return (Self::new(text, ""), true),
            _ => {}
        }
        (Self::new(raw, ""), true)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum DocumentContent {
    Tasks(Vec<Task>),
    Note(NoteContent),
}

impl DocumentContent {
    pub fn empty(ty: DocumentType) -> Self {
        match ty {
            DocumentType::TaskList => DocumentContent::Tasks(Vec::new()),
            DocumentType::Note => DocumentContent::Note(NoteContent::default()),
        }
    }

    pub fn doc_type(&self) -> DocumentType {
        match self {
            DocumentContent::Tasks(_) => DocumentType::TaskList,
            DocumentContent::Note(_) => DocumentType::Note,
        }
    }

    /// Whitespace-only notes count as empty.
    pub fn is_empty(&self) -> bool {
        match self {
            DocumentContent::Tasks(tasks) => tasks.is_empty(),
            DocumentContent::Note(note) => {
                note.notes.trim().is_empty() && note.transcription.trim().is_empty()
            }
        }
    }

    pub fn as_tasks(&self) -> Option<&[Task]> {
        match self {
            DocumentContent::Tasks(tasks) => Some(tasks),
            DocumentContent::Note(_) => None,
        }
    }

    pub fn as_note(&self) -> Option<&NoteContent> {
        match self {
            DocumentContent::Note(note) => Some(note),
            DocumentContent::Tasks(_) => None,
        }
    }

    /// The single encoding used for persistence and comparisons.
    pub fn to_canonical_json(&self) -> Result<String> {
        Ok(match self {
            DocumentContent::Tasks(tasks) => serde_json::to_string(tasks)?,
            DocumentContent::Note(note) => serde_json::to_string(note)?,
        })
    }

    pub fn to_value(&self) -> Result<Value> {
        Ok(match self {
            DocumentContent::Tasks(tasks) => serde_json::to_value(tasks)?,
            DocumentContent::Note(note) => serde_json::to_value(note)?,
        })
    }

    /// Decodes a value received from another tab or the remote.
    pub fn from_value(ty: DocumentType, value: Value, now_ms: u64) -> Result<Self> {
        match ty {
            DocumentType::TaskList => {
                let raw: Vec<RawTask> = serde_json::from_value(value)?;
                Ok(DocumentContent::Tasks(
                    raw.into_iter().map(|t| t.normalize(now_ms).0).collect(),
                ))
            }
            DocumentType::Note => match value {
                Value::Object(map) => NoteContent::from_object(&map)
                    .map(|(note, _)| DocumentContent::Note(note))
                    .ok_or_else(|| DocumentError::Shape(ty, "object without notes".into())),
                Value::String(raw) => Ok(DocumentContent::Note(NoteContent::decode(&raw).0)),
                Value::Null => Ok(DocumentContent::empty(ty)),
                other => Err(DocumentError::Shape(ty, format!("unexpected {other}"))),
            },
        }
    }

    /// Decodes what the durable store holds. The flag reports whether the
    /// stored form was a legacy encoding that should be rewritten.
    pub fn decode_stored(ty: DocumentType, raw: &str, now_ms: u64) -> Result<(Self, bool)> {
        match ty {
            DocumentType::TaskList => {
                let raw_tasks: Option<Vec<RawTask>> = serde_json::from_str(raw)?;
                let mut upgraded = false;
                let tasks = raw_tasks
                    .unwrap_or_default()
                    .into_iter()
                    .map(|t| {
                        let (task, up) = t.normalize(now_ms);
                        upgraded |= up;
                        task
                    })
                    .collect();
                Ok((DocumentContent::Tasks(tasks), upgraded))
            }
            DocumentType::Note => {
                let (note, upgraded) = NoteContent::decode(raw);
                Ok((DocumentContent::Note(note), upgraded))
            }
        }
    }
}

/// A single edit to the task list.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskEdit {
    /// Trimmed text, inserted at the front. Blank text is ignored.
    Add(String),
    Toggle(TaskId),
    Remove(TaskId),
    Move { from: usize, to: usize },
    SetPriority(TaskId, Priority),
    SetAlarm(TaskId, Option<Alarm>),
    ClearDone,
    /// Appended after the existing tasks.
    Import(Vec<Task>),
}

impl TaskEdit {
    /// Applies the edit in place. Returns false when nothing changed (unknown
    /// id, blank text, out-of-range move, empty import).
    pub fn apply(self, tasks: &mut Vec<Task>, now_ms: u64) -> bool {
        match self {
            TaskEdit::Add(text) => {
                let trimmed = text.trim();
                if trimmed.is_empty() {
                    return false;
                }
                tasks.insert(0, Task::new(trimmed, now_ms));
                true
            }
            TaskEdit::Toggle(id) => with_task(tasks, &id, |t| t.done = !t.done),
            TaskEdit::Remove(id) => {
                let before = tasks.len();
                tasks.retain(|t| t.id != id);
                tasks.len() != before
            }
            TaskEdit::Move { from, to } => {
                if from >= tasks.len() || to >= tasks.len() || from == to {
                    return false;
                }
                let task = tasks.remove(from);
                tasks.insert(to, task);
                true
            }
            TaskEdit::SetPriority(id, priority) => with_task(tasks, &id, |t| t.priority = priority),
            TaskEdit::SetAlarm(id, alarm) => with_task(tasks, &id, |t| t.alarm = alarm),
            TaskEdit::ClearDone => {
                let before = tasks.len();
                tasks.retain(|t| !t.done);
                tasks.len() != before
            }
            TaskEdit::Import(imported) => {
                if imported.is_empty() {
                    return false;
                }
                tasks.extend(imported);
                true
            }
        }
    }
}

fn with_task(tasks: &mut [Task], id: &TaskId, f: impl FnOnce(&mut Task)) -> bool {
    match tasks.iter_mut().find(|t| &t.id == id) {
        Some(task) => {
            let before = task.clone();
            f(task);
            *task != before
        }
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const NOW: u64 = 1_750_000_000_000;

    fn tasks(content: DocumentContent) -> Vec<Task> {
        match content {
            DocumentContent::Tasks(t) => t,
            other => panic!("expected tasks, got {other:?}"),
        }
    }

    #[test]
    fn test_legacy_task_gets_created_at_from_numeric_id() {
        let raw = r#"[{"id":1700000000000,"text":"call back","done":false}]"#;
        let (content, upgraded) = DocumentContent::decode_stored(DocumentType::TaskList, raw, NOW).unwrap();
        assert!(upgraded);
        let t = tasks(content);
        assert_eq!(t[0].created_at, 1_700_000_000_000);
        assert_eq!(t[0].priority, Priority::Normal);
        assert_eq!(t[0].id.to_string(), "1700000000000");
    }

    #[test]
    fn test_legacy_small_id_uses_now() {
        let raw = r#"[{"id":7,"text":"x","done":true,"priority":"high"}]"#;
        let (content, upgraded) = DocumentContent::decode_stored(DocumentType::TaskList, raw, NOW).unwrap();
        assert!(upgraded);
        let t = tasks(content);
        assert_eq!(t[0].created_at, NOW);
        assert_eq!(t[0].priority, Priority::High);
        assert!(t[0].done);
    }

    #[test]
    fn test_canonical_tasks_are_not_upgraded() {
        let content = DocumentContent::Tasks(vec![Task::new("a", NOW)]);
        let json = content.to_canonical_json().unwrap();
        let (decoded, upgraded) = DocumentContent::decode_stored(DocumentType::TaskList, &json, NOW).unwrap();
        assert!(!upgraded);
        assert_eq!(decoded, content);
    }

    #[test]
    fn test_legacy_numeric_alarm() {
        let raw = r#"[{"id":"a","text":"x","createdAt":5,"priority":"low","alarm":1800000000000}]"#;
        let (content, upgraded) = DocumentContent::decode_stored(DocumentType::TaskList, raw, NOW).unwrap();
        assert!(upgraded);
        let alarm = tasks(content)[0].alarm.clone().unwrap();
        assert_eq!(alarm, Alarm::at(1_800_000_000_000));
    }

    #[test]
    fn test_object_alarm_keeps_priority_and_note() {
        let value = json!([{"id":"a","text":"x","createdAt":5,"priority":"low",
            "alarm":{"time":10,"priority":"HIGH","note":"bring keys"}}]);
        let t = tasks(DocumentContent::from_value(DocumentType::TaskList, value, NOW).unwrap());
        let alarm = t[0].alarm.clone().unwrap();
        assert_eq!(alarm.priority, AlarmPriority::High);
        assert_eq!(alarm.note.as_deref(), Some("bring keys"));
    }

    #[test]
    fn test_unknown_priority_reads_as_normal() {
        let task: Task = serde_json::from_value(json!({"id":"a","text":"x","priority":"urgent"})).unwrap();
        assert_eq!(task.priority, Priority::Normal);
    }

    #[test]
    fn test_note_bare_string() {
        let (content, upgraded) = DocumentContent::decode_stored(DocumentType::Note, "hello", NOW).unwrap();
        assert!(upgraded);
        assert_eq!(content, DocumentContent::Note(NoteContent::new("hello", "")));
    }

    #[test]
    fn test_note_double_encoded() {
        let inner = r#"{"notes":"inner","transcription":"spoken"}"#;
        let raw = json!({"notes": inner, "transcription": "", "lastModified": 1}).to_string();
        let (content, upgraded) = DocumentContent::decode_stored(DocumentType::Note, &raw, NOW).unwrap();
        assert!(upgraded);
        assert_eq!(content, DocumentContent::Note(NoteContent::new("inner", "spoken")));
    }

    #[test]
    fn test_note_object_without_notes_is_plain_text() {
        let (content, _) = DocumentContent::decode_stored(DocumentType::Note, "{}", NOW).unwrap();
        assert_eq!(content, DocumentContent::Note(NoteContent::new("{}", "")));
    }

    #[test]
    fn test_whitespace_note_is_empty() {
        assert!(DocumentContent::Note(NoteContent::new("  \n", "\t")).is_empty());
        assert!(!DocumentContent::Note(NoteContent::new("", "x")).is_empty());
    }

    #[test]
    fn test_task_id_parse_keeps_representation() {
        assert_eq!("12".parse::<TaskId>().unwrap(), TaskId::Num(12.into()));
        assert_eq!(
            "9b1c".parse::<TaskId>().unwrap(),
            TaskId::Text("9b1c".to_string())
        );
    }

    #[test]
    fn test_task_edits() {
        let mut list = Vec::new();
        assert!(!TaskEdit::Add("   ".into()).apply(&mut list, NOW));
        assert!(TaskEdit::Add("  first ".into()).apply(&mut list, NOW));
        assert!(TaskEdit::Add("second".into()).apply(&mut list, NOW));
        assert_eq!(list[0].text, "second");
        assert_eq!(list[1].text, "first");

        let first = list[1].id.clone();
        assert!(TaskEdit::Toggle(first.clone()).apply(&mut list, NOW));
        assert!(list[1].done);
        assert!(TaskEdit::Move { from: 1, to: 0 }.apply(&mut list, NOW));
        assert_eq!(list[0].id, first);
        assert!(!TaskEdit::Move { from: 0, to: 5 }.apply(&mut list, NOW));

        assert!(TaskEdit::SetPriority(first.clone(), Priority::High).apply(&mut list, NOW));
        assert!(!TaskEdit::SetPriority(first.clone(), Priority::High).apply(&mut list, NOW));
        assert!(TaskEdit::SetAlarm(first.clone(), Some(Alarm::at(1))).apply(&mut list, NOW));

        assert!(TaskEdit::ClearDone.apply(&mut list, NOW));
        assert_eq!(list.len(), 1);
        assert!(!TaskEdit::Remove(first).apply(&mut list, NOW));

        assert!(TaskEdit::Import(vec![Task::new("imported", NOW)]).apply(&mut list, NOW));
        assert_eq!(list.last().unwrap().text, "imported");
    }
}
