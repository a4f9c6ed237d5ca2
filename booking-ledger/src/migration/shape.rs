//! Record shape classification
//!
//! Ledger entries written by earlier versions come in three layouts. The
//! layout is recognized from which fields are present:
//!
//! | Shape  | Fields                                         |
//! |--------|------------------------------------------------|
//! | Old    | `classroom_id`, `teacher_name`, `time_slot`    |
//! | Legacy | `day`, `period`, no `date`                     |
//! | Modern | `date` and (`type` or `timeSlot`)              |

use serde_json::{Map, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordShape {
    Old,
    Legacy,
    Modern,
}

/// Why an entry could not be classified
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Unclassified {
    NotAnObject,
    UnknownLayout,
}

impl std::fmt::Display for Unclassified {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Unclassified::NotAnObject => f.write_str("entry is not an object"),
            Unclassified::UnknownLayout => f.write_str("entry matches no known record layout"),
        }
    }
}

/// Determine the shape of one ledger entry
pub fn classify(entry: &Value) -> Result<RecordShape, Unclassified> {
    let fields = entry.as_object().ok_or(Unclassified::NotAnObject)?;
    let has = |name: &str| has_field(fields, name);

    if has("classroom_id") && has("teacher_name") && has("time_slot") {
        Ok(RecordShape::Old)
    } else if has("day") && has("period") && !has("date") {
        Ok(RecordShape::Legacy)
    } else if has("date") && (has("type") || has("timeSlot")) {
        Ok(RecordShape::Modern)
    } else {
        Err(Unclassified::UnknownLayout)
    }
}

fn has_field(fields: &Map<String, Value>, name: &str) -> bool {
    fields.get(name).map_or(false, |v| !v.is_null())
}
