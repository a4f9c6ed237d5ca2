//! Classroom and time-slot catalog
//!
//! Read-only reference data: the fixed lookup tables used when converting old
//! booking records, and the default dataset written on first start.
//!
//! Missing catalog files are created from the built-in defaults. A malformed
//! file is logged and the defaults are used in its place; the file is left
//! untouched so an operator can fix it.

use crate::Result;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{info, warn};

/// Kind of bookable room
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClassroomKind {
    Classroom,
    Lab,
    Hall,
}

/// Classroom descriptor (`classrooms.json`)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Classroom {
    pub id: u32,
    pub name: String,
    pub kind: ClassroomKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub grade: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub section: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capacity: Option<u32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub equipment: Vec<String>,
}

/// Kind of time slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SlotKind {
    Period,
    Assembly,
    Break,
}

/// Time-slot descriptor (`timeslots.json`)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimeSlot {
    pub id: String,
    pub ordinal: u32,
    pub name: String,
    /// `HH:MM`
    pub start_time: String,
    /// `HH:MM`
    pub end_time: String,
    pub kind: SlotKind,
    pub display_order: u32,
}

/// Lookup tables for classrooms and time slots
#[derive(Debug, Clone, PartialEq)]
pub struct Catalog {
    pub classrooms: Vec<Classroom>,
    pub time_slots: Vec<TimeSlot>,
}

const ORDINAL_NAMES: [&str; 7] = [
    "الأولى", "الثانية", "الثالثة", "الرابعة", "الخامسة", "السادسة", "السابعة",
];

const PERIOD_TIMES: [(&str, &str); 7] = [
    ("07:30", "08:15"),
    ("08:20", "09:05"),
    ("09:10", "09:55"),
    ("10:20", "11:05"),
    ("11:10", "11:55"),
    ("12:00", "12:45"),
    ("12:50", "13:35"),
];

static DEFAULT_CATALOG: Lazy<Catalog> = Lazy::new(|| {
    let mut classrooms = Vec::new();
    let mut id = 1;
    for grade in 7..=12 {
        for section in 1..=2 {
            classrooms.push(Classroom {
                id,
                name: format!("{}/{}", grade, section),
                kind: ClassroomKind::Classroom,
                grade: Some(grade.to_string()),
                section: Some(section.to_string()),
                capacity: Some(30),
                equipment: Vec::new(),
            });
            id += 1;
        }
    }
    classrooms.push(Classroom {
        id,
        name: "مختبر العلوم".to_string(),
        kind: ClassroomKind::Lab,
        grade: None,
        section: None,
        capacity: Some(24),
        equipment: vec!["projector".to_string(), "fume hood".to_string()],
    });
    classrooms.push(Classroom {
        id: id + 1,
        name: "القاعة الكبرى".to_string(),
        kind: ClassroomKind::Hall,
        grade: None,
        section: None,
        capacity: Some(200),
        equipment: vec!["sound system".to_string()],
    });

    let mut time_slots = vec![TimeSlot {
        id: "assembly".to_string(),
        ordinal: 0,
        name: "الطابور الصباحي".to_string(),
        start_time: "07:00".to_string(),
        end_time: "07:25".to_string(),
        kind: SlotKind::Assembly,
        display_order: 0,
    }];
    for (i, (name, (start, end))) in ORDINAL_NAMES.iter().zip(PERIOD_TIMES.iter()).enumerate() {
        let ordinal = i as u32 + 1;
        time_slots.push(TimeSlot {
            id: format!("period-{}", ordinal),
            ordinal,
            name: format!("الحصة {}", name),
            start_time: start.to_string(),
            end_time: end.to_string(),
            kind: SlotKind::Period,
            display_order: ordinal,
        });
    }

    Catalog { classrooms, time_slots }
});

impl Default for Catalog {
    fn default() -> Self {
        DEFAULT_CATALOG.clone()
    }
}

impl Catalog {
    /// Load both catalog files, writing the default dataset for any that is missing
    pub fn load_or_init(classrooms_path: &Path, timeslots_path: &Path) -> Result<Self> {
        let defaults = Catalog::default();
        let classrooms = load_list(classrooms_path, &defaults.classrooms)?;
        let time_slots = load_list(timeslots_path, &defaults.time_slots)?;
        Ok(Self { classrooms, time_slots })
    }

    pub fn classroom_by_id(&self, id: u32) -> Option<&Classroom> {
        self.classrooms.iter().find(|c| c.id == id)
    }

    pub fn slot_by_ordinal(&self, ordinal: u32) -> Option<&TimeSlot> {
        self.time_slots.iter().find(|s| s.ordinal == ordinal)
    }

    /// Display name of the time slot with this ordinal
    pub fn slot_name(&self, ordinal: u32) -> Option<&str> {
        self.slot_by_ordinal(ordinal).map(|s| s.name.as_str())
    }

    /// Time slots sorted by display order
    pub fn ordered_slots(&self) -> Vec<&TimeSlot> {
        let mut slots: Vec<&TimeSlot> = self.time_slots.iter().collect();
        slots.sort_by_key(|s| s.display_order);
        slots
    }
}

fn load_list<T>(path: &Path, defaults: &[T]) -> Result<Vec<T>>
where
    T: Serialize + for<'de> Deserialize<'de> + Clone,
{
    if !path.exists() {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_vec_pretty(defaults)?)?;
        info!("Created default catalog file: {}", path.display());
        return Ok(defaults.to_vec());
    }

    let bytes = std::fs::read(path)?;
    match serde_json::from_slice::<Vec<T>>(&bytes) {
        Ok(items) => Ok(items),
        Err(e) => {
            warn!(
                "Catalog file {} is malformed ({}); using built-in defaults",
                path.display(),
                e
            );
            Ok(defaults.to_vec())
        }
    }
}
