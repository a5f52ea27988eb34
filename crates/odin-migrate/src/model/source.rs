//! Rows read from the Heimdall (V1) schema.

use super::EntityKind;
use serde::{Deserialize, Serialize};

/// A row from the Heimdall `School` table.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SourceSchool {
    pub id: String,
    pub name: String,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub code: Option<String>,
    pub level: Option<String>,
    pub motto: Option<String>,
    pub vision: Option<String>,
    pub country: Option<String>,
    pub county: Option<String>,
    pub logo: Option<String>,
    pub address: Option<String>,
    pub school_type: Option<String>,
    pub password: Option<String>,
    pub is_active: bool,
    pub is_verified: bool,
}

/// A row from the Heimdall `Teacher` table.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SourceTeacher {
    pub id: String,
    pub first_name: String,
    pub middle_name: Option<String>,
    pub last_name: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub profile_image: Option<String>,
    pub password: Option<String>,
    pub school_id: Option<String>,
    pub is_login_barred: bool,
    pub subjects: Vec<String>,
}

/// A row from the Heimdall `Parent` table.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SourceParent {
    pub id: String,
    pub first_name: String,
    pub middle_name: Option<String>,
    pub last_name: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub secondary_phone: Option<String>,
    pub relationship: Option<String>,
    pub profile_image: Option<String>,
    pub password: Option<String>,
    pub school_id: Option<String>,
    pub is_login_barred: bool,
}

/// A row from the Heimdall `Student` table.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SourceStudent {
    pub id: String,
    pub first_name: String,
    pub middle_name: Option<String>,
    pub last_name: Option<String>,
    pub admission_number: Option<String>,
    pub gender: Option<String>,
    pub profile_image: Option<String>,
    pub school_id: Option<String>,
    pub parent_id: Option<String>,
}

/// One source row of any kind. Immutable once read.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SourceRow {
    School(SourceSchool),
    Teacher(SourceTeacher),
    Parent(SourceParent),
    Student(SourceStudent),
}

impl SourceRow {
    pub fn id(&self) -> &str {
        match self {
            SourceRow::School(s) => &s.id,
            SourceRow::Teacher(t) => &t.id,
            SourceRow::Parent(p) => &p.id,
            SourceRow::Student(s) => &s.id,
        }
    }

    pub fn kind(&self) -> EntityKind {
        match self {
            SourceRow::School(_) => EntityKind::Schools,
            SourceRow::Teacher(_) => EntityKind::Teachers,
            SourceRow::Parent(_) => EntityKind::Parents,
            SourceRow::Student(_) => EntityKind::Students,
        }
    }

    /// Heimdall school the row belongs to. A school belongs to itself.
    pub fn school_id(&self) -> Option<&str> {
        match self {
            SourceRow::School(s) => Some(&s.id),
            SourceRow::Teacher(t) => t.school_id.as_deref(),
            SourceRow::Parent(p) => p.school_id.as_deref(),
            SourceRow::Student(s) => s.school_id.as_deref(),
        }
    }
}
