//! Shared domain types for the Heimdall (V1) and Odin (V2) schemas.

mod source;
mod target;

pub use source::*;
pub use target::*;

use crate::error::{MigrateError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Entity kinds, one per migration stage, in dependency order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Schools,
    Teachers,
    Parents,
    Students,
}

impl EntityKind {
    /// All kinds in stage order.
    pub const ALL: [EntityKind; 4] = [
        EntityKind::Schools,
        EntityKind::Teachers,
        EntityKind::Parents,
        EntityKind::Students,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Schools => "schools",
            EntityKind::Teachers => "teachers",
            EntityKind::Parents => "parents",
            EntityKind::Students => "students",
        }
    }

    /// Heimdall table holding rows of this kind.
    pub fn source_table(&self) -> &'static str {
        match self {
            EntityKind::Schools => "School",
            EntityKind::Teachers => "Teacher",
            EntityKind::Parents => "Parent",
            EntityKind::Students => "Student",
        }
    }

    /// Parse a kind from a CLI/config token. Singular forms are accepted.
    pub fn parse(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "schools" | "school" => Ok(EntityKind::Schools),
            "teachers" | "teacher" => Ok(EntityKind::Teachers),
            "parents" | "parent" => Ok(EntityKind::Parents),
            "students" | "student" => Ok(EntityKind::Students),
            other => Err(MigrateError::Config(format!(
                "Unknown entity '{}'. Valid values: schools, teachers, parents, students",
                other
            ))),
        }
    }

    /// Parse a comma-separated entity list.
    pub fn parse_list(s: &str) -> Result<Vec<Self>> {
        let mut kinds = Vec::new();
        for token in s.split(',').filter(|t| !t.trim().is_empty()) {
            let kind = Self::parse(token)?;
            if !kinds.contains(&kind) {
                kinds.push(kind);
            }
        }
        if kinds.is_empty() {
            return Err(MigrateError::Config("entity list is empty".into()));
        }
        kinds.sort();
        Ok(kinds)
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Role held by a canonical user in Odin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Role {
    SchoolAdmin,
    Teacher,
    Parent,
    Student,
}

impl Role {
    /// Value stored in `users.primary_role` and `user_roles.role`.
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::SchoolAdmin => "SCHOOL_ADMIN",
            Role::Teacher => "TEACHER",
            Role::Parent => "PARENT",
            Role::Student => "STUDENT",
        }
    }

    /// Lowercase token used in synthesized email addresses.
    pub fn slug(&self) -> &'static str {
        match self {
            Role::SchoolAdmin => "admin",
            Role::Teacher => "teacher",
            Role::Parent => "parent",
            Role::Student => "student",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "SCHOOL_ADMIN" => Some(Role::SchoolAdmin),
            "TEACHER" => Some(Role::Teacher),
            "PARENT" => Some(Role::Parent),
            "STUDENT" => Some(Role::Student),
            _ => None,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SchoolType {
    Private,
    Public,
    International,
}

impl SchoolType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SchoolType::Private => "PRIVATE",
            SchoolType::Public => "PUBLIC",
            SchoolType::International => "INTERNATIONAL",
        }
    }

    /// Map a free-text Heimdall school type, falling back to `default`.
    pub fn from_source(raw: Option<&str>, default: SchoolType) -> Self {
        match raw.map(|s| s.trim().to_uppercase()).as_deref() {
            Some("PRIVATE") => SchoolType::Private,
            Some("PUBLIC") => SchoolType::Public,
            Some("INTERNATIONAL") => SchoolType::International,
            _ => default,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ParentType {
    Father,
    Mother,
    Guardian,
}

impl ParentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ParentType::Father => "FATHER",
            ParentType::Mother => "MOTHER",
            ParentType::Guardian => "GUARDIAN",
        }
    }

    /// Map the Heimdall free-text relationship column.
    pub fn from_relationship(raw: Option<&str>) -> Self {
        let Some(raw) = raw else {
            return ParentType::Guardian;
        };
        let lower = raw.to_lowercase();
        if lower.contains("father") || lower.contains("dad") {
            ParentType::Father
        } else if lower.contains("mother") || lower.contains("mom") || lower.contains("mum") {
            ParentType::Mother
        } else {
            ParentType::Guardian
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Gender {
    Male,
    Female,
}

impl Gender {
    pub fn as_str(&self) -> &'static str {
        match self {
            Gender::Male => "MALE",
            Gender::Female => "FEMALE",
        }
    }

    /// Heimdall stores gender as free text; anything not recognisably
    /// female maps to MALE.
    pub fn from_source(raw: Option<&str>) -> Self {
        match raw.map(|s| s.trim().to_lowercase()) {
            Some(s) if s == "f" || s.contains("female") => Gender::Female,
            _ => Gender::Male,
        }
    }
}
