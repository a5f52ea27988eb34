//! Rows written to the Odin (V2) schema and the batch envelope that carries them.

use super::{EntityKind, Gender, ParentType, Role, SchoolType};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// Primary key of a row in the Odin schema.
pub type TargetId = i64;

/// Run-scoped handle for a canonical user that may not have a target ID yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UserKey(pub u64);

/// Reference to a canonical user from inside a write batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UserRef {
    /// User created earlier in the same batch (ID assigned on insert).
    Key(UserKey),
    /// User already committed to the target.
    Id(TargetId),
}

/// Reference to a school from inside a write unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SchoolRef {
    /// The school inserted by the same unit.
    Unit,
    Id(TargetId),
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewSchool {
    pub name: String,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub code: Option<String>,
    pub level: Option<String>,
    pub motto: Option<String>,
    pub vision: Option<String>,
    pub country: String,
    pub county: String,
    pub logo: Option<String>,
    pub address: Option<String>,
    pub school_type: SchoolType,
    pub is_active: bool,
    pub is_verified: bool,
}

/// A canonical user row, ready to insert.
#[derive(Debug, Clone, PartialEq)]
pub struct NewUser {
    pub first_name: String,
    pub middle_name: Option<String>,
    pub last_name: Option<String>,
    pub email: String,
    pub phone: Option<String>,
    pub password: Option<String>,
    pub profile_picture: Option<String>,
    /// Role the user was created with; later roles go to `user_roles` only.
    pub primary_role: Role,
    pub is_active: bool,
    pub is_verified: bool,
    pub school: Option<SchoolRef>,
    pub country: String,
}

/// Role-specific payload owned by one canonical user.
#[derive(Debug, Clone, PartialEq)]
pub enum Profile {
    SchoolAdmin {
        school: SchoolRef,
        is_main: bool,
        position: String,
    },
    Teacher {
        school_id: TargetId,
        subject_specialization: Option<String>,
        employment_date: NaiveDate,
        is_active: bool,
    },
    Parent {
        school_id: TargetId,
        parent_type: ParentType,
    },
    Student {
        school_id: TargetId,
        admission_number: Option<String>,
        gender: Gender,
        enrollment_date: NaiveDate,
        /// Parent users resolved through the ID mapping. Empty when unresolved.
        parent_user_ids: Vec<TargetId>,
    },
}

impl Profile {
    pub fn role(&self) -> Role {
        match self {
            Profile::SchoolAdmin { .. } => Role::SchoolAdmin,
            Profile::Teacher { .. } => Role::Teacher,
            Profile::Parent { .. } => Role::Parent,
            Profile::Student { .. } => Role::Student,
        }
    }
}

/// A single write, applied in order within its unit.
#[derive(Debug, Clone, PartialEq)]
pub enum WriteOp {
    InsertSchool(NewSchool),
    InsertUser { key: UserKey, user: NewUser },
    GrantRole { user: UserRef, role: Role },
    InsertProfile { user: UserRef, profile: Profile },
}

/// What a unit's ID mapping entry points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Subject {
    School,
    User(UserRef),
}

/// All writes produced by one source row.
#[derive(Debug, Clone, PartialEq)]
pub struct WriteUnit {
    pub source_id: String,
    pub subject: Subject,
    pub ops: Vec<WriteOp>,
}

/// Units written in one target transaction.
#[derive(Debug, Clone, PartialEq)]
pub struct WriteBatch {
    pub kind: EntityKind,
    pub units: Vec<WriteUnit>,
}

impl WriteBatch {
    pub fn source_ids(&self) -> Vec<&str> {
        self.units.iter().map(|u| u.source_id.as_str()).collect()
    }
}

/// Result of a committed batch.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchOutcome {
    /// Target ID of each unit's subject, in unit order.
    pub unit_ids: Vec<TargetId>,
    /// IDs assigned to users created in this batch.
    pub bindings: Vec<(UserKey, TargetId)>,
}

/// A user already present in the target, used to seed identity resolution.
#[derive(Debug, Clone, PartialEq)]
pub struct ExistingIdentity {
    pub id: TargetId,
    pub first_name: String,
    pub middle_name: Option<String>,
    pub last_name: Option<String>,
    pub email: String,
    pub phone: Option<String>,
    pub roles: Vec<Role>,
}
