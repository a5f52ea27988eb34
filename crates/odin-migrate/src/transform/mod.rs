//! Entity transformer: maps one Heimdall row to the Odin rows it becomes.
//!
//! Transformation is pure. It reads the ID mapping to rewrite foreign keys
//! but never writes and never resolves identities; the emitted
//! [`TargetRow::User`] drafts are resolved by the stage runner.

use crate::config::DefaultsConfig;
use crate::error::{MigrateError, Result};
use crate::identity::normalize::{name_from_columns, normalize_email, normalize_phone, NameParts};
use crate::identity::Candidate;
use crate::mapping::IdMapping;
use crate::model::{
    EntityKind, Gender, NewSchool, ParentType, Profile, Role, SchoolRef, SchoolType, SourceParent,
    SourceRow, SourceSchool, SourceStudent, SourceTeacher, TargetId,
};
use chrono::NaiveDate;

/// Last name given to school admin users.
pub const SCHOOL_ADMIN_LAST_NAME: &str = "Admin";
/// First name used when a school name has no usable first word.
pub const SCHOOL_ADMIN_FALLBACK_FIRST_NAME: &str = "School";

/// Read-only inputs shared by every transform call in a stage.
#[derive(Debug, Clone, Copy)]
pub struct TransformContext<'a> {
    pub mapping: &'a IdMapping,
    pub defaults: &'a DefaultsConfig,
    /// Used for employment and enrollment dates, which Heimdall lacks.
    pub migration_date: NaiveDate,
    pub strict_parents: bool,
}

/// A user row waiting for identity resolution.
#[derive(Debug, Clone, PartialEq)]
pub struct UserDraft {
    pub candidate: Candidate,
    pub password: Option<String>,
    pub profile_picture: Option<String>,
    pub is_active: bool,
    pub is_verified: bool,
    pub school: Option<SchoolRef>,
    pub country: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TargetRow {
    School(NewSchool),
    User(UserDraft),
    /// Profile owned by the user drafted in the same output.
    Profile(Profile),
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Transformed {
    pub rows: Vec<TargetRow>,
    pub warnings: Vec<String>,
}

impl Transformed {
    pub fn user(&self) -> Option<&UserDraft> {
        self.rows.iter().find_map(|row| match row {
            TargetRow::User(draft) => Some(draft),
            _ => None,
        })
    }
}

/// Map one source row to target rows.
pub fn transform(row: &SourceRow, ctx: &TransformContext<'_>) -> Result<Transformed> {
    match row {
        SourceRow::School(school) => transform_school(school, ctx),
        SourceRow::Teacher(teacher) => transform_teacher(teacher, ctx),
        SourceRow::Parent(parent) => transform_parent(parent, ctx),
        SourceRow::Student(student) => transform_student(student, ctx),
    }
}

fn transform_school(school: &SourceSchool, ctx: &TransformContext<'_>) -> Result<Transformed> {
    let name = school.name.split_whitespace().collect::<Vec<_>>().join(" ");
    if name.is_empty() {
        return Err(MigrateError::transform(&school.id, "school name is empty"));
    }

    let mut out = Transformed::default();
    let email = match non_empty(school.email.as_deref()) {
        Some(raw) => {
            let normalized = normalize_email(raw);
            if normalized.is_none() {
                out.warnings
                    .push(format!("school {} has invalid email '{}'", school.id, raw));
            }
            normalized
        }
        None => None,
    };
    let phone = non_empty(school.phone.as_deref())
        .and_then(|raw| normalize_phone(raw, &ctx.defaults.phone_country_code));

    out.rows.push(TargetRow::School(NewSchool {
        name: name.clone(),
        email,
        phone,
        code: trimmed(school.code.as_deref()),
        level: trimmed(school.level.as_deref()),
        motto: trimmed(school.motto.as_deref()),
        vision: trimmed(school.vision.as_deref()),
        country: trimmed(school.country.as_deref()).unwrap_or_else(|| ctx.defaults.country.clone()),
        county: trimmed(school.county.as_deref()).unwrap_or_else(|| ctx.defaults.county.clone()),
        logo: trimmed(school.logo.as_deref()),
        address: trimmed(school.address.as_deref()),
        school_type: SchoolType::from_source(school.school_type.as_deref(), ctx.defaults.school_type),
        is_active: school.is_active,
        is_verified: school.is_verified,
    }));

    // The school's login becomes a school-admin user. Schools without an
    // email never had a login.
    if let Some(raw_email) = non_empty(school.email.as_deref()) {
        let first = name
            .split_whitespace()
            .next()
            .filter(|w| w.chars().any(char::is_alphanumeric))
            .unwrap_or(SCHOOL_ADMIN_FALLBACK_FIRST_NAME);
        out.rows.push(TargetRow::User(UserDraft {
            candidate: Candidate {
                first_name: first.to_string(),
                middle_name: None,
                last_name: Some(SCHOOL_ADMIN_LAST_NAME.to_string()),
                email: Some(raw_email.to_string()),
                phone: trimmed(school.phone.as_deref()),
                role: Role::SchoolAdmin,
            },
            password: trimmed(school.password.as_deref()),
            profile_picture: trimmed(school.logo.as_deref()),
            is_active: school.is_active,
            is_verified: school.is_verified,
            school: Some(SchoolRef::Unit),
            country: ctx.defaults.country.clone(),
        }));
        out.rows.push(TargetRow::Profile(Profile::SchoolAdmin {
            school: SchoolRef::Unit,
            is_main: true,
            position: ctx.defaults.school_admin_position.clone(),
        }));
    }

    Ok(out)
}

fn transform_teacher(teacher: &SourceTeacher, ctx: &TransformContext<'_>) -> Result<Transformed> {
    let school_id = resolve_school(&teacher.id, teacher.school_id.as_deref(), ctx)?;
    let name = person_name(
        &teacher.id,
        &teacher.first_name,
        teacher.middle_name.as_deref(),
        teacher.last_name.as_deref(),
    )?;

    let subjects: Vec<&str> = teacher
        .subjects
        .iter()
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .collect();

    let mut out = Transformed::default();
    out.rows.push(TargetRow::User(UserDraft {
        candidate: candidate(name, teacher.email.as_deref(), teacher.phone.as_deref(), Role::Teacher),
        password: trimmed(teacher.password.as_deref()),
        profile_picture: trimmed(teacher.profile_image.as_deref()),
        is_active: !teacher.is_login_barred,
        is_verified: true,
        school: Some(SchoolRef::Id(school_id)),
        country: ctx.defaults.country.clone(),
    }));
    out.rows.push(TargetRow::Profile(Profile::Teacher {
        school_id,
        subject_specialization: (!subjects.is_empty()).then(|| subjects.join(", ")),
        employment_date: ctx.migration_date,
        is_active: !teacher.is_login_barred,
    }));
    Ok(out)
}

fn transform_parent(parent: &SourceParent, ctx: &TransformContext<'_>) -> Result<Transformed> {
    let school_id = resolve_school(&parent.id, parent.school_id.as_deref(), ctx)?;
    let name = person_name(
        &parent.id,
        &parent.first_name,
        parent.middle_name.as_deref(),
        parent.last_name.as_deref(),
    )?;
    let phone = non_empty(parent.phone.as_deref()).or(non_empty(parent.secondary_phone.as_deref()));

    let mut out = Transformed::default();
    out.rows.push(TargetRow::User(UserDraft {
        candidate: candidate(name, parent.email.as_deref(), phone, Role::Parent),
        password: trimmed(parent.password.as_deref()),
        profile_picture: trimmed(parent.profile_image.as_deref()),
        is_active: !parent.is_login_barred,
        is_verified: true,
        school: Some(SchoolRef::Id(school_id)),
        country: ctx.defaults.country.clone(),
    }));
    out.rows.push(TargetRow::Profile(Profile::Parent {
        school_id,
        parent_type: ParentType::from_relationship(parent.relationship.as_deref()),
    }));
    Ok(out)
}

fn transform_student(student: &SourceStudent, ctx: &TransformContext<'_>) -> Result<Transformed> {
    let school_id = resolve_school(&student.id, student.school_id.as_deref(), ctx)?;
    let name = person_name(
        &student.id,
        &student.first_name,
        student.middle_name.as_deref(),
        student.last_name.as_deref(),
    )?;

    let mut out = Transformed::default();
    let mut parent_user_ids = Vec::new();
    if let Some(parent_id) = non_empty(student.parent_id.as_deref()) {
        match ctx.mapping.get(EntityKind::Parents, parent_id) {
            Some(user_id) => parent_user_ids.push(user_id),
            None if ctx.strict_parents => {
                return Err(MigrateError::transform(
                    &student.id,
                    format!("parent {} has not been migrated", parent_id),
                ));
            }
            None => out.warnings.push(format!(
                "student {} references unmigrated parent {}; migrated without parent link",
                student.id, parent_id
            )),
        }
    }

    out.rows.push(TargetRow::User(UserDraft {
        candidate: candidate(name, None, None, Role::Student),
        password: None,
        profile_picture: trimmed(student.profile_image.as_deref()),
        is_active: true,
        is_verified: false,
        school: Some(SchoolRef::Id(school_id)),
        country: ctx.defaults.country.clone(),
    }));
    out.rows.push(TargetRow::Profile(Profile::Student {
        school_id,
        admission_number: trimmed(student.admission_number.as_deref()),
        gender: Gender::from_source(student.gender.as_deref()),
        enrollment_date: ctx.migration_date,
        parent_user_ids,
    }));
    Ok(out)
}

fn resolve_school(source_id: &str, school_id: Option<&str>, ctx: &TransformContext<'_>) -> Result<TargetId> {
    let school_id = non_empty(school_id)
        .ok_or_else(|| MigrateError::transform(source_id, "row has no school reference"))?;
    ctx.mapping
        .get(EntityKind::Schools, school_id)
        .ok_or_else(|| {
            MigrateError::transform(
                source_id,
                format!("school {} has not been migrated", school_id),
            )
        })
}

fn person_name(source_id: &str, first: &str, middle: Option<&str>, last: Option<&str>) -> Result<NameParts> {
    let name = name_from_columns(first, middle, last);
    if name.first.is_empty() {
        return Err(MigrateError::transform(source_id, "person has no first name"));
    }
    Ok(name)
}

fn candidate(name: NameParts, email: Option<&str>, phone: Option<&str>, role: Role) -> Candidate {
    Candidate {
        first_name: name.first,
        middle_name: name.middle,
        last_name: name.last,
        email: trimmed(email),
        phone: trimmed(phone),
        role,
    }
}

fn non_empty(s: Option<&str>) -> Option<&str> {
    s.map(str::trim).filter(|s| !s.is_empty())
}

fn trimmed(s: Option<&str>) -> Option<String> {
    non_empty(s).map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 1, 5).unwrap()
    }

    fn ctx<'a>(mapping: &'a IdMapping, defaults: &'a DefaultsConfig, strict: bool) -> TransformContext<'a> {
        TransformContext {
            mapping,
            defaults,
            migration_date: date(),
            strict_parents: strict,
        }
    }

    fn school() -> SourceSchool {
        SourceSchool {
            id: "S1".into(),
            name: "  Greenfield   Academy ".into(),
            email: Some("Info@Greenfield.ac.ke".into()),
            phone: Some("0711000111".into()),
            is_active: true,
            ..Default::default()
        }
    }

    #[test]
    fn test_school_emits_school_and_admin() {
        let mapping = IdMapping::new();
        let defaults = DefaultsConfig::default();
        let out = transform(&SourceRow::School(school()), &ctx(&mapping, &defaults, false)).unwrap();

        assert_eq!(out.rows.len(), 3);
        let TargetRow::School(new_school) = &out.rows[0] else {
            panic!("expected school row");
        };
        assert_eq!(new_school.name, "Greenfield Academy");
        assert_eq!(new_school.email.as_deref(), Some("info@greenfield.ac.ke"));
        assert_eq!(new_school.phone.as_deref(), Some("254711000111"));
        assert_eq!(new_school.country, "Kenya");
        assert_eq!(new_school.county, "Nairobi");
        assert_eq!(new_school.school_type, SchoolType::Private);

        let admin = out.user().unwrap();
        assert_eq!(admin.candidate.first_name, "Greenfield");
        assert_eq!(admin.candidate.last_name.as_deref(), Some("Admin"));
        assert_eq!(admin.candidate.role, Role::SchoolAdmin);
        assert_eq!(admin.school, Some(SchoolRef::Unit));
        assert!(matches!(
            out.rows[2],
            TargetRow::Profile(Profile::SchoolAdmin { is_main: true, .. })
        ));
    }

    #[test]
    fn test_school_without_email_has_no_admin() {
        let mapping = IdMapping::new();
        let defaults = DefaultsConfig::default();
        let mut s = school();
        s.email = None;
        let out = transform(&SourceRow::School(s), &ctx(&mapping, &defaults, false)).unwrap();
        assert_eq!(out.rows.len(), 1);
        assert!(out.user().is_none());
    }

    #[test]
    fn test_teacher_requires_migrated_school() {
        let mapping = IdMapping::new();
        let defaults = DefaultsConfig::default();
        let teacher = SourceTeacher {
            id: "T1".into(),
            first_name: "Jane".into(),
            school_id: Some("S1".into()),
            ..Default::default()
        };
        let err = transform(&SourceRow::Teacher(teacher), &ctx(&mapping, &defaults, false)).unwrap_err();
        assert!(matches!(err, MigrateError::Transform { .. }));
        assert!(err.to_string().contains("school S1 has not been migrated"));
    }

    #[test]
    fn test_teacher_profile_fields() {
        let mut mapping = IdMapping::new();
        mapping.insert(EntityKind::Schools, "S1", 3).unwrap();
        let defaults = DefaultsConfig::default();
        let teacher = SourceTeacher {
            id: "T1".into(),
            first_name: "Jane Wairimu Doe".into(),
            school_id: Some("S1".into()),
            is_login_barred: true,
            subjects: vec!["Maths".into(), " ".into(), "Physics".into()],
            ..Default::default()
        };
        let out = transform(&SourceRow::Teacher(teacher), &ctx(&mapping, &defaults, false)).unwrap();
        let draft = out.user().unwrap();
        assert_eq!(draft.candidate.first_name, "Jane");
        assert_eq!(draft.candidate.middle_name.as_deref(), Some("Wairimu"));
        assert_eq!(draft.candidate.last_name.as_deref(), Some("Doe"));
        assert!(!draft.is_active);
        assert_eq!(
            out.rows[1],
            TargetRow::Profile(Profile::Teacher {
                school_id: 3,
                subject_specialization: Some("Maths, Physics".into()),
                employment_date: date(),
                is_active: false,
            })
        );
    }

    #[test]
    fn test_parent_uses_secondary_phone() {
        let mut mapping = IdMapping::new();
        mapping.insert(EntityKind::Schools, "S1", 3).unwrap();
        let defaults = DefaultsConfig::default();
        let parent = SourceParent {
            id: "P1".into(),
            first_name: "Peter".into(),
            last_name: Some("Mwangi".into()),
            secondary_phone: Some("0722000333".into()),
            relationship: Some("Dad".into()),
            school_id: Some("S1".into()),
            ..Default::default()
        };
        let out = transform(&SourceRow::Parent(parent), &ctx(&mapping, &defaults, false)).unwrap();
        assert_eq!(out.user().unwrap().candidate.phone.as_deref(), Some("0722000333"));
        assert_eq!(
            out.rows[1],
            TargetRow::Profile(Profile::Parent {
                school_id: 3,
                parent_type: ParentType::Father
            })
        );
    }

    fn student(parent: Option<&str>) -> SourceStudent {
        SourceStudent {
            id: "ST1".into(),
            first_name: "Amina".into(),
            last_name: Some("Otieno".into()),
            admission_number: Some("ADM-001".into()),
            gender: Some("F".into()),
            school_id: Some("S1".into()),
            parent_id: parent.map(str::to_string),
            ..Default::default()
        }
    }

    #[test]
    fn test_student_links_resolved_parent() {
        let mut mapping = IdMapping::new();
        mapping.insert(EntityKind::Schools, "S1", 3).unwrap();
        mapping.insert(EntityKind::Parents, "P1", 40).unwrap();
        let defaults = DefaultsConfig::default();
        let out = transform(&SourceRow::Student(student(Some("P1"))), &ctx(&mapping, &defaults, true)).unwrap();
        assert!(out.warnings.is_empty());
        let TargetRow::Profile(Profile::Student {
            parent_user_ids,
            gender,
            ..
        }) = &out.rows[1]
        else {
            panic!("expected student profile");
        };
        assert_eq!(parent_user_ids, &vec![40]);
        assert_eq!(*gender, Gender::Female);
    }

    #[test]
    fn test_student_unresolved_parent_lenient_and_strict() {
        let mut mapping = IdMapping::new();
        mapping.insert(EntityKind::Schools, "S1", 3).unwrap();
        let defaults = DefaultsConfig::default();

        let lenient = transform(&SourceRow::Student(student(Some("P9"))), &ctx(&mapping, &defaults, false)).unwrap();
        assert_eq!(lenient.warnings.len(), 1);
        assert!(matches!(
            &lenient.rows[1],
            TargetRow::Profile(Profile::Student { parent_user_ids, .. }) if parent_user_ids.is_empty()
        ));

        let strict = transform(&SourceRow::Student(student(Some("P9"))), &ctx(&mapping, &defaults, true));
        assert!(matches!(strict, Err(MigrateError::Transform { .. })));
    }

    #[test]
    fn test_person_without_name_fails() {
        let mut mapping = IdMapping::new();
        mapping.insert(EntityKind::Schools, "S1", 3).unwrap();
        let defaults = DefaultsConfig::default();
        let mut s = student(None);
        s.first_name = "   ".into();
        s.last_name = None;
        assert!(transform(&SourceRow::Student(s), &ctx(&mapping, &defaults, false)).is_err());
    }

    #[test]
    fn test_transform_is_pure() {
        let mut mapping = IdMapping::new();
        mapping.insert(EntityKind::Schools, "S1", 3).unwrap();
        let defaults = DefaultsConfig::default();
        let row = SourceRow::Student(student(None));
        let a = transform(&row, &ctx(&mapping, &defaults, false)).unwrap();
        let b = transform(&row, &ctx(&mapping, &defaults, false)).unwrap();
        assert_eq!(a, b);
        assert_eq!(mapping.total(), 1);
    }
}
