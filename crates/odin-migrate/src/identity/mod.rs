//! Identity resolution: turns per-role person records into canonical users.
//!
//! The resolver owns the run-scoped uniqueness index for emails and phones.
//! It is passed explicitly to the stage runner and is only ever touched by
//! one batch at a time.
//!
//! Policy:
//! - A candidate merges into an existing user only when both requested the
//!   same email and have the same normalized full name, and the existing
//!   user does not already hold the candidate's role.
//! - Any other email collision is resolved by suffixing the local part
//!   (`jane+1@x`, `jane+2@x`, ...) up to a configured cap.
//! - Candidates without a usable email get one synthesized from their name
//!   and role plus a counter. Synthesized emails never merge.
//! - Phones are normalized and kept unique, but equal phones never merge
//!   users. A phone already held by someone else is dropped from the new
//!   user and reported.
//!
//! Every decision depends only on the sequence of prior calls, so the same
//! input in the same order always yields the same emails.

pub mod normalize;

use crate::config::Config;
use crate::error::{MigrateError, Result};
use crate::model::{ExistingIdentity, Role, TargetId, UserKey, UserRef};
use std::collections::{BTreeMap, HashMap};
use std::fmt;

/// A natural-person record as it arrives from one source table.
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub first_name: String,
    pub middle_name: Option<String>,
    pub last_name: Option<String>,
    /// Raw email from the source; normalized by the resolver.
    pub email: Option<String>,
    /// Raw phone from the source; normalized by the resolver.
    pub phone: Option<String>,
    pub role: Role,
}

/// Resolver settings taken from configuration.
#[derive(Debug, Clone)]
pub struct ResolverPolicy {
    pub synthetic_domain: String,
    pub max_attempts: u32,
    pub phone_country_code: String,
}

impl ResolverPolicy {
    pub fn from_config(config: &Config) -> Self {
        Self {
            synthetic_domain: config.migration.synthetic_email_domain.clone(),
            max_attempts: config.migration.max_disambiguation_attempts,
            phone_country_code: config.defaults.phone_country_code.clone(),
        }
    }
}

impl Default for ResolverPolicy {
    fn default() -> Self {
        Self {
            synthetic_domain: "migrated.odin.local".to_string(),
            max_attempts: 1000,
            phone_country_code: "254".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// A new canonical user was registered.
    Created,
    /// The candidate was folded into an existing user, gaining a role.
    Merged,
}

/// Data-quality findings raised while resolving a candidate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdentityWarning {
    InvalidEmail { raw: String },
    InvalidPhone { raw: String },
    PhoneCollision { phone: String },
}

impl fmt::Display for IdentityWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IdentityWarning::InvalidEmail { raw } => {
                write!(f, "invalid email '{}' replaced by a synthesized address", raw)
            }
            IdentityWarning::InvalidPhone { raw } => {
                write!(f, "invalid phone '{}' dropped", raw)
            }
            IdentityWarning::PhoneCollision { phone } => {
                write!(f, "phone {} already belongs to another user; dropped", phone)
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct Resolution {
    pub key: UserKey,
    /// How the write batch should refer to the user.
    pub user: UserRef,
    pub email: String,
    pub phone: Option<String>,
    pub outcome: Outcome,
    pub email_synthesized: bool,
    pub warnings: Vec<IdentityWarning>,
}

/// Position in the resolver journal; see [`IdentityResolver::rollback_to`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Checkpoint(usize);

#[derive(Debug, Clone)]
struct UserRecord {
    person: String,
    requested: Option<String>,
    email: String,
    phone: Option<String>,
    roles: Vec<Role>,
    id: Option<TargetId>,
}

#[derive(Debug, Clone)]
enum JournalEntry {
    Created(UserKey),
    RoleAdded(UserKey),
    Counter { base: String, previous: Option<u32> },
}

/// Run-scoped identity index.
#[derive(Debug)]
pub struct IdentityResolver {
    policy: ResolverPolicy,
    records: Vec<UserRecord>,
    emails: HashMap<String, UserKey>,
    phones: HashMap<String, UserKey>,
    requests: HashMap<String, Vec<UserKey>>,
    counters: HashMap<String, u32>,
    journal: Vec<JournalEntry>,
}

impl IdentityResolver {
    pub fn new(policy: ResolverPolicy) -> Self {
        Self {
            policy,
            records: Vec::new(),
            emails: HashMap::new(),
            phones: HashMap::new(),
            requests: HashMap::new(),
            counters: HashMap::new(),
            journal: Vec::new(),
        }
    }

    /// Register users already present in the target so new candidates see
    /// their emails and phones as claimed.
    ///
    /// `requested` holds the email a previously migrated user originally
    /// asked for, keyed by target ID. Without it a user that was given
    /// `jane+1@x` could no longer be merged with a later `jane@x` record of
    /// the same person.
    pub fn seed(&mut self, existing: &[ExistingIdentity], requested: &BTreeMap<TargetId, String>) {
        for user in existing {
            let email = user.email.trim().to_lowercase();
            if self.emails.contains_key(&email) {
                continue;
            }
            let request = requested
                .get(&user.id)
                .cloned()
                .unwrap_or_else(|| email.clone());
            let key = UserKey(self.records.len() as u64);
            let phone = user
                .phone
                .as_deref()
                .filter(|p| !self.phones.contains_key(*p))
                .map(str::to_string);

            self.emails.insert(email.clone(), key);
            if let Some(p) = &phone {
                self.phones.insert(p.clone(), key);
            }
            self.requests.entry(request.clone()).or_default().push(key);
            self.records.push(UserRecord {
                person: normalize::person_key(
                    &user.first_name,
                    user.middle_name.as_deref(),
                    user.last_name.as_deref(),
                ),
                requested: Some(request),
                email,
                phone,
                roles: user.roles.clone(),
                id: Some(user.id),
            });
        }
    }

    /// Resolve a candidate to a canonical user, registering new claims.
    ///
    /// On error nothing is registered.
    pub fn resolve(&mut self, candidate: &Candidate) -> Result<Resolution> {
        let mut warnings = Vec::new();
        let person = normalize::person_key(
            &candidate.first_name,
            candidate.middle_name.as_deref(),
            candidate.last_name.as_deref(),
        );

        let requested = match candidate.email.as_deref().map(str::trim) {
            None | Some("") => None,
            Some(raw) => match normalize::normalize_email(raw) {
                Some(email) => Some(email),
                None => {
                    warnings.push(IdentityWarning::InvalidEmail {
                        raw: raw.to_string(),
                    });
                    None
                }
            },
        };

        if let Some(email) = &requested {
            if let Some(key) = self.merge_target(&person, email, candidate.role) {
                self.records[key.0 as usize].roles.push(candidate.role);
                self.journal.push(JournalEntry::RoleAdded(key));
                let record = &self.records[key.0 as usize];
                return Ok(Resolution {
                    key,
                    user: record_ref(key, record),
                    email: record.email.clone(),
                    phone: record.phone.clone(),
                    outcome: Outcome::Merged,
                    email_synthesized: false,
                    warnings,
                });
            }
        }

        let (email, synthesized) = match &requested {
            Some(email) if !self.emails.contains_key(email) => (email.clone(), false),
            Some(email) => (self.disambiguate(email)?, false),
            None => (self.synthesize(candidate)?, true),
        };

        let phone = match candidate.phone.as_deref().map(str::trim) {
            None | Some("") => None,
            Some(raw) => match normalize::normalize_phone(raw, &self.policy.phone_country_code) {
                Some(phone) if self.phones.contains_key(&phone) => {
                    warnings.push(IdentityWarning::PhoneCollision { phone });
                    None
                }
                Some(phone) => Some(phone),
                None => {
                    warnings.push(IdentityWarning::InvalidPhone {
                        raw: raw.to_string(),
                    });
                    None
                }
            },
        };

        let key = UserKey(self.records.len() as u64);
        self.emails.insert(email.clone(), key);
        if let Some(p) = &phone {
            self.phones.insert(p.clone(), key);
        }
        if let Some(req) = &requested {
            self.requests.entry(req.clone()).or_default().push(key);
        }
        self.records.push(UserRecord {
            person,
            requested,
            email: email.clone(),
            phone: phone.clone(),
            roles: vec![candidate.role],
            id: None,
        });
        self.journal.push(JournalEntry::Created(key));

        Ok(Resolution {
            key,
            user: UserRef::Key(key),
            email,
            phone,
            outcome: Outcome::Created,
            email_synthesized: synthesized,
            warnings,
        })
    }

    fn merge_target(&self, person: &str, email: &str, role: Role) -> Option<UserKey> {
        if person.is_empty() {
            return None;
        }
        self.requests.get(email)?.iter().copied().find(|key| {
            let record = &self.records[key.0 as usize];
            record.person == person && !record.roles.contains(&role)
        })
    }

    fn disambiguate(&self, email: &str) -> Result<String> {
        let (local, domain) = email
            .rsplit_once('@')
            .ok_or_else(|| MigrateError::IdentityResolution(format!("malformed email {}", email)))?;
        (1..=self.policy.max_attempts)
            .map(|n| format!("{}+{}@{}", local, n, domain))
            .find(|candidate| !self.emails.contains_key(candidate))
            .ok_or_else(|| {
                MigrateError::IdentityResolution(format!(
                    "no unclaimed variant of {} within {} attempts",
                    email, self.policy.max_attempts
                ))
            })
    }

    fn synthesize(&mut self, candidate: &Candidate) -> Result<String> {
        let name: Vec<String> = [Some(candidate.first_name.as_str()), candidate.last_name.as_deref()]
            .into_iter()
            .flatten()
            .map(normalize::slug)
            .filter(|s| !s.is_empty())
            .collect();
        let name = if name.is_empty() {
            "user".to_string()
        } else {
            name.join(".")
        };
        let base = format!("{}.{}", name, candidate.role.slug());

        let previous = self.counters.get(&base).copied();
        let start = previous.unwrap_or(0);
        for n in (start + 1)..=(start + self.policy.max_attempts) {
            let email = format!("{}.{}@{}", base, n, self.policy.synthetic_domain);
            if !self.emails.contains_key(&email) {
                self.counters.insert(base.clone(), n);
                self.journal.push(JournalEntry::Counter { base, previous });
                return Ok(email);
            }
        }
        Err(MigrateError::IdentityResolution(format!(
            "could not synthesize an unclaimed email for {} within {} attempts",
            base, self.policy.max_attempts
        )))
    }

    /// Current journal position. Take one before resolving a batch.
    pub fn checkpoint(&self) -> Checkpoint {
        Checkpoint(self.journal.len())
    }

    /// Undo every claim made after `checkpoint`.
    ///
    /// Used when a batch's transaction rolls back so its users do not keep
    /// holding emails and phones that never reached the target.
    pub fn rollback_to(&mut self, checkpoint: Checkpoint) {
        while self.journal.len() > checkpoint.0 {
            let Some(entry) = self.journal.pop() else {
                break;
            };
            match entry {
                JournalEntry::Created(key) => {
                    debug_assert_eq!(key.0 as usize + 1, self.records.len());
                    if let Some(record) = self.records.pop() {
                        self.emails.remove(&record.email);
                        if let Some(phone) = &record.phone {
                            self.phones.remove(phone);
                        }
                        if let Some(req) = &record.requested {
                            if let Some(keys) = self.requests.get_mut(req) {
                                keys.retain(|k| *k != key);
                                if keys.is_empty() {
                                    self.requests.remove(req);
                                }
                            }
                        }
                    }
                }
                JournalEntry::RoleAdded(key) => {
                    if let Some(record) = self.records.get_mut(key.0 as usize) {
                        record.roles.pop();
                    }
                }
                JournalEntry::Counter { base, previous } => match previous {
                    Some(n) => {
                        self.counters.insert(base, n);
                    }
                    None => {
                        self.counters.remove(&base);
                    }
                },
            }
        }
    }

    /// Forget the journal once a batch has committed.
    pub fn commit(&mut self) {
        self.journal.clear();
    }

    /// Record the target ID assigned to a user created in a committed batch.
    pub fn bind(&mut self, key: UserKey, id: TargetId) {
        if let Some(record) = self.records.get_mut(key.0 as usize) {
            record.id = Some(id);
        }
    }

    /// The email a user asked for, when it was disambiguated away.
    pub fn disambiguated_request(&self, key: UserKey) -> Option<&str> {
        let record = self.records.get(key.0 as usize)?;
        record
            .requested
            .as_deref()
            .filter(|requested| *requested != record.email)
    }

    pub fn user_count(&self) -> usize {
        self.records.len()
    }

    pub fn email_of(&self, key: UserKey) -> Option<&str> {
        self.records.get(key.0 as usize).map(|r| r.email.as_str())
    }

    pub fn roles_of(&self, key: UserKey) -> Option<&[Role]> {
        self.records.get(key.0 as usize).map(|r| r.roles.as_slice())
    }
}

fn record_ref(key: UserKey, record: &UserRecord) -> UserRef {
    match record.id {
        Some(id) => UserRef::Id(id),
        None => UserRef::Key(key),
    }
}
