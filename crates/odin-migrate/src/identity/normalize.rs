//! Email, phone, and name normalization applied before identity comparison.

/// Correct common data-entry mistakes and lowercase an email address.
///
/// Returns `None` when the corrected value is still not a plausible address.
pub fn normalize_email(raw: &str) -> Option<String> {
    let mut email: String = raw
        .trim()
        .to_lowercase()
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect();
    while email.contains("@@") {
        email = email.replace("@@", "@");
    }
    email = email.trim_matches('.').to_string();

    if is_valid_email(&email) {
        Some(email)
    } else {
        None
    }
}

/// Structural email check: `local@label.label`, ASCII only, TLD of two or more letters.
pub fn is_valid_email(email: &str) -> bool {
    let Some((local, domain)) = email.split_once('@') else {
        return false;
    };
    if local.is_empty() || local.len() > 64 || domain.contains('@') {
        return false;
    }
    if local.starts_with('.') || local.ends_with('.') || local.contains("..") {
        return false;
    }
    if !local
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || "._%+-'".contains(c))
    {
        return false;
    }

    let labels: Vec<&str> = domain.split('.').collect();
    if labels.len() < 2 {
        return false;
    }
    let labels_ok = labels.iter().all(|label| {
        !label.is_empty()
            && !label.starts_with('-')
            && !label.ends_with('-')
            && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
    });
    let tld = labels[labels.len() - 1];
    labels_ok && tld.len() >= 2 && tld.chars().all(|c| c.is_ascii_alphabetic())
}

/// Reduce a phone number to country code plus digits.
///
/// Local numbers (`0` + 9 digits, or a bare 9-digit subscriber number) get
/// `country_code` prepended. Numbers that already start with the country
/// code are kept. Other international numbers of 8-15 digits are kept as-is.
pub fn normalize_phone(raw: &str, country_code: &str) -> Option<String> {
    let digits: String = raw.chars().filter(|c| c.is_ascii_digit()).collect();
    if digits.is_empty() {
        return None;
    }

    let national_len = 9;
    if digits.len() == national_len + 1 && digits.starts_with('0') {
        return Some(format!("{}{}", country_code, &digits[1..]));
    }
    if digits.len() == national_len && !digits.starts_with('0') {
        return Some(format!("{}{}", country_code, digits));
    }
    if digits.starts_with(country_code) && digits.len() == country_code.len() + national_len {
        return Some(digits);
    }
    if (8..=15).contains(&digits.len()) && !digits.starts_with('0') {
        return Some(digits);
    }
    None
}

/// Name components after splitting and trimming.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct NameParts {
    pub first: String,
    pub middle: Option<String>,
    pub last: Option<String>,
}

/// Split a full name on whitespace.
///
/// One token is a first name only. Two tokens are first and last. With three
/// or more, the first and last tokens bound the name and everything between
/// becomes the middle name.
pub fn split_full_name(full: &str) -> NameParts {
    let tokens: Vec<&str> = full.split_whitespace().collect();
    match tokens.as_slice() {
        [] => NameParts::default(),
        [first] => NameParts {
            first: first.to_string(),
            middle: None,
            last: None,
        },
        [first, last] => NameParts {
            first: first.to_string(),
            middle: None,
            last: Some(last.to_string()),
        },
        [first, middle @ .., last] => NameParts {
            first: first.to_string(),
            middle: Some(middle.join(" ")),
            last: Some(last.to_string()),
        },
    }
}

/// Build name parts from separate columns.
///
/// When only the first-name column is filled and it holds several words,
/// it is treated as a full name and split.
pub fn name_from_columns(first: &str, middle: Option<&str>, last: Option<&str>) -> NameParts {
    let clean = |s: Option<&str>| {
        s.map(|v| v.split_whitespace().collect::<Vec<_>>().join(" "))
            .filter(|v| !v.is_empty())
    };
    let middle = clean(middle);
    let last = clean(last);

    if middle.is_none() && last.is_none() {
        return split_full_name(first);
    }
    NameParts {
        first: clean(Some(first)).unwrap_or_default(),
        middle,
        last,
    }
}

/// Comparison key for "same natural person": lowercased name words, single-spaced.
pub fn person_key(first: &str, middle: Option<&str>, last: Option<&str>) -> String {
    [Some(first), middle, last]
        .into_iter()
        .flatten()
        .flat_map(|part| part.split_whitespace())
        .map(|word| word.to_lowercase())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Lowercase ASCII alphanumerics of `s`, used for synthesized email local parts.
pub fn slug(s: &str) -> String {
    s.chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .map(|c| c.to_ascii_lowercase())
        .collect()
}
