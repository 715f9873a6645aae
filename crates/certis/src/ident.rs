//! Sequential, human-readable identifiers.
//!
//! Certificate numbers look like `SHSL/25B/DM/0027` and staff IDs like
//! `SHSL/25/AD/0003`. Everything before the last `/` is the [`Prefix`]; the
//! trailing zero-padded integer is the sequence. Sequences are unique per
//! prefix and are derived from persisted identifiers on every call: the next
//! value is the largest existing sequence plus one, so gaps left by deletions
//! are never back-filled.
//!
//! Picking a candidate and persisting it are separate steps. Callers insert
//! the candidate under a UNIQUE constraint and ask for a fresh candidate when
//! the insert collides, giving up after [`MAX_ATTEMPTS`].

/// Consecutive collisions tolerated before identifier generation fails.
pub const MAX_ATTEMPTS: u32 = 10;

pub const FALLBACK_YEAR: &str = "00";
pub const DEFAULT_DEPARTMENT: &str = "AD";
pub const DEFAULT_COURSE_CODE: &str = "GEN";

const SEQUENCE_WIDTH: usize = 4;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Prefix(String);

impl Prefix {
    /// `{org}/{yy}{batch}/{course}` where `yy` is the year modulo 100.
    pub fn certificate(org: &str, year: i32, batch: char, course: Option<&str>) -> Prefix {
        let yy = year.rem_euclid(100);
        Prefix(format!(
            "{org}/{yy:02}{batch}/{}",
            course_code(course)
        ))
    }

    /// `{org}/{yy}/{dept}`.
    pub fn staff(org: &str, year_of_employment: Option<&str>, role: Option<&str>) -> Prefix {
        Prefix(format!(
            "{org}/{}/{}",
            year_code(year_of_employment),
            department_code(role)
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn identifier(&self, sequence: u32) -> String {
        format!("{}/{:0width$}", self.0, sequence, width = SEQUENCE_WIDTH)
    }

    /// Sequence suffix of `identifier` when it belongs to exactly this prefix.
    pub fn sequence_of(&self, identifier: &str) -> Option<u32> {
        let rest = identifier.strip_prefix(self.0.as_str())?.strip_prefix('/')?;
        if rest.is_empty() || !rest.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        rest.parse().ok()
    }

    pub fn next_sequence<'a, I>(&self, existing: I) -> u32
    where
        I: IntoIterator<Item = &'a str>,
    {
        existing
            .into_iter()
            .filter_map(|id| self.sequence_of(id))
            .max()
            .map_or(1, |max| max.saturating_add(1))
    }

    pub fn next_identifier<'a, I>(&self, existing: I) -> String
    where
        I: IntoIterator<Item = &'a str>,
    {
        self.identifier(self.next_sequence(existing))
    }
}

impl std::fmt::Display for Prefix {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Last two digits of a year such as `"2023"` or `"23"`; `"00"` otherwise.
pub fn year_code(year: Option<&str>) -> String {
    let Some(year) = year.map(str::trim) else {
        return FALLBACK_YEAR.to_string();
    };
    let digits: Vec<char> = year.chars().collect();
    if digits.len() < 2 || !digits.iter().all(char::is_ascii_digit) {
        return FALLBACK_YEAR.to_string();
    }
    digits[digits.len() - 2..].iter().collect()
}

/// First two letters of the role name, upper-cased.
pub fn department_code(role: Option<&str>) -> String {
    let letters: String = role
        .unwrap_or_default()
        .chars()
        .filter(char::is_ascii_alphabetic)
        .take(2)
        .map(|c| c.to_ascii_uppercase())
        .collect();
    if letters.len() == 2 {
        letters
    } else {
        DEFAULT_DEPARTMENT.to_string()
    }
}

/// Upper-cased course code restricted to ASCII alphanumerics and inner `/`.
pub fn course_code(code: Option<&str>) -> String {
    let cleaned: String = code
        .unwrap_or_default()
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '/')
        .map(|c| c.to_ascii_uppercase())
        .collect();
    let cleaned = cleaned.trim_matches('/');
    if cleaned.is_empty() {
        DEFAULT_COURSE_CODE.to_string()
    } else {
        cleaned.to_string()
    }
}
