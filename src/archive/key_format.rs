use chrono::format::{Item, StrftimeItems};
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use regex::Regex;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum KeyFormatError {
    #[error("key pattern has an unclosed '@' segment: {0}")]
    Unbalanced(String),

    #[error("invalid time format '{0}' in key pattern")]
    InvalidFormat(String),
}

/// Renders blob keys from a pattern mixing literal text with `@…@` segments
/// holding chrono format strings, e.g. `logs/@%Y/%m/%d@/app-@%H-%M-%S@.log`.
#[derive(Debug, Clone)]
pub struct KeyFormatter {
    pattern: String,
    literals: Vec<String>,
    formats: Vec<String>,
    matcher: Regex,
}

impl KeyFormatter {
    pub fn new(pattern: &str) -> Result<Self, KeyFormatError> {
        let mut literals = Vec::new();
        let mut formats = Vec::new();
        for (index, part) in pattern.split('@').enumerate() {
            if index % 2 == 0 {
                literals.push(part.to_string());
            } else {
                formats.push(part.to_string());
            }
        }
        if literals.len() != formats.len() + 1 {
            return Err(KeyFormatError::Unbalanced(pattern.to_string()));
        }

        for format in &formats {
            if StrftimeItems::new(format).any(|item| matches!(item, Item::Error)) {
                return Err(KeyFormatError::InvalidFormat(format.clone()));
            }
        }

        let escaped: Vec<String> = literals.iter().map(|l| regex::escape(l)).collect();
        let matcher = Regex::new(&format!("^{}$", escaped.join("(.+?)")))
            .map_err(|_| KeyFormatError::Unbalanced(pattern.to_string()))?;

        Ok(Self {
            pattern: pattern.to_string(),
            literals,
            formats,
            matcher,
        })
    }

    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    pub fn format(&self, time: DateTime<Utc>) -> String {
        let mut key = String::new();
        for (literal, format) in self.literals.iter().zip(&self.formats) {
            key.push_str(literal);
            key.push_str(&time.format(format).to_string());
        }
        if let Some(last) = self.literals.last() {
            key.push_str(last);
        }
        key
    }

    /// Recover the time a key was rendered from. Date-only patterns resolve
    /// to midnight.
    pub fn parse(&self, key: &str) -> Option<DateTime<Utc>> {
        let captures = self.matcher.captures(key)?;
        let text: String = captures
            .iter()
            .skip(1)
            .flatten()
            .map(|m| m.as_str())
            .collect();
        let format: String = self.formats.concat();

        if let Ok(time) = NaiveDateTime::parse_from_str(&text, &format) {
            return Some(time.and_utc());
        }
        NaiveDate::parse_from_str(&text, &format)
            .ok()
            .and_then(|date| date.and_hms_opt(0, 0, 0))
            .map(|time| time.and_utc())
    }
}
