//! Per-element and whole-sequence restrictions layered on top of kind
//! coercion (`value.rs`). Quantity bounds apply to the whole sequence;
//! everything here applies per element unless noted.

use regex::Regex;

use crate::query::Query;
use crate::value::{ElementError, Value};

/// A quantity bound on an attribute's whole sequence. Unbounded by default.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Quantity {
    pub min: usize,
    pub max: Option<usize>,
}

impl Default for Quantity {
    fn default() -> Self {
        Quantity { min: 0, max: None }
    }
}

impl Quantity {
    pub fn check(&self, len: usize) -> Result<(), ElementError> {
        if len < self.min {
            return Err(ElementError::QuantityMin { min: self.min });
        }
        if let Some(max) = self.max {
            if len > max {
                return Err(ElementError::QuantityMax { max });
            }
        }
        Ok(())
    }
}

/// Per-element restriction. `Selection` and `Size` are general-purpose (they
/// apply to any kind whose values support set-membership / length,
/// respectively) and are independent of the `Enum`/`LimitedString` element
/// kinds, which reject out-of-bounds values at coercion time instead.
#[derive(Debug, Clone)]
pub enum Restriction {
    /// Inclusive numeric/timestamp/timespan bound.
    Range { min: Option<Value>, max: Option<Value> },
    /// Anchored pattern a string value must fully match.
    RegExp(Regex),
    /// Timestamps must align to a resolution, in seconds (e.g. 86400 = day).
    Resolution { seconds: i64 },
    /// Length bound for strings/blobs/maps.
    Size { min: usize, max: Option<usize> },
    /// Value must be one of an explicit set.
    Selection(Vec<Value>),
    /// Toi-reference target class plus an optional qualification sub-query
    /// the referenced instance must additionally satisfy.
    ToiType { class: String, qualification: Option<Query> },
}

impl Restriction {
    /// Validates a single element. `ToiType` qualification is checked by the
    /// commit engine (it needs a context to run the sub-query against), not
    /// here; this only checks the target class tag if the caller supplies it.
    pub fn check_element(&self, value: &Value, target_class: Option<&str>) -> Result<(), ElementError> {
        match self {
            Restriction::Range { min, max } => {
                if let Some(min) = min {
                    if matches!(value.partial_cmp_value(min), Some(std::cmp::Ordering::Less) | None) {
                        return Err(ElementError::Range);
                    }
                }
                if let Some(max) = max {
                    if matches!(value.partial_cmp_value(max), Some(std::cmp::Ordering::Greater) | None) {
                        return Err(ElementError::Range);
                    }
                }
                Ok(())
            }
            Restriction::RegExp(re) => match value.as_str() {
                Some(s) if re.is_match(s) => Ok(()),
                _ => Err(ElementError::Regexp),
            },
            Restriction::Resolution { seconds } => match value {
                Value::Timestamp(ts) => {
                    if ts.timestamp() % seconds == 0 {
                        Ok(())
                    } else {
                        Err(ElementError::Resolution)
                    }
                }
                _ => Err(ElementError::Resolution),
            },
            Restriction::Size { min, max } => {
                let len = match value {
                    Value::String(s) => s.chars().count(),
                    Value::Blob(b) => b.len_hint(),
                    Value::Map(m) => m.len(),
                    _ => return Err(ElementError::Range),
                };
                if len < *min {
                    return Err(ElementError::QuantityMin { min: *min });
                }
                if let Some(max) = max {
                    if len > *max {
                        return Err(ElementError::QuantityMax { max: *max });
                    }
                }
                Ok(())
            }
            Restriction::Selection(allowed) => {
                if allowed.contains(value) {
                    Ok(())
                } else {
                    Err(ElementError::Selection)
                }
            }
            Restriction::ToiType { class, .. } => match (value, target_class) {
                (Value::ToiRef(_), Some(actual)) if actual == class => Ok(()),
                (Value::ToiRef(_), None) => Ok(()), // class existence checked by caller
                _ => Err(ElementError::ToiType),
            },
        }
    }
}

/// Glob compiler: `*` and `?` compile to `.*`/`.` with the rest of the
/// pattern escaped; anchoring is dropped at either end where the pattern
/// starts/ends with a literal `*`.
pub fn glob_to_regex(pattern: &str, case_insensitive: bool) -> Result<Regex, regex::Error> {
    let mut out = String::new();
    out.push_str(if case_insensitive { "(?i)^" } else { "^" });
    let mut chars = pattern.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '*' => out.push_str(".*"),
            '?' => out.push('.'),
            '\\' => {
                if let Some(next) = chars.next() {
                    out.push_str(&regex::escape(&next.to_string()));
                }
            }
            other => out.push_str(&regex::escape(&other.to_string())),
        }
    }
    out.push('$');
    Regex::new(&out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn glob_star_matches_anything() {
        let re = glob_to_regex("foo*", false).unwrap();
        assert!(re.is_match("foobar"));
        assert!(!re.is_match("barfoo"));
    }

    #[test]
    fn glob_leading_and_trailing_star_is_unanchored_substring() {
        let re = glob_to_regex("*bar*", false).unwrap();
        assert!(re.is_match("xxbarxx"));
    }

    #[test]
    fn range_restriction_rejects_out_of_bounds() {
        let r = Restriction::Range { min: Some(Value::Int(0)), max: Some(Value::Int(10)) };
        assert!(r.check_element(&Value::Int(5), None).is_ok());
        assert!(r.check_element(&Value::Int(11), None).is_err());
    }

    #[test]
    fn size_restriction_checks_string_length() {
        let r = Restriction::Size { min: 1, max: Some(3) };
        assert!(r.check_element(&Value::String("ab".into()), None).is_ok());
        assert!(r.check_element(&Value::String("abcd".into()), None).is_err());
    }
}
