//! Field constraints checked before an entity is written.

use crate::error::{ValidationError, ValidationErrorKind};
use crate::value::{Value, decimal_digits};
use regex::Regex;
use std::collections::HashMap;
use std::sync::{OnceLock, RwLock};

/// A declarative constraint on one scalar field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldConstraint {
    /// Text no longer than `max` characters.
    MaxLength { field: &'static str, max: usize },
    /// Decimal with at most `precision` digits, `scale` of them fractional.
    Decimal {
        field: &'static str,
        precision: usize,
        scale: usize,
    },
    /// Field must be present and not NULL.
    Required { field: &'static str },
    /// Text must match a regular expression.
    Pattern {
        field: &'static str,
        pattern: &'static str,
    },
}

impl FieldConstraint {
    pub const fn field(&self) -> &'static str {
        match *self {
            FieldConstraint::MaxLength { field, .. }
            | FieldConstraint::Decimal { field, .. }
            | FieldConstraint::Required { field }
            | FieldConstraint::Pattern { field, .. } => field,
        }
    }
}

struct RegexCache {
    cache: RwLock<HashMap<&'static str, Regex>>,
}

impl RegexCache {
    fn get_or_compile(&self, pattern: &'static str) -> Result<Regex, regex::Error> {
        {
            let cache = self.cache.read().unwrap_or_else(|e| e.into_inner());
            if let Some(regex) = cache.get(pattern) {
                return Ok(regex.clone());
            }
        }

        let regex = Regex::new(pattern)?;
        let mut cache = self.cache.write().unwrap_or_else(|e| e.into_inner());
        cache.insert(pattern, regex.clone());
        Ok(regex)
    }
}

fn regex_cache() -> &'static RegexCache {
    static CACHE: OnceLock<RegexCache> = OnceLock::new();
    CACHE.get_or_init(|| RegexCache {
        cache: RwLock::new(HashMap::new()),
    })
}

/// Check `row` against `constraints`, collecting every violation.
pub fn validate_row(
    entity: &'static str,
    row: &[(&'static str, Value)],
    constraints: &[FieldConstraint],
) -> Result<(), ValidationError> {
    let mut errors = ValidationError::new(entity);

    for constraint in constraints {
        let value = row
            .iter()
            .find(|(name, _)| *name == constraint.field())
            .map(|(_, v)| v);

        match (*constraint, value) {
            (FieldConstraint::Required { field }, None | Some(Value::Null)) => {
                errors.add(field, ValidationErrorKind::Required, "is required");
            }
            (FieldConstraint::MaxLength { field, max }, Some(Value::Text(text))) => {
                let len = text.chars().count();
                if len > max {
                    errors.add(
                        field,
                        ValidationErrorKind::MaxLength,
                        format!("is {} characters long, at most {} allowed", len, max),
                    );
                }
            }
            (
                FieldConstraint::Decimal {
                    field,
                    precision,
                    scale,
                },
                Some(value @ (Value::Decimal(_) | Value::Int(_) | Value::BigInt(_))),
            ) => {
                let text = match value {
                    Value::Decimal(s) => s.clone(),
                    other => other.to_string(),
                };
                match decimal_digits(&text) {
                    Some((int_digits, frac_digits)) => {
                        if frac_digits > scale || int_digits > precision.saturating_sub(scale) {
                            errors.add(
                                field,
                                ValidationErrorKind::Decimal,
                                format!("{} does not fit decimal({}, {})", text, precision, scale),
                            );
                        }
                    }
                    None => errors.add(
                        field,
                        ValidationErrorKind::Decimal,
                        format!("'{}' is not a decimal number", text),
                    ),
                }
            }
            (FieldConstraint::Pattern { field, pattern }, Some(Value::Text(text))) => {
                match regex_cache().get_or_compile(pattern) {
                    Ok(regex) if regex.is_match(text) => {}
                    Ok(_) => errors.add(
                        field,
                        ValidationErrorKind::Pattern,
                        format!("does not match pattern '{}'", pattern),
                    ),
                    Err(e) => {
                        tracing::warn!(pattern, error = %e, "Invalid constraint pattern");
                        errors.add(
                            field,
                            ValidationErrorKind::Pattern,
                            format!("invalid pattern '{}'", pattern),
                        );
                    }
                }
            }
            _ => {}
        }
    }

    if errors.is_empty() { Ok(()) } else { Err(errors) }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DISH: &[FieldConstraint] = &[
        FieldConstraint::Required { field: "title" },
        FieldConstraint::MaxLength {
            field: "title",
            max: 10,
        },
        FieldConstraint::Decimal {
            field: "amount",
            precision: 5,
            scale: 2,
        },
        FieldConstraint::Pattern {
            field: "unit",
            pattern: r"^[a-z]+$",
        },
    ];

    #[test]
    fn test_valid_row_passes() {
        let row = vec![
            ("title", Value::from("Porridge")),
            ("amount", Value::decimal("250.00")),
            ("unit", Value::from("gram")),
        ];
        assert!(validate_row("dishes", &row, DISH).is_ok());
    }

    #[test]
    fn test_violations_are_collected() {
        let row = vec![
            ("title", Value::from("Breakfast Porridge")),
            ("amount", Value::decimal("1000.5")),
            ("unit", Value::from("Gram")),
        ];
        let err = validate_row("dishes", &row, DISH).unwrap_err();
        let kinds: Vec<_> = err.errors.iter().map(|e| e.kind).collect();
        assert_eq!(
            kinds,
            vec![
                ValidationErrorKind::MaxLength,
                ValidationErrorKind::Decimal,
                ValidationErrorKind::Pattern
            ]
        );
    }

    #[test]
    fn test_required_rejects_null() {
        let row = vec![("title", Value::Null)];
        let err = validate_row("dishes", &row, DISH).unwrap_err();
        assert_eq!(err.errors[0].kind, ValidationErrorKind::Required);
    }

    #[test]
    fn test_decimal_scale() {
        let row = vec![("amount", Value::decimal("1.005"))];
        assert!(validate_row("dishes", &row, DISH).is_err());
        let row = vec![("amount", Value::decimal("999.990"))];
        assert!(validate_row("dishes", &row, DISH).is_ok());
    }
}
