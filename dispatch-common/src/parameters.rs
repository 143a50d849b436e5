//! Typed, validating parameter declarations for model definitions.
//!
//! The original implementation keeps one duck-typed Python class per
//! parameter kind (`StringParameter`, `RangeParameter`, `FloatParameter`,
//! ...), each implementing `withValue`/`asHTML`/`asLatexRow`/... by hand.
//! Here that hierarchy becomes a single tagged sum: one `ParameterKind`
//! variant per kind, one `Parameter` struct carrying the declaration plus
//! an optional current value.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::error::ValidationError;

/// The constraints that are specific to one parameter kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ParameterKind {
    Integer {
        #[serde(skip_serializing_if = "Option::is_none")]
        min: Option<i64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        max: Option<i64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        step: Option<i64>,
    },
    Float {
        #[serde(skip_serializing_if = "Option::is_none")]
        min: Option<f64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        max: Option<f64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        step: Option<f64>,
    },
    Range {
        range_start: f64,
        range_end: f64,
        step: f64,
    },
    String,
    Boolean,
    Select {
        options: Vec<String>,
    },
}

/// The value a parameter carries once it has been accepted by `with_value`.
#[derive(Debug, Clone, PartialEq)]
pub enum ParameterValue {
    Integer(i64),
    Float(f64),
    Range(f64, f64),
    String(String),
    Boolean(bool),
    Select(String),
}

/// A declared parameter, with or without a current value.
///
/// `default` is the raw textual form of the default, applied via
/// `with_value` the first time the definition is loaded -- matching the
/// source's `if default != None: self.setValue(self.default)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Parameter {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub units: String,
    #[serde(default)]
    pub hidden: bool,
    #[serde(default)]
    pub default: Option<String>,
    #[serde(flatten)]
    pub kind: ParameterKind,
    #[serde(skip)]
    pub value: Option<ParameterValue>,
}

/// The name+value pair as it travels over the wire and in the persisted
/// snapshot: `{"name": ..., "value": ...}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SerializedParameter {
    pub name: String,
    pub value: JsonValue,
}

impl Parameter {
    pub fn new(name: impl Into<String>, kind: ParameterKind) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            units: String::new(),
            hidden: false,
            default: None,
            kind,
            value: None,
        }
    }

    /// Apply the declared `default`, if any, returning a value-bearing
    /// copy. Panics only if the embedded default itself is invalid, which
    /// indicates a malformed model definition file caught earlier by the
    /// loader.
    pub fn with_default_applied(mut self) -> Result<Self, ValidationError> {
        if let Some(default) = self.default.clone() {
            self = self.with_value(&default)?;
        }
        Ok(self)
    }

    /// Instantiate a copy of this parameter with a value, or fail with a
    /// `ValidationError` carrying this parameter's name and the offending
    /// raw input. Mirrors `ModelParameter.withValue`.
    pub fn with_value(&self, raw: &str) -> Result<Self, ValidationError> {
        let value = match &self.kind {
            ParameterKind::Integer { min, max, .. } => {
                let parsed: i64 = raw.trim().parse().map_err(|_| ValidationError::WrongType {
                    name: self.name.clone(),
                    value: raw.to_owned(),
                    expected: "integer",
                })?;
                if min.is_some_and(|m| parsed < m) || max.is_some_and(|m| parsed > m) {
                    return Err(ValidationError::OutOfRange {
                        name: self.name.clone(),
                        value: raw.to_owned(),
                    });
                }
                ParameterValue::Integer(parsed)
            }
            ParameterKind::Float { min, max, .. } => {
                let parsed: f64 = raw.trim().parse().map_err(|_| ValidationError::WrongType {
                    name: self.name.clone(),
                    value: raw.to_owned(),
                    expected: "float",
                })?;
                if parsed.is_nan() {
                    return Err(ValidationError::WrongType {
                        name: self.name.clone(),
                        value: raw.to_owned(),
                        expected: "float",
                    });
                }
                if min.is_some_and(|m| parsed < m) || max.is_some_and(|m| parsed > m) {
                    return Err(ValidationError::OutOfRange {
                        name: self.name.clone(),
                        value: raw.to_owned(),
                    });
                }
                ParameterValue::Float(parsed)
            }
            ParameterKind::Range {
                range_start,
                range_end,
                ..
            } => {
                let (start, end) = parse_range(raw).ok_or_else(|| ValidationError::WrongType {
                    name: self.name.clone(),
                    value: raw.to_owned(),
                    expected: "range (start-end)",
                })?;
                if start > end {
                    return Err(ValidationError::RangeInverted {
                        name: self.name.clone(),
                        start,
                        end,
                    });
                }
                if start < *range_start || end > *range_end {
                    return Err(ValidationError::OutOfRange {
                        name: self.name.clone(),
                        value: raw.to_owned(),
                    });
                }
                ParameterValue::Range(start, end)
            }
            ParameterKind::String => ParameterValue::String(raw.to_owned()),
            ParameterKind::Boolean => ParameterValue::Boolean(parse_truthy(raw)),
            ParameterKind::Select { options } => {
                if !options.iter().any(|o| o == raw) {
                    return Err(ValidationError::NotAnOption {
                        name: self.name.clone(),
                        value: raw.to_owned(),
                    });
                }
                ParameterValue::Select(raw.to_owned())
            }
        };

        let mut copy = self.clone();
        copy.value = Some(value);
        Ok(copy)
    }

    /// The value used when a form submission omits this parameter's key
    /// entirely. Only booleans have a meaningful non-exist value (an
    /// unchecked HTML checkbox sends no key at all); everything else is a
    /// missing required value.
    pub fn non_exist_value(&self) -> Result<Self, ValidationError> {
        match self.kind {
            ParameterKind::Boolean => {
                let mut copy = self.clone();
                copy.value = Some(ParameterValue::Boolean(false));
                Ok(copy)
            }
            _ => Err(ValidationError::MissingValue {
                name: self.name.clone(),
            }),
        }
    }

    pub fn serialize(&self) -> Result<SerializedParameter, ValidationError> {
        let value = self
            .value
            .as_ref()
            .ok_or_else(|| ValidationError::MissingValue {
                name: self.name.clone(),
            })?;
        let json = match value {
            ParameterValue::Integer(v) => JsonValue::from(*v),
            ParameterValue::Float(v) => JsonValue::from(*v),
            ParameterValue::Range(start, end) => JsonValue::from(format!("{start}-{end}")),
            ParameterValue::String(v) => JsonValue::from(v.clone()),
            ParameterValue::Boolean(v) => JsonValue::from(*v),
            ParameterValue::Select(v) => JsonValue::from(v.clone()),
        };
        Ok(SerializedParameter {
            name: self.name.clone(),
            value: json,
        })
    }

    /// Reconstitute a value-bearing copy from a `{name, value}` pair, e.g.
    /// as read back out of the persisted snapshot or a worker's task dict.
    /// Mirrors `ModelParameter.fromDict`.
    pub fn deserialize(&self, serialized: &SerializedParameter) -> Result<Self, ValidationError> {
        if serialized.name != self.name {
            return Err(ValidationError::NameMismatch {
                name: self.name.clone(),
                other: serialized.name.clone(),
            });
        }
        let raw = match &serialized.value {
            JsonValue::String(s) => s.clone(),
            JsonValue::Bool(b) => b.to_string(),
            JsonValue::Number(n) => n.to_string(),
            other => other.to_string(),
        };
        self.with_value(&raw)
    }

    pub fn as_text(&self) -> String {
        let value = self.value_string();
        if self.units.is_empty() {
            format!("{}: {}", self.description, value)
        } else {
            format!("{}: {} {}", self.description, value, self.units)
        }
    }

    pub fn as_latex(&self) -> String {
        let value = latex_escape(&self.value_string());
        let units = latex_escape(&self.units);
        if units.is_empty() {
            format!("{} & {}", latex_escape(&self.description), value)
        } else {
            format!("{} & {} {}", latex_escape(&self.description), value, units)
        }
    }

    pub fn as_html(&self) -> String {
        if self.hidden {
            return format!(
                "<input type='hidden' name='{}' value='{}' />",
                self.name,
                self.value_string()
            );
        }

        match &self.kind {
            ParameterKind::Boolean => {
                let checked = matches!(self.value, Some(ParameterValue::Boolean(true)));
                format!(
                    "<label for='{0}'>{1}</label><input type='checkbox' name='{0}'{2}/>",
                    self.name,
                    self.description,
                    if checked { " checked" } else { "" }
                )
            }
            ParameterKind::Select { options } => {
                let selected = self.value_string();
                let opts: String = options
                    .iter()
                    .map(|o| {
                        let sel = if *o == selected { " selected" } else { "" };
                        format!("<option value='{o}'{sel}>{o}</option>")
                    })
                    .collect();
                format!(
                    "<label for='{0}'>{1}</label><select name='{0}'>{2}</select>",
                    self.name, self.description, opts
                )
            }
            _ => format!(
                "<label for='{0}'>{1}</label><input type='text' name='{0}' value='{2}'/> {3}",
                self.name,
                self.description,
                self.value_string(),
                self.units
            ),
        }
    }

    fn value_string(&self) -> String {
        match &self.value {
            None => String::new(),
            Some(ParameterValue::Integer(v)) => v.to_string(),
            Some(ParameterValue::Float(v)) => v.to_string(),
            Some(ParameterValue::Range(start, end)) => format!("{start}-{end}"),
            Some(ParameterValue::String(v)) => v.clone(),
            Some(ParameterValue::Boolean(v)) => v.to_string(),
            Some(ParameterValue::Select(v)) => v.clone(),
        }
    }
}

fn parse_truthy(raw: &str) -> bool {
    matches!(
        raw.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "on" | "yes" | "checked"
    )
}

fn parse_range(raw: &str) -> Option<(f64, f64)> {
    let (start, end) = raw.split_once('-')?;
    Some((start.trim().parse().ok()?, end.trim().parse().ok()?))
}

/// Substitution table for LaTeX-special characters, taken from the
/// source's `latexEscape`. Order matters: the backslash replacement must
/// run before any replacement that introduces new backslashes.
fn latex_escape(input: &str) -> String {
    const TABLE: &[(&str, &str)] = &[
        ("\\", "\\textbackslash "),
        ("<", "\\textless "),
        (">", "\\textgreater "),
        ("~", "\\textasciitilde "),
        ("^", "\\textasciicircum "),
        ("|", "\\docbooktolatexpipe "),
        ("&", "\\&"),
        ("#", "\\#"),
        ("_", "\\_"),
        ("$", "\\$"),
        ("%", "\\%"),
        ("{", "\\{"),
        ("}", "\\}"),
    ];

    TABLE
        .iter()
        .fold(input.to_owned(), |acc, (find, replace)| {
            acc.replace(find, replace)
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn integer_param() -> Parameter {
        let mut p = Parameter::new(
            "nSamples",
            ParameterKind::Integer {
                min: Some(1),
                max: Some(1_000_000),
                step: None,
            },
        );
        p.description = "Number of samples".to_owned();
        p.units = "samples".to_owned();
        p
    }

    #[test]
    fn integer_round_trips_through_serialize() {
        let p = integer_param().with_value("10000").unwrap();
        let serialized = p.serialize().unwrap();
        assert_eq!(serialized.value, JsonValue::from(10000));

        let restored = integer_param().deserialize(&serialized).unwrap();
        assert_eq!(restored.value, Some(ParameterValue::Integer(10000)));
    }

    #[test]
    fn integer_out_of_range_is_rejected() {
        let err = integer_param().with_value("2000000").unwrap_err();
        assert!(matches!(err, ValidationError::OutOfRange { .. }));
    }

    #[test]
    fn integer_not_a_number_is_rejected() {
        let err = integer_param().with_value("banana").unwrap_err();
        assert!(matches!(err, ValidationError::WrongType { .. }));
    }

    #[test]
    fn range_rejects_inverted_bounds() {
        let p = Parameter::new(
            "window",
            ParameterKind::Range {
                range_start: 0.0,
                range_end: 100.0,
                step: 1.0,
            },
        );
        let err = p.with_value("50-10").unwrap_err();
        assert!(matches!(err, ValidationError::RangeInverted { .. }));
    }

    #[test]
    fn range_rejects_outside_declared_bounds() {
        let p = Parameter::new(
            "window",
            ParameterKind::Range {
                range_start: 0.0,
                range_end: 100.0,
                step: 1.0,
            },
        );
        assert!(p.with_value("-5-10").is_err());
        assert!(p.with_value("10-200").is_err());
        assert!(p.with_value("10-90").is_ok());
    }

    #[test]
    fn select_rejects_values_outside_option_set() {
        let p = Parameter::new(
            "distribution",
            ParameterKind::Select {
                options: vec!["normal".to_owned(), "uniform".to_owned()],
            },
        );
        assert!(p.with_value("normal").is_ok());
        let err = p.with_value("gamma").unwrap_err();
        assert!(matches!(err, ValidationError::NotAnOption { .. }));
    }

    #[test]
    fn boolean_non_exist_value_resolves_to_false() {
        let p = Parameter::new("subscribe", ParameterKind::Boolean);
        let resolved = p.non_exist_value().unwrap();
        assert_eq!(resolved.value, Some(ParameterValue::Boolean(false)));
    }

    #[test]
    fn non_boolean_non_exist_value_is_missing_value_error() {
        let p = integer_param();
        let err = p.non_exist_value().unwrap_err();
        assert!(matches!(err, ValidationError::MissingValue { .. }));
    }

    #[test]
    fn deserialize_rejects_name_mismatch() {
        let p = integer_param();
        let serialized = SerializedParameter {
            name: "other".to_owned(),
            value: JsonValue::from(1),
        };
        let err = p.deserialize(&serialized).unwrap_err();
        assert!(matches!(err, ValidationError::NameMismatch { .. }));
    }

    #[test]
    fn latex_escape_applies_full_substitution_table() {
        let p = Parameter::new("x", ParameterKind::String)
            .with_value("50% & 10_2 {a}")
            .unwrap();
        let rendered = p.as_latex();
        assert!(rendered.contains("\\%"));
        assert!(rendered.contains("\\&"));
        assert!(rendered.contains("\\_"));
        assert!(rendered.contains("\\{"));
        assert!(rendered.contains("\\}"));
    }

    #[test]
    fn as_text_includes_description_and_units() {
        let p = integer_param().with_value("42").unwrap();
        assert_eq!(p.as_text(), "Number of samples: 42 samples");
    }

    #[test]
    fn hidden_parameter_renders_hidden_input() {
        let mut p = integer_param();
        p.hidden = true;
        let p = p.with_value("7").unwrap();
        assert!(p.as_html().starts_with("<input type='hidden'"));
    }
}
