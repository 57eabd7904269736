//! Member validation for template bodies
//!
//! serde stops at the first problem it meets, which makes authoring a large mapping
//! document painful. Bodies are therefore walked against a declarative member list
//! first, every violation is collected, and only a clean body is deserialized.

use serde::de::{DeserializeOwned, Deserializer, Error as _};
use serde::Deserialize;
use serde_json::{Map, Value};

use super::TemplateError;
use crate::expression::ExpressionLanguage;

/// JSON shape accepted for a member.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JsonKind {
    String,
    Number,
    Boolean,
    Object,
    Array,
    /// A string, or a number
    StringOrNumber,
    /// A bare string, or `{ "value": string, "language": string }`
    Expression,
    /// A boolean, or the strings `"true"` / `"false"`
    Flag,
    Any,
}

impl JsonKind {
    fn describe(&self) -> &'static str {
        match self {
            JsonKind::String => "string",
            JsonKind::Number => "number",
            JsonKind::Boolean => "boolean",
            JsonKind::Object => "object",
            JsonKind::Array => "array",
            JsonKind::StringOrNumber => "string or number",
            JsonKind::Expression => "expression",
            JsonKind::Flag => "boolean",
            JsonKind::Any => "value",
        }
    }

    fn accepts(&self, value: &Value) -> bool {
        match self {
            JsonKind::String => value.is_string(),
            JsonKind::Number => value.is_number(),
            JsonKind::Boolean => value.is_boolean(),
            JsonKind::Object => value.is_object(),
            JsonKind::Array => value.is_array(),
            JsonKind::StringOrNumber => value.is_string() || value.is_number(),
            JsonKind::Expression => value.is_string() || value.is_object(),
            JsonKind::Flag => match value {
                Value::Bool(_) => true,
                Value::String(s) => parse_flag(s).is_some(),
                _ => false,
            },
            JsonKind::Any => !value.is_null(),
        }
    }
}

/// One expected member of a JSON object.
///
/// For `Object` members the nested rules apply to the member itself; for `Array`
/// members they apply to every element, which must then be an object.
#[derive(Debug, Clone, Copy)]
pub struct MemberRule {
    pub name: &'static str,
    pub kind: JsonKind,
    pub required: bool,
    pub members: &'static [MemberRule],
}

impl MemberRule {
    pub const fn required(name: &'static str, kind: JsonKind) -> Self {
        MemberRule {
            name,
            kind,
            required: true,
            members: &[],
        }
    }

    pub const fn optional(name: &'static str, kind: JsonKind) -> Self {
        MemberRule {
            name,
            kind,
            required: false,
            members: &[],
        }
    }

    pub const fn with_members(self, members: &'static [MemberRule]) -> Self {
        MemberRule { members, ..self }
    }
}

/// Checks `value` against `rules` and returns every violation found.
pub fn check(value: &Value, rules: &[MemberRule]) -> Vec<String> {
    let mut errors = Vec::new();
    match value.as_object() {
        Some(object) => check_object(object, rules, "$", &mut errors),
        None => errors.push(format!("$: expected object, found {}", found(value))),
    }
    errors
}

/// Validates, then deserializes a template body.
pub fn deserialize_checked<T: DeserializeOwned>(
    value: &Value,
    rules: &[MemberRule],
) -> Result<T, TemplateError> {
    let errors = check(value, rules);
    if !errors.is_empty() {
        return Err(TemplateError::invalid(errors));
    }
    serde_json::from_value(value.clone()).map_err(|e| TemplateError::invalid(vec![format!("$: {}", e)]))
}

fn check_object(object: &Map<String, Value>, rules: &[MemberRule], path: &str, errors: &mut Vec<String>) {
    for rule in rules {
        let member_path = format!("{}.{}", path, rule.name);
        let value = match object.get(rule.name) {
            None | Some(Value::Null) => {
                if rule.required {
                    errors.push(format!("{}: required member missing", member_path));
                }
                continue;
            }
            Some(value) => value,
        };

        if !rule.kind.accepts(value) {
            errors.push(format!(
                "{}: expected {}, found {}",
                member_path,
                rule.kind.describe(),
                found(value)
            ));
            continue;
        }

        match (rule.kind, value) {
            (JsonKind::Expression, Value::Object(expression)) => {
                check_expression(expression, &member_path, errors)
            }
            (JsonKind::Object, Value::Object(nested)) if !rule.members.is_empty() => {
                check_object(nested, rule.members, &member_path, errors)
            }
            (JsonKind::Array, Value::Array(items)) if !rule.members.is_empty() => {
                for (index, item) in items.iter().enumerate() {
                    let item_path = format!("{}[{}]", member_path, index);
                    match item.as_object() {
                        Some(nested) => check_object(nested, rule.members, &item_path, errors),
                        None => errors.push(format!("{}: expected object, found {}", item_path, found(item))),
                    }
                }
            }
            _ => {}
        }
    }
}

fn check_expression(expression: &Map<String, Value>, path: &str, errors: &mut Vec<String>) {
    match expression.get("value") {
        Some(Value::String(_)) => {}
        None | Some(Value::Null) => errors.push(format!("{}.value: required member missing", path)),
        Some(other) => errors.push(format!("{}.value: expected string, found {}", path, found(other))),
    }

    match expression.get("language") {
        None | Some(Value::Null) => {}
        Some(Value::String(language)) => {
            if let Err(e) = language.parse::<ExpressionLanguage>() {
                errors.push(format!("{}.language: {}", path, e));
            }
        }
        Some(other) => errors.push(format!("{}.language: expected string, found {}", path, found(other))),
    }
}

fn found(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn parse_flag(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "true" => Some(true),
        "false" => Some(false),
        _ => None,
    }
}

/// Reads a [`JsonKind::Flag`] member.
pub fn deserialize_flag<'de, D: Deserializer<'de>>(deserializer: D) -> Result<bool, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawFlag {
        Bool(bool),
        Text(String),
    }

    match RawFlag::deserialize(deserializer)? {
        RawFlag::Bool(flag) => Ok(flag),
        RawFlag::Text(text) => {
            parse_flag(&text).ok_or_else(|| D::Error::custom(format!("'{}' is not a boolean", text)))
        }
    }
}
