//! FHIR mapping templates
//!
//! A FHIR template describes how the measurements of one type become an
//! Observation: its codes and categories, how measurements are bucketed in time,
//! and how each named value is represented.

use chrono::Duration;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::fmt;

use super::registry::{CollectionTemplateFactory, NamedTemplate, TemplateFactory, TemplateFactoryChain};
use super::schema::{self, JsonKind, MemberRule};
use super::TemplateError;

/// Width of the time windows observations are built for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
pub enum PeriodInterval {
    /// One observation per measurement
    #[default]
    Single,
    Hourly,
    Daily,
}

impl PeriodInterval {
    pub fn from_minutes(minutes: u64) -> Option<Self> {
        match minutes {
            0 => Some(PeriodInterval::Single),
            60 => Some(PeriodInterval::Hourly),
            1440 => Some(PeriodInterval::Daily),
            _ => None,
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "single" | "instance" => Some(PeriodInterval::Single),
            "hourly" | "hour" => Some(PeriodInterval::Hourly),
            "daily" | "day" => Some(PeriodInterval::Daily),
            _ => None,
        }
    }

    /// Window length, `None` for `Single`.
    pub fn duration(&self) -> Option<Duration> {
        match self {
            PeriodInterval::Single => None,
            PeriodInterval::Hourly => Some(Duration::hours(1)),
            PeriodInterval::Daily => Some(Duration::days(1)),
        }
    }
}

impl<'de> Deserialize<'de> for PeriodInterval {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum RawInterval {
            Minutes(u64),
            Name(String),
        }

        let interval = match RawInterval::deserialize(deserializer)? {
            RawInterval::Minutes(minutes) => PeriodInterval::from_minutes(minutes),
            RawInterval::Name(name) => PeriodInterval::from_name(&name)
                .or_else(|| name.trim().parse().ok().and_then(PeriodInterval::from_minutes)),
        };
        interval.ok_or_else(|| serde::de::Error::custom("periodInterval must be Single, Hourly or Daily"))
    }
}

/// A coding as authored in a template.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FhirCode {
    pub code: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FhirCategory {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default)]
    pub codes: Vec<FhirCode>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuantityValueType {
    pub value_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SampledDataValueType {
    pub value_name: String,
    /// Milliseconds between samples
    pub default_period: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StringValueType {
    pub value_name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CodeableConceptValueType {
    pub value_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default)]
    pub codes: Vec<FhirCode>,
}

/// How a named value is represented in FHIR.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "valueType")]
pub enum FhirValueType {
    Quantity(QuantityValueType),
    SampledData(SampledDataValueType),
    String(StringValueType),
    CodeableConcept(CodeableConceptValueType),
}

impl FhirValueType {
    pub fn value_name(&self) -> &str {
        match self {
            FhirValueType::Quantity(v) => &v.value_name,
            FhirValueType::SampledData(v) => &v.value_name,
            FhirValueType::String(v) => &v.value_name,
            FhirValueType::CodeableConcept(v) => &v.value_name,
        }
    }

    pub fn kind(&self) -> FhirValueKind {
        match self {
            FhirValueType::Quantity(_) => FhirValueKind::Quantity,
            FhirValueType::SampledData(_) => FhirValueKind::SampledData,
            FhirValueType::String(_) => FhirValueKind::String,
            FhirValueType::CodeableConcept(_) => FhirValueKind::CodeableConcept,
        }
    }
}

/// Tag of a [`FhirValueType`] variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum FhirValueKind {
    Quantity,
    SampledData,
    String,
    CodeableConcept,
}

impl fmt::Display for FhirValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FhirValueKind::Quantity => "Quantity",
            FhirValueKind::SampledData => "SampledData",
            FhirValueKind::String => "String",
            FhirValueKind::CodeableConcept => "CodeableConcept",
        };
        write!(f, "{}", name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FhirComponentTemplate {
    #[serde(default)]
    pub codes: Vec<FhirCode>,
    pub value: FhirValueType,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CodeValueFhirTemplate {
    pub type_name: String,
    #[serde(default)]
    pub period_interval: PeriodInterval,
    #[serde(default)]
    pub category: Vec<FhirCategory>,
    #[serde(default)]
    pub codes: Vec<FhirCode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<FhirValueType>,
    #[serde(default)]
    pub components: Vec<FhirComponentTemplate>,
}

impl CodeValueFhirTemplate {
    /// Every value template referenced, top-level value first.
    pub fn values(&self) -> impl Iterator<Item = &FhirValueType> {
        self.value
            .iter()
            .chain(self.components.iter().map(|c| &c.value))
    }

    fn violations(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if self.value.is_none() && self.components.is_empty() {
            errors.push("$.value: required member missing".to_string());
        }

        let top_level = self.value.iter().map(|value| ("$.value".to_string(), value));
        let components = self
            .components
            .iter()
            .enumerate()
            .map(|(index, c)| (format!("$.components[{}].value", index), &c.value));

        for (path, value) in top_level.chain(components) {
            if let FhirValueType::SampledData(sampled) = value {
                if sampled.default_period == 0 {
                    errors.push(format!("{}.defaultPeriod: must be greater than zero", path));
                }
            }
        }
        errors
    }
}

/// Tag of a [`FhirTemplate`] variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FhirTemplateKind {
    CodeValue,
}

/// A FHIR mapping template.
#[derive(Debug, Clone, PartialEq)]
pub enum FhirTemplate {
    CodeValue(CodeValueFhirTemplate),
}

impl FhirTemplate {
    pub fn kind(&self) -> FhirTemplateKind {
        match self {
            FhirTemplate::CodeValue(_) => FhirTemplateKind::CodeValue,
        }
    }

    pub fn period_interval(&self) -> PeriodInterval {
        match self {
            FhirTemplate::CodeValue(template) => template.period_interval,
        }
    }
}

impl NamedTemplate for FhirTemplate {
    fn type_name(&self) -> &str {
        match self {
            FhirTemplate::CodeValue(template) => &template.type_name,
        }
    }
}

const CODE_RULES: &[MemberRule] = &[
    MemberRule::required("code", JsonKind::String),
    MemberRule::optional("system", JsonKind::String),
    MemberRule::optional("display", JsonKind::String),
];

const CATEGORY_RULES: &[MemberRule] = &[
    MemberRule::optional("text", JsonKind::String),
    MemberRule::optional("codes", JsonKind::Array).with_members(CODE_RULES),
];

const VALUE_RULES: &[MemberRule] = &[
    MemberRule::required("valueName", JsonKind::String),
    MemberRule::required("valueType", JsonKind::String),
    MemberRule::optional("unit", JsonKind::String),
    MemberRule::optional("system", JsonKind::String),
    MemberRule::optional("code", JsonKind::String),
    MemberRule::optional("defaultPeriod", JsonKind::Number),
    MemberRule::optional("text", JsonKind::String),
    MemberRule::optional("codes", JsonKind::Array).with_members(CODE_RULES),
];

const COMPONENT_RULES: &[MemberRule] = &[
    MemberRule::optional("codes", JsonKind::Array).with_members(CODE_RULES),
    MemberRule::required("value", JsonKind::Object).with_members(VALUE_RULES),
];

const CODE_VALUE_RULES: &[MemberRule] = &[
    MemberRule::required("typeName", JsonKind::String),
    MemberRule::optional("periodInterval", JsonKind::StringOrNumber),
    MemberRule::optional("category", JsonKind::Array).with_members(CATEGORY_RULES),
    MemberRule::optional("codes", JsonKind::Array).with_members(CODE_RULES),
    MemberRule::optional("value", JsonKind::Object).with_members(VALUE_RULES),
    MemberRule::optional("components", JsonKind::Array).with_members(COMPONENT_RULES),
];

pub struct CodeValueFhirTemplateFactory;

impl TemplateFactory<FhirTemplate> for CodeValueFhirTemplateFactory {
    fn target_name(&self) -> &'static str {
        "CodeValueFhir"
    }

    fn create(&self, body: &Value, _chain: &TemplateFactoryChain<FhirTemplate>) -> Result<Vec<FhirTemplate>, TemplateError> {
        let template: CodeValueFhirTemplate = schema::deserialize_checked(body, CODE_VALUE_RULES)?;
        let errors = template.violations();
        if !errors.is_empty() {
            return Err(TemplateError::invalid(errors));
        }
        Ok(vec![FhirTemplate::CodeValue(template)])
    }
}

/// The factory chain for FHIR mapping documents.
pub fn fhir_template_factory() -> TemplateFactoryChain<FhirTemplate> {
    TemplateFactoryChain::new()
        .with(CodeValueFhirTemplateFactory)
        .with(CollectionTemplateFactory::new("CollectionFhir"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn create_test_document() -> Value {
        json!({
            "templateType": "CollectionFhirTemplate",
            "template": [
                {
                    "templateType": "CodeValueFhirTemplate",
                    "template": {
                        "typeName": "heartrate",
                        "periodInterval": "Hourly",
                        "codes": [{"code": "8867-4", "system": "http://loinc.org", "display": "Heart rate"}],
                        "value": {"valueName": "hr", "valueType": "SampledData", "unit": "bpm", "defaultPeriod": 5000}
                    }
                },
                {
                    "templateType": "CodeValueFhir",
                    "template": {
                        "typeName": "bloodpressure",
                        "periodInterval": 0,
                        "category": [{"text": "vital-signs"}],
                        "components": [
                            {"codes": [{"code": "8480-6"}], "value": {"valueName": "systolic", "valueType": "Quantity", "unit": "mmHg"}},
                            {"value": {"valueName": "note", "valueType": "String"}}
                        ]
                    }
                }
            ]
        })
    }

    #[test]
    fn test_collection_document_loads() {
        let collection = fhir_template_factory().load_value(&create_test_document()).unwrap();
        assert_eq!(collection.len(), 2);

        let FhirTemplate::CodeValue(heartrate) = collection.get("heartrate").unwrap();
        assert_eq!(heartrate.type_name, "heartrate");
        assert_eq!(heartrate.period_interval, PeriodInterval::Hourly);
        assert_eq!(heartrate.codes[0].code, "8867-4");
        assert_eq!(
            heartrate.value,
            Some(FhirValueType::SampledData(SampledDataValueType {
                value_name: "hr".to_string(),
                default_period: 5000,
                unit: Some("bpm".to_string()),
            }))
        );

        let FhirTemplate::CodeValue(pressure) = collection.get("BloodPressure").unwrap();
        assert_eq!(pressure.period_interval, PeriodInterval::Single);
        assert!(pressure.value.is_none());
        let kinds: Vec<FhirValueKind> = pressure.values().map(|v| v.kind()).collect();
        assert_eq!(kinds, vec![FhirValueKind::Quantity, FhirValueKind::String]);
    }

    #[test]
    fn test_period_interval_forms() {
        let parse = |value: Value| serde_json::from_value::<PeriodInterval>(value);

        assert_eq!(parse(json!("daily")).unwrap(), PeriodInterval::Daily);
        assert_eq!(parse(json!(60)).unwrap(), PeriodInterval::Hourly);
        assert_eq!(parse(json!("1440")).unwrap(), PeriodInterval::Daily);
        assert!(parse(json!(15)).is_err());
        assert!(parse(json!("weekly")).is_err());
    }

    #[test]
    fn test_missing_value_and_zero_period_are_reported() {
        let chain = fhir_template_factory();

        let err = chain
            .create_from_value(&json!({"templateType": "CodeValueFhir", "template": {"typeName": "x"}}))
            .unwrap_err();
        assert_eq!(err.violations(), &["$.value: required member missing".to_string()]);

        let err = chain
            .create_from_value(&json!({
                "templateType": "CodeValueFhir",
                "template": {"typeName": "x", "value": {"valueName": "v", "valueType": "SampledData", "defaultPeriod": 0}}
            }))
            .unwrap_err();
        assert_eq!(err.violations(), &["$.value.defaultPeriod: must be greater than zero".to_string()]);
    }

    #[test]
    fn test_nested_violations_carry_paths() {
        let err = fhir_template_factory()
            .create_from_value(&json!({
                "templateType": "CodeValueFhir",
                "template": {
                    "codes": [{"system": "http://loinc.org"}],
                    "components": [{"value": {"valueType": "Quantity"}}]
                }
            }))
            .unwrap_err();

        assert_eq!(
            err.violations(),
            &[
                "$.typeName: required member missing".to_string(),
                "$.codes[0].code: required member missing".to_string(),
                "$.components[0].value.valueName: required member missing".to_string(),
            ]
        );
    }

    #[test]
    fn test_unknown_value_type_is_invalid() {
        let err = fhir_template_factory()
            .create_from_value(&json!({
                "templateType": "CodeValueFhir",
                "template": {"typeName": "x", "value": {"valueName": "v", "valueType": "Ratio"}}
            }))
            .unwrap_err();
        assert!(matches!(err, TemplateError::InvalidTemplate { .. }));
    }
}
