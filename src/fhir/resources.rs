//! FHIR R4 resources used by the connector
//!
//! Only the elements the connector reads or writes are modelled; every other member
//! of a stored resource is carried through `extra` untouched.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::observation::Boundary;

fn observation_type() -> String {
    "Observation".to_string()
}

fn device_type() -> String {
    "Device".to_string()
}

fn patient_type() -> String {
    "Patient".to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Meta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_updated: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Identifier {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
}

impl Identifier {
    pub fn new(system: impl Into<String>, value: impl Into<String>) -> Self {
        Identifier {
            system: Some(system.into()),
            value: Some(value.into()),
        }
    }

    /// Identifier without a system, as devices often report them.
    pub fn value_only(value: impl Into<String>) -> Self {
        Identifier {
            system: None,
            value: Some(value.into()),
        }
    }

    /// Renders the identifier as a FHIR token search parameter (`system|value`).
    pub fn to_token(&self) -> String {
        match &self.system {
            Some(system) => format!("{}|{}", system, self.value.as_deref().unwrap_or_default()),
            None => self.value.clone().unwrap_or_default(),
        }
    }

    /// Parses a `system|value` or bare `value` token.
    pub fn from_token(token: &str) -> Self {
        match token.split_once('|') {
            Some((system, value)) if !system.is_empty() => Identifier::new(system, value),
            Some((_, value)) => Identifier::value_only(value),
            None => Identifier::value_only(token),
        }
    }

    /// A search identifier without a system matches any system.
    pub fn matches(&self, candidate: &Identifier) -> bool {
        self.value == candidate.value && (self.system.is_none() || self.system == candidate.system)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Coding {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CodeableConcept {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub coding: Vec<Coding>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

impl CodeableConcept {
    pub fn has_coding(&self, system: &str, code: &str) -> bool {
        self.coding
            .iter()
            .any(|c| c.system.as_deref() == Some(system) && c.code.as_deref() == Some(code))
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Quantity {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

/// Fixed-period series of samples (`data` holds space separated decimals,
/// `E`, `L` or `U`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SampledData {
    pub origin: Quantity,
    pub period: f64,                      // Milliseconds between samples
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub factor: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lower_limit: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upper_limit: Option<f64>,
    pub dimensions: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Period {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Reference {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reference: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display: Option<String>,
}

impl Reference {
    pub fn to(resource_type: &str, id: &str) -> Self {
        Reference {
            reference: Some(format!("{}/{}", resource_type, id)),
            display: None,
        }
    }

    /// The id part of a relative `Type/id` reference to `resource_type`.
    pub fn id_of(&self, resource_type: &str) -> Option<&str> {
        self.reference
            .as_deref()?
            .strip_prefix(resource_type)?
            .strip_prefix('/')
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ObservationStatus {
    Registered,
    Preliminary,
    #[default]
    Final,
    Amended,
    Corrected,
    Cancelled,
    EnteredInError,
    Unknown,
}

/// The value of an observation or component.
#[derive(Debug, Clone, PartialEq)]
pub enum ElementValue {
    Quantity(Quantity),
    String(String),
    CodeableConcept(CodeableConcept),
    SampledData(SampledData),
}

impl ElementValue {
    pub fn type_name(&self) -> &'static str {
        match self {
            ElementValue::Quantity(_) => "Quantity",
            ElementValue::String(_) => "String",
            ElementValue::CodeableConcept(_) => "CodeableConcept",
            ElementValue::SampledData(_) => "SampledData",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObservationComponent {
    pub code: CodeableConcept,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value_quantity: Option<Quantity>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value_string: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value_codeable_concept: Option<CodeableConcept>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value_sampled_data: Option<SampledData>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Observation {
    #[serde(default = "observation_type")]
    pub resource_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<Meta>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub identifier: Vec<Identifier>,
    pub status: ObservationStatus,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub category: Vec<CodeableConcept>,
    pub code: CodeableConcept,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<Reference>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encounter: Option<Reference>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device: Option<Reference>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub effective_date_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub effective_period: Option<Period>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub issued: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value_quantity: Option<Quantity>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value_string: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value_codeable_concept: Option<CodeableConcept>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value_sampled_data: Option<SampledData>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub component: Vec<ObservationComponent>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Observation {
    pub fn new(code: CodeableConcept) -> Self {
        Observation {
            resource_type: observation_type(),
            id: None,
            meta: None,
            identifier: Vec::new(),
            status: ObservationStatus::Final,
            category: Vec::new(),
            code,
            subject: None,
            encounter: None,
            device: None,
            effective_date_time: None,
            effective_period: None,
            issued: None,
            value_quantity: None,
            value_string: None,
            value_codeable_concept: None,
            value_sampled_data: None,
            component: Vec::new(),
            extra: Map::new(),
        }
    }

    /// The effective time as a boundary, from either the instant or the period shape.
    pub fn effective_boundary(&self) -> Option<Boundary> {
        if let Some(period) = &self.effective_period {
            return match (period.start, period.end) {
                (Some(start), Some(end)) => Some(Boundary::new(start, end)),
                (Some(time), None) | (None, Some(time)) => Some(Boundary::instant(time)),
                (None, None) => None,
            };
        }
        self.effective_date_time.map(Boundary::instant)
    }

    pub fn set_effective(&mut self, boundary: Boundary) {
        if boundary.is_instant() {
            self.effective_date_time = Some(boundary.start);
            self.effective_period = None;
        } else {
            self.effective_date_time = None;
            self.effective_period = Some(Period {
                start: Some(boundary.start),
                end: Some(boundary.end),
            });
        }
    }

    pub fn value(&self) -> Option<ElementValue> {
        value_of(
            &self.value_quantity,
            &self.value_string,
            &self.value_codeable_concept,
            &self.value_sampled_data,
        )
    }

    pub fn set_value(&mut self, value: Option<ElementValue>) {
        set_value_of(
            value,
            &mut self.value_quantity,
            &mut self.value_string,
            &mut self.value_codeable_concept,
            &mut self.value_sampled_data,
        );
    }

    pub fn version_id(&self) -> Option<&str> {
        self.meta.as_ref()?.version_id.as_deref()
    }
}

impl ObservationComponent {
    pub fn new(code: CodeableConcept, value: ElementValue) -> Self {
        let mut component = ObservationComponent {
            code,
            ..Default::default()
        };
        component.set_value(Some(value));
        component
    }

    pub fn value(&self) -> Option<ElementValue> {
        value_of(
            &self.value_quantity,
            &self.value_string,
            &self.value_codeable_concept,
            &self.value_sampled_data,
        )
    }

    pub fn set_value(&mut self, value: Option<ElementValue>) {
        set_value_of(
            value,
            &mut self.value_quantity,
            &mut self.value_string,
            &mut self.value_codeable_concept,
            &mut self.value_sampled_data,
        );
    }
}

fn value_of(
    quantity: &Option<Quantity>,
    string: &Option<String>,
    concept: &Option<CodeableConcept>,
    sampled: &Option<SampledData>,
) -> Option<ElementValue> {
    if let Some(v) = quantity {
        return Some(ElementValue::Quantity(v.clone()));
    }
    if let Some(v) = string {
        return Some(ElementValue::String(v.clone()));
    }
    if let Some(v) = concept {
        return Some(ElementValue::CodeableConcept(v.clone()));
    }
    sampled.clone().map(ElementValue::SampledData)
}

fn set_value_of(
    value: Option<ElementValue>,
    quantity: &mut Option<Quantity>,
    string: &mut Option<String>,
    concept: &mut Option<CodeableConcept>,
    sampled: &mut Option<SampledData>,
) {
    *quantity = None;
    *string = None;
    *concept = None;
    *sampled = None;
    match value {
        Some(ElementValue::Quantity(v)) => *quantity = Some(v),
        Some(ElementValue::String(v)) => *string = Some(v),
        Some(ElementValue::CodeableConcept(v)) => *concept = Some(v),
        Some(ElementValue::SampledData(v)) => *sampled = Some(v),
        None => {}
    }
}

/// Device, as far as identity resolution needs it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Device {
    #[serde(default = "device_type")]
    pub resource_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub identifier: Vec<Identifier>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub patient: Option<Reference>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Device {
    pub fn new(identifier: Identifier) -> Self {
        Device {
            resource_type: device_type(),
            id: None,
            identifier: vec![identifier],
            patient: None,
            extra: Map::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Patient {
    #[serde(default = "patient_type")]
    pub resource_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub identifier: Vec<Identifier>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Patient {
    pub fn new(identifier: Identifier) -> Self {
        Patient {
            resource_type: patient_type(),
            id: None,
            identifier: vec![identifier],
            extra: Map::new(),
        }
    }
}
