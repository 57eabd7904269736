//! Normalized device readings
//!
//! A [`Measurement`] is one reading extracted from a raw device event by a content
//! template. Measurements sharing device, patient, encounter, correlation and type
//! form a [`MeasurementGroup`], the unit handed to FHIR conversion.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A single named value on a measurement
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeasurementProperty {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Measurement {
    #[serde(rename = "type")]
    pub measure_type: String,         // Template type name that produced it
    pub device_id: String,
    pub occurrence_time_utc: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub patient_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub encounter_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    pub properties: Vec<MeasurementProperty>,
}

impl Measurement {
    pub fn new(
        measure_type: impl Into<String>,
        device_id: impl Into<String>,
        occurrence_time_utc: DateTime<Utc>,
    ) -> Self {
        Measurement {
            measure_type: measure_type.into(),
            device_id: device_id.into(),
            occurrence_time_utc,
            patient_id: None,
            encounter_id: None,
            correlation_id: None,
            properties: Vec::new(),
        }
    }

    pub fn add_property(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.properties.push(MeasurementProperty {
            name: name.into(),
            value: value.into(),
        });
    }

    pub fn property(&self, name: &str) -> Option<&str> {
        self.properties
            .iter()
            .find(|p| p.name == name)
            .map(|p| p.value.as_str())
    }

    pub fn group_key(&self) -> MeasurementGroupKey {
        MeasurementGroupKey {
            measure_type: self.measure_type.clone(),
            device_id: self.device_id.clone(),
            patient_id: self.patient_id.clone(),
            encounter_id: self.encounter_id.clone(),
            correlation_id: self.correlation_id.clone(),
        }
    }
}

/// Identity shared by every measurement of a group
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MeasurementGroupKey {
    pub measure_type: String,
    pub device_id: String,
    pub patient_id: Option<String>,
    pub encounter_id: Option<String>,
    pub correlation_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MeasurementGroup {
    key: MeasurementGroupKey,
    measurements: Vec<Measurement>,
}

impl MeasurementGroup {
    pub fn new(key: MeasurementGroupKey) -> Self {
        MeasurementGroup {
            key,
            measurements: Vec::new(),
        }
    }

    /// Partitions measurements by identity key, keeping the order in which keys
    /// were first seen.
    pub fn group(measurements: impl IntoIterator<Item = Measurement>) -> Vec<MeasurementGroup> {
        let mut groups: Vec<MeasurementGroup> = Vec::new();
        let mut index: HashMap<MeasurementGroupKey, usize> = HashMap::new();

        for measurement in measurements {
            let key = measurement.group_key();
            let position = *index.entry(key.clone()).or_insert_with(|| {
                groups.push(MeasurementGroup::new(key));
                groups.len() - 1
            });
            groups[position].measurements.push(measurement);
        }

        groups
    }

    /// Adds a measurement; returns it back when it belongs to another group.
    pub fn push(&mut self, measurement: Measurement) -> Result<(), Measurement> {
        if measurement.group_key() != self.key {
            return Err(measurement);
        }
        self.measurements.push(measurement);
        Ok(())
    }

    pub fn key(&self) -> &MeasurementGroupKey {
        &self.key
    }

    pub fn measure_type(&self) -> &str {
        &self.key.measure_type
    }

    pub fn device_id(&self) -> &str {
        &self.key.device_id
    }

    pub fn patient_id(&self) -> Option<&str> {
        self.key.patient_id.as_deref()
    }

    pub fn encounter_id(&self) -> Option<&str> {
        self.key.encounter_id.as_deref()
    }

    pub fn correlation_id(&self) -> Option<&str> {
        self.key.correlation_id.as_deref()
    }

    pub fn measurements(&self) -> &[Measurement] {
        &self.measurements
    }

    pub fn is_empty(&self) -> bool {
        self.measurements.is_empty()
    }
}
