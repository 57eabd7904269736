//! Observation windows
//!
//! An [`ObservationGroup`] holds every value measured for one series within one
//! time window; it is the unit encoded into (or merged with) a single FHIR
//! Observation.

mod grouping;

pub use grouping::{create_observation_groups, window_start};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::collections::BTreeMap;

use crate::measurement::{Measurement, MeasurementGroupKey};

/// Format of the instants in a boundary identity segment.
pub const SEGMENT_TIME_FORMAT: &str = "%Y%m%d%H%M%S%3fZ";

/// Percent-escapes `%` and `.` so a part of a dot-separated identity never
/// contains the separator.
pub fn escape_identity_part(part: &str) -> Cow<'_, str> {
    if !part.contains(['%', '.']) {
        return Cow::Borrowed(part);
    }
    let mut escaped = String::with_capacity(part.len() + 4);
    for c in part.chars() {
        match c {
            '%' => escaped.push_str("%25"),
            '.' => escaped.push_str("%2E"),
            other => escaped.push(other),
        }
    }
    Cow::Owned(escaped)
}

/// Inclusive time window. `start <= end` always holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Boundary {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl Boundary {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        if start <= end {
            Boundary { start, end }
        } else {
            Boundary { start: end, end: start }
        }
    }

    pub fn instant(time: DateTime<Utc>) -> Self {
        Boundary { start: time, end: time }
    }

    pub fn is_instant(&self) -> bool {
        self.start == self.end
    }

    pub fn contains(&self, time: DateTime<Utc>) -> bool {
        self.start <= time && time <= self.end
    }

    /// Smallest boundary covering both; never narrower than either.
    pub fn union(&self, other: &Boundary) -> Boundary {
        Boundary {
            start: self.start.min(other.start),
            end: self.end.max(other.end),
        }
    }

    pub fn include(&mut self, time: DateTime<Utc>) {
        self.start = self.start.min(time);
        self.end = self.end.max(time);
    }
}

/// One timestamped raw value.
pub type TimedValue = (DateTime<Utc>, String);

#[derive(Debug, Clone, PartialEq)]
pub struct ObservationGroup {
    name: String,
    boundary: Boundary,
    device_id: String,
    patient_id: Option<String>,
    encounter_id: Option<String>,
    correlation_id: Option<String>,
    values: BTreeMap<String, Vec<TimedValue>>,
}

impl ObservationGroup {
    pub fn new(key: &MeasurementGroupKey, boundary: Boundary) -> Self {
        ObservationGroup {
            name: key.measure_type.clone(),
            boundary,
            device_id: key.device_id.clone(),
            patient_id: key.patient_id.clone(),
            encounter_id: key.encounter_id.clone(),
            correlation_id: key.correlation_id.clone(),
            values: BTreeMap::new(),
        }
    }

    pub fn add_measurement(&mut self, measurement: &Measurement) {
        for property in &measurement.properties {
            self.values
                .entry(property.name.clone())
                .or_default()
                .push((measurement.occurrence_time_utc, property.value.clone()));
        }
    }

    /// Time-ordered values per property name. Duplicates are kept.
    pub fn get_values(&self) -> BTreeMap<String, Vec<TimedValue>> {
        self.values
            .iter()
            .map(|(name, values)| {
                let mut sorted = values.clone();
                sorted.sort_by_key(|(time, _)| *time);
                (name.clone(), sorted)
            })
            .collect()
    }

    /// Time-ordered values of one property, empty when it was never observed.
    pub fn values_of(&self, name: &str) -> Vec<TimedValue> {
        let mut values = self.values.get(name).cloned().unwrap_or_default();
        values.sort_by_key(|(time, _)| *time);
        values
    }

    pub fn has_value(&self, name: &str) -> bool {
        self.values.get(name).is_some_and(|values| !values.is_empty())
    }

    /// The part of the observation identity that tells windows of one series apart.
    pub fn identity_segment(&self) -> String {
        match &self.correlation_id {
            Some(correlation_id) => escape_identity_part(correlation_id).into_owned(),
            None => format!(
                "{}.{}",
                self.boundary.start.format(SEGMENT_TIME_FORMAT),
                self.boundary.end.format(SEGMENT_TIME_FORMAT)
            ),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn boundary(&self) -> Boundary {
        self.boundary
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn patient_id(&self) -> Option<&str> {
        self.patient_id.as_deref()
    }

    pub fn encounter_id(&self) -> Option<&str> {
        self.encounter_id.as_deref()
    }

    pub fn correlation_id(&self) -> Option<&str> {
        self.correlation_id.as_deref()
    }

    pub(crate) fn boundary_mut(&mut self) -> &mut Boundary {
        &mut self.boundary
    }
}
