//! SampledData resampling
//!
//! Irregular `(timestamp, value)` pairs are placed on a fixed grid aligned to the
//! Unix epoch: slot `n` covers `[n * period, (n + 1) * period)` milliseconds. A
//! series holds the slots from the one containing the start of the observation
//! period through the one containing its end, so data index 0 is the aligned slot
//! the effective start falls in. Every window of a series shares the same slots
//! whatever its own start. When several samples share a slot the latest one wins.
//! Empty slots are written as `E`.
//!
//! Merging decodes the stored series back onto its slots using the stored
//! anchor and period, lays it onto a grid spanning the union of the old and new
//! periods, then lays the new samples over it. A new sample replaces a stored one
//! in the same slot unless the stored one is known to be later.

use chrono::{DateTime, Utc};
use tracing::warn;

use super::{unexpected_element, unexpected_template, FhirValueEncoder, ObservationData};
use crate::fhir::{ElementValue, ObservationError, Quantity, SampledData};
use crate::observation::Boundary;
use crate::template::fhir::SampledDataValueType;
use crate::template::{FhirValueKind, FhirValueType};

/// Largest series a single observation may hold.
pub const MAX_SAMPLE_SLOTS: usize = 1_000_000;

const EMPTY_SLOT: &str = "E";

#[derive(Debug, Clone, Copy)]
pub struct SampledDataValueEncoder {
    max_slots: usize,
}

impl SampledDataValueEncoder {
    pub fn new(max_slots: usize) -> Self {
        SampledDataValueEncoder { max_slots }
    }

    fn template<'t>(&self, template: &'t FhirValueType) -> Result<&'t SampledDataValueType, ObservationError> {
        match template {
            FhirValueType::SampledData(sampled) => Ok(sampled),
            other => Err(unexpected_template(self.kind(), other)),
        }
    }

    fn encode(&self, template: &SampledDataValueType, data: String, period_millis: i64) -> ElementValue {
        ElementValue::SampledData(SampledData {
            origin: Quantity {
                value: Some(0.0),
                unit: template.unit.clone(),
                ..Default::default()
            },
            period: period_millis as f64,
            factor: None,
            lower_limit: None,
            upper_limit: None,
            dimensions: 1,
            data: Some(data),
        })
    }
}

impl Default for SampledDataValueEncoder {
    fn default() -> Self {
        Self::new(MAX_SAMPLE_SLOTS)
    }
}

impl FhirValueEncoder for SampledDataValueEncoder {
    fn kind(&self) -> FhirValueKind {
        FhirValueKind::SampledData
    }

    fn create_value(&self, template: &FhirValueType, data: &ObservationData<'_>) -> Result<ElementValue, ObservationError> {
        let sampled = self.template(template)?;
        let period_millis = template_period(sampled)?;

        let mut grid = SampleGrid::new(data.observation_period, period_millis, self.max_slots, &sampled.value_name)?;
        grid.place_new(data.values, &sampled.value_name)?;

        Ok(self.encode(sampled, grid.encode(), period_millis))
    }

    fn merge_value(
        &self,
        template: &FhirValueType,
        data: &ObservationData<'_>,
        existing: ElementValue,
    ) -> Result<ElementValue, ObservationError> {
        let sampled = self.template(template)?;
        let period_millis = template_period(sampled)?;

        let existing = match existing {
            ElementValue::SampledData(existing) => existing,
            other => return Err(unexpected_element(self.kind(), &other)),
        };
        if existing.dimensions > 1 {
            return Err(ObservationError::not_supported(format!(
                "SampledData with {} dimensions cannot be merged",
                existing.dimensions
            )));
        }

        let existing_period = existing_period_millis(&existing, period_millis);
        let anchor = data
            .existing_period
            .map(|period| period.start)
            .unwrap_or(data.observation_period.start)
            .timestamp_millis();
        let first_stored_slot = anchor.div_euclid(existing_period);
        let existing_data = existing.data.unwrap_or_default();

        let mut grid = SampleGrid::new(data.observation_period, period_millis, self.max_slots, &sampled.value_name)?;
        for (index, token) in decode(&existing_data).enumerate() {
            if token == EMPTY_SLOT {
                continue;
            }
            let slot_start = i64::try_from(index)
                .ok()
                .and_then(|index| first_stored_slot.checked_add(index))
                .and_then(|slot| slot.checked_mul(existing_period));
            // a stored sample was taken no earlier than its slot start or the stored period start
            let placed = slot_start.map_or(false, |millis| grid.place_stored(millis, millis.max(anchor), token));
            if !placed {
                warn!(value_name = %sampled.value_name, ?slot_start, "Stored sample outside of the observation period was dropped");
            }
        }
        grid.place_new(data.values, &sampled.value_name)?;

        Ok(self.encode(sampled, grid.encode(), period_millis))
    }
}

fn template_period(template: &SampledDataValueType) -> Result<i64, ObservationError> {
    i64::try_from(template.default_period)
        .ok()
        .filter(|period| *period > 0)
        .ok_or_else(|| ObservationError::invalid_data(&template.value_name, "defaultPeriod must be a positive number of milliseconds"))
}

/// The period the stored series was written with, falling back to the template's.
fn existing_period_millis(existing: &SampledData, template_period: i64) -> i64 {
    let period = existing.period.round();
    if period.is_finite() && period >= 1.0 && period <= i64::MAX as f64 {
        period as i64
    } else {
        template_period
    }
}

/// Splits stored data on spaces or commas.
fn decode(data: &str) -> impl Iterator<Item = &str> {
    data.split(|c: char| c.is_whitespace() || c == ',')
        .filter(|token| !token.is_empty())
}

#[derive(Debug, Clone, Copy)]
struct Sample<'a> {
    value: &'a str,
    /// Earliest instant, in epoch milliseconds, the sample may have been taken at
    taken_from: i64,
}

struct SampleGrid<'a> {
    boundary: Boundary,
    period_millis: i64,
    first_slot: i64,
    slots: Vec<Option<Sample<'a>>>,
}

impl<'a> SampleGrid<'a> {
    fn new(boundary: Boundary, period_millis: i64, max_slots: usize, value_name: &str) -> Result<Self, ObservationError> {
        let first_slot = boundary.start.timestamp_millis().div_euclid(period_millis);
        let last_slot = boundary.end.timestamp_millis().div_euclid(period_millis);
        let count = usize::try_from(last_slot - first_slot)
            .ok()
            .and_then(|slots| slots.checked_add(1))
            .filter(|slots| *slots <= max_slots)
            .ok_or_else(|| {
                ObservationError::invalid_data(
                    value_name,
                    format!(
                        "a period of {} ms over {} ms needs more than {} samples",
                        period_millis,
                        (boundary.end - boundary.start).num_milliseconds(),
                        max_slots
                    ),
                )
            })?;

        Ok(SampleGrid {
            boundary,
            period_millis,
            first_slot,
            slots: vec![None; count],
        })
    }

    fn slot(&self, millis: i64) -> Option<usize> {
        usize::try_from(millis.div_euclid(self.period_millis) - self.first_slot)
            .ok()
            .filter(|slot| *slot < self.slots.len())
    }

    /// Returns false when the slot starting at `slot_start` lies outside of the grid.
    fn place_stored(&mut self, slot_start: i64, taken_from: i64, value: &'a str) -> bool {
        match self.slot(slot_start) {
            Some(slot) => {
                self.slots[slot] = Some(Sample { value, taken_from });
                true
            }
            None => false,
        }
    }

    /// Places time-ordered window values, validating each as a decimal.
    fn place_new(&mut self, values: &'a [(DateTime<Utc>, String)], value_name: &str) -> Result<(), ObservationError> {
        for (time, raw) in values {
            let value = raw.trim();
            if value.parse::<f64>().is_err() {
                return Err(ObservationError::invalid_data(
                    value_name,
                    format!("'{}' is not a decimal", raw),
                ));
            }

            let millis = time.timestamp_millis();
            let slot = if self.boundary.contains(*time) { self.slot(millis) } else { None };
            let Some(slot) = slot else {
                warn!(value_name, %time, "Sample outside of the observation period was dropped");
                continue;
            };
            let stored_is_later = matches!(self.slots[slot], Some(stored) if stored.taken_from > millis);
            if !stored_is_later {
                self.slots[slot] = Some(Sample { value, taken_from: millis });
            }
        }
        Ok(())
    }

    fn encode(&self) -> String {
        self.slots
            .iter()
            .map(|slot| slot.map_or(EMPTY_SLOT, |sample| sample.value))
            .collect::<Vec<_>>()
            .join(" ")
    }
}
