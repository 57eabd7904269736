//! Emberlink: a template-driven device telemetry to FHIR connector
//!
//! Raw device events are normalized into measurements by content templates,
//! grouped into observation windows, and written as FHIR R4 Observations. Windows
//! that share an identity are merged into the Observation already on the server.

pub mod api;
pub mod config;
pub mod error;
pub mod expression;
pub mod fhir;
pub mod measurement;
pub mod observation;
pub mod pipeline;
pub mod template;
pub mod upsert;
pub mod validation;

pub use error::{EmberError, Result};
