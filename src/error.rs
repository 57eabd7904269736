use crate::config::ConfigError;
use crate::expression::ExpressionError;
use crate::fhir::ObservationError;
use crate::pipeline::ImportError;
use crate::template::TemplateError;
use crate::upsert::{FhirStoreError, IdentityError, UpsertError};

#[derive(Debug, thiserror::Error)]
pub enum EmberError {
    #[error(transparent)]
    Expression(#[from] ExpressionError),

    #[error(transparent)]
    Template(#[from] TemplateError),

    #[error(transparent)]
    Observation(#[from] ObservationError),

    #[error(transparent)]
    Store(#[from] FhirStoreError),

    #[error(transparent)]
    Identity(#[from] IdentityError),

    #[error(transparent)]
    Upsert(#[from] UpsertError),

    #[error(transparent)]
    Import(#[from] ImportError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Could not read template file: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T, E = EmberError> = std::result::Result<T, E>;
