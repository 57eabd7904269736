use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;
use tracing::{error, info};
use warp::http::StatusCode;
use warp::Filter;

use crate::fhir::Identifier;
use crate::pipeline::{EventReport, FhirImportService};
use crate::upsert::FhirStore;
use crate::validation::TemplateValidator;

#[derive(Debug, Serialize, Deserialize)]
pub struct ApiResponse {
    pub status: String,
    pub message: String,
    pub data: Option<Value>,
}

impl ApiResponse {
    fn success(message: impl Into<String>, data: Value) -> Self {
        ApiResponse {
            status: "success".to_string(),
            message: message.into(),
            data: Some(data),
        }
    }

    fn error(message: impl Into<String>, data: Option<Value>) -> Self {
        ApiResponse {
            status: "error".to_string(),
            message: message.into(),
            data,
        }
    }
}

/// Body of `POST /api/validate`. Mappings are template documents.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ValidateRequest {
    pub device_mapping: Option<Value>,
    pub fhir_mapping: Option<Value>,
    pub device_events: Vec<Value>,
}

type Reply = warp::reply::WithStatus<warp::reply::Json>;

fn reply(response: &ApiResponse, status: StatusCode) -> Reply {
    warp::reply::with_status(warp::reply::json(response), status)
}

pub struct RestApi {
    import: Arc<FhirImportService>,
    validator: Arc<TemplateValidator>,
    store: Arc<dyn FhirStore>,
}

impl RestApi {
    pub fn new(import: Arc<FhirImportService>, validator: Arc<TemplateValidator>, store: Arc<dyn FhirStore>) -> Self {
        RestApi {
            import,
            validator,
            store,
        }
    }

    pub fn routes(&self) -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
        self.post_event()
            .or(self.post_validate())
            .or(self.search_observations())
    }

    fn post_event(&self) -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
        let import = Arc::clone(&self.import);

        warp::path!("api" / "events")
            .and(warp::post())
            .and(warp::body::json())
            .and_then(move |event: Value| {
                let import = Arc::clone(&import);
                async move {
                    let report = import.process_event(&event).await;
                    let data = report_json(&report);
                    let response = if report.is_success() {
                        info!(observations = report.outcomes().count(), "Device event imported");
                        reply(&ApiResponse::success("Device event imported", data), StatusCode::OK)
                    } else {
                        reply(
                            &ApiResponse::error("Device event imported with errors", Some(data)),
                            StatusCode::UNPROCESSABLE_ENTITY,
                        )
                    };
                    Ok::<Reply, Infallible>(response)
                }
            })
    }

    fn post_validate(&self) -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
        let validator = Arc::clone(&self.validator);

        warp::path!("api" / "validate")
            .and(warp::post())
            .and(warp::body::json())
            .map(move |request: ValidateRequest| {
                let device_mapping = request.device_mapping.map(|mapping| mapping.to_string());
                let fhir_mapping = request.fhir_mapping.map(|mapping| mapping.to_string());
                let result = validator.validate(
                    device_mapping.as_deref(),
                    fhir_mapping.as_deref(),
                    &request.device_events,
                );

                match serde_json::to_value(&result) {
                    Ok(data) if result.has_exceptions() => reply(
                        &ApiResponse::error("Validation found problems", Some(data)),
                        StatusCode::OK,
                    ),
                    Ok(data) => reply(&ApiResponse::success("Templates are valid", data), StatusCode::OK),
                    Err(err) => internal_error(err),
                }
            })
    }

    fn search_observations(&self) -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
        let store = Arc::clone(&self.store);

        warp::path!("fhir" / "Observation")
            .and(warp::get())
            .and(warp::query::<HashMap<String, String>>())
            .and_then(move |params: HashMap<String, String>| {
                let store = Arc::clone(&store);
                async move {
                    let Some(token) = params.get("identifier") else {
                        return Ok::<Reply, Infallible>(reply(
                            &ApiResponse::error("The identifier search parameter is required", None),
                            StatusCode::BAD_REQUEST,
                        ));
                    };

                    let identifier = Identifier::from_token(token);
                    let response = match store.search_by_identifier("Observation", &identifier).await {
                        Ok(resources) => {
                            let bundle = json!({
                                "resourceType": "Bundle",
                                "type": "searchset",
                                "total": resources.len(),
                                "entry": resources
                                    .into_iter()
                                    .map(|resource| json!({"resource": resource}))
                                    .collect::<Vec<_>>(),
                            });
                            reply(&ApiResponse::success("Search completed", bundle), StatusCode::OK)
                        }
                        Err(err) => internal_error(err),
                    };
                    Ok(response)
                }
            })
    }
}

fn internal_error(err: impl std::fmt::Display) -> Reply {
    error!(error = %err, "Request failed");
    reply(
        &ApiResponse::error(err.to_string(), None),
        StatusCode::INTERNAL_SERVER_ERROR,
    )
}

fn report_json(report: &EventReport) -> Value {
    let groups: Vec<Value> = report
        .groups
        .iter()
        .map(|group| match &group.result {
            Ok(outcomes) => json!({
                "type": group.key.measure_type,
                "deviceId": group.key.device_id,
                "observations": outcomes
                    .iter()
                    .map(|outcome| json!({
                        "outcome": outcome.as_str(),
                        "id": outcome.observation().id,
                        "identifier": outcome.observation().identifier,
                    }))
                    .collect::<Vec<_>>(),
            }),
            Err(err) => json!({
                "type": group.key.measure_type,
                "deviceId": group.key.device_id,
                "error": err.to_string(),
            }),
        })
        .collect();

    json!({
        "measurementErrors": report
            .measurement_errors
            .iter()
            .map(|err| err.to_string())
            .collect::<Vec<_>>(),
        "groups": groups,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expression::DefaultExpressionEvaluatorFactory;
    use crate::fhir::ObservationProcessor;
    use crate::template::{content_template_factory, fhir_template_factory, CollectionContentTemplate};
    use crate::upsert::{
        FhirResourceIdentityService, IdentityResolution, InMemoryFhirStore, ObservationCache, ObservationUpsertEngine,
    };

    fn create_test_api() -> RestApi {
        let content = content_template_factory(Arc::new(DefaultExpressionEvaluatorFactory::new()))
            .load_value(&json!({
                "templateType": "JsonPathContent",
                "template": {
                    "typeName": "heartrate",
                    "typeMatchExpression": "$..[?(@.heartrate)]",
                    "deviceIdExpression": "$.device",
                    "patientIdExpression": "$.patient",
                    "timestampExpression": "$.time",
                    "values": [{"valueName": "hr", "valueExpression": "$.heartrate", "required": true}]
                }
            }))
            .unwrap();
        let fhir_templates = fhir_template_factory()
            .load_value(&json!({
                "templateType": "CodeValueFhir",
                "template": {
                    "typeName": "heartrate",
                    "codes": [{"code": "8867-4", "system": "http://loinc.org"}],
                    "value": {"valueName": "hr", "valueType": "Quantity", "unit": "bpm"}
                }
            }))
            .unwrap();

        let store: Arc<dyn FhirStore> = Arc::new(InMemoryFhirStore::new());
        let processor = Arc::new(ObservationProcessor::default());
        let import = FhirImportService::new(
            Arc::new(CollectionContentTemplate::new(content)),
            Arc::new(fhir_templates),
            processor.clone(),
            Arc::new(FhirResourceIdentityService::new(store.clone(), IdentityResolution::Create)),
            Arc::new(ObservationUpsertEngine::new(store.clone(), processor, ObservationCache::default())),
        );
        RestApi::new(Arc::new(import), Arc::new(TemplateValidator::default()), store)
    }

    #[tokio::test]
    async fn test_post_event_then_search() {
        let api = create_test_api();
        let routes = api.routes();

        let response = warp::test::request()
            .method("POST")
            .path("/api/events")
            .json(&json!({"body": {"device": "abc", "patient": "p1", "time": "2024-03-01T10:00:00Z", "heartrate": 72}}))
            .reply(&routes)
            .await;
        assert_eq!(response.status(), StatusCode::OK);

        let body: Value = serde_json::from_slice(response.body()).unwrap();
        let observation = &body["data"]["groups"][0]["observations"][0];
        assert_eq!(observation["outcome"], "created");
        let value = observation["identifier"][0]["value"].as_str().unwrap();

        let response = warp::test::request()
            .method("GET")
            .path(&format!("/fhir/Observation?identifier={}", value))
            .reply(&routes)
            .await;
        assert_eq!(response.status(), StatusCode::OK);
        let body: Value = serde_json::from_slice(response.body()).unwrap();
        assert_eq!(body["data"]["total"], 1);
        assert_eq!(body["data"]["entry"][0]["resource"]["valueQuantity"]["value"], 72.0);
    }

    #[tokio::test]
    async fn test_post_event_reports_failures() {
        let routes = create_test_api().routes();

        let response = warp::test::request()
            .method("POST")
            .path("/api/events")
            .json(&json!({"body": {"device": "abc", "patient": "p1", "time": "later", "heartrate": 72}}))
            .reply(&routes)
            .await;
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);

        let body: Value = serde_json::from_slice(response.body()).unwrap();
        assert_eq!(body["status"], "error");
        assert_eq!(body["data"]["measurementErrors"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_search_requires_identifier() {
        let routes = create_test_api().routes();
        let response = warp::test::request()
            .method("GET")
            .path("/fhir/Observation")
            .reply(&routes)
            .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_validate_endpoint() {
        let routes = create_test_api().routes();
        let response = warp::test::request()
            .method("POST")
            .path("/api/validate")
            .json(&json!({
                "deviceMapping": {"templateType": "JsonPathContent", "template": {"typeName": "hr"}}
            }))
            .reply(&routes)
            .await;
        assert_eq!(response.status(), StatusCode::OK);

        let body: Value = serde_json::from_slice(response.body()).unwrap();
        assert_eq!(body["status"], "error");
        assert!(!body["data"]["templateResult"]["exceptions"].as_array().unwrap().is_empty());
    }
}
