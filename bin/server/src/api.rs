//! Management API.
//!
//! JSON endpoints for defining workflows, inspecting runs and starting new
//! ones. Starting a workflow only publishes a `START_WORKFLOW` event; the
//! decider consumers create the instance.

use crate::db::{Catalog, WorkflowDetail, WorkflowFilter};
use crate::error::ApiError;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::sync::Arc;
use switchyard_core::{IdGenerator, MessageId, WorkflowDefinitionId, WorkflowInstanceId};
use switchyard_messaging::{Envelope, MessageBus, publish_json};
use switchyard_workflow::{
    DefinitionDraft, Parameters, START_WORKFLOW, WorkflowDefinition, WorkflowInstance,
    WorkflowMessage, dispatch_key,
};
use tower_http::trace::TraceLayer;
use tracing::info;

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    catalog: Arc<dyn Catalog>,
    bus: Arc<dyn MessageBus>,
    ids: Arc<IdGenerator>,
    workflow_event_topic: String,
}

impl AppState {
    pub fn new(
        catalog: Arc<dyn Catalog>,
        bus: Arc<dyn MessageBus>,
        ids: Arc<IdGenerator>,
        workflow_event_topic: impl Into<String>,
    ) -> Self {
        Self {
            catalog,
            bus,
            ids,
            workflow_event_topic: workflow_event_topic.into(),
        }
    }
}

/// Builds the API router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route(
            "/workflow-definitions",
            get(list_definitions).post(create_definition),
        )
        .route(
            "/workflow-definitions/{id}",
            get(get_definition).put(update_definition),
        )
        .route("/workflows", get(list_workflows).post(start_workflow))
        .route("/workflows/{id}", get(get_workflow))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

#[derive(Debug, Default, Deserialize)]
struct DefinitionQuery {
    name: Option<String>,
}

async fn list_definitions(
    State(state): State<AppState>,
    Query(query): Query<DefinitionQuery>,
) -> Result<Json<Vec<WorkflowDefinition>>, ApiError> {
    let definitions = state.catalog.list_definitions(query.name.as_deref()).await?;
    Ok(Json(definitions))
}

async fn create_definition(
    State(state): State<AppState>,
    Json(draft): Json<DefinitionDraft>,
) -> Result<(StatusCode, Json<WorkflowDefinition>), ApiError> {
    let definition = draft.build(&state.ids, 1, Utc::now())?;
    state.catalog.create_definition(definition.clone()).await?;
    info!(
        workflow_definition = %definition.name,
        id = %definition.id,
        tasks = definition.tasks.len(),
        "workflow definition created"
    );
    Ok((StatusCode::CREATED, Json(definition)))
}

async fn get_definition(
    State(state): State<AppState>,
    Path(id): Path<WorkflowDefinitionId>,
) -> Result<Json<WorkflowDefinition>, ApiError> {
    state
        .catalog
        .get_definition(id)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::not_found("workflow definition", id))
}

/// Stores `draft` as the next schema version of definition `id`.
async fn update_definition(
    State(state): State<AppState>,
    Path(id): Path<WorkflowDefinitionId>,
    Json(draft): Json<DefinitionDraft>,
) -> Result<Json<WorkflowDefinition>, ApiError> {
    let previous = state
        .catalog
        .get_definition(id)
        .await?
        .ok_or_else(|| ApiError::not_found("workflow definition", id))?;
    if previous.audit.deleted {
        return Err(ApiError::Conflict {
            reason: format!("workflow definition '{id}' has been superseded"),
        });
    }

    let next = draft.build(&state.ids, previous.schema_version + 1, Utc::now())?;
    state
        .catalog
        .replace_definition(&previous, next.clone())
        .await?;
    info!(
        workflow_definition = %next.name,
        previous = %previous.id,
        id = %next.id,
        schema_version = next.schema_version,
        "workflow definition versioned"
    );
    Ok(Json(next))
}

async fn list_workflows(
    State(state): State<AppState>,
    Query(filter): Query<WorkflowFilter>,
) -> Result<Json<Vec<WorkflowInstance>>, ApiError> {
    Ok(Json(state.catalog.list_workflows(&filter).await?))
}

async fn get_workflow(
    State(state): State<AppState>,
    Path(id): Path<WorkflowInstanceId>,
) -> Result<Json<WorkflowDetail>, ApiError> {
    state
        .catalog
        .get_workflow(id)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::not_found("workflow", id))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StartRequest {
    correlation_id: String,
    workflow_def_name: String,
    #[serde(default)]
    input_parameters: Parameters,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct StartAccepted {
    message_id: String,
    correlation_id: String,
}

async fn start_workflow(
    State(state): State<AppState>,
    Json(request): Json<StartRequest>,
) -> Result<(StatusCode, Json<StartAccepted>), ApiError> {
    if request.correlation_id.trim().is_empty() {
        return Err(ApiError::BadRequest {
            reason: "correlationId must not be empty".to_string(),
        });
    }
    let live = state
        .catalog
        .list_definitions(Some(&request.workflow_def_name))
        .await?;
    if live.is_empty() {
        return Err(ApiError::not_found(
            "workflow definition",
            &request.workflow_def_name,
        ));
    }

    let message_id: MessageId = state.ids.next().map_err(|report| ApiError::Internal {
        details: report.to_string(),
    })?;
    let key = dispatch_key(&request.workflow_def_name, &request.correlation_id);
    let envelope = Envelope::new(
        message_id,
        Some(START_WORKFLOW),
        WorkflowMessage::start(
            request.correlation_id.clone(),
            request.workflow_def_name.clone(),
            request.input_parameters,
        ),
    );
    publish_json(
        state.bus.as_ref(),
        &state.workflow_event_topic,
        &key,
        &envelope,
    )
    .await?;

    info!(
        correlation_id = %request.correlation_id,
        workflow_definition = %request.workflow_def_name,
        message_id = %envelope.message_id,
        "workflow start requested"
    );
    Ok((
        StatusCode::ACCEPTED,
        Json(StartAccepted {
            message_id: envelope.message_id,
            correlation_id: request.correlation_id,
        }),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Method, Request, header};
    use switchyard_messaging::InMemoryBus;
    use switchyard_workflow::{
        Decider, InMemoryWorkflowStore, StartOutcome, StartWorkflow, WorkflowStatus,
    };
    use tower::ServiceExt;

    const EVENTS: &str = "workflow-event";

    struct Harness {
        app: Router,
        store: InMemoryWorkflowStore,
        bus: InMemoryBus,
        ids: Arc<IdGenerator>,
    }

    fn harness() -> Harness {
        let ids = Arc::new(IdGenerator::with_node_id(31).expect("node id"));
        let store = InMemoryWorkflowStore::new();
        let bus = InMemoryBus::new();
        let state = AppState::new(
            Arc::new(store.clone()),
            Arc::new(bus.clone()),
            Arc::clone(&ids),
            EVENTS,
        );
        Harness {
            app: router(state),
            store,
            bus,
            ids,
        }
    }

    async fn call(app: &Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let mut request = Request::builder().method(method).uri(uri);
        let body = match body {
            Some(value) => {
                request = request.header(header::CONTENT_TYPE, "application/json");
                Body::from(value.to_string())
            }
            None => Body::empty(),
        };
        let response = app
            .clone()
            .oneshot(request.body(body).expect("request"))
            .await
            .expect("response");
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body");
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).expect("json body")
        };
        (status, value)
    }

    fn order_flow() -> Value {
        json!({
            "name": "order-flow",
            "code": "ORDER_FLOW",
            "inputTemplate": {"currency": "EUR"},
            "tasks": [
                {"name": "reserve", "sink": "workers"},
                {"name": "charge", "sink": "workers", "previousTasks": ["reserve"]}
            ]
        })
    }

    #[tokio::test]
    async fn health_reports_ok() {
        let h = harness();
        let (status, body) = call(&h.app, Method::GET, "/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn created_definition_can_be_listed_and_fetched() {
        let h = harness();
        let (status, created) =
            call(&h.app, Method::POST, "/workflow-definitions", Some(order_flow())).await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(created["schemaVersion"], 1);
        let charge = &created["tasks"][1];
        assert_eq!(charge["previousTaskIds"][0], created["tasks"][0]["id"]);

        let (status, listed) = call(
            &h.app,
            Method::GET,
            "/workflow-definitions?name=order-flow",
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(listed.as_array().map(Vec::len), Some(1));

        let id = created["id"].as_str().expect("string id");
        let (status, fetched) =
            call(&h.app, Method::GET, &format!("/workflow-definitions/{id}"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(fetched["code"], "ORDER_FLOW");
    }

    #[tokio::test]
    async fn invalid_definitions_are_rejected() {
        let h = harness();
        let cyclic = json!({
            "name": "loop",
            "code": "LOOP",
            "tasks": [
                {"name": "a", "sink": "workers", "previousTasks": ["b"]},
                {"name": "b", "sink": "workers", "previousTasks": ["a"]}
            ]
        });
        let (status, body) =
            call(&h.app, Method::POST, "/workflow-definitions", Some(cyclic)).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert!(body["error"].as_str().expect("message").contains("cycle"));
        assert!(h.store.definitions().is_empty());
    }

    #[tokio::test]
    async fn duplicate_names_conflict() {
        let h = harness();
        call(&h.app, Method::POST, "/workflow-definitions", Some(order_flow())).await;
        let (status, _) =
            call(&h.app, Method::POST, "/workflow-definitions", Some(order_flow())).await;
        assert_eq!(status, StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn update_writes_a_new_version() {
        let h = harness();
        let (_, first) =
            call(&h.app, Method::POST, "/workflow-definitions", Some(order_flow())).await;
        let id = first["id"].as_str().expect("string id").to_string();

        let (status, second) = call(
            &h.app,
            Method::PUT,
            &format!("/workflow-definitions/{id}"),
            Some(order_flow()),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(second["schemaVersion"], 2);
        assert_ne!(second["id"], first["id"]);
        assert_ne!(second["tasks"][0]["id"], first["tasks"][0]["id"]);

        let (_, listed) = call(&h.app, Method::GET, "/workflow-definitions", None).await;
        assert_eq!(listed.as_array().map(Vec::len), Some(1));
        assert_eq!(listed[0]["id"], second["id"]);

        let (status, old) =
            call(&h.app, Method::GET, &format!("/workflow-definitions/{id}"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(old["audit"]["deleted"], true);

        let (status, _) = call(
            &h.app,
            Method::PUT,
            &format!("/workflow-definitions/{id}"),
            Some(order_flow()),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn start_publishes_a_keyed_event() {
        let h = harness();
        call(&h.app, Method::POST, "/workflow-definitions", Some(order_flow())).await;

        let request = json!({
            "correlationId": "order-7",
            "workflowDefName": "order-flow",
            "inputParameters": {"orderId": 7}
        });
        let (status, body) = call(&h.app, Method::POST, "/workflows", Some(request)).await;
        assert_eq!(status, StatusCode::ACCEPTED);

        let published = h.bus.published_on(EVENTS);
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].key, "order-flow:order-7");
        let envelope: Envelope<WorkflowMessage> = published[0].decode().expect("envelope");
        assert_eq!(envelope.subject.as_deref(), Some(START_WORKFLOW));
        assert_eq!(body["messageId"], envelope.message_id.as_str());
        let start = StartWorkflow::try_from(envelope.content().expect("content")).expect("start");
        assert_eq!(start.input_parameters["orderId"], 7);
    }

    #[tokio::test]
    async fn start_of_unknown_definition_is_not_found() {
        let h = harness();
        let request = json!({"correlationId": "x", "workflowDefName": "missing"});
        let (status, _) = call(&h.app, Method::POST, "/workflows", Some(request)).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(h.bus.published().is_empty());
    }

    #[tokio::test]
    async fn bus_outage_is_unavailable() {
        let h = harness();
        call(&h.app, Method::POST, "/workflow-definitions", Some(order_flow())).await;
        h.bus.fail_next(1);
        let request = json!({"correlationId": "order-8", "workflowDefName": "order-flow"});
        let (status, body) = call(&h.app, Method::POST, "/workflows", Some(request)).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["error"], "service unavailable");
    }

    #[tokio::test]
    async fn workflows_are_filtered_and_fetched_with_tasks() {
        let h = harness();
        call(&h.app, Method::POST, "/workflow-definitions", Some(order_flow())).await;
        let decider = Decider::new(h.store.clone(), h.bus.clone(), Arc::clone(&h.ids));
        let StartOutcome::Started { workflow_id, .. } = decider
            .start_workflow(StartWorkflow {
                correlation_id: "order-9".into(),
                workflow_def_name: "order-flow".into(),
                input_parameters: Parameters::new(),
            })
            .await
            .expect("start")
        else {
            panic!("definition missing");
        };

        let (status, running) =
            call(&h.app, Method::GET, "/workflows?status=RUNNING", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(running.as_array().map(Vec::len), Some(1));

        let (_, none) = call(
            &h.app,
            Method::GET,
            "/workflows?correlation_id=order-10",
            None,
        )
        .await;
        assert_eq!(none.as_array().map(Vec::len), Some(0));

        let (status, detail) =
            call(&h.app, Method::GET, &format!("/workflows/{workflow_id}"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(detail["correlationId"], "order-9");
        assert_eq!(detail["status"], WorkflowStatus::Running.as_str());
        assert_eq!(detail["tasks"].as_array().map(Vec::len), Some(1));
        assert_eq!(detail["tasks"][0]["taskDefinitionName"], "reserve");
    }

    #[tokio::test]
    async fn unknown_workflow_is_not_found() {
        let h = harness();
        let (status, body) = call(&h.app, Method::GET, "/workflows/12345", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "workflow '12345' not found");
    }
}
