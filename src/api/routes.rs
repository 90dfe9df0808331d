/*
* HTTP routes
* -----------
* Thin axum adapter over LabService. Every handler extracts the caller from
* the x-user-id header, forwards to one service entry point and serializes
* the result. No policy lives here.
*
* GET    /health
* GET    /vms                          POST /vms
* GET    /vms/templates                POST /vms/templates/build
* POST   /vms/templates/{id}/finalize
* GET    /vms/{id}                     GET  /vms/{id}/stats
* POST   /vms/{id}/start|stop|shutdown POST /vms/{id}/console
* POST   /vms/{id}/assign
* GET    /courses                      POST /courses
* GET    /courses/{id}                 POST /courses/{id}/enroll
* POST   /courses/{id}/provision       GET  /courses/{id}/students
* GET    /courses/{id}/assistants      PUT  /courses/{id}/professor
* GET    /users?role=                  GET  /users/{id}
* GET    /resources/isos               POST /resources/isos/download
* GET    /resources/tasks/{upid}       DELETE /resources/tasks/{upid}
* GET    /analytics                    GET  /hypervisor/status
*/

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post, put},
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;

use crate::api::error::ApiError;
use crate::api::middleware::Actor;
use crate::core::{CourseId, UserId, VmRecordId};
use crate::service::{
    AssignVmRequest, BatchReceipt, BuildTemplateRequest, CreateCourseRequest, CreateVmRequest,
    DownloadIsoRequest, LabService,
};
use crate::users::Role;

const MAX_BODY_BYTES: usize = 64 * 1024;

#[derive(Clone)]
pub struct AppState {
    pub service: Arc<LabService>,
}

impl AppState {
    pub fn new(service: LabService) -> Self {
        Self {
            service: Arc::new(service),
        }
    }
}

type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, Deserialize)]
pub struct EmailRequest {
    pub email: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct ProvisionRequest {
    #[serde(default)]
    pub student_email: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct UserFilter {
    #[serde(default)]
    pub role: Option<Role>,
}

pub fn create_router(state: AppState, api_prefix: &str) -> Router {
    let vms = Router::new()
        .route("/", get(list_vms).post(create_vm))
        .route("/templates", get(list_templates))
        .route("/templates/build", post(build_template))
        .route("/templates/{id}/finalize", post(finalize_template))
        .route("/{id}", get(get_vm))
        .route("/{id}/start", post(start_vm))
        .route("/{id}/stop", post(stop_vm))
        .route("/{id}/shutdown", post(shutdown_vm))
        .route("/{id}/stats", get(vm_stats))
        .route("/{id}/console", post(open_console))
        .route("/{id}/assign", post(assign_vm));

    let courses = Router::new()
        .route("/", get(list_courses).post(create_course))
        .route("/{id}", get(course_details))
        .route("/{id}/enroll", post(enroll))
        .route("/{id}/provision", post(provision))
        .route("/{id}/students", get(course_students))
        .route("/{id}/assistants", get(course_assistants))
        .route("/{id}/professor", put(assign_professor));

    let users = Router::new()
        .route("/", get(list_users))
        .route("/{id}", get(user_details));

    let resources = Router::new()
        .route("/isos", get(list_isos))
        .route("/isos/download", post(download_iso))
        .route("/tasks/{upid}", get(task_status).delete(cancel_task));

    let api = Router::new()
        .route("/health", get(health))
        .route("/analytics", get(analytics))
        .route("/hypervisor/status", get(backend_status))
        .nest("/vms", vms)
        .nest("/courses", courses)
        .nest("/users", users)
        .nest("/resources", resources);

    let prefix = api_prefix.trim_end_matches('/');
    let router = if prefix.is_empty() {
        Router::new().merge(api)
    } else {
        Router::new().nest(prefix, api)
    };

    router
        .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.service.health().await)
}

async fn list_vms(State(state): State<AppState>, Actor(actor): Actor) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.service.list_vms(actor).await?))
}

async fn create_vm(
    State(state): State<AppState>,
    Actor(actor): Actor,
    Json(request): Json<CreateVmRequest>,
) -> ApiResult<impl IntoResponse> {
    let vm = state.service.create_course_vm(actor, request).await?;
    Ok((StatusCode::CREATED, Json(vm)))
}

async fn get_vm(
    State(state): State<AppState>,
    Actor(actor): Actor,
    Path(id): Path<VmRecordId>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.service.vm(actor, id).await?))
}

async fn start_vm(
    State(state): State<AppState>,
    Actor(actor): Actor,
    Path(id): Path<VmRecordId>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.service.start_vm(actor, id).await?))
}

async fn stop_vm(
    State(state): State<AppState>,
    Actor(actor): Actor,
    Path(id): Path<VmRecordId>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.service.stop_vm(actor, id).await?))
}

async fn shutdown_vm(
    State(state): State<AppState>,
    Actor(actor): Actor,
    Path(id): Path<VmRecordId>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.service.shutdown_vm(actor, id).await?))
}

async fn vm_stats(
    State(state): State<AppState>,
    Actor(actor): Actor,
    Path(id): Path<VmRecordId>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.service.vm_stats(actor, id).await?))
}

async fn open_console(
    State(state): State<AppState>,
    Actor(actor): Actor,
    Path(id): Path<VmRecordId>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.service.open_console(actor, id).await?))
}

async fn assign_vm(
    State(state): State<AppState>,
    Actor(actor): Actor,
    Path(id): Path<VmRecordId>,
    Json(request): Json<AssignVmRequest>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.service.assign_vm(actor, id, request).await?))
}

async fn list_templates(State(state): State<AppState>, Actor(actor): Actor) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.service.list_templates(actor).await?))
}

async fn build_template(
    State(state): State<AppState>,
    Actor(actor): Actor,
    Json(request): Json<BuildTemplateRequest>,
) -> ApiResult<impl IntoResponse> {
    let vm = state.service.build_template(actor, request).await?;
    Ok((StatusCode::CREATED, Json(vm)))
}

async fn finalize_template(
    State(state): State<AppState>,
    Actor(actor): Actor,
    Path(id): Path<VmRecordId>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.service.finalize_template(actor, id).await?))
}

async fn list_courses(State(state): State<AppState>, Actor(actor): Actor) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.service.list_courses(actor).await?))
}

async fn create_course(
    State(state): State<AppState>,
    Actor(actor): Actor,
    Json(request): Json<CreateCourseRequest>,
) -> ApiResult<impl IntoResponse> {
    let course = state.service.create_course(actor, request).await?;
    Ok((StatusCode::CREATED, Json(course)))
}

async fn course_details(
    State(state): State<AppState>,
    Actor(actor): Actor,
    Path(id): Path<CourseId>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.service.course_details(actor, id).await?))
}

async fn enroll(
    State(state): State<AppState>,
    Actor(actor): Actor,
    Path(id): Path<CourseId>,
    Json(request): Json<EmailRequest>,
) -> ApiResult<impl IntoResponse> {
    // The provisioning handle is dropped here; the batch keeps running.
    let enrollment = state.service.enroll(actor, id, &request.email).await?;
    Ok(Json(enrollment.receipt()))
}

async fn provision(
    State(state): State<AppState>,
    Actor(actor): Actor,
    Path(id): Path<CourseId>,
    request: Option<Json<ProvisionRequest>>,
) -> ApiResult<impl IntoResponse> {
    let request = request.map(|Json(r)| r).unwrap_or_default();
    let batch = state
        .service
        .provision_course(actor, id, request.student_email.as_deref())
        .await?;
    Ok((StatusCode::ACCEPTED, Json(BatchReceipt::from(&batch))))
}

async fn course_students(
    State(state): State<AppState>,
    Actor(actor): Actor,
    Path(id): Path<CourseId>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.service.course_students(actor, id).await?))
}

async fn course_assistants(
    State(state): State<AppState>,
    Actor(actor): Actor,
    Path(id): Path<CourseId>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.service.course_assistants(actor, id).await?))
}

async fn assign_professor(
    State(state): State<AppState>,
    Actor(actor): Actor,
    Path(id): Path<CourseId>,
    Json(request): Json<EmailRequest>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.service.assign_professor(actor, id, &request.email).await?))
}

async fn list_users(
    State(state): State<AppState>,
    Actor(actor): Actor,
    Query(filter): Query<UserFilter>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.service.list_users(actor, filter.role).await?))
}

async fn user_details(
    State(state): State<AppState>,
    Actor(actor): Actor,
    Path(id): Path<UserId>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.service.user_details(actor, id).await?))
}

async fn list_isos(State(state): State<AppState>, Actor(actor): Actor) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.service.list_isos(actor).await?))
}

async fn download_iso(
    State(state): State<AppState>,
    Actor(actor): Actor,
    Json(request): Json<DownloadIsoRequest>,
) -> ApiResult<impl IntoResponse> {
    let handle = state.service.download_iso(actor, request).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({ "task_id": handle.raw, "node": handle.node, "message": "Download started" })),
    ))
}

async fn task_status(
    State(state): State<AppState>,
    Actor(actor): Actor,
    Path(upid): Path<String>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.service.task_status(actor, &upid).await?))
}

async fn cancel_task(
    State(state): State<AppState>,
    Actor(actor): Actor,
    Path(upid): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let cancelled = state.service.cancel_task(actor, &upid).await?;
    Ok(Json(json!({ "task_id": upid, "cancelled": cancelled })))
}

async fn analytics(State(state): State<AppState>, Actor(actor): Actor) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.service.analytics(actor).await?))
}

async fn backend_status(State(state): State<AppState>, Actor(actor): Actor) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.service.backend_status(actor).await?))
}
