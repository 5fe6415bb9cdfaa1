//! Admin HTTP API.
//!
//! All resources live under `/api/v1`. Bodies are JSON; errors are
//! `application/problem+json`.

use std::io;

use axum::{
    extract::{FromRequestParts, Path, Query, State},
    http::{request::Parts, StatusCode},
    response::IntoResponse,
    routing::{get, MethodRouter},
    Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::info;

use super::{Admin, AdminError, EntityKind};

/// Prefix of every API route.
pub const API_PREFIX: &str = "/api/v1";

#[derive(Debug, Default, Deserialize)]
pub struct ViewQuery {
    #[serde(default)]
    pub recursive: bool,
}

type ApiResult = Result<Json<Value>, AdminError>;

/// `{name}/rules/{position}`, rejected as problem+json when the position is
/// not an index.
struct EntryPath {
    name: String,
    position: usize,
}

impl<S: Send + Sync> FromRequestParts<S> for EntryPath {
    type Rejection = AdminError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let Path((name, position)) = Path::<(String, usize)>::from_request_parts(parts, state)
            .await
            .map_err(|e| AdminError::BadRequest(e.body_text()))?;
        Ok(Self { name, position })
    }
}

/// Create the admin router.
pub fn router(admin: Admin) -> Router {
    let api = Router::new()
        .route("/rules", get(list_rules).post(add_rule))
        .route("/rules/{name}", get(get_rule).put(update_rule).delete(delete_rule))
        .route("/rules/{name}/path/{*path}", path_routes(EntityKind::Rule))
        .route("/rulelists", get(list_rulelists).post(add_rulelist))
        .route(
            "/rulelists/{name}",
            get(get_rulelist).put(update_rulelist).delete(delete_rulelist),
        )
        .route(
            "/rulelists/{name}/rules/{position}",
            get(get_rulelist_entry)
                .post(insert_rulelist_entry)
                .delete(delete_rulelist_entry),
        )
        .route("/rulelists/{name}/path/{*path}", path_routes(EntityKind::RuleList))
        .route("/routes", get(list_routes).post(add_route))
        .route("/routes/{name}", get(get_route).put(update_route).delete(delete_route))
        .route("/routes/{name}/path/{*path}", path_routes(EntityKind::Route))
        .route("/clusters", get(list_clusters).post(add_cluster))
        .route("/clusters/{name}", get(get_cluster).delete(delete_cluster))
        .route("/clusters/{name}/path/{*path}", path_routes(EntityKind::Cluster))
        .route("/stages", get(list_stages))
        .route("/sessions", get(list_sessions))
        .route("/sessions/{name}", get(get_session).delete(delete_session))
        .route("/sessions/{name}/path/{*path}", path_routes(EntityKind::Session));

    Router::new()
        .route("/healthz", get(healthz))
        .route(API_PREFIX, get(dump))
        .nest(API_PREFIX, api)
        .layer(TraceLayer::new_for_http())
        .with_state(admin)
}

/// Serve the admin API on an already bound listener.
pub async fn serve(listener: TcpListener, admin: Admin) -> io::Result<()> {
    info!(addr = %listener.local_addr()?, "Admin API listening");
    axum::serve(listener, router(admin)).await
}

/// `GET`, `PUT` and `DELETE` on `/{kind}/{name}/path/{*path}`.
fn path_routes(kind: EntityKind) -> MethodRouter<Admin> {
    get(
        move |State(admin): State<Admin>, Path((name, path)): Path<(String, String)>| async move {
            admin.get_path(kind, &name, &format!("/{path}")).await.map(Json)
        },
    )
    .put(
        move |State(admin): State<Admin>,
              Path((name, path)): Path<(String, String)>,
              Json(value): Json<Value>| async move {
            admin
                .set_path(kind, &name, &format!("/{path}"), value)
                .await
                .map(Json)
        },
    )
    .delete(
        move |State(admin): State<Admin>, Path((name, path)): Path<(String, String)>| async move {
            admin
                .delete_path(kind, &name, &format!("/{path}"))
                .await
                .map(Json)
        },
    )
}

fn created(view: Value) -> impl IntoResponse {
    (StatusCode::CREATED, Json(view))
}

async fn healthz() -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "service": "metaproxy",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn dump(State(admin): State<Admin>) -> Json<Value> {
    Json(admin.dump().await)
}

// Rules

async fn list_rules(State(admin): State<Admin>) -> Json<Value> {
    Json(json!({ "items": admin.list_rules() }))
}

async fn get_rule(State(admin): State<Admin>, Path(name): Path<String>) -> ApiResult {
    admin.get_rule(&name).map(Json)
}

async fn add_rule(
    State(admin): State<Admin>,
    Json(def): Json<Value>,
) -> Result<impl IntoResponse, AdminError> {
    admin.add_rule(def).await.map(created)
}

async fn update_rule(
    State(admin): State<Admin>,
    Path(name): Path<String>,
    Json(def): Json<Value>,
) -> ApiResult {
    admin.update_rule(&name, def).await.map(Json)
}

async fn delete_rule(State(admin): State<Admin>, Path(name): Path<String>) -> ApiResult {
    admin.delete_rule(&name).await.map(Json)
}

// RuleLists

async fn list_rulelists(State(admin): State<Admin>, Query(query): Query<ViewQuery>) -> Json<Value> {
    Json(json!({ "items": admin.list_rulelists(query.recursive) }))
}

async fn get_rulelist(
    State(admin): State<Admin>,
    Path(name): Path<String>,
    Query(query): Query<ViewQuery>,
) -> ApiResult {
    admin.get_rulelist(&name, query.recursive).map(Json)
}

async fn add_rulelist(
    State(admin): State<Admin>,
    Json(def): Json<Value>,
) -> Result<impl IntoResponse, AdminError> {
    admin.add_rulelist(def).await.map(created)
}

async fn update_rulelist(
    State(admin): State<Admin>,
    Path(name): Path<String>,
    Json(def): Json<Value>,
) -> ApiResult {
    admin.update_rulelist(&name, def).await.map(Json)
}

async fn delete_rulelist(State(admin): State<Admin>, Path(name): Path<String>) -> ApiResult {
    admin.delete_rulelist(&name).await.map(Json)
}

async fn get_rulelist_entry(
    State(admin): State<Admin>,
    EntryPath { name, position }: EntryPath,
    Query(query): Query<ViewQuery>,
) -> ApiResult {
    admin
        .get_rulelist_entry(&name, position, query.recursive)
        .map(Json)
}

async fn insert_rulelist_entry(
    State(admin): State<Admin>,
    EntryPath { name, position }: EntryPath,
    Json(entry): Json<Value>,
) -> Result<impl IntoResponse, AdminError> {
    admin
        .insert_rulelist_entry(&name, position, entry)
        .await
        .map(created)
}

async fn delete_rulelist_entry(
    State(admin): State<Admin>,
    EntryPath { name, position }: EntryPath,
) -> ApiResult {
    admin.delete_rulelist_entry(&name, position).await.map(Json)
}

// Routes

async fn list_routes(State(admin): State<Admin>, Query(query): Query<ViewQuery>) -> Json<Value> {
    Json(json!({ "items": admin.list_routes(query.recursive) }))
}

async fn get_route(
    State(admin): State<Admin>,
    Path(name): Path<String>,
    Query(query): Query<ViewQuery>,
) -> ApiResult {
    admin.get_route(&name, query.recursive).map(Json)
}

async fn add_route(
    State(admin): State<Admin>,
    Json(def): Json<Value>,
) -> Result<impl IntoResponse, AdminError> {
    admin.add_route(def).await.map(created)
}

async fn update_route(
    State(admin): State<Admin>,
    Path(name): Path<String>,
    Json(def): Json<Value>,
) -> ApiResult {
    admin.update_route(&name, def).await.map(Json)
}

async fn delete_route(State(admin): State<Admin>, Path(name): Path<String>) -> ApiResult {
    admin.delete_route(&name).await.map(Json)
}

// Clusters and stages

async fn list_clusters(State(admin): State<Admin>) -> Json<Value> {
    Json(json!({ "items": admin.list_clusters() }))
}

async fn get_cluster(State(admin): State<Admin>, Path(name): Path<String>) -> ApiResult {
    admin.get_cluster(&name).map(Json)
}

async fn add_cluster(
    State(admin): State<Admin>,
    Json(spec): Json<Value>,
) -> Result<impl IntoResponse, AdminError> {
    admin.add_cluster(spec).await.map(created)
}

async fn delete_cluster(State(admin): State<Admin>, Path(name): Path<String>) -> ApiResult {
    admin.delete_cluster(&name).await.map(Json)
}

async fn list_stages(State(admin): State<Admin>) -> Json<Value> {
    Json(json!({ "items": admin.list_stages() }))
}

// Sessions

async fn list_sessions(State(admin): State<Admin>, Query(query): Query<ViewQuery>) -> Json<Value> {
    Json(json!({ "items": admin.list_sessions(query.recursive).await }))
}

async fn get_session(
    State(admin): State<Admin>,
    Path(name): Path<String>,
    Query(query): Query<ViewQuery>,
) -> ApiResult {
    admin.get_session(&name, query.recursive).await.map(Json)
}

async fn delete_session(State(admin): State<Admin>, Path(name): Path<String>) -> ApiResult {
    admin.delete_session(&name).await.map(Json)
}
