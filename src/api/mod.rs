// The etcd v2 HTTP surface: thin handlers that decode parameters,
// dispatch to the store or the watcher, and package the envelope.

pub mod params;

use axum::extract::{Path, RawQuery, State};
use axum::routing::get;
use axum::{Json, Router};
use tower_http::cors::{Any, CorsLayer};

use crate::kv::watch::ChangeWatcher;
use crate::kv::SqlBackend;
use crate::models::{ActionUpdate, EtcdError, Node};
use params::{normalize_key, DeleteParams, Fields, GetParams, PostParams, SetParams};

#[derive(Clone)]
pub struct AppState {
    pub store: SqlBackend,
    pub watcher: ChangeWatcher,
    pub advertised_urls: Vec<String>,
}

pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/version", get(version))
        .route("/v2/machines", get(machines))
        .route(
            "/v2/keys",
            get(get_root).put(put_root).post(post_root).delete(delete_root),
        )
        .route(
            "/v2/keys/{*key}",
            get(get_key).put(put_key).post(post_key).delete(delete_key),
        )
        .layer(cors)
        .with_state(state)
}

async fn version() -> &'static str {
    "2"
}

async fn machines(State(state): State<AppState>) -> String {
    // etcdctl expects comma-and-space separators here
    state.advertised_urls.join(", ")
}

async fn get_root(
    State(state): State<AppState>,
    RawQuery(query): RawQuery,
) -> Result<Json<ActionUpdate>, EtcdError> {
    do_get(&state, "/".to_string(), query.as_deref()).await.map(Json)
}

async fn get_key(
    State(state): State<AppState>,
    Path(key): Path<String>,
    RawQuery(query): RawQuery,
) -> Result<Json<ActionUpdate>, EtcdError> {
    do_get(&state, normalize_key(&key), query.as_deref()).await.map(Json)
}

async fn put_root(
    State(state): State<AppState>,
    RawQuery(query): RawQuery,
    body: String,
) -> Result<Json<ActionUpdate>, EtcdError> {
    do_put(&state, "/".to_string(), query.as_deref(), &body).await.map(Json)
}

async fn put_key(
    State(state): State<AppState>,
    Path(key): Path<String>,
    RawQuery(query): RawQuery,
    body: String,
) -> Result<Json<ActionUpdate>, EtcdError> {
    do_put(&state, normalize_key(&key), query.as_deref(), &body).await.map(Json)
}

async fn post_root(
    State(state): State<AppState>,
    RawQuery(query): RawQuery,
    body: String,
) -> Result<Json<ActionUpdate>, EtcdError> {
    do_post(&state, "/".to_string(), query.as_deref(), &body).await.map(Json)
}

async fn post_key(
    State(state): State<AppState>,
    Path(key): Path<String>,
    RawQuery(query): RawQuery,
    body: String,
) -> Result<Json<ActionUpdate>, EtcdError> {
    do_post(&state, normalize_key(&key), query.as_deref(), &body).await.map(Json)
}

async fn delete_root(
    State(state): State<AppState>,
    RawQuery(query): RawQuery,
) -> Result<Json<ActionUpdate>, EtcdError> {
    do_delete(&state, "/".to_string(), query.as_deref()).await.map(Json)
}

async fn delete_key(
    State(state): State<AppState>,
    Path(key): Path<String>,
    RawQuery(query): RawQuery,
) -> Result<Json<ActionUpdate>, EtcdError> {
    do_delete(&state, normalize_key(&key), query.as_deref()).await.map(Json)
}

async fn do_get(
    state: &AppState,
    key: String,
    query: Option<&str>,
) -> Result<ActionUpdate, EtcdError> {
    let fields = Fields::parse(query.unwrap_or(""))?;
    let params = GetParams::from_fields(&fields)?;

    if params.wait {
        return state
            .watcher
            .next_change(&key, params.recursive, params.wait_index.unwrap_or(0))
            .await;
    }

    let node = state.store.get(&key, params.recursive, params.sorted).await?;
    Ok(ActionUpdate::new("get", node))
}

async fn do_put(
    state: &AppState,
    key: String,
    query: Option<&str>,
    body: &str,
) -> Result<ActionUpdate, EtcdError> {
    let fields = Fields::merged(query, body)?;
    let params = SetParams::from_fields(&fields)?;
    let condition = params.condition();

    let (node, prev_node) = if params.dir {
        state.store.mk_dir(&key, params.ttl, &condition).await?
    } else if let Some(ttl) = params.ttl {
        state.store.set_ttl(&key, &params.value, ttl, &condition).await?
    } else {
        state.store.set(&key, &params.value, &condition).await?
    };

    Ok(ActionUpdate {
        action: condition.set_action_name().to_string(),
        node,
        prev_node,
    })
}

async fn do_post(
    state: &AppState,
    key: String,
    query: Option<&str>,
    body: &str,
) -> Result<ActionUpdate, EtcdError> {
    let fields = Fields::merged(query, body)?;
    let params = PostParams::from_fields(&fields)?;
    let node = state.store.create_in_order(&key, &params.value, params.ttl).await?;
    Ok(ActionUpdate::new("create", node))
}

async fn do_delete(
    state: &AppState,
    key: String,
    query: Option<&str>,
) -> Result<ActionUpdate, EtcdError> {
    let fields = Fields::parse(query.unwrap_or(""))?;
    let params = DeleteParams::from_fields(&fields)?;
    let condition = params.condition();

    // dir=true also deletes plain files, matching etcd
    let (prev, index) = if params.dir || params.recursive {
        state.store.rm_dir(&key, params.recursive, &condition).await?
    } else {
        state.store.delete(&key, &condition).await?
    };

    Ok(ActionUpdate {
        action: condition.delete_action_name().to_string(),
        node: Node {
            key,
            created_index: prev.created_index,
            modified_index: index,
            ..Default::default()
        },
        prev_node: Some(prev),
    })
}
