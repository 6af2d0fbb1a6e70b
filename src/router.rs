//! 路由装配：API 路由、中间件与共享状态。

use axum::extract::{Extension, connect_info::ConnectInfo};
use axum::http::Request;
use axum::routing::{get, post, put};
use axum::{Router, middleware};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::trace::{DefaultOnRequest, DefaultOnResponse, TraceLayer};
use tracing::{Level, info_span};

use crate::auth::{self, AuthConfig};
use crate::category;
use crate::files;
use crate::frontend;
use crate::gate::{self, CategoryGate};
use crate::http::{self, resolve_client_ip};
use crate::projects;
use crate::storage::Storage;
use crate::store::MetaStore;
use crate::upload::{self, upload_body_limit};
use crate::version;

/// 路由共享的服务状态。
#[derive(Clone)]
pub struct AppContext {
    pub storage: Arc<Storage>,
    pub store: Arc<MetaStore>,
    pub auth: Arc<AuthConfig>,
    pub gate: Arc<CategoryGate>,
    pub upload_max_size: u64,
}

/// 构建完整路由；调用方还需按监听端口注入 `RequestScheme`。
pub fn build_router(ctx: &AppContext) -> Router {
    const CATEGORY: &str = "/api/projects/{id}/categories/{category}";
    let trust_proxy = ctx.auth.trust_proxy;

    Router::new()
        .route("/api/auth/login", post(auth::auth_login))
        .route("/api/auth/logout", post(auth::auth_logout))
        .route("/api/auth/check", get(auth::auth_check))
        .route("/api/version", get(version::get_version_info))
        .route("/api/categories", get(category::list_categories))
        .route(
            "/api/projects",
            get(projects::list_projects).post(projects::create_project),
        )
        .route(
            "/api/projects/{id}",
            get(projects::get_project)
                .patch(projects::update_project)
                .delete(projects::delete_project),
        )
        .route(
            "/api/projects/{id}/categories",
            get(projects::list_project_categories),
        )
        .route(&format!("{CATEGORY}/count"), get(files::count_files))
        .route(&format!("{CATEGORY}/files"), get(files::list_files))
        .route(
            &format!("{CATEGORY}/files/{{filename}}"),
            get(files::download_file).delete(files::delete_file),
        )
        .route(
            &format!("{CATEGORY}/upload"),
            post(upload::upload_files).layer(upload_body_limit(ctx.upload_max_size)),
        )
        .route(
            &format!("{CATEGORY}/password"),
            put(gate::set_category_password),
        )
        .route(&format!("{CATEGORY}/unlock"), post(gate::unlock_category))
        .fallback(frontend::serve_frontend)
        .layer(middleware::from_fn(auth::admin_middleware))
        .layer(middleware::from_fn(http::add_security_headers))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(move |request: &Request<_>| {
                    let client_ip = request
                        .extensions()
                        .get::<ConnectInfo<SocketAddr>>()
                        .map(|ConnectInfo(addr)| {
                            resolve_client_ip(request.headers(), addr.ip(), trust_proxy)
                                .to_string()
                        })
                        .unwrap_or_else(|| "unknown".to_string());

                    info_span!(
                        env!("CARGO_CRATE_NAME"),
                        client_ip,
                        method = ?request.method(),
                        path = ?request.uri().path(),
                    )
                })
                .on_request(DefaultOnRequest::new().level(Level::DEBUG))
                .on_response(DefaultOnResponse::new().level(Level::DEBUG)),
        )
        .layer(Extension(ctx.storage.clone()))
        .layer(Extension(ctx.store.clone()))
        .layer(Extension(ctx.auth.clone()))
        .layer(Extension(ctx.gate.clone()))
}
