//! 管理员认证：登录会话、密码尝试限流与写操作拦截中间件。

use axum::extract::{Extension, Json, connect_info::ConnectInfo};
use axum::http::{HeaderMap, Method, Request, StatusCode};
use axum::response::Json as JsonResponse;
use axum::{body::Body as AxumBody, middleware};
use axum_extra::extract::{
    CookieJar,
    cookie::{Cookie, SameSite},
};
use cookie::time::Duration as CookieDuration;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::{ADMIN_COOKIE_NAME, MAX_TTL_SECS};
use crate::error::ApiError;
use crate::http::{RequestScheme, is_https_request, resolve_client_ip};

#[derive(Debug)]
pub struct AuthConfig {
    pub admin_password: String,
    pub read_only: bool,
    pub sessions: Mutex<HashMap<String, SessionEntry>>,
    pub session_ttl: Duration,
    pub limiter: LoginLimiter,
    /// 仅在反向代理之后运行时才信任 `x-forwarded-for`。
    pub trust_proxy: bool,
}

#[derive(Debug)]
pub struct SessionEntry {
    pub expires_at: Instant,
}

impl AuthConfig {
    pub fn new(
        admin_password: &str,
        session_ttl: Duration,
        read_only: bool,
        limiter: LoginLimiter,
    ) -> Self {
        Self {
            admin_password: admin_password.trim().to_string(),
            read_only,
            sessions: Mutex::new(HashMap::new()),
            session_ttl,
            limiter,
            trust_proxy: false,
        }
    }

    pub fn with_trust_proxy(mut self, trust_proxy: bool) -> Self {
        self.trust_proxy = trust_proxy;
        self
    }

    /// 限流使用的客户端 IP。
    pub fn client_ip(&self, headers: &HeaderMap, connect_ip: IpAddr) -> IpAddr {
        resolve_client_ip(headers, connect_ip, self.trust_proxy)
    }

    /// 明文比较（两侧均去除首尾空白）。
    pub fn verify_admin_password(&self, candidate: &str) -> bool {
        let candidate = candidate.trim();
        !candidate.is_empty() && candidate == self.admin_password
    }

    async fn is_session_valid(&self, token: &str) -> bool {
        let mut sessions = self.sessions.lock().await;
        let now = Instant::now();
        match sessions.get(token) {
            Some(entry) if entry.expires_at > now => true,
            _ => {
                sessions.remove(token);
                false
            }
        }
    }

    async fn create_session(&self) -> String {
        let token = Uuid::new_v4().to_string();
        let expires_at = expires_after(Instant::now(), self.session_ttl);
        let mut sessions = self.sessions.lock().await;
        sessions.insert(token.clone(), SessionEntry { expires_at });
        token
    }

    async fn remove_session(&self, token: &str) {
        let mut sessions = self.sessions.lock().await;
        sessions.remove(token);
    }
}

/// 按客户端 IP 统计失败的密码尝试，超过阈值后锁定一段时间。
#[derive(Debug)]
pub struct LoginLimiter {
    attempts: Mutex<HashMap<IpAddr, LoginAttempt>>,
    window: Duration,
    max_attempts: u32,
    lockout: Duration,
}

#[derive(Debug)]
struct LoginAttempt {
    window_start: Instant,
    failures: u32,
    locked_until: Option<Instant>,
}

impl LoginAttempt {
    fn fresh(now: Instant) -> Self {
        Self {
            window_start: now,
            failures: 0,
            locked_until: None,
        }
    }
}

impl LoginLimiter {
    pub fn new(max_attempts: u32, window: Duration, lockout: Duration) -> Self {
        Self {
            attempts: Mutex::new(HashMap::new()),
            window,
            max_attempts,
            lockout,
        }
    }

    /// 仍处于锁定期时返回剩余秒数。
    pub async fn check(&self, ip: IpAddr) -> Option<u64> {
        if self.max_attempts == 0 {
            return None;
        }

        let mut attempts = self.attempts.lock().await;
        let now = Instant::now();
        let entry = attempts.entry(ip).or_insert_with(|| LoginAttempt::fresh(now));

        if let Some(locked_until) = entry.locked_until {
            if now < locked_until {
                return Some(locked_until.saturating_duration_since(now).as_secs().max(1));
            }
            *entry = LoginAttempt::fresh(now);
        }

        if now.duration_since(entry.window_start) > self.window {
            *entry = LoginAttempt::fresh(now);
        }

        None
    }

    pub async fn register_failure(&self, ip: IpAddr) {
        if self.max_attempts == 0 {
            return;
        }

        let mut attempts = self.attempts.lock().await;
        let now = Instant::now();
        let entry = attempts.entry(ip).or_insert_with(|| LoginAttempt::fresh(now));

        if now.duration_since(entry.window_start) > self.window {
            *entry = LoginAttempt::fresh(now);
        }

        entry.failures = entry.failures.saturating_add(1);
        if entry.failures >= self.max_attempts {
            entry.locked_until = Some(expires_after(now, self.lockout));
            warn!(client_ip = %ip, "password attempts locked out");
        }
    }

    pub async fn clear(&self, ip: IpAddr) {
        let mut attempts = self.attempts.lock().await;
        attempts.remove(&ip);
    }

    /// 清理过期的失败记录。
    pub async fn prune(&self) {
        let mut attempts = self.attempts.lock().await;
        let now = Instant::now();
        attempts.retain(|_, entry| {
            if let Some(locked_until) = entry.locked_until {
                return locked_until > now;
            }
            now.duration_since(entry.window_start) <= self.window
        });
    }
}

/// 计算过期时间点；过大的时长按上限截断，不会溢出。
pub fn expires_after(now: Instant, ttl: Duration) -> Instant {
    now.checked_add(ttl)
        .or_else(|| now.checked_add(Duration::from_secs(MAX_TTL_SECS)))
        .unwrap_or(now)
}

pub fn cookie_max_age(ttl: Duration) -> CookieDuration {
    CookieDuration::seconds(i64::try_from(ttl.as_secs().min(MAX_TTL_SECS)).unwrap_or(i64::MAX))
}

/// 当前请求者身份，由中间件写入请求扩展。
#[derive(Clone, Copy, Debug, Default)]
pub struct Viewer {
    pub is_admin: bool,
}

/// 认证中间件：识别管理员会话，并拦截非管理员的写操作。
pub async fn admin_middleware(
    Extension(auth): Extension<Arc<AuthConfig>>,
    jar: CookieJar,
    mut req: Request<AxumBody>,
    next: middleware::Next,
) -> Result<axum::response::Response, ApiError> {
    let is_admin = match jar.get(ADMIN_COOKIE_NAME) {
        Some(cookie) => auth.is_session_valid(cookie.value()).await,
        None => false,
    };
    req.extensions_mut().insert(Viewer { is_admin });

    if !requires_admin(req.method(), req.uri().path()) {
        return Ok(next.run(req).await);
    }
    if auth.read_only {
        return Err(ApiError::Forbidden(
            "read-only mode: modifications are disabled".into(),
        ));
    }
    if !is_admin {
        return Err(ApiError::Forbidden("admin access required".into()));
    }
    Ok(next.run(req).await)
}

fn requires_admin(method: &Method, path: &str) -> bool {
    let mutating = matches!(
        *method,
        Method::POST | Method::PUT | Method::PATCH | Method::DELETE
    );
    if !mutating || !path.starts_with("/api/") {
        return false;
    }
    if path == "/api/auth/login" || path == "/api/auth/logout" {
        return false;
    }
    !(*method == Method::POST && is_unlock_path(path))
}

/// 仅匹配 `/api/projects/{id}/categories/{category}/unlock`。
fn is_unlock_path(path: &str) -> bool {
    let segments: Vec<&str> = path.trim_start_matches('/').split('/').collect();
    matches!(
        segments.as_slice(),
        ["api", "projects", project, "categories", category, "unlock"]
            if !project.is_empty() && !category.is_empty()
    )
}

#[derive(Deserialize)]
pub(crate) struct LoginRequest {
    #[serde(default)]
    password: String,
}

/// 登录接口：校验管理员密码并写入会话 Cookie。
pub async fn auth_login(
    Extension(auth): Extension<Arc<AuthConfig>>,
    Extension(scheme): Extension<RequestScheme>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    jar: CookieJar,
    Json(payload): Json<LoginRequest>,
) -> Result<(CookieJar, StatusCode), ApiError> {
    if payload.password.trim().is_empty() {
        return Err(ApiError::BadRequest("password is required".into()));
    }

    let client_ip = auth.client_ip(&headers, addr.ip());
    if let Some(retry_after) = auth.limiter.check(client_ip).await {
        return Err(ApiError::TooManyRequests(retry_after));
    }

    if !auth.verify_admin_password(&payload.password) {
        auth.limiter.register_failure(client_ip).await;
        return Err(ApiError::Unauthorized("invalid password".into()));
    }
    auth.limiter.clear(client_ip).await;

    let token = auth.create_session().await;
    let cookie = Cookie::build((ADMIN_COOKIE_NAME, token))
        .path("/")
        .http_only(true)
        .secure(is_https_request(&headers, scheme))
        .same_site(SameSite::Lax)
        .max_age(cookie_max_age(auth.session_ttl))
        .build();
    info!(client_ip = %client_ip, "admin logged in");
    Ok((jar.add(cookie), StatusCode::NO_CONTENT))
}

/// 登出接口：清理会话并删除 Cookie。
pub async fn auth_logout(
    Extension(auth): Extension<Arc<AuthConfig>>,
    jar: CookieJar,
) -> (CookieJar, StatusCode) {
    if let Some(cookie) = jar.get(ADMIN_COOKIE_NAME) {
        auth.remove_session(cookie.value()).await;
    }

    (
        jar.remove(Cookie::build(ADMIN_COOKIE_NAME).path("/").build()),
        StatusCode::NO_CONTENT,
    )
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthCheckResponse {
    is_admin: bool,
}

pub async fn auth_check(Extension(viewer): Extension<Viewer>) -> JsonResponse<AuthCheckResponse> {
    JsonResponse(AuthCheckResponse {
        is_admin: viewer.is_admin,
    })
}

/// 清理过期会话。
pub async fn prune_expired_sessions(auth: &AuthConfig) {
    let mut sessions = auth.sessions.lock().await;
    let now = Instant::now();
    sessions.retain(|_, entry| entry.expires_at > now);
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn make_auth(max_attempts: u32) -> Arc<AuthConfig> {
        Arc::new(AuthConfig::new(
            " admin123 ",
            Duration::from_secs(60),
            false,
            LoginLimiter::new(
                max_attempts,
                Duration::from_secs(60),
                Duration::from_secs(60),
            ),
        ))
    }

    fn client() -> ConnectInfo<SocketAddr> {
        ConnectInfo(SocketAddr::from(([192, 0, 2, 10], 40000)))
    }

    async fn login(
        auth: &Arc<AuthConfig>,
        password: &str,
    ) -> Result<(CookieJar, StatusCode), ApiError> {
        login_via(auth, password, RequestScheme::Http, HeaderMap::new()).await
    }

    async fn login_via(
        auth: &Arc<AuthConfig>,
        password: &str,
        scheme: RequestScheme,
        headers: HeaderMap,
    ) -> Result<(CookieJar, StatusCode), ApiError> {
        auth_login(
            Extension(auth.clone()),
            Extension(scheme),
            client(),
            headers,
            CookieJar::new(),
            Json(LoginRequest {
                password: password.to_string(),
            }),
        )
        .await
    }

    #[test]
    fn password_comparison_trims_both_sides() {
        let auth = make_auth(5);
        assert!(auth.verify_admin_password("admin123"));
        assert!(auth.verify_admin_password("  admin123\n"));
        assert!(!auth.verify_admin_password("admin1234"));
        assert!(!auth.verify_admin_password(""));
    }

    #[tokio::test]
    async fn login_sets_session_cookie() {
        let auth = make_auth(5);
        let (jar, status) = login(&auth, "admin123")
            .await
            .unwrap_or_else(|_| panic!("login failed"));
        assert_eq!(status, StatusCode::NO_CONTENT);
        let cookie = jar.get(ADMIN_COOKIE_NAME).expect("session cookie");
        assert_eq!(cookie.http_only(), Some(true));
        assert_eq!(cookie.same_site(), Some(SameSite::Lax));
        assert!(auth.is_session_valid(cookie.value()).await);
    }

    #[tokio::test]
    async fn login_rejects_blank_and_wrong_passwords() {
        let auth = make_auth(5);
        assert!(matches!(login(&auth, "  ").await, Err(ApiError::BadRequest(_))));
        assert!(matches!(login(&auth, "guess").await, Err(ApiError::Unauthorized(_))));
        assert!(auth.sessions.lock().await.is_empty());
    }

    #[tokio::test]
    async fn repeated_failures_lock_out_client() {
        let auth = make_auth(2);
        assert!(matches!(login(&auth, "a").await, Err(ApiError::Unauthorized(_))));
        assert!(matches!(login(&auth, "b").await, Err(ApiError::Unauthorized(_))));
        let locked = login(&auth, "admin123").await;
        assert!(matches!(locked, Err(ApiError::TooManyRequests(secs)) if secs > 0));
    }

    #[tokio::test]
    async fn session_cookie_is_secure_over_https() {
        let auth = make_auth(5);
        let secure = |jar: &CookieJar| jar.get(ADMIN_COOKIE_NAME).and_then(|c| c.secure());

        let (jar, _) = login(&auth, "admin123")
            .await
            .unwrap_or_else(|_| panic!("login failed"));
        assert_eq!(secure(&jar), Some(false));

        let (jar, _) = login_via(&auth, "admin123", RequestScheme::Https, HeaderMap::new())
            .await
            .unwrap_or_else(|_| panic!("login failed"));
        assert_eq!(secure(&jar), Some(true));

        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-proto", HeaderValue::from_static("https"));
        let (jar, _) = login_via(&auth, "admin123", RequestScheme::Http, headers)
            .await
            .unwrap_or_else(|_| panic!("login failed"));
        assert_eq!(secure(&jar), Some(true));
    }

    #[tokio::test]
    async fn forwarded_for_is_ignored_unless_proxy_is_trusted() {
        let auth = make_auth(2);
        for i in 0..2u8 {
            let mut headers = HeaderMap::new();
            headers.insert(
                "x-forwarded-for",
                HeaderValue::from_str(&format!("10.0.0.{i}")).expect("header"),
            );
            let result = login_via(&auth, "wrong", RequestScheme::Http, headers).await;
            assert!(matches!(result, Err(ApiError::Unauthorized(_))));
        }
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", HeaderValue::from_static("10.0.0.99"));
        let locked = login_via(&auth, "admin123", RequestScheme::Http, headers).await;
        assert!(matches!(locked, Err(ApiError::TooManyRequests(_))));

        let proxied = AuthConfig::new(
            "admin123",
            Duration::from_secs(60),
            false,
            LoginLimiter::new(5, Duration::from_secs(60), Duration::from_secs(60)),
        )
        .with_trust_proxy(true);
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", HeaderValue::from_static("203.0.113.5"));
        let connect_ip: IpAddr = "127.0.0.1".parse().expect("ip");
        assert_eq!(
            proxied.client_ip(&headers, connect_ip),
            "203.0.113.5".parse::<IpAddr>().expect("ip")
        );
        assert_eq!(auth.client_ip(&headers, connect_ip), connect_ip);
    }

    #[test]
    fn huge_ttls_do_not_overflow() {
        let now = Instant::now();
        assert!(expires_after(now, Duration::MAX) >= now);
        assert_eq!(
            cookie_max_age(Duration::MAX),
            CookieDuration::seconds(MAX_TTL_SECS as i64)
        );
        assert_eq!(
            cookie_max_age(Duration::from_secs(90)),
            CookieDuration::seconds(90)
        );
    }

    #[tokio::test]
    async fn logout_invalidates_session() {
        let auth = make_auth(5);
        let (jar, _) = login(&auth, "admin123")
            .await
            .unwrap_or_else(|_| panic!("login failed"));
        let token = jar.get(ADMIN_COOKIE_NAME).expect("cookie").value().to_string();

        let (_jar, status) = auth_logout(Extension(auth.clone()), jar).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        assert!(!auth.is_session_valid(&token).await);
    }

    #[tokio::test]
    async fn expired_sessions_are_pruned() {
        let auth = make_auth(5);
        auth.sessions.lock().await.insert(
            "stale".to_string(),
            SessionEntry {
                expires_at: Instant::now(),
            },
        );
        prune_expired_sessions(&auth).await;
        assert!(auth.sessions.lock().await.is_empty());
    }

    #[test]
    fn only_mutating_api_requests_need_admin() {
        assert!(requires_admin(&Method::POST, "/api/projects"));
        assert!(requires_admin(
            &Method::DELETE,
            "/api/projects/p1/categories/other/files/x"
        ));
        assert!(requires_admin(
            &Method::PUT,
            "/api/projects/p1/categories/other/password"
        ));
        assert!(requires_admin(
            &Method::DELETE,
            "/api/projects/p1/categories/other/files/unlock"
        ));
        assert!(requires_admin(
            &Method::PUT,
            "/api/projects/p1/categories/other/unlock"
        ));
        assert!(requires_admin(&Method::POST, "/api/projects/p1/unlock"));
        assert!(!requires_admin(&Method::GET, "/api/projects"));
        assert!(!requires_admin(&Method::POST, "/api/auth/login"));
        assert!(!requires_admin(&Method::POST, "/api/auth/logout"));
        assert!(!requires_admin(
            &Method::POST,
            "/api/projects/p1/categories/other/unlock"
        ));
        assert!(!requires_admin(&Method::POST, "/index.html"));
    }
}
