//! 分类访问密码：管理员设置密码，匿名访客解锁后获得限时访问凭据。

use axum::extract::{Extension, Json, Path, connect_info::ConnectInfo};
use axum::http::{HeaderMap, StatusCode};
use axum_extra::extract::{
    CookieJar,
    cookie::{Cookie, SameSite},
};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

use crate::auth::{AuthConfig, Viewer, cookie_max_age, expires_after};
use crate::category::Category;
use crate::config::{CATEGORY_PASSWORD_HEADER, UNLOCK_COOKIE_NAME};
use crate::error::ApiError;
use crate::http::{RequestScheme, is_https_request};
use crate::projects::require_project;
use crate::store::{CATEGORY_PASSWORDS_DOC, MetaStore};

/// 持久化的分类密码记录，不会出现在任何读取接口中。
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct CategoryPassword {
    pub project_id: String,
    pub category_id: Category,
    pub password: String,
}

type GrantKey = (String, Category);

#[derive(Debug)]
struct UnlockGrant {
    categories: HashSet<GrantKey>,
    expires_at: Instant,
}

/// 进程内的解锁凭据表：token -> 已解锁的 (项目, 分类) 集合。
#[derive(Debug)]
pub struct CategoryGate {
    grants: Mutex<HashMap<String, UnlockGrant>>,
    ttl: Duration,
}

impl CategoryGate {
    pub fn new(ttl: Duration) -> Self {
        Self {
            grants: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    async fn is_granted(&self, token: &str, project_id: &str, category: Category) -> bool {
        let mut grants = self.grants.lock().await;
        let now = Instant::now();
        match grants.get(token) {
            Some(grant) if grant.expires_at > now => grant
                .categories
                .contains(&(project_id.to_string(), category)),
            Some(_) => {
                grants.remove(token);
                false
            }
            None => false,
        }
    }

    /// 将分类加入已有凭据（若仍有效），否则签发新凭据；返回 token。
    async fn grant(&self, existing: Option<&str>, project_id: &str, category: Category) -> String {
        let mut grants = self.grants.lock().await;
        let now = Instant::now();
        let token = match existing {
            Some(token) if grants.get(token).is_some_and(|grant| grant.expires_at > now) => {
                token.to_string()
            }
            _ => Uuid::new_v4().to_string(),
        };
        let expires_at = expires_after(now, self.ttl);
        let grant = grants.entry(token.clone()).or_insert_with(|| UnlockGrant {
            categories: HashSet::new(),
            expires_at,
        });
        grant.categories.insert((project_id.to_string(), category));
        grant.expires_at = expires_at;
        token
    }

    /// 撤销所有凭据中对应项目的解锁记录；`category` 为 None 时撤销整个项目。
    pub async fn revoke(&self, project_id: &str, category: Option<Category>) {
        let mut grants = self.grants.lock().await;
        for grant in grants.values_mut() {
            grant.categories.retain(|(granted_project, granted_category)| {
                granted_project != project_id
                    || category.is_some_and(|category| category != *granted_category)
            });
        }
        grants.retain(|_, grant| !grant.categories.is_empty());
    }

    /// 清理过期凭据。
    pub async fn prune(&self) {
        let mut grants = self.grants.lock().await;
        let now = Instant::now();
        grants.retain(|_, grant| grant.expires_at > now);
    }
}

/// 查询分类密码；未设置时返回 None。
pub async fn category_password(
    store: &MetaStore,
    project_id: &str,
    category: Category,
) -> Result<Option<String>, ApiError> {
    let records = store.load::<CategoryPassword>(CATEGORY_PASSWORDS_DOC).await?;
    Ok(records
        .into_iter()
        .find(|record| record.project_id == project_id && record.category_id == category)
        .map(|record| record.password))
}

/// 校验受保护读取的访问权限。
pub async fn ensure_category_access(
    store: &MetaStore,
    gate: &CategoryGate,
    viewer: Viewer,
    jar: &CookieJar,
    headers: &HeaderMap,
    project_id: &str,
    category: Category,
) -> Result<(), ApiError> {
    if viewer.is_admin {
        return Ok(());
    }
    let Some(password) = category_password(store, project_id, category).await? else {
        return Ok(());
    };
    if let Some(cookie) = jar.get(UNLOCK_COOKIE_NAME)
        && gate.is_granted(cookie.value(), project_id, category).await
    {
        return Ok(());
    }
    if let Some(candidate) = headers
        .get(CATEGORY_PASSWORD_HEADER)
        .and_then(|value| value.to_str().ok())
        && candidate.trim() == password
    {
        return Ok(());
    }
    debug!(project_id, category = %category, "category access denied");
    Err(ApiError::Unauthorized("category is locked".into()))
}

#[derive(Deserialize)]
pub(crate) struct SetPasswordRequest {
    #[serde(default)]
    password: Option<String>,
}

/// 设置或清除分类密码（空字符串或 null 表示清除）。
pub async fn set_category_password(
    Path((project_id, category)): Path<(String, String)>,
    Extension(store): Extension<Arc<MetaStore>>,
    Extension(gate): Extension<Arc<CategoryGate>>,
    Json(payload): Json<SetPasswordRequest>,
) -> Result<StatusCode, ApiError> {
    let category: Category = category.parse()?;
    require_project(&store, &project_id).await?;
    let password = payload
        .password
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty());
    let locked = password.is_some();

    store
        .update::<CategoryPassword, _, _>(CATEGORY_PASSWORDS_DOC, |records| {
            records.retain(|record| {
                !(record.project_id == project_id && record.category_id == category)
            });
            if let Some(password) = password {
                records.push(CategoryPassword {
                    project_id: project_id.clone(),
                    category_id: category,
                    password,
                });
            }
        })
        .await?;
    gate.revoke(&project_id, Some(category)).await;

    info!(project_id, category = %category, locked, "category password updated");
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Deserialize)]
pub(crate) struct UnlockRequest {
    #[serde(default)]
    password: String,
}

/// 访客解锁分类：密码正确时写入解锁 Cookie。
#[allow(clippy::too_many_arguments)]
pub async fn unlock_category(
    Path((project_id, category)): Path<(String, String)>,
    Extension(store): Extension<Arc<MetaStore>>,
    Extension(gate): Extension<Arc<CategoryGate>>,
    Extension(auth): Extension<Arc<AuthConfig>>,
    Extension(scheme): Extension<RequestScheme>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    jar: CookieJar,
    Json(payload): Json<UnlockRequest>,
) -> Result<(CookieJar, StatusCode), ApiError> {
    let category: Category = category.parse()?;
    require_project(&store, &project_id).await?;
    let Some(password) = category_password(&store, &project_id, category).await? else {
        return Ok((jar, StatusCode::NO_CONTENT));
    };

    let client_ip = auth.client_ip(&headers, addr.ip());
    if let Some(retry_after) = auth.limiter.check(client_ip).await {
        return Err(ApiError::TooManyRequests(retry_after));
    }
    if payload.password.trim() != password {
        auth.limiter.register_failure(client_ip).await;
        return Err(ApiError::Unauthorized("invalid category password".into()));
    }
    auth.limiter.clear(client_ip).await;

    let existing = jar.get(UNLOCK_COOKIE_NAME).map(|cookie| cookie.value().to_string());
    let token = gate
        .grant(existing.as_deref(), &project_id, category)
        .await;
    let cookie = Cookie::build((UNLOCK_COOKIE_NAME, token))
        .path("/")
        .http_only(true)
        .secure(is_https_request(&headers, scheme))
        .same_site(SameSite::Lax)
        .max_age(cookie_max_age(gate.ttl))
        .build();
    info!(project_id, category = %category, client_ip = %client_ip, "category unlocked");
    Ok((jar.add(cookie), StatusCode::NO_CONTENT))
}
