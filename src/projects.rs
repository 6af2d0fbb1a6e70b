//! 项目的增删改查与分类概览。

use axum::extract::{Extension, Json, Path};
use axum::http::StatusCode;
use axum::response::Json as JsonResponse;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::category::{Category, CategoryDescriptor};
use crate::error::ApiError;
use crate::files::FileRecord;
use crate::gate::{CategoryGate, CategoryPassword};
use crate::storage::Storage;
use crate::store::{CATEGORY_PASSWORDS_DOC, FILES_DOC, MetaStore, PROJECTS_DOC};

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Project {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub module_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub supervisor_name: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub(crate) struct CreateProjectRequest {
    #[serde(default)]
    name: String,
    description: Option<String>,
    module_name: Option<String>,
    supervisor_name: Option<String>,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub(crate) struct UpdateProjectRequest {
    name: Option<String>,
    description: Option<String>,
    module_name: Option<String>,
    supervisor_name: Option<String>,
}

fn normalize_optional(value: Option<String>) -> Option<String> {
    value
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn normalize_name(value: &str) -> Result<String, ApiError> {
    let name = value.trim();
    if name.is_empty() {
        return Err(ApiError::BadRequest("project name is required".into()));
    }
    Ok(name.to_string())
}

/// 查找项目，不存在时返回 404。
pub async fn require_project(store: &MetaStore, project_id: &str) -> Result<Project, ApiError> {
    store
        .load::<Project>(PROJECTS_DOC)
        .await?
        .into_iter()
        .find(|project| project.id == project_id)
        .ok_or_else(|| ApiError::NotFound("project not found".into()))
}

pub async fn list_projects(
    Extension(store): Extension<Arc<MetaStore>>,
) -> Result<JsonResponse<Vec<Project>>, ApiError> {
    Ok(JsonResponse(store.load::<Project>(PROJECTS_DOC).await?))
}

pub async fn get_project(
    Path(project_id): Path<String>,
    Extension(store): Extension<Arc<MetaStore>>,
) -> Result<JsonResponse<Project>, ApiError> {
    Ok(JsonResponse(require_project(&store, &project_id).await?))
}

/// 创建项目。
pub async fn create_project(
    Extension(store): Extension<Arc<MetaStore>>,
    Json(payload): Json<CreateProjectRequest>,
) -> Result<(StatusCode, JsonResponse<Project>), ApiError> {
    let name = normalize_name(&payload.name)?;
    let now = Utc::now();
    let project = Project {
        id: Uuid::new_v4().simple().to_string(),
        name,
        description: normalize_optional(payload.description),
        module_name: normalize_optional(payload.module_name),
        supervisor_name: normalize_optional(payload.supervisor_name),
        created_at: now,
        updated_at: now,
    };

    let created = project.clone();
    store
        .update::<Project, _, _>(PROJECTS_DOC, move |projects| projects.push(created))
        .await?;
    info!(project_id = project.id, name = project.name, "project created");
    Ok((StatusCode::CREATED, JsonResponse(project)))
}

/// 部分更新项目字段；提供的字段为空白时视为清除（名称除外）。
pub async fn update_project(
    Path(project_id): Path<String>,
    Extension(store): Extension<Arc<MetaStore>>,
    Json(payload): Json<UpdateProjectRequest>,
) -> Result<JsonResponse<Project>, ApiError> {
    let name = payload.name.as_deref().map(normalize_name).transpose()?;

    let updated = store
        .update::<Project, _, _>(PROJECTS_DOC, |projects| {
            let project = projects.iter_mut().find(|project| project.id == project_id)?;
            if let Some(name) = name {
                project.name = name;
            }
            if payload.description.is_some() {
                project.description = normalize_optional(payload.description);
            }
            if payload.module_name.is_some() {
                project.module_name = normalize_optional(payload.module_name);
            }
            if payload.supervisor_name.is_some() {
                project.supervisor_name = normalize_optional(payload.supervisor_name);
            }
            project.updated_at = Utc::now();
            Some(project.clone())
        })
        .await?
        .ok_or_else(|| ApiError::NotFound("project not found".into()))?;

    info!(project_id, "project updated");
    Ok(JsonResponse(updated))
}

/// 删除项目及其全部文件、元数据与分类密码。
pub async fn delete_project(
    Path(project_id): Path<String>,
    Extension(store): Extension<Arc<MetaStore>>,
    Extension(storage): Extension<Arc<Storage>>,
    Extension(gate): Extension<Arc<CategoryGate>>,
) -> Result<StatusCode, ApiError> {
    let removed = store
        .update::<Project, _, _>(PROJECTS_DOC, |projects| {
            let before = projects.len();
            projects.retain(|project| project.id != project_id);
            before != projects.len()
        })
        .await?;
    if !removed {
        return Err(ApiError::NotFound("project not found".into()));
    }

    let removed_files = store
        .update::<FileRecord, _, _>(FILES_DOC, |files| {
            let before = files.len();
            files.retain(|file| file.project_id != project_id);
            before - files.len()
        })
        .await?;
    store
        .update::<CategoryPassword, _, _>(CATEGORY_PASSWORDS_DOC, |records| {
            records.retain(|record| record.project_id != project_id);
        })
        .await?;
    gate.revoke(&project_id, None).await;
    if let Err(err) = storage.remove_project_dir(&project_id).await {
        warn!(project_id, error = ?err, "failed to remove project upload directory");
    }

    info!(project_id, removed_files, "project deleted");
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Serialize)]
pub struct CategorySummary {
    #[serde(flatten)]
    category: CategoryDescriptor,
    locked: bool,
    count: usize,
}

/// 项目下各分类的概览：是否加密与文件数量（对锁定分类同样公开）。
pub async fn list_project_categories(
    Path(project_id): Path<String>,
    Extension(store): Extension<Arc<MetaStore>>,
) -> Result<JsonResponse<Vec<CategorySummary>>, ApiError> {
    require_project(&store, &project_id).await?;
    let files = store.load::<FileRecord>(FILES_DOC).await?;
    let passwords = store.load::<CategoryPassword>(CATEGORY_PASSWORDS_DOC).await?;

    let summaries = Category::all()
        .into_iter()
        .map(|category| CategorySummary {
            category: category.descriptor(),
            locked: passwords
                .iter()
                .any(|record| record.project_id == project_id && record.category_id == category),
            count: files
                .iter()
                .filter(|file| file.project_id == project_id && file.category_id == category)
                .count(),
        })
        .collect();
    Ok(JsonResponse(summaries))
}
