//! 文件元数据记录，以及列表、计数、下载与删除处理器。

use axum::body::Body as AxumBody;
use axum::extract::{Extension, Path};
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Json as JsonResponse, Response};
use axum_extra::extract::CookieJar;
use chrono::{DateTime, Utc};
use httpdate::{fmt_http_date, parse_http_date};
use serde::{Deserialize, Serialize};
use std::io::SeekFrom;
use std::sync::Arc;
use tokio::fs::{self, File};
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio_util::io::ReaderStream;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::auth::Viewer;
use crate::category::Category;
use crate::error::ApiError;
use crate::etag::{etag_from_metadata, is_not_modified};
use crate::gate::{CategoryGate, ensure_category_access};
use crate::http::attachment_disposition;
use crate::projects::require_project;
use crate::storage::Storage;
use crate::store::{FILES_DOC, MetaStore};

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FileRecord {
    pub id: String,
    pub project_id: String,
    pub category_id: Category,
    pub filename: String,
    pub original_name: String,
    #[serde(default)]
    pub size: Option<u64>,
    pub mime_type: String,
    pub uploaded_at: DateTime<Utc>,
}

impl FileRecord {
    pub fn new(
        project_id: &str,
        category: Category,
        filename: &str,
        original_name: &str,
        size: u64,
        mime_type: &str,
    ) -> Self {
        Self {
            id: Uuid::new_v4().simple().to_string(),
            project_id: project_id.to_string(),
            category_id: category,
            filename: filename.to_string(),
            original_name: original_name.to_string(),
            size: Some(size),
            mime_type: mime_type.to_string(),
            uploaded_at: Utc::now(),
        }
    }

    fn belongs_to(&self, project_id: &str, category: Category) -> bool {
        self.project_id == project_id && self.category_id == category
    }
}

/// 按项目与分类线性筛选元数据记录。
pub async fn files_in_category(
    store: &MetaStore,
    project_id: &str,
    category: Category,
) -> Result<Vec<FileRecord>, ApiError> {
    Ok(store
        .load::<FileRecord>(FILES_DOC)
        .await?
        .into_iter()
        .filter(|record| record.belongs_to(project_id, category))
        .collect())
}

/// 补全缺失的 size：以磁盘文件长度为准，文件不存在时记为 0。
async fn enrich_size(storage: &Storage, mut record: FileRecord) -> FileRecord {
    if record.size.is_none() {
        let size = match storage
            .blob_len(&record.project_id, record.category_id, &record.filename)
            .await
        {
            Ok(len) => len.unwrap_or(0),
            Err(err) => {
                warn!(filename = record.filename, error = ?err, "could not determine file size");
                0
            }
        };
        record.size = Some(size);
    }
    record
}

#[derive(Serialize)]
pub struct CountResponse {
    count: usize,
}

/// 分类文件数量，锁定分类同样公开。
pub async fn count_files(
    Path((project_id, category)): Path<(String, String)>,
    Extension(store): Extension<Arc<MetaStore>>,
) -> Result<JsonResponse<CountResponse>, ApiError> {
    let category: Category = category.parse()?;
    require_project(&store, &project_id).await?;
    let count = files_in_category(&store, &project_id, category).await?.len();
    Ok(JsonResponse(CountResponse { count }))
}

/// 列出分类下的文件（受分类密码保护）。
pub async fn list_files(
    Path((project_id, category)): Path<(String, String)>,
    Extension(store): Extension<Arc<MetaStore>>,
    Extension(storage): Extension<Arc<Storage>>,
    Extension(gate): Extension<Arc<CategoryGate>>,
    Extension(viewer): Extension<Viewer>,
    jar: CookieJar,
    headers: HeaderMap,
) -> Result<JsonResponse<Vec<FileRecord>>, ApiError> {
    let category: Category = category.parse()?;
    require_project(&store, &project_id).await?;
    ensure_category_access(&store, &gate, viewer, &jar, &headers, &project_id, category).await?;

    let records = files_in_category(&store, &project_id, category).await?;
    let mut enriched = Vec::with_capacity(records.len());
    for record in records {
        enriched.push(enrich_size(&storage, record).await);
    }
    info!(project_id, category = %category, count = enriched.len(), "list files");
    Ok(JsonResponse(enriched))
}

/// 下载文件，支持 Range 请求与缓存相关头。
#[allow(clippy::too_many_arguments)]
pub async fn download_file(
    Path((project_id, category, filename)): Path<(String, String, String)>,
    request_headers: HeaderMap,
    jar: CookieJar,
    Extension(store): Extension<Arc<MetaStore>>,
    Extension(storage): Extension<Arc<Storage>>,
    Extension(gate): Extension<Arc<CategoryGate>>,
    Extension(viewer): Extension<Viewer>,
) -> Result<Response, ApiError> {
    let category: Category = category.parse()?;
    ensure_category_access(
        &store,
        &gate,
        viewer,
        &jar,
        &request_headers,
        &project_id,
        category,
    )
    .await?;

    let not_found = || ApiError::NotFound("file not found".into());
    let target = storage
        .blob_path(&project_id, category, &filename, false)
        .await
        .map_err(|err| match ApiError::from(err) {
            ApiError::NotFound(_) => not_found(),
            other => other,
        })?;
    let metadata = match fs::metadata(&target).await {
        Ok(metadata) if metadata.is_file() => metadata,
        Ok(_) => return Err(not_found()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Err(not_found()),
        Err(err) => return Err(ApiError::Internal(err.to_string())),
    };

    // 只提供有元数据记录的文件，进行中的临时文件不可见。
    let record = files_in_category(&store, &project_id, category)
        .await?
        .into_iter()
        .find(|record| record.filename == filename)
        .ok_or_else(not_found)?;
    let mime = if record.mime_type.is_empty() {
        mime_guess::from_path(&filename)
            .first_or_octet_stream()
            .essence_str()
            .to_string()
    } else {
        record.mime_type.clone()
    };
    let download_name = record.original_name.as_str();

    let file_size = metadata.len();
    let modified = metadata.modified().ok();
    let etag = etag_from_metadata(&metadata);

    let mut response_headers = HeaderMap::new();
    response_headers.insert(
        header::ETAG,
        HeaderValue::from_str(&etag).map_err(|_| header_error())?,
    );
    if let Some(value) = modified.map(fmt_http_date) {
        response_headers.insert(
            header::LAST_MODIFIED,
            HeaderValue::from_str(&value).map_err(|_| header_error())?,
        );
    }
    if is_not_modified(&request_headers, &etag) {
        return Ok((StatusCode::NOT_MODIFIED, response_headers).into_response());
    }

    response_headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_str(&mime)
            .unwrap_or_else(|_| HeaderValue::from_static("application/octet-stream")),
    );
    response_headers.insert(
        header::CONTENT_DISPOSITION,
        HeaderValue::from_str(&attachment_disposition(download_name))
            .map_err(|_| header_error())?,
    );
    response_headers.insert(header::ACCEPT_RANGES, HeaderValue::from_static("bytes"));

    let if_range_matches = match request_headers
        .get(header::IF_RANGE)
        .and_then(|value| value.to_str().ok())
    {
        Some(value) if value.starts_with('"') || value.starts_with("W/") => value == etag,
        Some(value) => match parse_http_date(value) {
            Ok(date) => modified.map(|ts| ts <= date).unwrap_or(false),
            Err(_) => false,
        },
        None => true,
    };

    let range = if if_range_matches {
        parse_range(request_headers.get(header::RANGE), file_size)?
    } else {
        None
    };

    let file = File::open(&target)
        .await
        .map_err(|err| ApiError::Internal(err.to_string()))?;

    if let Some((start, end)) = range {
        let length = end - start + 1;
        debug!(filename, start, end, length, "download range request accepted");
        let mut file = file;
        file.seek(SeekFrom::Start(start))
            .await
            .map_err(|err| ApiError::Internal(err.to_string()))?;
        let stream = ReaderStream::new(file.take(length));
        response_headers.insert(
            header::CONTENT_RANGE,
            HeaderValue::from_str(&format!("bytes {start}-{end}/{file_size}"))
                .map_err(|_| header_error())?,
        );
        response_headers.insert(header::CONTENT_LENGTH, HeaderValue::from(length));
        return Ok((
            StatusCode::PARTIAL_CONTENT,
            response_headers,
            AxumBody::from_stream(stream),
        )
            .into_response());
    }

    response_headers.insert(header::CONTENT_LENGTH, HeaderValue::from(file_size));
    info!(project_id, category = %category, filename, size = file_size, "download file");
    let stream = ReaderStream::new(file);
    Ok((
        StatusCode::OK,
        response_headers,
        AxumBody::from_stream(stream),
    )
        .into_response())
}

/// 删除文件及其元数据记录。
pub async fn delete_file(
    Path((project_id, category, filename)): Path<(String, String, String)>,
    Extension(store): Extension<Arc<MetaStore>>,
    Extension(storage): Extension<Arc<Storage>>,
) -> Result<StatusCode, ApiError> {
    let category: Category = category.parse()?;

    let blob_removed = match storage.remove_blob(&project_id, category, &filename).await {
        Ok(removed) => removed,
        Err(err) => {
            warn!(project_id, filename, error = ?err, "failed to remove stored file");
            false
        }
    };
    let record_removed = store
        .update::<FileRecord, _, _>(FILES_DOC, |files| {
            let before = files.len();
            files.retain(|record| {
                !(record.belongs_to(&project_id, category) && record.filename == filename)
            });
            before != files.len()
        })
        .await?;

    if !blob_removed && !record_removed {
        return Err(ApiError::NotFound("file not found".into()));
    }
    info!(project_id, category = %category, filename, "file deleted");
    Ok(StatusCode::NO_CONTENT)
}

fn header_error() -> ApiError {
    ApiError::Internal("failed to build response header".into())
}

/// 解析 Range 头，返回可读取的范围。
fn parse_range(
    value: Option<&HeaderValue>,
    file_size: u64,
) -> Result<Option<(u64, u64)>, ApiError> {
    let Some(value) = value else {
        return Ok(None);
    };
    if file_size == 0 {
        return Err(ApiError::RangeNotSatisfiable(file_size));
    }
    let value = value
        .to_str()
        .map_err(|_| ApiError::BadRequest("invalid Range header".into()))?;
    let Some(range) = value.strip_prefix("bytes=") else {
        return Err(ApiError::BadRequest("invalid Range header".into()));
    };
    if range.contains(',') {
        return Err(ApiError::BadRequest("multiple ranges not supported".into()));
    }

    let (start_part, end_part) = range.split_once('-').unwrap_or((range, ""));
    let invalid = || ApiError::BadRequest("invalid Range header".into());

    let (start, end) = if start_part.is_empty() {
        let suffix: u64 = end_part.parse().map_err(|_| invalid())?;
        if suffix == 0 {
            return Err(ApiError::RangeNotSatisfiable(file_size));
        }
        (file_size.saturating_sub(suffix), file_size - 1)
    } else {
        let start: u64 = start_part.parse().map_err(|_| invalid())?;
        let end: u64 = if end_part.is_empty() {
            file_size - 1
        } else {
            end_part.parse().map_err(|_| invalid())?
        };
        (start, end.min(file_size - 1))
    };

    if start > end || start >= file_size {
        return Err(ApiError::RangeNotSatisfiable(file_size));
    }

    Ok(Some((start, end)))
}
