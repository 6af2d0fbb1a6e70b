//! multipart 文件上传：逐个写入分类目录并记录元数据。

use axum::extract::multipart::{Field, MultipartError};
use axum::extract::{DefaultBodyLimit, Extension, Multipart, Path};
use axum::http::StatusCode;
use axum::response::Json as JsonResponse;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::category::Category;
use crate::error::ApiError;
use crate::files::FileRecord;
use crate::projects::require_project;
use crate::storage::{Storage, stored_file_name};
use crate::store::{FILES_DOC, MetaStore};

pub const UPLOAD_FIELD_NAME: &str = "files";

#[derive(Serialize)]
pub struct UploadResponse {
    files: Vec<FileRecord>,
}

/// 上传请求体大小限制（0 表示不限制）。
pub fn upload_body_limit(max_size: u64) -> DefaultBodyLimit {
    if max_size == 0 {
        DefaultBodyLimit::disable()
    } else {
        DefaultBodyLimit::max(usize::try_from(max_size).unwrap_or(usize::MAX))
    }
}

fn multipart_error(err: MultipartError) -> ApiError {
    if err.status() == StatusCode::PAYLOAD_TOO_LARGE {
        ApiError::PayloadTooLarge("upload exceeds size limit".into())
    } else {
        ApiError::BadRequest(err.body_text())
    }
}

/// 上传文件到指定项目分类，返回新建的元数据记录。
pub async fn upload_files(
    Path((project_id, category)): Path<(String, String)>,
    Extension(store): Extension<Arc<MetaStore>>,
    Extension(storage): Extension<Arc<Storage>>,
    mut multipart: Multipart,
) -> Result<(StatusCode, JsonResponse<UploadResponse>), ApiError> {
    let category: Category = category.parse()?;
    require_project(&store, &project_id).await?;

    let mut records: Vec<FileRecord> = Vec::new();
    let result: Result<(), ApiError> = async {
        while let Some(field) = multipart.next_field().await.map_err(multipart_error)? {
            if field.name() != Some(UPLOAD_FIELD_NAME) {
                continue;
            }
            let record = store_field(&storage, &project_id, category, field).await?;
            debug!(filename = record.filename, size = record.size, "upload part stored");
            records.push(record);
        }
        if records.is_empty() {
            return Err(ApiError::BadRequest("no files provided".into()));
        }
        let saved = records.clone();
        store
            .update::<FileRecord, _, _>(FILES_DOC, move |files| files.extend(saved))
            .await?;
        Ok(())
    }
    .await;

    if let Err(err) = result {
        rollback(&storage, &project_id, category, &records).await;
        return Err(err);
    }

    info!(
        project_id,
        category = %category,
        count = records.len(),
        "files uploaded"
    );
    Ok((
        StatusCode::CREATED,
        JsonResponse(UploadResponse { files: records }),
    ))
}

async fn store_field(
    storage: &Storage,
    project_id: &str,
    category: Category,
    mut field: Field<'_>,
) -> Result<FileRecord, ApiError> {
    let original_name = field
        .file_name()
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .unwrap_or("file")
        .to_string();
    let mime_type = match field.content_type() {
        Some(mime) if !mime.trim().is_empty() => mime.trim().to_string(),
        _ => mime_guess::from_path(&original_name)
            .first_or_octet_stream()
            .essence_str()
            .to_string(),
    };
    let filename = stored_file_name(&original_name);

    let (_, mut file) = storage.create_blob(project_id, category, &filename).await?;
    let mut size: u64 = 0;
    let write_result: Result<(), ApiError> = async {
        while let Some(chunk) = field.chunk().await.map_err(multipart_error)? {
            size += chunk.len() as u64;
            file.write_all(&chunk).await?;
        }
        Ok(())
    }
    .await;
    if let Err(err) = write_result {
        file.cleanup().await;
        return Err(err);
    }
    file.finalize().await?;

    Ok(FileRecord::new(
        project_id,
        category,
        &filename,
        &original_name,
        size,
        &mime_type,
    ))
}

/// 删除本次请求已写入的文件。
async fn rollback(storage: &Storage, project_id: &str, category: Category, records: &[FileRecord]) {
    for record in records {
        if let Err(err) = storage
            .remove_blob(project_id, category, &record.filename)
            .await
        {
            warn!(filename = record.filename, error = ?err, "failed to roll back uploaded file");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::files::files_in_category;
    use crate::projects::tests::seed_project;
    use axum::body::Body as AxumBody;
    use axum::extract::FromRequest;
    use axum::http::{Request, header};
    use tempfile::tempdir;

    const BOUNDARY: &str = "shelf-test-boundary";

    fn multipart_body(parts: &[(&str, Option<&str>, Option<&str>, &str)]) -> String {
        let mut body = String::new();
        for (name, filename, content_type, data) in parts {
            body.push_str(&format!("--{BOUNDARY}\r\n"));
            match filename {
                Some(filename) => body.push_str(&format!(
                    "Content-Disposition: form-data; name=\"{name}\"; filename=\"{filename}\"\r\n"
                )),
                None => body.push_str(&format!(
                    "Content-Disposition: form-data; name=\"{name}\"\r\n"
                )),
            }
            if let Some(content_type) = content_type {
                body.push_str(&format!("Content-Type: {content_type}\r\n"));
            }
            body.push_str("\r\n");
            body.push_str(data);
            body.push_str("\r\n");
        }
        body.push_str(&format!("--{BOUNDARY}--\r\n"));
        body
    }

    async fn multipart(body: String) -> Multipart {
        let request = Request::builder()
            .method("POST")
            .header(
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={BOUNDARY}"),
            )
            .body(AxumBody::from(body))
            .expect("request");
        Multipart::from_request(request, &())
            .await
            .unwrap_or_else(|_| panic!("multipart extraction failed"))
    }

    fn make_env() -> (tempfile::TempDir, Arc<MetaStore>, Arc<Storage>) {
        let temp = tempdir().expect("tempdir");
        let store = Arc::new(MetaStore::new(temp.path().join("data")));
        let storage = Arc::new(Storage::new(temp.path().join("uploads")));
        (temp, store, storage)
    }

    #[tokio::test]
    async fn upload_stores_every_file_part() {
        let (_temp, store, storage) = make_env();
        let project = seed_project(&store, "Poster").await;
        let body = multipart_body(&[
            ("files", Some("chart.png"), Some("image/png"), "PNGDATA"),
            ("note", None, None, "ignored"),
            ("files", Some("raw data.csv"), None, "a,b"),
        ]);

        let (status, JsonResponse(response)) = upload_files(
            Path((project.id.clone(), "graphical-data".into())),
            Extension(store.clone()),
            Extension(storage.clone()),
            multipart(body).await,
        )
        .await
        .unwrap_or_else(|_| panic!("upload failed"));

        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(response.files.len(), 2);
        let png = &response.files[0];
        assert_eq!(png.original_name, "chart.png");
        assert_eq!(png.mime_type, "image/png");
        assert_eq!(png.size, Some(7));
        assert!(png.filename.ends_with("-chart.png"));
        assert_eq!(response.files[1].mime_type, "text/csv");

        let stored = storage
            .blob_path(&project.id, Category::GraphicalData, &png.filename, false)
            .await
            .expect("blob path");
        assert_eq!(std::fs::read(stored).expect("read"), b"PNGDATA");

        let recorded = files_in_category(&store, &project.id, Category::GraphicalData)
            .await
            .unwrap_or_else(|_| panic!("load failed"));
        assert_eq!(recorded, response.files);
    }

    #[tokio::test]
    async fn upload_without_files_is_rejected() {
        let (_temp, store, storage) = make_env();
        let project = seed_project(&store, "Poster").await;
        let body = multipart_body(&[("note", None, None, "nothing")]);

        let result = upload_files(
            Path((project.id, "other".into())),
            Extension(store),
            Extension(storage),
            multipart(body).await,
        )
        .await;
        assert!(matches!(result, Err(ApiError::BadRequest(_))));
    }

    #[tokio::test]
    async fn upload_to_unknown_project_is_rejected() {
        let (_temp, store, storage) = make_env();
        let body = multipart_body(&[("files", Some("a.txt"), None, "x")]);

        let result = upload_files(
            Path(("missing".into(), "other".into())),
            Extension(store),
            Extension(storage.clone()),
            multipart(body).await,
        )
        .await;
        assert!(matches!(result, Err(ApiError::NotFound(_))));
        assert!(!storage.root_path().join("missing").exists());
    }

    #[tokio::test]
    async fn failing_part_rolls_back_earlier_files() {
        let (_temp, store, storage) = make_env();
        let project = seed_project(&store, "Poster").await;
        let mut body = multipart_body(&[("files", Some("first.txt"), Some("text/plain"), "ok")]);
        // Drop the closing delimiter and append a second part that never ends.
        body.truncate(body.len() - format!("--{BOUNDARY}--\r\n").len());
        body.push_str(&format!(
            "--{BOUNDARY}\r\n\
             Content-Disposition: form-data; name=\"files\"; filename=\"second.txt\"\r\n\
             Content-Type: text/plain\r\n\r\n\
             partial data without a closing boundary"
        ));

        let result = upload_files(
            Path((project.id.clone(), "other".into())),
            Extension(store.clone()),
            Extension(storage.clone()),
            multipart(body).await,
        )
        .await;
        assert!(matches!(result, Err(ApiError::BadRequest(_))));

        let category_dir = storage.root_path().join(&project.id).join("other");
        let leftovers = std::fs::read_dir(&category_dir)
            .map(|entries| entries.count())
            .unwrap_or(0);
        assert_eq!(leftovers, 0, "no blobs or temp files remain");
        assert!(
            store
                .load::<FileRecord>(FILES_DOC)
                .await
                .expect("files")
                .is_empty()
        );
    }

    #[tokio::test]
    async fn long_original_names_are_stored() {
        let (_temp, store, storage) = make_env();
        let project = seed_project(&store, "Poster").await;
        let original = format!("{}.pdf", "a".repeat(200));
        let body = multipart_body(&[("files", Some(original.as_str()), None, "%PDF")]);

        let (status, JsonResponse(response)) = upload_files(
            Path((project.id.clone(), "literature".into())),
            Extension(store.clone()),
            Extension(storage.clone()),
            multipart(body).await,
        )
        .await
        .unwrap_or_else(|_| panic!("upload failed"));

        assert_eq!(status, StatusCode::CREATED);
        let record = &response.files[0];
        assert_eq!(record.original_name, original);
        assert_eq!(record.mime_type, "application/pdf");
        assert!(record.filename.ends_with(".pdf"));
        assert!(record.filename.len() < original.len());
    }

    #[tokio::test]
    async fn rollback_removes_written_blobs() {
        let (_temp, store, storage) = make_env();
        let project = seed_project(&store, "Poster").await;
        let (_, file) = storage
            .create_blob(&project.id, Category::Other, "x-a.txt")
            .await
            .expect("create");
        file.finalize().await.expect("finalize");
        let record = FileRecord::new(
            &project.id,
            Category::Other,
            "x-a.txt",
            "a.txt",
            0,
            "text/plain",
        );

        rollback(&storage, &project.id, Category::Other, &[record]).await;
        assert_eq!(
            storage
                .blob_len(&project.id, Category::Other, "x-a.txt")
                .await
                .expect("len"),
            None
        );
    }
}
