//! 上传文件的本地存储：`{root}/{project}/{category}/{stored name}`。

use std::io;
use std::path::{Component, Path, PathBuf};
use tokio::fs;
use tokio::io::ErrorKind;
use uuid::Uuid;

use crate::atomic::AtomicFile;
use crate::category::Category;

#[derive(Clone, Debug)]
pub struct Storage {
    root: PathBuf,
}

impl Storage {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    pub async fn ensure_root(&self) -> io::Result<()> {
        fs::create_dir_all(&self.root).await
    }

    pub fn root_path(&self) -> &Path {
        &self.root
    }

    pub async fn resolve_path_checked(
        &self,
        relative: &str,
        allow_missing_leaf: bool,
    ) -> Result<PathBuf, StorageError> {
        let target = self.resolve(relative)?;
        self.ensure_no_symlink_components(&target, allow_missing_leaf)
            .await?;
        Ok(target)
    }

    fn resolve(&self, relative: &str) -> Result<PathBuf, StorageError> {
        let mut normalized = PathBuf::new();
        let trimmed = relative.trim_start_matches(['/', '\\']);
        for component in Path::new(trimmed).components() {
            match component {
                Component::Normal(segment) => normalized.push(segment),
                Component::CurDir => continue,
                Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                    return Err(StorageError::InvalidPath);
                }
            }
        }
        if normalized.as_os_str().is_empty() {
            return Err(StorageError::InvalidPath);
        }
        Ok(self.root.join(normalized))
    }

    async fn ensure_no_symlink_components(
        &self,
        target: &Path,
        allow_missing_leaf: bool,
    ) -> Result<(), StorageError> {
        let relative = target
            .strip_prefix(&self.root)
            .map_err(|_| StorageError::InvalidPath)?;
        let mut current = PathBuf::from(&self.root);
        let mut components = relative.components().peekable();

        while let Some(component) = components.next() {
            current.push(component.as_os_str());
            match fs::symlink_metadata(&current).await {
                Ok(metadata) => {
                    if metadata.file_type().is_symlink() {
                        return Err(StorageError::InvalidPath);
                    }
                    if components.peek().is_some() && !metadata.is_dir() {
                        return Err(StorageError::InvalidPath);
                    }
                }
                Err(err) if err.kind() == ErrorKind::NotFound && allow_missing_leaf => {
                    return Ok(());
                }
                Err(err) => return Err(StorageError::Io(err)),
            }
        }

        Ok(())
    }

    /// 解析单个上传文件的路径；每一段都必须是单一路径分量。
    pub async fn blob_path(
        &self,
        project_id: &str,
        category: Category,
        filename: &str,
        allow_missing: bool,
    ) -> Result<PathBuf, StorageError> {
        for segment in [project_id, filename] {
            if !is_single_segment(segment) {
                return Err(StorageError::InvalidPath);
            }
        }
        let relative = format!("{project_id}/{}/{filename}", category.id());
        self.resolve_path_checked(&relative, allow_missing).await
    }

    /// 为新文件创建分类目录与原子写入句柄。
    pub async fn create_blob(
        &self,
        project_id: &str,
        category: Category,
        filename: &str,
    ) -> Result<(PathBuf, AtomicFile), StorageError> {
        let target = self.blob_path(project_id, category, filename, true).await?;
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).await?;
        }
        let file = AtomicFile::new(&target).await?;
        Ok((target, file))
    }

    /// 返回文件长度；文件不存在时返回 None。
    pub async fn blob_len(
        &self,
        project_id: &str,
        category: Category,
        filename: &str,
    ) -> Result<Option<u64>, StorageError> {
        let target = match self.blob_path(project_id, category, filename, false).await {
            Ok(target) => target,
            Err(StorageError::Io(err)) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err),
        };
        match fs::metadata(&target).await {
            Ok(metadata) if metadata.is_file() => Ok(Some(metadata.len())),
            Ok(_) => Ok(None),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    /// 删除单个文件，返回是否确实删除了文件。
    pub async fn remove_blob(
        &self,
        project_id: &str,
        category: Category,
        filename: &str,
    ) -> Result<bool, StorageError> {
        let target = match self.blob_path(project_id, category, filename, false).await {
            Ok(target) => target,
            Err(StorageError::Io(err)) if err.kind() == ErrorKind::NotFound => return Ok(false),
            Err(err) => return Err(err),
        };
        match fs::remove_file(&target).await {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    /// 删除整个项目目录（不存在时忽略）。
    pub async fn remove_project_dir(&self, project_id: &str) -> Result<(), StorageError> {
        if !is_single_segment(project_id) {
            return Err(StorageError::InvalidPath);
        }
        let target = match self.resolve_path_checked(project_id, false).await {
            Ok(target) => target,
            Err(StorageError::Io(err)) if err.kind() == ErrorKind::NotFound => return Ok(()),
            Err(err) => return Err(err),
        };
        match fs::remove_dir_all(&target).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

fn is_single_segment(value: &str) -> bool {
    !value.is_empty()
        && value != "."
        && value != ".."
        && !value.contains(['/', '\\'])
        && !value.chars().any(char::is_control)
}

/// 从客户端提供的文件名中取出可安全落盘的部分。
pub fn sanitize_file_name(original: &str) -> String {
    let base = original
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or_default()
        .chars()
        .filter(|c| !c.is_control())
        .collect::<String>();
    let base = base.trim().trim_start_matches('.');
    if base.is_empty() {
        "file".to_string()
    } else {
        truncate_file_name(base, MAX_SANITIZED_NAME_BYTES)
    }
}

/// 存储名前缀与临时文件名都会加长文件名，这里给文件系统 255 字节上限留出余量。
const MAX_SANITIZED_NAME_BYTES: usize = 120;
const MAX_KEPT_EXTENSION_BYTES: usize = 16;

/// 按字节截断文件名（落在字符边界上），尽量保留扩展名。
fn truncate_file_name(name: &str, max_bytes: usize) -> String {
    if name.len() <= max_bytes {
        return name.to_string();
    }
    let extension = match name.rfind('.') {
        Some(index) if index > 0 && name.len() - index <= MAX_KEPT_EXTENSION_BYTES => {
            &name[index..]
        }
        _ => "",
    };
    let stem = &name[..name.len() - extension.len()];
    let mut end = max_bytes - extension.len();
    while !stem.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}{extension}", stem[..end].trim_end())
}

/// 生成带唯一前缀的存储文件名。
pub fn stored_file_name(original: &str) -> String {
    format!("{}-{}", Uuid::new_v4().simple(), sanitize_file_name(original))
}

#[derive(Debug)]
pub enum StorageError {
    InvalidPath,
    Busy,
    Corrupt(serde_json::Error),
    Io(io::Error),
}

impl From<io::Error> for StorageError {
    fn from(err: io::Error) -> Self {
        StorageError::Io(err)
    }
}
