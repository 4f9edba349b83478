//! Filesystem helpers backing the client's working-directory picker
//! (spec §4.7 `GET /api/fs/browse`, `POST /api/mkdir`).

use crate::config::expand_tilde;
use crate::error::AppError;
use axum::extract::Query;
use axum::Json;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Deserialize)]
pub struct BrowseQuery {
    path: Option<String>,
}

#[derive(Serialize)]
pub struct FileEntry {
    name: String,
    #[serde(rename = "isDirectory")]
    is_directory: bool,
}

#[derive(Serialize)]
pub struct BrowseResponse {
    #[serde(rename = "absolutePath")]
    absolute_path: String,
    files: Vec<FileEntry>,
}

fn resolve(path: Option<&str>) -> Result<PathBuf, AppError> {
    let requested = match path {
        Some(p) if !p.is_empty() => expand_tilde(p),
        _ => std::env::current_dir().map_err(crate::error::ResourceError::Storage)?,
    };
    requested
        .canonicalize()
        .map_err(|_| AppError::Client(format!("no such directory: {}", requested.display())))
}

/// `GET /api/fs/browse?path=...` — lists the directories and files
/// directly under `path` (default: the server's working directory).
/// 400 for a missing/relative path that can't be resolved, 404 if the
/// resolved path does not exist or is not a directory (spec §4.7).
pub async fn browse(Query(query): Query<BrowseQuery>) -> Result<Json<BrowseResponse>, AppError> {
    let dir = resolve(query.path.as_deref())?;
    if !dir.is_dir() {
        return Err(AppError::NotFound(dir.display().to_string()));
    }
    let mut files = Vec::new();
    let entries = std::fs::read_dir(&dir).map_err(crate::error::ResourceError::Storage)?;
    for entry in entries {
        let entry = entry.map_err(crate::error::ResourceError::Storage)?;
        let name = entry.file_name().to_string_lossy().into_owned();
        let is_directory = entry.file_type().map(|t| t.is_dir()).unwrap_or(false);
        files.push(FileEntry { name, is_directory });
    }
    files.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(Json(BrowseResponse { absolute_path: dir.display().to_string(), files }))
}

#[derive(Deserialize)]
pub struct MkdirRequest {
    path: String,
}

#[derive(Serialize)]
pub struct MkdirResponse {
    success: bool,
}

/// `POST /api/mkdir` — creates `path` (and any missing parents).
pub async fn mkdir(Json(body): Json<MkdirRequest>) -> Result<Json<MkdirResponse>, AppError> {
    if body.path.is_empty() {
        return Err(AppError::Client("path must not be empty".to_string()));
    }
    let target = expand_tilde(&body.path);
    std::fs::create_dir_all(&target).map_err(crate::error::ResourceError::Storage)?;
    Ok(Json(MkdirResponse { success: true }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn browse_lists_entries_sorted() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("b.txt"), b"").unwrap();
        std::fs::create_dir(dir.path().join("a-dir")).unwrap();

        let response = browse(Query(BrowseQuery { path: Some(dir.path().display().to_string()) }))
            .await
            .unwrap();
        assert_eq!(response.0.files.len(), 2);
        assert_eq!(response.0.files[0].name, "a-dir");
        assert!(response.0.files[0].is_directory);
        assert_eq!(response.0.files[1].name, "b.txt");
        assert!(!response.0.files[1].is_directory);
    }

    #[tokio::test]
    async fn mkdir_creates_missing_parents() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("a/b/c");
        let response = mkdir(Json(MkdirRequest { path: target.display().to_string() }))
            .await
            .unwrap();
        assert!(response.0.success);
        assert!(target.is_dir());
    }
}
