//! Google Drive search, download and delete helpers built on top of the paginated
//! `files.list` call.
mod client;
pub use client::DriveClient;

use crate::error::GlobeError;
use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

pub const FOLDER_MIME_TYPE: &str = "application/vnd.google-apps.folder";

#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct RemoteFile {
    pub id: String,
    pub name: String,
}

#[derive(Deserialize, Debug, Default)]
#[serde(rename_all = "camelCase")]
pub struct FilePage {
    #[serde(default)]
    pub files: Vec<RemoteFile>,
    pub next_page_token: Option<String>,
}

pub trait DriveOps {
    async fn search_page(self: &Self, query: &str, page_token: Option<&str>) -> Result<FilePage>;

    /// Writes the content of a file to `dst`, returning the number of bytes on disk.
    async fn fetch_media(self: &Self, file_id: &str, dst: &Path) -> Result<u64>;

    async fn delete(self: &Self, file_id: &str) -> Result<()>;

    /// Where downloads land when the caller names no directory.
    fn download_dir(self: &Self) -> &Path;
}

/// Quotes a value for use inside a Drive query.
pub fn quote(value: &str) -> String {
    format!("'{}'", value.replace('\\', "\\\\").replace('\'', "\\'"))
}

/// Runs a search to exhaustion, keeping the backend's order.
pub async fn search(drive: &impl DriveOps, query: &str) -> Result<Vec<RemoteFile>> {
    let mut files = vec![];
    let mut page_token: Option<String> = None;
    loop {
        let page = drive.search_page(query, page_token.as_deref()).await?;
        files.extend(page.files);
        match page.next_page_token {
            Some(token) if !token.is_empty() => page_token = Some(token),
            _ => break,
        }
    }
    log::debug!("Query [{}] matched {} files", query, files.len());
    Ok(files)
}

pub async fn find_folders(drive: &impl DriveOps, name: &str) -> Result<Vec<RemoteFile>> {
    let query = format!(
        "name = {} and mimeType = {} and trashed = false",
        quote(name),
        quote(FOLDER_MIME_TYPE)
    );
    search(drive, &query).await
}

/// Files whose name contains `extension`, inside `folder` when one is named.
/// The first folder with that exact name is used.
pub async fn list_files(
    drive: &impl DriveOps,
    folder: Option<&str>,
    extension: &str,
) -> Result<Vec<RemoteFile>> {
    let mut query = format!("name contains {} and trashed = false", quote(extension));
    if let Some(folder) = folder {
        let folders = find_folders(drive, folder).await?;
        let folder = folders
            .first()
            .ok_or_else(|| GlobeError::RemoteFileNotFound(folder.to_string()))?;
        query.push_str(&format!(" and {} in parents", quote(&folder.id)));
    }
    search(drive, &query).await
}

fn extension_of(name: &str) -> Result<String> {
    name.rsplit_once('.')
        .map(|(_, ext)| format!(".{}", ext))
        .ok_or(anyhow!("File name {} has no extension", name))
}

/// First file, in listing order, whose name is exactly `name`.
pub async fn find_file(drive: &impl DriveOps, name: &str) -> Result<RemoteFile> {
    let extension = extension_of(name)?;
    list_files(drive, None, &extension)
        .await?
        .into_iter()
        .find(|file| file.name == name)
        .ok_or_else(|| GlobeError::RemoteFileNotFound(name.to_string()).into())
}

pub async fn download_file(
    drive: &impl DriveOps,
    name: &str,
    dest_dir: Option<&Path>,
) -> Result<PathBuf> {
    let file = find_file(drive, name).await?;
    let dst = dest_dir.unwrap_or(drive.download_dir()).join(&file.name);
    drive.fetch_media(&file.id, &dst).await?;
    Ok(dst)
}

/// Downloads every matching file of a folder. A failed file does not stop the others;
/// the call fails afterwards if any file failed.
pub async fn download_files_from_folder(
    drive: &impl DriveOps,
    folder: &str,
    extension: &str,
    dest_dir: Option<&Path>,
) -> Result<Vec<PathBuf>> {
    let dest_dir = dest_dir.unwrap_or(drive.download_dir());
    let files = list_files(drive, Some(folder), extension).await?;

    let mut downloaded = vec![];
    let mut failures = 0;
    for (i, file) in files.iter().enumerate() {
        log::info!("Downloading {} ({}/{})", file.name, i + 1, files.len());
        let dst = dest_dir.join(&file.name);
        match drive.fetch_media(&file.id, &dst).await {
            Ok(_) => downloaded.push(dst),
            Err(e) => {
                log::warn!("Failed to download {}: {:#}", file.name, e);
                failures += 1;
            }
        }
    }
    if failures > 0 {
        return Err(anyhow!(
            "{} of {} files from {} failed to download",
            failures,
            files.len(),
            folder
        ));
    }
    Ok(downloaded)
}

pub async fn remove_file(drive: &impl DriveOps, name: &str) -> Result<()> {
    let file = find_file(drive, name).await?;
    drive.delete(&file.id).await
}

pub async fn remove_files_from_folder(
    drive: &impl DriveOps,
    folder: &str,
    extension: &str,
) -> Result<usize> {
    let files = list_files(drive, Some(folder), extension).await?;
    let mut failures = 0;
    for file in files.iter() {
        if let Err(e) = drive.delete(&file.id).await {
            log::warn!("Failed to remove {}: {:#}", file.name, e);
            failures += 1;
        }
    }
    if failures > 0 {
        return Err(anyhow!(
            "{} of {} files from {} could not be removed",
            failures,
            files.len(),
            folder
        ));
    }
    Ok(files.len())
}

pub async fn remove_folder(drive: &impl DriveOps, name: &str) -> Result<()> {
    let folders = find_folders(drive, name).await?;
    let folder = folders
        .first()
        .ok_or_else(|| GlobeError::RemoteFileNotFound(name.to_string()))?;
    drive.delete(&folder.id).await
}
