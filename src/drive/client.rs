use super::{DriveOps, FilePage};
use crate::auth::Authenticator;
use crate::config::DriveConfig;
use crate::error::check_status;
use anyhow::Result;
use futures_util::TryStreamExt;
use reqwest::header::RANGE;
use reqwest::StatusCode;
use std::fs;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use url::Url;

const DRIVE_API: &str = "https://www.googleapis.com/drive/v3/";
const PAGE_SIZE: &str = "100";

pub struct DriveClient {
    http: reqwest::Client,
    auth: Authenticator,
    base_url: Url,
    download_dir: PathBuf,
}

impl DriveClient {
    pub async fn connect(http: reqwest::Client, config: &DriveConfig) -> Result<Self> {
        let auth = Authenticator::drive(http.clone(), config).await?;
        Ok(Self {
            http,
            auth,
            base_url: Url::parse(DRIVE_API)?,
            download_dir: config.download_dir.clone(),
        })
    }

    fn file_url(self: &Self, file_id: &str) -> Result<Url> {
        Ok(self.base_url.join(&format!("files/{}", file_id))?)
    }
}

impl DriveOps for DriveClient {
    async fn search_page(self: &Self, query: &str, page_token: Option<&str>) -> Result<FilePage> {
        let mut url = self.base_url.join("files")?;
        {
            let mut params = url.query_pairs_mut();
            params
                .append_pair("q", query)
                .append_pair("spaces", "drive")
                .append_pair("pageSize", PAGE_SIZE)
                .append_pair("fields", "nextPageToken, files(id, name)");
            if let Some(token) = page_token {
                params.append_pair("pageToken", token);
            }
        }
        log::debug!("GET {}", url);
        let response = self
            .http
            .get(url)
            .bearer_auth(self.auth.bearer().await?)
            .send()
            .await?;
        let page = check_status(response).await?.json::<FilePage>().await?;
        Ok(page)
    }

    /// Streams the file into `<dst>.partial` and renames it once complete. An existing
    /// partial file is resumed with a range request; an existing `dst` is left alone.
    async fn fetch_media(self: &Self, file_id: &str, dst: &Path) -> Result<u64> {
        if dst.exists() {
            log::warn!("Output file {} already exists", dst.display());
            return Ok(dst.metadata()?.len());
        }

        // Make parent directories as necessary
        if let Some(parent_dir) = dst.parent() {
            if !parent_dir.as_os_str().is_empty() && !parent_dir.exists() {
                fs::create_dir_all(parent_dir)?;
            }
        }

        let partial = PathBuf::from(format!("{}.partial", dst.display()));
        let mut byte_count = match partial.exists() {
            true => partial.metadata()?.len(),
            false => 0,
        };

        let mut url = self.file_url(file_id)?;
        url.query_pairs_mut().append_pair("alt", "media");
        let mut request = self.http.get(url).bearer_auth(self.auth.bearer().await?);
        if byte_count > 0 {
            log::info!("Resuming {} from byte {}", dst.display(), byte_count);
            request = request.header(RANGE, format!("bytes={}-", byte_count));
        }
        let response = request.send().await?;

        match response.status() {
            StatusCode::RANGE_NOT_SATISFIABLE if byte_count > 0 => {
                log::debug!("{} was already complete", partial.display());
            }
            status => {
                // Nothing touches the disk until the server accepted the request
                let response = check_status(response).await?;
                let resumed = byte_count > 0 && status == StatusCode::PARTIAL_CONTENT;
                if !resumed {
                    byte_count = 0;
                }
                let mut partial_file = OpenOptions::new()
                    .create(true)
                    .write(true)
                    .append(resumed)
                    .truncate(!resumed)
                    .open(&partial)?;
                let mut body = std::pin::pin!(response.bytes_stream());
                while let Some(bytes) = body.try_next().await? {
                    partial_file.write_all(&bytes)?;
                    byte_count += bytes.len() as u64;
                }
            }
        }

        // Rename the file to remove .partial suffix
        fs::rename(&partial, dst)?;
        log::debug!("Wrote {} bytes to {}", byte_count, dst.display());
        Ok(byte_count)
    }

    async fn delete(self: &Self, file_id: &str) -> Result<()> {
        let url = self.file_url(file_id)?;
        log::debug!("DELETE {}", url);
        let response = self
            .http
            .delete(url)
            .bearer_auth(self.auth.bearer().await?)
            .send()
            .await?;
        check_status(response).await?;
        Ok(())
    }

    fn download_dir(self: &Self) -> &Path {
        &self.download_dir
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::StoredToken;
    use axum::extract::Path as UrlPath;
    use axum::http::StatusCode as HttpStatus;
    use axum::routing::get;
    use axum::Router;
    use tokio::net::TcpListener;

    async fn media(UrlPath(id): UrlPath<String>) -> (HttpStatus, Vec<u8>) {
        match id.as_str() {
            "scene" => (HttpStatus::OK, b"GeoTIFF bytes".to_vec()),
            "forbidden" => (HttpStatus::FORBIDDEN, b"insufficient permissions".to_vec()),
            _ => (HttpStatus::NOT_FOUND, b"not found".to_vec()),
        }
    }

    async fn serve_drive() -> DriveClient {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let app = Router::new().route("/files/{id}", get(media));
        tokio::spawn(async move {
            axum::serve(listener, app).await.ok();
        });

        let token = StoredToken {
            access_token: "ya29.token".to_string(),
            refresh_token: None,
            expires_at: Some(chrono::Utc::now() + chrono::Duration::hours(1)),
            scopes: vec![],
        };
        DriveClient {
            http: reqwest::Client::new(),
            auth: Authenticator::with_token(token),
            base_url: Url::parse(&format!("http://127.0.0.1:{port}/")).unwrap(),
            download_dir: PathBuf::from("results/"),
        }
    }

    #[tokio::test]
    async fn test_fetch_media_writes_file() {
        let dir = tempfile::tempdir().unwrap();
        let drive = serve_drive().await;
        let dst = dir.path().join("scene.tif");

        let bytes = drive.fetch_media("scene", &dst).await.unwrap();
        assert_eq!(bytes, 13);
        assert_eq!(fs::read(&dst).unwrap(), b"GeoTIFF bytes");
        assert!(!dir.path().join("scene.tif.partial").exists());
    }

    #[tokio::test]
    async fn test_failed_fetch_leaves_no_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let drive = serve_drive().await;

        for id in ["forbidden", "missing"] {
            let dst = dir.path().join(format!("{id}.tif"));
            let err = drive.fetch_media(id, &dst).await.unwrap_err();
            assert!(matches!(
                err.downcast_ref::<crate::error::GlobeError>(),
                Some(crate::error::GlobeError::Remote { .. })
            ));
            assert!(!dst.exists());
            assert!(!dir.path().join(format!("{id}.tif.partial")).exists());
        }
    }
}
