use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum GlobeError {
    #[error("Missing satellite {name}. Available satellites are: {available}")]
    UnknownSatellite { name: String, available: String },

    #[error("Not images in the time window {start} to {end}, try another")]
    NoImagesInWindow { start: String, end: String },

    #[error("File {0} doesn't exist")]
    FileNotFound(PathBuf),

    #[error("No remote file or folder named '{0}'")]
    RemoteFileNotFound(String),

    #[error("Unsupported polygon format: {0}")]
    UnsupportedPolygonFormat(PathBuf),

    #[error("No polygon geometry found in {0}")]
    NoPolygon(PathBuf),

    #[error("Satellite {0} has no near infrared band")]
    MissingNriBand(String),

    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("The Earth Engine session failed to initialize: {0}")]
    EarthEngineInit(String),

    #[error("Remote request failed with status {status}: {body}")]
    Remote { status: u16, body: String },

    #[error("Export tasks still running after {0:?}")]
    PollTimeout(std::time::Duration),
}

/// Turns a non-success HTTP response into a `GlobeError::Remote` carrying the body.
pub async fn check_status(response: reqwest::Response) -> anyhow::Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(GlobeError::Remote {
        status: status.as_u16(),
        body,
    }
    .into())
}
