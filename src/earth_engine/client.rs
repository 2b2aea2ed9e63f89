use super::{EarthEngineOps, ExportTask, Expr, ImageExport, TaskState, TaskStatus};
use crate::auth::Authenticator;
use crate::config::EarthEngineConfig;
use crate::error::{check_status, GlobeError};
use anyhow::{anyhow, Result};
use serde::Deserialize;
use serde_json::{json, Value};
use url::Url;

const EARTH_ENGINE_API: &str = "https://earthengine.googleapis.com/v1/";

pub struct EarthEngineClient {
    http: reqwest::Client,
    auth: Authenticator,
    base_url: Url,
    project: String,
}

#[derive(Deserialize, Debug)]
struct Operation {
    name: String,
    #[serde(default)]
    done: bool,
    metadata: Option<OperationMetadata>,
    error: Option<OperationError>,
}

#[derive(Deserialize, Debug)]
struct OperationMetadata {
    state: Option<String>,
}

#[derive(Deserialize, Debug)]
struct OperationError {
    message: Option<String>,
}

impl Operation {
    fn status(self: &Self) -> TaskStatus {
        let state = match (self.metadata.as_ref().and_then(|m| m.state.as_deref()), self.done) {
            (Some(state), _) => TaskState::from_remote(state),
            (None, true) if self.error.is_some() => TaskState::Failed,
            (None, true) => TaskState::Completed,
            (None, false) => TaskState::Pending,
        };
        TaskStatus {
            state,
            error: self
                .error
                .as_ref()
                .map(|e| e.message.clone().unwrap_or_else(|| "unknown error".to_string())),
        }
    }
}

impl EarthEngineClient {
    /// Authenticates against Earth Engine and checks the session with a trivial
    /// computation. Fails with `GlobeError::EarthEngineInit` if either step fails.
    pub async fn connect(http: reqwest::Client, config: &EarthEngineConfig) -> Result<Self> {
        let auth = Authenticator::earth_engine(http.clone(), config).await?;
        let client = Self {
            http,
            auth,
            base_url: Url::parse(EARTH_ENGINE_API)?,
            project: config.project.clone(),
        };
        client
            .compute_value(&Expr::constant(1))
            .await
            .map_err(|e| GlobeError::EarthEngineInit(format!("{:#}", e)))?;
        log::info!("Earth Engine session ready for project {}", client.project);
        Ok(client)
    }

    fn project_url(self: &Self, method: &str) -> Result<Url> {
        Ok(self
            .base_url
            .join(&format!("projects/{}/{}", self.project, method))?)
    }

    async fn post(self: &Self, url: Url, body: &Value) -> Result<reqwest::Response> {
        log::debug!("POST {}", url);
        let response = self
            .http
            .post(url)
            .bearer_auth(self.auth.bearer().await?)
            .json(body)
            .send()
            .await?;
        check_status(response).await
    }
}

impl EarthEngineOps for EarthEngineClient {
    async fn compute_value(self: &Self, expr: &Expr) -> Result<Value> {
        let url = self.project_url("value:compute")?;
        let body = json!({ "expression": expr.encode() });
        let mut response: Value = self.post(url, &body).await?.json().await?;
        response
            .get_mut("result")
            .map(Value::take)
            .ok_or(anyhow!("value:compute response without result"))
    }

    async fn start_export(self: &Self, export: &ImageExport) -> Result<ExportTask> {
        let url = self.project_url("image:export")?;
        let body = json!({
            "expression": export.image.encode(),
            "description": export.description,
            "fileExportOptions": {
                "fileFormat": "GEO_TIFF",
                "driveDestination": {
                    "folder": export.folder,
                    "filenamePrefix": export.file_name_prefix,
                },
            },
            // int64 fields travel as strings
            "maxPixels": format!("{:.0}", export.max_pixels),
        });
        let operation: Operation = self.post(url, &body).await?.json().await?;
        log::debug!("Started export {} as {}", export.description, operation.name);

        let status = operation.status();
        Ok(ExportTask {
            id: operation.name,
            file_name: export.file_name_prefix.clone(),
            state: status.state,
            error: status.error,
        })
    }

    async fn task_status(self: &Self, task_id: &str) -> Result<TaskStatus> {
        let url = self.base_url.join(task_id)?;
        let response = self
            .http
            .get(url)
            .bearer_auth(self.auth.bearer().await?)
            .send()
            .await?;
        let operation: Operation = check_status(response).await?.json().await?;
        Ok(operation.status())
    }
}
