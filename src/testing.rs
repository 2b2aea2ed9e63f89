//! In-memory Drive and Earth Engine backends for tests
use crate::drive::{DriveOps, FilePage, RemoteFile, FOLDER_MIME_TYPE};
use crate::earth_engine::{EarthEngineOps, ExportTask, Expr, ImageExport, TaskState, TaskStatus};
use anyhow::{anyhow, bail, Result};
use chrono::{NaiveDate, NaiveDateTime};
use regex::Regex;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone)]
struct Entry {
    id: String,
    name: String,
    parent: Option<String>,
    is_folder: bool,
    content: Vec<u8>,
}

#[derive(Debug, Default)]
struct DriveState {
    entries: Vec<Entry>,
    next_id: usize,
    page_requests: usize,
}

impl DriveState {
    fn insert(&mut self, name: &str, parent: Option<&str>, is_folder: bool, content: &[u8]) -> String {
        self.next_id += 1;
        let id = format!("id{:04}", self.next_id);
        self.entries.push(Entry {
            id: id.clone(),
            name: name.to_string(),
            parent: parent.map(String::from),
            is_folder,
            content: content.to_vec(),
        });
        id
    }

    fn folder_id(&mut self, name: &str) -> String {
        match self.entries.iter().find(|e| e.is_folder && e.name == name) {
            Some(folder) => folder.id.clone(),
            None => self.insert(name, None, true, &[]),
        }
    }
}

/// Drive backend that evaluates the queries built by the `drive` module and serves
/// results `page_size` at a time.
pub struct FakeDrive {
    state: Arc<Mutex<DriveState>>,
    page_size: usize,
    download_dir: PathBuf,
}

impl FakeDrive {
    pub fn new(page_size: usize) -> Self {
        Self {
            state: Arc::new(Mutex::new(DriveState::default())),
            page_size,
            download_dir: PathBuf::from("results/"),
        }
    }

    pub fn with_download_dir(mut self, dir: &Path) -> Self {
        self.download_dir = dir.to_path_buf();
        self
    }

    pub fn add_folder(&self, name: &str) -> String {
        self.state.lock().unwrap().insert(name, None, true, &[])
    }

    pub fn add_file(&self, name: &str, parent: Option<&str>, content: &[u8]) -> String {
        self.state.lock().unwrap().insert(name, parent, false, content)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.state.lock().unwrap().entries.iter().any(|e| e.id == id)
    }

    pub fn page_requests(&self) -> usize {
        self.state.lock().unwrap().page_requests
    }

    fn matches(entry: &Entry, clause: &str) -> Result<bool> {
        let literal = r"'((?:[^'\\]|\\.)*)'";
        let unquote = |s: &str| s.replace("\\'", "'").replace("\\\\", "\\");

        if clause == "trashed = false" {
            return Ok(true);
        }
        if let Some(caps) = Regex::new(&format!("^name = {literal}$"))?.captures(clause) {
            return Ok(entry.name == unquote(&caps[1]));
        }
        if let Some(caps) = Regex::new(&format!("^name contains {literal}$"))?.captures(clause) {
            return Ok(entry.name.contains(&unquote(&caps[1])));
        }
        if let Some(caps) = Regex::new(&format!("^mimeType = {literal}$"))?.captures(clause) {
            return Ok(entry.is_folder == (unquote(&caps[1]) == FOLDER_MIME_TYPE));
        }
        if let Some(caps) = Regex::new(&format!("^{literal} in parents$"))?.captures(clause) {
            return Ok(entry.parent.as_deref() == Some(unquote(&caps[1]).as_str()));
        }
        bail!("Unsupported query clause: {}", clause)
    }
}

impl DriveOps for FakeDrive {
    async fn search_page(self: &Self, query: &str, page_token: Option<&str>) -> Result<FilePage> {
        let mut state = self.state.lock().unwrap();
        state.page_requests += 1;

        let mut matching = vec![];
        for entry in state.entries.iter() {
            let mut keep = true;
            for clause in query.split(" and ") {
                keep &= Self::matches(entry, clause)?;
            }
            if keep {
                matching.push(RemoteFile {
                    id: entry.id.clone(),
                    name: entry.name.clone(),
                });
            }
        }

        let offset: usize = page_token.map(|t| t.parse()).transpose()?.unwrap_or(0);
        let end = (offset + self.page_size).min(matching.len());
        Ok(FilePage {
            files: matching[offset.min(end)..end].to_vec(),
            next_page_token: (end < matching.len()).then(|| end.to_string()),
        })
    }

    async fn fetch_media(self: &Self, file_id: &str, dst: &Path) -> Result<u64> {
        let content = {
            let state = self.state.lock().unwrap();
            state
                .entries
                .iter()
                .find(|e| e.id == file_id)
                .map(|e| e.content.clone())
                .ok_or(anyhow!("404: no file {}", file_id))?
        };
        if let Some(parent) = dst.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(dst, &content)?;
        Ok(content.len() as u64)
    }

    async fn delete(self: &Self, file_id: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let before = state.entries.len();
        state
            .entries
            .retain(|e| e.id != file_id && e.parent.as_deref() != Some(file_id));
        if state.entries.len() == before {
            bail!("404: no file {}", file_id);
        }
        Ok(())
    }

    fn download_dir(self: &Self) -> &Path {
        &self.download_dir
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FakeImage {
    pub index: String,
    pub time_start: i64,
    pub cloudy_percentage: f64,
}

impl FakeImage {
    pub fn new(index: &str, date: NaiveDate, cloudy_percentage: f64) -> Self {
        let time_start = date
            .and_hms_opt(14, 37, 31)
            .map(|t| t.and_utc().timestamp_millis())
            .unwrap_or_default();
        Self {
            index: index.to_string(),
            time_start,
            cloudy_percentage,
        }
    }
}

struct FakeExport {
    folder: String,
    file_name: String,
    fails: bool,
}

#[derive(Default)]
struct EarthEngineState {
    scripts: HashMap<String, Vec<TaskState>>,
    status_requests: HashMap<String, usize>,
    exports: HashMap<String, FakeExport>,
    failing: Vec<String>,
}

/// Earth Engine backend holding a fixed catalog. It evaluates the subset of the
/// expression language the crate emits; image operations pass their input through.
/// Completed exports drop a file into the shared fake Drive.
#[derive(Default)]
pub struct FakeEarthEngine {
    catalog: Vec<FakeImage>,
    drive: Option<Arc<Mutex<DriveState>>>,
    state: Mutex<EarthEngineState>,
}

enum Evaluated {
    Images(Vec<FakeImage>),
    Value(Value),
    Filter(Box<dyn Fn(&FakeImage) -> bool>),
}

impl FakeEarthEngine {
    pub fn with_catalog(catalog: Vec<FakeImage>, drive: &FakeDrive) -> Self {
        Self {
            catalog,
            drive: Some(drive.state.clone()),
            state: Mutex::new(EarthEngineState::default()),
        }
    }

    /// States reported by successive polls of `task_id`; the last one repeats.
    pub fn script_task(&self, task_id: &str, states: Vec<TaskState>) {
        self.state
            .lock()
            .unwrap()
            .scripts
            .insert(task_id.to_string(), states);
    }

    pub fn status_requests(&self, task_id: &str) -> usize {
        let state = self.state.lock().unwrap();
        state.status_requests.get(task_id).copied().unwrap_or(0)
    }

    pub fn fail_exports_containing(&self, fragment: &str) {
        self.state.lock().unwrap().failing.push(fragment.to_string());
    }

    /// Bands an image of the collection ends up with, following renames and selections.
    pub fn selected_bands(&self, expr: &Expr) -> Option<Vec<String>> {
        fn strings(value: &Value) -> Option<Vec<String>> {
            value
                .as_array()?
                .iter()
                .map(|v| v.as_str().map(String::from))
                .collect()
        }
        fn image_bands(image: &Expr) -> Option<Vec<String>> {
            match image.function_name()? {
                "Image.rename" => strings(image.arg("names")?.as_constant()?),
                "Image.select" => strings(image.arg("bandSelectors")?.as_constant()?),
                _ => image_bands(image.arg("input").or(image.arg("image"))?),
            }
        }
        match expr.function_name()? {
            "Collection.map" => {
                let body = match expr.arg("baseAlgorithm")? {
                    Expr::Function { body, .. } => body,
                    _ => return None,
                };
                image_bands(body).or_else(|| self.selected_bands(expr.arg("collection")?))
            }
            _ => self.selected_bands(expr.arg("collection")?),
        }
    }

    fn constant<'e>(expr: &'e Expr, name: &str) -> Result<&'e Value> {
        expr.arg(name)
            .and_then(Expr::as_constant)
            .ok_or(anyhow!("Missing constant argument {}", name))
    }

    fn date_millis(expr: &Expr) -> Result<i64> {
        let value = Self::constant(expr, "value")?
            .as_str()
            .ok_or(anyhow!("Date value is not a string"))?;
        let date = NaiveDate::parse_from_str(value, "%Y-%m-%d")?;
        Ok(NaiveDateTime::from(date).and_utc().timestamp_millis())
    }

    fn images(&self, expr: &Expr) -> Result<Vec<FakeImage>> {
        match self.evaluate(expr)? {
            Evaluated::Images(images) => Ok(images),
            _ => bail!("Expected an image collection"),
        }
    }

    fn evaluate(&self, expr: &Expr) -> Result<Evaluated> {
        let function = match expr {
            Expr::Constant(value) => return Ok(Evaluated::Value(value.clone())),
            Expr::Call { function, .. } => function.as_str(),
            _ => bail!("Cannot evaluate {:?}", expr),
        };
        let arg = |name: &str| expr.arg(name).ok_or(anyhow!("{} without {}", function, name));

        let evaluated = match function {
            "ImageCollection.load" => Evaluated::Images(self.catalog.clone()),
            "Collection.map" => Evaluated::Images(self.images(arg("collection")?)?),
            "Collection.filter" => {
                let images = self.images(arg("collection")?)?;
                let Evaluated::Filter(keep) = self.evaluate(arg("filter")?)? else {
                    bail!("Collection.filter without a filter");
                };
                Evaluated::Images(images.into_iter().filter(|i| keep(i)).collect())
            }
            "Collection.first" => {
                let images = self.images(arg("collection")?)?;
                Evaluated::Images(images.into_iter().take(1).collect())
            }
            "Collection.size" => Evaluated::Value(json!(self.images(arg("collection")?)?.len())),
            "AggregateFeatureCollection.array" => {
                let images = self.images(arg("collection")?)?;
                let values = match Self::constant(expr, "property")?.as_str() {
                    Some("system:index") => images.iter().map(|i| json!(i.index)).collect(),
                    Some("system:time_start") => images.iter().map(|i| json!(i.time_start)).collect(),
                    other => bail!("Unknown property {:?}", other),
                };
                Evaluated::Value(Value::Array(values))
            }
            "Filter.dateRangeContains" => {
                let range = arg("leftValue")?;
                let start = Self::date_millis(range.arg("start").ok_or(anyhow!("no start"))?)?;
                let end = Self::date_millis(range.arg("end").ok_or(anyhow!("no end"))?)?;
                Evaluated::Filter(Box::new(move |i: &FakeImage| {
                    i.time_start >= start && i.time_start < end
                }))
            }
            "Filter.lessThan" => {
                let limit = Self::constant(expr, "rightValue")?
                    .as_f64()
                    .ok_or(anyhow!("Non numeric threshold"))?;
                Evaluated::Filter(Box::new(move |i: &FakeImage| i.cloudy_percentage < limit))
            }
            "Filter.equals" => {
                let index = Self::constant(expr, "rightValue")?
                    .as_str()
                    .ok_or(anyhow!("Non string index"))?
                    .to_string();
                Evaluated::Filter(Box::new(move |i: &FakeImage| i.index == index))
            }
            "Filter.intersects" => Evaluated::Filter(Box::new(|_: &FakeImage| true)),
            f if f.starts_with("Image.") => {
                let input = expr.arg("input").or(expr.arg("image"));
                self.evaluate(input.ok_or(anyhow!("{} without input", f))?)?
            }
            other => bail!("Unsupported function {}", other),
        };
        Ok(evaluated)
    }
}

impl EarthEngineOps for FakeEarthEngine {
    async fn compute_value(self: &Self, expr: &Expr) -> Result<Value> {
        match self.evaluate(expr)? {
            Evaluated::Value(value) => Ok(value),
            Evaluated::Images(images) => Ok(json!(images.len())),
            Evaluated::Filter(_) => bail!("A filter is not a value"),
        }
    }

    async fn start_export(self: &Self, export: &ImageExport) -> Result<ExportTask> {
        let images = self.images(&export.image)?;
        if images.len() != 1 {
            bail!("Export expression yields {} images", images.len());
        }
        let mut state = self.state.lock().unwrap();
        let id = format!("projects/fake/operations/{}", state.exports.len());
        let fails = state
            .failing
            .iter()
            .any(|f| export.file_name_prefix.contains(f.as_str()));
        state.scripts.insert(
            id.clone(),
            vec![
                TaskState::Pending,
                TaskState::Running,
                if fails { TaskState::Failed } else { TaskState::Completed },
            ],
        );
        state.exports.insert(
            id.clone(),
            FakeExport {
                folder: export.folder.clone(),
                file_name: format!("{}.tif", export.file_name_prefix),
                fails,
            },
        );
        Ok(ExportTask {
            id,
            file_name: export.file_name_prefix.clone(),
            state: TaskState::Pending,
            error: None,
        })
    }

    async fn task_status(self: &Self, task_id: &str) -> Result<TaskStatus> {
        let mut state = self.state.lock().unwrap();
        let polls = state.status_requests.entry(task_id.to_string()).or_insert(0);
        *polls += 1;
        let poll = *polls;

        let script = state
            .scripts
            .get(task_id)
            .ok_or(anyhow!("Unknown task {}", task_id))?;
        let task_state = script[(poll - 1).min(script.len() - 1)];

        if task_state == TaskState::Completed && poll == script.len() {
            if let (Some(export), Some(drive)) = (state.exports.get(task_id), &self.drive) {
                let mut drive = drive.lock().unwrap();
                let folder = drive.folder_id(&export.folder);
                drive.insert(&export.file_name, Some(folder.as_str()), false, b"GeoTIFF");
            }
        }
        let error = state
            .exports
            .get(task_id)
            .filter(|e| e.fails && task_state == TaskState::Failed)
            .map(|_| "Export too large".to_string());
        Ok(TaskStatus {
            state: task_state,
            error,
        })
    }
}
