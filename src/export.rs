use anyhow::{anyhow, Result};
use chrono::NaiveDate;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::Path;

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct ExportJob {
    pub image_index: String,
    pub image_date: NaiveDate,
    pub file_name: String,
}

impl ExportJob {
    pub fn new(image_index: &str, image_date: NaiveDate, file_name: &str) -> Self {
        ExportJob {
            image_index: image_index.to_string(),
            image_date,
            file_name: file_name.to_string(),
        }
    }
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct ExportPlan {
    pub satellite: String,
    pub polygon: String,
    pub folder: String,
    pub jobs: Vec<ExportJob>,
}

impl ExportPlan {
    pub fn new(satellite: &str, polygon: &str, folder: &str, jobs: Vec<ExportJob>) -> Self {
        Self {
            satellite: satellite.to_string(),
            polygon: polygon.to_string(),
            folder: folder.to_string(),
            jobs,
        }
    }

    pub fn read<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        let plan: Self = serde_json::from_str(&content)?;
        Ok(plan)
    }

    pub fn write<P: AsRef<Path>>(self: &Self, path: P) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }
}

/// Fills `{placeholder}` fields of a file name pattern. Unknown placeholders are an error.
pub fn render_name(pattern: &str, values: &HashMap<&str, String>) -> Result<String> {
    let re = Regex::new(r"\{(?<key>[A-Za-z_]+)\}").expect("Regex pattern should always compile");

    let mut missing = vec![];
    let name = re.replace_all(pattern, |caps: &regex::Captures| {
        let key = &caps["key"];
        match values.get(key) {
            Some(value) => value.clone(),
            None => {
                missing.push(key.to_string());
                String::new()
            }
        }
    });
    if !missing.is_empty() {
        return Err(anyhow!(
            "Unknown placeholders in name pattern {}: {}",
            pattern,
            missing.join(", ")
        ));
    }
    Ok(sanitize(&name))
}

/// Images sharing a rendered name, such as two tiles acquired the same day, get their
/// image index appended so each one is exported to its own file.
pub fn disambiguate_names(jobs: &mut [ExportJob]) -> usize {
    let mut counts: HashMap<String, usize> = HashMap::new();
    for job in jobs.iter() {
        *counts.entry(job.file_name.clone()).or_default() += 1;
    }
    let mut renamed = 0;
    for job in jobs.iter_mut().filter(|j| counts[&j.file_name] > 1) {
        job.file_name = format!("{}_{}", job.file_name, sanitize(&job.image_index));
        renamed += 1;
    }
    renamed
}

/// Drive file names may not carry path separators.
fn sanitize(name: &str) -> String {
    name.replace(['/', '\\'], "-")
}
