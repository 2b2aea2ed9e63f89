//! Builds Earth Engine collections for one satellite over one polygon and moves the
//! exported images to local disk through Drive.
use crate::config::Config;
use crate::drive::{self, DriveOps};
use crate::earth_engine::{EarthEngineOps, ExportTask, Expr, ImageExport, TaskState};
use crate::error::GlobeError;
use crate::export::{disambiguate_names, render_name, ExportJob, ExportPlan};
use crate::polling::wait_for_tasks;
use crate::polygon::Polygon;
use crate::satellite::{BandSet, SatelliteProfile};
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

pub const MASK_VALUE: f64 = -9999.0;
pub const NDVI_BAND: &str = "NDVI";
pub const CLOUD_PROPERTY: &str = "CLOUDY_PIXEL_PERCENTAGE";
pub const EXPORT_EXTENSION: &str = ".tif";
pub const PLAN_FILE: &str = "export_plan.json";

/// An image collection expression and the bands each of its images carries
#[derive(Debug, Clone, PartialEq)]
pub struct Collection {
    pub expr: Expr,
    pub bands: Vec<String>,
}

impl Collection {
    fn map_images(self: &Self, f: impl FnOnce(Expr) -> Expr, bands: Vec<String>) -> Self {
        Self {
            expr: Expr::call(
                "Collection.map",
                [
                    ("collection", self.expr.clone()),
                    ("baseAlgorithm", Expr::lambda(f)),
                ],
            ),
            bands,
        }
    }

    fn filter(self: &Self, filter: Expr) -> Self {
        Self {
            expr: Expr::call(
                "Collection.filter",
                [("collection", self.expr.clone()), ("filter", filter)],
            ),
            bands: self.bands.clone(),
        }
    }
}

pub struct GeeService<'a, E: EarthEngineOps, D: DriveOps> {
    satellite: SatelliteProfile,
    polygon: Polygon,
    ee: &'a E,
    drive: &'a D,
    config: &'a Config,
}

impl<'a, E: EarthEngineOps, D: DriveOps> GeeService<'a, E, D> {
    pub fn new(
        satellite: SatelliteProfile,
        polygon: Polygon,
        ee: &'a E,
        drive: &'a D,
        config: &'a Config,
    ) -> Self {
        Self {
            satellite,
            polygon,
            ee,
            drive,
            config,
        }
    }

    pub fn satellite(self: &Self) -> &SatelliteProfile {
        &self.satellite
    }

    pub fn polygon(self: &Self) -> &Polygon {
        &self.polygon
    }

    fn geometry(self: &Self) -> Expr {
        Expr::call(
            "GeometryConstructors.Polygon",
            [
                ("coordinates", Expr::constant(json!([self.polygon.coordinates()]))),
                ("evenOdd", Expr::constant(true)),
            ],
        )
    }

    fn bounds_geometry(self: &Self) -> Expr {
        Expr::call(
            "GeometryConstructors.Polygon",
            [
                (
                    "coordinates",
                    Expr::constant(json!([self.polygon.bounds_coordinates()])),
                ),
                ("evenOdd", Expr::constant(true)),
            ],
        )
    }

    /// Images of the satellite's catalog acquired in `[start, end)` over the polygon,
    /// cloud filtered when the satellite supports it, narrowed to `bands` and masked.
    pub async fn build_collection(
        self: &Self,
        start: NaiveDate,
        end: NaiveDate,
        cloud_coverage: f64,
        bands: BandSet,
    ) -> Result<Collection> {
        let band_names = self.satellite.bands(bands)?;
        let date = |d: NaiveDate| {
            Expr::call(
                "Date",
                [("value", Expr::constant(d.format("%Y-%m-%d").to_string()))],
            )
        };

        let catalog = Collection {
            expr: Expr::call(
                "ImageCollection.load",
                [("id", Expr::constant(self.satellite.catalog_id))],
            ),
            bands: band_names.clone(),
        };
        let mut collection = catalog
            .filter(Expr::call(
                "Filter.dateRangeContains",
                [
                    (
                        "leftValue",
                        Expr::call("DateRange", [("start", date(start)), ("end", date(end))]),
                    ),
                    ("rightField", Expr::constant("system:time_start")),
                ],
            ))
            .filter(Expr::call(
                "Filter.intersects",
                [
                    ("leftField", Expr::constant(".all")),
                    ("rightValue", self.geometry()),
                ],
            ));
        if self.satellite.uses_cloud_filter {
            collection = collection.filter(Expr::call(
                "Filter.lessThan",
                [
                    ("leftField", Expr::constant(CLOUD_PROPERTY)),
                    ("rightValue", Expr::constant(cloud_coverage)),
                ],
            ));
        }
        let selectors = band_names.clone();
        let collection = collection.map_images(
            |image| {
                Expr::call(
                    "Image.select",
                    [("input", image), ("bandSelectors", Expr::constant(selectors))],
                )
            },
            band_names,
        );
        let collection = self.mask_collection(&collection);

        let size = self.size(&collection).await?;
        log::info!(
            "{} images of {} between {} and {}",
            size,
            self.satellite.name,
            start,
            end
        );
        if size == 0 {
            return Err(GlobeError::NoImagesInWindow {
                start: start.to_string(),
                end: end.to_string(),
            }
            .into());
        }
        Ok(collection)
    }

    /// Masks out every pixel of every image lying outside the polygon.
    pub fn mask_collection(self: &Self, collection: &Collection) -> Collection {
        let mask_values = vec![MASK_VALUE; collection.bands.len()];
        let geometry = self.geometry();
        collection.map_images(
            |image| {
                let region = Expr::call(
                    "Image.clip",
                    [
                        (
                            "input",
                            Expr::call("Image.constant", [("value", Expr::constant(mask_values))]),
                        ),
                        ("geometry", geometry),
                    ],
                );
                Expr::call(
                    "Image.updateMask",
                    [
                        ("image", image),
                        ("mask", Expr::call("Image.mask", [("image", region)])),
                    ],
                )
            },
            collection.bands.clone(),
        )
    }

    /// `(nir - red) / (nir + red)` per image, as a single `NDVI` band.
    pub fn compute_ndvi(self: &Self, collection: &Collection) -> Result<Collection> {
        let nri = self.satellite.nri()?;
        let red = self.satellite.red_band();
        if !collection.bands.iter().any(|b| b == nri) {
            return Err(anyhow!(
                "NDVI needs the {} band, select it with --bands rgb,nri",
                nri
            ));
        }
        Ok(collection.map_images(
            |image| {
                let pair = Expr::call(
                    "Image.select",
                    [("input", image), ("bandSelectors", Expr::constant(vec![nri, red]))],
                );
                let ndvi = Expr::call(
                    "Image.normalizedDifference",
                    [("input", pair), ("bandNames", Expr::constant(vec![nri, red]))],
                );
                Expr::call(
                    "Image.rename",
                    [("input", ndvi), ("names", Expr::constant(vec![NDVI_BAND]))],
                )
            },
            vec![NDVI_BAND.to_string()],
        ))
    }

    pub async fn size(self: &Self, collection: &Collection) -> Result<u64> {
        let value = self
            .ee
            .compute_value(&Expr::call("Collection.size", [("collection", collection.expr.clone())]))
            .await?;
        value
            .as_u64()
            .ok_or(anyhow!("Unexpected collection size: {}", value))
    }

    async fn aggregate(self: &Self, collection: &Collection, property: &str) -> Result<Vec<Value>> {
        let value = self
            .ee
            .compute_value(&Expr::call(
                "AggregateFeatureCollection.array",
                [
                    ("collection", collection.expr.clone()),
                    ("property", Expr::constant(property)),
                ],
            ))
            .await?;
        match value {
            Value::Array(values) => Ok(values),
            other => Err(anyhow!("Expected a list of {}, got {}", property, other)),
        }
    }

    /// One export job per image, named from the configured pattern.
    pub async fn plan_exports(
        self: &Self,
        collection: &Collection,
        folder: &str,
    ) -> Result<ExportPlan> {
        let ee_config = &self.config.earth_engine;
        let indices = self.aggregate(collection, "system:index").await?;
        let times = self.aggregate(collection, "system:time_start").await?;
        if indices.len() != times.len() {
            return Err(anyhow!(
                "Got {} image indices but {} acquisition times",
                indices.len(),
                times.len()
            ));
        }

        let mut jobs = vec![];
        for (index, time) in indices.iter().zip(times.iter()) {
            let index = index
                .as_str()
                .ok_or(anyhow!("Invalid system:index {}", index))?;
            let date = time
                .as_i64()
                .and_then(DateTime::<Utc>::from_timestamp_millis)
                .ok_or(anyhow!("Invalid system:time_start {}", time))?
                .date_naive();
            let values = HashMap::from([
                ("satellite_name", self.satellite.name.to_string()),
                ("polygon_name", self.polygon.name().to_string()),
                ("system_date", date.format(&ee_config.date_format).to_string()),
                ("system_index", index.to_string()),
            ]);
            let file_name = render_name(&ee_config.name_pattern, &values)?;
            jobs.push(ExportJob::new(index, date, &file_name));
        }
        let renamed = disambiguate_names(&mut jobs);
        if renamed > 0 {
            log::warn!("{} images share a file name, appending their index", renamed);
        }
        Ok(ExportPlan::new(
            self.satellite.name,
            self.polygon.name(),
            folder,
            jobs,
        ))
    }

    fn image_export(
        self: &Self,
        collection: &Collection,
        job: &ExportJob,
        folder: &str,
        scale: f64,
    ) -> ImageExport {
        let image = Expr::call(
            "Collection.first",
            [(
                "collection",
                collection
                    .filter(Expr::call(
                        "Filter.equals",
                        [
                            ("leftField", Expr::constant("system:index")),
                            ("rightValue", Expr::constant(job.image_index.as_str())),
                        ],
                    ))
                    .expr,
            )],
        );
        ImageExport {
            image: Expr::call(
                "Image.clipToBoundsAndScale",
                [
                    ("input", image),
                    ("geometry", self.bounds_geometry()),
                    ("scale", Expr::constant(scale)),
                ],
            ),
            description: job.file_name.clone(),
            folder: folder.to_string(),
            file_name_prefix: job.file_name.clone(),
            max_pixels: self.config.earth_engine.max_pixels,
        }
    }

    /// Submits the plan's exports, one GeoTIFF per image.
    pub async fn submit_exports(
        self: &Self,
        collection: &Collection,
        plan: &ExportPlan,
        scale: f64,
    ) -> Result<Vec<ExportTask>> {
        let mut tasks = vec![];
        for job in plan.jobs.iter() {
            let export = self.image_export(collection, job, &plan.folder, scale);
            let task = self
                .ee
                .start_export(&export)
                .await
                .with_context(|| format!("Unable to start export of {}", job.file_name))?;
            log::info!("Submitted export {} ({})", job.file_name, task.id);
            tasks.push(task);
        }
        Ok(tasks)
    }

    /// Exports every image of the collection into a Drive folder and waits for the exports.
    pub async fn export_to_drive(
        self: &Self,
        collection: &Collection,
        folder: &str,
        scale: f64,
    ) -> Result<(ExportPlan, Vec<ExportTask>)> {
        let plan = self.plan_exports(collection, folder).await?;
        let mut tasks = self.submit_exports(collection, &plan, scale).await?;
        wait_for_tasks(self.ee, &mut tasks, &self.config.polling).await?;
        Ok((plan, tasks))
    }

    /// Exports into the configured collection folder and leaves the files in Drive.
    pub async fn export_collection(
        self: &Self,
        collection: &Collection,
    ) -> Result<(ExportPlan, Vec<ExportTask>)> {
        let ee_config = &self.config.earth_engine;
        self.export_to_drive(collection, &ee_config.export_folder, ee_config.scale)
            .await
    }

    /// Exports through the scratch Drive folder, downloads its content into `local_dir`
    /// and removes the scratch folder.
    pub async fn download_to_local(
        self: &Self,
        collection: &Collection,
        local_dir: &Path,
    ) -> Result<Vec<PathBuf>> {
        let ee_config = &self.config.earth_engine;
        let scratch = ee_config.scratch_folder.as_str();
        let (plan, tasks) = self
            .export_to_drive(collection, scratch, ee_config.scale)
            .await?;

        let completed = tasks
            .iter()
            .filter(|t| t.state == TaskState::Completed)
            .count();
        if completed == 0 {
            return Err(anyhow!("None of the {} exports completed", tasks.len()));
        }

        fs::create_dir_all(local_dir)?;
        plan.write(local_dir.join(PLAN_FILE))?;

        log::info!("Downloading to local disk...");
        let files =
            drive::download_files_from_folder(self.drive, scratch, EXPORT_EXTENSION, Some(local_dir))
                .await?;
        drive::remove_folder(self.drive, scratch).await?;
        Ok(files)
    }
}
