use anyhow::Result;
use chrono::{Local, NaiveDate, TimeDelta};
use clap::{Parser, Subcommand};
use globe_observer::config::Config;
use globe_observer::drive::DriveClient;
use globe_observer::earth_engine::{EarthEngineClient, TaskState};
use globe_observer::gee_service::{GeeService, EXPORT_EXTENSION};
use globe_observer::polygon::Polygon;
use globe_observer::render;
use globe_observer::satellite::{BandSet, SatelliteFactory};
use std::path::PathBuf;

#[derive(Parser)]
#[command(version, about = "Download satellite imagery over a polygon through Earth Engine")]
struct Cli {
    /// TOML configuration, defaults to globe_observer.toml when present
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List the satellites that can be queried
    AvailableSatellites,

    /// Export every image of a satellite over a polygon and download it
    DownloadImages {
        satellite_name: String,

        /// KML, GeoJSON or shapefile
        polygon: PathBuf,

        /// Defaults to four weeks before the end date
        #[arg(long)]
        start_date: Option<NaiveDate>,

        /// Defaults to today
        #[arg(long)]
        end_date: Option<NaiveDate>,

        /// Band groups, `rgb`, `nri` or `rgb,nri`
        #[arg(long, default_value = "rgb")]
        bands: BandSet,

        /// Export NDVI instead of the selected bands
        #[arg(long)]
        ndvi: bool,

        /// Maximum cloudy pixel percentage
        #[arg(long)]
        cloud_coverage: Option<f64>,

        /// Local directory for the downloaded images
        #[arg(long, conflicts_with = "drive_only")]
        output: Option<PathBuf>,

        /// Leave the exports in the Drive export folder instead of downloading them
        #[arg(long)]
        drive_only: bool,
    },

    /// Render bands 1-3 of a GeoTIFF as a PNG preview
    ShowRgbImage {
        file: PathBuf,

        /// Defaults to the input path with a .png extension
        #[arg(long)]
        output: Option<PathBuf>,
    },
}

fn date_window(start: Option<NaiveDate>, end: Option<NaiveDate>) -> (NaiveDate, NaiveDate) {
    let end = end.unwrap_or_else(|| Local::now().date_naive());
    let start = start.unwrap_or(end - TimeDelta::weeks(4));
    (start, end)
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    match cli.command {
        Command::AvailableSatellites => {
            for name in SatelliteFactory::list_names() {
                println!("{}", name);
            }
        }
        Command::DownloadImages {
            satellite_name,
            polygon,
            start_date,
            end_date,
            bands,
            ndvi,
            cloud_coverage,
            output,
            drive_only,
        } => {
            let config = Config::load(cli.config.as_deref())?;
            let satellite = SatelliteFactory::resolve(&satellite_name)?;
            let polygon = Polygon::load(&polygon)?;
            let (start, end) = date_window(start_date, end_date);
            let cloud_coverage = cloud_coverage.unwrap_or(config.earth_engine.cloud_coverage);
            let output = output.unwrap_or_else(|| config.drive.download_dir.clone());

            let http = reqwest::Client::new();
            let ee = EarthEngineClient::connect(http.clone(), &config.earth_engine).await?;
            let drive = DriveClient::connect(http, &config.drive).await?;

            let service = GeeService::new(satellite, polygon, &ee, &drive, &config);
            let mut collection = service
                .build_collection(start, end, cloud_coverage, bands)
                .await?;
            if ndvi {
                collection = service.compute_ndvi(&collection)?;
            }
            if drive_only {
                let (plan, tasks) = service.export_collection(&collection).await?;
                for (job, task) in plan.jobs.iter().zip(tasks.iter()) {
                    if task.state == TaskState::Completed {
                        println!("{}/{}{}", plan.folder, job.file_name, EXPORT_EXTENSION);
                    }
                }
                return Ok(());
            }
            let files = service.download_to_local(&collection, &output).await?;
            for file in files.iter() {
                println!("{}", file.display());
            }
        }
        Command::ShowRgbImage { file, output } => {
            let output = output.unwrap_or_else(|| render::default_output(&file));
            render::render_rgb(&file, &output)?;
        }
    }
    Ok(())
}
