//! Preview rendering of downloaded GeoTIFF exports
use crate::error::GlobeError;
use crate::gee_service::MASK_VALUE;
use anyhow::{anyhow, Result};
use image::{Rgb, RgbImage};
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use tiff::decoder::{Decoder, DecodingResult};

const LOW_PERCENTILE: f64 = 2.0;
const HIGH_PERCENTILE: f64 = 98.0;

/// A decoded raster with pixel interleaved bands
pub struct Raster {
    pub width: usize,
    pub height: usize,
    pub bands: usize,
    pub data: Vec<f64>,
}

impl Raster {
    pub fn open(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(GlobeError::FileNotFound(path.to_path_buf()).into());
        }
        let reader = BufReader::new(File::open(path)?);
        let mut decoder = Decoder::new(reader)?;
        let (w, h) = decoder.dimensions()?;
        let data: Vec<f64> = match decoder.read_image()? {
            DecodingResult::U8(data) => data.iter().map(|&x| x as f64).collect(),
            DecodingResult::U16(data) => data.iter().map(|&x| x as f64).collect(),
            DecodingResult::U32(data) => data.iter().map(|&x| x as f64).collect(),
            DecodingResult::U64(data) => data.iter().map(|&x| x as f64).collect(),
            DecodingResult::I8(data) => data.iter().map(|&x| x as f64).collect(),
            DecodingResult::I16(data) => data.iter().map(|&x| x as f64).collect(),
            DecodingResult::I32(data) => data.iter().map(|&x| x as f64).collect(),
            DecodingResult::I64(data) => data.iter().map(|&x| x as f64).collect(),
            DecodingResult::F32(data) => data.iter().map(|&x| x as f64).collect(),
            DecodingResult::F64(data) => data,
        };

        let (width, height) = (w as usize, h as usize);
        let pixels = width * height;
        if pixels == 0 || data.len() % pixels != 0 {
            return Err(anyhow!(
                "{}: {} samples do not fit a {}x{} raster",
                path.display(),
                data.len(),
                width,
                height
            ));
        }
        Ok(Self {
            width,
            height,
            bands: data.len() / pixels,
            data,
        })
    }

    pub fn band(self: &Self, index: usize) -> Vec<f64> {
        self.data
            .iter()
            .skip(index)
            .step_by(self.bands)
            .copied()
            .collect()
    }
}

fn is_valid(value: f64) -> bool {
    !value.is_nan() && value != MASK_VALUE
}

/// Scales valid values into `[0, 1]`; invalid ones become NaN.
pub fn normalize(band: &[f64]) -> Vec<f64> {
    let (min, max) = band
        .iter()
        .filter(|v| is_valid(**v))
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &v| {
            (lo.min(v), hi.max(v))
        });
    let range = max - min;
    band.iter()
        .map(|&v| match is_valid(v) {
            true if range > 0.0 => (v - min) / range,
            true => 0.0,
            false => f64::NAN,
        })
        .collect()
}

/// Linear interpolated percentile of the non NaN values.
pub fn percentile(values: &[f64], p: f64) -> Option<f64> {
    let mut sorted: Vec<f64> = values.iter().copied().filter(|v| !v.is_nan()).collect();
    if sorted.is_empty() {
        return None;
    }
    sorted.sort_by(f64::total_cmp);
    let rank = (p / 100.0).clamp(0.0, 1.0) * (sorted.len() - 1) as f64;
    let (below, above) = (rank.floor() as usize, rank.ceil() as usize);
    Some(sorted[below] + (sorted[above] - sorted[below]) * (rank - below as f64))
}

/// Renders bands 1-3 of `input` as an 8-bit RGB PNG at `output`.
pub fn render_rgb(input: &Path, output: &Path) -> Result<()> {
    let raster = Raster::open(input)?;
    if raster.bands < 3 {
        return Err(anyhow!(
            "{} has {} band(s), an RGB preview needs 3",
            input.display(),
            raster.bands
        ));
    }
    let channels: Vec<Vec<f64>> = (0..3).map(|b| normalize(&raster.band(b))).collect();

    let stacked: Vec<f64> = channels.iter().flatten().copied().collect();
    let low = percentile(&stacked, LOW_PERCENTILE)
        .ok_or(anyhow!("{} has no valid pixels", input.display()))?;
    let high = percentile(&stacked, HIGH_PERCENTILE).unwrap_or(low);
    log::debug!("Stretching {} between {:.4} and {:.4}", input.display(), low, high);

    let to_byte = |v: f64| -> u8 {
        if v.is_nan() {
            return 0;
        }
        let scaled = if high > low { (v - low) / (high - low) } else { 0.0 };
        (scaled.clamp(0.0, 1.0) * 255.0).round() as u8
    };
    let mut img = RgbImage::new(raster.width as u32, raster.height as u32);
    for (i, pixel) in img.pixels_mut().enumerate() {
        *pixel = Rgb([
            to_byte(channels[0][i]),
            to_byte(channels[1][i]),
            to_byte(channels[2][i]),
        ]);
    }
    img.save(output)?;
    log::info!("Wrote {}", output.display());
    Ok(())
}

/// `scene.tif` previews to `scene.png`.
pub fn default_output(input: &Path) -> PathBuf {
    input.with_extension("png")
}
