//! Static registry of the satellites that can be queried in Earth Engine
use crate::error::GlobeError;
use anyhow::{anyhow, Result};
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SatelliteProfile {
    pub name: &'static str,
    pub catalog_id: &'static str,
    pub rgb_bands: [&'static str; 3],
    pub nri_band: Option<&'static str>,
    pub uses_cloud_filter: bool,
}

const SENTINELL2: SatelliteProfile = SatelliteProfile {
    name: "Sentinell2",
    catalog_id: "COPERNICUS/S2",
    rgb_bands: ["B4", "B3", "B2"],
    nri_band: Some("B8"),
    uses_cloud_filter: true,
};

const LANDSAT8: SatelliteProfile = SatelliteProfile {
    name: "Landsat8",
    catalog_id: "LANDSAT/LC08/C02/T1_L2",
    rgb_bands: ["SR_B4", "SR_B3", "SR_B2"],
    nri_band: Some("SR_B5"),
    uses_cloud_filter: false,
};

const REGISTRY: [SatelliteProfile; 2] = [SENTINELL2, LANDSAT8];

pub struct SatelliteFactory;

impl SatelliteFactory {
    pub fn resolve(name: &str) -> Result<SatelliteProfile> {
        REGISTRY
            .iter()
            .find(|profile| profile.name == name)
            .copied()
            .ok_or_else(|| {
                GlobeError::UnknownSatellite {
                    name: name.to_string(),
                    available: Self::list_names().join(", "),
                }
                .into()
            })
    }

    pub fn list_names() -> Vec<&'static str> {
        REGISTRY.iter().map(|profile| profile.name).collect()
    }
}

/// Band groups that can be requested for a download
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BandSet {
    pub rgb: bool,
    pub nri: bool,
}

impl Default for BandSet {
    fn default() -> Self {
        Self {
            rgb: true,
            nri: false,
        }
    }
}

impl FromStr for BandSet {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let mut set = BandSet {
            rgb: false,
            nri: false,
        };
        for group in s.split(',').map(str::trim).filter(|g| !g.is_empty()) {
            match group.to_lowercase().as_str() {
                "rgb" => set.rgb = true,
                "nri" => set.nri = true,
                other => return Err(anyhow!("Unknown band group: {}", other)),
            }
        }
        if !set.rgb && !set.nri {
            return Err(anyhow!("No band group selected"));
        }
        Ok(set)
    }
}

impl SatelliteProfile {
    /// Band names for the requested groups, rgb first.
    pub fn bands(&self, set: BandSet) -> Result<Vec<String>> {
        let mut bands = vec![];
        if set.rgb {
            bands.extend(self.rgb_bands.iter().map(|b| b.to_string()));
        }
        if set.nri {
            bands.push(self.nri()?.to_string());
        }
        Ok(bands)
    }

    pub fn red_band(&self) -> &'static str {
        self.rgb_bands[0]
    }

    pub fn nri(&self) -> Result<&'static str> {
        self.nri_band
            .ok_or_else(|| GlobeError::MissingNriBand(self.name.to_string()).into())
    }
}
