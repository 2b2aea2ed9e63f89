//! Region of interest loading. Every supported vector format is reduced to the same
//! canonical ring: 2D, no repeated vertices, closed, counter-clockwise.
use crate::error::GlobeError;
use anyhow::{anyhow, Context, Result};
use geo::{BoundingRect, Coord, LineString, Rect, Winding};
use geojson::GeoJson;
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolygonFormat {
    Kml,
    GeoJson,
    Shapefile,
}

impl PolygonFormat {
    pub fn from_path(path: &Path) -> Result<Self> {
        let extension = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_lowercase())
            .unwrap_or_default();
        match extension.as_str() {
            "kml" => Ok(Self::Kml),
            "geojson" | "json" => Ok(Self::GeoJson),
            "shp" => Ok(Self::Shapefile),
            _ => Err(GlobeError::UnsupportedPolygonFormat(path.to_path_buf()).into()),
        }
    }
}

/// Exterior ring as read from the file: one entry per vertex, 2 or more ordinates each.
type RawRing = Vec<Vec<f64>>;

#[derive(Debug, Clone, PartialEq)]
pub struct Polygon {
    name: String,
    exterior: LineString<f64>,
}

impl Polygon {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(GlobeError::FileNotFound(path.to_path_buf()).into());
        }
        let format = PolygonFormat::from_path(path)?;
        let raw = match format {
            PolygonFormat::Kml => read_kml_ring(path)?,
            PolygonFormat::GeoJson => read_geojson_ring(path)?,
            PolygonFormat::Shapefile => read_shapefile_ring(path)?,
        }
        .ok_or_else(|| GlobeError::NoPolygon(path.to_path_buf()))?;

        let exterior = normalize_ring(format, raw)
            .with_context(|| format!("Invalid polygon in {}", path.display()))?;
        log::debug!(
            "Loaded {:?} polygon with {} vertices from {}",
            format,
            exterior.0.len(),
            path.display()
        );
        Ok(Self {
            name: base_name(path),
            exterior,
        })
    }

    pub fn from_ring(name: &str, ring: &[(f64, f64)]) -> Result<Self> {
        let raw = ring.iter().map(|&(x, y)| vec![x, y]).collect();
        Ok(Self {
            name: name.to_string(),
            exterior: normalize_ring(PolygonFormat::GeoJson, raw)?,
        })
    }

    /// Base name of the source file, up to its first dot.
    pub fn name(self: &Self) -> &str {
        &self.name
    }

    pub fn exterior(self: &Self) -> &[Coord<f64>] {
        &self.exterior.0
    }

    pub fn bounds(self: &Self) -> Rect<f64> {
        // A normalized ring always has at least four vertices
        self.exterior
            .bounding_rect()
            .unwrap_or_else(|| Rect::new(Coord { x: 0., y: 0. }, Coord { x: 0., y: 0. }))
    }

    /// `[[x, y], ...]` as expected by GeoJSON style polygon constructors.
    pub fn coordinates(self: &Self) -> Vec<[f64; 2]> {
        self.exterior.0.iter().map(|c| [c.x, c.y]).collect()
    }

    pub fn bounds_coordinates(self: &Self) -> Vec<[f64; 2]> {
        let rect = self.bounds();
        let (min, max) = (rect.min(), rect.max());
        vec![
            [min.x, min.y],
            [max.x, min.y],
            [max.x, max.y],
            [min.x, max.y],
            [min.x, min.y],
        ]
    }
}

fn base_name(path: &Path) -> String {
    path.file_name()
        .and_then(|n| n.to_str())
        .and_then(|n| n.split('.').next())
        .unwrap_or_default()
        .to_string()
}

fn normalize_ring(format: PolygonFormat, raw: RawRing) -> Result<LineString<f64>> {
    let mut coords: Vec<Coord<f64>> = vec![];
    for position in raw {
        // KML coordinates are lon,lat[,alt]; GeoJSON positions may also carry altitude.
        // Shapefile Z/M values are already dropped by the reader.
        let (x, y) = match (format, position.as_slice()) {
            (PolygonFormat::Kml, [x, y, ..]) => (*x, *y),
            (PolygonFormat::GeoJson, [x, y, ..]) => (*x, *y),
            (PolygonFormat::Shapefile, [x, y]) => (*x, *y),
            _ => return Err(anyhow!("Malformed position {:?}", position)),
        };
        let coord = Coord { x, y };
        if coords.last() != Some(&coord) {
            coords.push(coord);
        }
    }

    let mut ring = LineString::new(coords);
    ring.close();
    if ring.0.len() < 4 {
        return Err(anyhow!("A ring needs at least three distinct vertices"));
    }
    ring.make_ccw_winding();
    Ok(ring)
}

fn read_kml_ring(path: &Path) -> Result<Option<RawRing>> {
    let content = fs::read_to_string(path)?;
    let doc = roxmltree::Document::parse(&content)?;

    let coordinates = doc
        .descendants()
        .find(|n| n.has_tag_name("outerBoundaryIs"))
        .and_then(|outer| outer.descendants().find(|n| n.has_tag_name("coordinates")))
        .and_then(|n| n.text());

    let Some(text) = coordinates else {
        return Ok(None);
    };

    let ring = text
        .split_whitespace()
        .map(|tuple| {
            tuple
                .split(',')
                .map(|v| v.trim().parse::<f64>())
                .collect::<std::result::Result<Vec<_>, _>>()
        })
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(Some(ring))
}

fn read_geojson_ring(path: &Path) -> Result<Option<RawRing>> {
    let geojson: GeoJson = fs::read_to_string(path)?.parse()?;
    let geometries: Vec<geojson::Geometry> = match geojson {
        GeoJson::FeatureCollection(collection) => collection
            .features
            .into_iter()
            .filter_map(|f| f.geometry)
            .collect(),
        GeoJson::Feature(feature) => feature.geometry.into_iter().collect(),
        GeoJson::Geometry(geometry) => vec![geometry],
    };

    let ring = geometries.into_iter().find_map(|geometry| match geometry.value {
        geojson::Value::Polygon(rings) => rings.into_iter().next(),
        geojson::Value::MultiPolygon(polygons) => {
            polygons.into_iter().next().and_then(|rings| rings.into_iter().next())
        }
        _ => None,
    });
    Ok(ring)
}

fn read_shapefile_ring(path: &Path) -> Result<Option<RawRing>> {
    use shapefile::{PolygonRing, Shape};

    fn outer<P>(rings: &[PolygonRing<P>], xy: impl Fn(&P) -> Vec<f64>) -> Option<RawRing> {
        rings.iter().find_map(|ring| match ring {
            PolygonRing::Outer(points) => Some(points.iter().map(&xy).collect()),
            PolygonRing::Inner(_) => None,
        })
    }

    let shapes = shapefile::read_shapes(path)?;
    let ring = shapes.iter().find_map(|shape| match shape {
        Shape::Polygon(p) => outer(p.rings(), |pt| vec![pt.x, pt.y]),
        Shape::PolygonM(p) => outer(p.rings(), |pt| vec![pt.x, pt.y]),
        Shape::PolygonZ(p) => outer(p.rings(), |pt| vec![pt.x, pt.y]),
        _ => None,
    });
    Ok(ring)
}
