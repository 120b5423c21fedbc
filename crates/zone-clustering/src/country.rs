//! Country resolution by polygon containment
//!
//! Polygon bounding boxes are bulk-loaded into an R-tree once, so a query
//! only tests the polygons whose box contains the point. The first polygon
//! in build order that contains the point wins; points on a polygon boundary
//! count as contained.

use crate::{LatLon, Result, ZoneError};
use geo::coordinate_position::{CoordPos, CoordinatePosition};
use geo::{BoundingRect, Coord, LineString, MultiPolygon, Polygon};
use geojson::GeoJson;
use rayon::prelude::*;
use rstar::{RTree, RTreeObject, AABB};
use std::fmt;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;
use tracing::{debug, info, warn};

/// Returned when no polygon contains the point
pub const UNKNOWN_COUNTRY: &str = "unknown";

/// Feature properties tried, in order, for the country name
const NAME_PROPERTIES: [&str; 3] = ["name", "ADMIN", "NAME"];

#[derive(Debug, Clone, PartialEq)]
pub struct CountryPolygon {
    pub name: String,
    /// Boundary in (x = longitude, y = latitude)
    pub boundary: MultiPolygon<f64>,
}

impl CountryPolygon {
    pub fn new(name: impl Into<String>, boundary: MultiPolygon<f64>) -> Self {
        Self {
            name: name.into(),
            boundary,
        }
    }

    /// Single polygon without holes from its outer ring
    pub fn from_exterior(name: impl Into<String>, ring: &[LatLon]) -> Self {
        let exterior: LineString<f64> = ring.iter().map(|p| Coord { x: p.lon, y: p.lat }).collect();
        Self::new(name, MultiPolygon::new(vec![Polygon::new(exterior, Vec::new())]))
    }

    /// Closed containment: boundary points are inside, hole interiors are not
    pub fn contains(&self, point: LatLon) -> bool {
        let coord = Coord {
            x: point.lon,
            y: point.lat,
        };
        self.boundary.coordinate_position(&coord) != CoordPos::Outside
    }
}

/// Bounding box of one polygon, tagged with its build-order position
#[derive(Clone)]
struct PolygonBox {
    idx: usize,
    env: AABB<[f64; 2]>,
}

impl RTreeObject for PolygonBox {
    type Envelope = AABB<[f64; 2]>;

    #[inline]
    fn envelope(&self) -> Self::Envelope {
        self.env
    }
}

#[derive(Clone)]
struct BoxIndex {
    tree: RTree<PolygonBox>,
}

impl BoxIndex {
    fn build(polygons: &[CountryPolygon]) -> Self {
        let boxes: Vec<PolygonBox> = polygons
            .iter()
            .enumerate()
            .filter_map(|(idx, polygon)| {
                let Some(rect) = polygon.boundary.bounding_rect() else {
                    warn!("Polygon {} has no coordinates; it will never match", polygon.name);
                    return None;
                };
                Some(PolygonBox {
                    idx,
                    env: AABB::from_corners([rect.min().x, rect.min().y], [rect.max().x, rect.max().y]),
                })
            })
            .collect();

        Self {
            tree: RTree::bulk_load(boxes),
        }
    }

    /// Polygons whose box contains the point, ascending (build order)
    fn candidates(&self, point: LatLon) -> Vec<usize> {
        let mut hits: Vec<usize> = self
            .tree
            .locate_in_envelope_intersecting(&AABB::from_point([point.lon, point.lat]))
            .map(|b| b.idx)
            .collect();
        hits.sort_unstable();
        hits
    }
}

impl fmt::Debug for BoxIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BoxIndex").field("boxes", &self.tree.size()).finish()
    }
}

/// Immutable polygon set answering point-to-country queries.
///
/// Holds no interior mutability, so one instance can be shared (`Arc`) across
/// threads and pipeline runs.
#[derive(Debug, Clone)]
pub struct CountryResolver {
    polygons: Vec<CountryPolygon>,
    index: BoxIndex,
}

impl CountryResolver {
    pub fn build(polygons: Vec<CountryPolygon>) -> Result<Self> {
        if polygons.is_empty() {
            return Err(ZoneError::EmptyPolygonSet);
        }

        let index = BoxIndex::build(&polygons);
        info!(
            "Indexed {} country polygons ({} bounding boxes)",
            polygons.len(),
            index.tree.size()
        );

        Ok(Self { polygons, index })
    }

    pub fn len(&self) -> usize {
        self.polygons.len()
    }

    pub fn is_empty(&self) -> bool {
        self.polygons.is_empty()
    }

    pub fn polygons(&self) -> &[CountryPolygon] {
        &self.polygons
    }

    /// Name of the first polygon containing the point, or [`UNKNOWN_COUNTRY`]
    pub fn resolve(&self, lat: f64, lon: f64) -> &str {
        let point = LatLon::new(lat, lon);
        if !point.is_valid() {
            return UNKNOWN_COUNTRY;
        }
        self.index
            .candidates(point)
            .into_iter()
            .map(|i| &self.polygons[i])
            .find(|p| p.contains(point))
            .map(|p| p.name.as_str())
            .unwrap_or(UNKNOWN_COUNTRY)
    }

    /// Resolve every point; output index `i` belongs to input index `i`
    pub fn resolve_many(&self, points: &[LatLon]) -> Vec<&str> {
        let resolved: Vec<&str> = points.par_iter().map(|p| self.resolve(p.lat, p.lon)).collect();
        debug!(
            "Resolved {} points ({} unknown)",
            resolved.len(),
            resolved.iter().filter(|&&c| c == UNKNOWN_COUNTRY).count()
        );
        resolved
    }
}

fn to_ring(positions: &[Vec<f64>]) -> Option<LineString<f64>> {
    positions
        .iter()
        .map(|p| match p.as_slice() {
            [x, y, ..] => Some(Coord { x: *x, y: *y }),
            _ => None,
        })
        .collect::<Option<Vec<_>>>()
        .map(LineString::new)
}

fn to_polygon(rings: &[Vec<Vec<f64>>]) -> Option<Polygon<f64>> {
    let (exterior, interiors) = rings.split_first()?;
    let interiors = interiors.iter().map(|r| to_ring(r)).collect::<Option<Vec<_>>>()?;
    Some(Polygon::new(to_ring(exterior)?, interiors))
}

fn to_multipolygon(value: &geojson::Value) -> Option<MultiPolygon<f64>> {
    match value {
        geojson::Value::Polygon(rings) => Some(MultiPolygon::new(vec![to_polygon(rings)?])),
        geojson::Value::MultiPolygon(polygons) => polygons
            .iter()
            .map(|rings| to_polygon(rings))
            .collect::<Option<Vec<_>>>()
            .map(MultiPolygon::new),
        _ => None,
    }
}

fn feature_name(feature: &geojson::Feature) -> Option<String> {
    NAME_PROPERTIES
        .iter()
        .find_map(|key| feature.property(key).and_then(|v| v.as_str()))
        .map(str::to_string)
}

/// Read country polygons from a GeoJSON FeatureCollection.
///
/// Features without a name or without polygonal geometry are skipped.
pub fn load_geojson<R: Read>(mut source: R) -> Result<Vec<CountryPolygon>> {
    let mut raw = String::new();
    source.read_to_string(&mut raw)?;

    let features = match raw.parse::<GeoJson>()? {
        GeoJson::FeatureCollection(fc) => fc.features,
        GeoJson::Feature(f) => vec![f],
        GeoJson::Geometry(_) => {
            return Err(ZoneError::Schema(
                "country polygons must be GeoJSON features with a name property".to_string(),
            ))
        }
    };

    let mut polygons = Vec::with_capacity(features.len());
    let mut skipped = 0;

    for (i, feature) in features.iter().enumerate() {
        let Some(name) = feature_name(feature) else {
            warn!("Feature {} has no name property; skipped", i);
            skipped += 1;
            continue;
        };
        let Some(boundary) = feature.geometry.as_ref().and_then(|g| to_multipolygon(&g.value)) else {
            warn!("Feature {} ({}) has no polygon geometry; skipped", i, name);
            skipped += 1;
            continue;
        };
        polygons.push(CountryPolygon::new(name, boundary));
    }

    info!(
        "Loaded {} country polygons ({} features skipped)",
        polygons.len(),
        skipped
    );

    Ok(polygons)
}

/// Read country polygons from a GeoJSON file
pub fn load_geojson_file(path: impl AsRef<Path>) -> Result<Vec<CountryPolygon>> {
    let path = path.as_ref();
    info!("Loading country polygons from {:?}", path);
    load_geojson(BufReader::new(File::open(path)?))
}
