//! Conversion of Esri JSON records into destination rows.

use crate::service::{EsriFieldType, FieldSpec, GeometryKind};
use crate::types::Value;
use chrono::{DateTime, Utc};
use geo_types::{Coord, Geometry, LineString, MultiLineString, MultiPoint, MultiPolygon, Point, Polygon};
use serde::Deserialize;
use serde_json::Map;
use thiserror::Error;

/// Integer parts with at least this many digits are read as milliseconds.
const MILLISECOND_DIGITS: usize = 13;

/// A feature as returned by a `/query` request.
#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
pub struct RemoteRecord {
    #[serde(default)]
    pub geometry: Option<serde_json::Value>,
    #[serde(default)]
    pub attributes: Option<Map<String, serde_json::Value>>,
}

impl RemoteRecord {
    pub fn attribute(&self, name: &str) -> Option<&serde_json::Value> {
        self.attributes.as_ref()?.get(name)
    }
}

/// A record ready to be written: the geometry, then one value per
/// non-geometry field, in field order.
#[derive(Clone, Debug, PartialEq)]
pub struct LocalRow {
    pub geometry: Geometry<f64>,
    pub attributes: Vec<Value>,
}

/// Why a record's geometry could not be built. The record is skipped.
#[derive(Clone, Debug, PartialEq, Error)]
pub enum GeometryError {
    #[error("geometry is null or empty")]
    Null,
    #[error("geometry has no `{0}` member")]
    MissingPart(&'static str),
    #[error("invalid coordinate: {0}")]
    InvalidCoordinate(String),
    #[error("unsupported geometry kind: {0:?}")]
    UnsupportedKind(GeometryKind),
}

pub fn transform(
    record: &RemoteRecord,
    kind: GeometryKind,
    fields: &[FieldSpec],
) -> Result<LocalRow, GeometryError> {
    let geometry = decode_geometry(record.geometry.as_ref(), kind)?;
    let attributes = fields
        .iter()
        .filter(|field| !field.is_geometry())
        .map(|field| coerce_attribute(record.attribute(&field.name), field))
        .collect();
    Ok(LocalRow {
        geometry,
        attributes,
    })
}

fn coerce_attribute(raw: Option<&serde_json::Value>, field: &FieldSpec) -> Value {
    match raw {
        None => Value::Null,
        Some(raw) if field.field_type == EsriFieldType::Date => {
            decode_timestamp(raw).map_or(Value::Null, Value::DateTime)
        }
        Some(raw) => Value::from_json(raw),
    }
}

/// Read an Esri date value as UTC.
///
/// Services usually send milliseconds since the epoch but some send
/// seconds; 13 or more digits in the integer part means milliseconds.
pub fn decode_timestamp(raw: &serde_json::Value) -> Option<DateTime<Utc>> {
    let serde_json::Value::Number(n) = raw else {
        return None;
    };

    if let Some(i) = n.as_i64() {
        return if i.unsigned_abs().to_string().len() >= MILLISECOND_DIGITS {
            DateTime::from_timestamp_millis(i)
        } else {
            DateTime::from_timestamp(i, 0)
        };
    }

    let f = n.as_f64().filter(|f| f.is_finite())?;
    let integer_digits = format!("{:.0}", f.abs().trunc()).len();
    let secs = if integer_digits >= MILLISECOND_DIGITS {
        f / 1000.0
    } else {
        f
    };
    let whole = secs.floor();
    if whole < i64::MIN as f64 || whole > i64::MAX as f64 {
        return None;
    }
    let nanos = (((secs - whole) * 1e9).round() as u32).min(999_999_999);
    DateTime::from_timestamp(whole as i64, nanos)
}

fn decode_geometry(
    geometry: Option<&serde_json::Value>,
    kind: GeometryKind,
) -> Result<Geometry<f64>, GeometryError> {
    let Some(serde_json::Value::Object(geometry)) = geometry else {
        return Err(GeometryError::Null);
    };

    match kind {
        GeometryKind::Point => decode_point(geometry),
        GeometryKind::MultiPoint => {
            let points = parts(geometry, "points")?
                .iter()
                .map(|p| coord(p).map(Point::from))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(MultiPoint::new(points).into())
        }
        GeometryKind::Polyline => {
            let paths = parts(geometry, "paths")?
                .iter()
                .map(line_string)
                .collect::<Result<Vec<_>, _>>()?;
            Ok(MultiLineString::new(paths).into())
        }
        GeometryKind::Polygon => {
            let rings = parts(geometry, "rings")?
                .iter()
                .map(line_string)
                .collect::<Result<Vec<_>, _>>()?;
            Ok(group_rings(rings).into())
        }
        GeometryKind::Unknown => Err(GeometryError::UnsupportedKind(kind)),
    }
}

fn decode_point(geometry: &Map<String, serde_json::Value>) -> Result<Geometry<f64>, GeometryError> {
    let x = geometry.get("x").and_then(number);
    let y = geometry.get("y").and_then(number);
    match (x, y) {
        (Some(x), Some(y)) => Ok(Point::new(x, y).into()),
        _ => Err(GeometryError::Null),
    }
}

/// The non-empty array stored under `key`.
fn parts<'a>(
    geometry: &'a Map<String, serde_json::Value>,
    key: &'static str,
) -> Result<&'a [serde_json::Value], GeometryError> {
    match geometry.get(key) {
        None | Some(serde_json::Value::Null) => Err(GeometryError::MissingPart(key)),
        Some(serde_json::Value::Array(parts)) if parts.is_empty() => Err(GeometryError::Null),
        Some(serde_json::Value::Array(parts)) => Ok(parts),
        Some(other) => Err(GeometryError::InvalidCoordinate(other.to_string())),
    }
}

fn line_string(path: &serde_json::Value) -> Result<LineString<f64>, GeometryError> {
    let points = path
        .as_array()
        .ok_or_else(|| GeometryError::InvalidCoordinate(path.to_string()))?;
    points
        .iter()
        .map(coord)
        .collect::<Result<Vec<_>, _>>()
        .map(LineString::new)
}

// [x, y] or [x, y, z, m]; only x and y are kept.
fn coord(value: &serde_json::Value) -> Result<Coord<f64>, GeometryError> {
    let invalid = || GeometryError::InvalidCoordinate(value.to_string());
    let pair = value.as_array().filter(|p| p.len() >= 2).ok_or_else(invalid)?;
    let x = number(&pair[0]).ok_or_else(invalid)?;
    let y = number(&pair[1]).ok_or_else(invalid)?;
    Ok(Coord { x, y })
}

fn number(value: &serde_json::Value) -> Option<f64> {
    let n = match value {
        serde_json::Value::Number(n) => n.as_f64(),
        serde_json::Value::String(s) => s.trim().parse().ok(),
        _ => None,
    };
    n.filter(|f: &f64| f.is_finite())
}

/// Esri polygons list all rings flat. Outer rings run clockwise and holes
/// counter-clockwise, each hole following the outer ring it belongs to.
fn group_rings(rings: Vec<LineString<f64>>) -> MultiPolygon<f64> {
    let mut polygons: Vec<(LineString<f64>, Vec<LineString<f64>>)> = Vec::new();
    for ring in rings {
        if signed_area(&ring) > 0.0 {
            if let Some((_, holes)) = polygons.last_mut() {
                holes.push(ring);
                continue;
            }
        }
        polygons.push((ring, Vec::new()));
    }
    MultiPolygon::new(
        polygons
            .into_iter()
            .map(|(exterior, interiors)| Polygon::new(exterior, interiors))
            .collect(),
    )
}

// Shoelace formula; positive for counter-clockwise rings.
fn signed_area(ring: &LineString<f64>) -> f64 {
    ring.0
        .windows(2)
        .map(|w| w[0].x * w[1].y - w[1].x * w[0].y)
        .sum::<f64>()
        / 2.0
}
