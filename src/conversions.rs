use crate::error::RestCacheError;
use crate::service::{EsriFieldType, GeometryKind};
use crate::types::ColumnType;

/// GeoPackage `geometry_type_name` for the layers created from a service.
///
/// Esri polylines and polygons may carry several paths or rings, so they are
/// always stored as their multi-part counterparts.
#[inline]
pub(crate) fn geometry_kind_to_str(kind: GeometryKind) -> &'static str {
    match kind {
        GeometryKind::Point => "POINT",
        GeometryKind::MultiPoint => "MULTIPOINT",
        GeometryKind::Polyline => "MULTILINESTRING",
        GeometryKind::Polygon => "MULTIPOLYGON",
        GeometryKind::Unknown => "GEOMETRY",
    }
}

#[inline]
pub(crate) fn geometry_kind_from_str(
    geometry_type_str: &str,
) -> Result<GeometryKind, RestCacheError> {
    let s = geometry_type_str;
    if s.eq_ignore_ascii_case("GEOMETRY") || s.eq_ignore_ascii_case("GEOMETRYCOLLECTION") {
        Ok(GeometryKind::Unknown)
    } else if s.eq_ignore_ascii_case("POINT") {
        Ok(GeometryKind::Point)
    } else if s.eq_ignore_ascii_case("MULTIPOINT") {
        Ok(GeometryKind::MultiPoint)
    } else if s.eq_ignore_ascii_case("LINESTRING") || s.eq_ignore_ascii_case("MULTILINESTRING") {
        Ok(GeometryKind::Polyline)
    } else if s.eq_ignore_ascii_case("POLYGON") || s.eq_ignore_ascii_case("MULTIPOLYGON") {
        Ok(GeometryKind::Polygon)
    } else {
        Err(RestCacheError::UnsupportedGeometryType(
            geometry_type_str.to_string(),
        ))
    }
}

#[inline]
pub(crate) fn column_type_to_str(column_type: ColumnType, length: Option<u32>) -> String {
    match column_type {
        ColumnType::Boolean => "BOOLEAN".to_string(),
        ColumnType::SmallInteger => "SMALLINT".to_string(),
        ColumnType::Integer => "INTEGER".to_string(),
        ColumnType::Float => "FLOAT".to_string(),
        ColumnType::Double => "DOUBLE".to_string(),
        ColumnType::Varchar => match length {
            Some(n) if n > 0 => format!("TEXT({n})"),
            _ => "TEXT".to_string(),
        },
        ColumnType::DateTime => "DATETIME".to_string(),
        ColumnType::Blob => "BLOB".to_string(),
        ColumnType::Geometry => "GEOMETRY".to_string(),
    }
}

/// Map a declared SQLite column type back to a `ColumnType`.
///
/// `TEXT(50)` and `BLOB(1024)` carry a size suffix that is ignored here.
#[inline]
pub(crate) fn column_type_from_str(column_type_str: &str) -> Option<ColumnType> {
    let s = column_type_str
        .split_once('(')
        .map_or(column_type_str, |(base, _)| base)
        .trim();
    if s.eq_ignore_ascii_case("BOOLEAN") {
        Some(ColumnType::Boolean)
    } else if s.eq_ignore_ascii_case("TINYINT") || s.eq_ignore_ascii_case("SMALLINT") {
        Some(ColumnType::SmallInteger)
    } else if s.eq_ignore_ascii_case("MEDIUMINT")
        || s.eq_ignore_ascii_case("INT")
        || s.eq_ignore_ascii_case("INTEGER")
    {
        Some(ColumnType::Integer)
    } else if s.eq_ignore_ascii_case("FLOAT") {
        Some(ColumnType::Float)
    } else if s.eq_ignore_ascii_case("DOUBLE") || s.eq_ignore_ascii_case("REAL") {
        Some(ColumnType::Double)
    } else if s.eq_ignore_ascii_case("TEXT") {
        Some(ColumnType::Varchar)
    } else if s.eq_ignore_ascii_case("DATE") || s.eq_ignore_ascii_case("DATETIME") {
        Some(ColumnType::DateTime)
    } else if s.eq_ignore_ascii_case("BLOB") {
        Some(ColumnType::Blob)
    } else if s.eq_ignore_ascii_case("GEOMETRY")
        || s.eq_ignore_ascii_case("POINT")
        || s.eq_ignore_ascii_case("LINESTRING")
        || s.eq_ignore_ascii_case("POLYGON")
        || s.eq_ignore_ascii_case("MULTIPOINT")
        || s.eq_ignore_ascii_case("MULTILINESTRING")
        || s.eq_ignore_ascii_case("MULTIPOLYGON")
        || s.eq_ignore_ascii_case("GEOMETRYCOLLECTION")
    {
        Some(ColumnType::Geometry)
    } else {
        None
    }
}

/// Column type used when a service field is materialized in a GeoPackage.
#[inline]
pub(crate) fn column_type_from_esri(field_type: &EsriFieldType) -> ColumnType {
    match field_type {
        EsriFieldType::String => ColumnType::Varchar,
        EsriFieldType::Date => ColumnType::DateTime,
        EsriFieldType::SmallInteger => ColumnType::SmallInteger,
        EsriFieldType::Integer => ColumnType::Integer,
        EsriFieldType::Double => ColumnType::Double,
        EsriFieldType::Single => ColumnType::Float,
        EsriFieldType::Geometry => ColumnType::Geometry,
        // GUID-like and unrecognized fields keep their textual representation.
        EsriFieldType::Oid
        | EsriFieldType::Guid
        | EsriFieldType::GlobalId
        | EsriFieldType::Other(_) => ColumnType::Varchar,
    }
}
