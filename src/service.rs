//! Feature service metadata.

use crate::conversions::column_type_from_esri;
use crate::error::{RestCacheError, Result};
use crate::http::HttpClient;
use crate::transport::Transport;
use crate::types::{ColumnSpec, ColumnType};
use serde_json::Value;
use std::collections::HashSet;
use tracing::{debug, warn};

/// Synthetic name of the geometry slot, always the first field of a model.
pub const GEOMETRY_FIELD: &str = "Shape@";

const DEFAULT_SPATIAL_REFERENCE_ID: i32 = 4326;
const DEFAULT_MAX_RECORD_COUNT: u32 = 1000;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum GeometryKind {
    Point,
    Polyline,
    Polygon,
    MultiPoint,
    Unknown,
}

impl GeometryKind {
    /// Classify an Esri `geometryType` such as `esriGeometryPolygon`.
    ///
    /// Matching is by substring so that `multipoint` has to be tested before
    /// `point`.
    pub fn from_esri(geometry_type: &str) -> Self {
        let s = geometry_type.to_ascii_lowercase();
        if s.contains("polygon") {
            GeometryKind::Polygon
        } else if s.contains("polyline") {
            GeometryKind::Polyline
        } else if s.contains("multipoint") {
            GeometryKind::MultiPoint
        } else if s.contains("point") {
            GeometryKind::Point
        } else {
            GeometryKind::Unknown
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EsriFieldType {
    Oid,
    Geometry,
    Guid,
    GlobalId,
    String,
    Date,
    SmallInteger,
    Integer,
    Double,
    Single,
    Other(String),
}

impl EsriFieldType {
    pub fn parse(field_type: &str) -> Self {
        match field_type {
            "esriFieldTypeOID" => EsriFieldType::Oid,
            "esriFieldTypeGeometry" => EsriFieldType::Geometry,
            "esriFieldTypeGUID" => EsriFieldType::Guid,
            "esriFieldTypeGlobalID" => EsriFieldType::GlobalId,
            "esriFieldTypeString" => EsriFieldType::String,
            "esriFieldTypeDate" => EsriFieldType::Date,
            "esriFieldTypeSmallInteger" => EsriFieldType::SmallInteger,
            "esriFieldTypeInteger" => EsriFieldType::Integer,
            "esriFieldTypeDouble" => EsriFieldType::Double,
            "esriFieldTypeSingle" => EsriFieldType::Single,
            other => EsriFieldType::Other(other.to_string()),
        }
    }

    /// Fields maintained by the server, never copied into the destination.
    pub fn is_system(&self) -> bool {
        matches!(
            self,
            EsriFieldType::Oid
                | EsriFieldType::Geometry
                | EsriFieldType::Guid
                | EsriFieldType::GlobalId
        )
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FieldSpec {
    pub name: String,
    pub field_type: EsriFieldType,
    pub length: Option<u32>,
}

impl FieldSpec {
    pub fn geometry() -> Self {
        Self {
            name: GEOMETRY_FIELD.to_string(),
            field_type: EsriFieldType::Geometry,
            length: None,
        }
    }

    pub fn is_geometry(&self) -> bool {
        self.name == GEOMETRY_FIELD
    }

    /// Destination column for this field.
    pub fn column_spec(&self) -> ColumnSpec {
        let column_type = column_type_from_esri(&self.field_type);
        ColumnSpec {
            name: self.name.clone(),
            column_type,
            length: match column_type {
                ColumnType::Varchar => self.length,
                _ => None,
            },
        }
    }
}

/// What a feature service looks like, read once from its metadata.
#[derive(Clone, Debug, PartialEq)]
pub struct ServiceModel {
    geometry_kind: GeometryKind,
    spatial_reference_id: i32,
    display_name: String,
    fields: Vec<FieldSpec>,
    max_record_count: u32,
    supports_pagination: bool,
}

impl ServiceModel {
    /// Request `url?f=json` and build the model from the response.
    pub fn describe<C: HttpClient>(
        transport: &Transport<C>,
        url: &str,
        user_fields: &[String],
        exclude_fields: &[String],
    ) -> Result<Self> {
        let metadata = transport.fetch(url, &[("f", "json".to_string())])?;
        Self::from_metadata(url, &metadata, user_fields, exclude_fields)
    }

    pub fn from_metadata(
        url: &str,
        metadata: &Value,
        user_fields: &[String],
        exclude_fields: &[String],
    ) -> Result<Self> {
        let name = metadata
            .get("name")
            .and_then(Value::as_str)
            .ok_or_else(|| map_service_error(url, "metadata has no `name`"))?;
        let raw_fields = metadata
            .get("fields")
            .and_then(Value::as_array)
            .ok_or_else(|| map_service_error(url, "metadata has no `fields` list"))?;

        let geometry_kind = metadata
            .get("geometryType")
            .and_then(Value::as_str)
            .map_or(GeometryKind::Unknown, GeometryKind::from_esri);

        let spatial_reference_id = metadata
            .pointer("/extent/spatialReference/wkid")
            .and_then(integer_like)
            .and_then(|wkid| i32::try_from(wkid).ok())
            .unwrap_or(DEFAULT_SPATIAL_REFERENCE_ID);

        let max_record_count = metadata
            .get("maxRecordCount")
            .and_then(integer_like)
            .and_then(|n| u32::try_from(n).ok())
            .filter(|n| *n > 0)
            .unwrap_or(DEFAULT_MAX_RECORD_COUNT);

        let supports_pagination = metadata
            .pointer("/advancedQueryCapabilities/supportsPagination")
            .and_then(Value::as_bool)
            .unwrap_or(false);

        let mut fields = vec![FieldSpec::geometry()];
        let mut seen: HashSet<String> = HashSet::new();
        for raw in raw_fields {
            let (Some(field_name), Some(field_type)) = (
                raw.get("name").and_then(Value::as_str),
                raw.get("type").and_then(Value::as_str),
            ) else {
                warn!(url = %url, field = %raw, "Ignoring field without name or type");
                continue;
            };

            let field_type = EsriFieldType::parse(field_type);
            if field_type.is_system()
                || field_name.to_ascii_lowercase().contains("shape")
                || contains_name(user_fields, field_name)
                || contains_name(exclude_fields, field_name)
            {
                continue;
            }
            if !seen.insert(field_name.to_ascii_lowercase()) {
                warn!(url = %url, field = field_name, "Ignoring duplicate field");
                continue;
            }

            fields.push(FieldSpec {
                name: field_name.to_string(),
                field_type,
                length: raw
                    .get("length")
                    .and_then(Value::as_u64)
                    .and_then(|n| u32::try_from(n).ok()),
            });
        }

        let model = Self {
            geometry_kind,
            spatial_reference_id,
            display_name: sanitize_table_name(name),
            fields,
            max_record_count,
            supports_pagination,
        };
        debug!(
            url = %url,
            name = %model.display_name,
            geometry_kind = ?model.geometry_kind,
            srs_id = model.spatial_reference_id,
            fields = model.fields.len(),
            max_record_count = model.max_record_count,
            supports_pagination = model.supports_pagination,
            "Described feature service"
        );
        Ok(model)
    }

    pub fn geometry_kind(&self) -> GeometryKind {
        self.geometry_kind
    }

    pub fn spatial_reference_id(&self) -> i32 {
        self.spatial_reference_id
    }

    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    /// All fields, `Shape@` first.
    pub fn fields(&self) -> &[FieldSpec] {
        &self.fields
    }

    pub fn max_record_count(&self) -> u32 {
        self.max_record_count
    }

    pub fn supports_pagination(&self) -> bool {
        self.supports_pagination
    }

    /// Fields to copy, minus any further user-managed or excluded names.
    pub fn update_fields(&self, user_fields: &[String], exclude_fields: &[String]) -> Vec<FieldSpec> {
        self.fields
            .iter()
            .filter(|f| {
                f.is_geometry()
                    || !(contains_name(user_fields, &f.name) || contains_name(exclude_fields, &f.name))
            })
            .cloned()
            .collect()
    }
}

/// Turn a service name into something usable as a table name.
///
/// Anything outside `[A-Za-z0-9_]` becomes `_`; a leading digit gets a `T`
/// prefix.
pub fn sanitize_table_name(name: &str) -> String {
    let mut sanitized: String = name
        .trim()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect();
    if sanitized.is_empty() {
        sanitized.push_str("layer");
    } else if sanitized.starts_with(|c: char| c.is_ascii_digit()) {
        sanitized.insert(0, 'T');
    }
    sanitized
}

fn contains_name(names: &[String], name: &str) -> bool {
    names.iter().any(|n| n.eq_ignore_ascii_case(name))
}

// Esri emits some numbers as strings ("wkid": "102100").
fn integer_like(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn map_service_error(url: &str, message: &str) -> RestCacheError {
    RestCacheError::MapServiceError {
        url: url.to_string(),
        message: message.to_string(),
    }
}
