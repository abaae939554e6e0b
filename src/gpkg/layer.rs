use crate::Value;
use crate::error::Result;
use crate::ogc_sql::{sql_delete_all, sql_insert_feature, sql_select_features};
use crate::service::GeometryKind;
use crate::types::ColumnSpec;
use geo_traits::GeometryTrait;
use rusqlite::params_from_iter;
use rusqlite::types::ValueRef;
use std::collections::HashMap;
use std::sync::Arc;

use super::{Gpkg, GpkgFeature, encode_gpkg_geometry};

#[derive(Debug)]
/// A GeoPackage feature layer with its geometry metadata and column specs.
pub struct GpkgLayer<'a> {
    pub(super) conn: &'a Gpkg,
    pub layer_name: String,
    pub geometry_column: String,
    pub primary_key_column: String,
    pub geometry_kind: GeometryKind,
    pub srs_id: i32,
    pub property_columns: Vec<ColumnSpec>,
    property_index_by_name: Arc<HashMap<String, usize>>,
    insert_sql: String,
}

// The SELECT issued by `features` always places these columns first.
const GEOMETRY_INDEX: usize = 0;
const PRIMARY_INDEX: usize = 1;

impl<'a> GpkgLayer<'a> {
    pub(super) fn new(
        conn: &'a Gpkg,
        layer_name: &str,
        geometry_column: String,
        primary_key_column: String,
        geometry_kind: GeometryKind,
        srs_id: i32,
        property_columns: Vec<ColumnSpec>,
    ) -> Self {
        let property_names: Vec<&str> = property_columns.iter().map(|c| c.name.as_str()).collect();
        let insert_sql = build_insert_sql(layer_name, &geometry_column, &property_names);
        let property_index_by_name = property_columns
            .iter()
            .enumerate()
            .map(|(idx, column)| (column.name.clone(), idx))
            .collect();

        Self {
            conn,
            layer_name: layer_name.to_string(),
            geometry_column,
            primary_key_column,
            geometry_kind,
            srs_id,
            property_columns,
            property_index_by_name: Arc::new(property_index_by_name),
            insert_sql,
        }
    }

    /// All features in primary key order.
    pub fn features(&self) -> Result<Vec<GpkgFeature>> {
        let columns = self.property_columns.iter().map(|spec| spec.name.as_str());
        let sql = sql_select_features(
            &self.layer_name,
            &self.geometry_column,
            &self.primary_key_column,
            columns,
        );

        let mut stmt = self.conn.connection().prepare(&sql)?;
        let features = stmt
            .query_map([], |row| {
                let geometry = match row.get_ref(GEOMETRY_INDEX)? {
                    ValueRef::Blob(bytes) => Some(bytes.to_vec()),
                    ValueRef::Null => None,
                    other => {
                        return Err(rusqlite::Error::InvalidColumnType(
                            GEOMETRY_INDEX,
                            self.geometry_column.clone(),
                            other.data_type(),
                        ));
                    }
                };
                let id = match row.get_ref(PRIMARY_INDEX)? {
                    ValueRef::Integer(id) => id,
                    other => {
                        return Err(rusqlite::Error::InvalidColumnType(
                            PRIMARY_INDEX,
                            self.primary_key_column.clone(),
                            other.data_type(),
                        ));
                    }
                };
                let properties = (0..self.property_columns.len())
                    .map(|idx| row.get_ref(idx + 2).map(Value::from))
                    .collect::<rusqlite::Result<Vec<_>>>()?;

                Ok(GpkgFeature {
                    id,
                    geometry,
                    properties,
                    property_index_by_name: Arc::clone(&self.property_index_by_name),
                })
            })?
            .collect::<std::result::Result<Vec<GpkgFeature>, _>>()?;

        Ok(features)
    }

    pub fn count(&self) -> Result<usize> {
        let sql = format!(r#"SELECT COUNT(*) FROM "{}""#, self.layer_name);
        let count: i64 = self.conn.connection().query_row(&sql, [], |row| row.get(0))?;
        Ok(usize::try_from(count).unwrap_or_default())
    }

    /// Remove all rows from the layer, returning how many were removed.
    pub fn truncate(&self) -> Result<usize> {
        self.conn.ensure_writable()?;
        let sql = sql_delete_all(&self.layer_name);
        Ok(self.conn.connection().execute(&sql, [])?)
    }

    /// Insert a feature with geometry and ordered property values.
    ///
    /// ```no_run
    /// use geo_types::Point;
    /// use restcache_gpkg::{Gpkg, Value};
    ///
    /// let gpkg = Gpkg::open("data/cache.gpkg")?;
    /// let layer = gpkg.open_layer("points")?;
    /// layer.insert(Point::new(1.0, 2.0), vec![Value::from("alpha"), Value::Integer(1)])?;
    /// # Ok::<(), restcache_gpkg::RestCacheError>(())
    /// ```
    pub fn insert<G, P>(&self, geometry: G, properties: P) -> Result<()>
    where
        G: GeometryTrait<T = f64>,
        P: IntoIterator<Item = Value>,
    {
        self.conn.ensure_writable()?;
        let geom = encode_gpkg_geometry(&geometry, self.srs_id)?;
        let params = std::iter::once(Value::Blob(geom)).chain(properties);

        let mut stmt = self.conn.connection().prepare_cached(&self.insert_sql)?;
        stmt.execute(params_from_iter(params))?;
        Ok(())
    }
}

/// `INSERT` for the geometry column followed by `property_columns`.
pub(crate) fn build_insert_sql(
    layer_name: &str,
    geometry_column: &str,
    property_columns: &[&str],
) -> String {
    let mut columns = Vec::with_capacity(property_columns.len() + 1);
    columns.push(format!(r#""{}""#, geometry_column));
    columns.extend(property_columns.iter().map(|name| format!(r#""{}""#, name)));

    let placeholders = (1..=columns.len())
        .map(|i| format!("?{i}"))
        .collect::<Vec<String>>()
        .join(",");

    sql_insert_feature(layer_name, &columns.join(","), &placeholders)
}
