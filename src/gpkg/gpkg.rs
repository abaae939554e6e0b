use crate::conversions::{column_type_from_str, column_type_to_str, geometry_kind_from_str, geometry_kind_to_str};
use crate::error::{RestCacheError, Result};
use crate::ogc_sql::{
    SQL_DELETE_LAYER_CONTENTS, SQL_DELETE_LAYER_META, SQL_INSERT_GPKG_CONTENTS,
    SQL_INSERT_GPKG_GEOMETRY_COLUMNS, SQL_INSERT_SRS, SQL_LIST_LAYERS,
    SQL_SELECT_GEOMETRY_COLUMN_META, SQL_SRS_EXISTS, initialize_gpkg, sql_add_column,
    sql_create_table, sql_drop_column, sql_drop_table, sql_table_columns,
};
use crate::service::GeometryKind;
use crate::store::{ColumnKind, LayerDefinition, RowWriter, SpatialStore, StoreColumn};
use crate::types::ColumnSpec;
use rusqlite::{OpenFlags, OptionalExtension};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use super::layer::GpkgLayer;
use super::writer::GpkgRowWriter;

/// Primary key column of the layers created here.
const PRIMARY_KEY_COLUMN: &str = "fid";

/// Columns of a table, as declared in SQLite.
pub(crate) struct TableColumns {
    pub primary_key: String,
    /// Every column except the primary key, in table order.
    pub columns: Vec<ColumnSpec>,
}

#[derive(Debug)]
/// GeoPackage connection wrapper.
pub struct Gpkg {
    conn: rusqlite::Connection,
    read_only: bool,
    path: Option<PathBuf>,
}

impl Gpkg {
    /// Open a GeoPackage in read-only mode.
    pub fn open_read_only<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let conn = rusqlite::Connection::open_with_flags(path, OpenFlags::SQLITE_OPEN_READ_ONLY)?;
        Ok(Self {
            conn,
            read_only: true,
            path: Some(path.to_path_buf()),
        })
    }

    /// Open an existing GeoPackage in read-write mode.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(RestCacheError::Message(format!(
                "GeoPackage file does not exist: {}",
                path.display()
            )));
        }

        let conn = rusqlite::Connection::open(path)?;
        Ok(Self {
            conn,
            read_only: false,
            path: Some(path.to_path_buf()),
        })
    }

    /// Create a new GeoPackage
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if path.exists() {
            return Err(RestCacheError::Message(format!(
                "GeoPackage file already exists: {}",
                path.display()
            )));
        }

        let conn = rusqlite::Connection::open(path)?;
        initialize_gpkg(&conn)?;

        Ok(Self {
            conn,
            read_only: false,
            path: Some(path.to_path_buf()),
        })
    }

    /// Create a new GeoPackage in memory
    pub fn new_in_memory() -> Result<Self> {
        let conn = rusqlite::Connection::open_in_memory()?;
        initialize_gpkg(&conn)?;

        Ok(Self {
            conn,
            read_only: false,
            path: None,
        })
    }

    /// Register a spatial reference system in `gpkg_spatial_ref_sys`.
    ///
    /// No validation of the WKT `definition` or the authority is done.
    ///
    /// ```
    /// # use restcache_gpkg::Gpkg;
    /// let gpkg = Gpkg::new_in_memory().expect("new gpkg");
    /// gpkg.register_srs(
    ///     "WGS 84 / Pseudo-Mercator",
    ///     3857,
    ///     "EPSG",
    ///     3857,
    ///     "undefined",
    ///     "Web Mercator (EPSG:3857)",
    /// ).expect("register srs");
    /// ```
    pub fn register_srs(
        &self,
        srs_name: &str,
        srs_id: i32,
        organization: &str,
        organization_coordsys_id: i32,
        definition: &str,
        description: &str,
    ) -> Result<()> {
        self.ensure_writable()?;
        self.conn.execute(
            SQL_INSERT_SRS,
            rusqlite::params![
                srs_name,
                srs_id,
                organization,
                organization_coordsys_id,
                definition,
                description
            ],
        )?;
        Ok(())
    }

    pub fn srs_exists(&self, srs_id: i32) -> Result<bool> {
        let exists: i64 = self
            .conn
            .query_row(SQL_SRS_EXISTS, rusqlite::params![srs_id], |row| row.get(0))?;
        Ok(exists != 0)
    }

    /// List the names of the feature layers.
    pub fn list_layers(&self) -> Result<Vec<String>> {
        let mut stmt = self.conn.prepare(SQL_LIST_LAYERS)?;
        let layers = stmt
            .query_map([], |row| row.get(0))?
            .collect::<std::result::Result<Vec<String>, _>>()?;
        Ok(layers)
    }

    /// Load a layer definition and metadata by name.
    pub fn open_layer<'a>(&'a self, layer_name: &str) -> Result<GpkgLayer<'a>> {
        let (geometry_column, geometry_kind, srs_id) = self.get_geometry_column_and_srs_id(layer_name)?;
        let table = self.get_column_specs(layer_name)?;
        let property_columns = table
            .columns
            .into_iter()
            .filter(|spec| spec.name != geometry_column)
            .collect();

        Ok(GpkgLayer::new(
            self,
            layer_name,
            geometry_column,
            table.primary_key,
            geometry_kind,
            srs_id,
            property_columns,
        ))
    }

    /// Create a new feature layer with an integer `fid` primary key.
    ///
    /// `srs_id` must already be registered.
    pub fn create_layer<'a>(
        &'a self,
        layer_name: &str,
        geometry_column: &str,
        geometry_kind: GeometryKind,
        srs_id: i32,
        columns: &[ColumnSpec],
    ) -> Result<GpkgLayer<'a>> {
        self.ensure_writable()?;

        if self.list_layers()?.iter().any(|name| name == layer_name) {
            return Err(RestCacheError::LayerAlreadyExists {
                layer_name: layer_name.to_string(),
            });
        }
        if !self.srs_exists(srs_id)? {
            return Err(RestCacheError::MissingSpatialRefSysId { srs_id });
        }

        let geometry_type_name = geometry_kind_to_str(geometry_kind);
        let mut column_defs = Vec::with_capacity(columns.len() + 2);
        column_defs.push(format!(r#""{PRIMARY_KEY_COLUMN}" INTEGER PRIMARY KEY AUTOINCREMENT"#));
        column_defs.push(format!(r#""{geometry_column}" {geometry_type_name}"#));
        column_defs.extend(columns.iter().map(column_def));

        let tx = self.conn.unchecked_transaction()?;
        tx.execute_batch(&sql_create_table(layer_name, &column_defs.join(", ")))?;
        tx.execute(
            SQL_INSERT_GPKG_CONTENTS,
            rusqlite::params![layer_name, layer_name, srs_id],
        )?;
        tx.execute(
            SQL_INSERT_GPKG_GEOMETRY_COLUMNS,
            rusqlite::params![layer_name, geometry_column, geometry_type_name, srs_id],
        )?;
        tx.commit()?;

        debug!(layer = layer_name, geometry_type = geometry_type_name, srs_id, "Created layer");
        Ok(GpkgLayer::new(
            self,
            layer_name,
            geometry_column.to_string(),
            PRIMARY_KEY_COLUMN.to_string(),
            geometry_kind,
            srs_id,
            columns.to_vec(),
        ))
    }

    /// Delete a layer and its metadata.
    pub fn delete_layer(&self, layer_name: &str) -> Result<()> {
        self.ensure_writable()?;
        // Fails for unknown layers.
        self.get_geometry_column_and_srs_id(layer_name)?;

        let tx = self.conn.unchecked_transaction()?;
        tx.execute(SQL_DELETE_LAYER_META, [layer_name])?;
        tx.execute(SQL_DELETE_LAYER_CONTENTS, [layer_name])?;
        tx.execute_batch(&sql_drop_table(layer_name))?;
        tx.commit()?;
        Ok(())
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub(crate) fn connection(&self) -> &rusqlite::Connection {
        &self.conn
    }

    pub(crate) fn ensure_writable(&self) -> Result<()> {
        if self.read_only {
            return Err(RestCacheError::ReadOnly);
        }
        Ok(())
    }

    /// Resolve the table columns and map SQLite types.
    pub(crate) fn get_column_specs(&self, layer_name: &str) -> Result<TableColumns> {
        let query = sql_table_columns(layer_name);
        let mut stmt = self.conn.prepare(&query)?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, i32>(2)? != 0,
                ))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let mut primary_key: Option<String> = None;
        let mut columns = Vec::with_capacity(rows.len());
        for (name, declared_type, is_primary_key) in rows {
            if is_primary_key {
                if primary_key.is_some() {
                    return Err(RestCacheError::CompositePrimaryKeyUnsupported {
                        layer_name: layer_name.to_string(),
                    });
                }
                primary_key = Some(name);
                continue;
            }

            // cf. https://www.geopackage.org/spec140/index.html#_sqlite_container
            let column_type = column_type_from_str(&declared_type).ok_or_else(|| {
                RestCacheError::UnsupportedColumnType {
                    column: name.clone(),
                    declared_type: declared_type.clone(),
                }
            })?;
            columns.push(ColumnSpec {
                length: declared_length(&declared_type),
                name,
                column_type,
            });
        }

        let primary_key = primary_key.ok_or_else(|| RestCacheError::MissingPrimaryKeyColumn {
            layer_name: layer_name.to_string(),
        })?;

        Ok(TableColumns {
            primary_key,
            columns,
        })
    }

    /// Resolve the geometry column metadata and SRS information for a layer.
    pub(crate) fn get_geometry_column_and_srs_id(
        &self,
        layer_name: &str,
    ) -> Result<(String, GeometryKind, i32)> {
        let mut stmt = self.conn.prepare(SQL_SELECT_GEOMETRY_COLUMN_META)?;
        let meta = stmt
            .query_row([layer_name], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, i32>(2)?,
                ))
            })
            .optional()?;

        let Some((geometry_column, geometry_type_str, srs_id)) = meta else {
            return Err(RestCacheError::MissingGeometryColumn {
                layer_name: layer_name.to_string(),
            });
        };
        let geometry_kind = geometry_kind_from_str(&geometry_type_str)?;

        Ok((geometry_column, geometry_kind, srs_id))
    }

    // Reprojection is out of scope, so ids without a definition are still
    // accepted and registered as undefined.
    fn ensure_srs(&self, srs_id: i32) -> Result<()> {
        if self.srs_exists(srs_id)? {
            return Ok(());
        }
        warn!(srs_id, "Registering spatial reference system without a definition");
        self.register_srs(
            &format!("EPSG:{srs_id}"),
            srs_id,
            "EPSG",
            srs_id,
            "undefined",
            "registered without a definition",
        )
    }
}

impl SpatialStore for Gpkg {
    fn location(&self) -> String {
        match &self.path {
            Some(path) => path.display().to_string(),
            None => ":memory:".to_string(),
        }
    }

    fn validate_workspace(&self) -> bool {
        !self.read_only && self.path.as_deref().is_none_or(is_gpkg_path)
    }

    fn create_layer(&self, definition: &LayerDefinition) -> Result<()> {
        self.ensure_srs(definition.srs_id)?;
        Gpkg::create_layer(
            self,
            &definition.name,
            &definition.geometry_column,
            definition.geometry_kind,
            definition.srs_id,
            &definition.columns,
        )?;
        info!(layer = %definition.name, location = %self.location(), "Created destination layer");
        Ok(())
    }

    fn add_column(&self, layer: &str, column: &ColumnSpec) -> Result<()> {
        self.ensure_writable()?;
        self.conn
            .execute_batch(&sql_add_column(layer, &column_def(column)))?;
        debug!(layer, column = %column.name, "Added column");
        Ok(())
    }

    fn drop_columns(&self, layer: &str, columns: &[String]) -> Result<()> {
        self.ensure_writable()?;
        let tx = self.conn.unchecked_transaction()?;
        for column in columns {
            tx.execute_batch(&sql_drop_column(layer, column))?;
        }
        tx.commit()?;
        debug!(layer, columns = ?columns, "Dropped columns");
        Ok(())
    }

    fn columns_of(&self, layer: &str) -> Result<Vec<StoreColumn>> {
        let (geometry_column, _, _) = self.get_geometry_column_and_srs_id(layer)?;
        let table = self.get_column_specs(layer)?;

        let mut columns = vec![StoreColumn::new(table.primary_key, ColumnKind::Identity)];
        columns.extend(table.columns.into_iter().map(|spec| {
            let kind = if spec.name == geometry_column {
                ColumnKind::Geometry
            } else if spec.name.eq_ignore_ascii_case("globalid") {
                ColumnKind::GlobalId
            } else {
                ColumnKind::Attribute(spec.column_type)
            };
            StoreColumn::new(spec.name, kind)
        }));
        Ok(columns)
    }

    fn delete_all_rows(&self, layer: &str) -> Result<usize> {
        self.open_layer(layer)?.truncate()
    }

    fn open_row_writer<'a>(
        &'a self,
        layer: &str,
        field_names: &[String],
    ) -> Result<Box<dyn RowWriter + 'a>> {
        self.ensure_writable()?;
        let layer = self.open_layer(layer)?;
        let attribute_columns: Vec<&str> = field_names.iter().skip(1).map(String::as_str).collect();
        Ok(Box::new(GpkgRowWriter::new(
            &self.conn,
            &layer.layer_name,
            &layer.geometry_column,
            &attribute_columns,
            layer.srs_id,
        )))
    }
}

fn column_def(spec: &ColumnSpec) -> String {
    format!(
        r#""{}" {}"#,
        spec.name,
        column_type_to_str(spec.column_type, spec.length)
    )
}

// `TEXT(50)` -> 50
fn declared_length(declared_type: &str) -> Option<u32> {
    let (_, rest) = declared_type.split_once('(')?;
    rest.trim_end_matches(')').trim().parse().ok()
}

fn is_gpkg_path(path: &Path) -> bool {
    path.extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("gpkg"))
}

#[cfg(test)]
mod tests {
    use super::Gpkg;
    use crate::Result;
    use crate::error::RestCacheError;
    use crate::service::GeometryKind;
    use crate::store::{ColumnKind, LayerDefinition, SpatialStore};
    use crate::types::{ColumnSpec, ColumnType};

    fn definition(name: &str, srs_id: i32) -> LayerDefinition {
        LayerDefinition {
            name: name.to_string(),
            geometry_column: "shape".to_string(),
            geometry_kind: GeometryKind::Polygon,
            srs_id,
            columns: vec![
                ColumnSpec {
                    name: "name".to_string(),
                    column_type: ColumnType::Varchar,
                    length: Some(40),
                },
                ColumnSpec::new("area", ColumnType::Double),
                ColumnSpec::new("GlobalID", ColumnType::Varchar),
            ],
        }
    }

    #[test]
    fn create_layer_requires_existing_srs() {
        let gpkg = Gpkg::new_in_memory().expect("new gpkg");
        let err = gpkg
            .create_layer("missing_srs", "geom", GeometryKind::Point, 9999, &[])
            .expect_err("missing srs should fail");

        match err {
            RestCacheError::MissingSpatialRefSysId { srs_id } => assert_eq!(srs_id, 9999),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn create_layer_rejects_duplicates() -> Result<()> {
        let gpkg = Gpkg::new_in_memory()?;
        gpkg.create_layer("roads", "geom", GeometryKind::Polyline, 4326, &[])?;
        let err = gpkg
            .create_layer("roads", "geom", GeometryKind::Polyline, 4326, &[])
            .expect_err("duplicate layer should fail");
        assert!(matches!(err, RestCacheError::LayerAlreadyExists { .. }));
        Ok(())
    }

    #[test]
    fn new_fails_if_file_exists() {
        let file = tempfile::Builder::new()
            .suffix(".gpkg")
            .tempfile()
            .expect("temp file");
        let err = Gpkg::new(file.path()).expect_err("existing file should fail");
        match err {
            RestCacheError::Message(message) => assert!(message.contains("already exists")),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn open_fails_if_missing_file() {
        let dir = tempfile::tempdir().expect("temp dir");
        let err = Gpkg::open(dir.path().join("missing.gpkg")).expect_err("missing file should fail");
        match err {
            RestCacheError::Message(message) => assert!(message.contains("does not exist")),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn workspace_validation() -> Result<()> {
        let dir = tempfile::tempdir().expect("temp dir");

        assert!(Gpkg::new_in_memory()?.validate_workspace());

        let gpkg_path = dir.path().join("cache.GPKG");
        assert!(Gpkg::new(&gpkg_path)?.validate_workspace());
        assert!(!Gpkg::open_read_only(&gpkg_path)?.validate_workspace());

        let sqlite_path = dir.path().join("cache.sqlite");
        let gpkg = Gpkg::new(&sqlite_path)?;
        assert!(!gpkg.validate_workspace());
        assert_eq!(gpkg.location(), sqlite_path.display().to_string());
        Ok(())
    }

    #[test]
    fn read_only_rejects_writes() -> Result<()> {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("ro.gpkg");
        Gpkg::new(&path)?.create_layer("points", "geom", GeometryKind::Point, 4326, &[])?;

        let gpkg = Gpkg::open_read_only(&path)?;
        assert!(matches!(gpkg.delete_layer("points"), Err(RestCacheError::ReadOnly)));
        assert!(matches!(
            gpkg.open_row_writer("points", &["Shape@".to_string()]),
            Err(RestCacheError::ReadOnly)
        ));
        Ok(())
    }

    #[test]
    fn store_layer_registers_unknown_srs() -> Result<()> {
        let gpkg = Gpkg::new_in_memory()?;
        assert!(!gpkg.srs_exists(102100)?);

        SpatialStore::create_layer(&gpkg, &definition("parcels", 102100))?;
        assert!(gpkg.srs_exists(102100)?);
        assert_eq!(gpkg.list_layers()?, vec!["parcels"]);

        let layer = gpkg.open_layer("parcels")?;
        assert_eq!(layer.srs_id, 102100);
        assert_eq!(layer.geometry_kind, GeometryKind::Polygon);
        assert_eq!(layer.property_columns[0].length, Some(40));
        Ok(())
    }

    #[test]
    fn columns_are_classified() -> Result<()> {
        let gpkg = Gpkg::new_in_memory()?;
        SpatialStore::create_layer(&gpkg, &definition("parcels", 4326))?;

        let kinds: Vec<(String, ColumnKind)> = gpkg
            .columns_of("parcels")?
            .into_iter()
            .map(|c| (c.name, c.kind))
            .collect();
        assert_eq!(
            kinds,
            vec![
                ("fid".to_string(), ColumnKind::Identity),
                ("shape".to_string(), ColumnKind::Geometry),
                ("name".to_string(), ColumnKind::Attribute(ColumnType::Varchar)),
                ("area".to_string(), ColumnKind::Attribute(ColumnType::Double)),
                ("GlobalID".to_string(), ColumnKind::GlobalId),
            ]
        );
        Ok(())
    }

    #[test]
    fn columns_can_be_dropped_and_added() -> Result<()> {
        let gpkg = Gpkg::new_in_memory()?;
        SpatialStore::create_layer(&gpkg, &definition("parcels", 4326))?;

        gpkg.drop_columns("parcels", &["area".to_string(), "name".to_string()])?;
        gpkg.add_column("parcels", &ColumnSpec::new("zoning", ColumnType::SmallInteger))?;

        let names: Vec<String> = gpkg.columns_of("parcels")?.into_iter().map(|c| c.name).collect();
        assert_eq!(names, vec!["fid", "shape", "GlobalID", "zoning"]);
        Ok(())
    }

    #[test]
    fn delete_layer_removes_metadata() -> Result<()> {
        let gpkg = Gpkg::new_in_memory()?;
        gpkg.create_layer("roads", "geom", GeometryKind::Polyline, 4326, &[])?;
        gpkg.delete_layer("roads")?;

        assert!(gpkg.list_layers()?.is_empty());
        assert!(matches!(
            gpkg.open_layer("roads"),
            Err(RestCacheError::MissingGeometryColumn { .. })
        ));
        Ok(())
    }
}
