// cf. https://www.geopackage.org/spec140/index.html#table_definition_sql

// "GPKG" in ASCII, and GeoPackage version 1.4.0.
const SQL_GPKG_PRAGMAS: &str = "
PRAGMA application_id = 1196444487;
PRAGMA user_version = 10400;
";

// gpkg_spatial_ref_sys: the SRS catalog referenced by gpkg_contents and
// gpkg_geometry_columns to describe spatial reference systems.
const SQL_GPKG_SPATIAL_REF_SYS: &str = "
CREATE TABLE gpkg_spatial_ref_sys (
  srs_name TEXT NOT NULL,
  srs_id INTEGER PRIMARY KEY,
  organization TEXT NOT NULL,
  organization_coordsys_id INTEGER NOT NULL,
  definition  TEXT NOT NULL,
  description TEXT
);
";

// gpkg_contents: lists all geospatial contents in the package with identifying
// and descriptive metadata for user display and access.
const SQL_GPKG_CONTENTS: &str = "
CREATE TABLE gpkg_contents (
  table_name TEXT NOT NULL PRIMARY KEY,
  data_type TEXT NOT NULL,
  identifier TEXT UNIQUE,
  description TEXT DEFAULT '',
  last_change DATETIME NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ','now')),
  min_x DOUBLE,
  min_y DOUBLE,
  max_x DOUBLE,
  max_y DOUBLE,
  srs_id INTEGER,
  CONSTRAINT fk_gc_r_srs_id FOREIGN KEY (srs_id) REFERENCES gpkg_spatial_ref_sys(srs_id)
);
";

// gpkg_geometry_columns: identifies geometry columns and geometry types for
// vector feature user data tables.
const SQL_GPKG_GEOMETRY_COLUMNS: &str = "
CREATE TABLE gpkg_geometry_columns (
  table_name TEXT NOT NULL,
  column_name TEXT NOT NULL,
  geometry_type_name TEXT NOT NULL,
  srs_id INTEGER NOT NULL,
  z TINYINT NOT NULL,
  m TINYINT NOT NULL,
  CONSTRAINT pk_geom_cols PRIMARY KEY (table_name, column_name),
  CONSTRAINT uk_gc_table_name UNIQUE (table_name),
  CONSTRAINT fk_gc_tn FOREIGN KEY (table_name) REFERENCES gpkg_contents(table_name),
  CONSTRAINT fk_gc_srs FOREIGN KEY (srs_id) REFERENCES gpkg_spatial_ref_sys (srs_id)
);
";

pub(crate) const SQL_LIST_LAYERS: &str =
    "SELECT table_name FROM gpkg_contents WHERE data_type = 'features'";

pub(crate) const SQL_SRS_EXISTS: &str =
    "SELECT EXISTS(SELECT 1 FROM gpkg_spatial_ref_sys WHERE srs_id = ?1)";

pub(crate) const SQL_INSERT_SRS: &str = "
INSERT INTO gpkg_spatial_ref_sys
  (srs_name, srs_id, organization, organization_coordsys_id, definition, description)
VALUES
  (?1, ?2, ?3, ?4, ?5, ?6)
";

pub(crate) const SQL_INSERT_GPKG_CONTENTS: &str = "
INSERT INTO gpkg_contents
  (table_name, data_type, identifier, description, srs_id)
VALUES
  (?1, 'features', ?2, '', ?3)
";

pub(crate) const SQL_INSERT_GPKG_GEOMETRY_COLUMNS: &str = "
INSERT INTO gpkg_geometry_columns
  (table_name, column_name, geometry_type_name, srs_id, z, m)
VALUES
  (?1, ?2, ?3, ?4, 0, 0)
";

pub(crate) const SQL_SELECT_GEOMETRY_COLUMN_META: &str = "
SELECT column_name, geometry_type_name, srs_id
FROM gpkg_geometry_columns
WHERE table_name = ?
";

pub(crate) const SQL_DELETE_LAYER_META: &str =
    "DELETE FROM gpkg_geometry_columns WHERE table_name = ?1";

pub(crate) const SQL_DELETE_LAYER_CONTENTS: &str =
    "DELETE FROM gpkg_contents WHERE table_name = ?1";

pub(crate) fn sql_create_table(layer_name: &str, column_defs: &str) -> String {
    format!(r#"CREATE TABLE "{}" ({})"#, layer_name, column_defs)
}

pub(crate) fn sql_drop_table(layer_name: &str) -> String {
    format!(r#"DROP TABLE "{layer_name}""#)
}

pub(crate) fn sql_table_columns(layer_name: &str) -> String {
    format!(
        "SELECT name, type, pk FROM pragma_table_info('{}')",
        layer_name.replace('\'', "''")
    )
}

pub(crate) fn sql_add_column(layer_name: &str, column_def: &str) -> String {
    format!(r#"ALTER TABLE "{layer_name}" ADD COLUMN {column_def}"#)
}

pub(crate) fn sql_drop_column(layer_name: &str, column_name: &str) -> String {
    format!(r#"ALTER TABLE "{layer_name}" DROP COLUMN "{column_name}""#)
}

pub(crate) fn sql_select_features<'a, I>(
    layer_name: &'a str,
    geometry_column: &'a str,
    primary_key_column: &'a str,
    other_columns: I,
) -> String
where
    I: IntoIterator<Item = &'a str>,
{
    let mut columns = vec![
        format!(r#""{geometry_column}""#),
        format!(r#""{primary_key_column}""#),
    ];
    columns.extend(
        other_columns
            .into_iter()
            .map(|name| format!(r#""{}""#, name)),
    );

    format!(
        r#"SELECT {} FROM "{layer_name}" ORDER BY "{primary_key_column}""#,
        columns.join(", ")
    )
}

pub(crate) fn sql_delete_all(layer_name: &str) -> String {
    format!(r#"DELETE FROM "{}""#, layer_name)
}

pub(crate) fn sql_insert_feature(layer_name: &str, columns: &str, values: &str) -> String {
    format!(
        r#"INSERT INTO "{}" ({}) VALUES ({})"#,
        layer_name, columns, values
    )
}

pub(crate) fn initialize_gpkg(conn: &rusqlite::Connection) -> rusqlite::Result<()> {
    conn.execute_batch(SQL_GPKG_PRAGMAS)?;
    conn.execute_batch(SQL_GPKG_SPATIAL_REF_SYS)?;
    register_default_srs_ids(conn)?;
    conn.execute_batch(SQL_GPKG_CONTENTS)?;
    conn.execute_batch(SQL_GPKG_GEOMETRY_COLUMNS)?;
    Ok(())
}

// The three entries every GeoPackage must carry. Anything else the service
// reports is registered on demand with an undefined definition.
fn register_default_srs_ids(conn: &rusqlite::Connection) -> rusqlite::Result<()> {
    const EPSG4326_WKT: &str = r#"GEOGCS["WGS 84",DATUM["WGS_1984",SPHEROID["WGS 84",6378137,298.257223563,AUTHORITY["EPSG","7030"]],AUTHORITY["EPSG","6326"]],PRIMEM["Greenwich",0,AUTHORITY["EPSG","8901"]],UNIT["degree",0.0174532925199433,AUTHORITY["EPSG","9122"]],AXIS["Latitude",NORTH],AXIS["Longitude",EAST],AUTHORITY["EPSG","4326"]]"#;

    conn.execute(
        SQL_INSERT_SRS,
        rusqlite::params!["WGS 84", 4326, "EPSG", 4326, EPSG4326_WKT, "WGS 84"],
    )?;
    conn.execute(
        SQL_INSERT_SRS,
        rusqlite::params![
            "Undefined Cartesian SRS",
            -1,
            "NONE",
            -1,
            "undefined",
            "undefined Cartesian coordinate reference system"
        ],
    )?;
    conn.execute(
        SQL_INSERT_SRS,
        rusqlite::params![
            "Undefined geographic SRS",
            0,
            "NONE",
            0,
            "undefined",
            "undefined geographic coordinate reference system"
        ],
    )?;
    Ok(())
}
