use crate::Value;
use crate::error::Result;
use crate::store::RowWriter;
use crate::transform::LocalRow;
use rusqlite::params_from_iter;
use tracing::debug;

use super::encode_gpkg_geometry;
use super::layer::build_insert_sql;

/// Inserts rows inside a transaction that is committed on `flush`.
///
/// Dropping the writer without flushing rolls back the pending rows.
pub(crate) struct GpkgRowWriter<'a> {
    conn: &'a rusqlite::Connection,
    layer_name: String,
    insert_sql: String,
    srs_id: i32,
    transaction: Option<rusqlite::Transaction<'a>>,
    pending: usize,
}

impl<'a> GpkgRowWriter<'a> {
    pub(crate) fn new(
        conn: &'a rusqlite::Connection,
        layer_name: &str,
        geometry_column: &str,
        attribute_columns: &[&str],
        srs_id: i32,
    ) -> Self {
        Self {
            conn,
            layer_name: layer_name.to_string(),
            insert_sql: build_insert_sql(layer_name, geometry_column, attribute_columns),
            srs_id,
            transaction: None,
            pending: 0,
        }
    }
}

impl RowWriter for GpkgRowWriter<'_> {
    fn write(&mut self, row: &LocalRow) -> Result<()> {
        if self.transaction.is_none() {
            self.transaction = Some(self.conn.unchecked_transaction()?);
        }

        let geometry = Value::Blob(encode_gpkg_geometry(&row.geometry, self.srs_id)?);
        let params = std::iter::once(&geometry).chain(row.attributes.iter());
        let mut stmt = self.conn.prepare_cached(&self.insert_sql)?;
        stmt.execute(params_from_iter(params))?;
        self.pending += 1;
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        if let Some(transaction) = self.transaction.take() {
            transaction.commit()?;
            debug!(layer = %self.layer_name, rows = self.pending, "Committed rows");
            self.pending = 0;
        }
        Ok(())
    }

    fn close(mut self: Box<Self>) -> Result<()> {
        self.flush()
    }
}

#[cfg(test)]
mod tests {
    use crate::Result;
    use crate::Value;
    use crate::gpkg::Gpkg;
    use crate::service::{GEOMETRY_FIELD, GeometryKind};
    use crate::store::SpatialStore;
    use crate::transform::LocalRow;
    use crate::types::{ColumnSpec, ColumnType};
    use chrono::{TimeZone, Utc};
    use geo_types::{Geometry, Point};

    fn gpkg_with_layer() -> Result<Gpkg> {
        let gpkg = Gpkg::new_in_memory()?;
        gpkg.create_layer(
            "points",
            "shape",
            GeometryKind::Point,
            4326,
            &[
                ColumnSpec::new("name", ColumnType::Varchar),
                ColumnSpec::new("surveyed", ColumnType::DateTime),
            ],
        )?;
        Ok(gpkg)
    }

    fn row(x: f64, name: &str) -> LocalRow {
        LocalRow {
            geometry: Geometry::Point(Point::new(x, 1.0)),
            attributes: vec![
                Value::from(name),
                Value::DateTime(Utc.with_ymd_and_hms(2021, 3, 4, 5, 6, 7).unwrap()),
            ],
        }
    }

    fn field_names() -> Vec<String> {
        vec![GEOMETRY_FIELD.to_string(), "name".to_string(), "surveyed".to_string()]
    }

    #[test]
    fn flushed_rows_are_committed() -> Result<()> {
        let gpkg = gpkg_with_layer()?;
        let mut writer = gpkg.open_row_writer("points", &field_names())?;
        writer.write(&row(1.0, "a"))?;
        writer.write(&row(2.0, "b"))?;
        writer.flush()?;
        writer.write(&row(3.0, "c"))?;
        writer.close()?;

        let features = gpkg.open_layer("points")?.features()?;
        assert_eq!(features.len(), 3);
        assert_eq!(features[2].property("name"), Some(&Value::from("c")));
        assert_eq!(
            features[0].property("surveyed"),
            Some(&Value::from("2021-03-04T05:06:07.000Z"))
        );
        Ok(())
    }

    #[test]
    fn dropped_writer_rolls_back_pending_rows() -> Result<()> {
        let gpkg = gpkg_with_layer()?;
        {
            let mut writer = gpkg.open_row_writer("points", &field_names())?;
            writer.write(&row(1.0, "a"))?;
            writer.flush()?;
            writer.write(&row(2.0, "b"))?;
        }
        assert_eq!(gpkg.open_layer("points")?.count()?, 1);
        Ok(())
    }
}
