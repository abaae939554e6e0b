//! Destination abstraction.
//!
//! The sync controller only talks to `SpatialStore` and `RowWriter`. `Gpkg`
//! is the implementation shipped with this crate.

use crate::error::Result;
use crate::service::GeometryKind;
use crate::transform::LocalRow;
use crate::types::{ColumnSpec, ColumnType};

/// Role of a destination column.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ColumnKind {
    /// Row identifier maintained by the store.
    Identity,
    GlobalId,
    Geometry,
    Attribute(ColumnType),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoreColumn {
    pub name: String,
    pub kind: ColumnKind,
}

impl StoreColumn {
    pub fn new(name: impl Into<String>, kind: ColumnKind) -> Self {
        Self {
            name: name.into(),
            kind,
        }
    }
}

/// Everything needed to create a feature layer.
#[derive(Clone, Debug, PartialEq)]
pub struct LayerDefinition {
    pub name: String,
    pub geometry_column: String,
    pub geometry_kind: GeometryKind,
    pub srs_id: i32,
    pub columns: Vec<ColumnSpec>,
}

/// Sink for the rows of one sync.
pub trait RowWriter {
    fn write(&mut self, row: &LocalRow) -> Result<()>;

    /// Make everything written so far durable.
    fn flush(&mut self) -> Result<()>;

    /// Flush and release the writer.
    fn close(self: Box<Self>) -> Result<()>;
}

pub trait SpatialStore {
    /// Human readable location, used in errors and logs.
    fn location(&self) -> String;

    /// Whether this store can hold the layers created by a sync.
    fn validate_workspace(&self) -> bool;

    fn create_layer(&self, definition: &LayerDefinition) -> Result<()>;

    fn add_column(&self, layer: &str, column: &ColumnSpec) -> Result<()>;

    fn drop_columns(&self, layer: &str, columns: &[String]) -> Result<()>;

    fn columns_of(&self, layer: &str) -> Result<Vec<StoreColumn>>;

    /// Remove every row of `layer`, returning how many were deleted.
    fn delete_all_rows(&self, layer: &str) -> Result<usize>;

    /// Open a writer for `field_names`, where the first name is the geometry
    /// slot and the rest match `LocalRow::attributes`.
    fn open_row_writer<'a>(
        &'a self,
        layer: &str,
        field_names: &[String],
    ) -> Result<Box<dyn RowWriter + 'a>>;
}
