use thiserror::Error;

/// Crate error type for REST synchronization and GeoPackage operations.
#[derive(Debug, Error)]
pub enum RestCacheError {
    /// Wraps errors returned by `rusqlite`.
    #[error(transparent)]
    Sql(#[from] rusqlite::Error),
    /// Wraps errors returned by the `wkb` crate.
    #[error(transparent)]
    Wkb(#[from] wkb::error::WkbError),
    /// Wraps JSON decoding errors that are not retried.
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    /// The HTTP client could not be constructed.
    #[error("http client error: {0}")]
    Http(String),
    /// The destination is not a workspace the sync can write to.
    #[error("incorrect workspace type for '{location}': destination must be a writable GeoPackage")]
    IncorrectWorkspaceType { location: String },
    /// Destination columns disagree with the fields published by the service.
    #[error(
        "schema of layer '{layer}' does not match the service (missing: {missing:?}, unexpected: {unexpected:?})"
    )]
    SchemaMismatch {
        layer: String,
        missing: Vec<String>,
        unexpected: Vec<String>,
    },
    /// A filter matches more records than a non-paginated service returns.
    #[error(
        "query returns {count} records, more than the service maximum of {max_record_count}; refine the filter: {filter}"
    )]
    TooManyRecords {
        filter: String,
        count: u64,
        max_record_count: u32,
    },
    /// The service kept failing until the retry budget ran out.
    #[error("service unavailable after {attempts} attempts: {url}")]
    ServiceUnavailable { url: String, attempts: u32 },
    /// The service answered, but not with something usable.
    #[error("map service error at {url}: {message}")]
    MapServiceError { url: String, message: String },
    /// The caller cancelled the sync between two page fetches.
    #[error("sync cancelled")]
    Cancelled,
    /// A geometry type in metadata could not be mapped to a supported geometry kind.
    #[error("unsupported geometry type: {0}")]
    UnsupportedGeometryType(String),
    /// A column type declared in SQLite metadata is not supported by this crate.
    #[error("unsupported column type for column '{column}': {declared_type}")]
    UnsupportedColumnType {
        column: String,
        declared_type: String,
    },
    /// A layer with the same name already exists.
    #[error("layer already exists: {layer_name}")]
    LayerAlreadyExists { layer_name: String },
    /// Referenced `srs_id` does not exist in `gpkg_spatial_ref_sys`.
    #[error("srs_id {srs_id} not found in gpkg_spatial_ref_sys")]
    MissingSpatialRefSysId { srs_id: i32 },
    /// Layer schema has multiple primary key columns, which is unsupported.
    #[error("composite primary keys are not supported yet for layer: {layer_name}")]
    CompositePrimaryKeyUnsupported { layer_name: String },
    /// Layer schema has no primary key column.
    #[error("no primary key column found for layer: {layer_name}")]
    MissingPrimaryKeyColumn { layer_name: String },
    /// Layer is not registered in `gpkg_geometry_columns`.
    #[error("no geometry column found for layer: {layer_name}")]
    MissingGeometryColumn { layer_name: String },
    /// Invalid GeoPackage geometry flags byte.
    #[error("invalid gpkg geometry flags: {0:#04x}")]
    InvalidGpkgGeometryFlags(u8),
    /// GeoPackage geometry blob is too short for its header.
    #[error("invalid gpkg geometry length: got {len} bytes, expected at least {minimum}")]
    InvalidGpkgGeometryLength { len: usize, minimum: usize },
    #[error("operation not allowed on read-only connection")]
    ReadOnly,
    #[error("{0}")]
    Message(String),
}

pub type Result<T> = std::result::Result<T, RestCacheError>;
