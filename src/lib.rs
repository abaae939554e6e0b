//! Mirror Esri REST feature services into GeoPackage layers.
//!
//! ## Overview
//!
//! - `RestCache` is a session against one feature service layer. Building it
//!   reads the service metadata into a `ServiceModel`.
//! - `Gpkg` is the destination. It implements `SpatialStore`, the trait the
//!   sync engine writes through.
//! - `GpkgLayer` and `GpkgFeature` read back what was written.
//!
//! A sync counts the records matching each `where` filter, then fetches them
//! in one request or page by page with `resultOffset`, depending on what the
//! service supports. Records are converted from Esri JSON (geometry, epoch
//! dates, plain attributes) and written to the destination layer. Records
//! whose geometry is null or malformed are skipped and counted.
//!
//! By default the destination is replaced: its rows are deleted right before
//! the first page is written. With `SyncOptions::with_append(true)` the
//! existing rows are kept.
//!
//! ## Short usage
//!
//! ```no_run
//! use restcache_gpkg::{Gpkg, RestCache, SyncOptions};
//!
//! let cache = RestCache::new(
//!     "https://example.com/arcgis/rest/services/Parcels/FeatureServer/0",
//!     None,
//! )?;
//! let gpkg = Gpkg::new("parcels.gpkg")?;
//! let layer = cache.create_destination(&gpkg, None, &[])?;
//!
//! let report = cache.sync(&gpkg, &layer, &SyncOptions::new())?;
//! println!("{} rows written", report.rows_written);
//! # Ok::<(), restcache_gpkg::RestCacheError>(())
//! ```
//!
//! ## Filters, retries and field lists
//!
//! ```no_run
//! use restcache_gpkg::{Gpkg, RestCache, SyncOptions, TransportConfig};
//!
//! let cache = RestCache::builder("https://example.com/arcgis/rest/services/Parcels/FeatureServer/0")
//!     .token(Some("secret".to_string()))
//!     .config(TransportConfig::default().with_max_attempts(3))
//!     .exclude_fields(vec!["Shape_Length".to_string()])
//!     .build()?;
//!
//! let gpkg = Gpkg::open("parcels.gpkg")?;
//! let options = SyncOptions::new()
//!     .with_filters(vec!["ZONE = 'A'".to_string(), "ZONE = 'B'".to_string()])
//!     .with_append(true)
//!     .with_user_fields(vec!["notes".to_string()]);
//! cache.sync(&gpkg, "parcels", &options)?;
//! # Ok::<(), restcache_gpkg::RestCacheError>(())
//! ```
//!
//! ## Reading back
//!
//! ```no_run
//! use restcache_gpkg::{Gpkg, Value};
//!
//! let gpkg = Gpkg::open_read_only("parcels.gpkg")?;
//! let layer = gpkg.open_layer("parcels")?;
//! for feature in layer.features()? {
//!     let _geom = feature.geometry()?;
//!     if let Some(Value::Text(zone)) = feature.property("ZONE") {
//!         println!("{}: {zone}", feature.id());
//!     }
//! }
//! # Ok::<(), restcache_gpkg::RestCacheError>(())
//! ```
mod config;
mod conversions;
mod error;
mod gpkg;
mod http;
mod ogc_sql;
mod planner;
mod schema;
mod service;
mod store;
mod sync;
mod transform;
mod transport;
mod types;

pub use config::TransportConfig;
pub use error::{RestCacheError, Result};
pub use gpkg::{Gpkg, GpkgFeature, GpkgLayer};
pub use http::{HttpClient, HttpError, HttpRequest, HttpResponse, ReqwestClient};
pub use planner::{FilterPlan, Filters, MATCH_ALL, QueryEntry, QueryPlan, QueryPlanner};
pub use schema::{SchemaDiff, comparable_columns, reconcile};
pub use service::{
    EsriFieldType, FieldSpec, GEOMETRY_FIELD, GeometryKind, ServiceModel, sanitize_table_name,
};
pub use store::{ColumnKind, LayerDefinition, RowWriter, SpatialStore, StoreColumn};
pub use sync::{
    DEFAULT_GEOMETRY_COLUMN, RestCache, RestCacheBuilder, SyncOptions, SyncReport, SyncState,
};
pub use transform::{GeometryError, LocalRow, RemoteRecord, decode_timestamp, transform};
pub use transport::Transport;
pub use types::{ColumnSpec, ColumnType, Value};
