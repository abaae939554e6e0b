//! GeoPackage destination backed by rusqlite.
//!
//! `Gpkg` implements `SpatialStore`, so it can be handed directly to
//! `RestCache::sync`. The layer API is also usable on its own.

mod feature;
mod gpkg;
mod layer;
mod writer;

pub use feature::GpkgFeature;
pub use gpkg::Gpkg;
pub use layer::GpkgLayer;

pub(crate) use feature::encode_gpkg_geometry;
