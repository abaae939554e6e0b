use crate::Value;
use crate::error::{RestCacheError, Result};
use geo_traits::GeometryTrait;
use std::collections::HashMap;
use std::sync::Arc;
use wkb::reader::Wkb;

const GPKG_HEADER_LEN: usize = 8;

/// A single row of a feature layer.
#[derive(Clone, Debug)]
pub struct GpkgFeature {
    pub(super) id: i64,
    pub(super) geometry: Option<Vec<u8>>,
    pub(super) properties: Vec<Value>,
    pub(super) property_index_by_name: Arc<HashMap<String, usize>>,
}

impl GpkgFeature {
    /// Primary key of the row.
    pub fn id(&self) -> i64 {
        self.id
    }

    /// The geometry as WKB, with the GeoPackage header stripped.
    pub fn geometry(&self) -> Result<Option<Wkb<'_>>> {
        self.geometry
            .as_deref()
            .map(gpkg_geometry_to_wkb)
            .transpose()
    }

    pub fn property(&self, name: &str) -> Option<&Value> {
        let idx = self.property_index_by_name.get(name)?;
        self.properties.get(*idx)
    }
}

/// Strip the GeoPackage header and envelope to get at the WKB.
// cf. https://www.geopackage.org/spec140/index.html#gpb_format
pub(crate) fn gpkg_geometry_to_wkb(b: &[u8]) -> Result<Wkb<'_>> {
    if b.len() < GPKG_HEADER_LEN {
        return Err(RestCacheError::InvalidGpkgGeometryLength {
            len: b.len(),
            minimum: GPKG_HEADER_LEN,
        });
    }

    let flags = b[3];
    let envelope_size: usize = match flags & 0b00001110 {
        0b00000000 => 0,
        0b00000010 => 32,
        0b00000100 | 0b00000110 => 48,
        0b00001000 => 64,
        _ => return Err(RestCacheError::InvalidGpkgGeometryFlags(flags)),
    };
    let offset = GPKG_HEADER_LEN + envelope_size;
    if b.len() < offset {
        return Err(RestCacheError::InvalidGpkgGeometryLength {
            len: b.len(),
            minimum: offset,
        });
    }

    Ok(Wkb::try_new(&b[offset..])?)
}

/// Encode a geometry as a GeoPackage blob: header, little endian SRS id and
/// WKB, without an envelope.
// cf. https://www.geopackage.org/spec140/index.html#gpb_format
pub(crate) fn encode_gpkg_geometry<G>(geometry: &G, srs_id: i32) -> Result<Vec<u8>>
where
    G: GeometryTrait<T = f64>,
{
    let mut blob = Vec::with_capacity(64);
    blob.extend_from_slice(&[
        0x47u8, // magic
        0x50u8, // magic
        0x00u8, // version
        0x01u8, // flags (little endian SRS ID, no envelope)
    ]);
    blob.extend_from_slice(&srs_id.to_le_bytes());
    wkb::writer::write_geometry(&mut blob, geometry, &Default::default())?;
    Ok(blob)
}

#[cfg(test)]
mod tests {
    use super::{encode_gpkg_geometry, gpkg_geometry_to_wkb};
    use crate::Result;
    use crate::error::RestCacheError;
    use geo_types::{LineString, MultiLineString, Point};

    #[test]
    fn gpkg_blob_wraps_wkb() -> Result<()> {
        let line = MultiLineString::new(vec![LineString::from(vec![(0.0, 0.0), (1.0, 2.0)])]);
        let mut expected = Vec::new();
        wkb::writer::write_geometry(&mut expected, &line, &Default::default())?;

        let blob = encode_gpkg_geometry(&line, 3857)?;
        assert_eq!(&blob[..4], &[0x47, 0x50, 0x00, 0x01]);
        assert_eq!(&blob[4..8], &3857i32.to_le_bytes());

        let recovered = gpkg_geometry_to_wkb(&blob)?;
        assert_eq!(recovered.buf(), expected.as_slice());
        Ok(())
    }

    #[test]
    fn invalid_flags_are_rejected() {
        let mut blob = vec![0x47, 0x50, 0x00, 0x0A, 0, 0, 0, 0];
        blob.extend_from_slice(&[0; 16]);
        assert!(matches!(
            gpkg_geometry_to_wkb(&blob),
            Err(RestCacheError::InvalidGpkgGeometryFlags(0x0A))
        ));
    }

    #[test]
    fn truncated_blobs_are_rejected() -> Result<()> {
        assert!(matches!(
            gpkg_geometry_to_wkb(&[0x47, 0x50, 0x00]),
            Err(RestCacheError::InvalidGpkgGeometryLength { len: 3, minimum: 8 })
        ));

        // Envelope flag set but no envelope bytes.
        let mut blob = encode_gpkg_geometry(&Point::new(1.0, 1.0), 4326)?;
        blob[3] = 0x03;
        blob.truncate(20);
        assert!(matches!(
            gpkg_geometry_to_wkb(&blob),
            Err(RestCacheError::InvalidGpkgGeometryLength { len: 20, minimum: 40 })
        ));
        Ok(())
    }
}
