//! GeoPackage binary geometry blobs.
//!
//! Layout: 2 magic bytes, 1 version byte, 1 flags byte, 4-byte signed srs id,
//! an optional envelope of 4/6/8 doubles, then an ISO WKB payload.
// cf. https://www.geopackage.org/spec140/index.html#gpb_format

use crate::error::{Result, StoreError};
use crate::geom::envelope::{Envelope, bounds_of_geometry};
use geo_traits::GeometryTrait;
use wkb::reader::Wkb;

pub(crate) const MAGIC: [u8; 2] = [0x47, 0x50]; // "GP"
pub(crate) const VERSION: u8 = 0x00;

/// Default SQLite blob length limit; encoded geometries must stay below it.
const MAX_BLOB_LEN: usize = 1_000_000_000;

const FLAG_LITTLE_ENDIAN: u8 = 0b0000_0001;
const FLAG_EMPTY: u8 = 0b0001_0000;
const FLAG_EXTENDED: u8 = 0b0010_0000;
const ENVELOPE_SHIFT: u8 = 1;
const ENVELOPE_MASK: u8 = 0b0000_1110;

/// Which envelope, if any, the header carries.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EnvelopeKind {
    None,
    Xy,
    Xyz,
    Xym,
    Xyzm,
}

impl EnvelopeKind {
    pub(crate) fn byte_len(self) -> usize {
        match self {
            Self::None => 0,
            Self::Xy => 32,
            Self::Xyz | Self::Xym => 48,
            Self::Xyzm => 64,
        }
    }

    fn code(self) -> u8 {
        match self {
            Self::None => 0,
            Self::Xy => 1,
            Self::Xyz => 2,
            Self::Xym => 3,
            Self::Xyzm => 4,
        }
    }

    fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(Self::None),
            1 => Some(Self::Xy),
            2 => Some(Self::Xyz),
            3 => Some(Self::Xym),
            4 => Some(Self::Xyzm),
            _ => None,
        }
    }

    /// Smallest kind able to carry the ranges present in `envelope`.
    fn fitting(envelope: &Envelope) -> Self {
        match (envelope.z.is_some(), envelope.m.is_some()) {
            (false, false) => Self::Xy,
            (true, false) => Self::Xyz,
            (false, true) => Self::Xym,
            (true, true) => Self::Xyzm,
        }
    }
}

/// Decoded blob header; reading it never touches the WKB payload.
#[derive(Clone, Copy, Debug)]
pub struct BlobHeader {
    pub srs_id: i32,
    pub envelope_kind: EnvelopeKind,
    pub envelope: Option<Envelope>,
    pub empty: bool,
    pub little_endian: bool,
    pub extended: bool,
    /// Offset of the WKB payload within the blob.
    pub header_len: usize,
}

/// Options controlling blob encoding.
#[derive(Clone, Copy, Debug)]
pub struct EncodeOptions {
    /// Write a cached envelope into the header of non-point, non-empty
    /// geometries. Points never carry one; their coordinates are the envelope.
    pub write_envelope: bool,
}

impl Default for EncodeOptions {
    fn default() -> Self {
        Self {
            write_envelope: true,
        }
    }
}

/// Encode `geometry` into a geometry blob with the given srs id.
pub fn encode<G: GeometryTrait<T = f64>>(
    geometry: &G,
    srs_id: i32,
    options: &EncodeOptions,
) -> Result<Vec<u8>> {
    let bounds = bounds_of_geometry(geometry);
    let empty = bounds.is_none();
    let is_point = matches!(geometry.as_type(), geo_traits::GeometryType::Point(_));

    let envelope = if empty || is_point || !options.write_envelope {
        None
    } else {
        bounds
    };
    let kind = envelope.map_or(EnvelopeKind::None, |env| EnvelopeKind::fitting(&env));

    let mut flags = FLAG_LITTLE_ENDIAN | (kind.code() << ENVELOPE_SHIFT);
    if empty {
        flags |= FLAG_EMPTY;
    }

    let mut blob = Vec::with_capacity(8 + kind.byte_len() + 64);
    blob.extend_from_slice(&MAGIC);
    blob.push(VERSION);
    blob.push(flags);
    blob.extend_from_slice(&srs_id.to_le_bytes());
    if let Some(env) = envelope {
        write_envelope_doubles(&mut blob, &env, kind, true);
    }

    wkb::writer::write_geometry(&mut blob, geometry, &Default::default())?;

    if blob.len() > MAX_BLOB_LEN {
        return Err(StoreError::CapacityExceeded {
            required: blob.len(),
            available: MAX_BLOB_LEN,
        });
    }
    Ok(blob)
}

/// Parse the fixed header plus envelope doubles of `blob`.
pub fn header_of(blob: &[u8]) -> Result<BlobHeader> {
    if blob.len() < 8 {
        return Err(StoreError::MalformedGeometryBlob(format!(
            "{} bytes is shorter than the fixed 8-byte header",
            blob.len()
        )));
    }
    if blob[0..2] != MAGIC {
        return Err(StoreError::MalformedGeometryBlob(format!(
            "bad magic {:#04x}{:02x}",
            blob[0], blob[1]
        )));
    }
    if blob[2] != VERSION {
        return Err(StoreError::MalformedGeometryBlob(format!(
            "unsupported version {}",
            blob[2]
        )));
    }

    let flags = blob[3];
    let little_endian = flags & FLAG_LITTLE_ENDIAN != 0;
    let empty = flags & FLAG_EMPTY != 0;
    let extended = flags & FLAG_EXTENDED != 0;
    let kind = EnvelopeKind::from_code((flags & ENVELOPE_MASK) >> ENVELOPE_SHIFT)
        .ok_or_else(|| StoreError::MalformedGeometryBlob(format!("bad flags {flags:#04x}")))?;

    let header_len = 8 + kind.byte_len();
    if blob.len() < header_len {
        return Err(StoreError::MalformedGeometryBlob(format!(
            "{} bytes is shorter than the declared {header_len}-byte header",
            blob.len()
        )));
    }

    let srs_id = read_i32(&blob[4..8], little_endian);
    let envelope = read_envelope_doubles(&blob[8..header_len], kind, little_endian);

    Ok(BlobHeader {
        srs_id,
        envelope_kind: kind,
        envelope,
        empty,
        little_endian,
        extended,
        header_len,
    })
}

/// Decode `blob` into its WKB payload and header.
pub fn decode(blob: &[u8]) -> Result<(Wkb<'_>, BlobHeader)> {
    let header = header_of(blob)?;
    let payload = Wkb::try_new(&blob[header.header_len..])?;
    Ok((payload, header))
}

/// Bounding box of the geometry stored in `blob`.
///
/// `Ok(None)` is the explicit marker for an empty geometry. When the header
/// carries no envelope the payload coordinates are scanned directly; a blob
/// that parses neither as a geometry blob nor as bare WKB (the foreign
/// fallback encoding) fails with `NotComputable`.
pub fn bounding_box_of(blob: &[u8]) -> Result<Option<Envelope>> {
    match header_of(blob) {
        Ok(header) => {
            if header.empty {
                return Ok(None);
            }
            if let Some(env) = header.envelope {
                return Ok(Some(env));
            }
            match Wkb::try_new(&blob[header.header_len..]) {
                Ok(payload) => Ok(bounds_of_geometry(&payload)),
                Err(_) => bare_wkb_bounds(blob),
            }
        }
        Err(_) => bare_wkb_bounds(blob),
    }
}

fn bare_wkb_bounds(blob: &[u8]) -> Result<Option<Envelope>> {
    match Wkb::try_new(blob) {
        Ok(payload) => Ok(bounds_of_geometry(&payload)),
        Err(_) => Err(StoreError::NotComputable),
    }
}

/// Rewrite the srs id in the header, leaving everything else untouched.
pub fn patch_srs_id(blob: &mut [u8], srs_id: i32) -> Result<()> {
    let header = header_of(blob)?;
    let bytes = if header.little_endian {
        srs_id.to_le_bytes()
    } else {
        srs_id.to_be_bytes()
    };
    blob[4..8].copy_from_slice(&bytes);
    Ok(())
}

/// Rewrite the cached envelope in the header in place.
///
/// The payload is never moved, so the new envelope must fit the blob's
/// existing envelope allocation exactly; anything else fails with
/// `CapacityExceeded`.
pub fn patch_envelope(blob: &mut [u8], envelope: &Envelope) -> Result<()> {
    let header = header_of(blob)?;
    let kind = EnvelopeKind::fitting(envelope);
    if kind.byte_len() != header.envelope_kind.byte_len() {
        return Err(StoreError::CapacityExceeded {
            required: kind.byte_len(),
            available: header.envelope_kind.byte_len(),
        });
    }

    blob[3] = (blob[3] & !ENVELOPE_MASK) | (kind.code() << ENVELOPE_SHIFT);
    let mut doubles = Vec::with_capacity(kind.byte_len());
    write_envelope_doubles(&mut doubles, envelope, kind, header.little_endian);
    blob[8..8 + kind.byte_len()].copy_from_slice(&doubles);
    Ok(())
}

fn write_envelope_doubles(out: &mut Vec<u8>, env: &Envelope, kind: EnvelopeKind, le: bool) {
    let mut push = |v: f64| {
        if le {
            out.extend_from_slice(&v.to_le_bytes());
        } else {
            out.extend_from_slice(&v.to_be_bytes());
        }
    };
    push(env.min_x);
    push(env.max_x);
    push(env.min_y);
    push(env.max_y);
    if matches!(kind, EnvelopeKind::Xyz | EnvelopeKind::Xyzm) {
        let (lo, hi) = env.z.unwrap_or((f64::NAN, f64::NAN));
        push(lo);
        push(hi);
    }
    if matches!(kind, EnvelopeKind::Xym | EnvelopeKind::Xyzm) {
        let (lo, hi) = env.m.unwrap_or((f64::NAN, f64::NAN));
        push(lo);
        push(hi);
    }
}

fn read_envelope_doubles(bytes: &[u8], kind: EnvelopeKind, le: bool) -> Option<Envelope> {
    if kind == EnvelopeKind::None {
        return None;
    }
    let read = |i: usize| read_f64(&bytes[i * 8..i * 8 + 8], le);
    let mut env = Envelope::new(read(0), read(1), read(2), read(3));
    match kind {
        EnvelopeKind::Xyz => env.z = Some((read(4), read(5))),
        EnvelopeKind::Xym => env.m = Some((read(4), read(5))),
        EnvelopeKind::Xyzm => {
            env.z = Some((read(4), read(5)));
            env.m = Some((read(6), read(7)));
        }
        EnvelopeKind::None | EnvelopeKind::Xy => {}
    }
    Some(env)
}

fn read_i32(bytes: &[u8], le: bool) -> i32 {
    let array: [u8; 4] = bytes.try_into().expect("4-byte slice");
    if le {
        i32::from_le_bytes(array)
    } else {
        i32::from_be_bytes(array)
    }
}

fn read_f64(bytes: &[u8], le: bool) -> f64 {
    let array: [u8; 8] = bytes.try_into().expect("8-byte slice");
    if le {
        f64::from_le_bytes(array)
    } else {
        f64::from_be_bytes(array)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use geo_types::{LineString, Point, Polygon};
    use std::str::FromStr;
    use wkt::Wkt;

    fn square() -> Polygon<f64> {
        Polygon::new(
            LineString::from(vec![
                (0.0, 0.0),
                (3.0, 0.0),
                (3.0, 3.0),
                (0.0, 3.0),
                (0.0, 0.0),
            ]),
            vec![],
        )
    }

    #[test]
    fn point_blob_never_carries_envelope() {
        let blob = encode(&Point::new(1.5, -2.0), 4326, &EncodeOptions::default()).unwrap();
        let header = header_of(&blob).unwrap();
        assert_eq!(header.envelope_kind, EnvelopeKind::None);
        assert!(!header.empty);
        assert_eq!(header.srs_id, 4326);

        // Bounding box still derives from the payload coordinates.
        let env = bounding_box_of(&blob).unwrap().expect("non-empty");
        assert_eq!((env.min_x, env.max_x, env.min_y, env.max_y), (1.5, 1.5, -2.0, -2.0));
    }

    #[test]
    fn polygon_blob_carries_xy_envelope() {
        let blob = encode(&square(), 4326, &EncodeOptions::default()).unwrap();
        let header = header_of(&blob).unwrap();
        assert_eq!(header.envelope_kind, EnvelopeKind::Xy);

        let env = header.envelope.expect("envelope present");
        assert_eq!((env.min_x, env.max_x, env.min_y, env.max_y), (0.0, 3.0, 0.0, 3.0));
    }

    #[test]
    fn z_geometry_gets_xyz_envelope() {
        let line = Wkt::<f64>::from_str("LINESTRING Z (0 0 5, 1 2 9)").unwrap();
        let blob = encode(&line, 4326, &EncodeOptions::default()).unwrap();
        let header = header_of(&blob).unwrap();
        assert_eq!(header.envelope_kind, EnvelopeKind::Xyz);
        assert_eq!(header.envelope.unwrap().z, Some((5.0, 9.0)));
    }

    #[test]
    fn decode_roundtrips_payload() {
        let polygon = square();
        let mut wkb_bytes = Vec::new();
        wkb::writer::write_geometry(&mut wkb_bytes, &polygon, &Default::default()).unwrap();

        let blob = encode(&polygon, 4326, &EncodeOptions::default()).unwrap();
        let (payload, header) = decode(&blob).unwrap();
        assert_eq!(payload.buf(), wkb_bytes.as_slice());
        assert_eq!(header.srs_id, 4326);
    }

    #[test]
    fn empty_polygon_is_flagged_and_has_no_bounds() {
        let empty: Polygon<f64> = Polygon::new(LineString::new(Vec::new()), Vec::new());
        let blob = encode(&empty, 4326, &EncodeOptions::default()).unwrap();
        let header = header_of(&blob).unwrap();
        assert!(header.empty);
        assert_eq!(header.envelope_kind, EnvelopeKind::None);
        assert_eq!(bounding_box_of(&blob).unwrap(), None);
    }

    #[test]
    fn rejects_bad_magic_version_and_flags() {
        let blob = encode(&Point::new(0.0, 0.0), 0, &EncodeOptions::default()).unwrap();

        let mut bad_magic = blob.clone();
        bad_magic[0] = b'X';
        assert!(matches!(
            header_of(&bad_magic),
            Err(StoreError::MalformedGeometryBlob(_))
        ));

        let mut bad_version = blob.clone();
        bad_version[2] = 9;
        assert!(matches!(
            header_of(&bad_version),
            Err(StoreError::MalformedGeometryBlob(_))
        ));

        let mut bad_flags = blob.clone();
        bad_flags[3] = 0b0000_1011; // envelope code 5
        assert!(matches!(
            header_of(&bad_flags),
            Err(StoreError::MalformedGeometryBlob(_))
        ));
    }

    #[test]
    fn header_reads_without_payload() {
        let blob = encode(&square(), 4326, &EncodeOptions::default()).unwrap();
        let header = header_of(&blob).unwrap();
        // Truncate right after the envelope; the header must still parse.
        let header2 = header_of(&blob[..header.header_len]).unwrap();
        assert_eq!(header2.envelope.unwrap(), header.envelope.unwrap());
    }

    #[test]
    fn bare_wkb_falls_back_before_failing() {
        let mut wkb_bytes = Vec::new();
        wkb::writer::write_geometry(&mut wkb_bytes, &Point::new(7.0, 8.0), &Default::default())
            .unwrap();
        let env = bounding_box_of(&wkb_bytes).unwrap().expect("non-empty");
        assert_eq!((env.min_x, env.min_y), (7.0, 8.0));

        assert!(matches!(
            bounding_box_of(&[0u8; 16]),
            Err(StoreError::NotComputable)
        ));
    }

    #[test]
    fn patch_srs_id_keeps_payload() {
        let mut blob = encode(&square(), 4326, &EncodeOptions::default()).unwrap();
        let before = decode(&blob).unwrap().0.buf().to_vec();

        patch_srs_id(&mut blob, 3857).unwrap();
        let (payload, header) = decode(&blob).unwrap();
        assert_eq!(header.srs_id, 3857);
        assert_eq!(payload.buf(), before.as_slice());
    }

    #[test]
    fn patch_envelope_requires_matching_allocation() {
        let mut blob = encode(&square(), 4326, &EncodeOptions::default()).unwrap();
        let before = decode(&blob).unwrap().0.buf().to_vec();

        patch_envelope(&mut blob, &Envelope::new(-1.0, 4.0, -1.0, 4.0)).unwrap();
        let (payload, header) = decode(&blob).unwrap();
        assert_eq!(header.envelope.unwrap(), Envelope::new(-1.0, 4.0, -1.0, 4.0));
        assert_eq!(payload.buf(), before.as_slice());

        // A point blob has no envelope allocation to patch into.
        let mut point_blob = encode(&Point::new(0.0, 0.0), 4326, &EncodeOptions::default()).unwrap();
        assert!(matches!(
            patch_envelope(&mut point_blob, &Envelope::new(0.0, 1.0, 0.0, 1.0)),
            Err(StoreError::CapacityExceeded { .. })
        ));

        // A wider (XYZ) envelope does not fit an XY allocation.
        let mut xyz = Envelope::new(0.0, 1.0, 0.0, 1.0);
        xyz.z = Some((0.0, 2.0));
        assert!(matches!(
            patch_envelope(&mut blob, &xyz),
            Err(StoreError::CapacityExceeded { .. })
        ));
    }
}
