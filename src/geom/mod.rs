//! Geometry blob codec and envelope math.
//!
//! `codec` reads and writes the GeoPackage binary geometry format (header +
//! optional envelope + ISO WKB payload); `envelope` is the axis-aligned
//! bounding box type shared by the codec, the spatial index and the cached
//! table extents.

pub mod codec;
mod envelope;

pub use envelope::Envelope;
pub(crate) use envelope::bounds_of_geometry;
