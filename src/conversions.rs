use crate::error::StoreError;
use crate::types::{ColumnType, Dimension, GeometryKind};

#[inline]
pub(crate) fn geometry_kind_to_str(kind: GeometryKind) -> &'static str {
    match kind {
        GeometryKind::Geometry => "GEOMETRY",
        GeometryKind::Point => "POINT",
        GeometryKind::LineString => "LINESTRING",
        GeometryKind::Polygon => "POLYGON",
        GeometryKind::MultiPoint => "MULTIPOINT",
        GeometryKind::MultiLineString => "MULTILINESTRING",
        GeometryKind::MultiPolygon => "MULTIPOLYGON",
        GeometryKind::GeometryCollection => "GEOMETRYCOLLECTION",
        GeometryKind::PolyhedralSurface => "POLYHEDRALSURFACE",
        GeometryKind::Tin => "TIN",
        GeometryKind::Triangle => "TRIANGLE",
    }
}

#[inline]
pub(crate) fn geometry_kind_from_str(name: &str) -> Result<GeometryKind, StoreError> {
    let s = name.trim();
    if s.eq_ignore_ascii_case("GEOMETRY") {
        Ok(GeometryKind::Geometry)
    } else if s.eq_ignore_ascii_case("POINT") {
        Ok(GeometryKind::Point)
    } else if s.eq_ignore_ascii_case("LINESTRING") {
        Ok(GeometryKind::LineString)
    } else if s.eq_ignore_ascii_case("POLYGON") {
        Ok(GeometryKind::Polygon)
    } else if s.eq_ignore_ascii_case("MULTIPOINT") {
        Ok(GeometryKind::MultiPoint)
    } else if s.eq_ignore_ascii_case("MULTILINESTRING") {
        Ok(GeometryKind::MultiLineString)
    } else if s.eq_ignore_ascii_case("MULTIPOLYGON") {
        Ok(GeometryKind::MultiPolygon)
    } else if s.eq_ignore_ascii_case("GEOMETRYCOLLECTION") {
        Ok(GeometryKind::GeometryCollection)
    } else if s.eq_ignore_ascii_case("POLYHEDRALSURFACE") {
        Ok(GeometryKind::PolyhedralSurface)
    } else if s.eq_ignore_ascii_case("TIN") {
        Ok(GeometryKind::Tin)
    } else if s.eq_ignore_ascii_case("TRIANGLE") {
        Ok(GeometryKind::Triangle)
    } else {
        Err(StoreError::UnsupportedGeometryType(name.to_string()))
    }
}

#[inline]
pub(crate) fn dimension_to_zm(dimension: Dimension) -> (i8, i8) {
    match dimension {
        Dimension::Xy => (0, 0),
        Dimension::Xyz => (1, 0),
        Dimension::Xym => (0, 1),
        Dimension::Xyzm => (1, 1),
    }
}

#[inline]
pub(crate) fn dimension_from_zm(z: i8, m: i8) -> Result<Dimension, StoreError> {
    // The catalog also allows 2 ("optional"); treat it like presence since
    // stored blobs then decide per feature.
    match (z, m) {
        (0, 0) => Ok(Dimension::Xy),
        (1 | 2, 0) => Ok(Dimension::Xyz),
        (0, 1 | 2) => Ok(Dimension::Xym),
        (1 | 2, 1 | 2) => Ok(Dimension::Xyzm),
        _ => Err(StoreError::InvalidDimension { z, m }),
    }
}

/// Declared SQLite type for an attribute column.
// cf. https://www.geopackage.org/spec140/index.html#table_column_data_types
pub(crate) fn column_type_to_decl(column_type: ColumnType, width: Option<u32>) -> String {
    let base = match column_type {
        ColumnType::Boolean => "BOOLEAN",
        ColumnType::Int16 => "SMALLINT",
        ColumnType::Int32 => "MEDIUMINT",
        ColumnType::Int64 => "INTEGER",
        ColumnType::Float32 => "FLOAT",
        ColumnType::Float64 => "DOUBLE",
        ColumnType::Text | ColumnType::Json => "TEXT",
        ColumnType::Blob => "BLOB",
        ColumnType::Date => "DATE",
        ColumnType::DateTime => "DATETIME",
    };
    match (column_type, width) {
        (ColumnType::Text | ColumnType::Blob, Some(n)) => format!("{base}({n})"),
        _ => base.to_string(),
    }
}

/// Map a declared SQLite type back to a logical column type and width.
///
/// Returns `None` for declarations this crate cannot represent.
pub(crate) fn column_type_from_decl(decl: &str) -> Option<(ColumnType, Option<u32>)> {
    let decl = decl.trim();
    let (base, width) = match decl.find('(') {
        Some(open) if decl.ends_with(')') => {
            let width = decl[open + 1..decl.len() - 1].trim().parse::<u32>().ok();
            (&decl[..open], width)
        }
        _ => (decl, None),
    };
    let s = base.trim();

    let column_type = if s.eq_ignore_ascii_case("BOOLEAN") {
        ColumnType::Boolean
    } else if s.eq_ignore_ascii_case("TINYINT") || s.eq_ignore_ascii_case("SMALLINT") {
        ColumnType::Int16
    } else if s.eq_ignore_ascii_case("MEDIUMINT") {
        ColumnType::Int32
    } else if s.eq_ignore_ascii_case("INT") || s.eq_ignore_ascii_case("INTEGER") {
        ColumnType::Int64
    } else if s.eq_ignore_ascii_case("FLOAT") {
        ColumnType::Float32
    } else if s.eq_ignore_ascii_case("DOUBLE") || s.eq_ignore_ascii_case("REAL") {
        ColumnType::Float64
    } else if s.eq_ignore_ascii_case("TEXT") || s.eq_ignore_ascii_case("VARCHAR") {
        ColumnType::Text
    } else if s.eq_ignore_ascii_case("BLOB") {
        ColumnType::Blob
    } else if s.eq_ignore_ascii_case("DATE") {
        ColumnType::Date
    } else if s.eq_ignore_ascii_case("DATETIME") {
        ColumnType::DateTime
    } else {
        return None;
    };
    Some((column_type, width))
}
