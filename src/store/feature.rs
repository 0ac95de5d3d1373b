use crate::error::{Result, StoreError};
use crate::geom::codec;
use crate::store::table::ReaderGuard;
use geo_traits::GeometryTrait;
use rusqlite::types::{Type, Value};
use std::collections::HashMap;
use std::sync::Arc;
use wkb::reader::Wkb;

/// A single feature: optional id, optional geometry (ISO WKB bytes, owned),
/// and the attribute values in table column order.
pub struct Feature {
    pub(crate) fid: Option<i64>,
    pub(crate) geometry: Option<Vec<u8>>,
    pub(crate) values: Vec<Value>,
    pub(crate) property_index_by_name: Arc<HashMap<String, usize>>,
}

impl Feature {
    /// An empty feature with no id, no geometry and no values.
    pub fn new() -> Self {
        Self {
            fid: None,
            geometry: None,
            values: Vec::new(),
            property_index_by_name: Arc::new(HashMap::new()),
        }
    }

    pub fn with_fid(mut self, fid: i64) -> Self {
        self.fid = Some(fid);
        self
    }

    /// Attach a geometry; any `geo_traits::GeometryTrait` value works.
    pub fn with_geometry<G: GeometryTrait<T = f64>>(mut self, geometry: &G) -> Result<Self> {
        let mut buf = Vec::new();
        wkb::writer::write_geometry(&mut buf, geometry, &Default::default())?;
        self.geometry = Some(buf);
        Ok(self)
    }

    /// Attribute values in table column order.
    pub fn with_values<I>(mut self, values: I) -> Self
    where
        I: IntoIterator<Item = Value>,
    {
        self.values = values.into_iter().collect();
        self
    }

    pub fn fid(&self) -> Option<i64> {
        self.fid
    }

    pub fn set_fid(&mut self, fid: i64) {
        self.fid = Some(fid);
    }

    /// Decode the stored geometry into a WKB reader.
    pub fn geometry(&self) -> Result<Option<Wkb<'_>>> {
        match &self.geometry {
            Some(bytes) => Ok(Some(Wkb::try_new(bytes)?)),
            None => Ok(None),
        }
    }

    /// Raw WKB payload bytes, if a geometry is present.
    pub fn geometry_wkb(&self) -> Option<&[u8]> {
        self.geometry.as_deref()
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }

    /// Look up an attribute value by column name.
    ///
    /// Only available on features read back from a table; features built with
    /// `Feature::new` have no name index.
    pub fn property(&self, name: &str) -> Option<&Value> {
        let idx = *self.property_index_by_name.get(name)?;
        self.values.get(idx)
    }

    pub fn property_at(&self, idx: usize) -> Result<&Value> {
        self.values
            .get(idx)
            .ok_or(StoreError::Sql(rusqlite::Error::InvalidColumnIndex(idx)))
    }
}

impl Default for Feature {
    fn default() -> Self {
        Self::new()
    }
}

/// Owned iterator over features.
pub struct FeatureIterator {
    pub(crate) features: std::vec::IntoIter<Feature>,
}

impl Iterator for FeatureIterator {
    type Item = Feature;

    fn next(&mut self) -> Option<Self::Item> {
        self.features.next()
    }
}

/// Iterator yielding features in batches of at most `batch_size`.
///
/// A chunked alternative to collecting the whole table, bounding peak memory.
/// The underlying statement pages with `LIMIT`/`OFFSET`, so the sequence is
/// restartable by issuing the query again.
pub struct FeatureBatchIterator<'a> {
    pub(crate) stmt: rusqlite::Statement<'a>,
    pub(crate) has_geometry: bool,
    pub(crate) property_count: usize,
    pub(crate) fid_as_column: Option<usize>,
    pub(crate) property_index_by_name: Arc<HashMap<String, usize>>,
    pub(crate) batch_size: u32,
    pub(crate) offset: u32,
    pub(crate) end_or_invalid_state: bool,
    #[allow(dead_code)] // held for its Drop side effect
    pub(crate) guard: ReaderGuard,
}

impl<'a> Iterator for FeatureBatchIterator<'a> {
    type Item = Result<Vec<Feature>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.end_or_invalid_state {
            return None;
        }

        let result = self.stmt.query_map([self.offset], |row| {
            row_to_feature(
                row,
                self.has_geometry,
                self.property_count,
                self.fid_as_column,
                &self.property_index_by_name,
            )
        });

        let features = match result.and_then(|rows| rows.collect::<rusqlite::Result<Vec<_>>>()) {
            Ok(features) => features,
            Err(err) => {
                self.end_or_invalid_state = true;
                return Some(Err(err.into()));
            }
        };

        let result_size = features.len();
        if result_size < self.batch_size as usize {
            self.end_or_invalid_state = true;
            if features.is_empty() {
                return None;
            }
        }
        self.offset += result_size as u32;

        Some(Ok(features))
    }
}

/// Map a result row onto a `Feature`.
///
/// Row layout: geometry blob first (spatial tables only), then the feature
/// id, then the attribute columns in declaration order.
pub(crate) fn row_to_feature(
    row: &rusqlite::Row<'_>,
    has_geometry: bool,
    property_count: usize,
    fid_as_column: Option<usize>,
    property_index_by_name: &Arc<HashMap<String, usize>>,
) -> rusqlite::Result<Feature> {
    let offset = if has_geometry { 2 } else { 1 };
    let fid_idx = offset - 1;

    let geometry = if has_geometry {
        match row.get_ref(0)? {
            rusqlite::types::ValueRef::Null => None,
            rusqlite::types::ValueRef::Blob(blob) => {
                let header = codec::header_of(blob).map_err(|err| {
                    rusqlite::Error::FromSqlConversionFailure(0, Type::Blob, Box::new(err))
                })?;
                Some(blob[header.header_len..].to_vec())
            }
            other => {
                return Err(rusqlite::Error::InvalidColumnType(
                    0,
                    "geometry".to_string(),
                    other.data_type(),
                ));
            }
        }
    } else {
        None
    };

    let fid: i64 = row.get(fid_idx)?;

    // A column exposing the primary key is not selected separately; weave the
    // id back in at its position.
    let mut values = Vec::with_capacity(property_count);
    let mut cursor = offset;
    for idx in 0..property_count {
        if fid_as_column == Some(idx) {
            values.push(Value::Integer(fid));
        } else {
            let value_ref = row.get_ref(cursor)?;
            values.push(Value::try_from(value_ref).map_err(rusqlite::Error::from)?);
            cursor += 1;
        }
    }

    Ok(Feature {
        fid: Some(fid),
        geometry,
        values,
        property_index_by_name: Arc::clone(property_index_by_name),
    })
}

#[cfg(test)]
mod tests {
    use super::Feature;
    use geo_types::Point;
    use rusqlite::types::Value;

    #[test]
    fn builder_roundtrips_geometry() -> crate::Result<()> {
        let feature = Feature::new()
            .with_fid(7)
            .with_geometry(&Point::new(1.0, 2.0))?
            .with_values([Value::Text("alpha".to_string())]);

        assert_eq!(feature.fid(), Some(7));
        let wkb = feature.geometry()?.expect("geometry present");
        let mut expected = Vec::new();
        wkb::writer::write_geometry(&mut expected, &Point::new(1.0, 2.0), &Default::default())?;
        assert_eq!(wkb.buf(), expected.as_slice());
        assert_eq!(feature.values().len(), 1);
        Ok(())
    }

    #[test]
    fn property_by_name_requires_an_index() {
        let feature = Feature::new().with_values([Value::Integer(1)]);
        assert!(feature.property("v").is_none());
        assert!(feature.property_at(0).is_ok());
        assert!(feature.property_at(3).is_err());
    }
}
