use crate::error::Result;
use crate::geom::codec;
use rusqlite::functions::{Context, FunctionFlags};
use rusqlite::types::{Type, ValueRef};
use rusqlite::{Connection, Error};

/// Register the spatial SQL helper functions in the provided connection.
///
/// The spatial index triggers reference these, so they must be registered on
/// every connection before any write to an indexed table.
pub fn register_spatial_functions(conn: &Connection) -> Result<()> {
    register_bounds_component(conn, "ST_MinX", |env| env.min_x)?;
    register_bounds_component(conn, "ST_MaxX", |env| env.max_x)?;
    register_bounds_component(conn, "ST_MinY", |env| env.min_y)?;
    register_bounds_component(conn, "ST_MaxY", |env| env.max_y)?;
    register_st_isempty(conn)?;
    Ok(())
}

fn register_st_isempty(conn: &Connection) -> Result<()> {
    conn.create_scalar_function(
        "ST_IsEmpty",
        1,
        FunctionFlags::SQLITE_DETERMINISTIC,
        |ctx| {
            let blob = match blob_from_ctx(ctx)? {
                Some(blob) => blob,
                None => return Ok(None),
            };
            let bounds = codec::bounding_box_of(blob)
                .map_err(|err| Error::UserFunctionError(Box::new(err)))?;
            Ok(Some(i64::from(bounds.is_none())))
        },
    )?;
    Ok(())
}

fn register_bounds_component<F>(conn: &Connection, name: &str, f: F) -> Result<()>
where
    F: Fn(&crate::geom::Envelope) -> f64 + Copy + Send + Sync + 'static,
{
    conn.create_scalar_function(name, 1, FunctionFlags::SQLITE_DETERMINISTIC, move |ctx| {
        let blob = match blob_from_ctx(ctx)? {
            Some(blob) => blob,
            None => return Ok(None),
        };
        let bounds = codec::bounding_box_of(blob)
            .map_err(|err| Error::UserFunctionError(Box::new(err)))?;
        Ok(bounds.map(|env| f(&env)))
    })?;
    Ok(())
}

fn blob_from_ctx<'a>(ctx: &'a Context<'a>) -> std::result::Result<Option<&'a [u8]>, Error> {
    match ctx.get_raw(0) {
        ValueRef::Null => Ok(None),
        ValueRef::Blob(blob) => Ok(Some(blob)),
        _ => Err(Error::InvalidFunctionParameterType(0, Type::Blob)),
    }
}

#[cfg(test)]
mod tests {
    use super::register_spatial_functions;
    use crate::geom::codec::{EncodeOptions, encode};
    use geo_types::{LineString, MultiPoint, Point, Polygon};
    use rusqlite::{Connection, params};

    fn blob_of<G: geo_traits::GeometryTrait<T = f64>>(geometry: &G) -> Vec<u8> {
        encode(geometry, 4326, &EncodeOptions::default()).expect("encode")
    }

    #[test]
    fn st_bounds_for_point() -> crate::Result<()> {
        let conn = Connection::open_in_memory()?;
        register_spatial_functions(&conn)?;

        let blob = blob_of(&Point::new(1.5, -2.0));
        let (minx, maxx, miny, maxy, empty): (f64, f64, f64, f64, i64) = conn.query_row(
            "SELECT ST_MinX(?1), ST_MaxX(?1), ST_MinY(?1), ST_MaxY(?1), ST_IsEmpty(?1)",
            params![blob],
            |row| {
                Ok((
                    row.get(0)?,
                    row.get(1)?,
                    row.get(2)?,
                    row.get(3)?,
                    row.get(4)?,
                ))
            },
        )?;

        assert_eq!((minx, maxx, miny, maxy), (1.5, 1.5, -2.0, -2.0));
        assert_eq!(empty, 0);
        Ok(())
    }

    #[test]
    fn st_bounds_for_multipoint() -> crate::Result<()> {
        let conn = Connection::open_in_memory()?;
        register_spatial_functions(&conn)?;

        let blob = blob_of(&MultiPoint::from(vec![
            Point::new(1.0, 5.0),
            Point::new(-2.0, 3.0),
        ]));
        let (minx, maxx, miny, maxy): (f64, f64, f64, f64) = conn.query_row(
            "SELECT ST_MinX(?1), ST_MaxX(?1), ST_MinY(?1), ST_MaxY(?1)",
            params![blob],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
        )?;

        assert_eq!((minx, maxx, miny, maxy), (-2.0, 1.0, 3.0, 5.0));
        Ok(())
    }

    #[test]
    fn st_is_empty_for_empty_polygon() -> crate::Result<()> {
        let conn = Connection::open_in_memory()?;
        register_spatial_functions(&conn)?;

        let empty: Polygon<f64> = Polygon::new(LineString::new(Vec::new()), Vec::new());
        let blob = blob_of(&empty);
        let (minx, is_empty): (Option<f64>, i64) =
            conn.query_row("SELECT ST_MinX(?1), ST_IsEmpty(?1)", params![blob], |row| {
                Ok((row.get(0)?, row.get(1)?))
            })?;

        assert!(minx.is_none());
        assert_eq!(is_empty, 1);
        Ok(())
    }

    #[test]
    fn null_input_yields_null() -> crate::Result<()> {
        let conn = Connection::open_in_memory()?;
        register_spatial_functions(&conn)?;

        let (minx, is_empty): (Option<f64>, Option<i64>) =
            conn.query_row("SELECT ST_MinX(NULL), ST_IsEmpty(NULL)", [], |row| {
                Ok((row.get(0)?, row.get(1)?))
            })?;
        assert!(minx.is_none());
        assert!(is_empty.is_none());
        Ok(())
    }
}
