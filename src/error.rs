use std::error::Error;
use std::fmt;

/// Crate error type for feature store operations.
#[derive(Debug)]
pub enum StoreError {
    /// Wraps errors returned by `rusqlite`.
    Sql(rusqlite::Error),
    /// Wraps errors returned by the `wkb` crate.
    Wkb(wkb::error::WkbError),
    /// Geometry blob header or payload is unreadable (bad magic, version,
    /// flags, or truncation).
    MalformedGeometryBlob(String),
    /// A bounding box was requested but could not be derived from the blob.
    NotComputable,
    /// Explicit feature id disagrees with the value of the field exposing the
    /// primary key as a regular column.
    InconsistentFid {
        fid: i64,
        field: i64,
    },
    /// Update or delete addressed a feature id that does not exist.
    NotFound {
        fid: i64,
    },
    /// Extent was requested for a table without any non-empty geometry.
    NoFeatures {
        table_name: String,
    },
    /// The requested column/table mutation cannot be performed.
    UnsupportedSchemaChange(String),
    /// A column or table rename collides with an existing name.
    DuplicateName(String),
    /// Post-rewrite referential integrity verification failed.
    IntegrityViolation(String),
    /// The underlying store rejected the change (unique/not-null/domain).
    ConstraintViolation(String),
    /// An encoded blob or header patch would exceed the available space.
    CapacityExceeded {
        required: usize,
        available: usize,
    },
    /// A geometry type name in metadata could not be mapped to a supported kind.
    UnsupportedGeometryType(String),
    /// A column type declared in SQLite metadata is not supported by this crate.
    UnsupportedColumnType {
        column: String,
        declared_type: String,
    },
    /// Invalid or mixed `z` / `m` dimension flags in the geometry columns catalog.
    InvalidDimension {
        z: i8,
        m: i8,
    },
    /// Property count did not match the table schema.
    InvalidPropertyCount {
        expected: usize,
        got: usize,
    },
    /// Referenced `srs_id` does not exist in `gpkg_spatial_ref_sys`.
    MissingSpatialRefSysId {
        srs_id: i32,
    },
    /// Table schema has multiple primary key columns, which is unsupported.
    CompositePrimaryKeyUnsupported {
        table_name: String,
    },
    /// Table schema has no integer primary key column.
    MissingPrimaryKeyColumn {
        table_name: String,
    },
    /// A feature table with the same name already exists.
    TableAlreadyExists {
        table_name: String,
    },
    /// The named table is not registered in the contents catalog.
    TableNotFound {
        table_name: String,
    },
    ReadOnly,
    Message(String),
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sql(err) => write!(f, "{err}"),
            Self::Wkb(err) => write!(f, "{err}"),
            Self::MalformedGeometryBlob(detail) => {
                write!(f, "malformed geometry blob: {detail}")
            }
            Self::NotComputable => write!(f, "bounding box is not computable from blob"),
            Self::InconsistentFid { fid, field } => write!(
                f,
                "inconsistent feature id: explicit id {fid}, id field {field}"
            ),
            Self::NotFound { fid } => write!(f, "no feature with id {fid}"),
            Self::NoFeatures { table_name } => {
                write!(f, "table '{table_name}' has no non-empty geometries")
            }
            Self::UnsupportedSchemaChange(detail) => {
                write!(f, "unsupported schema change: {detail}")
            }
            Self::DuplicateName(name) => write!(f, "name already in use: {name}"),
            Self::IntegrityViolation(detail) => {
                write!(f, "foreign key integrity violated: {detail}")
            }
            Self::ConstraintViolation(detail) => write!(f, "constraint violated: {detail}"),
            Self::CapacityExceeded {
                required,
                available,
            } => write!(
                f,
                "blob capacity exceeded: {required} bytes required, {available} available"
            ),
            Self::UnsupportedGeometryType(ty) => write!(f, "unsupported geometry type: {ty}"),
            Self::UnsupportedColumnType {
                column,
                declared_type,
            } => write!(
                f,
                "unsupported column type for column '{column}': {declared_type}"
            ),
            Self::InvalidDimension { z, m } => {
                write!(f, "invalid or mixed geometry dimension (z={z}, m={m})")
            }
            Self::InvalidPropertyCount { expected, got } => {
                write!(f, "invalid property count: expected {expected}, got {got}")
            }
            Self::MissingSpatialRefSysId { srs_id } => {
                write!(f, "srs_id {srs_id} not found in gpkg_spatial_ref_sys")
            }
            Self::CompositePrimaryKeyUnsupported { table_name } => write!(
                f,
                "composite primary keys are not supported for table: {table_name}"
            ),
            Self::MissingPrimaryKeyColumn { table_name } => {
                write!(f, "no primary key column found for table: {table_name}")
            }
            Self::TableAlreadyExists { table_name } => {
                write!(f, "table already exists: {table_name}")
            }
            Self::TableNotFound { table_name } => write!(f, "table not found: {table_name}"),
            Self::ReadOnly => write!(f, "operation not allowed on read-only connection"),
            Self::Message(message) => write!(f, "{message}"),
        }
    }
}

impl Error for StoreError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Sql(err) => Some(err),
            Self::Wkb(err) => Some(err),
            _ => None,
        }
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        // Surface unique/not-null/check failures as constraint violations so
        // callers can tell "the store rejected the change" apart from misuse.
        if let rusqlite::Error::SqliteFailure(code, ref message) = err
            && code.code == rusqlite::ErrorCode::ConstraintViolation
        {
            let detail = message
                .clone()
                .unwrap_or_else(|| "constraint failed".to_string());
            return Self::ConstraintViolation(detail);
        }
        Self::Sql(err)
    }
}

impl From<wkb::error::WkbError> for StoreError {
    fn from(err: wkb::error::WkbError) -> Self {
        Self::Wkb(err)
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;

#[cfg(test)]
mod tests {
    use super::StoreError;

    #[test]
    fn constraint_failures_map_to_constraint_violation() {
        let conn = rusqlite::Connection::open_in_memory().expect("open");
        conn.execute_batch("CREATE TABLE t (v INTEGER NOT NULL UNIQUE)")
            .expect("create");
        conn.execute("INSERT INTO t (v) VALUES (1)", []).expect("first");

        let err = conn
            .execute("INSERT INTO t (v) VALUES (1)", [])
            .expect_err("duplicate should fail");
        let err = StoreError::from(err);
        assert!(matches!(err, StoreError::ConstraintViolation(_)));
    }

    #[test]
    fn plain_sql_errors_stay_wrapped() {
        let conn = rusqlite::Connection::open_in_memory().expect("open");
        let err = conn
            .execute("SELECT * FROM missing_table", [])
            .expect_err("missing table");
        assert!(matches!(StoreError::from(err), StoreError::Sql(_)));
    }
}
