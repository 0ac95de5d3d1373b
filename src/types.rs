/// Logical column types storable in a feature table.
///
/// These map onto the declared SQLite column types the GeoPackage container
/// allows for attribute columns. `Json` is stored as TEXT and marked through
/// the data-columns catalog.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ColumnType {
    Boolean,
    Int16,
    Int32,
    Int64,
    Float32,
    Float64,
    Text,
    Blob,
    Date,
    DateTime,
    Json,
}

/// Declaration of one attribute column.
#[derive(Clone, Debug, PartialEq)]
pub struct ColumnSpec {
    pub name: String,
    pub column_type: ColumnType,
    /// Maximum length for `Text`/`Blob` columns; ignored otherwise.
    pub width: Option<u32>,
    pub nullable: bool,
    pub unique: bool,
    /// SQL expression used as the column default.
    pub default_expr: Option<String>,
    /// Name of a registered column constraint (range/enum/glob domain).
    pub domain: Option<String>,
}

impl ColumnSpec {
    /// A nullable, non-unique column with no default and no domain.
    pub fn new(name: impl Into<String>, column_type: ColumnType) -> Self {
        Self {
            name: name.into(),
            column_type,
            width: None,
            nullable: true,
            unique: false,
            default_expr: None,
            domain: None,
        }
    }
}

/// Declared geometry type of a spatial table.
///
/// The first eight variants are the core types every reader understands. The
/// remaining ones require a per-table extension registration before use.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GeometryKind {
    /// Heterogeneous: any of the other kinds may be stored.
    Geometry,
    Point,
    LineString,
    Polygon,
    MultiPoint,
    MultiLineString,
    MultiPolygon,
    GeometryCollection,
    PolyhedralSurface,
    Tin,
    Triangle,
}

impl GeometryKind {
    /// Kinds beyond the core set must be registered in the extensions
    /// catalog once per table that uses them.
    pub fn requires_extension(self) -> bool {
        matches!(
            self,
            Self::PolyhedralSurface | Self::Tin | Self::Triangle
        )
    }
}

/// Coordinate dimensionality of a geometry column.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Dimension {
    Xy,
    Xyz,
    Xym,
    Xyzm,
}

impl Dimension {
    pub fn has_z(self) -> bool {
        matches!(self, Self::Xyz | Self::Xyzm)
    }

    pub fn has_m(self) -> bool {
        matches!(self, Self::Xym | Self::Xyzm)
    }
}

/// Declaration of the geometry column of a spatial table.
#[derive(Clone, Debug)]
pub struct GeometryColumnSpec {
    pub name: String,
    pub kind: GeometryKind,
    pub dimension: Dimension,
    pub srs_id: i32,
    pub nullable: bool,
}

impl GeometryColumnSpec {
    pub fn new(name: impl Into<String>, kind: GeometryKind, srs_id: i32) -> Self {
        Self {
            name: name.into(),
            kind,
            dimension: Dimension::Xy,
            srs_id,
            nullable: true,
        }
    }
}

/// Tuning knobs for one open store.
///
/// Passed explicitly at open/create time; there is no process-global
/// configuration.
#[derive(Clone, Copy, Debug)]
pub struct StoreOptions {
    /// Number of inserts within one transaction after which per-row index
    /// maintenance is replaced by an in-memory batch.
    pub deferred_index_threshold: u64,
    /// Maximum number of queued index entries before a forced intermediate
    /// flush, bounding peak memory.
    pub deferred_index_batch_cap: usize,
    /// Row chunk size used when (re)populating a spatial index over an
    /// existing table.
    pub index_population_chunk: usize,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            deferred_index_threshold: 100,
            deferred_index_batch_cap: 1_000_000,
            index_population_chunk: 500_000,
        }
    }
}
