use crate::catalog_sql::{
    SQL_GPKG_CONTENTS, SQL_GPKG_DATA_COLUMNS, SQL_GPKG_EXTENSIONS, SQL_GPKG_GEOMETRY_COLUMNS,
    SQL_GPKG_METADATA, SQL_GPKG_SPATIAL_REF_SYS, SQL_INSERT_CONTENTS,
    SQL_INSERT_GEOMETRY_COLUMNS, SQL_LIST_TABLES, SQL_OGR_CONTENTS,
    SQL_REGISTER_EXTENSION, SQL_SELECT_CONTENTS_EXTENT, SQL_SELECT_FEATURE_COUNT,
    SQL_SELECT_GEOMETRY_COLUMN_META, sql_create_table, sql_drop_rtree, sql_drop_table,
    sql_table_columns, sql_table_exists,
};
use crate::conversions::{
    column_type_from_decl, dimension_from_zm, dimension_to_zm, geometry_kind_from_str,
    geometry_kind_to_str,
};
use crate::error::{Result, StoreError};
use crate::geom::Envelope;
use crate::sql_functions::register_spatial_functions;
use crate::store::schema;
use crate::store::spatial_index;
use crate::store::table::{FeatureTable, TableState, persist_dirty};
use crate::txn::TxnCoordinator;
use crate::types::{ColumnSpec, ColumnType, GeometryColumnSpec, StoreOptions};
use rusqlite::{OpenFlags, OptionalExtension};
use std::cell::RefCell;
use std::collections::HashMap;
use std::path::Path;
use std::rc::Rc;
use std::sync::Arc;
use tracing::debug;

const FID_COLUMN: &str = "fid";

const GEOMETRY_TYPE_EXTENSION_DEFINITION: &str =
    "http://www.geopackage.org/spec120/#extension_geometry_types";

/// An open GeoPackage-backed feature store.
///
/// Owns the connection, the per-table state registry and the transaction
/// coordinator. All handles produced by [`FeatureStore::table`] share the
/// same per-table caches.
pub struct FeatureStore {
    conn: rusqlite::Connection,
    read_only: bool,
    options: StoreOptions,
    txn: TxnCoordinator,
    tables: RefCell<HashMap<String, Rc<RefCell<TableState>>>>,
}

impl FeatureStore {
    /// Open an existing store without write access.
    pub fn open_read_only<P: AsRef<Path>>(path: P) -> Result<Self> {
        let conn =
            rusqlite::Connection::open_with_flags(path, OpenFlags::SQLITE_OPEN_READ_ONLY)?;
        register_spatial_functions(&conn)?;
        Ok(Self::wrap(conn, true))
    }

    /// Open an existing store for read/write.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(StoreError::Message(format!(
                "store file does not exist: {}",
                path.display()
            )));
        }
        let conn = rusqlite::Connection::open(path)?;
        register_spatial_functions(&conn)?;
        Ok(Self::wrap(conn, false))
    }

    /// Create a new store file. Fails if the path already exists.
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if path.exists() {
            return Err(StoreError::Message(format!(
                "store file already exists: {}",
                path.display()
            )));
        }
        let conn = rusqlite::Connection::open(path)?;
        initialize_catalog(&conn)?;
        register_spatial_functions(&conn)?;
        Ok(Self::wrap(conn, false))
    }

    /// Create a transient in-memory store.
    pub fn create_in_memory() -> Result<Self> {
        let conn = rusqlite::Connection::open_in_memory()?;
        initialize_catalog(&conn)?;
        register_spatial_functions(&conn)?;
        Ok(Self::wrap(conn, false))
    }

    /// Replace the tuning options; meant to be chained right after opening.
    pub fn with_options(mut self, options: StoreOptions) -> Self {
        self.options = options;
        self
    }

    fn wrap(conn: rusqlite::Connection, read_only: bool) -> Self {
        Self {
            conn,
            read_only,
            options: StoreOptions::default(),
            txn: TxnCoordinator::new(),
            tables: RefCell::new(HashMap::new()),
        }
    }

    /// Register a spatial reference system in `gpkg_spatial_ref_sys`.
    ///
    /// The store seeds EPSG:4326 and the two undefined systems (-1, 0); any
    /// other srs must be registered before a table can reference it.
    pub fn register_srs(
        &self,
        srs_name: &str,
        srs_id: i32,
        organization: &str,
        organization_coordsys_id: i32,
        definition: &str,
        description: &str,
    ) -> Result<()> {
        self.ensure_writable()?;
        self.conn.execute(
            "INSERT INTO gpkg_spatial_ref_sys \
             (srs_name, srs_id, organization, organization_coordsys_id, definition, description) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            rusqlite::params![
                srs_name,
                srs_id,
                organization,
                organization_coordsys_id,
                definition,
                description
            ],
        )?;
        Ok(())
    }

    /// Names of the feature and attribute tables in the contents catalog.
    pub fn list_tables(&self) -> Result<Vec<String>> {
        let mut stmt = self.conn.prepare(SQL_LIST_TABLES)?;
        let names = stmt
            .query_map([], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?;
        Ok(names)
    }

    /// Open a handle onto an existing table.
    pub fn table(&self, name: &str) -> Result<FeatureTable<'_>> {
        if let Some(state) = self.tables.borrow().get(name) {
            return Ok(FeatureTable {
                store: self,
                state: Rc::clone(state),
            });
        }
        let mut loaded = self.load_table_state(name)?;
        if self.in_transaction() {
            // Nothing can have been written through this handle yet, so the
            // loaded caches are the pre-transaction state.
            loaded.take_snapshot();
        }
        let state = Rc::new(RefCell::new(loaded));
        self.tables
            .borrow_mut()
            .insert(name.to_string(), Rc::clone(&state));
        Ok(FeatureTable { store: self, state })
    }

    /// Create a feature table (spatial when `geometry` is given, otherwise
    /// attribute-only), register it in the catalogs and build its spatial
    /// index.
    pub fn create_table(
        &self,
        name: &str,
        geometry: Option<GeometryColumnSpec>,
        columns: &[ColumnSpec],
    ) -> Result<FeatureTable<'_>> {
        self.ensure_writable()?;

        let exists: i64 = self
            .conn
            .query_row(&sql_table_exists(name), [], |row| row.get(0))?;
        if exists != 0 {
            return Err(StoreError::TableAlreadyExists {
                table_name: name.to_string(),
            });
        }

        if let Some(geom) = &geometry
            && !self.srs_exists(geom.srs_id)?
        {
            return Err(StoreError::MissingSpatialRefSysId {
                srs_id: geom.srs_id,
            });
        }

        let mut fid_as_column = None;
        for (idx, spec) in columns.iter().enumerate() {
            let duplicate = columns[..idx].iter().any(|other| other.name == spec.name)
                || geometry.as_ref().is_some_and(|g| g.name == spec.name);
            if duplicate {
                return Err(StoreError::DuplicateName(spec.name.clone()));
            }
            if spec.name == FID_COLUMN {
                // The primary key doubles as a regular field.
                if spec.column_type != ColumnType::Int64 {
                    return Err(StoreError::DuplicateName(spec.name.clone()));
                }
                fid_as_column = Some(idx);
            }
        }

        let created_in_txn = self.in_transaction();
        let state = self.with_savepoint(|| {
            let defs = schema::table_column_defs(
                FID_COLUMN,
                geometry.as_ref(),
                columns,
                fid_as_column,
            );
            self.conn.execute_batch(&sql_create_table(name, &defs))?;

            let data_type = if geometry.is_some() { "features" } else { "attributes" };
            let srs_id = geometry.as_ref().map(|g| g.srs_id);
            self.conn.execute(
                SQL_INSERT_CONTENTS,
                rusqlite::params![name, data_type, srs_id],
            )?;

            if let Some(geom) = &geometry {
                let (z, m) = dimension_to_zm(geom.dimension);
                self.conn.execute(
                    SQL_INSERT_GEOMETRY_COLUMNS,
                    rusqlite::params![
                        name,
                        geom.name,
                        geometry_kind_to_str(geom.kind),
                        geom.srs_id,
                        z,
                        m
                    ],
                )?;
                if geom.kind.requires_extension() {
                    self.conn.execute(
                        SQL_REGISTER_EXTENSION,
                        rusqlite::params![
                            name,
                            geom.name,
                            format!("gpkg_geom_{}", geometry_kind_to_str(geom.kind)),
                            GEOMETRY_TYPE_EXTENSION_DEFINITION,
                            "read-write",
                        ],
                    )?;
                }
            }

            self.conn.execute(
                "INSERT INTO gpkg_ogr_contents (table_name, feature_count) VALUES (?1, 0)",
                [name],
            )?;

            for spec in columns {
                schema::sync_column_metadata(self, name, spec)?;
            }

            let mut state = TableState {
                name: name.to_string(),
                fid_column: FID_COLUMN.to_string(),
                geometry: geometry.clone(),
                columns: columns.to_vec(),
                fid_as_column,
                property_index_by_name: Arc::new(HashMap::new()),
                extent: None,
                extent_changed: false,
                feature_count: Some(0),
                content_changed: false,
                has_index: false,
                index: Default::default(),
                inserts_in_txn: 0,
                pending_index_drop: false,
                active_readers: 0,
                snapshot: None,
                created_in_txn,
            };
            state.rebuild_property_index();
            if state.geometry.is_some() {
                spatial_index::create_index(&self.conn, &self.options, &mut state)?;
            }
            Ok(state)
        })?;

        debug!(table = name, spatial = state.geometry.is_some(), "created feature table");
        let state = Rc::new(RefCell::new(state));
        self.tables
            .borrow_mut()
            .insert(name.to_string(), Rc::clone(&state));
        Ok(FeatureTable { store: self, state })
    }

    /// Drop a table and every catalog row referencing it.
    pub fn delete_table(&self, name: &str) -> Result<()> {
        self.ensure_writable()?;

        let geometry_column: Option<String> = self
            .conn
            .query_row(SQL_SELECT_GEOMETRY_COLUMN_META, [name], |row| row.get(0))
            .optional()?;
        let registered: i64 = self.conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM gpkg_contents WHERE table_name = ?1)",
            [name],
            |row| row.get(0),
        )?;
        if registered == 0 {
            return Err(StoreError::TableNotFound {
                table_name: name.to_string(),
            });
        }

        self.with_savepoint(|| {
            if let Some(geom) = &geometry_column {
                self.conn.execute_batch(&sql_drop_rtree(name, geom))?;
            }
            self.conn.execute(
                "DELETE FROM gpkg_extensions WHERE table_name = ?1",
                [name],
            )?;
            self.conn.execute(
                "DELETE FROM gpkg_geometry_columns WHERE table_name = ?1",
                [name],
            )?;
            self.conn.execute(
                "DELETE FROM gpkg_ogr_contents WHERE table_name = ?1",
                [name],
            )?;
            if self.has_side_table("gpkg_data_columns")? {
                self.conn.execute(
                    "DELETE FROM gpkg_data_columns WHERE table_name = ?1",
                    [name],
                )?;
            }
            if self.has_side_table("gpkg_metadata_reference")? {
                self.conn.execute(
                    "DELETE FROM gpkg_metadata_reference WHERE table_name = ?1",
                    [name],
                )?;
            }
            self.conn.execute(
                "DELETE FROM gpkg_contents WHERE table_name = ?1",
                [name],
            )?;
            self.conn.execute_batch(&sql_drop_table(name))?;
            Ok(())
        })?;

        self.tables.borrow_mut().remove(name);
        Ok(())
    }

    /// Attach a free-form metadata document to a table.
    pub fn add_table_metadata(
        &self,
        table_name: &str,
        standard_uri: &str,
        mime_type: &str,
        content: &str,
    ) -> Result<i64> {
        self.ensure_writable()?;
        self.ensure_metadata_tables()?;
        self.conn.execute(
            "INSERT INTO gpkg_metadata (md_scope, md_standard_uri, mime_type, metadata) \
             VALUES ('dataset', ?1, ?2, ?3)",
            rusqlite::params![standard_uri, mime_type, content],
        )?;
        let id = self.conn.last_insert_rowid();
        self.conn.execute(
            "INSERT INTO gpkg_metadata_reference (reference_scope, table_name, md_file_id) \
             VALUES ('table', ?1, ?2)",
            rusqlite::params![table_name, id],
        )?;
        Ok(id)
    }

    /// Metadata documents attached to a table.
    pub fn table_metadata(&self, table_name: &str) -> Result<Vec<String>> {
        if !self.has_side_table("gpkg_metadata_reference")? {
            return Ok(Vec::new());
        }
        let mut stmt = self.conn.prepare(
            "SELECT m.metadata FROM gpkg_metadata m \
             JOIN gpkg_metadata_reference r ON r.md_file_id = m.id \
             WHERE r.table_name = ?1 ORDER BY m.id",
        )?;
        let docs = stmt
            .query_map([table_name], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?;
        Ok(docs)
    }

    /// Open a transaction (nested calls become savepoints).
    ///
    /// At the outermost level every open table's cache state is snapshotted
    /// so a rollback can restore it.
    pub fn begin_transaction(&self) -> Result<()> {
        if !self.in_transaction() {
            for state in self.tables.borrow().values() {
                state.borrow_mut().take_snapshot();
            }
        }
        self.txn.soft_begin(&self.conn)
    }

    /// Commit. At the outermost level, pending work is finalized first in a
    /// fixed order: deferred spatial index batches, then dirty extent/count
    /// caches. Any failure rolls the whole transaction back.
    pub fn commit_transaction(&self) -> Result<()> {
        let outermost = self.txn.depth() == 1;
        if outermost
            && let Err(err) = self.run_commit_jobs()
        {
            let _ = self.rollback_transaction();
            return Err(err);
        }
        self.txn.soft_commit(&self.conn)?;
        if outermost {
            for state in self.tables.borrow().values() {
                state.borrow_mut().clear_snapshot();
            }
        }
        Ok(())
    }

    /// Roll back. Deferred in-memory batches are discarded (the aborted
    /// transaction also restores the dropped triggers) and all cache state
    /// returns to the snapshot taken at `begin_transaction`.
    pub fn rollback_transaction(&self) -> Result<()> {
        let outermost = self.txn.depth() == 1;
        self.txn.soft_rollback(&self.conn)?;
        if outermost {
            let mut tables = self.tables.borrow_mut();
            tables.retain(|_, state| {
                let mut state = state.borrow_mut();
                spatial_index::discard_deferred(&mut state);
                if state.created_in_txn {
                    return false;
                }
                state.restore_snapshot();
                true
            });
        }
        Ok(())
    }

    pub fn in_transaction(&self) -> bool {
        self.txn.in_transaction()
    }

    fn run_commit_jobs(&self) -> Result<()> {
        let states: Vec<Rc<RefCell<TableState>>> =
            self.tables.borrow().values().cloned().collect();
        for state in states {
            let mut state = state.borrow_mut();
            let state = &mut *state;
            spatial_index::flush_deferred(&self.conn, state)?;
            spatial_index::run_pending_drop(&self.conn, state)?;
            persist_dirty(&self.conn, state)?;
        }
        Ok(())
    }

    /// Run `f` atomically: inside a savepoint when a transaction is already
    /// open, inside its own transaction otherwise.
    pub(crate) fn with_savepoint<T>(&self, f: impl FnOnce() -> Result<T>) -> Result<T> {
        self.txn.soft_begin(&self.conn)?;
        match f() {
            Ok(value) => {
                self.txn.soft_commit(&self.conn)?;
                Ok(value)
            }
            Err(err) => {
                let _ = self.txn.soft_rollback(&self.conn);
                Err(err)
            }
        }
    }

    pub(crate) fn conn(&self) -> &rusqlite::Connection {
        &self.conn
    }

    pub(crate) fn options(&self) -> &StoreOptions {
        &self.options
    }

    pub(crate) fn ensure_writable(&self) -> Result<()> {
        if self.read_only {
            return Err(StoreError::ReadOnly);
        }
        Ok(())
    }

    pub(crate) fn rekey_table(&self, old_name: &str, new_name: &str) {
        let mut tables = self.tables.borrow_mut();
        if let Some(state) = tables.remove(old_name) {
            tables.insert(new_name.to_string(), state);
        }
    }

    pub(crate) fn has_side_table(&self, name: &str) -> Result<bool> {
        let exists: i64 = self.conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE name = ?1 AND type = 'table')",
            [name],
            |row| row.get(0),
        )?;
        Ok(exists != 0)
    }

    pub(crate) fn ensure_data_columns_tables(&self) -> Result<()> {
        if !self.has_side_table("gpkg_data_columns")? {
            self.conn.execute_batch(SQL_GPKG_DATA_COLUMNS)?;
        }
        Ok(())
    }

    pub(crate) fn ensure_metadata_tables(&self) -> Result<()> {
        if !self.has_side_table("gpkg_metadata")? {
            self.conn.execute_batch(SQL_GPKG_METADATA)?;
        }
        Ok(())
    }

    fn srs_exists(&self, srs_id: i32) -> Result<bool> {
        let exists: i64 = self.conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM gpkg_spatial_ref_sys WHERE srs_id = ?1)",
            [srs_id],
            |row| row.get(0),
        )?;
        Ok(exists != 0)
    }

    /// Read schema and caches for one table from the catalogs.
    fn load_table_state(&self, name: &str) -> Result<TableState> {
        let registered: i64 = self.conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM gpkg_contents WHERE table_name = ?1)",
            [name],
            |row| row.get(0),
        )?;
        if registered == 0 {
            return Err(StoreError::TableNotFound {
                table_name: name.to_string(),
            });
        }

        let geometry = self
            .conn
            .query_row(SQL_SELECT_GEOMETRY_COLUMN_META, [name], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, i8>(2)?,
                    row.get::<_, i8>(3)?,
                    row.get::<_, i32>(4)?,
                ))
            })
            .optional()?;
        let geometry = match geometry {
            Some((column_name, type_name, z, m, srs_id)) => Some(GeometryColumnSpec {
                name: column_name,
                kind: geometry_kind_from_str(&type_name)?,
                dimension: dimension_from_zm(z, m)?,
                srs_id,
                nullable: true,
            }),
            None => None,
        };

        let mut stmt = self.conn.prepare(&sql_table_columns(name))?;
        let raw_columns = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, i32>(2)?,
                    row.get::<_, i32>(3)?,
                    row.get::<_, Option<String>>(4)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        drop(stmt);

        let mut fid_column: Option<String> = None;
        let mut columns = Vec::new();
        for (column_name, declared_type, pk, notnull, default_expr) in raw_columns {
            if pk != 0 {
                if fid_column.is_some() {
                    return Err(StoreError::CompositePrimaryKeyUnsupported {
                        table_name: name.to_string(),
                    });
                }
                fid_column = Some(column_name);
                continue;
            }
            if geometry.as_ref().is_some_and(|g| g.name == column_name) {
                continue;
            }
            let (column_type, width) =
                column_type_from_decl(&declared_type).ok_or_else(|| {
                    StoreError::UnsupportedColumnType {
                        column: column_name.clone(),
                        declared_type,
                    }
                })?;
            columns.push(ColumnSpec {
                name: column_name,
                column_type,
                width,
                nullable: notnull == 0,
                unique: false,
                default_expr,
                domain: None,
            });
        }
        let fid_column = fid_column.ok_or_else(|| StoreError::MissingPrimaryKeyColumn {
            table_name: name.to_string(),
        })?;

        self.mark_unique_columns(name, &mut columns)?;
        self.apply_column_metadata(name, &mut columns)?;

        let mut state = TableState {
            name: name.to_string(),
            fid_column,
            geometry,
            columns,
            fid_as_column: None,
            property_index_by_name: Arc::new(HashMap::new()),
            extent: None,
            extent_changed: false,
            feature_count: None,
            content_changed: false,
            has_index: false,
            index: Default::default(),
            inserts_in_txn: 0,
            pending_index_drop: false,
            active_readers: 0,
            snapshot: None,
            created_in_txn: false,
        };
        state.rebuild_property_index();

        let extent: (Option<f64>, Option<f64>, Option<f64>, Option<f64>) =
            self.conn
                .query_row(SQL_SELECT_CONTENTS_EXTENT, [name], |row| {
                    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
                })?;
        if let (Some(min_x), Some(min_y), Some(max_x), Some(max_y)) = extent {
            state.extent = Some(Envelope::new(min_x, max_x, min_y, max_y));
        }

        state.feature_count = self
            .conn
            .query_row(SQL_SELECT_FEATURE_COUNT, [name], |row| row.get(0))
            .optional()?
            .flatten();

        if let Some(geom) = &state.geometry {
            state.has_index = spatial_index::rtree_exists(&self.conn, name, &geom.name)?;
        }
        Ok(state)
    }

    /// Flag columns covered by a single-column unique index.
    fn mark_unique_columns(&self, table: &str, columns: &mut [ColumnSpec]) -> Result<()> {
        let mut stmt = self.conn.prepare(
            "SELECT il.name FROM pragma_index_list(?1) il WHERE il.\"unique\" = 1 \
             AND il.origin IN ('u', 'c')",
        )?;
        let index_names = stmt
            .query_map([table], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?;
        drop(stmt);

        for index_name in index_names {
            let mut stmt = self
                .conn
                .prepare("SELECT name FROM pragma_index_info(?1)")?;
            let indexed = stmt
                .query_map([&index_name], |row| row.get::<_, Option<String>>(0))?
                .collect::<rusqlite::Result<Vec<Option<String>>>>()?;
            if let [Some(column_name)] = indexed.as_slice() {
                if let Some(spec) = columns.iter_mut().find(|c| &c.name == column_name) {
                    spec.unique = true;
                }
            }
        }
        Ok(())
    }

    /// Pull domain and JSON markers from `gpkg_data_columns`.
    fn apply_column_metadata(&self, table: &str, columns: &mut [ColumnSpec]) -> Result<()> {
        if !self.has_side_table("gpkg_data_columns")? {
            return Ok(());
        }
        let mut stmt = self.conn.prepare(
            "SELECT column_name, mime_type, constraint_name FROM gpkg_data_columns \
             WHERE table_name = ?1",
        )?;
        let rows = stmt
            .query_map([table], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, Option<String>>(1)?,
                    row.get::<_, Option<String>>(2)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        for (column_name, mime_type, constraint_name) in rows {
            if let Some(spec) = columns.iter_mut().find(|c| c.name == column_name) {
                spec.domain = constraint_name;
                if mime_type.as_deref() == Some("application/json") {
                    spec.column_type = ColumnType::Json;
                }
            }
        }
        Ok(())
    }
}

fn initialize_catalog(conn: &rusqlite::Connection) -> rusqlite::Result<()> {
    conn.execute_batch(SQL_GPKG_SPATIAL_REF_SYS)?;
    register_default_srs(conn)?;
    conn.execute_batch(SQL_GPKG_CONTENTS)?;
    conn.execute_batch(SQL_GPKG_GEOMETRY_COLUMNS)?;
    conn.execute_batch(SQL_GPKG_EXTENSIONS)?;
    conn.execute_batch(SQL_OGR_CONTENTS)?;
    Ok(())
}

fn register_default_srs(conn: &rusqlite::Connection) -> rusqlite::Result<()> {
    const EPSG4326_WKT: &str = r#"GEOGCS["WGS 84",DATUM["WGS_1984",SPHEROID["WGS 84",6378137,298.257223563,AUTHORITY["EPSG","7030"]],AUTHORITY["EPSG","6326"]],PRIMEM["Greenwich",0,AUTHORITY["EPSG","8901"]],UNIT["degree",0.0174532925199433,AUTHORITY["EPSG","9122"]],AXIS["Latitude",NORTH],AXIS["Longitude",EAST],AUTHORITY["EPSG","4326"]]"#;

    let sql = "INSERT INTO gpkg_spatial_ref_sys \
               (srs_name, srs_id, organization, organization_coordsys_id, definition, description) \
               VALUES (?1, ?2, ?3, ?4, ?5, ?6)";
    conn.execute(
        sql,
        rusqlite::params!["WGS 84", 4326, "EPSG", 4326, EPSG4326_WKT, "WGS 84"],
    )?;
    conn.execute(
        sql,
        rusqlite::params![
            "Undefined Cartesian SRS",
            -1,
            "NONE",
            -1,
            "undefined",
            "undefined Cartesian coordinate reference system"
        ],
    )?;
    conn.execute(
        sql,
        rusqlite::params![
            "Undefined geographic SRS",
            0,
            "NONE",
            0,
            "undefined",
            "undefined geographic coordinate reference system"
        ],
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::FeatureStore;
    use crate::error::StoreError;
    use crate::geom::Envelope;
    use crate::store::schema::ColumnChanges;
    use crate::store::{Feature, FeatureQuery};
    use crate::types::{ColumnSpec, ColumnType, GeometryColumnSpec, GeometryKind, StoreOptions};
    use geo_types::Point;
    use rusqlite::types::Value;

    fn bare_point_table(store: &FeatureStore, name: &str) -> crate::Result<()> {
        store.create_table(
            name,
            Some(GeometryColumnSpec::new("geom", GeometryKind::Point, 4326)),
            &[],
        )?;
        Ok(())
    }

    fn point(x: f64, y: f64) -> Feature {
        Feature::new()
            .with_geometry(&Point::new(x, y))
            .expect("encode point")
    }

    fn rtree_count(store: &FeatureStore, table: &str) -> i64 {
        store
            .conn()
            .query_row(
                &format!("SELECT COUNT(*) FROM rtree_{table}_geom"),
                [],
                |row| row.get(0),
            )
            .expect("rtree count")
    }

    fn trigger_count(store: &FeatureStore, table: &str) -> i64 {
        store
            .conn()
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'trigger' AND tbl_name = ?1",
                [table],
                |row| row.get(0),
            )
            .expect("trigger count")
    }

    fn small_threshold() -> StoreOptions {
        StoreOptions {
            deferred_index_threshold: 5,
            ..Default::default()
        }
    }

    #[test]
    fn bulk_inserts_defer_index_maintenance_until_commit() -> crate::Result<()> {
        let store = FeatureStore::create_in_memory()?.with_options(small_threshold());
        bare_point_table(&store, "pts")?;
        let table = store.table("pts")?;

        store.begin_transaction()?;
        for i in 0..8 {
            table.create(&point(i as f64, i as f64))?;
        }
        // Crossing the threshold dropped the triggers; rows past it queue in
        // memory.
        assert_eq!(trigger_count(&store, "pts"), 0);
        assert_eq!(rtree_count(&store, "pts"), 5);

        store.commit_transaction()?;
        assert_eq!(rtree_count(&store, "pts"), 8);
        assert_eq!(trigger_count(&store, "pts"), 6);
        assert_eq!(table.count(&FeatureQuery::default())?, 8);
        Ok(())
    }

    #[test]
    fn rollback_discards_rows_and_deferred_batch() -> crate::Result<()> {
        let store = FeatureStore::create_in_memory()?.with_options(small_threshold());
        bare_point_table(&store, "pts")?;
        let table = store.table("pts")?;
        table.create(&point(0.5, 0.5))?;

        store.begin_transaction()?;
        for i in 0..8 {
            table.create(&point(1.0 + i as f64, 1.0))?;
        }
        store.rollback_transaction()?;

        assert_eq!(table.count(&FeatureQuery::default())?, 1);
        assert_eq!(rtree_count(&store, "pts"), 1);
        assert_eq!(trigger_count(&store, "pts"), 6);

        // The cached extent reloaded from the catalog row.
        let extent = table.extent(false)?;
        assert_eq!(extent, Envelope::new(0.5, 0.5, 0.5, 0.5));
        Ok(())
    }

    #[test]
    fn update_during_deferred_mode_flushes_first() -> crate::Result<()> {
        let store = FeatureStore::create_in_memory()?.with_options(small_threshold());
        bare_point_table(&store, "pts")?;
        let table = store.table("pts")?;

        store.begin_transaction()?;
        let mut last = 0;
        for i in 0..7 {
            last = table.create(&point(i as f64, 0.0))?;
        }
        assert_eq!(trigger_count(&store, "pts"), 0);

        // The update needs live triggers, so the queued entries are applied
        // and the triggers reinstalled before it runs.
        let moved = {
            let mut f = point(100.0, 100.0);
            f.set_fid(last);
            f
        };
        table.update(&moved)?;
        assert_eq!(trigger_count(&store, "pts"), 6);
        store.commit_transaction()?;

        assert_eq!(rtree_count(&store, "pts"), 7);
        let (min_x, max_x): (f64, f64) = store.conn().query_row(
            "SELECT minx, maxx FROM rtree_pts_geom WHERE id = ?1",
            [last],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        assert_eq!((min_x, max_x), (100.0, 100.0));
        Ok(())
    }

    #[test]
    fn committed_index_entries_stay_within_cached_extent() -> crate::Result<()> {
        let store = FeatureStore::create_in_memory()?.with_options(small_threshold());
        bare_point_table(&store, "pts")?;
        let table = store.table("pts")?;

        store.begin_transaction()?;
        for i in 0..10 {
            table.create(&point(i as f64, (i % 4) as f64))?;
        }
        let moved = {
            let mut f = point(16.0, 2.0);
            f.set_fid(3);
            f
        };
        table.update(&moved)?;
        table.delete(5)?;
        store.commit_transaction()?;

        let extent = table.extent(false)?;
        let mut stmt = store
            .conn()
            .prepare("SELECT minx, maxx, miny, maxy FROM rtree_pts_geom")?;
        let rects = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, f64>(0)?,
                    row.get::<_, f64>(1)?,
                    row.get::<_, f64>(2)?,
                    row.get::<_, f64>(3)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        assert!(!rects.is_empty());
        for (min_x, max_x, min_y, max_y) in rects {
            assert!(extent.contains(&Envelope::new(min_x, max_x, min_y, max_y)));
        }
        Ok(())
    }

    #[test]
    fn commit_persists_extent_and_count() -> crate::Result<()> {
        let store = FeatureStore::create_in_memory()?;
        bare_point_table(&store, "pts")?;
        let table = store.table("pts")?;

        store.begin_transaction()?;
        table.create(&point(-3.0, 2.0))?;
        table.create(&point(4.0, 7.0))?;
        store.commit_transaction()?;

        let persisted: (f64, f64, f64, f64) = store.conn().query_row(
            "SELECT min_x, min_y, max_x, max_y FROM gpkg_contents WHERE table_name = 'pts'",
            [],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
        )?;
        assert_eq!(persisted, (-3.0, 2.0, 4.0, 7.0));

        let count: i64 = store.conn().query_row(
            "SELECT feature_count FROM gpkg_ogr_contents WHERE table_name = 'pts'",
            [],
            |row| row.get(0),
        )?;
        assert_eq!(count, 2);
        Ok(())
    }

    #[test]
    fn delete_then_readd_column_preserves_other_values() -> crate::Result<()> {
        let store = FeatureStore::create_in_memory()?;
        let table = store.create_table(
            "rows",
            Some(GeometryColumnSpec::new("geom", GeometryKind::Point, 4326)),
            &[
                ColumnSpec::new("a", ColumnType::Text),
                ColumnSpec::new("b", ColumnType::Int64),
                ColumnSpec::new("c", ColumnType::Float64),
            ],
        )?;
        for i in 0..4_i64 {
            let feature = Feature::new()
                .with_geometry(&Point::new(i as f64, 0.0))?
                .with_values([
                    Value::from(format!("row{i}")),
                    Value::from(i * 10),
                    Value::from(i as f64 / 2.0),
                ]);
            table.create(&feature)?;
        }

        table.delete_column(1)?;
        table.add_column(&ColumnSpec::new("b", ColumnType::Int64))?;

        for (i, feature) in table.features()?.enumerate() {
            let i = i as i64;
            assert_eq!(
                feature.property("a"),
                Some(&Value::Text(format!("row{i}")))
            );
            assert_eq!(
                feature.property("c"),
                Some(&Value::Real(i as f64 / 2.0))
            );
            assert_eq!(feature.property("b"), Some(&Value::Null));
        }
        Ok(())
    }

    #[test]
    fn add_unique_column_goes_through_rewrite_and_enforces() -> crate::Result<()> {
        let store = FeatureStore::create_in_memory()?;
        let table = store.create_table(
            "rows",
            None,
            &[ColumnSpec::new("a", ColumnType::Text)],
        )?;
        table.create(&Feature::new().with_values([Value::from("x".to_string())]))?;

        let mut unique_col = ColumnSpec::new("code", ColumnType::Int64);
        unique_col.unique = true;
        table.add_column(&unique_col)?;

        let ok = Feature::new().with_values([Value::from("y".to_string()), Value::from(1_i64)]);
        table.create(&ok)?;
        let duplicate =
            Feature::new().with_values([Value::from("z".to_string()), Value::from(1_i64)]);
        assert!(matches!(
            table.create(&duplicate),
            Err(StoreError::ConstraintViolation(_))
        ));
        Ok(())
    }

    #[test]
    fn alter_column_renames_and_retypes() -> crate::Result<()> {
        let store = FeatureStore::create_in_memory()?;
        let table = store.create_table(
            "rows",
            Some(GeometryColumnSpec::new("geom", GeometryKind::Point, 4326)),
            &[
                ColumnSpec::new("label", ColumnType::Text),
                ColumnSpec::new("rank", ColumnType::Int64),
            ],
        )?;
        let feature = Feature::new()
            .with_geometry(&Point::new(1.0, 1.0))?
            .with_values([Value::from("one".to_string()), Value::from(7_i64)]);
        table.create(&feature)?;

        // Pure rename takes the native ALTER path.
        table.alter_column(
            0,
            &ColumnChanges {
                name: Some("title".to_string()),
                ..Default::default()
            },
        )?;
        let feature = table.read(1)?.expect("row");
        assert_eq!(feature.property("title"), Some(&Value::Text("one".to_string())));

        // Retype rewrites the table; stored values follow the new affinity.
        table.alter_column(
            1,
            &ColumnChanges {
                column_type: Some(ColumnType::Text),
                ..Default::default()
            },
        )?;
        assert_eq!(table.columns()[1].column_type, ColumnType::Text);
        let feature = table.read(1)?.expect("row");
        assert_eq!(feature.property("rank"), Some(&Value::Text("7".to_string())));

        // The index survived both paths.
        let inserted = table.create(
            &Feature::new()
                .with_geometry(&Point::new(2.0, 2.0))?
                .with_values([Value::from("two".to_string()), Value::from("8".to_string())]),
        )?;
        assert_eq!(
            table.index_candidates(&Envelope::new(1.5, 2.5, 1.5, 2.5))?,
            vec![inserted]
        );
        Ok(())
    }

    #[test]
    fn rename_onto_existing_column_is_rejected() -> crate::Result<()> {
        let store = FeatureStore::create_in_memory()?;
        let table = store.create_table(
            "rows",
            None,
            &[
                ColumnSpec::new("a", ColumnType::Text),
                ColumnSpec::new("b", ColumnType::Text),
            ],
        )?;
        assert!(matches!(
            table.alter_column(
                0,
                &ColumnChanges {
                    name: Some("b".to_string()),
                    ..Default::default()
                },
            ),
            Err(StoreError::DuplicateName(_))
        ));
        Ok(())
    }

    #[test]
    fn reorder_columns_moves_values_with_names() -> crate::Result<()> {
        let store = FeatureStore::create_in_memory()?;
        let table = store.create_table(
            "rows",
            None,
            &[
                ColumnSpec::new("a", ColumnType::Text),
                ColumnSpec::new("b", ColumnType::Int64),
                ColumnSpec::new("c", ColumnType::Float64),
            ],
        )?;
        table.create(&Feature::new().with_values([
            Value::from("text".to_string()),
            Value::from(5_i64),
            Value::from(0.5),
        ]))?;

        table.reorder_columns(&[2, 0, 1])?;
        let names: Vec<String> = table.columns().iter().map(|c| c.name.clone()).collect();
        assert_eq!(names, vec!["c", "a", "b"]);

        let feature = table.read(1)?.expect("row");
        assert_eq!(feature.values()[0], Value::Real(0.5));
        assert_eq!(feature.values()[1], Value::Text("text".to_string()));
        assert_eq!(feature.values()[2], Value::Integer(5));

        assert!(matches!(
            table.reorder_columns(&[0, 0, 1]),
            Err(StoreError::UnsupportedSchemaChange(_))
        ));
        Ok(())
    }

    #[test]
    fn rename_table_cascades_catalogs_and_index() -> crate::Result<()> {
        let store = FeatureStore::create_in_memory()?;
        bare_point_table(&store, "roads")?;
        let table = store.table("roads")?;
        table.create(&point(1.0, 2.0))?;
        store.add_table_metadata("roads", "http://example.com", "text/plain", "doc")?;

        table.rename("streets")?;
        assert_eq!(table.name(), "streets");
        assert_eq!(store.list_tables()?, vec!["streets"]);

        for (sql, expected) in [
            ("SELECT COUNT(*) FROM gpkg_contents WHERE table_name = 'streets'", 1),
            ("SELECT COUNT(*) FROM gpkg_geometry_columns WHERE table_name = 'streets'", 1),
            ("SELECT COUNT(*) FROM gpkg_extensions WHERE table_name = 'streets'", 1),
            ("SELECT COUNT(*) FROM gpkg_ogr_contents WHERE table_name = 'streets'", 1),
            ("SELECT COUNT(*) FROM gpkg_metadata_reference WHERE table_name = 'streets'", 1),
            ("SELECT COUNT(*) FROM gpkg_contents WHERE table_name = 'roads'", 0),
            ("SELECT COUNT(*) FROM sqlite_master WHERE name = 'rtree_streets_geom'", 1),
            ("SELECT COUNT(*) FROM sqlite_master WHERE name = 'rtree_roads_geom'", 0),
        ] {
            let count: i64 = store.conn().query_row(sql, [], |row| row.get(0))?;
            assert_eq!(count, expected, "{sql}");
        }

        // Writes keep flowing through the renamed table and its new index.
        let fid = table.create(&point(3.0, 4.0))?;
        assert!(
            table
                .index_candidates(&Envelope::new(2.5, 3.5, 3.5, 4.5))?
                .contains(&fid)
        );

        // The old name is free for reuse; renaming onto a taken name is not.
        assert!(matches!(
            table.rename("streets"),
            Ok(())
        ));
        bare_point_table(&store, "roads")?;
        assert!(matches!(
            table.rename("roads"),
            Err(StoreError::DuplicateName(_))
        ));
        Ok(())
    }

    #[test]
    fn rename_rolls_back_on_integrity_violation() -> crate::Result<()> {
        let store = FeatureStore::create_in_memory()?;
        bare_point_table(&store, "roads")?;
        let table = store.table("roads")?;
        table.create(&point(0.0, 0.0))?;

        store.conn().execute_batch(
            "CREATE TABLE refs (id INTEGER PRIMARY KEY, \
             road_id INTEGER REFERENCES roads(fid));
             INSERT INTO refs (id, road_id) VALUES (1, 999);",
        )?;

        assert!(matches!(
            table.rename("streets"),
            Err(StoreError::IntegrityViolation(_))
        ));
        // Nothing moved.
        assert_eq!(table.name(), "roads");
        assert_eq!(store.list_tables()?, vec!["roads"]);
        let count: i64 = store.conn().query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE name = 'rtree_roads_geom'",
            [],
            |row| row.get(0),
        )?;
        assert_eq!(count, 1);
        Ok(())
    }

    #[test]
    fn delete_table_removes_all_catalog_rows() -> crate::Result<()> {
        let store = FeatureStore::create_in_memory()?;
        bare_point_table(&store, "pts")?;
        store.table("pts")?.create(&point(1.0, 1.0))?;

        store.delete_table("pts")?;
        for sql in [
            "SELECT COUNT(*) FROM gpkg_contents WHERE table_name = 'pts'",
            "SELECT COUNT(*) FROM gpkg_geometry_columns WHERE table_name = 'pts'",
            "SELECT COUNT(*) FROM gpkg_extensions WHERE table_name = 'pts'",
            "SELECT COUNT(*) FROM gpkg_ogr_contents WHERE table_name = 'pts'",
            "SELECT COUNT(*) FROM sqlite_master WHERE name IN ('pts', 'rtree_pts_geom')",
        ] {
            let count: i64 = store.conn().query_row(sql, [], |row| row.get(0))?;
            assert_eq!(count, 0, "{sql}");
        }
        assert!(matches!(
            store.delete_table("pts"),
            Err(StoreError::TableNotFound { .. })
        ));
        Ok(())
    }

    #[test]
    fn table_creation_guards() -> crate::Result<()> {
        let store = FeatureStore::create_in_memory()?;
        bare_point_table(&store, "pts")?;

        assert!(matches!(
            bare_point_table(&store, "pts"),
            Err(StoreError::TableAlreadyExists { .. })
        ));
        assert!(matches!(
            store.create_table(
                "orphan",
                Some(GeometryColumnSpec::new("geom", GeometryKind::Point, 9999)),
                &[],
            ),
            Err(StoreError::MissingSpatialRefSysId { srs_id: 9999 })
        ));
        assert!(matches!(
            store.create_table(
                "dup",
                None,
                &[
                    ColumnSpec::new("a", ColumnType::Text),
                    ColumnSpec::new("a", ColumnType::Text),
                ],
            ),
            Err(StoreError::DuplicateName(_))
        ));
        assert!(matches!(
            store.table("missing"),
            Err(StoreError::TableNotFound { .. })
        ));
        Ok(())
    }

    #[test]
    fn extended_geometry_kind_registers_extension() -> crate::Result<()> {
        let store = FeatureStore::create_in_memory()?;
        store.create_table(
            "surfaces",
            Some(GeometryColumnSpec::new("geom", GeometryKind::Tin, 4326)),
            &[],
        )?;
        let count: i64 = store.conn().query_row(
            "SELECT COUNT(*) FROM gpkg_extensions WHERE table_name = 'surfaces' \
             AND extension_name = 'gpkg_geom_TIN'",
            [],
            |row| row.get(0),
        )?;
        assert_eq!(count, 1);
        Ok(())
    }

    #[test]
    fn reopened_store_sees_persisted_state() -> crate::Result<()> {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("reopen.gpkg");

        {
            let store = FeatureStore::create(&path)?;
            bare_point_table(&store, "pts")?;
            let table = store.table("pts")?;
            table.create(&point(-1.0, -2.0))?;
            table.create(&point(3.0, 4.0))?;
            table.sync_to_disk()?;
            store.begin_transaction()?;
            store.commit_transaction()?;
        }

        let store = FeatureStore::open(&path)?;
        let table = store.table("pts")?;
        assert_eq!(table.count(&FeatureQuery::default())?, 2);
        assert_eq!(table.extent(false)?, Envelope::new(-1.0, 3.0, -2.0, 4.0));
        assert!(table.has_spatial_index());
        Ok(())
    }

    #[test]
    fn read_only_store_rejects_writes() -> crate::Result<()> {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("ro.gpkg");
        {
            let store = FeatureStore::create(&path)?;
            bare_point_table(&store, "pts")?;
        }

        let store = FeatureStore::open_read_only(&path)?;
        assert!(matches!(
            bare_point_table(&store, "other"),
            Err(StoreError::ReadOnly)
        ));
        let table = store.table("pts")?;
        assert!(matches!(
            table.create(&point(0.0, 0.0)),
            Err(StoreError::ReadOnly)
        ));
        assert!(matches!(
            store.delete_table("pts"),
            Err(StoreError::ReadOnly)
        ));
        Ok(())
    }

    #[test]
    fn create_guards_against_existing_and_missing_files() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("exists.gpkg");
        std::fs::write(&path, []).expect("touch file");

        assert!(matches!(
            FeatureStore::create(&path),
            Err(StoreError::Message(message)) if message.contains("already exists")
        ));
        assert!(matches!(
            FeatureStore::open(dir.path().join("missing.gpkg")),
            Err(StoreError::Message(message)) if message.contains("does not exist")
        ));
    }
}
