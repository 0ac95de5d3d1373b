use crate::catalog_sql::{
    SQL_TOUCH_CONTENTS, SQL_UPDATE_CONTENTS_EXTENT, SQL_UPSERT_FEATURE_COUNT, quote_ident,
    rtree_name, sql_delete_all, sql_insert_feature,
};
use crate::error::{Result, StoreError};
use crate::geom::codec::{self, EncodeOptions};
use crate::geom::{Envelope, bounds_of_geometry};
use crate::store::feature::{Feature, FeatureBatchIterator, FeatureIterator, row_to_feature};
use crate::store::schema::{self, ColumnChanges};
use crate::store::spatial_index::{self, IndexMaintenance};
use crate::store::store::FeatureStore;
use crate::types::{ColumnSpec, GeometryColumnSpec};
use rusqlite::OptionalExtension;
use rusqlite::params_from_iter;
use rusqlite::types::Value;
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::sync::Arc;
use tracing::debug;
use wkb::reader::Wkb;

/// Shared per-table state: schema, caches and index maintenance.
///
/// One instance exists per table within one open store, so every handle to
/// the same table observes the same caches.
#[derive(Debug)]
pub(crate) struct TableState {
    pub(crate) name: String,
    pub(crate) fid_column: String,
    pub(crate) geometry: Option<GeometryColumnSpec>,
    pub(crate) columns: Vec<ColumnSpec>,
    /// Index of the attribute column that exposes the primary key, if any.
    pub(crate) fid_as_column: Option<usize>,
    pub(crate) property_index_by_name: Arc<HashMap<String, usize>>,
    pub(crate) extent: Option<Envelope>,
    pub(crate) extent_changed: bool,
    /// `None` means unknown until the first count.
    pub(crate) feature_count: Option<i64>,
    pub(crate) content_changed: bool,
    pub(crate) has_index: bool,
    pub(crate) index: IndexMaintenance,
    pub(crate) inserts_in_txn: u64,
    pub(crate) pending_index_drop: bool,
    pub(crate) active_readers: u32,
    /// Cache state captured when the outermost transaction opened.
    pub(crate) snapshot: Option<CacheSnapshot>,
    /// Created inside the currently open transaction; a rollback forgets it.
    pub(crate) created_in_txn: bool,
}

/// The cache fields a rollback must restore to their pre-transaction state.
#[derive(Clone, Copy, Debug)]
pub(crate) struct CacheSnapshot {
    extent: Option<Envelope>,
    extent_changed: bool,
    feature_count: Option<i64>,
    content_changed: bool,
    has_index: bool,
}

impl TableState {
    pub(crate) fn rebuild_property_index(&mut self) {
        let mut map = HashMap::with_capacity(self.columns.len());
        for (idx, column) in self.columns.iter().enumerate() {
            map.insert(column.name.clone(), idx);
        }
        self.property_index_by_name = Arc::new(map);
    }

    pub(crate) fn take_snapshot(&mut self) {
        self.snapshot = Some(CacheSnapshot {
            extent: self.extent,
            extent_changed: self.extent_changed,
            feature_count: self.feature_count,
            content_changed: self.content_changed,
            has_index: self.has_index,
        });
    }

    pub(crate) fn restore_snapshot(&mut self) {
        if let Some(snapshot) = self.snapshot.take() {
            self.extent = snapshot.extent;
            self.extent_changed = snapshot.extent_changed;
            self.feature_count = snapshot.feature_count;
            self.content_changed = snapshot.content_changed;
            self.has_index = snapshot.has_index;
        }
        self.pending_index_drop = false;
    }

    pub(crate) fn clear_snapshot(&mut self) {
        self.snapshot = None;
        self.created_in_txn = false;
    }
}

/// Keeps `active_readers` in step with live lazy iterators, so structure
/// drops can be deferred past them.
pub(crate) struct ReaderGuard {
    state: Rc<RefCell<TableState>>,
}

impl ReaderGuard {
    pub(crate) fn new(state: Rc<RefCell<TableState>>) -> Self {
        state.borrow_mut().active_readers += 1;
        Self { state }
    }
}

impl Drop for ReaderGuard {
    fn drop(&mut self) {
        self.state.borrow_mut().active_readers -= 1;
    }
}

/// Attribute and/or spatial restriction for iteration and counting.
#[derive(Clone, Debug, Default)]
pub struct FeatureQuery {
    /// Opaque SQL boolean expression over the table's columns.
    pub attribute_filter: Option<String>,
    /// Envelope the feature's geometry must intersect.
    pub spatial_filter: Option<Envelope>,
}

impl FeatureQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_attribute_filter(mut self, expr: impl Into<String>) -> Self {
        self.attribute_filter = Some(expr.into());
        self
    }

    pub fn with_spatial_filter(mut self, envelope: Envelope) -> Self {
        self.spatial_filter = Some(envelope);
        self
    }
}

/// A feature table inside an open store.
pub struct FeatureTable<'a> {
    pub(crate) store: &'a FeatureStore,
    pub(crate) state: Rc<RefCell<TableState>>,
}

impl<'a> FeatureTable<'a> {
    pub fn name(&self) -> String {
        self.state.borrow().name.clone()
    }

    pub fn fid_column(&self) -> String {
        self.state.borrow().fid_column.clone()
    }

    pub fn geometry_column(&self) -> Option<GeometryColumnSpec> {
        self.state.borrow().geometry.clone()
    }

    pub fn columns(&self) -> Vec<ColumnSpec> {
        self.state.borrow().columns.clone()
    }

    pub fn is_spatial(&self) -> bool {
        self.state.borrow().geometry.is_some()
    }

    /// Insert a feature, returning its id.
    ///
    /// Ids are assigned by the store unless the feature carries one. When the
    /// table exposes the id as a regular field, a disagreeing explicit id
    /// fails with `InconsistentFid` and a set field value becomes the id.
    pub fn create(&self, feature: &Feature) -> Result<i64> {
        self.store.ensure_writable()?;
        let conn = self.store.conn();
        let mut state = self.state.borrow_mut();
        let state = &mut *state;
        spatial_index::run_pending_drop(conn, state)?;

        if feature.values.len() != state.columns.len() {
            return Err(StoreError::InvalidPropertyCount {
                expected: state.columns.len(),
                got: feature.values.len(),
            });
        }

        let mut fid = feature.fid;
        if let Some(idx) = state.fid_as_column
            && let Value::Integer(field) = feature.values[idx]
        {
            match fid {
                Some(explicit) if explicit != field => {
                    return Err(StoreError::InconsistentFid {
                        fid: explicit,
                        field,
                    });
                }
                _ => fid = Some(field),
            }
        }

        let (geom_param, env) = self.encode_geometry(state, feature)?;

        let mut columns = Vec::with_capacity(state.columns.len() + 2);
        let mut params: Vec<Value> = Vec::with_capacity(state.columns.len() + 2);
        if let Some(explicit) = fid {
            columns.push(quote_ident(&state.fid_column));
            params.push(Value::Integer(explicit));
        }
        if let Some(geom) = &state.geometry {
            columns.push(quote_ident(&geom.name));
            params.push(geom_param);
        }
        for (idx, column) in state.columns.iter().enumerate() {
            if state.fid_as_column == Some(idx) {
                continue;
            }
            columns.push(quote_ident(&column.name));
            params.push(feature.values[idx].clone());
        }

        let sql = if columns.is_empty() {
            format!("INSERT INTO {} DEFAULT VALUES", quote_ident(&state.name))
        } else {
            let placeholders = (1..=columns.len())
                .map(|i| format!("?{i}"))
                .collect::<Vec<String>>()
                .join(",");
            sql_insert_feature(&state.name, &columns.join(","), &placeholders)
        };
        let mut stmt = conn.prepare_cached(&sql)?;
        stmt.execute(params_from_iter(params))?;
        let fid = fid.unwrap_or_else(|| conn.last_insert_rowid());

        if let Some(env) = env {
            match &mut state.extent {
                Some(extent) => extent.union(&env),
                None => state.extent = Some(env),
            }
            state.extent_changed = true;
            spatial_index::record_insert(
                conn,
                self.store.options(),
                self.store.in_transaction(),
                state,
                fid,
                &env,
            )?;
        }
        if let Some(count) = &mut state.feature_count {
            *count += 1;
        }
        state.content_changed = true;
        Ok(fid)
    }

    /// Replace the feature with the given id (full field replace).
    pub fn update(&self, feature: &Feature) -> Result<()> {
        self.store.ensure_writable()?;
        let fid = feature
            .fid
            .ok_or_else(|| StoreError::Message("feature id required for update".to_string()))?;
        let conn = self.store.conn();
        let mut state = self.state.borrow_mut();
        let state = &mut *state;
        // Triggers must be live again so the index tracks the update.
        spatial_index::flush_deferred(conn, state)?;
        spatial_index::run_pending_drop(conn, state)?;

        if feature.values.len() != state.columns.len() {
            return Err(StoreError::InvalidPropertyCount {
                expected: state.columns.len(),
                got: feature.values.len(),
            });
        }
        if let Some(idx) = state.fid_as_column
            && let Value::Integer(field) = feature.values[idx]
            && field != fid
        {
            return Err(StoreError::InconsistentFid { fid, field });
        }

        let (geom_param, env) = self.encode_geometry(state, feature)?;

        let mut assignments = Vec::with_capacity(state.columns.len() + 1);
        let mut params: Vec<Value> = Vec::with_capacity(state.columns.len() + 2);
        if let Some(geom) = &state.geometry {
            params.push(geom_param);
            assignments.push(format!("{} = ?{}", quote_ident(&geom.name), params.len()));
        }
        for (idx, column) in state.columns.iter().enumerate() {
            if state.fid_as_column == Some(idx) {
                continue;
            }
            params.push(feature.values[idx].clone());
            assignments.push(format!("{} = ?{}", quote_ident(&column.name), params.len()));
        }
        if assignments.is_empty() {
            // Nothing to set; existence check only.
            let exists: i64 = conn.query_row(
                &format!(
                    "SELECT EXISTS(SELECT 1 FROM {} WHERE {} = ?1)",
                    quote_ident(&state.name),
                    quote_ident(&state.fid_column)
                ),
                [fid],
                |row| row.get(0),
            )?;
            if exists == 0 {
                return Err(StoreError::NotFound { fid });
            }
            return Ok(());
        }

        params.push(Value::Integer(fid));
        let sql = format!(
            "UPDATE {} SET {} WHERE {} = ?{}",
            quote_ident(&state.name),
            assignments.join(", "),
            quote_ident(&state.fid_column),
            params.len()
        );
        let mut stmt = conn.prepare_cached(&sql)?;
        let changed = stmt.execute(params_from_iter(params))?;
        if changed == 0 {
            return Err(StoreError::NotFound { fid });
        }

        if let Some(env) = env {
            // Union only; shrinking the cached extent needs an explicit
            // recompute.
            match &mut state.extent {
                Some(extent) => extent.union(&env),
                None => state.extent = Some(env),
            }
            state.extent_changed = true;
        }
        state.content_changed = true;
        Ok(())
    }

    /// Delete the feature with the given id.
    pub fn delete(&self, fid: i64) -> Result<()> {
        self.store.ensure_writable()?;
        let conn = self.store.conn();
        let mut state = self.state.borrow_mut();
        let state = &mut *state;
        spatial_index::flush_deferred(conn, state)?;
        spatial_index::run_pending_drop(conn, state)?;

        let sql = format!(
            "DELETE FROM {} WHERE {} = ?1",
            quote_ident(&state.name),
            quote_ident(&state.fid_column)
        );
        let changed = conn.execute(&sql, [fid])?;
        if changed == 0 {
            return Err(StoreError::NotFound { fid });
        }
        if let Some(count) = &mut state.feature_count {
            *count -= 1;
        }
        state.content_changed = true;
        Ok(())
    }

    /// Fetch one feature by id.
    pub fn read(&self, fid: i64) -> Result<Option<Feature>> {
        let conn = self.store.conn();
        let mut state = self.state.borrow_mut();
        let state = &mut *state;
        spatial_index::run_pending_drop(conn, state)?;

        let sql = format!(
            "{} WHERE {} = ?1",
            select_clause(state),
            quote_ident(&state.fid_column)
        );
        let total = total_property_count(state);
        let has_geometry = state.geometry.is_some();
        let fid_as_column = state.fid_as_column;
        let index = Arc::clone(&state.property_index_by_name);

        let mut stmt = conn.prepare_cached(&sql)?;
        let feature = stmt
            .query_row([fid], |row| {
                row_to_feature(row, has_geometry, total, fid_as_column, &index)
            })
            .optional()?;
        Ok(feature)
    }

    /// All features, in id order.
    pub fn features(&self) -> Result<FeatureIterator> {
        self.query(&FeatureQuery::default())
    }

    /// Features in id order, restricted by the query's filters.
    ///
    /// With a usable index and a spatial filter that does not already cover
    /// the cached extent, candidates come from the index; the exact envelope
    /// test always applies on top.
    pub fn query(&self, query: &FeatureQuery) -> Result<FeatureIterator> {
        let conn = self.store.conn();
        let mut state = self.state.borrow_mut();
        {
            let state = &mut *state;
            // Index candidates are only trustworthy once queued work is applied.
            spatial_index::flush_deferred(conn, state)?;
            spatial_index::run_pending_drop(conn, state)?;
        }
        let state = &*state;

        let sql = format!(
            "{}{} ORDER BY {}",
            select_clause(state),
            where_clause(state, query)
                .map(|w| format!(" WHERE {w}"))
                .unwrap_or_default(),
            quote_ident(&state.fid_column)
        );
        let total = total_property_count(state);
        let has_geometry = state.geometry.is_some();
        let fid_as_column = state.fid_as_column;
        let index = Arc::clone(&state.property_index_by_name);

        let mut stmt = conn.prepare(&sql)?;
        let features = stmt
            .query_map([], |row| {
                row_to_feature(row, has_geometry, total, fid_as_column, &index)
            })?
            .collect::<rusqlite::Result<Vec<Feature>>>()?;

        Ok(FeatureIterator {
            features: features.into_iter(),
        })
    }

    /// Like `query`, but yielding features in batches of at most
    /// `batch_size`, keeping peak memory bounded.
    pub fn query_batch(
        &self,
        query: &FeatureQuery,
        batch_size: u32,
    ) -> Result<FeatureBatchIterator<'a>> {
        let conn = self.store.conn();
        // The borrow must end before the reader guard takes its own.
        let (sql, has_geometry, property_count, fid_as_column, property_index_by_name) = {
            let mut state = self.state.borrow_mut();
            let state = &mut *state;
            spatial_index::flush_deferred(conn, state)?;
            spatial_index::run_pending_drop(conn, state)?;

            let sql = format!(
                "{}{} ORDER BY {} LIMIT {} OFFSET ?1",
                select_clause(state),
                where_clause(state, query)
                    .map(|w| format!(" WHERE {w}"))
                    .unwrap_or_default(),
                quote_ident(&state.fid_column),
                batch_size
            );
            (
                sql,
                state.geometry.is_some(),
                total_property_count(state),
                state.fid_as_column,
                Arc::clone(&state.property_index_by_name),
            )
        };

        let stmt = conn.prepare(&sql)?;
        let iterator = FeatureBatchIterator {
            stmt,
            has_geometry,
            property_count,
            fid_as_column,
            property_index_by_name,
            batch_size,
            offset: 0,
            end_or_invalid_state: false,
            guard: ReaderGuard::new(Rc::clone(&self.state)),
        };
        Ok(iterator)
    }

    /// All features in batches; shorthand for an unfiltered `query_batch`.
    pub fn features_batch(&self, batch_size: u32) -> Result<FeatureBatchIterator<'a>> {
        self.query_batch(&FeatureQuery::default(), batch_size)
    }

    /// Number of features matching the query.
    ///
    /// Unfiltered counts come from the maintained counter; filters fall back
    /// to a scan.
    pub fn count(&self, query: &FeatureQuery) -> Result<i64> {
        let conn = self.store.conn();
        let mut state = self.state.borrow_mut();
        let state = &mut *state;

        if query.attribute_filter.is_none() && query.spatial_filter.is_none() {
            if let Some(count) = state.feature_count {
                return Ok(count);
            }
            let count: i64 = conn.query_row(
                &format!("SELECT COUNT(*) FROM {}", quote_ident(&state.name)),
                [],
                |row| row.get(0),
            )?;
            state.feature_count = Some(count);
            return Ok(count);
        }

        spatial_index::flush_deferred(conn, state)?;
        let sql = format!(
            "SELECT COUNT(*) FROM {}{}",
            quote_ident(&state.name),
            where_clause(state, query)
                .map(|w| format!(" WHERE {w}"))
                .unwrap_or_default()
        );
        Ok(conn.query_row(&sql, [], |row| row.get(0))?)
    }

    /// Bounding box over all non-empty geometries.
    ///
    /// Returns the cached value unless `force_recompute`; recomputation uses
    /// the index's sorted structure when available, falls back to a full
    /// scan otherwise, and persists the (possibly narrower) result.
    pub fn extent(&self, force_recompute: bool) -> Result<Envelope> {
        let conn = self.store.conn();
        let mut state = self.state.borrow_mut();
        let state = &mut *state;

        let Some(geom) = state.geometry.clone() else {
            return Err(StoreError::NoFeatures {
                table_name: state.name.clone(),
            });
        };
        if !force_recompute && let Some(extent) = state.extent {
            return Ok(extent);
        }

        spatial_index::flush_deferred(conn, state)?;
        spatial_index::run_pending_drop(conn, state)?;

        let computed = if state.has_index {
            spatial_index::extent_from_rtree(conn, &rtree_name(&state.name, &geom.name))?
        } else {
            full_scan_extent(conn, &state.name, &geom.name)?
        };

        match computed {
            Some(extent) => {
                state.extent = Some(extent);
                persist_extent(conn, state)?;
                Ok(extent)
            }
            None => {
                state.extent = None;
                persist_extent(conn, state)?;
                Err(StoreError::NoFeatures {
                    table_name: state.name.clone(),
                })
            }
        }
    }

    /// Remove all rows; resets the counter and clears the persisted extent.
    pub fn truncate(&self) -> Result<usize> {
        self.store.ensure_writable()?;
        let conn = self.store.conn();
        let mut state = self.state.borrow_mut();
        let state = &mut *state;
        spatial_index::flush_deferred(conn, state)?;
        spatial_index::run_pending_drop(conn, state)?;

        let deleted = conn.execute(&sql_delete_all(&state.name), [])?;
        state.feature_count = Some(0);
        state.extent = None;
        persist_extent(conn, state)?;
        state.content_changed = true;
        debug!(table = %state.name, deleted, "truncated feature table");
        Ok(deleted)
    }

    /// Build (and populate) the spatial index. Returns false when one exists.
    pub fn create_spatial_index(&self) -> Result<bool> {
        self.store.ensure_writable()?;
        let mut state = self.state.borrow_mut();
        spatial_index::create_index(self.store.conn(), self.store.options(), &mut state)
    }

    /// Remove the spatial index. Returns false when none exists.
    pub fn drop_spatial_index(&self) -> Result<bool> {
        self.store.ensure_writable()?;
        let mut state = self.state.borrow_mut();
        spatial_index::drop_index(self.store.conn(), &mut state)
    }

    pub fn has_spatial_index(&self) -> bool {
        self.state.borrow().has_index
    }

    /// Candidate ids from the index for an envelope; approximate, the exact
    /// geometry predicate still applies.
    pub fn index_candidates(&self, envelope: &Envelope) -> Result<Vec<i64>> {
        let mut state = self.state.borrow_mut();
        let state = &mut *state;
        spatial_index::flush_deferred(self.store.conn(), state)?;
        let geom = state.geometry.as_ref().ok_or_else(|| {
            StoreError::Message(format!("table '{}' has no geometry column", state.name))
        })?;
        spatial_index::query_candidates(self.store.conn(), &state.name, &geom.name, envelope)
    }

    /// Append a column.
    pub fn add_column(&self, spec: &ColumnSpec) -> Result<()> {
        self.store.ensure_writable()?;
        schema::add_column(self.store, &mut self.state.borrow_mut(), spec)
    }

    /// Drop the column at `idx`.
    pub fn delete_column(&self, idx: usize) -> Result<()> {
        self.store.ensure_writable()?;
        schema::delete_column(self.store, &mut self.state.borrow_mut(), idx)
    }

    /// Change name/type/constraints of the column at `idx`.
    pub fn alter_column(&self, idx: usize, changes: &ColumnChanges) -> Result<()> {
        self.store.ensure_writable()?;
        schema::alter_column(self.store, &mut self.state.borrow_mut(), idx, changes)
    }

    /// Reorder the attribute columns; `permutation[new_pos] = old_pos`.
    pub fn reorder_columns(&self, permutation: &[usize]) -> Result<()> {
        self.store.ensure_writable()?;
        schema::reorder_columns(self.store, &mut self.state.borrow_mut(), permutation)
    }

    /// Rename the table, cascading through catalogs and the spatial index.
    pub fn rename(&self, new_name: &str) -> Result<()> {
        self.store.ensure_writable()?;
        let old_name = self.state.borrow().name.clone();
        schema::rename_table(self.store, &mut self.state.borrow_mut(), new_name)?;
        self.store.rekey_table(&old_name, new_name);
        Ok(())
    }

    /// Persist dirty caches (extent, counter, content timestamp).
    pub fn sync_to_disk(&self) -> Result<()> {
        let conn = self.store.conn();
        let mut state = self.state.borrow_mut();
        let state = &mut *state;
        spatial_index::run_pending_drop(conn, state)?;
        persist_dirty(conn, state)
    }

    fn encode_geometry(
        &self,
        state: &TableState,
        feature: &Feature,
    ) -> Result<(Value, Option<Envelope>)> {
        match (&state.geometry, feature.geometry_wkb()) {
            (Some(geom), Some(payload)) => {
                let wkb = Wkb::try_new(payload)?;
                let env = bounds_of_geometry(&wkb);
                let blob = codec::encode(&wkb, geom.srs_id, &EncodeOptions::default())?;
                Ok((Value::Blob(blob), env))
            }
            (Some(_), None) => Ok((Value::Null, None)),
            (None, Some(_)) => Err(StoreError::Message(format!(
                "table '{}' has no geometry column",
                state.name
            ))),
            (None, None) => Ok((Value::Null, None)),
        }
    }
}

/// Total property count, the exposed id column included; `row_to_feature`
/// weaves the id back in at its position.
fn total_property_count(state: &TableState) -> usize {
    state.columns.len()
}

fn select_clause(state: &TableState) -> String {
    let mut columns = Vec::with_capacity(state.columns.len() + 2);
    if let Some(geom) = &state.geometry {
        columns.push(quote_ident(&geom.name));
    }
    columns.push(quote_ident(&state.fid_column));
    for (idx, column) in state.columns.iter().enumerate() {
        if state.fid_as_column == Some(idx) {
            continue;
        }
        columns.push(quote_ident(&column.name));
    }
    format!(
        "SELECT {} FROM {}",
        columns.join(", "),
        quote_ident(&state.name)
    )
}

/// SQL literal for a coordinate; non-finite values degrade to the widest
/// representable literal so a filter never produces invalid SQL.
fn sql_f64(value: f64) -> String {
    if value.is_nan() {
        "0".to_string()
    } else if value == f64::INFINITY {
        "9e999".to_string()
    } else if value == f64::NEG_INFINITY {
        "-9e999".to_string()
    } else {
        format!("{value:?}")
    }
}

fn where_clause(state: &TableState, query: &FeatureQuery) -> Option<String> {
    let mut clauses = Vec::new();

    if let (Some(geom), Some(env)) = (&state.geometry, &query.spatial_filter) {
        let g = quote_ident(&geom.name);
        // Exact per-row envelope test against the geometry itself.
        clauses.push(format!(
            "({g} NOT NULL AND NOT ST_IsEmpty({g}) \
             AND ST_MaxX({g}) >= {min_x} AND ST_MinX({g}) <= {max_x} \
             AND ST_MaxY({g}) >= {min_y} AND ST_MinY({g}) <= {max_y})",
            min_x = sql_f64(env.min_x),
            max_x = sql_f64(env.max_x),
            min_y = sql_f64(env.min_y),
            max_y = sql_f64(env.max_y),
        ));

        // When the filter already covers everything the index lookup is pure
        // overhead; when it does not, pre-restrict through the index.
        let covers_everything = state
            .extent
            .is_some_and(|cached| env.contains(&cached));
        if state.has_index && !covers_everything {
            clauses.push(format!(
                "{fid} IN (SELECT id FROM {rtree} \
                 WHERE maxx >= {min_x} AND minx <= {max_x} \
                 AND maxy >= {min_y} AND miny <= {max_y})",
                fid = quote_ident(&state.fid_column),
                rtree = quote_ident(&rtree_name(&state.name, &geom.name)),
                min_x = sql_f64(env.min_x),
                max_x = sql_f64(env.max_x),
                min_y = sql_f64(env.min_y),
                max_y = sql_f64(env.max_y),
            ));
        }
    }

    if let Some(expr) = &query.attribute_filter {
        clauses.push(format!("({expr})"));
    }

    if clauses.is_empty() {
        None
    } else {
        Some(clauses.join(" AND "))
    }
}

fn full_scan_extent(
    conn: &rusqlite::Connection,
    table: &str,
    geom_column: &str,
) -> Result<Option<Envelope>> {
    let g = quote_ident(geom_column);
    let sql = format!(
        "SELECT MIN(ST_MinX({g})), MAX(ST_MaxX({g})), MIN(ST_MinY({g})), MAX(ST_MaxY({g})) \
         FROM {} WHERE {g} NOT NULL AND NOT ST_IsEmpty({g})",
        quote_ident(table)
    );
    let bounds: (Option<f64>, Option<f64>, Option<f64>, Option<f64>) =
        conn.query_row(&sql, [], |row| {
            Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
        })?;
    match bounds {
        (Some(min_x), Some(max_x), Some(min_y), Some(max_y)) => {
            Ok(Some(Envelope::new(min_x, max_x, min_y, max_y)))
        }
        _ => Ok(None),
    }
}

fn persist_extent(conn: &rusqlite::Connection, state: &mut TableState) -> Result<()> {
    let (min_x, min_y, max_x, max_y) = match &state.extent {
        Some(env) => (
            Some(env.min_x),
            Some(env.min_y),
            Some(env.max_x),
            Some(env.max_y),
        ),
        None => (None, None, None, None),
    };
    conn.execute(
        SQL_UPDATE_CONTENTS_EXTENT,
        rusqlite::params![state.name, min_x, min_y, max_x, max_y],
    )?;
    state.extent_changed = false;
    Ok(())
}

/// Persist whatever is dirty: extent, counter, content timestamp.
pub(crate) fn persist_dirty(conn: &rusqlite::Connection, state: &mut TableState) -> Result<()> {
    if state.extent_changed {
        persist_extent(conn, state)?;
    }
    if state.content_changed {
        if let Some(count) = state.feature_count {
            conn.execute(
                SQL_UPSERT_FEATURE_COUNT,
                rusqlite::params![state.name, count],
            )?;
        }
        conn.execute(SQL_TOUCH_CONTENTS, [&state.name])?;
        state.content_changed = false;
    }
    Ok(())
}


#[cfg(test)]
mod tests {
    use super::{FeatureQuery, FeatureTable};
    use crate::error::StoreError;
    use crate::geom::Envelope;
    use crate::store::Feature;
    use crate::store::store::FeatureStore;
    use crate::types::{ColumnSpec, ColumnType, GeometryColumnSpec, GeometryKind};
    use geo_types::{LineString, Point, Polygon};
    use rusqlite::types::Value;

    fn point_table<'a>(store: &'a FeatureStore, name: &str) -> FeatureTable<'a> {
        store
            .create_table(
                name,
                Some(GeometryColumnSpec::new("geom", GeometryKind::Point, 4326)),
                &[
                    ColumnSpec::new("name", ColumnType::Text),
                    ColumnSpec::new("rank", ColumnType::Int64),
                ],
            )
            .expect("create table")
    }

    fn point_feature(x: f64, y: f64, name: &str, rank: i64) -> Feature {
        Feature::new()
            .with_geometry(&Point::new(x, y))
            .expect("encode point")
            .with_values([Value::from(name.to_string()), Value::from(rank)])
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

    #[test]
    fn creates_and_reads_back() -> crate::Result<()> {
        let store = FeatureStore::create_in_memory()?;
        let table = point_table(&store, "points");

        let fid_a = table.create(&point_feature(1.0, 2.0, "alpha", 7))?;
        let fid_b = table.create(&point_feature(3.0, 4.0, "beta", 9))?;
        assert_eq!(fid_a, 1);
        assert_eq!(fid_b, 2);

        let feature = table.read(fid_a)?.expect("feature exists");
        assert_eq!(feature.fid(), Some(fid_a));
        assert_eq!(feature.property("name"), Some(&Value::Text("alpha".to_string())));
        assert_eq!(feature.property("rank"), Some(&Value::Integer(7)));

        let mut expected = Vec::new();
        wkb::writer::write_geometry(&mut expected, &Point::new(1.0, 2.0), &Default::default())?;
        assert_eq!(feature.geometry()?.expect("geometry").buf(), expected.as_slice());

        assert!(table.read(99)?.is_none());
        Ok(())
    }

    #[test]
    fn count_tracks_inserts_and_deletes() -> crate::Result<()> {
        let store = FeatureStore::create_in_memory()?;
        let table = point_table(&store, "points");
        let all = FeatureQuery::default();

        for i in 0..5 {
            table.create(&point_feature(i as f64, i as f64, "p", i))?;
        }
        table.delete(2)?;
        table.delete(4)?;

        assert_eq!(table.count(&all)?, 3);
        assert_eq!(table.features()?.count(), 3);
        Ok(())
    }

    #[test]
    fn update_unions_extent_and_recompute_shrinks_it() -> crate::Result<()> {
        let store = FeatureStore::create_in_memory()?;
        let table = point_table(&store, "points");

        table.create(&point_feature(0.0, 0.0, "a", 1))?;
        let far = table.create(&point_feature(8.0, 8.0, "b", 2))?;
        assert_eq!(table.extent(false)?, Envelope::new(0.0, 8.0, 0.0, 8.0));

        // Moving the far feature inward never shrinks the cached extent.
        let moved = Feature::new()
            .with_fid(far)
            .with_geometry(&Point::new(1.0, 1.0))?
            .with_values([Value::from("b".to_string()), Value::from(2_i64)]);
        table.update(&moved)?;
        assert_eq!(table.extent(false)?, Envelope::new(0.0, 8.0, 0.0, 8.0));

        // An explicit recompute does (index-assisted path).
        assert!(table.has_spatial_index());
        assert_eq!(table.extent(true)?, Envelope::new(0.0, 1.0, 0.0, 1.0));

        // Same result through the full-scan fallback.
        table.drop_spatial_index()?;
        assert_eq!(table.extent(true)?, Envelope::new(0.0, 1.0, 0.0, 1.0));
        Ok(())
    }

    #[test]
    fn update_and_delete_of_missing_fid_fail() -> crate::Result<()> {
        let store = FeatureStore::create_in_memory()?;
        let table = point_table(&store, "points");
        table.create(&point_feature(0.0, 0.0, "a", 1))?;

        let ghost = point_feature(1.0, 1.0, "x", 9);
        let mut ghost = ghost;
        ghost.set_fid(42);
        assert!(matches!(
            table.update(&ghost),
            Err(StoreError::NotFound { fid: 42 })
        ));
        assert!(matches!(
            table.delete(42),
            Err(StoreError::NotFound { fid: 42 })
        ));
        Ok(())
    }

    #[test]
    fn rejects_wrong_property_count() -> crate::Result<()> {
        let store = FeatureStore::create_in_memory()?;
        let table = point_table(&store, "points");

        let short = Feature::new()
            .with_geometry(&Point::new(0.0, 0.0))?
            .with_values([Value::from("only".to_string())]);
        assert!(matches!(
            table.create(&short),
            Err(StoreError::InvalidPropertyCount {
                expected: 2,
                got: 1
            })
        ));
        Ok(())
    }

    #[test]
    fn empty_polygon_skips_index_and_extent() -> crate::Result<()> {
        let store = FeatureStore::create_in_memory()?;
        let table = store.create_table(
            "polygons",
            Some(GeometryColumnSpec::new("geom", GeometryKind::Polygon, 4326)),
            &[],
        )?;

        let empty: Polygon<f64> = Polygon::new(LineString::new(Vec::new()), Vec::new());
        table.create(&Feature::new().with_geometry(&empty)?)?;

        assert_eq!(table.count(&FeatureQuery::default())?, 1);
        assert_eq!(rtree_count(&store, "polygons"), 0);
        assert!(matches!(
            table.extent(false),
            Err(StoreError::NoFeatures { .. })
        ));
        Ok(())
    }

    #[test]
    fn fid_field_assigns_and_checks_row_id() -> crate::Result<()> {
        let store = FeatureStore::create_in_memory()?;
        let table = store.create_table(
            "named",
            Some(GeometryColumnSpec::new("geom", GeometryKind::Point, 4326)),
            &[
                ColumnSpec::new("fid", ColumnType::Int64),
                ColumnSpec::new("name", ColumnType::Text),
            ],
        )?;

        // Field value alone decides the row id.
        let implicit = Feature::new()
            .with_geometry(&Point::new(0.0, 0.0))?
            .with_values([Value::Integer(5), Value::from("five".to_string())]);
        assert_eq!(table.create(&implicit)?, 5);

        let feature = table.read(5)?.expect("feature 5");
        assert_eq!(feature.property("fid"), Some(&Value::Integer(5)));

        // A disagreeing explicit id is rejected.
        let clashing = Feature::new()
            .with_fid(7)
            .with_geometry(&Point::new(1.0, 1.0))?
            .with_values([Value::Integer(5), Value::from("clash".to_string())]);
        assert!(matches!(
            table.create(&clashing),
            Err(StoreError::InconsistentFid { fid: 7, field: 5 })
        ));
        Ok(())
    }

    #[test]
    fn spatial_filter_returns_intersecting_features_only() -> crate::Result<()> {
        let store = FeatureStore::create_in_memory()?;
        let table = point_table(&store, "points");

        table.create(&point_feature(0.0, 0.0, "near", 1))?;
        table.create(&point_feature(5.0, 5.0, "mid", 2))?;
        table.create(&point_feature(10.0, 10.0, "far", 3))?;

        let query = FeatureQuery::new().with_spatial_filter(Envelope::new(4.0, 6.0, 4.0, 6.0));
        let hits: Vec<String> = table
            .query(&query)?
            .map(|f| match f.property("name") {
                Some(Value::Text(name)) => name.clone(),
                other => panic!("unexpected name value: {other:?}"),
            })
            .collect();
        assert_eq!(hits, vec!["mid"]);

        // Identical result through the full-scan path.
        table.drop_spatial_index()?;
        let hits = table.query(&query)?.count();
        assert_eq!(hits, 1);

        // A filter covering everything returns everything.
        let wide = FeatureQuery::new()
            .with_spatial_filter(Envelope::new(-100.0, 100.0, -100.0, 100.0));
        assert_eq!(table.query(&wide)?.count(), 3);
        Ok(())
    }

    #[test]
    fn attribute_and_spatial_filters_combine() -> crate::Result<()> {
        let store = FeatureStore::create_in_memory()?;
        let table = point_table(&store, "points");

        table.create(&point_feature(0.0, 0.0, "a", 1))?;
        table.create(&point_feature(0.5, 0.5, "b", 2))?;
        table.create(&point_feature(9.0, 9.0, "c", 2))?;

        let query = FeatureQuery::new()
            .with_attribute_filter("rank = 2")
            .with_spatial_filter(Envelope::new(-1.0, 1.0, -1.0, 1.0));
        let hits: Vec<i64> = table.query(&query)?.map(|f| f.fid().unwrap()).collect();
        assert_eq!(hits, vec![2]);

        assert_eq!(table.count(&query)?, 1);
        assert_eq!(
            table.count(&FeatureQuery::new().with_attribute_filter("rank = 2"))?,
            2
        );
        Ok(())
    }

    #[test]
    fn index_candidates_are_a_superset_filter() -> crate::Result<()> {
        let store = FeatureStore::create_in_memory()?;
        let table = point_table(&store, "points");

        table.create(&point_feature(0.0, 0.0, "a", 1))?;
        table.create(&point_feature(2.0, 2.0, "b", 2))?;

        let candidates = table.index_candidates(&Envelope::new(-0.5, 0.5, -0.5, 0.5))?;
        assert_eq!(candidates, vec![1]);
        Ok(())
    }

    #[test]
    fn batch_iteration_respects_batch_size() -> crate::Result<()> {
        let store = FeatureStore::create_in_memory()?;
        let table = point_table(&store, "points");
        for i in 0..7 {
            table.create(&point_feature(i as f64, 0.0, "p", i))?;
        }

        let sizes: Vec<usize> = table
            .features_batch(3)?
            .map(|batch| batch.expect("batch").len())
            .collect();
        assert_eq!(sizes, vec![3, 3, 1]);

        // Empty result set yields no batches.
        let none = FeatureQuery::new().with_attribute_filter("rank > 100");
        assert_eq!(table.query_batch(&none, 3)?.count(), 0);
        Ok(())
    }

    #[test]
    fn dropping_index_mid_iteration_defers_the_table_drop() -> crate::Result<()> {
        let store = FeatureStore::create_in_memory()?;
        let table = point_table(&store, "points");
        for i in 0..3 {
            table.create(&point_feature(i as f64, 0.0, "p", i))?;
        }

        let mut batches = table.features_batch(1)?;
        batches.next().expect("first batch")?;

        // The index goes away logically, but the backing table drop waits
        // for the reader.
        assert!(table.drop_spatial_index()?);
        assert!(!table.has_spatial_index());
        let present: i64 = store.conn().query_row(
            "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE name = 'rtree_points_geom')",
            [],
            |row| row.get(0),
        )?;
        assert_eq!(present, 1);

        drop(batches);
        table.sync_to_disk()?;
        let present: i64 = store.conn().query_row(
            "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE name = 'rtree_points_geom')",
            [],
            |row| row.get(0),
        )?;
        assert_eq!(present, 0);
        Ok(())
    }

    #[test]
    fn truncate_resets_counter_and_extent() -> crate::Result<()> {
        let store = FeatureStore::create_in_memory()?;
        let table = point_table(&store, "points");
        table.create(&point_feature(1.0, 1.0, "a", 1))?;
        table.create(&point_feature(2.0, 2.0, "b", 2))?;

        assert_eq!(table.truncate()?, 2);
        assert_eq!(table.count(&FeatureQuery::default())?, 0);
        assert_eq!(rtree_count(&store, "points"), 0);
        assert!(matches!(
            table.extent(false),
            Err(StoreError::NoFeatures { .. })
        ));
        Ok(())
    }

    #[test]
    fn null_geometry_rows_are_readable() -> crate::Result<()> {
        let store = FeatureStore::create_in_memory()?;
        let table = point_table(&store, "points");

        let no_geom =
            Feature::new().with_values([Value::from("bare".to_string()), Value::from(0_i64)]);
        let fid = table.create(&no_geom)?;
        assert_eq!(rtree_count(&store, "points"), 0);

        let feature = table.read(fid)?.expect("row exists");
        assert!(feature.geometry()?.is_none());
        Ok(())
    }
}
