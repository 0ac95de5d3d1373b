//! R-tree spatial index maintenance.
//!
//! In the synchronous state the six triggers installed next to the index keep
//! it in step with every row mutation. Once enough inserts pile up inside one
//! transaction, maintenance flips to the deferred state: the triggers are
//! snapshotted and dropped, entries accumulate in memory and are bulk-inserted
//! at flush time, after which the snapshotted triggers are reinstalled.

use crate::catalog_sql::{
    SQL_REGISTER_EXTENSION, quote_ident, quote_literal, rtree_name, rtree_trigger_names,
    sql_create_rtree, sql_drop_rtree, sql_rtree_insert_entry, sql_rtree_triggers,
};
use crate::error::{Result, StoreError};
use crate::geom::codec;
use crate::geom::Envelope;
use crate::store::table::TableState;
use crate::types::StoreOptions;
use rusqlite::Connection;
use tracing::{debug, warn};

pub(crate) const EXTENSION_RTREE: &str = "gpkg_rtree_index";
const EXTENSION_RTREE_DEFINITION: &str = "http://www.geopackage.org/spec120/#extension_rtree";

/// One index entry with bounds rounded to single precision.
#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) struct RtreeEntry {
    pub fid: i64,
    pub min_x: f32,
    pub max_x: f32,
    pub min_y: f32,
    pub max_y: f32,
}

/// Maintenance state of one table's spatial index.
#[derive(Debug, Default)]
pub(crate) enum IndexMaintenance {
    /// Triggers mirror every row mutation into the rtree.
    #[default]
    Synchronous,
    /// Triggers are dropped; entries queue in memory until the next flush.
    Deferred(DeferredBatch),
}

#[derive(Debug)]
pub(crate) struct DeferredBatch {
    /// `CREATE TRIGGER` statements snapshotted from `sqlite_master`.
    saved_triggers: Vec<String>,
    entries: Vec<RtreeEntry>,
}

// Rounding constants for the float conversion, from the SQLite rtree module:
// minima round toward -inf and maxima toward +inf so the stored rectangle
// never excludes the feature.
const RND_TOWARDS: f64 = 1.0 - 1.0 / 8_388_608.0;
const RND_AWAY: f64 = 1.0 + 1.0 / 8_388_608.0;

pub(crate) fn rtree_value_down(d: f64) -> f32 {
    let f = d as f32;
    if f as f64 > d {
        (d * if d < 0.0 { RND_AWAY } else { RND_TOWARDS }) as f32
    } else {
        f
    }
}

pub(crate) fn rtree_value_up(d: f64) -> f32 {
    let f = d as f32;
    if (f as f64) < d {
        (d * if d < 0.0 { RND_TOWARDS } else { RND_AWAY }) as f32
    } else {
        f
    }
}

pub(crate) fn rounded_entry(fid: i64, env: &Envelope) -> RtreeEntry {
    RtreeEntry {
        fid,
        min_x: rtree_value_down(env.min_x),
        max_x: rtree_value_up(env.max_x),
        min_y: rtree_value_down(env.min_y),
        max_y: rtree_value_up(env.max_y),
    }
}

fn geometry_column(state: &TableState) -> Result<&str> {
    state
        .geometry
        .as_ref()
        .map(|g| g.name.as_str())
        .ok_or_else(|| {
            StoreError::Message(format!("table '{}' has no geometry column", state.name))
        })
}

/// Check `sqlite_master` for the index backing table.
pub(crate) fn rtree_exists(conn: &Connection, table: &str, geom_column: &str) -> Result<bool> {
    let exists: i64 = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE name = ?1 AND type = 'table')",
        [rtree_name(table, geom_column)],
        |row| row.get(0),
    )?;
    Ok(exists != 0)
}

/// Create and populate the index, install the triggers and register the
/// extension. Returns false when the index already exists.
pub(crate) fn create_index(
    conn: &Connection,
    options: &StoreOptions,
    state: &mut TableState,
) -> Result<bool> {
    let geom_column = geometry_column(state)?.to_string();
    if state.has_index {
        return Ok(false);
    }

    conn.execute_batch(&sql_create_rtree(&state.name, &geom_column))?;
    populate(conn, options, &state.name, &geom_column, &state.fid_column)?;
    conn.execute_batch(&sql_rtree_triggers(
        &state.name,
        &geom_column,
        &state.fid_column,
    ))?;
    conn.execute(
        SQL_REGISTER_EXTENSION,
        rusqlite::params![
            state.name,
            geom_column,
            EXTENSION_RTREE,
            EXTENSION_RTREE_DEFINITION,
            "write-only",
        ],
    )?;

    state.has_index = true;
    state.pending_index_drop = false;
    Ok(true)
}

/// Feed the rtree from existing rows, inserting in bounded chunks instead of
/// one unbounded statement.
fn populate(
    conn: &Connection,
    options: &StoreOptions,
    table: &str,
    geom_column: &str,
    fid_column: &str,
) -> Result<()> {
    let sql = format!(
        "SELECT {fid}, {geom} FROM {t} WHERE {geom} NOT NULL",
        fid = quote_ident(fid_column),
        geom = quote_ident(geom_column),
        t = quote_ident(table),
    );
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query([])?;

    let chunk_size = options.index_population_chunk.max(1);
    let mut chunk: Vec<RtreeEntry> = Vec::new();
    let mut total = 0usize;
    while let Some(row) = rows.next()? {
        let fid: i64 = row.get(0)?;
        let blob: Vec<u8> = row.get(1)?;
        if let Some(env) = codec::bounding_box_of(&blob)? {
            chunk.push(rounded_entry(fid, &env));
        }
        if chunk.len() >= chunk_size {
            total += chunk.len();
            insert_entries(conn, table, geom_column, &chunk)?;
            chunk.clear();
        }
    }
    total += chunk.len();
    insert_entries(conn, table, geom_column, &chunk)?;
    if total > 0 {
        debug!(table, entries = total, "populated spatial index");
    }
    Ok(())
}

pub(crate) fn insert_entries(
    conn: &Connection,
    table: &str,
    geom_column: &str,
    entries: &[RtreeEntry],
) -> Result<()> {
    if entries.is_empty() {
        return Ok(());
    }
    let mut stmt = conn.prepare_cached(&sql_rtree_insert_entry(table, geom_column))?;
    for entry in entries {
        stmt.execute(rusqlite::params![
            entry.fid,
            entry.min_x as f64,
            entry.max_x as f64,
            entry.min_y as f64,
            entry.max_y as f64,
        ])?;
    }
    Ok(())
}

/// Remove the index.
///
/// The triggers and the extension registration go away immediately; when a
/// reader is still paging over the table the backing rtree table itself
/// cannot be dropped yet, so a deferred-drop intent is recorded and honored
/// at the next safe point. Either way the index is unusable from here on and
/// the call reports success.
pub(crate) fn drop_index(conn: &Connection, state: &mut TableState) -> Result<bool> {
    let geom_column = geometry_column(state)?.to_string();
    if !state.has_index {
        return Ok(false);
    }

    conn.execute(
        "DELETE FROM gpkg_extensions WHERE table_name = ?1 AND column_name = ?2 \
         AND extension_name = ?3",
        rusqlite::params![state.name, geom_column, EXTENSION_RTREE],
    )?;
    for name in rtree_trigger_names(&state.name, &geom_column) {
        conn.execute_batch(&format!("DROP TRIGGER IF EXISTS {}", quote_ident(&name)))?;
    }

    // Any queued batch belongs to the index being removed.
    state.index = IndexMaintenance::Synchronous;
    state.inserts_in_txn = 0;

    if state.active_readers > 0 {
        debug!(table = %state.name, "deferring rtree table drop until readers finish");
        state.pending_index_drop = true;
    } else {
        conn.execute_batch(&sql_drop_rtree(&state.name, &geom_column))?;
    }
    state.has_index = false;
    Ok(true)
}

/// Honor a recorded deferred-drop intent if it is now safe.
pub(crate) fn run_pending_drop(conn: &Connection, state: &mut TableState) -> Result<()> {
    if !state.pending_index_drop || state.active_readers > 0 {
        return Ok(());
    }
    let geom_column = geometry_column(state)?.to_string();
    conn.execute_batch(&sql_drop_rtree(&state.name, &geom_column))?;
    state.pending_index_drop = false;
    Ok(())
}

/// Account for one inserted feature with a non-empty geometry.
///
/// Outside a transaction the triggers have already done the work. Inside one,
/// crossing the configured threshold switches to deferred maintenance; from
/// then on entries queue in memory, with intermediate flushes once the queue
/// hits its cap.
pub(crate) fn record_insert(
    conn: &Connection,
    options: &StoreOptions,
    in_transaction: bool,
    state: &mut TableState,
    fid: i64,
    env: &Envelope,
) -> Result<()> {
    if !state.has_index || !in_transaction {
        return Ok(());
    }
    state.inserts_in_txn += 1;

    if matches!(state.index, IndexMaintenance::Synchronous) {
        // The row that crosses the threshold was still indexed by the
        // triggers; only later inserts go through the batch.
        if state.inserts_in_txn >= options.deferred_index_threshold {
            start_deferred(conn, state)?;
        }
        return Ok(());
    }

    let table = state.name.clone();
    let geom_column = geometry_column(state)?.to_string();
    if let IndexMaintenance::Deferred(batch) = &mut state.index {
        if batch.entries.len() >= options.deferred_index_batch_cap {
            let entries = std::mem::take(&mut batch.entries);
            debug!(
                table = %table,
                entries = entries.len(),
                "intermediate flush of deferred index batch"
            );
            insert_entries(conn, &table, &geom_column, &entries)?;
        }
    }
    if let IndexMaintenance::Deferred(batch) = &mut state.index {
        batch.entries.push(rounded_entry(fid, env));
    }
    Ok(())
}

/// Snapshot the six maintenance triggers and drop them.
fn start_deferred(conn: &Connection, state: &mut TableState) -> Result<()> {
    let geom_column = geometry_column(state)?.to_string();
    let names = rtree_trigger_names(&state.name, &geom_column);

    let name_list = names
        .iter()
        .map(|name| quote_literal(name))
        .collect::<Vec<_>>()
        .join(", ");
    let sql = format!(
        "SELECT sql FROM sqlite_master WHERE type = 'trigger' AND name IN ({name_list})"
    );
    let mut stmt = conn.prepare(&sql)?;
    let saved_triggers = stmt
        .query_map([], |row| row.get::<_, String>(0))?
        .collect::<rusqlite::Result<Vec<String>>>()?;

    if saved_triggers.len() != names.len() {
        warn!(
            table = %state.name,
            found = saved_triggers.len(),
            "expected six rtree triggers; staying in synchronous maintenance"
        );
        return Ok(());
    }

    for name in &names {
        conn.execute_batch(&format!("DROP TRIGGER {}", quote_ident(name)))?;
    }
    debug!(table = %state.name, "switched spatial index to deferred maintenance");
    state.index = IndexMaintenance::Deferred(DeferredBatch {
        saved_triggers,
        entries: Vec::new(),
    });
    Ok(())
}

/// Bulk-insert the queued batch and reinstall the snapshotted triggers.
///
/// A no-op in the synchronous state, so it is safe to call before any
/// update/delete/read and at commit.
pub(crate) fn flush_deferred(conn: &Connection, state: &mut TableState) -> Result<()> {
    state.inserts_in_txn = 0;
    let batch = match std::mem::take(&mut state.index) {
        IndexMaintenance::Synchronous => return Ok(()),
        IndexMaintenance::Deferred(batch) => batch,
    };
    let geom_column = geometry_column(state)?.to_string();

    debug!(
        table = %state.name,
        entries = batch.entries.len(),
        "flushing deferred spatial index batch"
    );
    insert_entries(conn, &state.name, &geom_column, &batch.entries)?;
    for sql in &batch.saved_triggers {
        conn.execute_batch(sql)?;
    }
    Ok(())
}

/// Throw away queued work at rollback; the aborted transaction also restores
/// the dropped triggers.
pub(crate) fn discard_deferred(state: &mut TableState) {
    if let IndexMaintenance::Deferred(batch) = &state.index {
        debug!(
            table = %state.name,
            entries = batch.entries.len(),
            "discarding deferred spatial index batch"
        );
    }
    state.index = IndexMaintenance::Synchronous;
    state.inserts_in_txn = 0;
}

/// Candidate feature ids whose stored rectangle intersects `env`.
///
/// Approximate by construction; callers still apply the exact geometry test.
pub(crate) fn query_candidates(
    conn: &Connection,
    table: &str,
    geom_column: &str,
    env: &Envelope,
) -> Result<Vec<i64>> {
    let sql = format!(
        "SELECT id FROM {} WHERE maxx >= ?1 AND minx <= ?2 AND maxy >= ?3 AND miny <= ?4",
        quote_ident(&rtree_name(table, geom_column))
    );
    let mut stmt = conn.prepare_cached(&sql)?;
    let ids = stmt
        .query_map(
            rusqlite::params![env.min_x, env.max_x, env.min_y, env.max_y],
            |row| row.get(0),
        )?
        .collect::<rusqlite::Result<Vec<i64>>>()?;
    Ok(ids)
}

/// Overall extent of the index, without a full `MIN()`/`MAX()` scan.
///
/// Each axis extreme is found by binary search with cheap `EXISTS` probes,
/// which the rtree answers from its internal node structure. The stored
/// bounds are single precision, so searching the ordered 32-bit float space
/// pins down the exact extreme in at most 32 probes per axis.
pub(crate) fn extent_from_rtree(conn: &Connection, rtree: &str) -> Result<Option<Envelope>> {
    let rtree = quote_ident(rtree);
    let not_empty: i64 = conn.query_row(
        &format!("SELECT EXISTS(SELECT 1 FROM {rtree})"),
        [],
        |row| row.get(0),
    )?;
    if not_empty == 0 {
        return Ok(None);
    }

    let min_x = axis_extreme(conn, &rtree, "minx", true)?;
    let max_x = axis_extreme(conn, &rtree, "maxx", false)?;
    let min_y = axis_extreme(conn, &rtree, "miny", true)?;
    let max_y = axis_extreme(conn, &rtree, "maxy", false)?;
    match (min_x, max_x, min_y, max_y) {
        (Some(min_x), Some(max_x), Some(min_y), Some(max_y)) => {
            Ok(Some(Envelope::new(min_x, max_x, min_y, max_y)))
        }
        _ => Ok(None),
    }
}

/// Map a float onto an unsigned key preserving numeric order.
fn ordered_key(value: f32) -> u32 {
    let bits = value.to_bits();
    if bits & 0x8000_0000 != 0 {
        !bits
    } else {
        bits | 0x8000_0000
    }
}

fn key_value(key: u32) -> f32 {
    if key & 0x8000_0000 != 0 {
        f32::from_bits(key & 0x7fff_ffff)
    } else {
        f32::from_bits(!key)
    }
}

fn axis_extreme(
    conn: &Connection,
    rtree: &str,
    column: &str,
    smallest: bool,
) -> Result<Option<f64>> {
    let probe_sql = if smallest {
        format!("SELECT EXISTS(SELECT 1 FROM {rtree} WHERE {column} <= ?1)")
    } else {
        format!("SELECT EXISTS(SELECT 1 FROM {rtree} WHERE {column} >= ?1)")
    };
    let mut probe_stmt = conn.prepare(&probe_sql)?;
    let mut probe = |key: u32| -> Result<bool> {
        let hit: i64 = probe_stmt.query_row([key_value(key) as f64], |row| row.get(0))?;
        Ok(hit != 0)
    };

    // NaN bit patterns sit outside [-inf, +inf] in key order and would break
    // probe monotonicity, so the search stays within that range.
    let mut lo = ordered_key(f32::NEG_INFINITY);
    let mut hi = ordered_key(f32::INFINITY);
    if smallest {
        // Lower bound: smallest key whose probe succeeds is the minimum.
        if !probe(hi)? {
            return Ok(None);
        }
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            if probe(mid)? {
                hi = mid;
            } else {
                lo = mid + 1;
            }
        }
    } else {
        // Upper bound: largest key whose probe succeeds is the maximum.
        if !probe(lo)? {
            return Ok(None);
        }
        while lo < hi {
            let mid = lo + (hi - lo).div_ceil(2);
            if probe(mid)? {
                lo = mid;
            } else {
                hi = mid - 1;
            }
        }
    }
    Ok(Some(key_value(lo) as f64))
}
