//! Schema evolution for feature tables.
//!
//! Narrow changes map onto SQLite's native ALTER forms (`ADD COLUMN`,
//! `RENAME COLUMN`, `RENAME TO`). Everything the native forms cannot express
//! goes through a shadow-table rewrite: snapshot the table's triggers and
//! indexes, create a shadow table with the new column list, copy all rows,
//! drop the original, rename the shadow into place and replay the snapshots.
//! Each operation is atomic and verifies foreign-key integrity before it
//! commits.

use crate::catalog_sql::{quote_ident, sql_create_table, sql_table_exists};
use crate::conversions::{column_type_to_decl, geometry_kind_to_str};
use crate::error::{Result, StoreError};
use crate::store::spatial_index;
use crate::store::store::FeatureStore;
use crate::store::table::TableState;
use crate::types::{ColumnSpec, ColumnType};
use tracing::debug;

/// Requested changes to one column. `None` fields keep the current value;
/// the doubly-wrapped fields use `Some(None)` to clear.
#[derive(Clone, Debug, Default)]
pub struct ColumnChanges {
    pub name: Option<String>,
    pub column_type: Option<ColumnType>,
    pub width: Option<Option<u32>>,
    pub nullable: Option<bool>,
    pub unique: Option<bool>,
    pub default_expr: Option<Option<String>>,
    pub domain: Option<Option<String>>,
}

/// SQL column definition for one attribute column.
pub(crate) fn column_def(spec: &ColumnSpec) -> String {
    let mut def = format!(
        "{} {}",
        quote_ident(&spec.name),
        column_type_to_decl(spec.column_type, spec.width)
    );
    if !spec.nullable {
        def.push_str(" NOT NULL");
    }
    if spec.unique {
        def.push_str(" UNIQUE");
    }
    if let Some(expr) = &spec.default_expr {
        def.push_str(" DEFAULT ");
        def.push_str(expr);
    }
    def
}

/// Full column definition list for (re)creating a feature table.
pub(crate) fn table_column_defs(
    fid_column: &str,
    geometry: Option<&crate::types::GeometryColumnSpec>,
    columns: &[ColumnSpec],
    fid_as_column: Option<usize>,
) -> String {
    let mut defs = Vec::with_capacity(columns.len() + 2);
    defs.push(format!(
        "{} INTEGER PRIMARY KEY AUTOINCREMENT",
        quote_ident(fid_column)
    ));
    if let Some(geom) = geometry {
        let mut def = format!(
            "{} {}",
            quote_ident(&geom.name),
            geometry_kind_to_str(geom.kind)
        );
        if !geom.nullable {
            def.push_str(" NOT NULL");
        }
        defs.push(def);
    }
    for (idx, spec) in columns.iter().enumerate() {
        if fid_as_column == Some(idx) {
            // Exposed through the primary key column; no second SQL column.
            continue;
        }
        defs.push(column_def(spec));
    }
    defs.join(", ")
}

fn assert_name_free(state: &TableState, name: &str, skip_idx: Option<usize>) -> Result<()> {
    if name == state.fid_column {
        return Err(StoreError::DuplicateName(name.to_string()));
    }
    if let Some(geom) = &state.geometry
        && geom.name == name
    {
        return Err(StoreError::DuplicateName(name.to_string()));
    }
    for (idx, column) in state.columns.iter().enumerate() {
        if Some(idx) != skip_idx && column.name == name {
            return Err(StoreError::DuplicateName(name.to_string()));
        }
    }
    Ok(())
}

fn column_at(state: &TableState, idx: usize) -> Result<ColumnSpec> {
    state.columns.get(idx).cloned().ok_or_else(|| {
        StoreError::UnsupportedSchemaChange(format!("column index {idx} out of range"))
    })
}

/// Add a column.
///
/// A nullable, non-unique column (or one with a default) maps onto native
/// `ADD COLUMN`; NOT NULL without default and UNIQUE need the rewrite path.
pub(crate) fn add_column(
    store: &FeatureStore,
    state: &mut TableState,
    spec: &ColumnSpec,
) -> Result<()> {
    assert_name_free(state, &spec.name, None)?;
    spatial_index::flush_deferred(store.conn(), state)?;

    let needs_rewrite = spec.unique || (!spec.nullable && spec.default_expr.is_none());
    store.with_savepoint(|| {
        if needs_rewrite {
            let mut new_columns = state.columns.clone();
            new_columns.push(spec.clone());
            let defs = table_column_defs(
                &state.fid_column,
                state.geometry.as_ref(),
                &new_columns,
                state.fid_as_column,
            );
            let fill = spec.default_expr.clone().unwrap_or_else(|| "NULL".to_string());
            let mut select_list = base_select_list(state);
            select_list.push(fill);
            recreate_table(store, state, &defs, &select_list.join(", "), None)?;
        } else {
            store.conn().execute_batch(&format!(
                "ALTER TABLE {} ADD COLUMN {}",
                quote_ident(&state.name),
                column_def(spec)
            ))?;
        }
        sync_column_metadata(store, &state.name, spec)?;
        Ok(())
    })?;

    state.columns.push(spec.clone());
    state.rebuild_property_index();
    Ok(())
}

/// Delete a column by index. Always a rewrite.
pub(crate) fn delete_column(
    store: &FeatureStore,
    state: &mut TableState,
    idx: usize,
) -> Result<()> {
    let column = column_at(state, idx)?;
    if state.fid_as_column == Some(idx) {
        return Err(StoreError::UnsupportedSchemaChange(format!(
            "column '{}' exposes the primary key",
            column.name
        )));
    }
    spatial_index::flush_deferred(store.conn(), state)?;

    store.with_savepoint(|| {
        let mut new_columns = state.columns.clone();
        new_columns.remove(idx);
        let new_fid_as_column = state.fid_as_column.map(|fid_idx| {
            if fid_idx > idx { fid_idx - 1 } else { fid_idx }
        });
        let defs = table_column_defs(
            &state.fid_column,
            state.geometry.as_ref(),
            &new_columns,
            new_fid_as_column,
        );
        let select_list = select_list_for(state, |i| if i == idx { None } else { Some(i) });
        recreate_table(store, state, &defs, &select_list, None)?;
        drop_column_metadata(store, &state.name, &column.name)?;
        Ok(())
    })?;

    state.columns.remove(idx);
    if let Some(fid_idx) = state.fid_as_column
        && fid_idx > idx
    {
        state.fid_as_column = Some(fid_idx - 1);
    }
    state.rebuild_property_index();
    Ok(())
}

/// Alter a column's name, type, width, constraints, default or domain.
pub(crate) fn alter_column(
    store: &FeatureStore,
    state: &mut TableState,
    idx: usize,
    changes: &ColumnChanges,
) -> Result<()> {
    let old = column_at(state, idx)?;
    let mut new = old.clone();
    if let Some(name) = &changes.name {
        new.name = name.clone();
    }
    if let Some(column_type) = changes.column_type {
        new.column_type = column_type;
    }
    if let Some(width) = changes.width {
        new.width = width;
    }
    if let Some(nullable) = changes.nullable {
        new.nullable = nullable;
    }
    if let Some(unique) = changes.unique {
        new.unique = unique;
    }
    if let Some(default_expr) = &changes.default_expr {
        new.default_expr = default_expr.clone();
    }
    if let Some(domain) = &changes.domain {
        new.domain = domain.clone();
    }

    let renamed = new.name != old.name;
    if renamed {
        assert_name_free(state, &new.name, Some(idx))?;
    }
    if state.fid_as_column == Some(idx)
        && (renamed || new.column_type != old.column_type || changes.nullable == Some(true))
    {
        return Err(StoreError::UnsupportedSchemaChange(format!(
            "column '{}' exposes the primary key and cannot be renamed or retyped",
            old.name
        )));
    }

    let structural = new.column_type != old.column_type
        || new.width != old.width
        || new.nullable != old.nullable
        || new.unique != old.unique
        || new.default_expr != old.default_expr;

    spatial_index::flush_deferred(store.conn(), state)?;
    store.with_savepoint(|| {
        if structural {
            let mut new_columns = state.columns.clone();
            new_columns[idx] = new.clone();
            let defs = table_column_defs(
                &state.fid_column,
                state.geometry.as_ref(),
                &new_columns,
                state.fid_as_column,
            );
            let select_list = base_select_list_joined(state);
            let rename = renamed.then(|| (old.name.clone(), new.name.clone()));
            recreate_table(store, state, &defs, &select_list, rename.as_ref())?;
        } else if renamed {
            // Native rename; SQLite rewrites dependent triggers and indexes.
            store.conn().execute_batch(&format!(
                "ALTER TABLE {} RENAME COLUMN {} TO {}",
                quote_ident(&state.name),
                quote_ident(&old.name),
                quote_ident(&new.name)
            ))?;
        }
        if renamed {
            rename_column_metadata(store, &state.name, &old.name, &new.name)?;
        }
        if changes.domain.is_some() || new.column_type == ColumnType::Json {
            drop_column_metadata(store, &state.name, &new.name)?;
            sync_column_metadata(store, &state.name, &new)?;
        }
        Ok(())
    })?;

    state.columns[idx] = new;
    state.rebuild_property_index();
    Ok(())
}

/// Reorder the attribute columns; `permutation[new_pos] = old_pos`.
pub(crate) fn reorder_columns(
    store: &FeatureStore,
    state: &mut TableState,
    permutation: &[usize],
) -> Result<()> {
    let n = state.columns.len();
    let mut seen = vec![false; n];
    if permutation.len() != n
        || permutation.iter().any(|&old| {
            old >= n || std::mem::replace(&mut seen[old], true)
        })
    {
        return Err(StoreError::UnsupportedSchemaChange(format!(
            "{permutation:?} is not a permutation of {n} columns"
        )));
    }

    spatial_index::flush_deferred(store.conn(), state)?;
    let new_columns: Vec<ColumnSpec> = permutation
        .iter()
        .map(|&old| state.columns[old].clone())
        .collect();

    let new_fid_as_column = state
        .fid_as_column
        .map(|fid_idx| permutation.iter().position(|&old| old == fid_idx).unwrap());
    store.with_savepoint(|| {
        let defs = table_column_defs(
            &state.fid_column,
            state.geometry.as_ref(),
            &new_columns,
            new_fid_as_column,
        );
        let select_list = select_list_for(state, |i| Some(permutation[i]));
        recreate_table(store, state, &defs, &select_list, None)?;
        Ok(())
    })?;

    state.fid_as_column = new_fid_as_column;
    state.columns = new_columns;
    state.rebuild_property_index();
    Ok(())
}

/// Rename the table, cascading to every catalog row and the spatial index.
pub(crate) fn rename_table(
    store: &FeatureStore,
    state: &mut TableState,
    new_name: &str,
) -> Result<()> {
    if new_name == state.name {
        return Ok(());
    }
    let conn = store.conn();
    let exists: i64 = conn.query_row(&sql_table_exists(new_name), [], |row| row.get(0))?;
    if exists != 0 {
        return Err(StoreError::DuplicateName(new_name.to_string()));
    }

    spatial_index::flush_deferred(conn, state)?;
    spatial_index::run_pending_drop(conn, state)?;

    let old_name = state.name.clone();
    let had_index = state.has_index;
    store.with_savepoint(|| {
        if had_index {
            spatial_index::drop_index(conn, state)?;
        }

        conn.execute(
            "UPDATE gpkg_geometry_columns SET table_name = ?1 WHERE table_name = ?2",
            rusqlite::params![new_name, old_name],
        )?;
        // Keep the identifier in step when it defaulted to the table name.
        conn.execute(
            "UPDATE gpkg_contents SET identifier = ?1 \
             WHERE table_name = ?2 AND identifier = ?2",
            rusqlite::params![new_name, old_name],
        )?;
        conn.execute(
            "UPDATE gpkg_contents SET table_name = ?1 WHERE table_name = ?2",
            rusqlite::params![new_name, old_name],
        )?;
        conn.execute(
            "UPDATE gpkg_extensions SET table_name = ?1 WHERE table_name = ?2",
            rusqlite::params![new_name, old_name],
        )?;
        conn.execute(
            "UPDATE gpkg_ogr_contents SET table_name = ?1 WHERE table_name = ?2",
            rusqlite::params![new_name, old_name],
        )?;
        if store.has_side_table("gpkg_data_columns")? {
            conn.execute(
                "UPDATE gpkg_data_columns SET table_name = ?1 WHERE table_name = ?2",
                rusqlite::params![new_name, old_name],
            )?;
        }
        if store.has_side_table("gpkg_metadata_reference")? {
            conn.execute(
                "UPDATE gpkg_metadata_reference SET table_name = ?1 WHERE table_name = ?2",
                rusqlite::params![new_name, old_name],
            )?;
        }

        conn.execute_batch(&format!(
            "ALTER TABLE {} RENAME TO {}",
            quote_ident(&old_name),
            quote_ident(new_name)
        ))?;

        verify_foreign_keys(store)?;

        state.name = new_name.to_string();
        if had_index {
            spatial_index::create_index(conn, store.options(), state)?;
        }
        Ok(())
    })
    .inspect_err(|_| {
        // The savepoint rollback restored the schema; restore the cache too.
        state.name = old_name.clone();
        state.has_index = had_index;
    })?;

    debug!(old = %old_name, new = %new_name, "renamed feature table");
    Ok(())
}

/// fid + geometry + every current attribute column, quoted.
fn base_select_list(state: &TableState) -> Vec<String> {
    let mut list = Vec::with_capacity(state.columns.len() + 2);
    list.push(quote_ident(&state.fid_column));
    if let Some(geom) = &state.geometry {
        list.push(quote_ident(&geom.name));
    }
    for (idx, column) in state.columns.iter().enumerate() {
        if state.fid_as_column == Some(idx) {
            continue;
        }
        list.push(quote_ident(&column.name));
    }
    list
}

fn base_select_list_joined(state: &TableState) -> String {
    base_select_list(state).join(", ")
}

/// Select list mapping each new column position onto an old column index
/// (`None` drops the column).
fn select_list_for(
    state: &TableState,
    map: impl Fn(usize) -> Option<usize>,
) -> String {
    let mut list = Vec::with_capacity(state.columns.len() + 2);
    list.push(quote_ident(&state.fid_column));
    if let Some(geom) = &state.geometry {
        list.push(quote_ident(&geom.name));
    }
    for new_pos in 0..state.columns.len() {
        let Some(old_pos) = map(new_pos) else { continue };
        if state.fid_as_column == Some(old_pos) {
            continue;
        }
        list.push(quote_ident(&state.columns[old_pos].name));
    }
    list.join(", ")
}

/// The shadow-table rewrite.
///
/// Snapshots triggers and indexes (the spatial index triggers included),
/// copies all rows into a shadow table, swaps it into place and replays the
/// snapshots. Runs inside the caller's savepoint; any failure rolls the whole
/// operation back.
fn recreate_table(
    store: &FeatureStore,
    state: &TableState,
    column_defs: &str,
    select_list: &str,
    renamed: Option<&(String, String)>,
) -> Result<()> {
    let conn = store.conn();
    debug!(table = %state.name, "rewriting table through shadow copy");

    let mut stmt = conn.prepare(
        "SELECT sql FROM sqlite_master WHERE type IN ('trigger', 'index') \
         AND tbl_name = ?1 AND sql IS NOT NULL",
    )?;
    let snapshots = stmt
        .query_map([&state.name], |row| row.get::<_, String>(0))?
        .collect::<rusqlite::Result<Vec<String>>>()?;
    drop(stmt);

    let shadow = format!("{}_rewrite_tmp", state.name);
    conn.execute_batch(&sql_create_table(&shadow, column_defs))?;

    conn.execute_batch(&format!(
        "INSERT INTO {} SELECT {select_list} FROM {}",
        quote_ident(&shadow),
        quote_ident(&state.name)
    ))?;
    conn.execute_batch(&format!("DROP TABLE {}", quote_ident(&state.name)))?;
    conn.execute_batch(&format!(
        "ALTER TABLE {} RENAME TO {}",
        quote_ident(&shadow),
        quote_ident(&state.name)
    ))?;

    for sql in &snapshots {
        let sql = match renamed {
            Some((old, new)) => rename_in_sql(sql, old, new),
            None => sql.clone(),
        };
        conn.execute_batch(&sql)?;
    }

    verify_foreign_keys(store)
}

/// Substitute a renamed column inside snapshotted trigger/index SQL.
fn rename_in_sql(sql: &str, old: &str, new: &str) -> String {
    sql.replace(&quote_ident(old), &quote_ident(new))
}

/// Run `PRAGMA foreign_key_check` and fail when it reports violations.
pub(crate) fn verify_foreign_keys(store: &FeatureStore) -> Result<()> {
    let mut stmt = store.conn().prepare("PRAGMA foreign_key_check")?;
    let mut rows = stmt.query([])?;
    if let Some(row) = rows.next()? {
        let table: String = row.get(0)?;
        let referenced: String = row.get(2)?;
        return Err(StoreError::IntegrityViolation(format!(
            "row in '{table}' references missing row in '{referenced}'"
        )));
    }
    Ok(())
}

/// Write the data-columns catalog row a column needs (domain or JSON marker).
pub(crate) fn sync_column_metadata(
    store: &FeatureStore,
    table: &str,
    spec: &ColumnSpec,
) -> Result<()> {
    let mime_type = (spec.column_type == ColumnType::Json).then_some("application/json");
    if spec.domain.is_none() && mime_type.is_none() {
        return Ok(());
    }
    store.ensure_data_columns_tables()?;
    store.conn().execute(
        "INSERT INTO gpkg_data_columns (table_name, column_name, mime_type, constraint_name) \
         VALUES (?1, ?2, ?3, ?4) \
         ON CONFLICT (table_name, column_name) \
         DO UPDATE SET mime_type = ?3, constraint_name = ?4",
        rusqlite::params![table, spec.name, mime_type, spec.domain],
    )?;
    Ok(())
}

fn drop_column_metadata(store: &FeatureStore, table: &str, column: &str) -> Result<()> {
    let conn = store.conn();
    if store.has_side_table("gpkg_data_columns")? {
        conn.execute(
            "DELETE FROM gpkg_data_columns WHERE table_name = ?1 AND column_name = ?2",
            rusqlite::params![table, column],
        )?;
    }
    conn.execute(
        "DELETE FROM gpkg_extensions WHERE table_name = ?1 AND column_name = ?2",
        rusqlite::params![table, column],
    )?;
    if store.has_side_table("gpkg_metadata_reference")? {
        conn.execute(
            "DELETE FROM gpkg_metadata_reference WHERE table_name = ?1 AND column_name = ?2",
            rusqlite::params![table, column],
        )?;
    }
    Ok(())
}

fn rename_column_metadata(
    store: &FeatureStore,
    table: &str,
    old: &str,
    new: &str,
) -> Result<()> {
    let conn = store.conn();
    if store.has_side_table("gpkg_data_columns")? {
        conn.execute(
            "UPDATE gpkg_data_columns SET column_name = ?1 \
             WHERE table_name = ?2 AND column_name = ?3",
            rusqlite::params![new, table, old],
        )?;
    }
    conn.execute(
        "UPDATE gpkg_extensions SET column_name = ?1 \
         WHERE table_name = ?2 AND column_name = ?3",
        rusqlite::params![new, table, old],
    )?;
    Ok(())
}
