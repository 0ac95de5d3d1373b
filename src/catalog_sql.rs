//! SQL text for the catalog tables, the feature tables and the spatial index.
//!
//! Everything that renders identifiers or literals into SQL goes through
//! `quote_ident` / `quote_literal` here.
// cf. https://www.geopackage.org/spec140/index.html#table_definition_sql

/// Double-quote an identifier, doubling embedded quotes.
pub(crate) fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Single-quote a string literal, doubling embedded quotes.
pub(crate) fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

// gpkg_spatial_ref_sys: the SRS catalog referenced by gpkg_contents and
// gpkg_geometry_columns.
pub(crate) const SQL_GPKG_SPATIAL_REF_SYS: &str = "
CREATE TABLE gpkg_spatial_ref_sys (
  srs_name TEXT NOT NULL,
  srs_id INTEGER PRIMARY KEY,
  organization TEXT NOT NULL,
  organization_coordsys_id INTEGER NOT NULL,
  definition  TEXT NOT NULL,
  description TEXT
);
";

// gpkg_contents: one row per user table, with identifying metadata, the
// cached extent and the srs reference.
pub(crate) const SQL_GPKG_CONTENTS: &str = "
CREATE TABLE gpkg_contents (
  table_name TEXT NOT NULL PRIMARY KEY,
  data_type TEXT NOT NULL,
  identifier TEXT UNIQUE,
  description TEXT DEFAULT '',
  last_change DATETIME NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ','now')),
  min_x DOUBLE,
  min_y DOUBLE,
  max_x DOUBLE,
  max_y DOUBLE,
  srs_id INTEGER,
  CONSTRAINT fk_gc_r_srs_id FOREIGN KEY (srs_id) REFERENCES gpkg_spatial_ref_sys(srs_id)
);
";

// gpkg_geometry_columns: identifies the geometry column and declared geometry
// type of each spatial table.
pub(crate) const SQL_GPKG_GEOMETRY_COLUMNS: &str = "
CREATE TABLE gpkg_geometry_columns (
  table_name TEXT NOT NULL,
  column_name TEXT NOT NULL,
  geometry_type_name TEXT NOT NULL,
  srs_id INTEGER NOT NULL,
  z TINYINT NOT NULL,
  m TINYINT NOT NULL,
  CONSTRAINT pk_geom_cols PRIMARY KEY (table_name, column_name),
  CONSTRAINT uk_gc_table_name UNIQUE (table_name),
  CONSTRAINT fk_gc_tn FOREIGN KEY (table_name) REFERENCES gpkg_contents(table_name),
  CONSTRAINT fk_gc_srs FOREIGN KEY (srs_id) REFERENCES gpkg_spatial_ref_sys (srs_id)
);
";

// gpkg_extensions: declares which extensions apply to the package, a table or
// a column (spatial index, non-basic geometry subtypes, ...).
pub(crate) const SQL_GPKG_EXTENSIONS: &str = "
CREATE TABLE gpkg_extensions (
  table_name TEXT,
  column_name TEXT,
  extension_name TEXT NOT NULL,
  definition TEXT NOT NULL,
  scope TEXT NOT NULL,
  CONSTRAINT ge_tce UNIQUE (table_name, column_name, extension_name)
);
";

// Side table holding the persisted per-table feature counter.
pub(crate) const SQL_OGR_CONTENTS: &str = "
CREATE TABLE gpkg_ogr_contents (
  table_name TEXT NOT NULL PRIMARY KEY,
  feature_count INTEGER DEFAULT NULL
);
";

// gpkg_data_columns / gpkg_data_column_constraints: optional per-column
// metadata (domains, JSON mime type). Created on demand.
pub(crate) const SQL_GPKG_DATA_COLUMNS: &str = "
CREATE TABLE gpkg_data_columns (
  table_name TEXT NOT NULL,
  column_name TEXT NOT NULL,
  name TEXT,
  title TEXT,
  description TEXT,
  mime_type TEXT,
  constraint_name TEXT,
  CONSTRAINT pk_gdc PRIMARY KEY (table_name, column_name),
  CONSTRAINT gdc_tn UNIQUE (table_name, name)
);
CREATE TABLE gpkg_data_column_constraints (
  constraint_name TEXT NOT NULL,
  constraint_type TEXT NOT NULL,
  value TEXT,
  min NUMERIC,
  min_is_inclusive BOOLEAN,
  max NUMERIC,
  max_is_inclusive BOOLEAN,
  description TEXT,
  CONSTRAINT gdcc_ntv UNIQUE (constraint_name, constraint_type, value)
);
";

// gpkg_metadata / gpkg_metadata_reference: free-form document metadata keyed
// by table name. Created on demand.
pub(crate) const SQL_GPKG_METADATA: &str = "
CREATE TABLE gpkg_metadata (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  md_scope TEXT NOT NULL DEFAULT 'dataset',
  md_standard_uri TEXT NOT NULL,
  mime_type TEXT NOT NULL DEFAULT 'text/xml',
  metadata TEXT NOT NULL DEFAULT ''
);
CREATE TABLE gpkg_metadata_reference (
  reference_scope TEXT NOT NULL,
  table_name TEXT,
  column_name TEXT,
  row_id_value INTEGER,
  timestamp DATETIME NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ','now')),
  md_file_id INTEGER NOT NULL,
  md_parent_id INTEGER,
  CONSTRAINT crmr_mfi_fk FOREIGN KEY (md_file_id) REFERENCES gpkg_metadata(id),
  CONSTRAINT crmr_mpi_fk FOREIGN KEY (md_parent_id) REFERENCES gpkg_metadata(id)
);
";

pub(crate) const SQL_LIST_TABLES: &str =
    "SELECT table_name FROM gpkg_contents WHERE data_type IN ('features', 'attributes') \
     ORDER BY table_name";

pub(crate) const SQL_INSERT_CONTENTS: &str = "
INSERT INTO gpkg_contents
  (table_name, data_type, identifier, description, srs_id)
VALUES
  (?1, ?2, ?1, '', ?3)
";

pub(crate) const SQL_INSERT_GEOMETRY_COLUMNS: &str = "
INSERT INTO gpkg_geometry_columns
  (table_name, column_name, geometry_type_name, srs_id, z, m)
VALUES
  (?1, ?2, ?3, ?4, ?5, ?6)
";

pub(crate) const SQL_SELECT_GEOMETRY_COLUMN_META: &str = "
SELECT column_name, geometry_type_name, z, m, srs_id
FROM gpkg_geometry_columns
WHERE table_name = ?1
";

pub(crate) const SQL_SELECT_CONTENTS_EXTENT: &str = "
SELECT min_x, min_y, max_x, max_y
FROM gpkg_contents
WHERE table_name = ?1
";

pub(crate) const SQL_UPDATE_CONTENTS_EXTENT: &str = "
UPDATE gpkg_contents SET
  min_x = ?2, min_y = ?3, max_x = ?4, max_y = ?5,
  last_change = strftime('%Y-%m-%dT%H:%M:%fZ','now')
WHERE table_name = ?1 AND Lower(data_type) = 'features'
";

pub(crate) const SQL_TOUCH_CONTENTS: &str = "
UPDATE gpkg_contents
SET last_change = strftime('%Y-%m-%dT%H:%M:%fZ','now')
WHERE table_name = ?1
";

pub(crate) const SQL_SELECT_FEATURE_COUNT: &str =
    "SELECT feature_count FROM gpkg_ogr_contents WHERE table_name = ?1";

pub(crate) const SQL_UPSERT_FEATURE_COUNT: &str = "
INSERT INTO gpkg_ogr_contents (table_name, feature_count) VALUES (?1, ?2)
ON CONFLICT (table_name) DO UPDATE SET feature_count = ?2
";

pub(crate) const SQL_REGISTER_EXTENSION: &str = "
INSERT OR IGNORE INTO gpkg_extensions
  (table_name, column_name, extension_name, definition, scope)
VALUES
  (?1, ?2, ?3, ?4, ?5)
";

pub(crate) fn sql_table_exists(name: &str) -> String {
    format!(
        "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE name = {} \
         AND type IN ('table', 'view'))",
        quote_literal(name)
    )
}

pub(crate) fn sql_table_columns(table: &str) -> String {
    format!(
        "SELECT name, type, pk, [notnull], dflt_value FROM pragma_table_info({})",
        quote_literal(table)
    )
}

pub(crate) fn sql_create_table(table: &str, column_defs: &str) -> String {
    format!("CREATE TABLE {} ({column_defs})", quote_ident(table))
}

pub(crate) fn sql_drop_table(table: &str) -> String {
    format!("DROP TABLE {}", quote_ident(table))
}

pub(crate) fn sql_delete_all(table: &str) -> String {
    format!("DELETE FROM {}", quote_ident(table))
}

pub(crate) fn sql_insert_feature(table: &str, columns: &str, values: &str) -> String {
    format!(
        "INSERT INTO {} ({columns}) VALUES ({values})",
        quote_ident(table)
    )
}

// ---------------------------------------------------------------------------
// Spatial index (rtree virtual table + maintenance triggers)
// cf. https://www.geopackage.org/spec140/index.html#extension_rtree

pub(crate) fn rtree_name(table: &str, geom_column: &str) -> String {
    format!("rtree_{table}_{geom_column}")
}

pub(crate) fn sql_create_rtree(table: &str, geom_column: &str) -> String {
    format!(
        "CREATE VIRTUAL TABLE {} USING rtree(id, minx, maxx, miny, maxy)",
        quote_ident(&rtree_name(table, geom_column))
    )
}

pub(crate) fn sql_drop_rtree(table: &str, geom_column: &str) -> String {
    format!(
        "DROP TABLE IF EXISTS {}",
        quote_ident(&rtree_name(table, geom_column))
    )
}

pub(crate) fn sql_rtree_insert_entry(table: &str, geom_column: &str) -> String {
    format!(
        "INSERT OR REPLACE INTO {} VALUES (?1, ?2, ?3, ?4, ?5)",
        quote_ident(&rtree_name(table, geom_column))
    )
}

/// Names of the six maintenance triggers, in rule order.
pub(crate) fn rtree_trigger_names(table: &str, geom_column: &str) -> [String; 6] {
    let base = rtree_name(table, geom_column);
    [
        format!("{base}_insert"),
        format!("{base}_update1"),
        format!("{base}_update2"),
        format!("{base}_update3"),
        format!("{base}_update4"),
        format!("{base}_delete"),
    ]
}

/// The six row-level maintenance triggers:
/// insert of a non-empty geometry adds an entry; update in place replaces or
/// removes it depending on emptiness; an id change moves or removes entries
/// for both ids; delete removes the entry.
pub(crate) fn sql_rtree_triggers(table: &str, geom_column: &str, id_column: &str) -> String {
    let rtree = quote_ident(&rtree_name(table, geom_column));
    let names = rtree_trigger_names(table, geom_column);
    let t = quote_ident(table);
    let c = quote_ident(geom_column);
    let i = quote_ident(id_column);

    format!(
        "CREATE TRIGGER {n0} AFTER INSERT ON {t}
  WHEN (NEW.{c} NOT NULL AND NOT ST_IsEmpty(NEW.{c}))
BEGIN
  INSERT OR REPLACE INTO {rtree} VALUES (
    NEW.{i},
    ST_MinX(NEW.{c}), ST_MaxX(NEW.{c}),
    ST_MinY(NEW.{c}), ST_MaxY(NEW.{c})
  );
END;

CREATE TRIGGER {n1} AFTER UPDATE OF {c} ON {t}
  WHEN OLD.{i} = NEW.{i} AND
       (NEW.{c} NOTNULL AND NOT ST_IsEmpty(NEW.{c}))
BEGIN
  INSERT OR REPLACE INTO {rtree} VALUES (
    NEW.{i},
    ST_MinX(NEW.{c}), ST_MaxX(NEW.{c}),
    ST_MinY(NEW.{c}), ST_MaxY(NEW.{c})
  );
END;

CREATE TRIGGER {n2} AFTER UPDATE OF {c} ON {t}
  WHEN OLD.{i} = NEW.{i} AND
       (NEW.{c} ISNULL OR ST_IsEmpty(NEW.{c}))
BEGIN
  DELETE FROM {rtree} WHERE id = OLD.{i};
END;

CREATE TRIGGER {n3} AFTER UPDATE ON {t}
  WHEN OLD.{i} != NEW.{i} AND
       (NEW.{c} NOTNULL AND NOT ST_IsEmpty(NEW.{c}))
BEGIN
  DELETE FROM {rtree} WHERE id = OLD.{i};
  INSERT OR REPLACE INTO {rtree} VALUES (
    NEW.{i},
    ST_MinX(NEW.{c}), ST_MaxX(NEW.{c}),
    ST_MinY(NEW.{c}), ST_MaxY(NEW.{c})
  );
END;

CREATE TRIGGER {n4} AFTER UPDATE ON {t}
  WHEN OLD.{i} != NEW.{i} AND
       (NEW.{c} ISNULL OR ST_IsEmpty(NEW.{c}))
BEGIN
  DELETE FROM {rtree} WHERE id IN (OLD.{i}, NEW.{i});
END;

CREATE TRIGGER {n5} AFTER DELETE ON {t}
  WHEN OLD.{c} NOT NULL
BEGIN
  DELETE FROM {rtree} WHERE id = OLD.{i};
END;",
        n0 = quote_ident(&names[0]),
        n1 = quote_ident(&names[1]),
        n2 = quote_ident(&names[2]),
        n3 = quote_ident(&names[3]),
        n4 = quote_ident(&names[4]),
        n5 = quote_ident(&names[5]),
    )
}
