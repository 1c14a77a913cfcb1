//! Persisted variant store on top of RocksDB.
//!
//! The store holds the variant table (`df`), its secondary index
//! (`df_index`), the descriptive header metadata (`metadata`), the flattened
//! statistics (`stats`), the column schema (`schema`), and bookkeeping
//! information (`meta`).  A store is written once per ingestion and may be
//! opened read-only later without re-parsing the input.

pub mod ds;

use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use crate::{
    common,
    conf::StoreCompression,
    err::IngestError,
    ingest::{header::HeaderMetadataEntry, schema::DerivedColumnSchema},
};

use self::ds::Cell;

/// Column family with the variant rows.
pub const CF_DF: &str = "df";
/// Column family with the secondary index over the variant rows.
pub const CF_DF_INDEX: &str = "df_index";
/// Column family with the descriptive header metadata.
pub const CF_METADATA: &str = "metadata";
/// Column family with the flattened statistics.
pub const CF_STATS: &str = "stats";
/// Column family with the column schema.
pub const CF_SCHEMA: &str = "schema";
/// Column family with bookkeeping information.
pub const CF_META: &str = "meta";

/// All column families of a store.
pub const CF_NAMES: &[&str] = &[CF_META, CF_DF, CF_DF_INDEX, CF_METADATA, CF_STATS, CF_SCHEMA];

/// Keys in the `meta` column family.
pub const META_WORKER_VERSION: &str = "varstat-worker-version";
pub const META_DB_NAME: &str = "db-name";
pub const META_ROW_COUNT: &str = "row-count";
pub const META_INDEXED_COLUMNS: &str = "indexed-columns";
pub const META_INPUT_PATH: &str = "input-path";
pub const META_INPUT_COMPRESSION: &str = "input-compression";
pub const META_ANNOTATED: &str = "annotated";

/// Value of `META_DB_NAME` that marks a directory as a variant store.
const DB_NAME: &str = "varstat";

/// Key of the schema in the `schema` column family.
const SCHEMA_KEY: &str = "df";

/// Number of writes collected in one write batch.
const BATCH_SIZE: usize = 10_000;

/// One persisted statistics entry.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct StatRow {
    pub tag: String,
    pub result: String,
}

/// Handle to an on-disk variant store.
pub struct VariantStore {
    db: rocksdb::DB,
    path: PathBuf,
}

impl std::fmt::Debug for VariantStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VariantStore")
            .field("path", &self.path)
            .finish()
    }
}

impl VariantStore {
    fn options(compression: StoreCompression) -> rocksdb::Options {
        let mut options = rocksdb_utils_lookup::tune_options(rocksdb::Options::default(), None);
        options.create_if_missing(true);
        options.create_missing_column_families(true);
        options.set_compression_type(compression.into());
        options
    }

    /// Create a new store at `path`.
    ///
    /// An existing path is only replaced if it is an empty directory or a
    /// previous variant store.
    pub fn create<P: AsRef<Path>>(
        path: P,
        compression: StoreCompression,
    ) -> Result<Self, IngestError> {
        let path = path.as_ref();
        if path.exists() {
            if !Self::is_replaceable(path) {
                return Err(IngestError::FileAccess {
                    path: path.to_path_buf(),
                    reason: String::from("exists but is not a variant store, refusing to replace it"),
                });
            }
            tracing::debug!("removing previous store at {:?}", path);
            std::fs::remove_dir_all(path).map_err(|e| IngestError::file_access(path, e))?;
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| IngestError::file_access(parent, e))?;
        }

        let options = Self::options(compression);
        let cf_descriptors = CF_NAMES
            .iter()
            .map(|name| rocksdb::ColumnFamilyDescriptor::new(*name, options.clone()))
            .collect::<Vec<_>>();
        let db = rocksdb::DB::open_cf_descriptors(&options, path, cf_descriptors)?;
        let result = Self {
            db,
            path: path.to_path_buf(),
        };
        result.put_meta(META_WORKER_VERSION, common::worker_version())?;
        result.put_meta(META_DB_NAME, DB_NAME)?;
        result.put_meta(META_ROW_COUNT, "0")?;
        Ok(result)
    }

    /// Open an existing store for reading and writing.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, IngestError> {
        let path = path.as_ref();
        Self::check_exists(path)?;
        let options = Self::options(StoreCompression::default());
        let db = rocksdb::DB::open_cf_with_opts(
            &options,
            path,
            CF_NAMES
                .iter()
                .map(|name| (name.to_string(), options.clone()))
                .collect::<Vec<_>>(),
        )?;
        Self {
            db,
            path: path.to_path_buf(),
        }
        .check_db_name()
    }

    /// Open an existing store read-only.
    pub fn open_read_only<P: AsRef<Path>>(path: P) -> Result<Self, IngestError> {
        let path = path.as_ref();
        Self::check_exists(path)?;
        let db = rocksdb::DB::open_cf_for_read_only(
            &rocksdb::Options::default(),
            path,
            CF_NAMES,
            false,
        )?;
        Self {
            db,
            path: path.to_path_buf(),
        }
        .check_db_name()
    }

    /// Whether `path` holds a store written by this worker.
    pub fn is_variant_store<P: AsRef<Path>>(path: P) -> bool {
        let path = path.as_ref();
        if !path.join("CURRENT").is_file() {
            return false;
        }
        match rocksdb::DB::open_cf_for_read_only(&rocksdb::Options::default(), path, CF_NAMES, false)
        {
            Ok(db) => {
                let db_name = match db.cf_handle(CF_META) {
                    Some(cf_meta) => db.get_cf(&cf_meta, META_DB_NAME).ok().flatten(),
                    None => None,
                };
                db_name.as_deref() == Some(DB_NAME.as_bytes())
            }
            Err(e) => {
                tracing::debug!("{:?} cannot be opened as a store: {}", path, e);
                false
            }
        }
    }

    /// Only empty directories and previous stores may be replaced.
    fn is_replaceable(path: &Path) -> bool {
        let is_empty_dir = path.is_dir()
            && std::fs::read_dir(path)
                .map(|mut entries| entries.next().is_none())
                .unwrap_or(false);
        is_empty_dir || Self::is_variant_store(path)
    }

    /// Fail unless the opened database carries the store marker.
    fn check_db_name(self) -> Result<Self, IngestError> {
        if self.meta(META_DB_NAME)?.as_deref() == Some(DB_NAME) {
            Ok(self)
        } else {
            Err(IngestError::FileAccess {
                path: self.path.clone(),
                reason: String::from("not a variant store"),
            })
        }
    }

    fn check_exists(path: &Path) -> Result<(), IngestError> {
        if path.join("CURRENT").exists() {
            Ok(())
        } else {
            Err(IngestError::FileAccess {
                path: path.to_path_buf(),
                reason: String::from("no variant store found"),
            })
        }
    }

    /// Path of the store on disk.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn cf(&self, name: &str) -> Result<Arc<rocksdb::BoundColumnFamily<'_>>, IngestError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| IngestError::Store(format!("missing column family {:?}", name)))
    }

    /// Write a bookkeeping value.
    pub fn put_meta(&self, key: &str, value: &str) -> Result<(), IngestError> {
        let cf_meta = self.cf(CF_META)?;
        self.db.put_cf(&cf_meta, key, value)?;
        Ok(())
    }

    /// Read a bookkeeping value.
    pub fn meta(&self, key: &str) -> Result<Option<String>, IngestError> {
        let cf_meta = self.cf(CF_META)?;
        Ok(self
            .db
            .get_cf(&cf_meta, key)?
            .map(|value| String::from_utf8_lossy(&value).into_owned()))
    }

    /// Write a list of serializable values under increasing ordinal keys.
    fn put_list<T: serde::Serialize>(&self, cf_name: &str, values: &[T]) -> Result<(), IngestError> {
        let cf = self.cf(cf_name)?;
        let mut batch = rocksdb::WriteBatch::default();
        for (i, value) in values.iter().enumerate() {
            let json = serde_json::to_vec(value)
                .map_err(|e| IngestError::Store(format!("cannot serialize entry: {}", e)))?;
            batch.put_cf(&cf, (i as u32).to_be_bytes(), json);
        }
        self.db.write(batch)?;
        Ok(())
    }

    /// Read the list written by `put_list`.
    fn list<T: serde::de::DeserializeOwned>(&self, cf_name: &str) -> Result<Vec<T>, IngestError> {
        let cf = self.cf(cf_name)?;
        self.db
            .iterator_cf(&cf, rocksdb::IteratorMode::Start)
            .map(|item| {
                let (_, value) = item?;
                serde_json::from_slice(&value)
                    .map_err(|e| IngestError::Store(format!("corrupt {} entry: {}", cf_name, e)))
            })
            .collect()
    }

    /// Write the header metadata entries.
    pub fn write_metadata(&self, entries: &[HeaderMetadataEntry]) -> Result<(), IngestError> {
        self.put_list(CF_METADATA, entries)
    }

    /// Read the header metadata entries.
    pub fn metadata(&self) -> Result<Vec<HeaderMetadataEntry>, IngestError> {
        self.list(CF_METADATA)
    }

    /// Write the statistics entries.
    pub fn write_stats(&self, rows: &[StatRow]) -> Result<(), IngestError> {
        self.put_list(CF_STATS, rows)
    }

    /// Read the statistics entries.
    pub fn stats(&self) -> Result<Vec<StatRow>, IngestError> {
        self.list(CF_STATS)
    }

    /// Write the column schema of the variant table.
    pub fn write_schema(&self, schema: &DerivedColumnSchema) -> Result<(), IngestError> {
        let cf_schema = self.cf(CF_SCHEMA)?;
        let json = serde_json::to_vec(schema)
            .map_err(|e| IngestError::Store(format!("cannot serialize schema: {}", e)))?;
        self.db.put_cf(&cf_schema, SCHEMA_KEY, json)?;
        Ok(())
    }

    /// Read the column schema of the variant table.
    pub fn schema(&self) -> Result<DerivedColumnSchema, IngestError> {
        let cf_schema = self.cf(CF_SCHEMA)?;
        let json = self
            .db
            .get_cf(&cf_schema, SCHEMA_KEY)?
            .ok_or_else(|| IngestError::Store(String::from("store has no schema")))?;
        serde_json::from_slice(&json)
            .map_err(|e| IngestError::Store(format!("corrupt schema: {}", e)))
    }

    /// Number of rows in the variant table.
    pub fn row_count(&self) -> Result<u64, IngestError> {
        match self.meta(META_ROW_COUNT)? {
            Some(value) => value
                .parse()
                .map_err(|e| IngestError::Store(format!("corrupt row count {:?}: {}", value, e))),
            None => Ok(0),
        }
    }

    /// Append `rows` to the variant table, returning the new row count.
    ///
    /// Every row must have the width of the schema.
    pub fn append_rows(&self, rows: &[Vec<Cell>]) -> Result<u64, IngestError> {
        let cf_df = self.cf(CF_DF)?;
        let first = self.row_count()?;
        let mut batch = rocksdb::WriteBatch::default();
        for (i, row) in rows.iter().enumerate() {
            batch.put_cf(&cf_df, ds::row_key(first + i as u64), ds::row_to_vec(row));
        }
        self.db.write(batch)?;
        let count = first + rows.len() as u64;
        self.put_meta(META_ROW_COUNT, &count.to_string())?;
        Ok(count)
    }

    /// Read the row with the given id.
    pub fn row(&self, row_id: u64) -> Result<Option<Vec<Cell>>, IngestError> {
        let cf_df = self.cf(CF_DF)?;
        self.db
            .get_cf(&cf_df, ds::row_key(row_id))?
            .map(|buf| ds::row_from_vec(&buf))
            .transpose()
    }

    /// Iterate all rows in insertion order.
    pub fn rows(&self) -> Result<Vec<(u64, Vec<Cell>)>, IngestError> {
        let mut result = Vec::new();
        self.for_each_row(|row_id, row| {
            result.push((row_id, row));
            Ok(())
        })?;
        Ok(result)
    }

    /// Call `f` for every row in insertion order, without materializing them.
    pub fn for_each_row<F>(&self, mut f: F) -> Result<(), IngestError>
    where
        F: FnMut(u64, Vec<Cell>) -> Result<(), IngestError>,
    {
        let cf_df = self.cf(CF_DF)?;
        for item in self.db.iterator_cf(&cf_df, rocksdb::IteratorMode::Start) {
            let (key, value) = item?;
            f(ds::row_id_from_key(&key)?, ds::row_from_vec(&value)?)?;
        }
        Ok(())
    }

    /// Positions of the columns of `schema` that get an index.
    fn index_columns(schema: &DerivedColumnSchema) -> Vec<usize> {
        schema
            .columns
            .iter()
            .enumerate()
            .filter(|(_, column)| column.is_indexed())
            .map(|(i, _)| i)
            .collect()
    }

    /// Build the secondary index over the indexed columns of `schema`.
    ///
    /// Returns the number of index entries written.
    pub fn build_index(&self, schema: &DerivedColumnSchema) -> Result<usize, IngestError> {
        let columns = Self::index_columns(schema);

        let cf_index = self.cf(CF_DF_INDEX)?;
        let mut batch = rocksdb::WriteBatch::default();
        let mut count = 0;
        self.for_each_row(|row_id, row| {
            for &i in &columns {
                if let Some(cell) = row.get(i) {
                    batch.put_cf(&cf_index, ds::index_key(i as u32, cell, row_id), b"");
                    count += 1;
                }
            }
            if batch.len() >= BATCH_SIZE {
                self.db.write(std::mem::take(&mut batch))?;
            }
            Ok(())
        })?;
        self.db.write(batch)?;

        let json = serde_json::to_string(&columns)
            .map_err(|e| IngestError::Store(format!("cannot serialize index columns: {}", e)))?;
        self.put_meta(META_INDEXED_COLUMNS, &json)?;
        Ok(count)
    }

    /// Positions of the columns with an index.
    pub fn indexed_columns(&self) -> Result<Vec<usize>, IngestError> {
        match self.meta(META_INDEXED_COLUMNS)? {
            Some(json) => serde_json::from_str(&json)
                .map_err(|e| IngestError::Store(format!("corrupt index columns: {}", e))),
            None => Ok(Vec::new()),
        }
    }

    /// Row ids with `cell` in `column`, using the index.
    pub fn lookup_eq(&self, column: usize, cell: &Cell) -> Result<Vec<u64>, IngestError> {
        let prefix = ds::index_prefix(column as u32, cell);
        self.scan_index(&prefix, |key| key.starts_with(&prefix))
    }

    /// Row ids with a number in `lo..=hi` in `column`, using the index.
    pub fn lookup_range(&self, column: usize, lo: f64, hi: f64) -> Result<Vec<u64>, IngestError> {
        let from = ds::index_prefix(column as u32, &Cell::Number(lo));
        let to = ds::index_prefix(column as u32, &Cell::Number(hi));
        self.scan_index(&from, |key| key.len() >= to.len() && key[..to.len()] <= to[..])
    }

    fn scan_index<F>(&self, from: &[u8], keep_going: F) -> Result<Vec<u64>, IngestError>
    where
        F: Fn(&[u8]) -> bool,
    {
        let cf_index = self.cf(CF_DF_INDEX)?;
        let mut result = Vec::new();
        let iter = self.db.iterator_cf(
            &cf_index,
            rocksdb::IteratorMode::From(from, rocksdb::Direction::Forward),
        );
        for item in iter {
            let (key, _) = item?;
            if !keep_going(&key) {
                break;
            }
            result.push(ds::row_id_from_index_key(&key)?);
        }
        result.sort_unstable();
        Ok(result)
    }

    /// Replace the variant table with `rows`, together with schema and index.
    ///
    /// Everything, including `extra_meta`, goes into one write batch, so a
    /// failure leaves the previous table in place.  Returns the number of
    /// index entries written.
    pub fn replace_table(
        &self,
        schema: &DerivedColumnSchema,
        rows: &[Vec<Cell>],
        extra_meta: &[(&str, &str)],
    ) -> Result<usize, IngestError> {
        let width = schema.columns.len();
        if let Some((i, row)) = rows.iter().enumerate().find(|(_, row)| row.len() != width) {
            return Err(IngestError::Store(format!(
                "row {} has {} cells but the schema has {} columns",
                i,
                row.len(),
                width
            )));
        }
        let columns = Self::index_columns(schema);
        let json_schema = serde_json::to_vec(schema)
            .map_err(|e| IngestError::Store(format!("cannot serialize schema: {}", e)))?;
        let json_columns = serde_json::to_string(&columns)
            .map_err(|e| IngestError::Store(format!("cannot serialize index columns: {}", e)))?;

        let cf_df = self.cf(CF_DF)?;
        let cf_index = self.cf(CF_DF_INDEX)?;
        let cf_schema = self.cf(CF_SCHEMA)?;
        let cf_meta = self.cf(CF_META)?;
        let mut batch = rocksdb::WriteBatch::default();
        // row keys have 8 bytes, index keys start with a small column id
        batch.delete_range_cf(&cf_df, Vec::new(), vec![0xff; 16]);
        batch.delete_range_cf(&cf_index, Vec::new(), vec![0xff; 16]);
        batch.put_cf(&cf_schema, SCHEMA_KEY, json_schema);
        let mut count = 0;
        for (row_id, row) in rows.iter().enumerate() {
            let row_id = row_id as u64;
            batch.put_cf(&cf_df, ds::row_key(row_id), ds::row_to_vec(row));
            for &i in &columns {
                batch.put_cf(&cf_index, ds::index_key(i as u32, &row[i], row_id), b"");
                count += 1;
            }
        }
        batch.put_cf(&cf_meta, META_ROW_COUNT, rows.len().to_string());
        batch.put_cf(&cf_meta, META_INDEXED_COLUMNS, json_columns);
        for &(key, value) in extra_meta {
            batch.put_cf(&cf_meta, key, value);
        }
        self.db.write(batch)?;
        Ok(count)
    }

    /// Force compaction of all column families.
    pub fn compact(&self) -> Result<(), IngestError> {
        rocksdb_utils_lookup::force_compaction_cf(&self.db, CF_NAMES, Some("  "), true)
            .map_err(|e| IngestError::Store(format!("problem compacting store: {}", e)))
    }
}
