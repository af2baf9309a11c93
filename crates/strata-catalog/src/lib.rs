//! In-process catalog of foreign tables.
//!
//! The catalog persists table definitions and foreign-server options for
//! the rest of the subsystem: the manager asks it which wrapper to build
//! for a table, the refresh engine reads the append/refresh options, and
//! the scheduler reads and writes the refresh bookkeeping.

pub mod options;

use options::{RefreshOptions, RefreshTimingType, RefreshUpdateType};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use strata_common::{ChunkKey, Error, Result, TableSchema};

/// Which data wrapper serves a foreign table
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DataWrapperType {
    /// Delimited text files (optionally gzipped, in directories or archives)
    Delimited,
    /// Self-describing columnar binary files
    Columnar,
}

/// Refresh bookkeeping updated on every refresh of a table
#[derive(Clone, Copy, Debug, Default)]
pub struct RefreshTimes {
    /// Epoch seconds of the last completed refresh command
    pub last_refresh_time: Option<i64>,
    /// Epoch seconds of the next scheduled refresh; absent once retired
    pub next_refresh_time: Option<i64>,
}

/// One foreign table as recorded by the catalog
#[derive(Debug)]
pub struct ForeignTable {
    pub db_id: i32,
    pub id: i32,
    pub name: String,
    pub schema: TableSchema,
    pub wrapper_type: DataWrapperType,
    /// Source location: file, directory, or archive
    pub file_path: PathBuf,
    /// Rows per fragment
    pub fragment_size: u64,
    pub refresh: RefreshOptions,
    times: Mutex<RefreshTimes>,
}

impl ForeignTable {
    pub fn is_append_mode(&self) -> bool {
        self.refresh.update_type == RefreshUpdateType::Append
    }

    pub fn is_scheduled(&self) -> bool {
        self.refresh.timing_type == RefreshTimingType::Scheduled
    }

    pub fn table_key(&self) -> ChunkKey {
        ChunkKey::table(self.db_id, self.id)
    }

    pub fn refresh_times(&self) -> RefreshTimes {
        *self.times.lock()
    }

    pub fn set_last_refresh_time(&self, when: i64) {
        self.times.lock().last_refresh_time = Some(when);
    }

    pub fn set_next_refresh_time(&self, when: Option<i64>) {
        self.times.lock().next_refresh_time = when;
    }
}

#[derive(Default)]
struct CatalogState {
    by_id: BTreeMap<i32, Arc<ForeignTable>>,
    by_name: HashMap<String, i32>,
    next_table_id: i32,
}

/// The catalog for one database
pub struct Catalog {
    db_id: i32,
    state: RwLock<CatalogState>,
}

impl Catalog {
    pub fn new(db_id: i32) -> Arc<Self> {
        Arc::new(Self {
            db_id,
            state: RwLock::new(CatalogState {
                next_table_id: 1,
                ..CatalogState::default()
            }),
        })
    }

    pub fn db_id(&self) -> i32 {
        self.db_id
    }

    /// Register a foreign table. `options` is the normalized WITH-clause
    /// map; refresh options are validated here, at CREATE time.
    pub fn create_foreign_table(
        &self,
        name: &str,
        schema: TableSchema,
        wrapper_type: DataWrapperType,
        table_options: &BTreeMap<String, String>,
    ) -> Result<Arc<ForeignTable>> {
        let file_path = table_options
            .get(options::FILE_PATH_KEY)
            .map(PathBuf::from)
            .ok_or_else(|| Error::MissingTableOption {
                option: options::FILE_PATH_KEY.to_string(),
                table: name.to_string(),
            })?;
        let fragment_size = match table_options.get(options::FRAGMENT_SIZE_KEY) {
            Some(value) => value.parse::<u64>().map_err(|_| {
                Error::internal(format!("invalid fragment_size \"{value}\" for table {name}"))
            })?,
            None => options::DEFAULT_FRAGMENT_SIZE,
        };
        let refresh = options::parse_refresh_options(table_options)?;
        let next_refresh_time = refresh.start_date_time;

        let mut state = self.state.write();
        if state.by_name.contains_key(name) {
            return Err(Error::internal(format!(
                "foreign table \"{name}\" already exists"
            )));
        }
        let id = state.next_table_id;
        state.next_table_id += 1;

        let table = Arc::new(ForeignTable {
            db_id: self.db_id,
            id,
            name: name.to_string(),
            schema,
            wrapper_type,
            file_path,
            fragment_size,
            refresh,
            times: Mutex::new(RefreshTimes {
                last_refresh_time: None,
                next_refresh_time,
            }),
        });
        state.by_id.insert(id, Arc::clone(&table));
        state.by_name.insert(name.to_string(), id);
        Ok(table)
    }

    /// Remove a table definition; returns the dropped record so the caller
    /// can release wrapper and cache state for it.
    pub fn drop_foreign_table(&self, name: &str) -> Result<Arc<ForeignTable>> {
        let mut state = self.state.write();
        let id = state
            .by_name
            .remove(name)
            .ok_or_else(|| Error::TableNotFound {
                name: name.to_string(),
            })?;
        let table = state
            .by_id
            .remove(&id)
            .expect("name and id maps stay in sync");
        Ok(table)
    }

    pub fn get_foreign_table(&self, db_id: i32, table_id: i32) -> Result<Arc<ForeignTable>> {
        if db_id != self.db_id {
            return Err(Error::internal(format!(
                "catalog serves db {} but table ({db_id}, {table_id}) was requested",
                self.db_id
            )));
        }
        self.state
            .read()
            .by_id
            .get(&table_id)
            .cloned()
            .ok_or_else(|| Error::TableNotFound {
                name: format!("({db_id}, {table_id})"),
            })
    }

    pub fn foreign_table_by_name(&self, name: &str) -> Result<Arc<ForeignTable>> {
        let state = self.state.read();
        let id = state.by_name.get(name).ok_or_else(|| Error::TableNotFound {
            name: name.to_string(),
        })?;
        Ok(Arc::clone(&state.by_id[id]))
    }

    pub fn for_each_table(&self, mut f: impl FnMut(&Arc<ForeignTable>)) {
        for table in self.state.read().by_id.values() {
            f(table);
        }
    }
}
