//! Management command handler.
//!
//! The SQL surface lives in the database proper; this handler exposes the
//! foreign-storage operations that make sense over the wire: refreshing
//! tables, inspecting metadata, and reading cache counters.

use crate::connection::RequestHandler;
use bytes::Bytes;
use std::collections::BTreeMap;
use std::sync::Arc;
use strata_catalog::Catalog;
use strata_common::ChunkMetadataVector;
use strata_foreign::{refresh_foreign_tables, ForeignStorageMgr};
use tracing::warn;

pub struct StorageService {
    catalog: Arc<Catalog>,
    mgr: Arc<ForeignStorageMgr>,
}

impl StorageService {
    pub fn new(catalog: Arc<Catalog>, mgr: Arc<ForeignStorageMgr>) -> Arc<Self> {
        Arc::new(Self { catalog, mgr })
    }

    fn refresh(&self, args: &[&str]) -> anyhow::Result<Vec<String>> {
        let mut options: BTreeMap<String, String> = BTreeMap::new();
        let mut tables: Vec<String> = Vec::new();
        for arg in args {
            match arg.split_once('=') {
                Some((key, value)) => {
                    options.insert(key.trim().to_string(), value.trim().to_string());
                }
                None => tables.push(arg.trim_matches(',').to_string()),
            }
        }
        if tables.is_empty() {
            anyhow::bail!("refresh requires at least one table name");
        }
        refresh_foreign_tables(&self.catalog, &self.mgr, &tables, &options)?;
        Ok(vec![format!("refreshed {} table(s)", tables.len())])
    }

    fn metadata(&self, table_name: &str) -> anyhow::Result<Vec<String>> {
        let table = self.catalog.foreign_table_by_name(table_name)?;
        let mut metadata = ChunkMetadataVector::new();
        self.mgr
            .get_chunk_metadata_vec_for_key_prefix(&mut metadata, &table.table_key())?;
        let mut lines = vec![format!("{} chunk(s)", metadata.len())];
        for (key, meta) in &metadata {
            lines.push(format!(
                "{key} rows={} bytes={} nulls={}",
                meta.num_rows, meta.num_bytes, meta.stats.null_count
            ));
        }
        Ok(lines)
    }

    fn tables(&self) -> Vec<String> {
        let mut lines = Vec::new();
        self.catalog.for_each_table(|table| {
            lines.push(format!(
                "{} id={} path={}",
                table.name,
                table.id,
                table.file_path.display()
            ));
        });
        if lines.is_empty() {
            lines.push("no foreign tables".to_string());
        }
        lines
    }

    fn stats(&self) -> Vec<String> {
        match self.mgr.cache() {
            Some(cache) => vec![
                format!("cached_metadata={}", cache.num_cached_metadata()),
                format!("cached_chunks={}", cache.num_cached_chunks()),
                format!("metadata_added={}", cache.num_metadata_added()),
                format!("chunks_added={}", cache.num_chunks_added()),
            ],
            None => vec!["cache disabled".to_string()],
        }
    }

    fn dispatch(&self, request: &str) -> anyhow::Result<Vec<String>> {
        let mut parts = request.split_whitespace();
        let command = parts.next().unwrap_or("").to_ascii_lowercase();
        let args: Vec<&str> = parts.collect();
        match command.as_str() {
            "refresh" => self.refresh(&args),
            "metadata" => match args.as_slice() {
                [table_name] => self.metadata(table_name),
                _ => anyhow::bail!("usage: metadata <table>"),
            },
            "tables" => Ok(self.tables()),
            "stats" => Ok(self.stats()),
            other => anyhow::bail!("unknown command \"{other}\""),
        }
    }
}

impl RequestHandler for StorageService {
    fn handle_request(&self, request: &str) -> Vec<Bytes> {
        match self.dispatch(request) {
            Ok(lines) => lines.into_iter().map(Bytes::from).collect(),
            Err(e) => {
                warn!("request \"{request}\" failed: {e}");
                vec![Bytes::from(format!("ERROR: {e}"))]
            }
        }
    }
}
