//! JSON-lines object storage on the local filesystem
//!
//! Every write becomes one immutable object `<table>/<millis>-<uuid>.jsonl`
//! under the configured directory. Objects appear atomically: they are
//! written to a temporary name first and renamed into place.
//!
//! ```toml
//! [destinations.archive]
//! type = "file"
//! [destinations.archive.file]
//! path = "/var/lib/event-relay/archive"
//! ```

use super::adapter::{AdapterContext, AdapterError, AdapterFuture, DestinationAdapter};
use crate::event::ProcessedRow;
use crate::queue::escape_name;
use std::collections::BTreeMap;
use std::io::Result as IoResult;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::debug;

pub const FILE_TYPE: &str = "file";

#[derive(Debug, Clone)]
pub struct FileAdapter {
    base_path: PathBuf,
}

impl FileAdapter {
    pub fn new(base_path: PathBuf) -> IoResult<Self> {
        std::fs::create_dir_all(&base_path)?;
        Ok(FileAdapter { base_path })
    }

    /// Build from `[destinations.<name>.file] path = ...`
    pub fn from_context(ctx: &AdapterContext) -> Result<Self, AdapterError> {
        let path = ctx
            .connection_block()
            .and_then(|block| block.get("path"))
            .and_then(|path| path.as_str())
            .filter(|path| !path.trim().is_empty())
            .ok_or_else(|| {
                AdapterError::permanent(format!(
                    "destination [{}] requires a '{}.path' setting",
                    ctx.name, ctx.destination_type
                ))
            })?;
        Ok(FileAdapter::new(PathBuf::from(path))?)
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    fn table_dir(&self, table: &str) -> PathBuf {
        self.base_path.join(escape_name(table))
    }

    /// Every row stored for a table, oldest object first
    pub fn read_table(&self, table: &str) -> IoResult<Vec<serde_json::Value>> {
        let dir = self.table_dir(table);
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut objects: Vec<PathBuf> = std::fs::read_dir(&dir)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| path.extension().is_some_and(|ext| ext == "jsonl"))
            .collect();
        objects.sort();

        let mut rows = Vec::new();
        for object in objects {
            let data = std::fs::read_to_string(&object)?;
            for line in data.lines().filter(|l| !l.is_empty()) {
                let row = serde_json::from_str(line)
                    .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
                rows.push(row);
            }
        }
        Ok(rows)
    }

    async fn put_object(&self, table: &str, body: Vec<u8>) -> Result<(), AdapterError> {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or(0);
        let dir = self.table_dir(table);
        tokio::fs::create_dir_all(&dir).await?;

        let key = format!("{:016}-{}", millis, uuid::Uuid::new_v4());
        let temp = dir.join(format!("{}.tmp", key));
        let path = dir.join(format!("{}.jsonl", key));
        tokio::fs::write(&temp, &body).await?;
        tokio::fs::rename(&temp, &path).await?;

        debug!(path = %path.display(), bytes = body.len(), "wrote object");
        Ok(())
    }
}

impl DestinationAdapter for FileAdapter {
    fn type_name(&self) -> &str {
        FILE_TYPE
    }

    fn write<'a>(&'a self, rows: &'a [ProcessedRow]) -> AdapterFuture<'a> {
        Box::pin(async move {
            let mut tables: BTreeMap<&str, Vec<u8>> = BTreeMap::new();
            for row in rows {
                let body = tables.entry(row.table.as_str()).or_default();
                serde_json::to_writer(&mut *body, &row.to_json())
                    .map_err(|e| AdapterError::permanent(e.to_string()))?;
                body.push(b'\n');
            }
            for (table, body) in tables {
                self.put_object(table, body).await?;
            }
            Ok(())
        })
    }
}
