//! File-backed node registry.
//!
//! One bincode-encoded [`NodeRecord`] per node, stored as
//! `<dir>/<node_name>.node`. Suitable for a cluster whose nodes share a
//! filesystem; writes go through a temporary file and a rename so readers
//! never see a torn record.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs;
use tracing::{debug, error, warn};

use nodemesh_proto::error::{PeerError, PeerResult};
use nodemesh_proto::node::{now_millis, NodeRecord};

use crate::registry::NodeRegistry;

const RECORD_EXT: &str = "node";

/// Registry stored as a directory of record files.
pub struct FileRegistry {
    dir: PathBuf,
}

impl FileRegistry {
    /// Open (creating if needed) the registry directory.
    pub async fn open(dir: impl Into<PathBuf>) -> PeerResult<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).await.map_err(|e| {
            error!("registry: failed to create {}: {}", dir.display(), e);
            PeerError::Persistence(e.to_string())
        })?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn record_path(&self, node_name: &str) -> PeerResult<PathBuf> {
        if node_name.is_empty()
            || node_name.contains(['/', '\\'])
            || node_name.starts_with('.')
        {
            return Err(PeerError::InvalidParms);
        }
        Ok(self.dir.join(format!("{}.{}", node_name, RECORD_EXT)))
    }

    async fn read_record(path: &Path) -> PeerResult<NodeRecord> {
        let data = fs::read(path)
            .await
            .map_err(|e| PeerError::Persistence(e.to_string()))?;
        bincode::deserialize(&data).map_err(|_| {
            error!("registry: corrupt record file: {}", path.display());
            PeerError::Persistence(format!("corrupt record {}", path.display()))
        })
    }

    async fn write_record(&self, record: &NodeRecord) -> PeerResult<()> {
        let path = self.record_path(&record.node_name)?;
        let tmp = path.with_extension("tmp");
        let data = bincode::serialize(record)?;
        fs::write(&tmp, &data).await.map_err(|e| {
            error!("registry: failed to write {}: {}", tmp.display(), e);
            PeerError::Persistence(e.to_string())
        })?;
        fs::rename(&tmp, &path)
            .await
            .map_err(|e| PeerError::Persistence(e.to_string()))?;
        debug!("registry: saved {}", record);
        Ok(())
    }
}

#[async_trait]
impl NodeRegistry for FileRegistry {
    fn name(&self) -> &str {
        "file"
    }

    async fn upsert_node(&self, record: &NodeRecord) -> PeerResult<()> {
        self.write_record(record).await
    }

    async fn heartbeat(&self, node_name: &str) -> PeerResult<bool> {
        let path = self.record_path(node_name)?;
        if !path.exists() {
            return Ok(false);
        }
        let mut record = Self::read_record(&path).await?;
        record.last_updated = now_millis();
        self.write_record(&record).await?;
        Ok(true)
    }

    async fn load_all_nodes(&self) -> PeerResult<Vec<NodeRecord>> {
        let mut records = Vec::new();
        let mut entries = fs::read_dir(&self.dir)
            .await
            .map_err(|e| PeerError::Persistence(e.to_string()))?;
        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(RECORD_EXT) {
                continue;
            }
            match Self::read_record(&path).await {
                Ok(rec) => records.push(rec),
                // One bad file must not hide every other node.
                Err(e) => warn!("registry: skipping {}: {}", path.display(), e),
            }
        }
        records.sort_by(|a, b| a.node_name.cmp(&b.node_name));
        Ok(records)
    }

    async fn delete_node(&self, node_name: &str) -> PeerResult<()> {
        let path = self.record_path(node_name)?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(PeerError::Persistence(e.to_string())),
        }
    }
}
