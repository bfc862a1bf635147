//! Durable key-value storage backed by an append-only log file.

use std::collections::HashMap;
use std::fmt;
use std::io::SeekFrom;
use std::path::Path;

use crate::utils::QuorumKvError;

use serde::{de::DeserializeOwned, Serialize};

use rmp_serde::decode::from_slice as decode_from_slice;
use rmp_serde::encode::to_vec as encode_to_vec;

use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Mutex;

/// Log record type: a whole-value overwrite of one key.
type LogRecord<V> = (String, V);

/// Backing file plus the in-memory image replayed from it.
struct StoreInner<V> {
    backer: File,
    map: HashMap<String, V>,
}

/// Crash-durable key -> value map. Every `put` appends a length-prefixed
/// record and syncs it before the in-memory image changes, so a failed
/// persist is never visible to readers.
pub struct DurableKvStore<V> {
    /// Logging prefix of the owning node.
    prefix: String,

    inner: Mutex<StoreInner<V>>,
}

impl<V> DurableKvStore<V>
where
    V: fmt::Debug + Clone + Serialize + DeserializeOwned + Send + Sync,
{
    /// Opens (or creates) the backing log file at `path` and replays all
    /// whole records in it. A torn record at the tail is cut off.
    pub async fn open(
        prefix: impl ToString,
        path: &Path,
    ) -> Result<Self, QuorumKvError> {
        let prefix = prefix.to_string();
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir).await?;
        }
        if !fs::try_exists(path).await? {
            File::create(path).await?;
            pf_info!(prefix; "created backer file '{}'", path.display());
        } else {
            pf_info!(prefix; "backer file '{}' already exists", path.display());
        }

        // append mode, so that a stale process instance sharing the same
        // directory can never overwrite records written by a newer one
        let mut backer =
            OpenOptions::new().read(true).append(true).open(path).await?;
        let file_size = backer.metadata().await?.len();

        let mut map = HashMap::new();
        let mut offset = 0;
        while let Some((record, end_offset)) =
            Self::read_record(&prefix, &mut backer, file_size, offset).await?
        {
            let (key, value): LogRecord<V> = record;
            map.insert(key, value);
            offset = end_offset;
        }
        if offset < file_size {
            pf_warn!(
                prefix;
                "discarding torn tail of '{}' at offset {}",
                path.display(),
                offset
            );
            backer.set_len(offset).await?;
            backer.sync_all().await?;
        }
        backer.seek(SeekFrom::End(0)).await?; // seek to EOF

        pf_debug!(prefix; "replayed {} keys from '{}'", map.len(), path.display());
        Ok(DurableKvStore {
            prefix,
            inner: Mutex::new(StoreInner { backer, map }),
        })
    }

    /// Gets the current value of a key, if any.
    pub async fn get(&self, key: &str) -> Option<V> {
        self.inner.lock().await.map.get(key).cloned()
    }

    /// Durably overwrites the value of a key.
    pub async fn put(&self, key: &str, value: V) -> Result<(), QuorumKvError> {
        let record: LogRecord<V> = (key.to_string(), value);
        let record_bytes = encode_to_vec(&record)?;

        let mut inner = self.inner.lock().await;
        let start = inner.backer.metadata().await?.len();
        let res = async {
            inner.backer.write_u64(record_bytes.len() as u64).await?;
            inner.backer.write_all(&record_bytes[..]).await?;
            inner.backer.sync_data().await?;
            Ok::<(), QuorumKvError>(())
        }
        .await;

        if let Err(e) = res {
            // cut off whatever part made it to the file
            pf_error!(self.prefix; "error persisting key '{}': {}", key, e);
            if let Err(te) = inner.backer.set_len(start).await {
                pf_error!(self.prefix; "error truncating torn record: {}", te);
            }
            let _ = inner.backer.seek(SeekFrom::End(0)).await;
            return Err(e);
        }

        let (key, value) = record;
        inner.map.insert(key, value);
        Ok(())
    }

    /// Returns a snapshot of all current entries.
    pub async fn all_entries(&self) -> Vec<(String, V)> {
        self.inner
            .lock()
            .await
            .map
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Reads out the record at given offset. Returns `None` at EOF or if the
    /// remaining bytes do not hold a whole record.
    async fn read_record(
        prefix: &str,
        backer: &mut File,
        file_size: u64,
        offset: u64,
    ) -> Result<Option<(LogRecord<V>, u64)>, QuorumKvError> {
        if file_size.saturating_sub(offset) < 8 {
            return Ok(None);
        }

        // read record length header; a corrupt one may claim any length
        backer.seek(SeekFrom::Start(offset)).await?;
        let record_len = backer.read_u64().await?;
        let offset_e = match (offset + 8).checked_add(record_len) {
            Some(offset_e) if offset_e <= file_size => offset_e,
            _ => {
                pf_warn!(prefix; "read record invalid length {}", record_len);
                return Ok(None);
            }
        };

        // read record content
        let mut record_buf: Vec<u8> = vec![0; record_len as usize];
        backer.read_exact(&mut record_buf[..]).await?;
        match decode_from_slice(&record_buf) {
            Ok(record) => Ok(Some((record, offset_e))),
            Err(e) => {
                pf_warn!(prefix; "undecodable record at {}: {}", offset, e);
                Ok(None)
            }
        }
    }
}
