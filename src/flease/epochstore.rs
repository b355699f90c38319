//! Durable master-epoch store backed by an append-only record file.

use std::collections::HashMap;
use std::io::SeekFrom;
use std::path::Path;
use std::sync::{Arc, Mutex};

use crate::flease::{CellId, FleaseMessage, MasterEpochHandler};
use crate::utils::{FleaseError, MAX_FRAME_LEN};

use async_trait::async_trait;

use serde::{Deserialize, Serialize};

use rmp_serde::decode::from_slice as decode_from_slice;
use rmp_serde::encode::to_vec as encode_to_vec;

use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

/// One durable record: the latest epoch of a cell at the time of writing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct EpochRecord {
    cell: CellId,
    epoch: i64,
}

type StoreAck = oneshot::Sender<Result<(), FleaseError>>;

/// Latest epochs as of the last synced record.
type EpochMap = Arc<Mutex<HashMap<CellId, i64>>>;

/// `MasterEpochHandler` persisting epochs in a file of length-prefixed
/// records (8-byte big-endian length, then the rmp-serde payload). The file
/// is replayed on open; every store is appended and synced by a dedicated
/// logger task before it is acknowledged.
pub struct FileEpochStore {
    epochs: EpochMap,

    /// Sender side of the log channel.
    tx_log: mpsc::UnboundedSender<(EpochRecord, StoreAck)>,

    /// Join handle of the logger task.
    _logger_handle: JoinHandle<()>,
}

impl FileEpochStore {
    /// Opens (creating if missing) the record file at `path`, replays it,
    /// and spawns the logger task.
    pub async fn new_and_setup(path: &Path) -> Result<Self, FleaseError> {
        let mut backer_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)
            .await?;

        let mut epochs = HashMap::new();
        let (num_records, valid_end) =
            Self::replay(&mut backer_file, &mut epochs).await?;
        let file_size = backer_file.metadata().await?.len();
        if valid_end < file_size {
            pf_warn!(
                "epoch file '{}' has a torn tail at {}, truncating {} bytes",
                path.display(),
                valid_end,
                file_size - valid_end
            );
            backer_file.set_len(valid_end).await?;
            backer_file.sync_all().await?;
        }
        backer_file.seek(SeekFrom::End(0)).await?;
        pf_info!(
            "epoch file '{}' replayed: {} records, {} cells",
            path.display(),
            num_records,
            epochs.len()
        );

        let epochs = Arc::new(Mutex::new(epochs));
        let (tx_log, rx_log) = mpsc::unbounded_channel();
        let logger_handle =
            tokio::spawn(Self::logger_task(backer_file, rx_log, epochs.clone()));

        Ok(FileEpochStore {
            epochs,
            tx_log,
            _logger_handle: logger_handle,
        })
    }

    /// Latest durably stored epoch of a cell.
    pub fn epoch_of(&self, cell: &CellId) -> Option<i64> {
        let epochs = match self.epochs.lock() {
            Ok(epochs) => epochs,
            Err(poisoned) => poisoned.into_inner(),
        };
        epochs.get(cell).copied()
    }

    /// Reads records from the start of the file. Returns the number of
    /// complete records and the offset right after the last one.
    async fn replay(
        backer: &mut File,
        epochs: &mut HashMap<CellId, i64>,
    ) -> Result<(usize, u64), FleaseError> {
        let file_size = backer.metadata().await?.len();
        backer.seek(SeekFrom::Start(0)).await?;

        let mut offset = 0;
        let mut num_records = 0;
        while offset + 8 <= file_size {
            let record_len = backer.read_u64().await?;
            if record_len > MAX_FRAME_LEN as u64 {
                pf_warn!("oversized epoch record at {}: {}", offset, record_len);
                break;
            }
            let offset_e = match (offset + 8).checked_add(record_len) {
                Some(end) if end <= file_size => end,
                _ => break,
            };
            let mut record_buf: Vec<u8> = vec![0; record_len as usize];
            backer.read_exact(&mut record_buf[..]).await?;
            let record: EpochRecord = match decode_from_slice(&record_buf) {
                Ok(record) => record,
                Err(e) => {
                    pf_warn!("undecodable epoch record at {}: {}", offset, e);
                    break;
                }
            };
            epochs.insert(record.cell, record.epoch);
            num_records += 1;
            offset = offset_e;
        }
        Ok((num_records, offset))
    }

    async fn append_record(
        backer: &mut File,
        record: &EpochRecord,
    ) -> Result<(), FleaseError> {
        let record_bytes = encode_to_vec(record)?;
        // length header first, then content
        backer.write_u64(record_bytes.len() as u64).await?;
        backer.write_all(&record_bytes[..]).await?;
        backer.sync_data().await?;
        Ok(())
    }

    /// Logger task function.
    async fn logger_task(
        mut backer: File,
        mut rx_log: mpsc::UnboundedReceiver<(EpochRecord, StoreAck)>,
        epochs: EpochMap,
    ) {
        pf_debug!("epoch logger task spawned");

        while let Some((record, tx_ack)) = rx_log.recv().await {
            let result = Self::append_record(&mut backer, &record).await;
            match &result {
                Ok(()) => {
                    let mut epochs = match epochs.lock() {
                        Ok(epochs) => epochs,
                        Err(poisoned) => poisoned.into_inner(),
                    };
                    epochs.insert(record.cell, record.epoch);
                }
                Err(e) => pf_error!("error appending epoch record: {}", e),
            }
            let _ = tx_ack.send(result);
        }

        pf_debug!("epoch logger task exited");
    }
}

#[async_trait]
impl MasterEpochHandler for FileEpochStore {
    async fn send_master_epoch(
        &self,
        reply: &mut FleaseMessage,
    ) -> Result<(), FleaseError> {
        reply.master_epoch = self.epoch_of(&reply.cell).unwrap_or(0);
        Ok(())
    }

    async fn store_master_epoch(
        &self,
        reply: &FleaseMessage,
    ) -> Result<(), FleaseError> {
        let (tx_ack, rx_ack) = oneshot::channel();
        let record = EpochRecord {
            cell: reply.cell.clone(),
            epoch: reply.master_epoch,
        };
        self.tx_log.send((record, tx_ack))?;
        rx_ack.await?
    }
}
