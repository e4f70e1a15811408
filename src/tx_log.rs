use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::PathBuf;

use crossbeam_skiplist::SkipMap;
use log::{debug, warn};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::errors::{Result, ServalError};
use crate::tx_entry::{Ts, TupleRef, TxEntry, TxState};

const TX_LOG_HEAD_SIG: u32 = 0xA5A5_F0F0;
const TX_LOG_TAIL_SIG: u32 = 0xF0F0_A5A5;
/// Default chunk size: 1 GiB.
pub const TXLOG_CHUNK_SIZE: u64 = 1024 * 1024 * 1024;

/// The persisted image of a commit intent's state transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TxRecord {
    pub cts: Ts,
    pub tx_state: TxState,
    pub sender_peer_id: u64,
    pub shard_set: Vec<u64>,
    pub read_set: Vec<TupleRef>,
    pub write_set: Vec<TupleRef>,
}

impl TxRecord {
    pub fn from_entry(tx: &TxEntry) -> Self {
        Self {
            cts: tx.cts(),
            tx_state: tx.tx_state(),
            sender_peer_id: tx.sender_peer_id,
            shard_set: tx.shard_set.clone(),
            read_set: tx.read_set.clone(),
            write_set: tx.write_set.clone(),
        }
    }
}

struct LogTail {
    chunk_no: u64,
    offset: u64,
    file: Option<File>,
    /// Highest CTS recorded per chunk, for low-water trimming.
    chunk_max: std::collections::HashMap<u64, Ts>,
}

/// Durable append-only log of commit-intent state transitions.
///
/// Records are framed `{head-sig, length, payload, tail-sig}` and padded to
/// an 8-byte boundary; chunks are fixed-size files `n.log` under the log
/// directory. On restart the log is rescanned from the oldest chunk; a
/// record with a missing tail signature ends the scan and the torn bytes
/// are overwritten by subsequent appends.
pub struct TxLog {
    dir: PathBuf,
    chunk_size: u64,
    tail: Mutex<LogTail>,
    // Last recorded state per CTS; SkipMap keeps the pending iteration in
    // CTS order.
    index: SkipMap<Ts, TxRecord>,
}

impl TxLog {
    /// Opens (or creates) the log directory for appending, recovering any
    /// existing chunks first.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        Self::with_chunk_size(dir, TXLOG_CHUNK_SIZE)
    }

    pub fn with_chunk_size(dir: impl Into<PathBuf>, chunk_size: u64) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        let log = Self {
            dir,
            chunk_size,
            tail: Mutex::new(LogTail {
                chunk_no: 0,
                offset: 0,
                file: None,
                chunk_max: std::collections::HashMap::new(),
            }),
            index: SkipMap::new(),
        };
        log.recover()?;
        Ok(log)
    }

    /// Records the entry's current state. PENDING at intake, COMMIT or
    /// ABORT at conclusion.
    pub fn append(&self, tx: &TxEntry) -> Result<()> {
        let record = TxRecord::from_entry(tx);
        self.append_record(record)
    }

    fn append_record(&self, record: TxRecord) -> Result<()> {
        let payload = bincode::serialize(&record)
            .map_err(|e| ServalError::Serialization(e.to_string()))?;
        let framed = frame(&payload);
        if framed.len() as u64 > self.chunk_size {
            return Err(ServalError::Serialization(format!(
                "record of {} bytes exceeds chunk size {}",
                framed.len(),
                self.chunk_size
            )));
        }

        let mut tail = self.tail.lock();
        if tail.file.is_none() || tail.offset + framed.len() as u64 > self.chunk_size {
            if tail.file.is_some() {
                tail.chunk_no += 1;
            }
            let file = self.create_chunk(tail.chunk_no)?;
            tail.file = Some(file);
            tail.offset = 0;
        }
        let offset = tail.offset;
        let file = tail.file.as_mut().expect("chunk file just ensured");
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(&framed)?;
        file.sync_data()?;
        tail.offset += framed.len() as u64;
        let chunk_no = tail.chunk_no;
        let max = tail.chunk_max.entry(chunk_no).or_insert(0);
        *max = (*max).max(record.cts);
        drop(tail);

        self.index.insert(record.cts, record);
        Ok(())
    }

    /// The last recorded state for `cts`, if still retained.
    pub fn get_tx_state(&self, cts: Ts) -> Option<TxState> {
        self.index.get(&cts).map(|e| e.value().tx_state)
    }

    /// The earliest CI whose last recorded state is PENDING.
    pub fn first_pending(&self) -> Option<TxRecord> {
        self.index
            .iter()
            .find(|e| e.value().tx_state == TxState::Pending)
            .map(|e| e.value().clone())
    }

    /// The next PENDING CI after `cts`, in CTS order.
    pub fn next_pending(&self, cts: Ts) -> Option<TxRecord> {
        self.index
            .range((std::ops::Bound::Excluded(cts), std::ops::Bound::Unbounded))
            .find(|e| e.value().tx_state == TxState::Pending)
            .map(|e| e.value().clone())
    }

    /// Total bytes appended, across chunks.
    pub fn size(&self) -> u64 {
        let tail = self.tail.lock();
        tail.chunk_no * self.chunk_size + tail.offset
    }

    /// Reclaims whole chunks entirely below the byte offset. Callers invoke
    /// this once all peers confirmed the covered CIs are concluded
    /// cluster-wide.
    pub fn trim(&self, offset: u64) -> Result<()> {
        let keep_from_chunk = offset / self.chunk_size;
        let tail = self.tail.lock();
        for chunk_no in 0..keep_from_chunk.min(tail.chunk_no) {
            let path = self.chunk_path(chunk_no);
            if path.exists() {
                fs::remove_file(&path)?;
                debug!("trimmed tx log chunk {}", chunk_no);
            }
        }
        Ok(())
    }

    /// Reclaims sealed chunks whose every record carries a CTS below the
    /// low-water mark, i.e. whose CIs have all concluded cluster-wide.
    pub fn trim_below_cts(&self, low_water: Ts) -> Result<usize> {
        let mut tail = self.tail.lock();
        let current = tail.chunk_no;
        let trimmable: Vec<u64> = tail
            .chunk_max
            .iter()
            .filter(|&(&chunk, &max)| chunk < current && max < low_water)
            .map(|(&chunk, _)| chunk)
            .collect();
        for chunk_no in &trimmable {
            let path = self.chunk_path(*chunk_no);
            if path.exists() {
                fs::remove_file(&path)?;
            }
            tail.chunk_max.remove(chunk_no);
            debug!("trimmed tx log chunk {} below cts {}", chunk_no, low_water);
        }
        Ok(trimmable.len())
    }

    /// Re-records `cts` as CONFLICT after a contradictory late peer
    /// decision.
    pub fn record_conflict(&self, cts: Ts) -> Result<bool> {
        let Some(record) = self.index.get(&cts).map(|e| e.value().clone()) else {
            return Ok(false);
        };
        let mut record = record;
        record.tx_state = TxState::Conflict;
        self.append_record(record)?;
        Ok(true)
    }

    /// Removes every chunk file and resets the log.
    pub fn clear(&self) -> Result<()> {
        let mut tail = self.tail.lock();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().is_some_and(|e| e == "log") {
                fs::remove_file(path)?;
            }
        }
        tail.chunk_no = 0;
        tail.offset = 0;
        tail.file = None;
        tail.chunk_max.clear();
        drop(tail);
        while self.index.pop_front().is_some() {}
        Ok(())
    }

    fn chunk_path(&self, chunk_no: u64) -> PathBuf {
        self.dir.join(format!("{chunk_no}.log"))
    }

    fn create_chunk(&self, chunk_no: u64) -> Result<File> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(self.chunk_path(chunk_no))?;
        file.set_len(self.chunk_size)?;
        Ok(file)
    }

    /// Scans existing chunks oldest-first, rebuilding the state index and
    /// positioning the append tail after the last intact record.
    fn recover(&self) -> Result<()> {
        let mut chunk_nos: Vec<u64> = fs::read_dir(&self.dir)?
            .filter_map(|e| e.ok())
            .filter_map(|e| {
                e.path()
                    .file_stem()
                    .and_then(|s| s.to_str())
                    .and_then(|s| s.parse().ok())
            })
            .collect();
        chunk_nos.sort_unstable();
        if chunk_nos.is_empty() {
            return Ok(());
        }

        let mut tail = self.tail.lock();
        for &chunk_no in &chunk_nos {
            let mut file = OpenOptions::new()
                .read(true)
                .write(true)
                .open(self.chunk_path(chunk_no))?;
            let mut buf = Vec::new();
            file.read_to_end(&mut buf)?;

            let mut offset = 0usize;
            while let Some((record, consumed)) = read_record(buf.get(offset..).unwrap_or(&[])) {
                let max = tail.chunk_max.entry(chunk_no).or_insert(0);
                *max = (*max).max(record.cts);
                self.index.insert(record.cts, record);
                offset += consumed;
            }
            tail.chunk_no = chunk_no;
            tail.offset = offset as u64;
            tail.file = Some(file);
        }
        debug!(
            "tx log recovered: {} entries, tail at chunk {} offset {}",
            self.index.len(),
            tail.chunk_no,
            tail.offset
        );
        Ok(())
    }
}

fn frame(payload: &[u8]) -> Vec<u8> {
    let length = payload.len() as u32 + 16;
    let unpadded = 8 + payload.len() + 4;
    let padded = (unpadded + 7) & !7;
    let mut buf = Vec::with_capacity(padded);
    buf.extend_from_slice(&TX_LOG_HEAD_SIG.to_le_bytes());
    buf.extend_from_slice(&length.to_le_bytes());
    buf.extend_from_slice(payload);
    buf.extend_from_slice(&TX_LOG_TAIL_SIG.to_le_bytes());
    buf.resize(padded, 0);
    buf
}

/// Parses one framed record from `buf`. Returns the record and the padded
/// byte count consumed, or `None` at the end of the intact prefix (zeroed
/// space, short frame or a torn tail).
fn read_record(buf: &[u8]) -> Option<(TxRecord, usize)> {
    if buf.len() < 8 {
        return None;
    }
    let sig = u32::from_le_bytes(buf[0..4].try_into().unwrap());
    if sig != TX_LOG_HEAD_SIG {
        return None;
    }
    let length = u32::from_le_bytes(buf[4..8].try_into().unwrap()) as usize;
    let payload_len = length.checked_sub(16)?;
    let unpadded = 8 + payload_len + 4;
    if buf.len() < unpadded {
        return None;
    }
    let payload = &buf[8..8 + payload_len];
    let tail_sig = u32::from_le_bytes(buf[8 + payload_len..unpadded].try_into().unwrap());
    if tail_sig != TX_LOG_TAIL_SIG {
        warn!("tx log torn tail detected, truncating scan");
        return None;
    }
    let record: TxRecord = bincode::deserialize(payload).ok()?;
    let padded = (unpadded + 7) & !7;
    Some((record, padded))
}
