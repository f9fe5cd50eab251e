// Copyright (c) Consus Contributors
// SPDX-License-Identifier: Apache-2.0

//! An append-only log with fsync-based durability barriers.
//!
//! Two segment files are written alternately so one can be fsynced while the
//! other keeps accepting appends. `append` assigns a record number and writes
//! without blocking on disk; a background thread fsyncs and publishes the
//! durable upper bound through a watch channel. Record framing is
//! `(be64 recno, be64 len, payload, be32 crc32)`.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::fs::{File, OpenOptions};
use std::io::Read;
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::Arc;
use std::thread;

use consus_config::CommId;
use parking_lot::{Condvar, Mutex};
use tokio::sync::watch;

use crate::error::{ConsusError, ConsusResult};
use crate::message::Message;
use crate::types::{TransactionGroup, Vote};

const RECORD_HEADER_SIZE: usize = 16;
const RECORD_TRAILER_SIZE: usize = 4;

struct Segment {
    file: Arc<File>,
    offset_next_write: u64,
    recno_last_write: u64,
    recno_last_fsync: u64,
    ongoing_writes: u32,
    syncing: bool,
}

impl Segment {
    fn new(file: File) -> Self {
        Self {
            file: Arc::new(file),
            offset_next_write: 0,
            recno_last_write: 0,
            recno_last_fsync: 0,
            ongoing_writes: 0,
            syncing: false,
        }
    }

    fn pending_fsync(&self) -> bool {
        self.recno_last_write > self.recno_last_fsync
    }
}

struct LogState {
    closed: bool,
    failed: bool,
    next_recno: u64,
    segments: [Segment; 2],
}

impl LogState {
    /// The record number below which everything is known durable. A segment
    /// with unsynced records bounds the estimate by its last synced record;
    /// the bound catches up at the next fsync.
    fn durable_upper_bound(&self) -> u64 {
        self.segments
            .iter()
            .map(|seg| {
                if seg.pending_fsync() {
                    seg.recno_last_fsync
                } else {
                    self.next_recno - 1
                }
            })
            .min()
            .unwrap_or(0)
    }
}

struct Shared {
    state: Mutex<LogState>,
    wakeup: Condvar,
    durable_tx: watch::Sender<u64>,
}

/// See the module documentation.
pub struct DurableLog {
    shared: Arc<Shared>,
    durable_rx: watch::Receiver<u64>,
    flush_thread: Option<thread::JoinHandle<()>>,
}

impl DurableLog {
    /// Opens (creating if needed) the log directory with its `LOCK` marker and
    /// two segment files, and starts the flush thread.
    pub fn open(dir: &Path) -> ConsusResult<Self> {
        std::fs::create_dir_all(dir)?;
        // Marker file; the on-disk layout reserves it for an advisory lock.
        let _ = OpenOptions::new()
            .create(true)
            .write(true)
            .open(dir.join("LOCK"))?;
        let open_segment = |name: &str| -> ConsusResult<File> {
            Ok(OpenOptions::new()
                .create(true)
                .read(true)
                .write(true)
                .truncate(true)
                .open(dir.join(name))?)
        };
        let file_a = open_segment("file_a")?;
        let file_b = open_segment("file_b")?;

        let (durable_tx, durable_rx) = watch::channel(0);
        let shared = Arc::new(Shared {
            state: Mutex::new(LogState {
                closed: false,
                failed: false,
                next_recno: 1,
                segments: [Segment::new(file_a), Segment::new(file_b)],
            }),
            wakeup: Condvar::new(),
            durable_tx,
        });

        let flush_shared = shared.clone();
        let flush_thread = thread::Builder::new()
            .name("consus-log-flush".to_string())
            .spawn(move || flush_loop(flush_shared))
            .expect("spawning the log flush thread cannot fail");

        Ok(Self {
            shared,
            durable_rx,
            flush_thread: Some(flush_thread),
        })
    }

    /// Appends `entry` and returns its record number. Does not wait for disk.
    pub fn append(&self, entry: &[u8]) -> ConsusResult<u64> {
        let (recno, offset, seg_idx, file) = {
            let mut state = self.shared.state.lock();
            if state.closed || state.failed {
                return Err(ConsusError::LogClosed);
            }
            let recno = state.next_recno;
            state.next_recno += 1;
            // Write into a segment that is not mid-fsync; with both free,
            // prefer the emptier one to balance flush latency.
            let seg_idx = match (&state.segments[0], &state.segments[1]) {
                (a, _) if a.syncing => 1,
                (_, b) if b.syncing => 0,
                (a, b) if a.offset_next_write <= b.offset_next_write => 0,
                _ => 1,
            };
            let seg = &mut state.segments[seg_idx];
            let offset = seg.offset_next_write;
            seg.offset_next_write +=
                (RECORD_HEADER_SIZE + entry.len() + RECORD_TRAILER_SIZE) as u64;
            seg.recno_last_write = recno;
            seg.ongoing_writes += 1;
            (recno, offset, seg_idx, seg.file.clone())
        };

        let mut buf = Vec::with_capacity(RECORD_HEADER_SIZE + entry.len() + RECORD_TRAILER_SIZE);
        buf.extend_from_slice(&recno.to_be_bytes());
        buf.extend_from_slice(&(entry.len() as u64).to_be_bytes());
        buf.extend_from_slice(entry);
        let crc = crc32fast::hash(&buf);
        buf.extend_from_slice(&crc.to_be_bytes());

        let result = file.write_all_at(&buf, offset);

        let mut state = self.shared.state.lock();
        let seg = &mut state.segments[seg_idx];
        seg.ongoing_writes -= 1;
        if let Err(err) = result {
            state.failed = true;
            self.shared.wakeup.notify_all();
            return Err(err.into());
        }
        self.shared.wakeup.notify_all();
        Ok(recno)
    }

    /// The record number below which everything is on disk.
    pub fn durable(&self) -> u64 {
        *self.durable_rx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.durable_rx.clone()
    }

    /// Waits until `recno` is durable.
    pub async fn wait_durable(&self, recno: u64) -> ConsusResult<()> {
        let mut rx = self.durable_rx.clone();
        loop {
            if *rx.borrow_and_update() >= recno {
                return Ok(());
            }
            rx.changed().await.map_err(|_| ConsusError::LogClosed)?;
        }
    }

    /// Feeds every intact record to `visit` in record-number order and returns
    /// the highest record number seen. Records that fail their checksum are
    /// skipped, as are any written after a torn prefix in their segment.
    pub fn replay(&self, mut visit: impl FnMut(u64, &[u8])) -> ConsusResult<u64> {
        let files: Vec<Arc<File>> = {
            let state = self.shared.state.lock();
            state.segments.iter().map(|seg| seg.file.clone()).collect()
        };
        let mut records: Vec<(u64, Vec<u8>)> = Vec::new();
        {
            for file in &files {
                let len = file.metadata()?.len();
                let mut contents = vec![0u8; len as usize];
                file.read_exact_at(&mut contents, 0)?;
                let mut cursor = std::io::Cursor::new(&contents);
                loop {
                    let mut header = [0u8; RECORD_HEADER_SIZE];
                    if cursor.read_exact(&mut header).is_err() {
                        break;
                    }
                    let recno = u64::from_be_bytes(header[..8].try_into().unwrap());
                    let size = u64::from_be_bytes(header[8..].try_into().unwrap()) as usize;
                    let mut payload = vec![0u8; size];
                    if cursor.read_exact(&mut payload).is_err() {
                        break;
                    }
                    let mut trailer = [0u8; RECORD_TRAILER_SIZE];
                    if cursor.read_exact(&mut trailer).is_err() {
                        break;
                    }
                    let mut hasher = crc32fast::Hasher::new();
                    hasher.update(&header);
                    hasher.update(&payload);
                    if hasher.finalize() != u32::from_be_bytes(trailer) {
                        break;
                    }
                    records.push((recno, payload));
                }
            }
        }
        records.sort_by_key(|(recno, _)| *recno);
        let mut highest = 0;
        for (recno, payload) in &records {
            visit(*recno, payload);
            highest = highest.max(*recno);
        }
        Ok(highest)
    }

    fn close(&self) {
        let mut state = self.shared.state.lock();
        state.closed = true;
        self.shared.wakeup.notify_all();
    }
}

impl Drop for DurableLog {
    fn drop(&mut self) {
        self.close();
        if let Some(handle) = self.flush_thread.take() {
            handle.join().ok();
        }
    }
}

fn flush_loop(shared: Arc<Shared>) {
    loop {
        let mut guard = shared.state.lock();
        let seg_idx = loop {
            if guard.closed || guard.failed {
                return;
            }
            // Sync the segment whose unsynced records are oldest.
            let candidate = guard
                .segments
                .iter()
                .enumerate()
                .filter(|(_, seg)| seg.pending_fsync() && !seg.syncing)
                .min_by_key(|(_, seg)| seg.recno_last_fsync)
                .map(|(idx, _)| idx);
            match candidate {
                Some(idx) => break idx,
                None => shared.wakeup.wait(&mut guard),
            }
        };
        guard.segments[seg_idx].syncing = true;
        while guard.segments[seg_idx].ongoing_writes > 0 {
            shared.wakeup.wait(&mut guard);
        }
        let fsync_target = guard.segments[seg_idx].recno_last_write;
        let file = guard.segments[seg_idx].file.clone();
        drop(guard);

        let sync_result = file.sync_data();

        let mut guard = shared.state.lock();
        guard.segments[seg_idx].syncing = false;
        match sync_result {
            Ok(()) => {
                guard.segments[seg_idx].recno_last_fsync = fsync_target;
                let durable = guard.durable_upper_bound();
                shared.durable_tx.send_replace(durable);
            }
            Err(_) => {
                guard.failed = true;
            }
        }
        shared.wakeup.notify_all();
    }
}

/// An action gated behind log durability: a message to send once the log
/// entry that justifies it is on disk, a notification that a transaction
/// operation's own log write completed, or a transaction outcome that becomes
/// visible only once recorded on disk.
#[derive(Debug)]
pub(crate) enum DurableAction {
    Send {
        to: CommId,
        message: Message,
    },
    OperationDurable {
        tg: TransactionGroup,
        seqno: u64,
    },
    DispositionDurable {
        tg: TransactionGroup,
        outcome: Vote,
    },
}

struct PendingAction {
    recno: u64,
    order: u64,
    action: DurableAction,
}

impl PartialEq for PendingAction {
    fn eq(&self, other: &Self) -> bool {
        self.recno == other.recno && self.order == other.order
    }
}
impl Eq for PendingAction {}
impl PartialOrd for PendingAction {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for PendingAction {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.recno, self.order).cmp(&(other.recno, other.order))
    }
}

/// Fan-in of durability-gated actions, drained in record-number order as the
/// durable upper bound advances.
#[derive(Default)]
pub(crate) struct DurabilityFanIn {
    pending: Mutex<(u64, BinaryHeap<Reverse<PendingAction>>)>,
}

impl DurabilityFanIn {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn defer(&self, recno: u64, action: DurableAction) {
        let mut pending = self.pending.lock();
        let order = pending.0;
        pending.0 += 1;
        pending.1.push(Reverse(PendingAction {
            recno,
            order,
            action,
        }));
    }

    /// Removes and returns every action whose record is now durable.
    pub fn drain(&self, durable_upper_bound: u64) -> Vec<DurableAction> {
        let mut pending = self.pending.lock();
        let mut ready = Vec::new();
        while let Some(Reverse(head)) = pending.1.peek() {
            if head.recno > durable_upper_bound {
                break;
            }
            let Reverse(head) = pending.1.pop().unwrap();
            ready.push(head.action);
        }
        ready
    }

    pub fn len(&self) -> usize {
        self.pending.lock().1.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn appends_become_durable_and_replay_in_order() {
        let dir = TempDir::new().unwrap();
        let log = DurableLog::open(dir.path()).unwrap();

        let mut recnos = Vec::new();
        for i in 0..20u32 {
            recnos.push(log.append(format!("entry-{i}").as_bytes()).unwrap());
        }
        assert_eq!(recnos, (1..=20).collect::<Vec<u64>>());
        log.wait_durable(20).await.unwrap();
        assert!(log.durable() >= 20);

        let mut seen = Vec::new();
        let highest = log
            .replay(|recno, payload| {
                seen.push((recno, String::from_utf8(payload.to_vec()).unwrap()));
            })
            .unwrap();
        assert_eq!(highest, 20);
        assert_eq!(seen.len(), 20);
        for (i, (recno, payload)) in seen.iter().enumerate() {
            assert_eq!(*recno, i as u64 + 1);
            assert_eq!(payload, &format!("entry-{i}"));
        }
    }

    #[tokio::test]
    async fn append_after_drop_fails() {
        let dir = TempDir::new().unwrap();
        let log = DurableLog::open(dir.path()).unwrap();
        log.append(b"x").unwrap();
        log.close();
        assert!(matches!(log.append(b"y"), Err(ConsusError::LogClosed)));
    }

    #[test]
    fn fan_in_drains_in_record_order() {
        let fan_in = DurabilityFanIn::new();
        let tg = TransactionGroup::default();
        fan_in.defer(5, DurableAction::OperationDurable { tg, seqno: 5 });
        fan_in.defer(2, DurableAction::OperationDurable { tg, seqno: 2 });
        fan_in.defer(9, DurableAction::OperationDurable { tg, seqno: 9 });
        assert_eq!(fan_in.len(), 3);

        let ready = fan_in.drain(4);
        assert_eq!(ready.len(), 1);
        assert!(
            matches!(ready[0], DurableAction::OperationDurable { seqno: 2, .. })
        );

        let ready = fan_in.drain(9);
        assert_eq!(ready.len(), 2);
        assert!(
            matches!(ready[0], DurableAction::OperationDurable { seqno: 5, .. })
        );
        assert!(
            matches!(ready[1], DurableAction::OperationDurable { seqno: 9, .. })
        );
        assert_eq!(fan_in.len(), 0);
    }
}
