//! Persistent record storage.
//!
//! The engine sees storage as a key-addressed byte-blob store behind the
//! synchronous [`RecordStore`] trait. On target, [`FlashRecordStore`]
//! keeps the records cached in RAM and syncs them to the nRF52840's
//! internal flash through the `sequential-storage` key-value map, so the
//! main loop never blocks on a flash operation.
//!
//! Storage layout:
//!   - One map entry per record key (`u16`).
//!   - The flash pages are managed by `sequential-storage`, which handles
//!     wear levelling and reclaims space from superseded entries.
//!
//! Flash syncs that keep failing are bounded by [`SaveRetry`]: after
//! [`STORAGE_RETRY_LIMIT`] consecutive failures the pending writes are
//! dropped and the error is surfaced.

use crate::config::STORAGE_RETRY_LIMIT;

/// Failure of a record store operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum StorageError {
    /// The store is temporarily unable to accept the request; retry later.
    Busy,
    /// No room left for the record.
    NoSpace,
    /// The backing medium failed.
    Io,
}

/// Key-addressed byte-blob store.
pub trait RecordStore {
    /// Copy the record stored under `key` into `buf`.
    ///
    /// Returns the record length, or `None` if the key was never written.
    fn read(&mut self, key: u16, buf: &mut [u8]) -> Result<Option<usize>, StorageError>;

    /// Replace the record stored under `key`.
    fn write(&mut self, key: u16, data: &[u8]) -> Result<(), StorageError>;

    /// Reclaim space held by superseded records.
    fn collect_garbage(&mut self) -> Result<(), StorageError>;
}

/// What the main loop does after one flash sync.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SaveStep {
    /// Everything pending reached flash.
    Done,
    /// Try again on the next loop iteration.
    Retry,
    /// The region is full: request a garbage collection, then retry.
    Collect,
    /// Too many consecutive failures: drop the pending writes and report.
    GiveUp(StorageError),
}

/// Counts consecutive failed flash syncs.
#[derive(Debug, Default)]
pub struct SaveRetry {
    failures: u8,
}

impl SaveRetry {
    pub const fn new() -> Self {
        Self { failures: 0 }
    }

    /// Classify the result of one sync attempt.
    pub fn record(&mut self, result: Result<(), StorageError>) -> SaveStep {
        let Err(e) = result else {
            self.failures = 0;
            return SaveStep::Done;
        };

        self.failures += 1;
        if self.failures >= STORAGE_RETRY_LIMIT {
            self.failures = 0;
            return SaveStep::GiveUp(e);
        }
        match e {
            StorageError::NoSpace => SaveStep::Collect,
            StorageError::Busy | StorageError::Io => SaveStep::Retry,
        }
    }
}

#[cfg(feature = "embedded")]
pub use flash::FlashRecordStore;

#[cfg(feature = "embedded")]
mod flash {
    use super::{RecordStore, StorageError};
    use crate::config::{STORAGE_FLASH_PAGE_COUNT, STORAGE_FLASH_PAGE_START};
    use heapless::Vec;

    /// Flash page size for nRF52840 (4 KB).
    const FLASH_PAGE_SIZE: u32 = 4096;

    /// Start address of our storage region.
    const STORAGE_START: u32 = STORAGE_FLASH_PAGE_START * FLASH_PAGE_SIZE;

    /// End address (exclusive) of our storage region.
    const STORAGE_END: u32 =
        (STORAGE_FLASH_PAGE_START + STORAGE_FLASH_PAGE_COUNT) * FLASH_PAGE_SIZE;

    /// Largest record the cache holds. The device order needs 9 bytes.
    const MAX_RECORD_SIZE: usize = 32;

    /// Number of distinct record keys the cache holds.
    const MAX_RECORDS: usize = 4;

    /// Scratch buffer size for `sequential-storage` (record plus item header).
    const WORK_BUF_SIZE: usize = 64;

    struct Record {
        key: u16,
        data: Vec<u8, MAX_RECORD_SIZE>,
        dirty: bool,
    }

    /// In-memory cache of records, synced with flash by the main loop.
    pub struct FlashRecordStore {
        records: Vec<Record, MAX_RECORDS>,
        /// Set by `collect_garbage`; the next save rewrites the region from scratch.
        gc_requested: bool,
    }

    impl FlashRecordStore {
        /// Create an empty store.
        pub const fn new() -> Self {
            Self {
                records: Vec::new(),
                gc_requested: false,
            }
        }

        /// Load the records stored under `keys` from flash.
        pub async fn load_from_flash(
            &mut self,
            flash: &mut impl embedded_storage_async::nor_flash::NorFlash,
            keys: &[u16],
        ) {
            let flash_range = STORAGE_START..STORAGE_END;
            let mut buf = [0u8; WORK_BUF_SIZE];

            self.records.clear();
            for key in keys {
                match sequential_storage::map::fetch_item::<u16, &[u8], _>(
                    flash,
                    flash_range.clone(),
                    &mut sequential_storage::cache::NoCache::new(),
                    &mut buf,
                    key,
                )
                .await
                {
                    Ok(Some(data)) => {
                        let Ok(data) = Vec::from_slice(data) else {
                            warn!("Record {=u16:#x} too large, ignored", key);
                            continue;
                        };
                        let _ = self.records.push(Record {
                            key: *key,
                            data,
                            dirty: false,
                        });
                        debug!("Loaded record {=u16:#x}", key);
                    }
                    Ok(None) => {
                        info!("No record {=u16:#x} in flash", key);
                    }
                    Err(e) => {
                        error!("Flash read error: {:?}", defmt::Debug2Format(&e));
                    }
                }
            }
        }

        /// Persist every dirty record to flash.
        ///
        /// Returns [`StorageError::NoSpace`] when the region is full; the
        /// caller reports that so a garbage collection gets requested.
        pub async fn save_to_flash(
            &mut self,
            flash: &mut impl embedded_storage_async::nor_flash::NorFlash,
        ) -> Result<(), StorageError> {
            let flash_range = STORAGE_START..STORAGE_END;

            if self.gc_requested {
                match sequential_storage::erase_all(flash, flash_range.clone()).await {
                    Ok(()) => {
                        info!("Record region erased, rewriting {} records", self.records.len());
                        self.records.iter_mut().for_each(|r| r.dirty = true);
                        self.gc_requested = false;
                    }
                    Err(e) => {
                        error!("Flash erase error: {:?}", defmt::Debug2Format(&e));
                        return Err(StorageError::Io);
                    }
                }
            }

            let mut buf = [0u8; WORK_BUF_SIZE];
            let mut result = Ok(());
            for record in self.records.iter_mut().filter(|r| r.dirty) {
                let item: &[u8] = &record.data;
                match sequential_storage::map::store_item::<u16, &[u8], _>(
                    flash,
                    flash_range.clone(),
                    &mut sequential_storage::cache::NoCache::new(),
                    &mut buf,
                    &record.key,
                    &item,
                )
                .await
                {
                    Ok(_) => {
                        debug!("Saved record {=u16:#x}", record.key);
                        record.dirty = false;
                    }
                    Err(sequential_storage::Error::FullStorage) => {
                        warn!("Record region full, {=u16:#x} not saved", record.key);
                        result = Err(StorageError::NoSpace);
                    }
                    Err(e) => {
                        error!("Flash write error: {:?}", defmt::Debug2Format(&e));
                        result = Err(StorageError::Io);
                    }
                }
            }
            result
        }

        /// Whether a save would touch flash.
        pub fn is_dirty(&self) -> bool {
            self.gc_requested || self.records.iter().any(|r| r.dirty)
        }

        /// Forget every pending write and garbage collection. The cache
        /// keeps the new contents; the next `write` marks a record dirty again.
        pub fn discard_pending(&mut self) {
            warn!("Dropping pending flash writes");
            self.records.iter_mut().for_each(|r| r.dirty = false);
            self.gc_requested = false;
        }
    }

    impl RecordStore for FlashRecordStore {
        fn read(&mut self, key: u16, buf: &mut [u8]) -> Result<Option<usize>, StorageError> {
            let Some(record) = self.records.iter().find(|r| r.key == key) else {
                return Ok(None);
            };
            let len = record.data.len();
            let dst = buf.get_mut(..len).ok_or(StorageError::NoSpace)?;
            dst.copy_from_slice(&record.data);
            Ok(Some(len))
        }

        fn write(&mut self, key: u16, data: &[u8]) -> Result<(), StorageError> {
            let data = Vec::from_slice(data).map_err(|_| StorageError::NoSpace)?;
            if let Some(existing) = self.records.iter_mut().find(|r| r.key == key) {
                existing.data = data;
                existing.dirty = true;
                return Ok(());
            }
            self.records
                .push(Record {
                    key,
                    data,
                    dirty: true,
                })
                .map_err(|_| StorageError::NoSpace)
        }

        fn collect_garbage(&mut self) -> Result<(), StorageError> {
            if self.gc_requested {
                return Err(StorageError::Busy);
            }
            self.gc_requested = true;
            Ok(())
        }
    }
}
