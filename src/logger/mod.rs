//! The write-ahead log (spec §4.5 "Logger"). Grounded on
//! `original_source/newbrt/log.c`/`log-internal.h`: a 1 MiB in-memory
//! buffer (`LOGGER_BUF_SIZE`), segment rollover at 100 MiB, and
//! `log%012llu.<ext>` segment naming via
//! `toku_logger_find_next_unused_log_file`.
//!
//! Any I/O error latches a panic flag (spec §4.5 "Panic"): once set, every
//! subsequent call fails immediately without touching disk again, exactly
//! as `original_source/newbrt/log-internal.h`'s logger struct carries a
//! sticky panic errno.

pub mod record;
pub mod segments;

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;

use log::{debug, warn};

use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::node::Lsn;
use record::{encode_record, LogRecord, RecordPayload, SEGMENT_FORMAT_VERSION, SEGMENT_MAGIC};

/// The write-ahead logger: one per open environment, shared by every
/// cachefile within it (spec §5 "Shared resources").
pub struct Logger {
    directory: PathBuf,
    extension: String,
    buffer: Vec<u8>,
    buffer_limit: usize,
    segment_limit: u64,
    segment_number: u64,
    segment_bytes: u64,
    file: Option<File>,
    lsn: Lsn,
    panicked: Option<String>,
}

impl Logger {
    /// Open (creating the directory if needed) and start appending at the
    /// next unused segment number.
    pub fn open(config: &EngineConfig) -> Result<Self> {
        let directory = PathBuf::from(&config.log_directory);
        std::fs::create_dir_all(&directory)?;
        let mut logger = Logger {
            directory,
            extension: config.log_segment_extension.clone(),
            buffer: Vec::with_capacity(config.log_buffer_bytes),
            buffer_limit: config.log_buffer_bytes,
            segment_limit: config.log_segment_bytes,
            segment_number: 0,
            segment_bytes: 0,
            file: None,
            lsn: Lsn::ZERO,
            panicked: None,
        };
        let next = segments::next_unused_segment(&logger.directory, &logger.extension)?;
        logger.open_segment(next)?;
        Ok(logger)
    }

    pub fn last_lsn(&self) -> Lsn {
        self.lsn
    }

    /// Append one typed record, returning the LSN it was stamped with
    /// (spec §4.5 "Each write increments the logger's LSN counter").
    pub fn log(&mut self, payload: RecordPayload) -> Result<Lsn> {
        self.check_panicked()?;
        if self.file.is_none() || self.segment_bytes >= self.segment_limit {
            let next = self.segment_number + if self.file.is_some() { 1 } else { 0 };
            self.checked(|s| s.open_segment(next))?;
        }
        let lsn = self.lsn.next();
        let record = LogRecord { lsn, payload };
        let before = self.buffer.len();
        self.checked(|s| encode_record(&mut s.buffer, &record))?;
        self.segment_bytes += (self.buffer.len() - before) as u64;
        self.lsn = lsn;
        if self.buffer.len() >= self.buffer_limit {
            self.fsync()?;
        }
        Ok(lsn)
    }

    /// Force the in-memory buffer to disk with a single write, then fsync
    /// (spec §4.5 "Writing").
    pub fn fsync(&mut self) -> Result<()> {
        self.check_panicked()?;
        self.checked(|s| {
            if !s.buffer.is_empty() {
                let file = s.file.as_mut().expect("segment file open");
                file.write_all(&s.buffer)?;
                s.buffer.clear();
            }
            if let Some(file) = &s.file {
                file.sync_all()?;
            }
            Ok(())
        })
    }

    pub fn close(&mut self) -> Result<()> {
        self.fsync()?;
        self.file = None;
        Ok(())
    }

    pub fn is_panicked(&self) -> bool {
        self.panicked.is_some()
    }

    fn check_panicked(&self) -> Result<()> {
        match &self.panicked {
            Some(msg) => Err(Error::Panicked(msg.clone())),
            None => Ok(()),
        }
    }

    /// Run `f`, latching the panic flag on any error before propagating it
    /// (spec §4.5 "Panic").
    fn checked(&mut self, f: impl FnOnce(&mut Self) -> Result<()>) -> Result<()> {
        match f(self) {
            Ok(()) => Ok(()),
            Err(e) => {
                if self.panicked.is_none() {
                    warn!("logger: latching panic after I/O failure: {e}");
                    self.panicked = Some(e.to_string());
                }
                Err(e)
            }
        }
    }

    fn open_segment(&mut self, number: u64) -> Result<()> {
        if let Some(file) = self.file.take() {
            file.sync_all()?;
        }
        let path = segments::segment_path(&self.directory, &self.extension, number);
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)?;
        file.write_all(SEGMENT_MAGIC)?;
        file.write_all(&SEGMENT_FORMAT_VERSION.to_be_bytes())?;
        self.segment_bytes = (SEGMENT_MAGIC.len() + 4) as u64;
        self.segment_number = number;
        self.file = Some(file);
        debug!("logger: rolled over to segment {number}");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config(dir: &std::path::Path) -> EngineConfig {
        let mut config = EngineConfig::default();
        config.log_directory = dir.to_string_lossy().into_owned();
        config.log_buffer_bytes = 64;
        config.log_segment_bytes = 256;
        config
    }

    #[test]
    fn logging_assigns_increasing_lsns() {
        let dir = tempfile::tempdir().unwrap();
        let mut logger = Logger::open(&test_config(dir.path())).unwrap();
        let lsn1 = logger.log(RecordPayload::Commit { txn: 1 }).unwrap();
        let lsn2 = logger.log(RecordPayload::Commit { txn: 2 }).unwrap();
        assert!(lsn2 > lsn1);
        logger.fsync().unwrap();
    }

    #[test]
    fn segment_rolls_over_past_the_byte_limit() {
        let dir = tempfile::tempdir().unwrap();
        let mut logger = Logger::open(&test_config(dir.path())).unwrap();
        for i in 0..50u64 {
            logger
                .log(RecordPayload::FCreate {
                    txn: i,
                    filename: "db".into(),
                    mode: 0o644,
                })
                .unwrap();
        }
        logger.fsync().unwrap();
        let segs = segments::existing_segments(dir.path(), "tokulog").unwrap();
        assert!(segs.len() > 1, "expected more than one segment, got {segs:?}");
    }

    #[test]
    fn panic_latch_blocks_further_writes() {
        let dir = tempfile::tempdir().unwrap();
        let mut logger = Logger::open(&test_config(dir.path())).unwrap();
        logger.panicked = Some("simulated failure".into());
        let err = logger.log(RecordPayload::Commit { txn: 1 }).unwrap_err();
        assert!(matches!(err, Error::Panicked(_)));
    }
}
