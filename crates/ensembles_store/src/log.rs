//! Append-only event log on top of a [`LogBackend`].

use crate::backend::LogBackend;
use crate::error::StoreResult;
use crate::record::{scan_records, LogRecord};
use tracing::warn;

/// Writer for the event log.
pub(crate) struct EventLog {
    backend: Box<dyn LogBackend>,
    records: usize,
    dead_records: usize,
}

impl EventLog {
    /// Opens a log and returns the records it holds. A torn tail is
    /// truncated.
    pub(crate) fn open(mut backend: Box<dyn LogBackend>) -> StoreResult<(Self, Vec<LogRecord>)> {
        let data = backend.read_all()?;
        let outcome = scan_records(&data)?;
        if outcome.torn_tail {
            warn!(
                valid_len = outcome.valid_len,
                size = data.len(),
                "truncating torn tail of event log"
            );
            backend.truncate(outcome.valid_len)?;
        }
        let log = Self {
            backend,
            records: outcome.records.len(),
            dead_records: 0,
        };
        Ok((log, outcome.records))
    }

    pub(crate) fn append(&mut self, record: &LogRecord) -> StoreResult<()> {
        let bytes = record.encode()?;
        self.backend.append(&bytes)?;
        self.records += 1;
        Ok(())
    }

    /// Notes that an earlier record no longer describes live state.
    pub(crate) fn mark_dead(&mut self, count: usize) {
        self.dead_records += count;
    }

    pub(crate) fn flush(&mut self, sync: bool) -> StoreResult<()> {
        self.backend.flush(sync)
    }

    pub(crate) fn size(&self) -> u64 {
        self.backend.size()
    }

    /// Fraction of records that are dead.
    pub(crate) fn dead_ratio(&self) -> f64 {
        if self.records == 0 {
            0.0
        } else {
            self.dead_records as f64 / self.records as f64
        }
    }

    /// Replaces the log with `live` records.
    pub(crate) fn rewrite(&mut self, live: &[LogRecord]) -> StoreResult<()> {
        let mut data = Vec::new();
        for record in live {
            data.extend(record.encode()?);
        }
        self.backend.replace(&data)?;
        self.records = live.len();
        self.dead_records = 0;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryLogBackend;

    #[test]
    fn append_reopen_and_rewrite() {
        let backend = MemoryLogBackend::new();
        let (mut log, records) = EventLog::open(Box::new(backend)).unwrap();
        assert!(records.is_empty());

        log.append(&LogRecord::RemoveEvent("a".into())).unwrap();
        log.append(&LogRecord::RemoveEvent("b".into())).unwrap();
        log.mark_dead(1);
        assert!((log.dead_ratio() - 0.5).abs() < f64::EPSILON);

        log.rewrite(&[LogRecord::RemoveEvent("b".into())]).unwrap();
        assert_eq!(log.dead_ratio(), 0.0);

        let data = log.backend.read_all().unwrap();
        let scanned = scan_records(&data).unwrap();
        assert_eq!(scanned.records, vec![LogRecord::RemoveEvent("b".into())]);
    }
}
