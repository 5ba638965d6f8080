#![forbid(unsafe_code)]

use super::{ConsistencyReport, SqliteStore, StoreError};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use tracing::{info, warn};

/// A consistency audit running on its own connection.
///
/// The audit only reads, so it never blocks writers beyond SQLite's own snapshot rules.
#[derive(Debug)]
pub struct AuditHandle {
    cancel: Arc<AtomicBool>,
    handle: JoinHandle<Result<ConsistencyReport, StoreError>>,
}

impl AuditHandle {
    /// Asks the audit to stop at the next batch boundary. The report it returns is
    /// marked `cancelled`.
    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::Relaxed);
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    pub fn join(self) -> Result<ConsistencyReport, StoreError> {
        match self.handle.join() {
            Ok(result) => result,
            Err(_) => Err(StoreError::Io(std::io::Error::other(
                "consistency audit thread panicked",
            ))),
        }
    }
}

impl SqliteStore {
    /// Starts a full audit in the background, pausing between batches as configured.
    pub fn spawn_audit(&self) -> Result<AuditHandle, StoreError> {
        let storage_dir = self.storage_dir.clone();
        let config = self.config.clone();
        let cache = Arc::clone(&self.cache);
        let cancel = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&cancel);

        let handle = thread::Builder::new()
            .name("chunkdb-audit".to_string())
            .spawn(move || {
                let pause = config.audit.pause;
                let store = SqliteStore::open_shared(&storage_dir, config, cache)?;
                let result = store.audit_report(pause, &flag);
                match &result {
                    Ok(report) if report.cancelled => {
                        info!(chunks_scanned = report.chunks_scanned, "consistency audit cancelled");
                    }
                    Ok(_) => {}
                    Err(err) => warn!(error = %err, "consistency audit failed"),
                }
                result
            })?;

        Ok(AuditHandle { cancel, handle })
    }
}
