pub mod document;
pub mod ops;

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use tokio::sync::Notify;
use tracing::{info, warn};

use crate::document::StateDocument;

/// Write-behind debounce: a mutation schedules a flush this far in the
/// future; mutations landing in the window coalesce into one rewrite.
const FLUSH_DELAY: Duration = Duration::from_millis(800);

/// In-memory authoritative state with write-behind JSON persistence.
///
/// Uses a single `Mutex` around the whole document; operations are atomic
/// with respect to each other and linearizable in lock-acquisition order.
/// The flusher task serializes under the lock but performs file I/O
/// outside it, so flushes never stall the mutation path.
pub struct Store {
    path: PathBuf,
    doc: Mutex<StateDocument>,
    dirty: AtomicBool,
    flush_signal: Notify,
}

impl Store {
    /// Load the document at `path`, or start empty when the file is missing
    /// or unreadable. An empty start is persisted immediately so the file
    /// exists from the first boot onward.
    pub fn open(path: impl Into<PathBuf>) -> Result<Arc<Self>> {
        let path = path.into();
        let (doc, fresh) = load_document(&path);

        let store = Arc::new(Self {
            path,
            doc: Mutex::new(doc),
            dirty: AtomicBool::new(false),
            flush_signal: Notify::new(),
        });

        {
            let mut doc = store.doc.lock().expect("store lock poisoned");
            if doc.seed_bots() {
                store.dirty.store(true, Ordering::Release);
            }
        }
        if fresh {
            store.flush_to_disk()?;
        }

        info!("State store opened at {}", store.path.display());
        Ok(store)
    }

    /// Spawn the write-behind flusher. Runs until the returned handle is
    /// aborted; call [`Store::shutdown_flush`] afterwards to drain.
    pub fn spawn_flusher(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let store = self.clone();
        tokio::spawn(async move {
            loop {
                store.flush_signal.notified().await;
                tokio::time::sleep(FLUSH_DELAY).await;
                if store.dirty.swap(false, Ordering::AcqRel) {
                    if let Err(e) = store.flush_to_disk() {
                        warn!("State flush failed (will retry): {}", e);
                        store.dirty.store(true, Ordering::Release);
                    }
                }
            }
        })
    }

    /// Flush pending state synchronously. Used on shutdown after the
    /// flusher task has been stopped.
    pub fn shutdown_flush(&self) {
        if self.dirty.swap(false, Ordering::AcqRel) {
            if let Err(e) = self.flush_to_disk() {
                warn!("Final state flush failed: {}", e);
            } else {
                info!("State flushed on shutdown");
            }
        }
    }

    /// Read-only access to the document.
    pub fn with_doc<F, T>(&self, f: F) -> T
    where
        F: FnOnce(&StateDocument) -> T,
    {
        let doc = self.doc.lock().expect("store lock poisoned");
        f(&doc)
    }

    /// Mutating access. Marks the store dirty and schedules a flush.
    pub fn with_doc_mut<F, T>(&self, f: F) -> T
    where
        F: FnOnce(&mut StateDocument) -> T,
    {
        let mut doc = self.doc.lock().expect("store lock poisoned");
        let out = f(&mut doc);
        drop(doc);
        self.dirty.store(true, Ordering::Release);
        self.flush_signal.notify_one();
        out
    }

    /// Serialize the document and rewrite the state file via a temporary
    /// path followed by an atomic rename, so a crash mid-write can never
    /// leave a truncated document behind.
    fn flush_to_disk(&self) -> Result<()> {
        let bytes = {
            let doc = self.doc.lock().expect("store lock poisoned");
            serde_json::to_vec_pretty(&*doc)?
        };

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, &bytes)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

fn load_document(path: &Path) -> (StateDocument, bool) {
    match std::fs::read(path) {
        Ok(bytes) => match serde_json::from_slice(&bytes) {
            Ok(doc) => (doc, false),
            Err(e) => {
                warn!(
                    "State file {} is corrupt ({}); starting empty",
                    path.display(),
                    e
                );
                (StateDocument::default(), true)
            }
        },
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            info!("No state file at {}; starting empty", path.display());
            (StateDocument::default(), true)
        }
        Err(e) => {
            warn!(
                "Could not read state file {} ({}); starting empty",
                path.display(),
                e
            );
            (StateDocument::default(), true)
        }
    }
}
