use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument};

use crate::error::{Error, StoreError};
use crate::photo::{HIDDEN, PATH, PHOTO, PhotoMeta};
use crate::scan::{self, ScanOptions};
use crate::store::Environment;

/// Counts reported at the end of a scan.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IndexSummary {
    /// Candidate files seen on disk.
    pub found: usize,
    /// Records created by this pass.
    pub inserted: usize,
}

/// Walk `root` and create a photo record for every candidate not yet indexed.
///
/// Candidates are committed in batches of `opts.batch_size`, one write
/// transaction each. Re-running over an unchanged tree inserts nothing.
///
/// # Errors
/// Returns [`Error::BadDir`] if `root` is not a directory, or the first store
/// failure; batches committed before the failure stay committed.
#[instrument(skip(env, opts), fields(root = %root.display()))]
pub fn index_source_dir(
    env: &Environment,
    root: &Path,
    opts: &ScanOptions,
) -> Result<IndexSummary, Error> {
    let root = scan::resolve_root(root)?;
    let prefix = root.to_string_lossy().into_owned();

    // Discovery ignores visibility: a hidden record still counts as indexed.
    let mut known: HashSet<PhotoMeta> = env.read(|txn| {
        Ok(txn
            .find_starting_with(PHOTO, PATH, &prefix)?
            .iter()
            .filter_map(PhotoMeta::from_entity)
            .map(|meta| PhotoMeta::unindexed(meta.path))
            .collect())
    })?;
    debug!(known = known.len(), "loaded indexed photos");

    let batch_size = opts.batch_size.max(1);
    let mut summary = IndexSummary::default();
    let mut batch = Vec::with_capacity(batch_size);
    for path in scan::candidates(&root, opts) {
        let Some(path) = path.to_str() else {
            debug!(path = %path.display(), "skipping non UTF-8 path");
            continue;
        };
        batch.push(PhotoMeta::unindexed(path));
        if batch.len() == batch_size {
            summary.found += batch.len();
            summary.inserted += insert_batch(env, &mut known, std::mem::take(&mut batch))?;
        }
    }
    if !batch.is_empty() {
        summary.found += batch.len();
        summary.inserted += insert_batch(env, &mut known, batch)?;
    }

    info!(
        found = summary.found,
        inserted = summary.inserted,
        "done indexing source directory"
    );
    Ok(summary)
}

fn insert_batch(
    env: &Environment,
    known: &mut HashSet<PhotoMeta>,
    batch: Vec<PhotoMeta>,
) -> Result<usize, StoreError> {
    let fresh: Vec<PhotoMeta> = batch.into_iter().filter(|p| !known.contains(p)).collect();
    if fresh.is_empty() {
        return Ok(0);
    }
    let inserted = env.write(|txn| {
        let mut inserted = 0;
        for photo in &fresh {
            // The preloaded set is a snapshot; an overlapping scan may have won.
            if !txn.find(PHOTO, PATH, photo.path.as_str())?.is_empty() {
                continue;
            }
            let id = txn.new_entity(PHOTO)?;
            txn.set_property(id, PATH, photo.path.as_str())?;
            txn.set_property(id, HIDDEN, false)?;
            inserted += 1;
        }
        Ok(inserted)
    })?;
    known.extend(fresh);
    Ok(inserted)
}

/// Runs scans as background tasks, one at a time per root directory.
#[derive(Clone)]
pub struct Indexer {
    env: Environment,
    opts: Arc<ScanOptions>,
    gates: Gates,
}

type Gates = Arc<Mutex<HashMap<PathBuf, Arc<AsyncMutex<()>>>>>;

impl Indexer {
    pub fn new(env: Environment, opts: ScanOptions) -> Self {
        Self {
            env,
            opts: Arc::new(opts),
            gates: Arc::default(),
        }
    }

    /// Start scanning `root` in the background.
    ///
    /// The outcome is logged; awaiting the handle is optional. A scan of a root
    /// that is already being scanned waits for the running one to finish.
    pub fn start(&self, root: impl Into<PathBuf>) -> JoinHandle<Option<IndexSummary>> {
        let root = root.into();
        let (key, gate) = self.gate_for(&root);
        let gates = self.gates.clone();
        let env = self.env.clone();
        let opts = self.opts.clone();
        tokio::spawn(async move {
            let summary = {
                let _running = gate.lock().await;
                let task_root = root.clone();
                let res =
                    tokio::task::spawn_blocking(move || index_source_dir(&env, &task_root, &opts))
                        .await;
                match res {
                    Ok(Ok(summary)) => Some(summary),
                    Ok(Err(err)) => {
                        error!(root = %root.display(), error = %err, "indexing failed");
                        None
                    }
                    Err(err) => {
                        error!(root = %root.display(), error = %err, "indexing task aborted");
                        None
                    }
                }
            };
            release_gate(&gates, &key, gate);
            summary
        })
    }

    /// Number of roots with a scan running or waiting.
    pub fn active_roots(&self) -> usize {
        self.gates.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    fn gate_for(&self, root: &Path) -> (PathBuf, Arc<AsyncMutex<()>>) {
        let key = std::path::absolute(root).unwrap_or_else(|_| root.to_path_buf());
        let mut gates = self.gates.lock().unwrap_or_else(PoisonError::into_inner);
        let gate = gates.entry(key.clone()).or_default().clone();
        (key, gate)
    }
}

// Drops the map entry once no other scan of the root holds the gate.
fn release_gate(gates: &Gates, key: &Path, gate: Arc<AsyncMutex<()>>) {
    let mut gates = gates.lock().unwrap_or_else(PoisonError::into_inner);
    let last = gates
        .get(key)
        .is_some_and(|held| Arc::ptr_eq(held, &gate) && Arc::strong_count(&gate) == 2);
    if last {
        gates.remove(key);
    }
}
