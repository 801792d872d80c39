use std::path::{Path, PathBuf};

use anyhow::Result;
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::IndexedRandom;
use tokio::select;
use tokio::sync::mpsc::{self, Receiver, Sender};
use tokio::sync::oneshot;
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::config::Configuration;
use crate::error::{Error, StoreError};
use crate::events::{Pick, SelectorMsg};
use crate::photo::{self, HIDDEN, PATH, PHOTO, PhotoMeta};
use crate::scan::{self, ScanOptions};
use crate::store::{EntityId, Environment, difference};

#[derive(Debug, Clone)]
pub struct SelectorOptions {
    /// Filters used by the degraded on-disk sample.
    pub scan: ScanOptions,
    /// Number of on-disk candidates the degraded path chooses from.
    pub fallback_sample_size: usize,
    /// Deterministic RNG seed; `None` seeds from the OS.
    pub seed: Option<u64>,
    /// Queue depth before requesters wait.
    pub mailbox: usize,
}

impl SelectorOptions {
    pub fn from_config(cfg: &Configuration) -> Self {
        Self {
            scan: cfg.scan.clone(),
            fallback_sample_size: cfg.fallback_sample_size,
            seed: cfg.selection_seed,
            ..Self::default()
        }
    }
}

impl Default for SelectorOptions {
    fn default() -> Self {
        Self {
            scan: ScanOptions::default(),
            fallback_sample_size: 10,
            seed: None,
            mailbox: 32,
        }
    }
}

/// Cloneable handle for talking to the selection actor.
#[derive(Clone)]
pub struct SelectorHandle {
    tx: Sender<SelectorMsg>,
    cancel: CancellationToken,
}

impl SelectorHandle {
    /// Ask for a random visible photo under `search_path`.
    ///
    /// `Ok(None)` means nothing is available there.
    ///
    /// # Errors
    /// [`Error::SelectorClosed`] once the actor has been closed, including for
    /// requests still queued when it closed.
    pub async fn random_photo(&self, search_path: impl Into<String>) -> Result<Option<Pick>, Error> {
        if self.cancel.is_cancelled() {
            return Err(Error::SelectorClosed);
        }
        let (reply, response) = oneshot::channel();
        self.tx
            .send(SelectorMsg::GetRandomPhoto {
                search_path: search_path.into(),
                reply,
            })
            .await
            .map_err(|_| Error::SelectorClosed)?;
        response.await.map_err(|_| Error::SelectorClosed)
    }

    /// Stop the actor after the request it is currently serving.
    pub fn close(&self) {
        self.cancel.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled() || self.tx.is_closed()
    }
}

/// Start the selection actor, eagerly building the index for `seed_path`.
pub fn spawn(
    env: Environment,
    seed_path: impl Into<String>,
    opts: SelectorOptions,
    cancel: CancellationToken,
) -> (SelectorHandle, JoinHandle<Result<()>>) {
    let (tx, rx) = mpsc::channel(opts.mailbox.max(1));
    let handle = SelectorHandle {
        tx,
        cancel: cancel.clone(),
    };
    let task = tokio::spawn(run(Selection::new(env, opts), seed_path.into(), rx, cancel));
    (handle, task)
}

/// Serves requests strictly one at a time, in arrival order. The candidate
/// cache is only ever touched from here, so it needs no lock.
#[instrument(skip(selection, rx, cancel))]
async fn run(
    selection: Selection,
    seed_path: String,
    mut rx: Receiver<SelectorMsg>,
    cancel: CancellationToken,
) -> Result<()> {
    let (mut selection, ()) = on_worker(selection, move |s| s.seed(&seed_path)).await?;
    loop {
        select! {
            biased;

            _ = cancel.cancelled() => {
                info!("cancel received; closing photo selector");
                break;
            }

            msg = rx.recv() => {
                match msg {
                    Some(SelectorMsg::GetRandomPhoto { search_path, reply }) => {
                        let (next, pick) = on_worker(selection, move |s| s.pick(&search_path)).await?;
                        selection = next;
                        // The requester may have stopped waiting.
                        let _ = reply.send(pick);
                    }
                    None => {
                        debug!("all selector handles dropped");
                        break;
                    }
                }
            }
        }
    }
    Ok(())
}

// Store access blocks, so each step runs on the blocking pool and hands the
// state back when done.
async fn on_worker<R: Send + 'static>(
    mut selection: Selection,
    f: impl FnOnce(&mut Selection) -> R + Send + 'static,
) -> Result<(Selection, R), JoinError> {
    tokio::task::spawn_blocking(move || {
        let out = f(&mut selection);
        (selection, out)
    })
    .await
}

/// Actor state: the active search path and the visible ids beneath it.
///
/// The id list is a disposable cache rebuilt only when the search path
/// changes, so visibility changes made since the last rebuild are not seen
/// until the next one.
struct Selection {
    env: Environment,
    opts: SelectorOptions,
    current: Option<String>,
    candidates: Vec<EntityId>,
    rebuilds: u64,
    rng: StdRng,
}

impl Selection {
    fn new(env: Environment, opts: SelectorOptions) -> Self {
        let rng = match opts.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };
        Self {
            env,
            opts,
            current: None,
            candidates: Vec::new(),
            rebuilds: 0,
            rng,
        }
    }

    fn seed(&mut self, search_path: &str) {
        if let Err(err) = self.rebuild(search_path) {
            warn!(search_path, error = %err, "initial selection index unavailable");
        }
    }

    fn rebuild(&mut self, search_path: &str) -> Result<(), StoreError> {
        self.current = None;
        self.candidates.clear();
        let ids: Vec<EntityId> = self.env.read(|txn| {
            let under = txn.find_starting_with(PHOTO, PATH, search_path)?;
            let hidden = txn.find(PHOTO, HIDDEN, true)?;
            Ok(difference(under, &hidden).into_iter().map(|e| e.id).collect())
        })?;
        self.rebuilds += 1;
        debug!(search_path, candidates = ids.len(), "selection index rebuilt");
        self.candidates = ids;
        self.current = Some(search_path.to_owned());
        Ok(())
    }

    fn pick(&mut self, search_path: &str) -> Option<Pick> {
        match self.pick_indexed(search_path) {
            Ok(photo) => {
                if let Some(p) = &photo {
                    debug!(source = "index", path = %p.path, "photo selected");
                }
                photo.map(Pick::Indexed)
            }
            Err(err) => {
                warn!(source = "fallback", search_path, error = %err, "indexed selection failed; sampling from disk");
                self.current = None;
                self.candidates.clear();
                self.pick_sampled(search_path).map(Pick::Sampled)
            }
        }
    }

    fn pick_indexed(&mut self, search_path: &str) -> Result<Option<PhotoMeta>, StoreError> {
        if self.current.as_deref() != Some(search_path) {
            self.rebuild(search_path)?;
        }
        let Some(&id) = self.candidates.choose(&mut self.rng) else {
            return Ok(None);
        };
        self.env.read(|txn| photo::load(txn, id))
    }

    fn pick_sampled(&mut self, search_path: &str) -> Option<PhotoMeta> {
        let sample: Vec<PathBuf> = scan::candidates(Path::new(search_path), &self.opts.scan)
            .take(self.opts.fallback_sample_size)
            .collect();
        let chosen = sample.choose(&mut self.rng)?;
        warn!(source = "fallback", path = %chosen.display(), sampled = sample.len(), "photo selected");
        Some(PhotoMeta::unindexed(chosen.to_string_lossy()))
    }
}
