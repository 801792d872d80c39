//! The surface the display layer talks to.

use std::path::{Path, PathBuf};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::error;

use crate::config::Configuration;
use crate::error::{Error, StoreError};
use crate::events::Pick;
use crate::photo;
use crate::settings::{Editable, Reconciled, Reconciler, SettingKey, SettingValue, SettingsStore};
use crate::store::Environment;
use crate::tasks::indexer::{IndexSummary, Indexer};
use crate::tasks::selector::{self, SelectorHandle, SelectorOptions};

/// Photo index and selection engine over one shared environment.
pub struct PhotoService {
    env: Environment,
    settings: SettingsStore,
    indexer: Indexer,
    selector: SelectorHandle,
    selector_task: JoinHandle<anyhow::Result<()>>,
}

impl PhotoService {
    /// Wire up the core and start the selection actor seeded with `search_path`.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(env: Environment, cfg: &Configuration, search_path: impl Into<String>) -> Self {
        let (selector, selector_task) = selector::spawn(
            env.clone(),
            search_path,
            SelectorOptions::from_config(cfg),
            CancellationToken::new(),
        );
        Self {
            settings: SettingsStore::new(env.clone()),
            indexer: Indexer::new(env.clone(), cfg.scan.clone()),
            env,
            selector,
            selector_task,
        }
    }

    pub fn settings(&self) -> &SettingsStore {
        &self.settings
    }

    pub fn indexer(&self) -> &Indexer {
        &self.indexer
    }

    /// Index `root` in the background. The outcome is only logged.
    pub fn start_indexing(&self, root: impl Into<PathBuf>) -> JoinHandle<Option<IndexSummary>> {
        self.indexer.start(root)
    }

    pub async fn request_random_photo(&self, search_path: impl Into<String>) -> Result<Option<Pick>, Error> {
        self.selector.random_photo(search_path).await
    }

    /// Flip the hidden flag of `path` in the background.
    pub fn toggle_visibility(&self, path: impl AsRef<Path>, currently_hidden: bool) -> JoinHandle<()> {
        let env = self.env.clone();
        let path = path.as_ref().to_path_buf();
        tokio::task::spawn_blocking(move || {
            if let Err(err) = photo::toggle_visibility(&env, &path, currently_hidden) {
                error!(path = %path.display(), error = %err, "failed to change photo visibility");
            }
        })
    }

    pub fn read_setting<T: SettingValue>(&self, key: SettingKey, default: T) -> Result<T, StoreError> {
        self.settings.get_or_init(key, default)
    }

    /// Apply or revert one edited setting; see [`Reconciler`].
    pub fn reconcile_setting<T: SettingValue>(
        &self,
        key: SettingKey,
        setting: &mut Editable<T>,
        validate: Option<Box<dyn FnOnce(&T) -> bool + Send>>,
        on_accept: Option<Box<dyn FnOnce(T) + Send>>,
    ) -> Reconciled {
        let mut reconciler = Reconciler::new(&self.settings, key);
        if let Some(validate) = validate {
            reconciler = reconciler.validate(validate);
        }
        if let Some(on_accept) = on_accept {
            reconciler = reconciler.on_accept(on_accept);
        }
        reconciler.run(setting)
    }

    /// Close the selection actor and wait for it to stop. Running scans finish on their own.
    pub async fn close(self) -> Result<(), Error> {
        self.selector.close();
        if let Err(err) = self.selector_task.await? {
            error!(error = %err, "photo selector stopped with an error");
        }
        Ok(())
    }
}
