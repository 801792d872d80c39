//! Persisted user settings and the apply-or-revert reconciler.
//!
//! Live values are owned by the caller through [`Settings`]; the store only
//! mirrors them. The reconciler is the single writer: the display layer
//! proposes edits, and nothing reaches the store until an edit session ends
//! and the new value passes validation.

use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::StoreError;
use crate::store::{Environment, PropertyValue};

/// Keys of the persisted settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SettingKey {
    /// Root directory of the photo library (text).
    SourceDir,
    /// Seconds each photo stays on screen (integer, > 0).
    Duration,
    /// Whether the display shows the photo path (boolean).
    ShowPath,
}

impl SettingKey {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::SourceDir => "SourceDir",
            Self::Duration => "Duration",
            Self::ShowPath => "ShowPath",
        }
    }
}

impl fmt::Display for SettingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Scalar types that can be stored as a setting.
pub trait SettingValue: Clone + PartialEq + fmt::Debug + Send + 'static {
    fn to_property(&self) -> PropertyValue;
    fn from_property(value: &PropertyValue) -> Option<Self>;
}

impl SettingValue for String {
    fn to_property(&self) -> PropertyValue {
        PropertyValue::Text(self.clone())
    }

    fn from_property(value: &PropertyValue) -> Option<Self> {
        value.as_text().map(str::to_owned)
    }
}

impl SettingValue for i64 {
    fn to_property(&self) -> PropertyValue {
        PropertyValue::Int(*self)
    }

    fn from_property(value: &PropertyValue) -> Option<Self> {
        value.as_int()
    }
}

impl SettingValue for bool {
    fn to_property(&self) -> PropertyValue {
        PropertyValue::Bool(*self)
    }

    fn from_property(value: &PropertyValue) -> Option<Self> {
        value.as_bool()
    }
}

/// Key-value view over the `config` namespace of the environment.
///
/// Clones share one write ledger, so background saves issued through any of
/// them land in the order the edits were accepted.
#[derive(Clone)]
pub struct SettingsStore {
    env: Environment,
    ledger: Arc<Mutex<WriteLedger>>,
}

// Per-key generations: handed out when an edit is accepted, recorded once saved.
#[derive(Default)]
struct WriteLedger {
    issued: HashMap<SettingKey, u64>,
    written: HashMap<SettingKey, u64>,
}

impl SettingsStore {
    pub fn new(env: Environment) -> Self {
        Self {
            env,
            ledger: Arc::default(),
        }
    }

    pub fn get<T: SettingValue>(&self, key: SettingKey) -> Result<Option<T>, StoreError> {
        let stored = self.env.read(|txn| txn.config_get(key.as_str()))?;
        Ok(stored.as_ref().and_then(T::from_property))
    }

    /// Return the stored value, or persist and return `default` if absent.
    ///
    /// A stored value of the wrong type is replaced by `default`.
    pub fn get_or_init<T: SettingValue>(&self, key: SettingKey, default: T) -> Result<T, StoreError> {
        self.env.write(|txn| {
            match txn.config_get(key.as_str())? {
                Some(stored) => {
                    if let Some(value) = T::from_property(&stored) {
                        return Ok(value);
                    }
                    warn!(%key, ?stored, "stored setting has unexpected type; resetting");
                }
                None => debug!(%key, ?default, "initializing setting"),
            }
            txn.config_put(key.as_str(), default.to_property())?;
            Ok(default)
        })
    }

    pub fn put<T: SettingValue>(&self, key: SettingKey, value: &T) -> Result<(), StoreError> {
        self.env
            .write(|txn| txn.config_put(key.as_str(), value.to_property()))
    }

    fn next_generation(&self, key: SettingKey) -> u64 {
        let mut ledger = self.ledger.lock().unwrap_or_else(PoisonError::into_inner);
        let generation = ledger.issued.entry(key).or_default();
        *generation += 1;
        *generation
    }

    /// Write `value` unless an edit accepted after it has already been saved.
    ///
    /// Returns `false` when the write was skipped as stale.
    fn put_generation<T: SettingValue>(
        &self,
        key: SettingKey,
        generation: u64,
        value: &T,
    ) -> Result<bool, StoreError> {
        // Held across the write so the check and the save cannot interleave.
        let mut ledger = self.ledger.lock().unwrap_or_else(PoisonError::into_inner);
        if ledger.written.get(&key).is_some_and(|&w| w > generation) {
            return Ok(false);
        }
        self.put(key, value)?;
        ledger.written.insert(key, generation);
        Ok(true)
    }
}

/// A setting as seen by an edit session: the committed value and the edit in progress.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Editable<T> {
    committed: T,
    edited: T,
}

impl<T: Clone + PartialEq> Editable<T> {
    pub fn new(value: T) -> Self {
        Self {
            committed: value.clone(),
            edited: value,
        }
    }

    pub fn committed(&self) -> &T {
        &self.committed
    }

    pub fn edited(&self) -> &T {
        &self.edited
    }

    /// Record an edit; nothing is persisted until the session is reconciled.
    pub fn propose(&mut self, value: T) {
        self.edited = value;
    }

    pub fn is_dirty(&self) -> bool {
        self.committed != self.edited
    }
}

/// Outcome of [`Reconciler::run`].
#[derive(Debug)]
pub enum Reconciled {
    /// Edited equals committed; nothing happened.
    Unchanged,
    /// Validation failed; the edit was reset to the committed value.
    Reverted,
    /// The edit was committed in memory; persistence runs in the background.
    Accepted(JoinHandle<()>),
}

type Validator<T> = Box<dyn FnOnce(&T) -> bool + Send>;
type AcceptHook<T> = Box<dyn FnOnce(T) + Send>;

/// Applies or reverts one setting when an edit session ends.
pub struct Reconciler<T> {
    store: SettingsStore,
    key: SettingKey,
    validate: Option<Validator<T>>,
    on_accept: Option<AcceptHook<T>>,
}

impl<T: SettingValue> Reconciler<T> {
    pub fn new(store: &SettingsStore, key: SettingKey) -> Self {
        Self {
            store: store.clone(),
            key,
            validate: None,
            on_accept: None,
        }
    }

    /// Predicate the edited value must satisfy. Without one every edit is accepted.
    pub fn validate(mut self, f: impl FnOnce(&T) -> bool + Send + 'static) -> Self {
        self.validate = Some(Box::new(f));
        self
    }

    /// Called with the new value once it has been written to the store.
    pub fn on_accept(mut self, f: impl FnOnce(T) + Send + 'static) -> Self {
        self.on_accept = Some(Box::new(f));
        self
    }

    /// Must be called from within a Tokio runtime.
    pub fn run(self, setting: &mut Editable<T>) -> Reconciled {
        if setting.committed == setting.edited {
            return Reconciled::Unchanged;
        }
        let key = self.key;
        if let Some(validate) = self.validate {
            if !validate(&setting.edited) {
                debug!(%key, edited = ?setting.edited, "invalid setting edit reverted");
                setting.edited = setting.committed.clone();
                return Reconciled::Reverted;
            }
        }
        setting.committed = setting.edited.clone();

        let value = setting.edited.clone();
        let store = self.store;
        let generation = store.next_generation(key);
        let on_accept = self.on_accept;
        Reconciled::Accepted(tokio::task::spawn_blocking(move || {
            match store.put_generation(key, generation, &value) {
                Ok(true) => {
                    info!(%key, ?value, "setting saved");
                    if let Some(hook) = on_accept {
                        hook(value);
                    }
                }
                Ok(false) => debug!(%key, ?value, generation, "superseded setting edit dropped"),
                Err(err) => error!(%key, error = %err, "failed to save setting"),
            }
        }))
    }
}

/// First-run values for the persisted settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SettingDefaults {
    pub source_dir: String,
    pub duration_secs: i64,
    pub show_path: bool,
}

/// Live settings state shared between the reconciler and the display layer.
#[derive(Debug, Clone)]
pub struct Settings {
    pub source_dir: Editable<String>,
    pub duration: Editable<i64>,
    pub show_path: Editable<bool>,
}

/// Per-key outcome of [`Settings::reconcile_all`].
#[derive(Debug)]
pub struct ReconcileReport {
    pub source_dir: Reconciled,
    pub duration: Reconciled,
    pub show_path: Reconciled,
}

impl Settings {
    /// Read every setting, initializing missing ones from `defaults`.
    pub fn load(store: &SettingsStore, defaults: &SettingDefaults) -> Result<Self, StoreError> {
        let source_dir = store.get_or_init(SettingKey::SourceDir, defaults.source_dir.clone())?;
        let duration = store.get_or_init(SettingKey::Duration, defaults.duration_secs)?;
        let show_path = store.get_or_init(SettingKey::ShowPath, defaults.show_path)?;
        info!(source_dir = %source_dir, duration, show_path, "settings loaded");
        Ok(Self {
            source_dir: Editable::new(source_dir),
            duration: Editable::new(duration),
            show_path: Editable::new(show_path),
        })
    }

    pub fn has_pending_edits(&self) -> bool {
        self.source_dir.is_dirty() || self.duration.is_dirty() || self.show_path.is_dirty()
    }

    /// End an edit session: apply valid edits, revert invalid ones.
    ///
    /// The source directory must exist, the duration must be positive. An
    /// accepted source directory is handed to `on_source_dir_changed` once saved.
    pub fn reconcile_all(
        &mut self,
        store: &SettingsStore,
        on_source_dir_changed: impl FnOnce(String) + Send + 'static,
    ) -> ReconcileReport {
        ReconcileReport {
            source_dir: Reconciler::new(store, SettingKey::SourceDir)
                .validate(|dir: &String| Path::new(dir).exists())
                .on_accept(on_source_dir_changed)
                .run(&mut self.source_dir),
            duration: Reconciler::new(store, SettingKey::Duration)
                .validate(|secs: &i64| *secs > 0)
                .run(&mut self.duration),
            show_path: Reconciler::new(store, SettingKey::ShowPath).run(&mut self.show_path),
        }
    }
}
