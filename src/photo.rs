//! Photo records: the in-memory view and the visibility mutator.

use std::hash::{Hash, Hasher};
use std::path::Path;

use tracing::{debug, info};

use crate::error::StoreError;
use crate::store::{Entity, EntityId, Environment, PropertyValue, ReadTxn};

/// Entity kind under which photos are stored.
pub const PHOTO: &str = "Photo";
/// Absolute file-system path of the image.
pub const PATH: &str = "path";
/// Whether the photo is excluded from selection.
pub const HIDDEN: &str = "hidden";

/// Transient description of a photo, indexed or not.
///
/// Equality and hashing cover `(path, hidden)` only. The identifier is a
/// store-assigned correlation key, so a freshly scanned file compares equal to
/// its already indexed record.
#[derive(Debug, Clone)]
pub struct PhotoMeta {
    pub path: String,
    pub id: Option<EntityId>,
    pub hidden: bool,
}

impl PhotoMeta {
    /// A photo discovered on disk that has not been indexed yet.
    pub fn unindexed(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            id: None,
            hidden: false,
        }
    }

    /// Build from a stored record; `None` if it has no text path.
    pub fn from_entity(entity: &Entity) -> Option<Self> {
        let path = entity.property(PATH)?.as_text()?.to_owned();
        Some(Self {
            path,
            id: Some(entity.id),
            hidden: entity
                .property(HIDDEN)
                .and_then(PropertyValue::as_bool)
                .unwrap_or(false),
        })
    }

    pub fn file(&self) -> &Path {
        Path::new(&self.path)
    }
}

impl PartialEq for PhotoMeta {
    fn eq(&self, other: &Self) -> bool {
        self.path == other.path && self.hidden == other.hidden
    }
}

impl Eq for PhotoMeta {}

impl Hash for PhotoMeta {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.path.hash(state);
        self.hidden.hash(state);
    }
}

/// Read one photo record by id inside an open transaction.
pub fn load(txn: &ReadTxn<'_>, id: EntityId) -> Result<Option<PhotoMeta>, StoreError> {
    Ok(txn.get_entity(id)?.as_ref().and_then(PhotoMeta::from_entity))
}

/// Set the hidden flag of every record stored under `path`.
///
/// Returns how many records were touched; zero when the path was never indexed.
pub fn set_hidden(env: &Environment, path: &Path, hidden: bool) -> Result<usize, StoreError> {
    let key = absolute_string(path);
    let touched = env.write(|txn| {
        let records = txn.find(PHOTO, PATH, key.as_str())?;
        for record in &records {
            txn.set_property(record.id, HIDDEN, hidden)?;
        }
        Ok(records.len())
    })?;
    if touched == 0 {
        debug!(path = %key, "visibility change for unindexed photo ignored");
    } else {
        info!(path = %key, hidden, touched, "photo visibility changed");
    }
    Ok(touched)
}

/// Flip visibility given the flag the caller currently shows.
pub fn toggle_visibility(
    env: &Environment,
    path: &Path,
    currently_hidden: bool,
) -> Result<usize, StoreError> {
    set_hidden(env, path, !currently_hidden)
}

/// Absolute, lossy UTF-8 form of `path` as used for store keys.
pub(crate) fn absolute_string(path: &Path) -> String {
    std::path::absolute(path)
        .unwrap_or_else(|_| path.to_path_buf())
        .to_string_lossy()
        .into_owned()
}
