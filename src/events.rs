use tokio::sync::oneshot;

use crate::photo::PhotoMeta;

/// Requests understood by the selection actor.
#[derive(Debug)]
pub enum SelectorMsg {
    GetRandomPhoto {
        search_path: String,
        reply: oneshot::Sender<Option<Pick>>,
    },
}

/// A randomly selected photo and where it came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Pick {
    /// Chosen from the visible records of the index.
    Indexed(PhotoMeta),
    /// Degraded mode: the index could not be read, so the photo was sampled
    /// straight from disk. Visibility flags are not consulted.
    Sampled(PhotoMeta),
}

impl Pick {
    pub fn photo(&self) -> &PhotoMeta {
        match self {
            Self::Indexed(p) | Self::Sampled(p) => p,
        }
    }

    pub fn into_photo(self) -> PhotoMeta {
        match self {
            Self::Indexed(p) | Self::Sampled(p) => p,
        }
    }

    pub const fn is_indexed(&self) -> bool {
        matches!(self, Self::Indexed(_))
    }
}
