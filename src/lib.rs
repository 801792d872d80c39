//! Locally indexed photo catalog with randomized, visibility-filtered selection.

pub mod config;
pub mod error;
pub mod events;
pub mod photo;
pub mod scan;
pub mod service;
pub mod settings;
pub mod store;
pub mod tasks {
    pub mod indexer;
    pub mod selector;
}

pub use error::{Error, StoreError};
pub use events::Pick;
pub use photo::PhotoMeta;
pub use service::PhotoService;
