mod config;
mod error;
mod framework;
mod paths;
mod persistent;
mod state;

pub use config::ConfigStore;
pub use error::StoreError;
pub use framework::FrameworkStore;
pub use paths::*;
pub use persistent::{FileStore, MemoryStore, PersistentStore};
pub use state::StateStore;
