mod content;
mod database;
mod firebase;
mod memory;
mod pinata;

pub use content::ContentStore;
pub use database::{split_path, Database};
pub use firebase::RestDatabase;
pub use memory::{MemoryContentStore, MemoryDatabase};
pub use pinata::{PinataCredentials, PinataStore};
