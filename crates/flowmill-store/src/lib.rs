pub mod directory;
pub mod memory;
pub mod sqlite;

pub use directory::StaticGroupDirectory;
pub use memory::MemoryStore;
pub use sqlite::SqliteStore;
