//! SQLite persistence for documents, leaf chunks and summary nodes.

pub mod chunks;
pub mod database;
pub mod documents;
pub mod error;
pub mod nodes;
pub mod row_helpers;
pub mod schema;

pub use chunks::ChunkRepo;
pub use database::Database;
pub use documents::{DocumentRecord, DocumentRepo};
pub use error::StoreError;
pub use nodes::{NodeMatch, NodeRepo};
