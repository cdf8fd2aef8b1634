//! # Store Adapters
//!
//! `MessageStore` implementations the engine runs against:
//!
//! - [`InMemoryStore`]: process-local, with an emulated change feed. Several
//!   engine instances sharing one `Arc<InMemoryStore>` behave like nodes
//!   sharing a database.
//! - [`PostgresStore`] (feature `postgres`): tables per queue, primary-key lock
//!   table and `LISTEN/NOTIFY` change feed.

pub mod in_memory;
#[cfg(feature = "postgres")]
pub mod postgres;
pub mod traits;
pub mod types;

pub use in_memory::InMemoryStore;
#[cfg(feature = "postgres")]
pub use postgres::PostgresStore;
pub use traits::MessageStore;
pub use types::{
    CandidateQuery, CandidateRow, ChangeEvent, ChangeStream, Collection, OperationType,
    PurgeCounts, WatchFilter,
};

use std::sync::Arc;

use crate::config::{StoreBackend, StoreConfig};
use crate::messaging::errors::{MessagingError, MessagingResult};

/// Build the store selected by configuration
pub async fn connect(config: &StoreConfig) -> MessagingResult<Arc<dyn MessageStore>> {
    match config.backend {
        StoreBackend::InMemory => Ok(Arc::new(InMemoryStore::new())),
        #[cfg(feature = "postgres")]
        StoreBackend::Postgres => {
            let url = config.database_url.as_deref().ok_or_else(|| {
                MessagingError::configuration("store", "database_url is required for postgres")
            })?;
            Ok(Arc::new(
                PostgresStore::connect(url, config.max_connections).await?,
            ))
        }
        #[cfg(not(feature = "postgres"))]
        StoreBackend::Postgres => Err(MessagingError::configuration(
            "store",
            "postgres backend requires the `postgres` feature",
        )),
    }
}
