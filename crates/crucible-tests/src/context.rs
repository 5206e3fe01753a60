//! Test context providing a migrated store.

use crate::containers::PostgresContainer;
use crucible_db::Database;

/// A running PostgreSQL with the schema applied.
///
/// Drop this to stop the container.
pub struct StoreContext {
    pub postgres: PostgresContainer,
    pub db: Database,
}

impl StoreContext {
    pub async fn new() -> anyhow::Result<Self> {
        crate::init_test_logging();

        let postgres = PostgresContainer::start().await?;
        let db = Database::connect(postgres.connection_string()).await?;
        db.migrate().await?;

        Ok(Self { postgres, db })
    }
}
