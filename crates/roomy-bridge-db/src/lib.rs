mod tables;
mod tx_ops;

use std::io;
use std::path::{Path, PathBuf};

use redb_bincode::{ReadTransaction, WriteTransaction};
use snafu::{Location, ResultExt as _, Snafu};
use tokio::task::JoinError;
use tracing::debug;

pub use self::tables::*;
pub use self::tx_ops::{MappingKind, RegisterOutcome};

const LOG_TARGET: &str = "bridge::db";

/// Schema version written into `db_version`. A database from a newer build
/// refuses to open.
const DB_VERSION: u64 = 0;

#[derive(Debug, Snafu)]
pub enum DbError {
    Database {
        source: redb::DatabaseError,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(transparent)]
    Table {
        source: redb::TableError,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(transparent)]
    Storage {
        source: redb::StorageError,
        #[snafu(implicit)]
        location: Location,
    },
    Transaction {
        #[snafu(source(from(redb::TransactionError, Box::new)))]
        source: Box<redb::TransactionError>,
        #[snafu(implicit)]
        location: Location,
    },
    Commit {
        source: redb::CommitError,
        #[snafu(implicit)]
        location: Location,
    },
    DbVersionTooHigh {
        db_ver: u64,
        code_ver: u64,
        #[snafu(implicit)]
        location: Location,
    },
    Join {
        source: JoinError,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(visibility(pub))]
    #[snafu(display("Id already mapped to a different counterpart"))]
    MappingCollision {
        key: String,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(visibility(pub))]
    #[snafu(display("Guild or space already bound elsewhere"))]
    BindingCollision {
        #[snafu(implicit)]
        location: Location,
    },
}
pub type DbResult<T> = std::result::Result<T, DbError>;

/// The bridge's durable state: id mappings, cursors, fingerprints, webhook
/// tokens, bindings.
///
/// All typed access goes through the repository methods; multi-step writes
/// that belong to one logical step compose the `*_tx` variants inside a
/// single [`Self::write_with`] transaction.
#[derive(Debug)]
pub struct BridgeDb {
    inner: redb_bincode::Database,
}

impl BridgeDb {
    pub async fn mk_db_path(data_dir: &Path) -> std::result::Result<PathBuf, io::Error> {
        tokio::fs::create_dir_all(&data_dir).await?;
        Ok(data_dir.join("bridge.redb"))
    }

    pub async fn new_in_memory() -> DbResult<Self> {
        debug!(target: LOG_TARGET, "Opening in-memory database");
        let inner = redb::Database::builder()
            .create_with_backend(redb::backends::InMemoryBackend::new())
            .context(DatabaseSnafu)?;
        Self::open_inner(inner).await
    }

    pub async fn open(path: impl Into<PathBuf>) -> DbResult<Self> {
        let path = path.into();
        debug!(target: LOG_TARGET, path = %path.display(), "Opening database");

        let inner = tokio::task::spawn_blocking(move || redb::Database::create(path))
            .await
            .context(JoinSnafu)?
            .context(DatabaseSnafu)?;

        Self::open_inner(inner).await
    }

    async fn open_inner(inner: redb::Database) -> DbResult<Self> {
        let inner = redb_bincode::Database::from(inner);

        Self::write_with_inner(&inner, |tx| {
            Self::init_tables_tx(tx)?;
            Self::verify_version_tx(tx)?;
            Ok(())
        })
        .await?;

        Ok(Self { inner })
    }

    fn init_tables_tx(tx: &WriteTransaction) -> DbResult<()> {
        tx.open_table(&db_version::TABLE)?;
        tx.open_table(&bridges_by_guild::TABLE)?;
        tx.open_table(&bridges_by_space::TABLE)?;
        tx.open_table(&leaf_cursors::TABLE)?;
        tx.open_table(&synced_ids::TABLE)?;
        tx.open_table(&synced_ids_rev::TABLE)?;
        tx.open_table(&synced_profiles::TABLE)?;
        tx.open_table(&synced_reactions::TABLE)?;
        tx.open_table(&synced_sidebar_hashes::TABLE)?;
        tx.open_table(&synced_room_links::TABLE)?;
        tx.open_table(&synced_edits::TABLE)?;
        tx.open_table(&discord_message_hashes::TABLE)?;
        tx.open_table(&discord_latest_messages::TABLE)?;
        tx.open_table(&discord_webhook_tokens::TABLE)?;
        Ok(())
    }

    fn verify_version_tx(tx: &WriteTransaction) -> DbResult<()> {
        let mut table = tx.open_table(&db_version::TABLE)?;
        let db_ver = table.get(&())?.map(|g| g.value());
        match db_ver {
            Some(db_ver) if DB_VERSION < db_ver => DbVersionTooHighSnafu {
                db_ver,
                code_ver: DB_VERSION,
            }
            .fail(),
            Some(_) => Ok(()),
            None => {
                table.insert(&(), &DB_VERSION)?;
                Ok(())
            }
        }
    }

    pub async fn write_with_inner<T>(
        inner: &redb_bincode::Database,
        f: impl FnOnce(&'_ WriteTransaction) -> DbResult<T>,
    ) -> DbResult<T> {
        tokio::task::block_in_place(|| {
            let dbtx = inner.begin_write().context(TransactionSnafu)?;
            let res = f(&dbtx)?;

            dbtx.commit().context(CommitSnafu)?;

            Ok(res)
        })
    }

    pub async fn write_with<T>(
        &self,
        f: impl FnOnce(&'_ WriteTransaction) -> DbResult<T>,
    ) -> DbResult<T> {
        Self::write_with_inner(&self.inner, f).await
    }

    pub async fn read_with_inner<T>(
        inner: &redb_bincode::Database,
        f: impl FnOnce(&'_ ReadTransaction) -> DbResult<T>,
    ) -> DbResult<T> {
        tokio::task::block_in_place(|| {
            let dbtx = inner.begin_read().context(TransactionSnafu)?;

            f(&dbtx)
        })
    }

    pub async fn read_with<T>(
        &self,
        f: impl FnOnce(&'_ ReadTransaction) -> DbResult<T>,
    ) -> DbResult<T> {
        Self::read_with_inner(&self.inner, f).await
    }
}

#[cfg(test)]
mod tests;
