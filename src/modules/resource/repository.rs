use async_trait::async_trait;
use sqlx::{PgPool, Postgres, QueryBuilder};
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

use super::model::{CatalogPatch, PatchValue};

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("resource {0} does not exist in the catalog")]
    ResourceNotFound(Uuid),

    #[error("catalog patch for {0} has no fields")]
    EmptyPatch(Uuid),

    #[error("catalog database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl CatalogError {
    /// Whether the UPDATE might have committed even though an error came
    /// back, e.g. the connection dropped while waiting for the reply.
    pub fn may_have_committed(&self) -> bool {
        match self {
            CatalogError::ResourceNotFound(_) | CatalogError::EmptyPatch(_) => false,
            CatalogError::Database(e) => !matches!(
                e,
                sqlx::Error::Database(_)
                    | sqlx::Error::PoolTimedOut
                    | sqlx::Error::PoolClosed
                    | sqlx::Error::Configuration(_)
            ),
        }
    }
}

/// Applies sparse, last-write-wins updates to resource records.
#[async_trait]
pub trait CatalogUpdater: Send + Sync {
    async fn apply_patch(&self, resource_id: Uuid, patch: &CatalogPatch) -> Result<(), CatalogError>;
}

#[derive(Clone)]
pub struct ResourceRepository {
    pool: PgPool,
    table: String,
}

impl ResourceRepository {
    /// `table` must already be validated as a plain identifier.
    pub fn new(pool: PgPool, table: impl Into<String>) -> Self {
        Self {
            pool,
            table: table.into(),
        }
    }

    fn build_update(&self, resource_id: Uuid, patch: &CatalogPatch) -> Result<QueryBuilder<'static, Postgres>, CatalogError> {
        let columns = patch.columns();
        if columns.is_empty() {
            return Err(CatalogError::EmptyPatch(resource_id));
        }

        let mut builder = QueryBuilder::new(format!("UPDATE {} SET ", self.table));
        let mut set = builder.separated(", ");
        for (column, value) in columns {
            set.push(format!("{column} = "));
            match value {
                PatchValue::Text(v) => set.push_bind_unseparated(v),
                PatchValue::Int(v) => set.push_bind_unseparated(v),
                PatchValue::Float(v) => set.push_bind_unseparated(v),
            };
        }
        builder.push(" WHERE id = ");
        builder.push_bind(resource_id);

        Ok(builder)
    }
}

#[async_trait]
impl CatalogUpdater for ResourceRepository {
    async fn apply_patch(&self, resource_id: Uuid, patch: &CatalogPatch) -> Result<(), CatalogError> {
        let mut builder = self.build_update(resource_id, patch)?;
        debug!(sql = builder.sql(), %resource_id, "Applying catalog patch");

        let result = builder.build().execute(&self.pool).await?;

        if result.rows_affected() == 0 {
            return Err(CatalogError::ResourceNotFound(resource_id));
        }
        Ok(())
    }
}
