use sea_orm_migration::prelude::*;

pub struct Migration;

impl MigrationName for Migration {
    fn name(&self) -> &str {
        "m001_metrics"
    }
}

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager.get_connection().execute_unprepared(UP_SQL).await?;
        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .get_connection()
            .execute_unprepared(DOWN_SQL)
            .await?;
        Ok(())
    }
}

// The composite key is the upsert target. The second unique index on `id`
// alone makes a write under the other kind fail instead of creating a twin row.
const UP_SQL: &str = "
CREATE TABLE IF NOT EXISTS metrics (
    id TEXT NOT NULL,
    kind TEXT NOT NULL,
    value DOUBLE PRECISION,
    delta BIGINT,
    PRIMARY KEY (id, kind)
);
CREATE UNIQUE INDEX IF NOT EXISTS idx_metrics_id ON metrics(id);
";

const DOWN_SQL: &str = "
DROP INDEX IF EXISTS idx_metrics_id;
DROP TABLE IF EXISTS metrics;
";
