use anyhow::{Context, Result};
use sqlx::postgres::PgPoolOptions;

mod store;

pub use sqlx::PgPool;
pub use store::PgStore;

pub const ENV_DB_URL: &str = "ENCORE_DATABASE_URL";

pub async fn connect(url: &str) -> Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(url)
        .await
        .context("failed to connect to Postgres")?;
    Ok(pool)
}

/// Run embedded SQLx migrations.
pub async fn migrate(pool: &PgPool) -> Result<()> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .context("db migrate failed")?;
    Ok(())
}

/// Simple status query (connectivity + schema presence).
pub async fn status(pool: &PgPool) -> Result<DbStatus> {
    let (one,): (i32,) = sqlx::query_as::<_, (i32,)>("select 1")
        .fetch_one(pool)
        .await
        .context("status connectivity query failed")?;

    let (exists,): (bool,) = sqlx::query_as::<_, (bool,)>(
        r#"
        select exists (
            select 1
            from information_schema.tables
            where table_schema = 'public' and table_name = 'bidding_rounds'
        )
        "#,
    )
    .fetch_one(pool)
    .await
    .context("status table-exists query failed")?;

    Ok(DbStatus {
        ok: one == 1,
        has_rounds_table: exists,
    })
}

#[derive(Debug, Clone)]
pub struct DbStatus {
    pub ok: bool,
    pub has_rounds_table: bool,
}

/// Rounds currently in `closing`. Used by the CLI to refuse migrating under a
/// settlement in flight.
pub async fn count_closing_rounds(pool: &PgPool) -> Result<i64> {
    let st = status(pool).await?;
    if !st.has_rounds_table {
        return Ok(0);
    }
    let (n,): (i64,) = sqlx::query_as::<_, (i64,)>(
        "select count(*)::bigint from bidding_rounds where status = 'closing'",
    )
    .fetch_one(pool)
    .await
    .context("count_closing_rounds failed")?;
    Ok(n)
}
