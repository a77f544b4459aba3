//! `encore db` handlers.

use anyhow::Result;

use super::{connect_pool, load_config};

pub async fn status(config_paths: &[String]) -> Result<()> {
    let pool = connect_pool(&load_config(config_paths)?).await?;
    let s = encore_db::status(&pool).await?;
    println!("db_ok={} has_rounds_table={}", s.ok, s.has_rounds_table);
    Ok(())
}

pub async fn migrate(config_paths: &[String], yes: bool) -> Result<()> {
    let pool = connect_pool(&load_config(config_paths)?).await?;

    // A schema change under a settlement in flight can strand its dispositions.
    let n = encore_db::count_closing_rounds(&pool).await?;
    if n > 0 && !yes {
        anyhow::bail!(
            "REFUSING MIGRATE: detected {} round(s) in CLOSING. Re-run with: `encore db migrate --yes`",
            n
        );
    }

    encore_db::migrate(&pool).await?;
    println!("migrations_applied=true");
    Ok(())
}
