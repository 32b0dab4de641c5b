use anyhow::Context;
use folio_db::{create_sqlx_pool, PgConfig, MIGRATOR};

/// Brings the comments database schema up to date
#[derive(structopt::StructOpt)]
struct Opt {
    #[structopt(long, env = "DATABASE_URL")]
    database_url: String,

    /// Size of the connection pool
    #[structopt(long, env = "FOLIO_MAX_CONNECTIONS", default_value = "8")]
    max_connections: u32,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();
    let opt = <Opt as structopt::StructOpt>::from_args();

    let config = PgConfig {
        url: opt.database_url,
        max_connections: opt.max_connections,
    };
    let pool = create_sqlx_pool(&config).await?;

    tracing::info!("applying migrations");
    MIGRATOR
        .run(&pool)
        .await
        .context("applying database migrations")?;
    tracing::info!("database is up to date");

    Ok(())
}
