use anyhow::Result;
use lazy_static::lazy_static;
use tokio::{task, time};

use std::{net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};

mod api;
mod db;
mod error;

use api::rate_limit::RateLimiter;
use api::AppState;
use db::query::FrequencyAgg;
use db::DbPool;

lazy_static! {
    static ref CONFIG: GlobalConfig = GlobalConfig::from_env().unwrap();
}

#[derive(Debug)]
struct GlobalConfig {
    database_url: String,
    listen_addr: String,
    seed_path: PathBuf,
    pool_size: u32,
    rate_limit_per_minute: u32,
}

impl GlobalConfig {
    const DATABASE_URL_ENV_VAR: &'static str = "DATABASE_URL";
    const LISTEN_ADDR_ENV_VAR: &'static str = "API_ADDR";
    const SEED_PATH_ENV_VAR: &'static str = "SEED_SQL_PATH";
    const POOL_SIZE_ENV_VAR: &'static str = "POOL_SIZE";
    const RATE_LIMIT_ENV_VAR: &'static str = "RATE_LIMIT_PER_MINUTE";

    fn from_env() -> Result<Self> {
        dotenv::dotenv()?;
        let database_url = dotenv::var(Self::DATABASE_URL_ENV_VAR)?;

        let listen_addr =
            dotenv::var(Self::LISTEN_ADDR_ENV_VAR).unwrap_or_else(|_| "0.0.0.0:8000".to_owned());

        let seed_path = PathBuf::from(
            dotenv::var(Self::SEED_PATH_ENV_VAR).unwrap_or_else(|_| "db/init_data.sql".to_owned()),
        );

        let pool_size = match dotenv::var(Self::POOL_SIZE_ENV_VAR) {
            Ok(raw) => raw.parse()?,
            Err(_) => 20,
        };

        let rate_limit_per_minute = match dotenv::var(Self::RATE_LIMIT_ENV_VAR) {
            Ok(raw) => raw.parse()?,
            Err(_) => 100,
        };

        Ok(Self {
            database_url,
            listen_addr,
            seed_path,
            pool_size,
            rate_limit_per_minute,
        })
    }
}

const INIT_MAX_RETRIES: u32 = 5;
const INIT_RETRY_INTERVAL: Duration = Duration::from_secs(5);

/// Brings the store up before the server accepts traffic: DDL, one-time
/// seeding and aggregate detection, retried a bounded number of times.
async fn init_store(pool: &DbPool) -> Result<FrequencyAgg> {
    let mut attempt = 0;
    loop {
        attempt += 1;

        let pool = pool.clone();
        let result = task::spawn_blocking(move || -> Result<FrequencyAgg> {
            let mut conn = pool.get()?;
            db::prepare_tables(&mut conn)?;
            db::seed_if_empty(&mut conn, &CONFIG.seed_path)?;

            let devices = db::registered_devices(&mut conn)?;
            log::info!("store ready, {} devices registered: {devices:?}", devices.len());

            Ok(FrequencyAgg::detect(&mut conn))
        })
        .await?;

        match result {
            Ok(agg) => return Ok(agg),
            Err(e) if attempt < INIT_MAX_RETRIES => {
                log::warn!(
                    "store init attempt {attempt}/{INIT_MAX_RETRIES} failed, retrying in {}s: {e}",
                    INIT_RETRY_INTERVAL.as_secs()
                );
                time::sleep(INIT_RETRY_INTERVAL).await;
            }
            Err(e) => {
                log::error!("store init failed after {INIT_MAX_RETRIES} attempts: {e}");
                return Err(e);
            }
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    pretty_env_logger::init();
    log::info!("starting noise-node");

    let pool = db::build_pool(&CONFIG.database_url, CONFIG.pool_size)?;
    let agg = init_store(&pool).await?;

    let state = AppState {
        pool,
        agg,
        limiter: Arc::new(RateLimiter::new(CONFIG.rate_limit_per_minute)),
    };
    let app = api::router(state);

    let listener = tokio::net::TcpListener::bind(&CONFIG.listen_addr).await?;
    log::info!("listening on {}", CONFIG.listen_addr);
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;

    Ok(())
}
