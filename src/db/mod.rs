use anyhow::Result;
use chrono::prelude::*;
use diesel::backend;
use diesel::connection::SimpleConnection;
use diesel::deserialize::{self, FromSql};
use diesel::r2d2::{ConnectionManager, CustomizeConnection, Pool};
use diesel::serialize::{self, IsNull, Output, ToSql};
use diesel::sql_types::BigInt;
use diesel::sqlite::Sqlite;
use diesel::{prelude::*, AsExpression, FromSqlRow};

use std::ops::Deref;
use std::path::Path;

pub mod query;
pub mod schema;

pub type DbPool = Pool<ConnectionManager<SqliteConnection>>;

const SCHEMA_SQL: &str = "
CREATE TABLE IF NOT EXISTS fd_list (
    id INTEGER PRIMARY KEY NOT NULL,
    name TEXT NOT NULL,
    latitude REAL NOT NULL,
    longitude REAL NOT NULL
);
CREATE TABLE IF NOT EXISTS measurements (
    id INTEGER PRIMARY KEY AUTOINCREMENT NOT NULL,
    device_id INTEGER NOT NULL REFERENCES fd_list (id) ON DELETE CASCADE,
    timestamp BIGINT NOT NULL,
    frequency BIGINT NOT NULL,
    rssi INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_measurements_timestamp ON measurements (timestamp);
CREATE INDEX IF NOT EXISTS idx_measurements_rssi ON measurements (rssi);
";

#[derive(Debug, Queryable)]
#[allow(dead_code)]
pub struct Device {
    id: i32,
    name: String,
    latitude: f64,
    longitude: f64,
}

/// Full measurement row. The read path only ever selects aggregated tuples,
/// so this mirrors the table mostly for the writer side and tests.
#[derive(Debug, Queryable)]
#[allow(dead_code)]
pub struct Measurement {
    id: i32,
    device_id: i32,
    timestamp: DateTimeUtc,
    frequency: i64,
    rssi: i32,
}

/// Timezone-aware instant persisted as microseconds since the Unix epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, AsExpression, FromSqlRow)]
#[diesel(sql_type = BigInt)]
pub struct DateTimeUtc(DateTime<Utc>);

impl From<DateTime<Utc>> for DateTimeUtc {
    fn from(instant: DateTime<Utc>) -> Self {
        DateTimeUtc(instant)
    }
}

impl Deref for DateTimeUtc {
    type Target = DateTime<Utc>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl FromSql<BigInt, Sqlite> for DateTimeUtc
where
    i64: FromSql<BigInt, Sqlite>,
{
    fn from_sql(value: backend::RawValue<'_, Sqlite>) -> deserialize::Result<Self> {
        let micros = i64::from_sql(value)?;
        let instant =
            DateTime::from_timestamp_micros(micros).ok_or("timestamp out of chrono range")?;

        Ok(DateTimeUtc(instant))
    }
}

impl ToSql<BigInt, Sqlite> for DateTimeUtc
where
    i64: ToSql<BigInt, Sqlite>,
{
    fn to_sql<'b>(&'b self, out: &mut Output<'b, '_, Sqlite>) -> serialize::Result {
        out.set_value(self.0.timestamp_micros());

        Ok(IsNull::No)
    }
}

/// SQLite ships with foreign keys off; the cascade from measurements to
/// fd_list only holds if every pooled connection turns them on.
#[derive(Debug, Clone, Copy)]
struct ForeignKeysOn;

impl CustomizeConnection<SqliteConnection, diesel::r2d2::Error> for ForeignKeysOn {
    fn on_acquire(&self, conn: &mut SqliteConnection) -> Result<(), diesel::r2d2::Error> {
        conn.batch_execute("PRAGMA foreign_keys = ON;")
            .map_err(diesel::r2d2::Error::QueryError)
    }
}

pub fn build_pool(database_url: &str, max_size: u32) -> Result<DbPool> {
    let manager = ConnectionManager::<SqliteConnection>::new(database_url);
    let pool = Pool::builder()
        .max_size(max_size)
        .connection_customizer(Box::new(ForeignKeysOn))
        .build(manager)?;

    Ok(pool)
}

pub fn prepare_tables(conn: &mut SqliteConnection) -> QueryResult<()> {
    conn.batch_execute(SCHEMA_SQL)
}

/// Executes the seed script when the device table is empty. Returns whether
/// seeding ran.
pub fn seed_if_empty(conn: &mut SqliteConnection, seed_path: &Path) -> Result<bool> {
    let devices: i64 = schema::fd_list::table.count().get_result(conn)?;
    if devices > 0 {
        return Ok(false);
    }

    if !seed_path.exists() {
        log::warn!(
            "device table empty and seed script {} not found, starting without reference data",
            seed_path.display()
        );
        return Ok(false);
    }

    let script = std::fs::read_to_string(seed_path)?;
    conn.batch_execute(&script)?;
    log::info!("seeded reference data from {}", seed_path.display());

    Ok(true)
}

pub fn registered_devices(conn: &mut SqliteConnection) -> QueryResult<Vec<Device>> {
    schema::fd_list::table.load::<Device>(conn)
}
