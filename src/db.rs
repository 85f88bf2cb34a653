//! Relational sink backed by `sqlx`'s driver-agnostic pool.

use std::fmt;

use async_trait::async_trait;
use sqlx::any::{install_default_drivers, AnyPoolOptions};
use sqlx::AnyPool;
use thiserror::Error;
use tracing::info;

use crate::message::LogMessage;
use crate::sink::{Sink, SinkError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum Driver {
    Sqlite,
    #[value(alias = "postgresql")]
    Postgres,
}

impl Driver {
    pub fn default_schema(&self) -> &'static str {
        match self {
            Driver::Sqlite => "main",
            Driver::Postgres => "public",
        }
    }
}

impl fmt::Display for Driver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Driver::Sqlite => f.write_str("sqlite"),
            Driver::Postgres => f.write_str("postgres"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub driver: Driver,
    pub connection_string: String,
    /// Falls back to the driver's default schema.
    pub schema: Option<String>,
    pub table: String,
    pub auto_create: bool,
}

#[derive(Debug, Error)]
pub enum DatabaseError {
    #[error("no connection string given for the {0} database")]
    MissingConnectionString(Driver),

    #[error("invalid {kind} name {name:?}: only letters, digits and underscores are allowed")]
    InvalidIdentifier { kind: &'static str, name: String },

    #[error("failed to open {driver} database: {source}")]
    Open {
        driver: Driver,
        #[source]
        source: sqlx::Error,
    },

    #[error(
        "table {schema}.{table} does not exist and auto-create is disabled; \
         provide --schema and --table together with --db-create to create it automatically"
    )]
    MissingTable { schema: String, table: String },

    #[error("failed to check for existence of {schema}.{table}: {source}")]
    Lookup {
        schema: String,
        table: String,
        #[source]
        source: sqlx::Error,
    },

    #[error("failed to create {what} for {schema}.{table}: {source}")]
    Create {
        what: &'static str,
        schema: String,
        table: String,
        #[source]
        source: sqlx::Error,
    },
}

fn validate_identifier(kind: &'static str, name: &str) -> Result<(), DatabaseError> {
    let mut chars = name.chars();
    let valid = chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_');
    if valid {
        Ok(())
    } else {
        Err(DatabaseError::InvalidIdentifier {
            kind,
            name: name.to_string(),
        })
    }
}

/// A validated, dialect-aware reference to the log table.
struct LogTable {
    driver: Driver,
    schema: String,
    table: String,
}

impl LogTable {
    fn qualified(&self) -> String {
        format!("\"{}\".\"{}\"", self.schema, self.table)
    }

    fn index_name(&self) -> String {
        format!("ix_{}_time", self.table)
    }

    async fn exists(&self, pool: &AnyPool) -> Result<bool, DatabaseError> {
        let row = match self.driver {
            Driver::Sqlite => {
                let sql = format!(
                    "SELECT name FROM \"{}\".sqlite_master WHERE type = 'table' AND name = $1",
                    self.schema
                );
                sqlx::query(&sql)
                    .bind(self.table.as_str())
                    .fetch_optional(pool)
                    .await
            }
            Driver::Postgres => {
                sqlx::query(
                    "SELECT table_name FROM information_schema.tables \
                     WHERE table_schema = $1 AND table_name = $2",
                )
                .bind(self.schema.as_str())
                .bind(self.table.as_str())
                .fetch_optional(pool)
                .await
            }
        };
        row.map(|row| row.is_some())
            .map_err(|source| DatabaseError::Lookup {
                schema: self.schema.clone(),
                table: self.table.clone(),
                source,
            })
    }

    async fn create(&self, pool: &AnyPool) -> Result<(), DatabaseError> {
        let qualified = self.qualified();
        let (create_table, create_index) = match self.driver {
            Driver::Sqlite => (
                format!(
                    "CREATE TABLE {qualified} (
                        \"id\" INTEGER PRIMARY KEY AUTOINCREMENT,
                        \"server\" TEXT NOT NULL,
                        \"log_level\" TEXT NOT NULL,
                        \"time\" TEXT NOT NULL,
                        \"message\" TEXT NULL
                    )"
                ),
                format!(
                    "CREATE INDEX \"{}\".\"{}\" ON \"{}\" (\"time\", \"id\")",
                    self.schema,
                    self.index_name(),
                    self.table
                ),
            ),
            Driver::Postgres => (
                format!(
                    "CREATE TABLE {qualified} (
                        \"id\" BIGSERIAL PRIMARY KEY,
                        \"server\" VARCHAR(255) NOT NULL,
                        \"log_level\" VARCHAR(255) NOT NULL,
                        \"time\" TIMESTAMPTZ NOT NULL,
                        \"message\" TEXT NULL
                    )"
                ),
                format!(
                    "CREATE INDEX \"{}\" ON {qualified} (\"time\", \"id\")",
                    self.index_name()
                ),
            ),
        };

        let create_err = |what: &'static str| {
            move |source: sqlx::Error| DatabaseError::Create {
                what,
                schema: self.schema.clone(),
                table: self.table.clone(),
                source,
            }
        };
        sqlx::query(&create_table)
            .execute(pool)
            .await
            .map_err(create_err("table"))?;
        info!(schema = %self.schema, table = %self.table, "created table");
        sqlx::query(&create_index)
            .execute(pool)
            .await
            .map_err(create_err("index"))?;
        info!(schema = %self.schema, table = %self.table, "created index");
        Ok(())
    }

    fn insert_sql(&self) -> String {
        let time = match self.driver {
            Driver::Sqlite => "$3",
            Driver::Postgres => "$3::timestamptz",
        };
        format!(
            "INSERT INTO {} (\"server\", \"log_level\", \"time\", \"message\") VALUES ($1, $2, {time}, $4)",
            self.qualified()
        )
    }
}

/// Inserts one row per message. The table is checked (and optionally
/// created) once, when the sink is opened.
pub struct DatabaseSink {
    pool: AnyPool,
    insert_sql: String,
}

impl DatabaseSink {
    pub async fn open(config: &DatabaseConfig) -> Result<Self, DatabaseError> {
        if config.connection_string.is_empty() {
            return Err(DatabaseError::MissingConnectionString(config.driver));
        }
        let schema = config
            .schema
            .clone()
            .unwrap_or_else(|| config.driver.default_schema().to_string());
        validate_identifier("schema", &schema)?;
        validate_identifier("table", &config.table)?;

        install_default_drivers();
        // One connection: there is only ever one consumer inserting.
        let pool = AnyPoolOptions::new()
            .max_connections(1)
            .connect(&config.connection_string)
            .await
            .map_err(|source| DatabaseError::Open {
                driver: config.driver,
                source,
            })?;

        let table = LogTable {
            driver: config.driver,
            schema,
            table: config.table.clone(),
        };
        if !table.exists(&pool).await? {
            if !config.auto_create {
                return Err(DatabaseError::MissingTable {
                    schema: table.schema,
                    table: table.table,
                });
            }
            table.create(&pool).await?;
        }
        info!(driver = %config.driver, table = %table.qualified(), "database sink ready");

        Ok(Self {
            insert_sql: table.insert_sql(),
            pool,
        })
    }
}

#[async_trait]
impl Sink for DatabaseSink {
    fn name(&self) -> &'static str {
        "database"
    }

    async fn write(&mut self, msg: &LogMessage) -> Result<(), SinkError> {
        sqlx::query(&self.insert_sql)
            .bind(msg.server.as_str())
            .bind(msg.log_level.as_str())
            .bind(msg.time_string())
            .bind(msg.message.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
