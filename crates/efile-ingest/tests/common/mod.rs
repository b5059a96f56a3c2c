//! Shared helpers for integration tests that need PostgreSQL
//!
//! Each test gets its own container with the filings table and a handful of
//! record tables created up front.

#![allow(dead_code)]

use anyhow::{Context, Result};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::time::Duration;
use testcontainers::{core::IntoContainerPort, runners::AsyncRunner, ContainerAsync};
use testcontainers_modules::postgres::Postgres;
use tracing::{debug, info};

pub const FILINGS_TABLE: &str = "filing_filing";
pub const RECORD_PREFIX: &str = "return_";

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE filing_filing (
        object_id TEXT PRIMARY KEY,
        submission_year INTEGER NOT NULL,
        ein TEXT NOT NULL,
        parse_started BOOLEAN,
        parse_complete BOOLEAN,
        processed_at TIMESTAMPTZ,
        schema_version TEXT,
        is_error BOOLEAN NOT NULL DEFAULT FALSE,
        error_details TEXT,
        key_error_count INTEGER NOT NULL DEFAULT 0
    )
    "#,
    r#"
    CREATE TABLE return_returnheader_part (
        object_id TEXT PRIMARY KEY,
        ein TEXT NOT NULL,
        returnts TEXT
    )
    "#,
    r#"
    CREATE TABLE return_returnheader_filer (
        object_id TEXT PRIMARY KEY,
        ein TEXT NOT NULL,
        businessname_businessnameline1txt TEXT
    )
    "#,
    r#"
    CREATE TABLE return_irs990_part (
        object_id TEXT PRIMARY KEY,
        ein TEXT NOT NULL,
        totalrevenueamt NUMERIC,
        websiteaddresstxt TEXT
    )
    "#,
    r#"
    CREATE TABLE return_irs990_form990partviisectionagrp (
        id BIGSERIAL PRIMARY KEY,
        object_id TEXT NOT NULL,
        ein TEXT NOT NULL,
        personnm TEXT,
        averagehoursperweekrt NUMERIC,
        UNIQUE (object_id, personnm)
    )
    "#,
];

/// PostgreSQL container with the ingestion schema applied
pub struct TestPostgres {
    _container: ContainerAsync<Postgres>,
    pool: PgPool,
}

impl TestPostgres {
    pub async fn start() -> Result<Self> {
        info!("Starting PostgreSQL test container...");

        let container = Postgres::default()
            .start()
            .await
            .context("Failed to start PostgreSQL container")?;

        let host = container
            .get_host()
            .await
            .context("Failed to get container host")?;
        let port = container
            .get_host_port_ipv4(5432.tcp())
            .await
            .context("Failed to get container port")?;

        let connection_string =
            format!("postgresql://postgres:postgres@{}:{}/postgres", host, port);
        debug!("PostgreSQL connection: {}", connection_string);

        let pool = PgPoolOptions::new()
            .max_connections(5)
            .acquire_timeout(Duration::from_secs(30))
            .connect(&connection_string)
            .await
            .context("Failed to connect to PostgreSQL")?;

        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&pool)
                .await
                .context("Failed to create test schema")?;
        }

        Ok(Self {
            _container: container,
            pool,
        })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Insert a filing row as discovery would
    pub async fn insert_filing(&self, object_id: &str, year: i32, ein: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO filing_filing (object_id, submission_year, ein) VALUES ($1, $2, $3)",
        )
        .bind(object_id)
        .bind(year)
        .bind(ein)
        .execute(&self.pool)
        .await
        .context("Failed to insert filing")?;
        Ok(())
    }

    pub async fn count(&self, table: &str) -> Result<i64> {
        let count = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {}", table))
            .fetch_one(&self.pool)
            .await
            .context("Failed to count rows")?;
        Ok(count)
    }
}

pub fn init_test_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let _ = fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new("info,efile_ingest=debug,sqlx=warn,testcontainers=info")
        }))
        .with_test_writer()
        .try_init();
}
