//! Bulk loader for name-frequency records.
//!
//! Line-delimited JSON exports are scanned lazily into validated
//! [`models::Record`]s and written to the PostgreSQL `names` table with one of
//! three insertion strategies, optionally pipelined.

pub mod config;
pub mod db;
pub mod ingest;
pub mod insert;
pub mod load;
pub mod logging;
pub mod models;

#[cfg_attr(not(test), allow(dead_code))]
pub mod test_support {
    pub use database::{TestDatabase, TestDatabaseError};
    pub use memory::MemoryDestination;

    pub mod memory {
        use async_trait::async_trait;
        use std::sync::{Arc, Mutex, MutexGuard};
        use std::time::Duration;

        use crate::insert::{ColumnBatch, Destination, DestinationError, RowSource, Statement};
        use crate::models::Record;

        #[derive(Debug, Default)]
        struct State {
            rows: Vec<Record>,
            batch_sizes: Vec<usize>,
            attempts: usize,
            prepared: Vec<&'static str>,
            deallocated: Vec<&'static str>,
        }

        /// In-memory [`Destination`] that commits whole transmissions.
        ///
        /// Clones share state, so a test can keep one handle while the
        /// inserter owns the other. Every transmission (a copy stream, a
        /// prepared batch or an array insert) counts as one attempt.
        #[derive(Debug, Clone, Default)]
        pub struct MemoryDestination {
            state: Arc<Mutex<State>>,
            fail_on_attempt: Option<usize>,
            fail_prepare: bool,
            latency: Option<Duration>,
        }

        fn injected(what: &str) -> DestinationError {
            DestinationError::Database(sqlx::Error::Protocol(format!("injected {what} failure")))
        }

        impl MemoryDestination {
            /// Fail the `attempt`-th transmission (1-based).
            pub fn fail_transmission(mut self, attempt: usize) -> Self {
                self.fail_on_attempt = Some(attempt);
                self
            }

            pub fn fail_prepare(mut self) -> Self {
                self.fail_prepare = true;
                self
            }

            /// Delay every transmission, to make overlap observable.
            pub fn with_latency(mut self, latency: Duration) -> Self {
                self.latency = Some(latency);
                self
            }

            pub fn rows(&self) -> Vec<Record> {
                self.lock().rows.clone()
            }

            pub fn batch_sizes(&self) -> Vec<usize> {
                self.lock().batch_sizes.clone()
            }

            pub fn attempts(&self) -> usize {
                self.lock().attempts
            }

            pub fn prepared(&self) -> Vec<&'static str> {
                self.lock().prepared.clone()
            }

            pub fn deallocated(&self) -> Vec<&'static str> {
                self.lock().deallocated.clone()
            }

            fn lock(&self) -> MutexGuard<'_, State> {
                match self.state.lock() {
                    Ok(guard) => guard,
                    Err(poisoned) => poisoned.into_inner(),
                }
            }

            async fn commit(&self, rows: Vec<Record>) -> Result<u64, DestinationError> {
                let attempt = {
                    let mut state = self.lock();
                    state.attempts += 1;
                    state.attempts
                };
                if let Some(latency) = self.latency {
                    tokio::time::sleep(latency).await;
                }
                if self.fail_on_attempt == Some(attempt) {
                    return Err(injected("transmission"));
                }

                let mut state = self.lock();
                state.batch_sizes.push(rows.len());
                let committed = rows.len() as u64;
                state.rows.extend(rows);
                Ok(committed)
            }
        }

        #[async_trait]
        impl Destination for MemoryDestination {
            async fn copy_rows(
                &mut self,
                _table: &str,
                _columns: &[&str],
                rows: &mut dyn RowSource,
            ) -> Result<u64, DestinationError> {
                let mut buffered = Vec::new();
                while let Some(row) = rows.next_row().await? {
                    buffered.push(row);
                }
                self.commit(buffered).await
            }

            async fn prepare_statement(
                &mut self,
                statement: &Statement,
            ) -> Result<(), DestinationError> {
                if self.fail_prepare {
                    return Err(injected("prepare"));
                }
                self.lock().prepared.push(statement.name);
                Ok(())
            }

            async fn deallocate_statement(
                &mut self,
                statement: &Statement,
            ) -> Result<(), DestinationError> {
                self.lock().deallocated.push(statement.name);
                Ok(())
            }

            async fn execute_batch(
                &mut self,
                _statement: &Statement,
                rows: &[Record],
            ) -> Result<u64, DestinationError> {
                self.commit(rows.to_vec()).await
            }

            async fn execute_columns(
                &mut self,
                _statement: &Statement,
                columns: &ColumnBatch,
            ) -> Result<u64, DestinationError> {
                self.commit(columns.to_records()).await
            }
        }
    }

    pub mod database {
        use log::LevelFilter;
        use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
        use sqlx::{ConnectOptions, Connection, PgConnection, PgPool};
        use testcontainers::{GenericImage, ImageExt, core::WaitFor};
        use testcontainers_modules::testcontainers::{
            ContainerAsync, core::error::TestcontainersError, runners::AsyncRunner,
        };
        use thiserror::Error;
        use tokio::runtime::Handle;
        use uuid::Uuid;

        /// Schema the loader expects to exist before a run.
        pub const NAMES_SCHEMA: [&str; 3] = [
            "CREATE TYPE name_type_enum AS ENUM ('name', 'surname', 'patronymic')",
            "CREATE TYPE gender_enum AS ENUM ('unknown', 'male', 'female')",
            "CREATE TABLE names (
                id BIGSERIAL PRIMARY KEY,
                count INTEGER NOT NULL CHECK (count > 0),
                name_type name_type_enum NOT NULL,
                name_text TEXT NOT NULL,
                gender gender_enum NOT NULL DEFAULT 'unknown'
            )",
        ];

        #[derive(Debug, Error)]
        pub enum TestDatabaseError {
            #[error("TEST_DATABASE_URL not set (or set TEST_DATABASE_CONTAINER=1)")]
            MissingUrl,
            #[error("database error: {0}")]
            Sqlx(#[from] sqlx::Error),
            #[error("container error: {0}")]
            Container(#[from] TestcontainersError),
        }

        /// Ephemeral database with the names schema, for integration tests.
        pub struct TestDatabase {
            pool: Option<PgPool>,
            options: PgConnectOptions,
            admin_options: PgConnectOptions,
            database_name: String,
            container: Option<ContainerAsync<GenericImage>>,
        }

        impl TestDatabase {
            /// Use `TEST_DATABASE_URL` if set, else a disposable container when
            /// `TEST_DATABASE_CONTAINER=1`, else [`TestDatabaseError::MissingUrl`].
            pub async fn new_from_env() -> Result<Self, TestDatabaseError> {
                if let Ok(url) = std::env::var("TEST_DATABASE_URL") {
                    return Self::with_base_url(&url, None).await;
                }
                if std::env::var("TEST_DATABASE_CONTAINER").is_ok_and(|v| v == "1") {
                    return Self::in_container().await;
                }
                Err(TestDatabaseError::MissingUrl)
            }

            /// Provision a fresh database inside a disposable Postgres container.
            pub async fn in_container() -> Result<Self, TestDatabaseError> {
                let image = GenericImage::new("postgres", "16-alpine")
                    .with_wait_for(WaitFor::message_on_stdout(
                        "database system is ready to accept connections",
                    ))
                    .with_wait_for(WaitFor::message_on_stderr(
                        "database system is ready to accept connections",
                    ));

                let container = image
                    .with_env_var("POSTGRES_DB", "postgres")
                    .with_env_var("POSTGRES_USER", "postgres")
                    .with_env_var("POSTGRES_PASSWORD", "postgres")
                    .start()
                    .await?;

                let host = container.get_host().await?.to_string();
                let port = container.get_host_port_ipv4(5432).await?;
                let url = format!("postgres://postgres:postgres@{}:{}/postgres", host, port);

                Self::with_base_url(&url, Some(container)).await
            }

            async fn with_base_url(
                url: &str,
                container: Option<ContainerAsync<GenericImage>>,
            ) -> Result<Self, TestDatabaseError> {
                let base_options: PgConnectOptions = url.parse()?;
                let base_options = base_options.log_statements(LevelFilter::Off);

                let base_name = base_options
                    .get_database()
                    .map(|s| s.to_string())
                    .unwrap_or_else(|| "postgres".to_string());

                let admin_options = base_options.clone().database("postgres");
                let mut admin = PgConnection::connect_with(&admin_options).await?;

                let database_name = format!("{}_{}", base_name, Uuid::new_v4().simple());
                let create_sql = format!("CREATE DATABASE \"{}\" TEMPLATE template0", database_name);
                sqlx::query(&create_sql).execute(&mut admin).await?;
                admin.close().await?;

                let options = base_options.database(&database_name);
                let pool = PgPoolOptions::new()
                    .max_connections(5)
                    .connect_with(options.clone())
                    .await?;

                for statement in NAMES_SCHEMA {
                    sqlx::query(statement).execute(&pool).await?;
                }

                Ok(Self {
                    pool: Some(pool),
                    options,
                    admin_options,
                    database_name,
                    container,
                })
            }

            pub fn pool(&self) -> &PgPool {
                self.pool.as_ref().expect("test database pool is available")
            }

            /// Options pointing at the ephemeral database.
            pub fn connect_options(&self) -> &PgConnectOptions {
                &self.options
            }

            /// A dedicated connection, as the loader uses.
            pub async fn connection(&self) -> Result<PgConnection, TestDatabaseError> {
                Ok(PgConnection::connect_with(&self.options).await?)
            }

            /// All stored rows, ordered by insertion.
            pub async fn stored_names(
                &self,
            ) -> Result<Vec<(i32, String, String, String)>, TestDatabaseError> {
                Ok(sqlx::query_as(
                    "SELECT count, name_type::text, name_text, gender::text FROM names ORDER BY id",
                )
                .fetch_all(self.pool())
                .await?)
            }

            /// Close pool connections and drop the ephemeral database.
            pub async fn close(mut self) -> Result<(), TestDatabaseError> {
                if let Some(pool) = self.pool.take() {
                    pool.close().await;
                }

                drop_database_with_fallback(self.admin_options.clone(), &self.database_name)
                    .await?;

                if let Some(container) = self.container.take() {
                    drop(container);
                }

                Ok(())
            }
        }

        async fn drop_database_with_fallback(
            admin_options: PgConnectOptions,
            database_name: &str,
        ) -> Result<(), sqlx::Error> {
            let mut admin = PgConnection::connect_with(&admin_options).await?;

            let drop_force = format!("DROP DATABASE \"{}\" WITH (FORCE)", database_name);
            match sqlx::query(&drop_force).execute(&mut admin).await {
                Ok(_) => Ok(()),
                Err(err) if force_drop_unsupported(&err) => {
                    let drop_sql = format!("DROP DATABASE \"{}\"", database_name);
                    sqlx::query(&drop_sql).execute(&mut admin).await?;
                    Ok(())
                }
                Err(err) => Err(err),
            }
        }

        fn force_drop_unsupported(err: &sqlx::Error) -> bool {
            matches!(
                err,
                sqlx::Error::Database(db_err)
                    if db_err
                        .code()
                        .map(|code| code == "42601" || code == "0A000")
                        .unwrap_or(false)
            )
        }

        impl Drop for TestDatabase {
            fn drop(&mut self) {
                if let Some(pool) = self.pool.take() {
                    let admin_options = self.admin_options.clone();
                    let db_name = self.database_name.clone();
                    if let Ok(handle) = Handle::try_current() {
                        handle.spawn(async move {
                            pool.close().await;
                            let _ = drop_database_with_fallback(admin_options, &db_name).await;
                        });
                    } else {
                        std::thread::spawn(move || {
                            if let Ok(rt) = tokio::runtime::Runtime::new() {
                                rt.block_on(async move {
                                    pool.close().await;
                                    let _ = drop_database_with_fallback(admin_options, &db_name)
                                        .await;
                                });
                            }
                        });
                    }
                }

                if let Some(container) = self.container.take() {
                    drop(container);
                }
            }
        }
    }
}
