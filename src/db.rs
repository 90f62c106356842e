use sqlx::postgres::PgConnectOptions;
use sqlx::{Connection, PgConnection};

use crate::insert::NAMES_TABLE;

/// Open the single connection a load runs on.
pub async fn connect(options: &PgConnectOptions) -> Result<PgConnection, sqlx::Error> {
    let conn = PgConnection::connect_with(options).await?;
    log::info!(
        "connected to {}:{}/{}",
        options.get_host(),
        options.get_port(),
        options.get_database().unwrap_or("postgres")
    );
    Ok(conn)
}

/// Empty the names table before loading.
pub async fn truncate_names(conn: &mut PgConnection) -> Result<(), sqlx::Error> {
    sqlx::query(&format!("TRUNCATE TABLE {NAMES_TABLE}"))
        .execute(&mut *conn)
        .await?;
    log::info!("truncated table {}", NAMES_TABLE);
    Ok(())
}

/// Rows currently stored in the names table.
pub async fn count_names(conn: &mut PgConnection) -> Result<i64, sqlx::Error> {
    sqlx::query_scalar::<_, i64>(&format!("SELECT COUNT(*) FROM {NAMES_TABLE}"))
        .fetch_one(&mut *conn)
        .await
}
