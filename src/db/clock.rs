//! Change clock
//!
//! Every sync write transaction starts with [`next_stamp`]. Its first
//! statement is a write, so SQLite takes the write lock before the
//! transaction reads anything, and stamps come out in commit order. A reader
//! that sees `last_stamp = L` can rely on every later commit being stamped
//! after `L`.

use chrono::{DateTime, Utc};
use sqlx::SqliteConnection;

use super::timestamp;
use crate::error::Result;

/// Take the write lock and issue a stamp newer than any committed one
pub async fn next_stamp(conn: &mut SqliteConnection) -> Result<DateTime<Utc>> {
    // Must stay the first statement of the transaction
    sqlx::query("UPDATE sync_clock SET last_stamp = last_stamp WHERE id = 1")
        .execute(&mut *conn)
        .await?;

    let last = last_stamp(conn).await?;
    let stamp = timestamp::next_after(&last, timestamp::now());

    sqlx::query("UPDATE sync_clock SET last_stamp = ? WHERE id = 1")
        .bind(timestamp::format(&stamp))
        .execute(&mut *conn)
        .await?;

    Ok(stamp)
}

/// Newest stamp visible to this connection's snapshot
pub async fn last_stamp(conn: &mut SqliteConnection) -> Result<DateTime<Utc>> {
    let (raw,): (String,) = sqlx::query_as("SELECT last_stamp FROM sync_clock WHERE id = 1")
        .fetch_one(&mut *conn)
        .await?;

    Ok(timestamp::parse(&raw)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::create_test_pool;

    #[tokio::test]
    async fn test_stamps_strictly_increase() {
        let pool = create_test_pool().await;
        let mut conn = pool.acquire().await.unwrap();

        let start = last_stamp(&mut conn).await.unwrap();
        let first = next_stamp(&mut conn).await.unwrap();
        let second = next_stamp(&mut conn).await.unwrap();

        assert!(first > start);
        assert!(second > first);
        assert_eq!(last_stamp(&mut conn).await.unwrap(), second);
    }
}
