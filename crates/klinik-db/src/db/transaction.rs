//! Transaction helper for grouped grant edits.
//!
//! ```rust,ignore
//! use diesel_async::scoped_futures::ScopedFutureExt;
//!
//! with_transaction(&mut conn, |tx| async move {
//!     diesel::delete(role_grant::table.filter(..)).execute(tx).await?;
//!     diesel::insert_into(role_grant::table).values(&rows).execute(tx).await?;
//!     Ok(())
//! }.scope_boxed()).await?;
//! ```

use diesel_async::{AsyncConnection, AsyncPgConnection, scoped_futures::ScopedBoxFuture};

use crate::error::DbError;

/// ## Summary
/// Runs a database transaction and returns the closure result. The transaction
/// is rolled back when the closure returns an error.
///
/// ## Errors
/// Returns any error produced by the closure, or errors raised while starting
/// or committing the transaction.
pub async fn with_transaction<'conn, T, F>(
    conn: &'conn mut AsyncPgConnection,
    callback: F,
) -> Result<T, DbError>
where
    F: for<'r> FnOnce(&'r mut AsyncPgConnection) -> ScopedBoxFuture<'conn, 'r, Result<T, DbError>>
        + Send
        + 'conn,
    T: Send + 'conn,
{
    conn.transaction::<_, DbError, _>(callback).await
}
