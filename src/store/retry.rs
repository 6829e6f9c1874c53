use std::time::Duration;

use crate::error::Result;

use super::collection::{Collection, Object};

/// Attempts made before a persistent conflict is surfaced to the caller.
const MAX_ATTEMPTS: u32 = 5;

/// Delay after the first conflicted attempt; doubles per retry.
const INITIAL_BACKOFF: Duration = Duration::from_millis(10);

/// Read-modify-write an object until the write lands or attempts run out.
///
/// On every attempt the object is re-read so `mutate` always sees the
/// latest state. Errors other than a version conflict, including the
/// object not existing, propagate immediately.
pub async fn retry_on_conflict<T, F>(
    collection: &Collection<T>,
    namespace: &str,
    name: &str,
    mut mutate: F,
) -> Result<T>
where
    T: Object,
    F: FnMut(&mut T) -> Result<()>,
{
    let mut backoff = INITIAL_BACKOFF;
    let mut attempt = 1;
    loop {
        let mut obj = collection.get(namespace, name).await?;
        mutate(&mut obj)?;
        match collection.update(obj).await {
            Ok(updated) => return Ok(updated),
            Err(err) if err.is_conflict() && attempt < MAX_ATTEMPTS => {
                tracing::debug!(
                    kind = T::KIND,
                    name,
                    attempt,
                    "Update conflicted, retrying"
                );
                tokio::time::sleep(backoff).await;
                backoff *= 2;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}
