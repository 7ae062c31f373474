// Background maintenance: the blob collector drains the gc_blobs queue,
// and the sweeper aborts multipart uploads past their maximum age.

use chrono::TimeDelta;

use crate::blobs::BlobStore;
use crate::database::Database;
use crate::keyed_lock::KeyedLocks;

const GC_BATCH: i64 = 256;

/// Deletes queued orphan blobs. Rows only leave the queue once the file is
/// actually gone, so a crash mid-pass just retries.
pub async fn collect_blobs(db: &Database, blobs: &BlobStore) -> usize {
    let queued = match db.list_gc_blobs(GC_BATCH).await {
        Ok(queued) => queued,
        Err(error) => {
            tracing::warn!(%error, "Could not read gc queue");
            return 0;
        }
    };

    let mut collected = 0;
    for blob_id in queued {
        match blobs.delete(&blob_id).await {
            Ok(()) => {
                if let Err(error) = db.clear_gc_blob(&blob_id).await {
                    tracing::warn!(blob_id, %error, "Could not clear gc row");
                    continue;
                }
                collected += 1;
            }
            Err(error) => tracing::warn!(blob_id, %error, "Could not delete blob"),
        }
    }
    if collected > 0 {
        tracing::debug!(collected, "Collected orphan blobs");
    }
    collected
}

/// Aborts uploads older than the configured maximum age.
pub async fn sweep_stale_uploads(
    db: &Database,
    locks: &KeyedLocks,
    max_age_secs: u64,
) -> usize {
    let cutoff = chrono::Utc::now().naive_utc()
        - TimeDelta::seconds(max_age_secs.min(i64::MAX as u64) as i64);
    let stale = match db.stale_uploads(cutoff).await {
        Ok(stale) => stale,
        Err(error) => {
            tracing::warn!(%error, "Could not list stale uploads");
            return 0;
        }
    };

    let mut swept = 0;
    for upload in stale {
        let _guard = locks.lock(&upload.bucket, &upload.object_key).await;
        match db.abort_upload(&upload.upload_id).await {
            Ok(()) => {
                tracing::info!(
                    upload_id = upload.upload_id,
                    bucket = upload.bucket,
                    key = upload.object_key,
                    "Swept stale multipart upload"
                );
                swept += 1;
            }
            Err(error) => {
                tracing::warn!(upload_id = upload.upload_id, %error, "Could not abort upload");
            }
        }
    }
    swept
}

/// Periodic driver spawned at startup.
pub async fn run(
    db: Database,
    blobs: BlobStore,
    locks: KeyedLocks,
    interval_secs: u64,
    multipart_max_age_secs: u64,
) {
    let mut ticker = tokio::time::interval(std::time::Duration::from_secs(interval_secs.max(1)));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        collect_blobs(&db, &blobs).await;
        sweep_stale_uploads(&db, &locks, multipart_max_age_secs).await;
    }
}
