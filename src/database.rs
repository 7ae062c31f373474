use std::str::FromStr;
use std::time::Duration;

use chrono::NaiveDateTime;
use futures::TryFutureExt;
use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use thiserror::Error;
use tracing::Instrument;

use crate::cli;

/// Read-only statements are retried this many extra times on SQLITE_BUSY.
const READ_RETRIES: u32 = 3;

#[derive(Error, Debug)]
pub enum DatabaseError {
    #[error("SQL error: {0}")]
    SqlxError(#[from] sqlx::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Database initialization failed")]
    InitializationFailed(#[from] sqlx::migrate::MigrateError),
}

#[derive(Clone)]
pub struct Database {
    pub pool: SqlitePool,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Bucket {
    pub name: String,
    pub owner: String,
    pub created_at: NaiveDateTime,
    pub versioning_enabled: bool,
    pub object_lock_enabled: bool,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ObjectRecord {
    pub id: i64,
    pub bucket: String,
    pub object_key: String,
    pub version_id: String,
    pub blob_id: Option<String>,
    pub size: i64,
    pub etag: String,
    pub content_type: String,
    pub modified_at: NaiveDateTime,
    pub is_latest: bool,
    pub delete_marker: bool,
    pub encryption_type: Option<String>,
    pub lock_mode: Option<String>,
    pub retain_until: Option<NaiveDateTime>,
    pub legal_hold: bool,
}

/// Fields of a version row about to be written.
#[derive(Debug, Clone)]
pub struct NewObjectVersion {
    pub bucket: String,
    pub object_key: String,
    pub version_id: String,
    pub blob_id: Option<String>,
    pub size: i64,
    pub etag: String,
    pub content_type: String,
    pub delete_marker: bool,
    pub encryption_type: Option<String>,
    pub lock_mode: Option<String>,
    pub retain_until: Option<NaiveDateTime>,
    pub legal_hold: bool,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct BucketConfig {
    pub bucket: String,
    pub cors_json: Option<String>,
    pub lifecycle_json: Option<String>,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct MultipartUpload {
    pub upload_id: String,
    pub bucket: String,
    pub object_key: String,
    pub encryption_type: Option<String>,
    pub created_at: NaiveDateTime,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct MultipartPart {
    pub upload_id: String,
    pub part_number: i64,
    pub blob_id: String,
    pub etag: String,
    pub size: i64,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct AccessKey {
    pub access_key_id: String,
    pub secret_access_key: String,
    pub username: String,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct UserRecord {
    pub username: String,
    pub password_hash: String,
    pub created_at: NaiveDateTime,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct PolicyRow {
    pub name: String,
    pub policy_json: String,
}

fn is_busy(error: &sqlx::Error) -> bool {
    matches!(error, sqlx::Error::Database(db)
        if db.message().contains("locked") || db.message().contains("busy"))
}

macro_rules! retry_read {
    ($query:expr) => {{
        let mut attempt = 0u32;
        loop {
            match $query {
                Err(error) if attempt < READ_RETRIES && is_busy(&error) => {
                    attempt += 1;
                    tokio::time::sleep(Duration::from_millis(25 * u64::from(attempt))).await;
                }
                other => break other,
            }
        }
    }};
}

impl Database {
    async fn new_with_config(
        database_url: &str,
        config: &cli::SqliteConfig,
    ) -> Result<Self, sqlx::Error> {
        let options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .foreign_keys(true)
            .auto_vacuum(config.auto_vacuum.unwrap_or_default().into())
            .journal_mode(config.journal_mode.unwrap_or_default().into())
            .synchronous(config.synchronous.unwrap_or_default().into())
            .busy_timeout(Duration::from_secs(30))
            .optimize_on_close(true, None);
        let pool = SqlitePoolOptions::new()
            .acquire_timeout(Duration::from_secs(1))
            .max_connections(8)
            .connect_with(options)
            .await?;
        Ok(Self { pool })
    }

    /// Initialize the database by ensuring it exists and running migrations
    pub async fn initialize(
        database_url: &str,
        config: &cli::SqliteConfig,
    ) -> Result<Self, DatabaseError> {
        // Ensure the parent directory exists for file-backed databases.
        if let Some(path) = database_url
            .strip_prefix("sqlite:")
            .filter(|p| !p.starts_with(':'))
            && let Some(parent) = std::path::Path::new(path).parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }

        tracing::info!(db = database_url, "Initializing database");
        let db = Self::new_with_config(database_url, config)
            .inspect_ok(|_| tracing::trace!("connected to database"))
            .await?;

        sqlx::migrate!("./migrations")
            .run(&db.pool)
            .inspect_ok(|()| tracing::trace!("applied migrations"))
            .await?;

        tracing::info!("Database initialized successfully");
        Ok(db)
    }

    pub async fn ping(&self) -> bool {
        sqlx::query_scalar::<_, i64>("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .is_ok()
    }

    // ---- principals ----------------------------------------------------

    pub async fn set_password_hash(
        &self,
        username: &str,
        password_hash: &str,
    ) -> Result<(), DatabaseError> {
        sqlx::query(
            "INSERT INTO users (username, password_hash) VALUES (?, ?)
             ON CONFLICT (username) DO UPDATE SET password_hash = excluded.password_hash",
        )
        .bind(username)
        .bind(password_hash)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_user(&self, username: &str) -> Result<Option<UserRecord>, DatabaseError> {
        let user = retry_read!(
            sqlx::query_as::<_, UserRecord>("SELECT * FROM users WHERE username = ?")
                .bind(username)
                .fetch_optional(&self.pool)
                .await
        )?;
        Ok(user)
    }

    pub async fn upsert_access_key(
        &self,
        access_key_id: &str,
        secret_access_key: &str,
        username: &str,
    ) -> Result<(), DatabaseError> {
        sqlx::query(
            "INSERT INTO access_keys (access_key_id, secret_access_key, username) VALUES (?, ?, ?)
             ON CONFLICT (access_key_id) DO UPDATE
             SET secret_access_key = excluded.secret_access_key, username = excluded.username",
        )
        .bind(access_key_id)
        .bind(secret_access_key)
        .bind(username)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_access_key(
        &self,
        access_key_id: &str,
    ) -> Result<Option<AccessKey>, DatabaseError> {
        let key = retry_read!(
            sqlx::query_as::<_, AccessKey>("SELECT * FROM access_keys WHERE access_key_id = ?")
                .bind(access_key_id)
                .fetch_optional(&self.pool)
                .await
        )?;
        Ok(key)
    }

    /// Policy documents a principal is evaluated against: its own user
    /// policies, plus the global ones for everyone but `anonymous`.
    pub async fn policies_for(&self, username: &str) -> Result<Vec<PolicyRow>, DatabaseError> {
        let mut rows = retry_read!(
            sqlx::query_as::<_, PolicyRow>(
                "SELECT name, policy_json FROM user_policies WHERE username = ?",
            )
            .bind(username)
            .fetch_all(&self.pool)
            .await
        )?;
        if username != crate::auth::policy::ANONYMOUS_USER {
            let global = retry_read!(
                sqlx::query_as::<_, PolicyRow>("SELECT name, policy_json FROM global_policies")
                    .fetch_all(&self.pool)
                    .await
            )?;
            rows.extend(global);
        }
        Ok(rows)
    }

    #[cfg(test)]
    pub async fn attach_user_policy(
        &self,
        username: &str,
        name: &str,
        policy_json: &str,
    ) -> Result<(), DatabaseError> {
        sqlx::query(
            "INSERT INTO user_policies (username, name, policy_json) VALUES (?, ?, ?)
             ON CONFLICT (username, name) DO UPDATE SET policy_json = excluded.policy_json",
        )
        .bind(username)
        .bind(name)
        .bind(policy_json)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // ---- buckets -------------------------------------------------------

    /// Returns false when the name is already taken. Enabling object lock
    /// forces versioning on from the start.
    pub async fn create_bucket(
        &self,
        name: &str,
        owner: &str,
        object_lock_enabled: bool,
    ) -> Result<bool, DatabaseError> {
        let result = sqlx::query(
            "INSERT INTO buckets (name, owner, versioning_enabled, object_lock_enabled)
             VALUES (?, ?, ?, ?) ON CONFLICT (name) DO NOTHING",
        )
        .bind(name)
        .bind(owner)
        .bind(object_lock_enabled)
        .bind(object_lock_enabled)
        .execute(&self.pool)
        .instrument(tracing::debug_span!("create bucket", name))
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn get_bucket(&self, name: &str) -> Result<Option<Bucket>, DatabaseError> {
        let bucket = retry_read!(
            sqlx::query_as::<_, Bucket>("SELECT * FROM buckets WHERE name = ?")
                .bind(name)
                .fetch_optional(&self.pool)
                .await
        )?;
        Ok(bucket)
    }

    pub async fn list_buckets(&self) -> Result<Vec<Bucket>, DatabaseError> {
        let buckets = retry_read!(
            sqlx::query_as::<_, Bucket>("SELECT * FROM buckets ORDER BY name")
                .fetch_all(&self.pool)
                .await
        )?;
        Ok(buckets)
    }

    pub async fn set_versioning(&self, name: &str, enabled: bool) -> Result<(), DatabaseError> {
        sqlx::query("UPDATE buckets SET versioning_enabled = ? WHERE name = ?")
            .bind(enabled)
            .bind(name)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn set_object_lock(&self, name: &str) -> Result<(), DatabaseError> {
        sqlx::query(
            "UPDATE buckets SET object_lock_enabled = 1, versioning_enabled = 1 WHERE name = ?",
        )
        .bind(name)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn delete_bucket(&self, name: &str) -> Result<(), DatabaseError> {
        sqlx::query("DELETE FROM buckets WHERE name = ?")
            .bind(name)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Current objects that make a bucket non-empty for deletion purposes.
    /// Non-latest rows never block deletion: unversioned buckets prune them
    /// at write, and on versioned buckets only the current objects count.
    pub async fn count_object_rows(&self, bucket: &str) -> Result<i64, DatabaseError> {
        let count = retry_read!(
            sqlx::query_scalar::<_, i64>(
                "SELECT COUNT(1) FROM objects
                 WHERE bucket = ? AND is_latest = 1 AND delete_marker = 0",
            )
            .bind(bucket)
            .fetch_one(&self.pool)
            .await
        )?;
        Ok(count)
    }

    pub async fn get_bucket_config(
        &self,
        bucket: &str,
    ) -> Result<Option<BucketConfig>, DatabaseError> {
        let config = retry_read!(
            sqlx::query_as::<_, BucketConfig>("SELECT * FROM bucket_configs WHERE bucket = ?")
                .bind(bucket)
                .fetch_optional(&self.pool)
                .await
        )?;
        Ok(config)
    }

    pub async fn put_bucket_cors(
        &self,
        bucket: &str,
        cors_json: Option<&str>,
    ) -> Result<(), DatabaseError> {
        sqlx::query(
            "INSERT INTO bucket_configs (bucket, cors_json) VALUES (?, ?)
             ON CONFLICT (bucket) DO UPDATE SET cors_json = excluded.cors_json",
        )
        .bind(bucket)
        .bind(cors_json)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn put_bucket_lifecycle(
        &self,
        bucket: &str,
        lifecycle_json: Option<&str>,
    ) -> Result<(), DatabaseError> {
        sqlx::query(
            "INSERT INTO bucket_configs (bucket, lifecycle_json) VALUES (?, ?)
             ON CONFLICT (bucket) DO UPDATE SET lifecycle_json = excluded.lifecycle_json",
        )
        .bind(bucket)
        .bind(lifecycle_json)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // ---- object versions -----------------------------------------------

    pub async fn get_latest_object(
        &self,
        bucket: &str,
        key: &str,
    ) -> Result<Option<ObjectRecord>, DatabaseError> {
        let record = retry_read!(
            sqlx::query_as::<_, ObjectRecord>(
                "SELECT * FROM objects WHERE bucket = ? AND object_key = ? AND is_latest = 1",
            )
            .bind(bucket)
            .bind(key)
            .fetch_optional(&self.pool)
            .instrument(tracing::debug_span!("get latest", key))
            .await
        )?;
        Ok(record)
    }

    pub async fn get_object_version(
        &self,
        bucket: &str,
        key: &str,
        version_id: &str,
    ) -> Result<Option<ObjectRecord>, DatabaseError> {
        let record = retry_read!(
            sqlx::query_as::<_, ObjectRecord>(
                "SELECT * FROM objects WHERE bucket = ? AND object_key = ? AND version_id = ?",
            )
            .bind(bucket)
            .bind(key)
            .bind(version_id)
            .fetch_optional(&self.pool)
            .instrument(tracing::debug_span!("get version", key, version_id))
            .await
        )?;
        Ok(record)
    }

    /// Demotes the previous latest row (or prunes every row when versioning
    /// is off) and inserts the new one, in one transaction. Orphaned blobs
    /// land on the GC queue inside the same transaction.
    pub async fn insert_object_version(
        &self,
        new: &NewObjectVersion,
        versioning_enabled: bool,
    ) -> Result<i64, DatabaseError> {
        let mut tx = self.pool.begin().await?;
        let id = Self::apply_version_chain(&mut tx, new, versioning_enabled).await?;
        tx.commit().await?;
        tracing::debug!(
            bucket = new.bucket,
            key = new.object_key,
            version_id = new.version_id,
            "stored object version"
        );
        Ok(id)
    }

    async fn apply_version_chain(
        tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
        new: &NewObjectVersion,
        versioning_enabled: bool,
    ) -> Result<i64, DatabaseError> {
        if versioning_enabled {
            sqlx::query(
                "UPDATE objects SET is_latest = 0
                 WHERE bucket = ? AND object_key = ? AND is_latest = 1",
            )
            .bind(&new.bucket)
            .bind(&new.object_key)
            .execute(&mut **tx)
            .await?;
        } else {
            let orphans = sqlx::query_scalar::<_, Option<String>>(
                "SELECT blob_id FROM objects WHERE bucket = ? AND object_key = ?",
            )
            .bind(&new.bucket)
            .bind(&new.object_key)
            .fetch_all(&mut **tx)
            .await?;
            sqlx::query("DELETE FROM objects WHERE bucket = ? AND object_key = ?")
                .bind(&new.bucket)
                .bind(&new.object_key)
                .execute(&mut **tx)
                .await?;
            for blob_id in orphans.into_iter().flatten() {
                Self::enqueue_gc(tx, &blob_id).await?;
            }
        }

        let id = sqlx::query_scalar::<_, i64>(
            "INSERT INTO objects (bucket, object_key, version_id, blob_id, size, etag,
                                  content_type, is_latest, delete_marker, encryption_type,
                                  lock_mode, retain_until, legal_hold)
             VALUES (?, ?, ?, ?, ?, ?, ?, 1, ?, ?, ?, ?, ?)
             RETURNING id",
        )
        .bind(&new.bucket)
        .bind(&new.object_key)
        .bind(&new.version_id)
        .bind(&new.blob_id)
        .bind(new.size)
        .bind(&new.etag)
        .bind(&new.content_type)
        .bind(new.delete_marker)
        .bind(&new.encryption_type)
        .bind(&new.lock_mode)
        .bind(new.retain_until)
        .bind(new.legal_hold)
        .fetch_one(&mut **tx)
        .await?;
        Ok(id)
    }

    /// Hard-deletes one version and, when it was the latest, promotes the
    /// most recent remaining row so the latest-pointer invariant holds.
    pub async fn delete_object_version(
        &self,
        record: &ObjectRecord,
    ) -> Result<(), DatabaseError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM objects WHERE id = ?")
            .bind(record.id)
            .execute(&mut *tx)
            .await?;
        if record.is_latest {
            sqlx::query(
                "UPDATE objects SET is_latest = 1 WHERE id = (
                     SELECT id FROM objects WHERE bucket = ? AND object_key = ?
                     ORDER BY modified_at DESC, id DESC LIMIT 1)",
            )
            .bind(&record.bucket)
            .bind(&record.object_key)
            .execute(&mut *tx)
            .await?;
        }
        if let Some(blob_id) = &record.blob_id {
            Self::enqueue_gc(&mut tx, blob_id).await?;
        }
        tx.commit().await?;
        tracing::debug!(
            bucket = record.bucket,
            key = record.object_key,
            version_id = record.version_id,
            "deleted object version"
        );
        Ok(())
    }

    /// Listing for both `ListObjectsV2` (latest, non-marker rows) and
    /// `ListObjectVersions` (everything), ordered by key.
    pub async fn list_objects(
        &self,
        bucket: &str,
        prefix: &str,
        start_after: &str,
        limit: i64,
        include_versions: bool,
    ) -> Result<Vec<ObjectRecord>, DatabaseError> {
        let sql = if include_versions {
            "SELECT * FROM objects WHERE bucket = ? AND object_key LIKE ? || '%'
             AND object_key > ?
             ORDER BY object_key, is_latest DESC, modified_at DESC, id DESC LIMIT ?"
        } else {
            "SELECT * FROM objects WHERE bucket = ? AND object_key LIKE ? || '%'
             AND object_key > ? AND is_latest = 1 AND delete_marker = 0
             ORDER BY object_key LIMIT ?"
        };
        let rows = retry_read!(
            sqlx::query_as::<_, ObjectRecord>(sql)
                .bind(bucket)
                .bind(prefix)
                .bind(start_after)
                .bind(limit)
                .fetch_all(&self.pool)
                .instrument(tracing::debug_span!("list objects", bucket, prefix))
                .await
        )?;
        Ok(rows)
    }

    pub async fn set_retention(
        &self,
        object_id: i64,
        lock_mode: Option<&str>,
        retain_until: Option<NaiveDateTime>,
    ) -> Result<(), DatabaseError> {
        sqlx::query("UPDATE objects SET lock_mode = ?, retain_until = ? WHERE id = ?")
            .bind(lock_mode)
            .bind(retain_until)
            .bind(object_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn set_legal_hold(
        &self,
        object_id: i64,
        legal_hold: bool,
    ) -> Result<(), DatabaseError> {
        sqlx::query("UPDATE objects SET legal_hold = ? WHERE id = ?")
            .bind(legal_hold)
            .bind(object_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // ---- object tags ---------------------------------------------------

    pub async fn replace_tags(
        &self,
        object_id: i64,
        tags: &[(String, String)],
    ) -> Result<(), DatabaseError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM object_tags WHERE object_id = ?")
            .bind(object_id)
            .execute(&mut *tx)
            .await?;
        for (tag_key, tag_value) in tags {
            sqlx::query(
                "INSERT INTO object_tags (object_id, tag_key, tag_value) VALUES (?, ?, ?)",
            )
            .bind(object_id)
            .bind(tag_key)
            .bind(tag_value)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    pub async fn get_tags(&self, object_id: i64) -> Result<Vec<(String, String)>, DatabaseError> {
        let rows = retry_read!(
            sqlx::query_as::<_, (String, String)>(
                "SELECT tag_key, tag_value FROM object_tags WHERE object_id = ? ORDER BY tag_key",
            )
            .bind(object_id)
            .fetch_all(&self.pool)
            .await
        )?;
        Ok(rows)
    }

    // ---- multipart uploads ---------------------------------------------

    pub async fn create_upload(
        &self,
        upload_id: &str,
        bucket: &str,
        key: &str,
        encryption_type: Option<&str>,
    ) -> Result<(), DatabaseError> {
        sqlx::query(
            "INSERT INTO multipart_uploads (upload_id, bucket, object_key, encryption_type)
             VALUES (?, ?, ?, ?)",
        )
        .bind(upload_id)
        .bind(bucket)
        .bind(key)
        .bind(encryption_type)
        .execute(&self.pool)
        .instrument(tracing::debug_span!("create upload", upload_id))
        .await?;
        Ok(())
    }

    pub async fn get_upload(
        &self,
        upload_id: &str,
    ) -> Result<Option<MultipartUpload>, DatabaseError> {
        let upload = retry_read!(
            sqlx::query_as::<_, MultipartUpload>(
                "SELECT * FROM multipart_uploads WHERE upload_id = ?",
            )
            .bind(upload_id)
            .fetch_optional(&self.pool)
            .await
        )?;
        Ok(upload)
    }

    /// Upserts one part row; returns the blob id of a replaced part so the
    /// caller can schedule it for collection.
    pub async fn upsert_part(
        &self,
        part: &MultipartPart,
    ) -> Result<Option<String>, DatabaseError> {
        let mut tx = self.pool.begin().await?;
        let previous = sqlx::query_scalar::<_, String>(
            "SELECT blob_id FROM multipart_parts WHERE upload_id = ? AND part_number = ?",
        )
        .bind(&part.upload_id)
        .bind(part.part_number)
        .fetch_optional(&mut *tx)
        .await?;
        sqlx::query(
            "INSERT INTO multipart_parts (upload_id, part_number, blob_id, etag, size)
             VALUES (?, ?, ?, ?, ?)
             ON CONFLICT (upload_id, part_number) DO UPDATE
             SET blob_id = excluded.blob_id, etag = excluded.etag, size = excluded.size",
        )
        .bind(&part.upload_id)
        .bind(part.part_number)
        .bind(&part.blob_id)
        .bind(&part.etag)
        .bind(part.size)
        .execute(&mut *tx)
        .await?;
        if let Some(blob_id) = &previous {
            Self::enqueue_gc(&mut tx, blob_id).await?;
        }
        tx.commit().await?;
        Ok(previous)
    }

    pub async fn list_parts(
        &self,
        upload_id: &str,
    ) -> Result<Vec<MultipartPart>, DatabaseError> {
        let parts = retry_read!(
            sqlx::query_as::<_, MultipartPart>(
                "SELECT * FROM multipart_parts WHERE upload_id = ? ORDER BY part_number",
            )
            .bind(upload_id)
            .fetch_all(&self.pool)
            .await
        )?;
        Ok(parts)
    }

    /// Writes the assembled object row and drops the upload in one
    /// transaction; every part blob is queued for collection.
    pub async fn complete_upload(
        &self,
        upload_id: &str,
        new: &NewObjectVersion,
        versioning_enabled: bool,
    ) -> Result<i64, DatabaseError> {
        let mut tx = self.pool.begin().await?;
        let id = Self::apply_version_chain(&mut tx, new, versioning_enabled).await?;
        let part_blobs = sqlx::query_scalar::<_, String>(
            "SELECT blob_id FROM multipart_parts WHERE upload_id = ?",
        )
        .bind(upload_id)
        .fetch_all(&mut *tx)
        .await?;
        sqlx::query("DELETE FROM multipart_uploads WHERE upload_id = ?")
            .bind(upload_id)
            .execute(&mut *tx)
            .await?;
        for blob_id in &part_blobs {
            Self::enqueue_gc(&mut tx, blob_id).await?;
        }
        tx.commit().await?;
        Ok(id)
    }

    /// Drops an upload and queues its part blobs for collection.
    pub async fn abort_upload(&self, upload_id: &str) -> Result<(), DatabaseError> {
        let mut tx = self.pool.begin().await?;
        let part_blobs = sqlx::query_scalar::<_, String>(
            "SELECT blob_id FROM multipart_parts WHERE upload_id = ?",
        )
        .bind(upload_id)
        .fetch_all(&mut *tx)
        .await?;
        sqlx::query("DELETE FROM multipart_uploads WHERE upload_id = ?")
            .bind(upload_id)
            .execute(&mut *tx)
            .await?;
        for blob_id in &part_blobs {
            Self::enqueue_gc(&mut tx, blob_id).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    pub async fn stale_uploads(
        &self,
        older_than: NaiveDateTime,
    ) -> Result<Vec<MultipartUpload>, DatabaseError> {
        let uploads = retry_read!(
            sqlx::query_as::<_, MultipartUpload>(
                "SELECT * FROM multipart_uploads WHERE created_at < ?",
            )
            .bind(older_than)
            .fetch_all(&self.pool)
            .await
        )?;
        Ok(uploads)
    }

    // ---- blob garbage collection ---------------------------------------

    async fn enqueue_gc(
        tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
        blob_id: &str,
    ) -> Result<(), DatabaseError> {
        sqlx::query("INSERT INTO gc_blobs (blob_id) VALUES (?) ON CONFLICT DO NOTHING")
            .bind(blob_id)
            .execute(&mut **tx)
            .await?;
        Ok(())
    }

    pub async fn schedule_blob_gc(&self, blob_id: &str) -> Result<(), DatabaseError> {
        sqlx::query("INSERT INTO gc_blobs (blob_id) VALUES (?) ON CONFLICT DO NOTHING")
            .bind(blob_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn list_gc_blobs(&self, limit: i64) -> Result<Vec<String>, DatabaseError> {
        let blobs = retry_read!(
            sqlx::query_scalar::<_, String>(
                "SELECT blob_id FROM gc_blobs ORDER BY scheduled_at LIMIT ?",
            )
            .bind(limit)
            .fetch_all(&self.pool)
            .await
        )?;
        Ok(blobs)
    }

    pub async fn clear_gc_blob(&self, blob_id: &str) -> Result<(), DatabaseError> {
        sqlx::query("DELETE FROM gc_blobs WHERE blob_id = ?")
            .bind(blob_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
