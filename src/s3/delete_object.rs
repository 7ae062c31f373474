use axum::Extension;
use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::Response;
use serde::Deserialize;

use crate::AppState;
use crate::auth::Principal;
use crate::database::NewObjectVersion;
use crate::s3::error::S3Error;
use crate::s3::object_lock;
use crate::s3::put_object::{find_object, governance_bypass};

#[derive(Deserialize, Default, Debug)]
pub struct DeleteObjectParams {
    #[serde(rename = "uploadId")]
    upload_id: Option<String>,
    #[serde(rename = "versionId")]
    version_id: Option<String>,
    tagging: Option<String>,
}

#[axum::debug_handler]
/// `DeleteObject`, `DeleteObjectTagging` and `AbortMultipartUpload`,
/// depending on query parameters.
pub async fn delete_object(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path((bucket, key)): Path<(String, String)>,
    Query(params): Query<DeleteObjectParams>,
    headers: HeaderMap,
) -> Result<Response, S3Error> {
    let arn = crate::auth::policy::object_arn(&bucket, &key);

    if let Some(upload_id) = &params.upload_id {
        return abort_upload(&state, &principal, &bucket, &key, upload_id).await;
    }

    if params.tagging.is_some() {
        super::allow(&state, &principal, "s3:DeleteObjectTagging", &arn).await?;
        let record = find_object(&state, &bucket, &key, params.version_id.as_deref())
            .await?
            .ok_or_else(|| S3Error::NoSuchKey(format!("/{bucket}/{key}")))?;
        state.db.replace_tags(record.id, &[]).await?;
        return Ok(super::empty_response(StatusCode::NO_CONTENT));
    }

    super::allow(&state, &principal, "s3:DeleteObject", &arn).await?;
    let bucket_row = super::require_bucket(&state, &bucket).await?;

    if let Some(version_id) = &params.version_id {
        // Explicit version: hard delete behind the lock guard.
        let record = state
            .db
            .get_object_version(&bucket, &key, version_id)
            .await?
            .ok_or_else(|| S3Error::NoSuchVersion(format!("/{bucket}/{key}")))?;
        let bypass = governance_bypass(&state, &principal, &headers, &bucket, &key).await;
        object_lock::check_destructive(&record, bypass, object_lock::now())?;

        let _guard = state.locks.lock(&bucket, &key).await;
        state.db.delete_object_version(&record).await?;

        let mut builder = Response::builder()
            .status(StatusCode::NO_CONTENT)
            .header("x-amz-version-id", version_id);
        if record.delete_marker {
            builder = builder.header("x-amz-delete-marker", "true");
        }
        return Ok(builder.body(Body::empty()).unwrap_or_default());
    }

    if bucket_row.versioning_enabled {
        // Versioned untargeted delete tombstones the key and touches nothing.
        let version_id = super::token32();
        let marker = NewObjectVersion {
            bucket: bucket.clone(),
            object_key: key.clone(),
            version_id: version_id.clone(),
            blob_id: None,
            size: 0,
            etag: String::new(),
            content_type: "application/octet-stream".to_string(),
            delete_marker: true,
            encryption_type: None,
            lock_mode: None,
            retain_until: None,
            legal_hold: false,
        };
        let _guard = state.locks.lock(&bucket, &key).await;
        state.db.insert_object_version(&marker, true).await?;
        tracing::debug!(bucket, key, version_id, "Inserted delete marker");

        return Ok(Response::builder()
            .status(StatusCode::NO_CONTENT)
            .header("x-amz-delete-marker", "true")
            .header("x-amz-version-id", version_id)
            .body(Body::empty())
            .unwrap_or_default());
    }

    // Unversioned: remove the sole row, if any. Deleting nothing succeeds.
    let Some(record) = state.db.get_latest_object(&bucket, &key).await? else {
        return Ok(super::empty_response(StatusCode::NO_CONTENT));
    };
    let bypass = governance_bypass(&state, &principal, &headers, &bucket, &key).await;
    object_lock::check_destructive(&record, bypass, object_lock::now())?;

    let _guard = state.locks.lock(&bucket, &key).await;
    state.db.delete_object_version(&record).await?;
    Ok(super::empty_response(StatusCode::NO_CONTENT))
}

async fn abort_upload(
    state: &AppState,
    principal: &Principal,
    bucket: &str,
    key: &str,
    upload_id: &str,
) -> Result<Response, S3Error> {
    super::allow(
        state,
        principal,
        "s3:AbortMultipartUpload",
        &crate::auth::policy::object_arn(bucket, key),
    )
    .await?;
    let upload = state
        .db
        .get_upload(upload_id)
        .await?
        .ok_or_else(|| S3Error::NoSuchUpload(format!("/{bucket}/{key}")))?;
    if upload.bucket != bucket || upload.object_key != key {
        return Err(S3Error::InvalidArgument(
            "uploadId belongs to a different object".to_string(),
        ));
    }

    // Serialized with Complete for the same key so they cannot interleave.
    let _guard = state.locks.lock(bucket, key).await;
    state.db.abort_upload(upload_id).await?;
    tracing::debug!(bucket, key, upload_id, "Aborted multipart upload");
    Ok(super::empty_response(StatusCode::NO_CONTENT))
}
