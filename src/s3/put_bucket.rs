use axum::Extension;
use axum::body::{Body, Bytes};
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::Response;
use serde::Deserialize;

use crate::AppState;
use crate::auth::Principal;
use crate::auth::policy::bucket_arn;
use crate::s3::error::S3Error;
use crate::s3::xml;

#[derive(Deserialize, Default, Debug)]
pub struct PutBucketParams {
    versioning: Option<String>,
    #[serde(rename = "object-lock")]
    object_lock: Option<String>,
    cors: Option<String>,
    lifecycle: Option<String>,
}

fn valid_bucket_name(name: &str) -> bool {
    (3..=63).contains(&name.len())
        && name
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-' || b == b'.')
        && !name.starts_with(['-', '.'])
        && !name.ends_with(['-', '.'])
}

#[axum::debug_handler]
/// `CreateBucket` plus the `?versioning`, `?object-lock`, `?cors` and
/// `?lifecycle` configuration writes.
pub async fn put_bucket(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path(bucket): Path<String>,
    Query(params): Query<PutBucketParams>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, S3Error> {
    if params.versioning.is_some() {
        return put_versioning(&state, &principal, &bucket, &body).await;
    }
    if params.object_lock.is_some() {
        return put_object_lock(&state, &principal, &bucket, &body).await;
    }
    if params.cors.is_some() {
        super::allow(&state, &principal, "s3:PutBucketCORS", &bucket_arn(&bucket)).await?;
        super::require_bucket(&state, &bucket).await?;
        let document = str::from_utf8(&body)
            .map_err(|_| S3Error::MalformedXml("CORS document is not UTF-8".to_string()))?;
        state.db.put_bucket_cors(&bucket, Some(document)).await?;
        return Ok(super::empty_response(StatusCode::OK));
    }
    if params.lifecycle.is_some() {
        super::allow(&state, &principal, "s3:PutLifecycleConfiguration", &bucket_arn(&bucket))
            .await?;
        super::require_bucket(&state, &bucket).await?;
        let document = str::from_utf8(&body)
            .map_err(|_| S3Error::MalformedXml("lifecycle document is not UTF-8".to_string()))?;
        state.db.put_bucket_lifecycle(&bucket, Some(document)).await?;
        return Ok(super::empty_response(StatusCode::OK));
    }

    create_bucket(&state, &principal, &bucket, &headers).await
}

async fn create_bucket(
    state: &AppState,
    principal: &Principal,
    bucket: &str,
    headers: &HeaderMap,
) -> Result<Response, S3Error> {
    super::allow(state, principal, "s3:CreateBucket", &bucket_arn(bucket)).await?;
    if !valid_bucket_name(bucket) {
        return Err(S3Error::InvalidArgument(format!(
            "invalid bucket name {bucket:?}"
        )));
    }

    let object_lock = headers
        .get("x-amz-bucket-object-lock-enabled")
        .and_then(|value| value.to_str().ok())
        .map(|value| value.eq_ignore_ascii_case("true"))
        .unwrap_or(false);

    let created = state
        .db
        .create_bucket(bucket, &principal.username, object_lock)
        .await?;
    if !created {
        return Err(S3Error::BucketAlreadyExists(format!("/{bucket}")));
    }
    tracing::info!(bucket, owner = principal.username, object_lock, "Created bucket");

    Ok(Response::builder()
        .status(StatusCode::OK)
        .header(header::LOCATION, format!("/{bucket}"))
        .body(Body::empty())
        .unwrap_or_default())
}

async fn put_versioning(
    state: &AppState,
    principal: &Principal,
    bucket: &str,
    body: &[u8],
) -> Result<Response, S3Error> {
    super::allow(state, principal, "s3:PutBucketVersioning", &bucket_arn(bucket)).await?;
    let bucket_row = super::require_bucket(state, bucket).await?;

    let config: xml::VersioningConfiguration = quick_xml::de::from_reader(body)
        .map_err(|error| S3Error::MalformedXml(error.to_string()))?;
    match config.status.as_deref() {
        Some("Enabled") => state.db.set_versioning(bucket, true).await?,
        Some("Suspended") => {
            if bucket_row.object_lock_enabled {
                return Err(S3Error::InvalidArgument(
                    "versioning cannot be suspended while object lock is enabled".to_string(),
                ));
            }
            state.db.set_versioning(bucket, false).await?;
        }
        other => {
            return Err(S3Error::MalformedXml(format!(
                "invalid versioning status {other:?}"
            )));
        }
    }
    Ok(super::empty_response(StatusCode::OK))
}

async fn put_object_lock(
    state: &AppState,
    principal: &Principal,
    bucket: &str,
    body: &[u8],
) -> Result<Response, S3Error> {
    super::allow(
        state,
        principal,
        "s3:PutBucketObjectLockConfiguration",
        &bucket_arn(bucket),
    )
    .await?;
    let bucket_row = super::require_bucket(state, bucket).await?;

    let config: xml::ObjectLockConfiguration = quick_xml::de::from_reader(body)
        .map_err(|error| S3Error::MalformedXml(error.to_string()))?;
    match config.object_lock_enabled.as_deref() {
        Some("Enabled") => {
            state.db.set_object_lock(bucket).await?;
            Ok(super::empty_response(StatusCode::OK))
        }
        // Lock never comes back off once on.
        _ if bucket_row.object_lock_enabled => Err(S3Error::InvalidArgument(
            "object lock cannot be disabled".to_string(),
        )),
        other => Err(S3Error::MalformedXml(format!(
            "invalid object lock configuration {other:?}"
        ))),
    }
}
