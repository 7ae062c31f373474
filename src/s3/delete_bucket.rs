use axum::Extension;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::Response;
use serde::Deserialize;

use crate::AppState;
use crate::auth::Principal;
use crate::auth::policy::bucket_arn;
use crate::s3::error::S3Error;

#[derive(Deserialize, Default, Debug)]
pub struct DeleteBucketParams {
    cors: Option<String>,
    lifecycle: Option<String>,
}

#[axum::debug_handler]
/// `DeleteBucket` (only when empty) and the CORS / lifecycle config resets.
pub async fn delete_bucket(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path(bucket): Path<String>,
    Query(params): Query<DeleteBucketParams>,
) -> Result<Response, S3Error> {
    if params.cors.is_some() {
        super::allow(&state, &principal, "s3:PutBucketCORS", &bucket_arn(&bucket)).await?;
        super::require_bucket(&state, &bucket).await?;
        state.db.put_bucket_cors(&bucket, None).await?;
        return Ok(super::empty_response(StatusCode::NO_CONTENT));
    }
    if params.lifecycle.is_some() {
        super::allow(&state, &principal, "s3:PutLifecycleConfiguration", &bucket_arn(&bucket))
            .await?;
        super::require_bucket(&state, &bucket).await?;
        state.db.put_bucket_lifecycle(&bucket, None).await?;
        return Ok(super::empty_response(StatusCode::NO_CONTENT));
    }

    super::allow(&state, &principal, "s3:DeleteBucket", &bucket_arn(&bucket)).await?;
    super::require_bucket(&state, &bucket).await?;

    if state.db.count_object_rows(&bucket).await? > 0 {
        return Err(S3Error::BucketNotEmpty(format!("/{bucket}")));
    }
    state.db.delete_bucket(&bucket).await?;
    tracing::info!(bucket, "Deleted bucket");
    Ok(super::empty_response(StatusCode::NO_CONTENT))
}
