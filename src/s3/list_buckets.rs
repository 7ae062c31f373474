use axum::Extension;
use axum::extract::State;
use axum::response::Response;

use crate::AppState;
use crate::auth::Principal;
use crate::auth::policy::{self, ADMIN_USER};
use crate::s3::error::S3Error;
use crate::s3::xml;

#[axum::debug_handler]
/// `ListAllMyBuckets` on `GET /`. Admin sees everything, everyone else
/// only what they own.
pub async fn list_buckets(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
) -> Result<Response, S3Error> {
    super::allow(
        &state,
        &principal,
        "s3:ListAllMyBuckets",
        &policy::bucket_arn("*"),
    )
    .await?;

    let buckets = state
        .db
        .list_buckets()
        .await?
        .into_iter()
        .filter(|bucket| principal.username == ADMIN_USER || bucket.owner == principal.username)
        .map(|bucket| xml::BucketEntry {
            name: bucket.name,
            creation_date: xml::format_timestamp(bucket.created_at),
        })
        .collect();

    let body = xml::to_xml(&xml::ListAllMyBucketsResult {
        xmlns: xml::S3_XMLNS,
        owner: xml::Owner {
            id: principal.username.clone(),
            display_name: principal.username.clone(),
        },
        buckets: xml::Buckets { bucket: buckets },
    })
    .map_err(|error| S3Error::Internal(error.to_string()))?;
    Ok(super::xml_response(body))
}
