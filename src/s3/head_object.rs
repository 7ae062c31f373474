use axum::Extension;
use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::{StatusCode, header};
use axum::response::Response;
use serde::Deserialize;

use crate::AppState;
use crate::auth::Principal;
use crate::s3::error::S3Error;
use crate::s3::get_object::resolve_for_read;
use crate::s3::xml;

#[derive(Deserialize, Default, Debug)]
pub struct HeadObjectParams {
    #[serde(rename = "versionId")]
    version_id: Option<String>,
}

#[axum::debug_handler]
/// `HeadObject`: the `GetObject` headers without the bytes.
pub async fn head_object(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path((bucket, key)): Path<(String, String)>,
    Query(params): Query<HeadObjectParams>,
) -> Result<Response, S3Error> {
    super::allow(
        &state,
        &principal,
        "s3:GetObject",
        &crate::auth::policy::object_arn(&bucket, &key),
    )
    .await?;

    let record = match resolve_for_read(&state, &bucket, &key, params.version_id.as_deref()).await
    {
        Ok(record) => record,
        // HEAD responses carry no body, just the status.
        Err(error) => return Ok(super::empty_response(error.status())),
    };
    if record.delete_marker {
        return Ok(Response::builder()
            .status(StatusCode::NOT_FOUND)
            .header("x-amz-delete-marker", "true")
            .body(Body::empty())
            .unwrap_or_default());
    }

    let mut builder = Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, &record.content_type)
        .header(header::CONTENT_LENGTH, record.size)
        .header(header::ETAG, super::quoted_etag(&record.etag))
        .header(header::LAST_MODIFIED, xml::http_date(record.modified_at));
    if record.version_id != super::NULL_VERSION_ID {
        builder = builder.header("x-amz-version-id", &record.version_id);
    }
    if let Some(encryption) = &record.encryption_type {
        builder = builder.header("x-amz-server-side-encryption", encryption);
    }
    if let Some(mode) = &record.lock_mode {
        builder = builder.header("x-amz-object-lock-mode", mode);
    }
    if let Some(retain_until) = record.retain_until {
        builder = builder.header(
            "x-amz-object-lock-retain-until-date",
            xml::format_timestamp(retain_until),
        );
    }
    if record.legal_hold {
        builder = builder.header("x-amz-object-lock-legal-hold", "ON");
    }
    Ok(builder.body(Body::empty()).unwrap_or_default())
}
