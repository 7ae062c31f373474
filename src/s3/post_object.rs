use axum::Extension;
use axum::body::{Body, Bytes};
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::Response;
use itertools::Itertools;
use serde::Deserialize;

use crate::AppState;
use crate::auth::Principal;
use crate::crypto;
use crate::database::NewObjectVersion;
use crate::s3::error::S3Error;
use crate::s3::xml;

/// All but the last part must reach this size.
const MIN_PART_SIZE: i64 = 5 * 1024 * 1024;

#[derive(Deserialize, Default, Debug)]
pub struct PostObjectParams {
    /// Marks `CreateMultipartUpload`.
    uploads: Option<String>,
    /// Marks `CompleteMultipartUpload`.
    #[serde(rename = "uploadId")]
    upload_id: Option<String>,
}

#[axum::debug_handler]
/// `CreateMultipartUpload` and `CompleteMultipartUpload` depending on query
/// parameters.
pub async fn post_object(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path((bucket, key)): Path<(String, String)>,
    Query(params): Query<PostObjectParams>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, S3Error> {
    if params.uploads.is_some() {
        return create_upload(&state, &principal, &bucket, &key, &headers).await;
    }
    if let Some(upload_id) = &params.upload_id {
        return complete_upload(&state, &principal, &bucket, &key, upload_id, &body).await;
    }
    Err(S3Error::InvalidArgument(
        "POST on an object needs ?uploads or ?uploadId".to_string(),
    ))
}

async fn create_upload(
    state: &AppState,
    principal: &Principal,
    bucket: &str,
    key: &str,
    headers: &HeaderMap,
) -> Result<Response, S3Error> {
    super::require_bucket(state, bucket).await?;
    super::allow(
        state,
        principal,
        "s3:PutObject",
        &crate::auth::policy::object_arn(bucket, key),
    )
    .await?;

    // SSE is decided here and applied when the object is assembled.
    let encryption_type = match headers
        .get("x-amz-server-side-encryption")
        .and_then(|value| value.to_str().ok())
    {
        None => None,
        Some(algorithm) if algorithm == crypto::SSE_AES256 => {
            if state.master_key.is_none() {
                return Err(S3Error::InvalidArgument(
                    "server has no SSE master key configured".to_string(),
                ));
            }
            Some(crypto::SSE_AES256)
        }
        Some(algorithm) => {
            return Err(S3Error::InvalidArgument(format!(
                "unsupported encryption algorithm {algorithm:?}"
            )));
        }
    };

    let upload_id = super::token32();
    state
        .db
        .create_upload(&upload_id, bucket, key, encryption_type)
        .await?;
    tracing::debug!(bucket, key, upload_id, "Started multipart upload");

    Ok(Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/xml")
        .body(Body::from(format!(
            "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n\
             <InitiateMultipartUploadResult xmlns=\"{}\">\
             <Bucket>{}</Bucket><Key>{}</Key><UploadId>{upload_id}</UploadId>\
             </InitiateMultipartUploadResult>",
            xml::S3_XMLNS,
            quick_xml::escape::escape(bucket),
            quick_xml::escape::escape(key),
        )))
        .unwrap_or_default())
}

async fn complete_upload(
    state: &AppState,
    principal: &Principal,
    bucket_name: &str,
    key: &str,
    upload_id: &str,
    body: &[u8],
) -> Result<Response, S3Error> {
    let bucket = super::require_bucket(state, bucket_name).await?;
    super::allow(
        state,
        principal,
        "s3:PutObject",
        &crate::auth::policy::object_arn(bucket_name, key),
    )
    .await?;

    let resource = format!("/{bucket_name}/{key}");
    let upload = state
        .db
        .get_upload(upload_id)
        .await?
        .ok_or_else(|| S3Error::NoSuchUpload(resource.clone()))?;
    if upload.bucket != bucket_name || upload.object_key != key {
        return Err(S3Error::InvalidArgument(
            "uploadId belongs to a different object".to_string(),
        ));
    }

    let manifest: xml::CompleteMultipartUpload = quick_xml::de::from_reader(body)
        .map_err(|error| S3Error::MalformedXml(error.to_string()))?;
    if manifest.part.is_empty() {
        return Err(S3Error::MalformedXml("part list is empty".to_string()));
    }
    if !manifest
        .part
        .iter()
        .tuple_windows()
        .all(|(a, b)| a.part_number < b.part_number)
    {
        return Err(S3Error::InvalidPartOrder(resource));
    }

    let stored = state.db.list_parts(upload_id).await?;

    // Every submitted part must exist with the etag the client saw.
    let mut selected = Vec::with_capacity(manifest.part.len());
    for submitted in &manifest.part {
        let found = stored
            .iter()
            .find(|part| part.part_number == submitted.part_number)
            .filter(|part| part.etag == super::unquote_etag(&submitted.etag))
            .ok_or_else(|| S3Error::InvalidPart(resource.clone()))?;
        selected.push(found);
    }
    for part in selected.iter().rev().skip(1) {
        if part.size < MIN_PART_SIZE {
            return Err(S3Error::EntityTooSmall(resource.clone()));
        }
    }

    // Complete and Abort for this key are serialized with object writes.
    let _guard = state.locks.lock(bucket_name, key).await;

    let mut assembled = Vec::with_capacity(selected.iter().map(|p| p.size as usize).sum());
    for part in &selected {
        assembled.extend_from_slice(&state.blobs.get(&part.blob_id).await?);
    }
    let size = assembled.len() as i64;
    let etag = crypto::multipart_etag(
        &selected.iter().map(|part| part.etag.clone()).collect::<Vec<_>>(),
    )
    .map_err(|_| S3Error::InvalidPart(resource.clone()))?;

    let stored_bytes = match upload.encryption_type.as_deref() {
        Some(crypto::SSE_AES256) => {
            let master_key = state.master_key.as_ref().ok_or_else(|| {
                S3Error::Internal("encrypted upload but no master key".to_string())
            })?;
            master_key
                .seal(&assembled)
                .map_err(|error| S3Error::Internal(error.to_string()))?
        }
        _ => assembled,
    };

    let version_id = if bucket.versioning_enabled {
        super::token32()
    } else {
        super::NULL_VERSION_ID.to_string()
    };

    let blob_id = state.blobs.put(&stored_bytes).await?;
    let new = NewObjectVersion {
        bucket: bucket_name.to_string(),
        object_key: key.to_string(),
        version_id: version_id.clone(),
        blob_id: Some(blob_id.clone()),
        size,
        etag: etag.clone(),
        content_type: "application/octet-stream".to_string(),
        delete_marker: false,
        encryption_type: upload.encryption_type.clone(),
        lock_mode: None,
        retain_until: None,
        legal_hold: false,
    };
    if let Err(error) = state
        .db
        .complete_upload(upload_id, &new, bucket.versioning_enabled)
        .await
    {
        let _ = state.db.schedule_blob_gc(&blob_id).await;
        return Err(error.into());
    }

    tracing::debug!(
        bucket = bucket_name,
        key,
        upload_id,
        parts = selected.len(),
        "Completed multipart upload"
    );

    let mut builder = Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/xml");
    if bucket.versioning_enabled {
        builder = builder.header("x-amz-version-id", &version_id);
    }
    Ok(builder
        .body(Body::from(format!(
            "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n\
             <CompleteMultipartUploadResult xmlns=\"{}\">\
             <Location>/{}/{}</Location><Bucket>{}</Bucket><Key>{}</Key><ETag>{}</ETag>\
             </CompleteMultipartUploadResult>",
            xml::S3_XMLNS,
            quick_xml::escape::escape(bucket_name),
            quick_xml::escape::escape(key),
            quick_xml::escape::escape(bucket_name),
            quick_xml::escape::escape(key),
            super::quoted_etag(&etag),
        )))
        .unwrap_or_default())
}
