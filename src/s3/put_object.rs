use axum::body::{Body, Bytes};
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::Response;
use axum::Extension;
use chrono::NaiveDateTime;
use serde::Deserialize;

use crate::auth::Principal;
use crate::database::{MultipartPart, NewObjectVersion, ObjectRecord};
use crate::s3::error::S3Error;
use crate::s3::object_lock::{self, GovernanceBypass};
use crate::s3::xml;
use crate::{AppState, crypto};

#[derive(Deserialize, Default, Debug)]
pub struct PutObjectParams {
    #[serde(rename = "partNumber")]
    part_number: Option<i64>,
    #[serde(rename = "uploadId")]
    upload_id: Option<String>,
    #[serde(rename = "versionId")]
    version_id: Option<String>,
    tagging: Option<String>,
    retention: Option<String>,
    #[serde(rename = "legal-hold")]
    legal_hold: Option<String>,
}

#[derive(Debug, Default)]
struct LockHeaders {
    mode: Option<String>,
    retain_until: Option<NaiveDateTime>,
    legal_hold: bool,
}

impl LockHeaders {
    fn present(&self) -> bool {
        self.mode.is_some() || self.retain_until.is_some() || self.legal_hold
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}

fn parse_lock_headers(headers: &HeaderMap) -> Result<LockHeaders, S3Error> {
    let mode = header_str(headers, "x-amz-object-lock-mode").map(str::to_uppercase);
    if let Some(mode) = &mode
        && !object_lock::is_valid_mode(mode)
    {
        return Err(S3Error::InvalidArgument(format!(
            "invalid object lock mode {mode:?}"
        )));
    }
    let retain_until = header_str(headers, "x-amz-object-lock-retain-until-date")
        .map(|raw| {
            chrono::DateTime::parse_from_rfc3339(raw)
                .map(|at| at.naive_utc())
                .map_err(|_| {
                    S3Error::InvalidArgument(format!("invalid retain-until date {raw:?}"))
                })
        })
        .transpose()?;
    if mode.is_some() != retain_until.is_some() {
        return Err(S3Error::InvalidArgument(
            "object lock mode and retain-until date go together".to_string(),
        ));
    }
    let legal_hold = header_str(headers, "x-amz-object-lock-legal-hold")
        .map(|value| value.eq_ignore_ascii_case("ON"))
        .unwrap_or(false);
    Ok(LockHeaders {
        mode,
        retain_until,
        legal_hold,
    })
}

/// Whether this request may bypass GOVERNANCE retention: it must both carry
/// the bypass header and hold the bypass permission.
pub(crate) async fn governance_bypass(
    state: &AppState,
    principal: &Principal,
    headers: &HeaderMap,
    bucket: &str,
    key: &str,
) -> GovernanceBypass {
    let requested = header_str(headers, "x-amz-bypass-governance-retention")
        .map(|value| value.eq_ignore_ascii_case("true"))
        .unwrap_or(false);
    if requested
        && super::allow(
            state,
            principal,
            "s3:BypassGovernanceRetention",
            &crate::auth::policy::object_arn(bucket, key),
        )
        .await
        .is_ok()
    {
        GovernanceBypass::Granted
    } else {
        GovernanceBypass::Denied
    }
}

fn sse_requested(headers: &HeaderMap) -> Result<bool, S3Error> {
    match header_str(headers, "x-amz-server-side-encryption") {
        None => Ok(false),
        Some(algorithm) if algorithm == crypto::SSE_AES256 => Ok(true),
        Some(algorithm) => Err(S3Error::InvalidArgument(format!(
            "unsupported encryption algorithm {algorithm:?}"
        ))),
    }
}

/// Finds a version row, or the latest row when no version is asked for.
pub(crate) async fn find_object(
    state: &AppState,
    bucket: &str,
    key: &str,
    version_id: Option<&str>,
) -> Result<Option<ObjectRecord>, S3Error> {
    match version_id {
        Some(version_id) => Ok(state.db.get_object_version(bucket, key, version_id).await?),
        None => Ok(state.db.get_latest_object(bucket, key).await?),
    }
}

#[axum::debug_handler]
/// `PutObject` and friends: `UploadPart`, `CopyObject`, `PutObjectTagging`,
/// `PutObjectRetention` and `PutObjectLegalHold`, picked apart the same way
/// S3 does, by query parameters and headers.
pub async fn put_object(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path((bucket, key)): Path<(String, String)>,
    Query(params): Query<PutObjectParams>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, S3Error> {
    if let Some(upload_id) = &params.upload_id {
        let part_number = params.part_number.ok_or_else(|| {
            S3Error::InvalidArgument("uploadId requires partNumber".to_string())
        })?;
        return upload_part(&state, &principal, &bucket, &key, upload_id, part_number, body).await;
    }
    if params.tagging.is_some() {
        return put_tagging(&state, &principal, &bucket, &key, params.version_id.as_deref(), &body)
            .await;
    }
    if params.retention.is_some() {
        return put_retention(
            &state,
            &principal,
            &bucket,
            &key,
            params.version_id.as_deref(),
            &headers,
            &body,
        )
        .await;
    }
    if params.legal_hold.is_some() {
        return put_legal_hold(&state, &principal, &bucket, &key, params.version_id.as_deref(), &body)
            .await;
    }
    if header_str(&headers, "x-amz-copy-source").is_some() {
        return copy_object(&state, &principal, &bucket, &key, &headers).await;
    }
    store_object(&state, &principal, &bucket, &key, &headers, body).await
}

async fn store_object(
    state: &AppState,
    principal: &Principal,
    bucket_name: &str,
    key: &str,
    headers: &HeaderMap,
    body: Bytes,
) -> Result<Response, S3Error> {
    let bucket = super::require_bucket(state, bucket_name).await?;
    super::allow(
        state,
        principal,
        "s3:PutObject",
        &crate::auth::policy::object_arn(bucket_name, key),
    )
    .await?;

    let lock = parse_lock_headers(headers)?;
    if lock.present() && !bucket.object_lock_enabled {
        return Err(S3Error::InvalidArgument(
            "bucket does not have object lock enabled".to_string(),
        ));
    }

    let content_type = header_str(headers, header::CONTENT_TYPE.as_str())
        .unwrap_or("application/octet-stream")
        .to_string();

    let etag = crypto::md5_hex(&body);
    let size = body.len() as i64;

    let encrypted = sse_requested(headers)?;
    let (stored, encryption_type) = if encrypted {
        let master_key = state.master_key.as_ref().ok_or_else(|| {
            S3Error::InvalidArgument("server has no SSE master key configured".to_string())
        })?;
        let sealed = master_key
            .seal(&body)
            .map_err(|error| S3Error::Internal(error.to_string()))?;
        (Bytes::from(sealed), Some(crypto::SSE_AES256.to_string()))
    } else {
        (body, None)
    };

    let version_id = if bucket.versioning_enabled {
        super::token32()
    } else {
        super::NULL_VERSION_ID.to_string()
    };

    let _guard = state.locks.lock(bucket_name, key).await;

    // Overwriting the sole copy on an unversioned bucket is destructive.
    if !bucket.versioning_enabled
        && let Some(existing) = state.db.get_latest_object(bucket_name, key).await?
    {
        let bypass = governance_bypass(state, principal, headers, bucket_name, key).await;
        object_lock::check_destructive(&existing, bypass, object_lock::now())?;
    }

    let blob_id = state.blobs.put(&stored).await?;
    let new = NewObjectVersion {
        bucket: bucket_name.to_string(),
        object_key: key.to_string(),
        version_id: version_id.clone(),
        blob_id: Some(blob_id.clone()),
        size,
        etag: etag.clone(),
        content_type,
        delete_marker: false,
        encryption_type: encryption_type.clone(),
        lock_mode: lock.mode,
        retain_until: lock.retain_until,
        legal_hold: lock.legal_hold,
    };
    if let Err(error) = state
        .db
        .insert_object_version(&new, bucket.versioning_enabled)
        .await
    {
        // The blob landed but the row did not; the collector reclaims it.
        let _ = state.db.schedule_blob_gc(&blob_id).await;
        return Err(error.into());
    }

    tracing::debug!(bucket = bucket_name, key, version_id, "Stored object");

    let mut response = Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_LENGTH, 0)
        .header(header::ETAG, super::quoted_etag(&etag));
    if bucket.versioning_enabled {
        response = response.header("x-amz-version-id", &version_id);
    }
    if let Some(encryption) = &encryption_type {
        response = response.header("x-amz-server-side-encryption", encryption);
    }
    Ok(response.body(Body::empty()).unwrap_or_default())
}

async fn upload_part(
    state: &AppState,
    principal: &Principal,
    bucket: &str,
    key: &str,
    upload_id: &str,
    part_number: i64,
    body: Bytes,
) -> Result<Response, S3Error> {
    if !(1..=10_000).contains(&part_number) {
        return Err(S3Error::InvalidArgument(format!(
            "part number {part_number} is outside [1, 10000]"
        )));
    }
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
    super::allow(
        state,
        principal,
        "s3:PutObject",
        &crate::auth::policy::object_arn(bucket, key),
    )
    .await?;

    // Parts stay plaintext; encryption happens when the object is assembled.
    let etag = crypto::md5_hex(&body);
    let size = body.len() as i64;
    let blob_id = state.blobs.put(&body).await?;

    let replaced = state
        .db
        .upsert_part(&MultipartPart {
            upload_id: upload_id.to_string(),
            part_number,
            blob_id,
            etag: etag.clone(),
            size,
        })
        .await?;
    if replaced.is_some() {
        tracing::debug!(upload_id, part_number, "Replaced part");
    }

    Ok(Response::builder()
        .status(StatusCode::OK)
        .header(header::ETAG, super::quoted_etag(&etag))
        .body(Body::empty())
        .unwrap_or_default())
}

async fn copy_object(
    state: &AppState,
    principal: &Principal,
    bucket_name: &str,
    key: &str,
    headers: &HeaderMap,
) -> Result<Response, S3Error> {
    let source = header_str(headers, "x-amz-copy-source")
        .ok_or_else(|| S3Error::InvalidArgument("missing x-amz-copy-source".to_string()))?;
    let decoded = percent_encoding::percent_decode_str(source)
        .decode_utf8()
        .map_err(|_| S3Error::InvalidArgument("copy source is not UTF-8".to_string()))?;
    let (source_path, source_version) = match decoded.split_once("?versionId=") {
        Some((path, version)) => (path.to_string(), Some(version.to_string())),
        None => (decoded.to_string(), None),
    };
    let (source_bucket, source_key) = source_path
        .trim_start_matches('/')
        .split_once('/')
        .ok_or_else(|| S3Error::InvalidArgument("copy source must be bucket/key".to_string()))?;

    super::allow(
        state,
        principal,
        "s3:GetObject",
        &crate::auth::policy::object_arn(source_bucket, source_key),
    )
    .await?;
    super::require_bucket(state, source_bucket).await?;

    let record = find_object(state, source_bucket, source_key, source_version.as_deref())
        .await?
        .filter(|record| !record.delete_marker)
        .ok_or_else(|| S3Error::NoSuchKey(format!("/{source_bucket}/{source_key}")))?;

    let plaintext = read_plaintext(state, &record).await?;

    // Re-enter the plain write path with the source bytes; the copy keeps
    // the source's plaintext etag by construction.
    let mut forwarded = headers.clone();
    forwarded.remove("x-amz-copy-source");
    let response = store_object(
        state,
        principal,
        bucket_name,
        key,
        &forwarded,
        Bytes::from(plaintext),
    )
    .await?;

    let version_header = response.headers().get("x-amz-version-id").cloned();
    let body = xml::to_xml(&xml::CopyObjectResult {
        xmlns: xml::S3_XMLNS,
        etag: super::quoted_etag(&record.etag),
        last_modified: xml::format_timestamp(record.modified_at),
    })
    .map_err(|error| S3Error::Internal(error.to_string()))?;

    let mut builder = Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/xml");
    if let Some(version) = version_header {
        builder = builder.header("x-amz-version-id", version);
    }
    Ok(builder.body(Body::from(body)).unwrap_or_default())
}

/// Reads a row's blob and undoes SSE, failing loudly on corruption.
pub(crate) async fn read_plaintext(
    state: &AppState,
    record: &ObjectRecord,
) -> Result<Vec<u8>, S3Error> {
    let blob_id = record
        .blob_id
        .as_deref()
        .ok_or_else(|| S3Error::Internal("version row has no blob".to_string()))?;
    let stored = state.blobs.get(blob_id).await?;
    match record.encryption_type.as_deref() {
        None => Ok(stored),
        Some(crypto::SSE_AES256) => {
            let master_key = state.master_key.as_ref().ok_or_else(|| {
                S3Error::Internal("encrypted object but no master key".to_string())
            })?;
            master_key.open(&stored).map_err(|error| {
                state.audit.record(&crate::audit::AuditEvent::denied(
                    "-",
                    "read",
                    &format!("/{}/{}", record.bucket, record.object_key),
                    "AEAD open failed",
                ));
                S3Error::Internal(error.to_string())
            })
        }
        Some(other) => Err(S3Error::Internal(format!(
            "unknown encryption type {other:?}"
        ))),
    }
}

async fn put_tagging(
    state: &AppState,
    principal: &Principal,
    bucket: &str,
    key: &str,
    version_id: Option<&str>,
    body: &[u8],
) -> Result<Response, S3Error> {
    super::require_bucket(state, bucket).await?;
    super::allow(
        state,
        principal,
        "s3:PutObjectTagging",
        &crate::auth::policy::object_arn(bucket, key),
    )
    .await?;
    let record = find_object(state, bucket, key, version_id)
        .await?
        .filter(|record| !record.delete_marker)
        .ok_or_else(|| S3Error::NoSuchKey(format!("/{bucket}/{key}")))?;

    let tagging: xml::Tagging = quick_xml::de::from_reader(body)
        .map_err(|error| S3Error::MalformedXml(error.to_string()))?;
    let tags: Vec<(String, String)> = tagging
        .tag_set
        .tag
        .into_iter()
        .map(|tag| (tag.key, tag.value))
        .collect();
    state.db.replace_tags(record.id, &tags).await?;
    Ok(super::empty_response(StatusCode::OK))
}

async fn put_retention(
    state: &AppState,
    principal: &Principal,
    bucket: &str,
    key: &str,
    version_id: Option<&str>,
    headers: &HeaderMap,
    body: &[u8],
) -> Result<Response, S3Error> {
    super::require_bucket(state, bucket).await?;
    super::allow(
        state,
        principal,
        "s3:PutObjectRetention",
        &crate::auth::policy::object_arn(bucket, key),
    )
    .await?;
    let record = find_object(state, bucket, key, version_id)
        .await?
        .filter(|record| !record.delete_marker)
        .ok_or_else(|| S3Error::NoSuchKey(format!("/{bucket}/{key}")))?;

    let retention: xml::Retention = quick_xml::de::from_reader(body)
        .map_err(|error| S3Error::MalformedXml(error.to_string()))?;
    let mode = retention
        .mode
        .ok_or_else(|| S3Error::MalformedXml("missing Mode".to_string()))?
        .to_uppercase();
    if !object_lock::is_valid_mode(&mode) {
        return Err(S3Error::InvalidArgument(format!("invalid mode {mode:?}")));
    }
    let retain_until = retention
        .retain_until_date
        .as_deref()
        .map(|raw| {
            chrono::DateTime::parse_from_rfc3339(raw)
                .map(|at| at.naive_utc())
                .map_err(|_| S3Error::MalformedXml(format!("invalid RetainUntilDate {raw:?}")))
        })
        .transpose()?
        .ok_or_else(|| S3Error::MalformedXml("missing RetainUntilDate".to_string()))?;

    // Unexpired retention can be extended freely but only weakened under
    // GOVERNANCE with an authorized bypass; COMPLIANCE never weakens.
    if let Some(existing) = record.retain_until
        && existing > object_lock::now()
        && (retain_until < existing || mode != record.lock_mode.clone().unwrap_or_default())
    {
        match record.lock_mode.as_deref() {
            Some(object_lock::MODE_GOVERNANCE)
                if governance_bypass(state, principal, headers, bucket, key).await
                    == GovernanceBypass::Granted => {}
            _ => return Err(S3Error::AccessDenied(format!("/{bucket}/{key}"))),
        }
    }

    state
        .db
        .set_retention(record.id, Some(&mode), Some(retain_until))
        .await?;
    Ok(super::empty_response(StatusCode::OK))
}

async fn put_legal_hold(
    state: &AppState,
    principal: &Principal,
    bucket: &str,
    key: &str,
    version_id: Option<&str>,
    body: &[u8],
) -> Result<Response, S3Error> {
    super::require_bucket(state, bucket).await?;
    super::allow(
        state,
        principal,
        "s3:PutObjectLegalHold",
        &crate::auth::policy::object_arn(bucket, key),
    )
    .await?;
    let record = find_object(state, bucket, key, version_id)
        .await?
        .filter(|record| !record.delete_marker)
        .ok_or_else(|| S3Error::NoSuchKey(format!("/{bucket}/{key}")))?;

    let hold: xml::LegalHold = quick_xml::de::from_reader(body)
        .map_err(|error| S3Error::MalformedXml(error.to_string()))?;
    let on = match hold.status.as_str() {
        "ON" => true,
        "OFF" => false,
        other => {
            return Err(S3Error::MalformedXml(format!(
                "invalid legal hold status {other:?}"
            )));
        }
    };
    state.db.set_legal_hold(record.id, on).await?;
    Ok(super::empty_response(StatusCode::OK))
}
