use axum::Extension;
use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::Response;
use serde::Deserialize;

use crate::AppState;
use crate::auth::Principal;
use crate::database::ObjectRecord;
use crate::s3::error::S3Error;
use crate::s3::put_object::{find_object, read_plaintext};
use crate::s3::xml;

#[derive(Deserialize, Default, Debug)]
pub struct GetObjectParams {
    #[serde(rename = "versionId")]
    version_id: Option<String>,
    tagging: Option<String>,
    retention: Option<String>,
    #[serde(rename = "legal-hold")]
    legal_hold: Option<String>,
}

/// Resolves the row a read refers to, mapping delete markers and missing
/// versions to the right AWS error.
pub(crate) async fn resolve_for_read(
    state: &AppState,
    bucket: &str,
    key: &str,
    version_id: Option<&str>,
) -> Result<ObjectRecord, S3Error> {
    super::require_bucket(state, bucket).await?;
    let resource = format!("/{bucket}/{key}");
    match version_id {
        Some(_) => find_object(state, bucket, key, version_id)
            .await?
            .ok_or(S3Error::NoSuchVersion(resource)),
        None => {
            let record = find_object(state, bucket, key, None)
                .await?
                .ok_or_else(|| S3Error::NoSuchKey(resource.clone()))?;
            if record.delete_marker {
                return Err(S3Error::NoSuchKey(resource));
            }
            Ok(record)
        }
    }
}

/// Single byte range over the plaintext, `bytes=a-b` / `bytes=a-` /
/// `bytes=-n` forms.
fn resolve_range(raw: &str, size: usize) -> Result<(usize, usize), S3Error> {
    let invalid = || S3Error::InvalidRange(format!("bytes */{size}"));
    let spec = raw.trim().strip_prefix("bytes=").ok_or_else(invalid)?;
    let (start, end) = spec.split_once('-').ok_or_else(invalid)?;

    let (start, end) = match (start, end) {
        ("", suffix) => {
            let count: usize = suffix.parse().map_err(|_| invalid())?;
            if count == 0 {
                return Err(invalid());
            }
            (size.saturating_sub(count), size - 1)
        }
        (from, "") => {
            let from: usize = from.parse().map_err(|_| invalid())?;
            (from, size.saturating_sub(1))
        }
        (from, to) => {
            let from: usize = from.parse().map_err(|_| invalid())?;
            let to: usize = to.parse().map_err(|_| invalid())?;
            (from, to.min(size.saturating_sub(1)))
        }
    };
    if start > end || start >= size {
        return Err(invalid());
    }
    Ok((start, end))
}

#[axum::debug_handler]
/// `GetObject` plus the `?tagging`, `?retention` and `?legal-hold` reads.
pub async fn get_object(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path((bucket, key)): Path<(String, String)>,
    Query(params): Query<GetObjectParams>,
    headers: HeaderMap,
) -> Result<Response, S3Error> {
    let arn = crate::auth::policy::object_arn(&bucket, &key);
    let version_id = params.version_id.as_deref();

    if params.tagging.is_some() {
        super::allow(&state, &principal, "s3:GetObjectTagging", &arn).await?;
        let record = resolve_for_read(&state, &bucket, &key, version_id).await?;
        let tags = state.db.get_tags(record.id).await?;
        let body = xml::to_xml(&xml::Tagging {
            tag_set: xml::TagSet {
                tag: tags
                    .into_iter()
                    .map(|(key, value)| xml::Tag { key, value })
                    .collect(),
            },
        })
        .map_err(|error| S3Error::Internal(error.to_string()))?;
        return Ok(super::xml_response(body));
    }

    if params.retention.is_some() {
        super::allow(&state, &principal, "s3:GetObjectRetention", &arn).await?;
        let record = resolve_for_read(&state, &bucket, &key, version_id).await?;
        let body = xml::to_xml(&xml::Retention {
            mode: record.lock_mode.clone(),
            retain_until_date: record
                .retain_until
                .map(xml::format_timestamp),
        })
        .map_err(|error| S3Error::Internal(error.to_string()))?;
        return Ok(super::xml_response(body));
    }

    if params.legal_hold.is_some() {
        super::allow(&state, &principal, "s3:GetObjectLegalHold", &arn).await?;
        let record = resolve_for_read(&state, &bucket, &key, version_id).await?;
        let body = xml::to_xml(&xml::LegalHold {
            status: if record.legal_hold { "ON" } else { "OFF" }.to_string(),
        })
        .map_err(|error| S3Error::Internal(error.to_string()))?;
        return Ok(super::xml_response(body));
    }

    super::allow(&state, &principal, "s3:GetObject", &arn).await?;
    let record = match resolve_for_read(&state, &bucket, &key, version_id).await {
        Ok(record) => record,
        // A delete marker 404 still announces itself.
        Err(S3Error::NoSuchKey(resource)) => {
            if let Some(latest) = find_object(&state, &bucket, &key, None).await?
                && latest.delete_marker
            {
                return Ok(Response::builder()
                    .status(StatusCode::NOT_FOUND)
                    .header("x-amz-delete-marker", "true")
                    .header(header::CONTENT_TYPE, "application/xml")
                    .body(Body::from(S3Error::NoSuchKey(resource).into_xml()))
                    .unwrap_or_default());
            }
            return Err(S3Error::NoSuchKey(resource));
        }
        Err(error) => return Err(error),
    };

    if record.delete_marker {
        return Err(S3Error::NoSuchKey(format!("/{bucket}/{key}")));
    }

    // Range slicing happens over plaintext; encrypted blobs are opened in
    // full first since GCM cannot seek.
    let plaintext = read_plaintext(&state, &record).await?;

    let range = headers
        .get(header::RANGE)
        .and_then(|value| value.to_str().ok())
        .map(|raw| resolve_range(raw, plaintext.len()))
        .transpose()?;

    let mut builder = Response::builder()
        .header(header::CONTENT_TYPE, &record.content_type)
        .header(header::ETAG, super::quoted_etag(&record.etag))
        .header(header::LAST_MODIFIED, xml::http_date(record.modified_at));
    if record.version_id != super::NULL_VERSION_ID {
        builder = builder.header("x-amz-version-id", &record.version_id);
    }
    if let Some(encryption) = &record.encryption_type {
        builder = builder.header("x-amz-server-side-encryption", encryption);
    }

    let response = match range {
        Some((start, end)) => builder
            .status(StatusCode::PARTIAL_CONTENT)
            .header(
                header::CONTENT_RANGE,
                format!("bytes {start}-{end}/{}", plaintext.len()),
            )
            .header(header::CONTENT_LENGTH, end - start + 1)
            .body(Body::from(plaintext[start..=end].to_vec())),
        None => builder
            .status(StatusCode::OK)
            .header(header::CONTENT_LENGTH, plaintext.len())
            .body(Body::from(plaintext)),
    };
    Ok(response.unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_ranges_resolve() {
        assert_eq!(resolve_range("bytes=0-4", 10).unwrap(), (0, 4));
        assert_eq!(resolve_range("bytes=5-", 10).unwrap(), (5, 9));
        assert_eq!(resolve_range("bytes=-3", 10).unwrap(), (7, 9));
        // Over-long end is clamped, matching HTTP range semantics.
        assert_eq!(resolve_range("bytes=2-999", 10).unwrap(), (2, 9));
    }

    #[test]
    fn bad_ranges_are_rejected() {
        assert!(resolve_range("bytes=10-", 10).is_err());
        assert!(resolve_range("bytes=7-3", 10).is_err());
        assert!(resolve_range("bytes=-0", 10).is_err());
        assert!(resolve_range("chunks=0-4", 10).is_err());
    }
}
