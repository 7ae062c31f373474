use std::collections::BTreeSet;

use axum::Extension;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::Response;
use serde::Deserialize;

use crate::AppState;
use crate::auth::Principal;
use crate::auth::policy::bucket_arn;
use crate::database::ObjectRecord;
use crate::s3::error::S3Error;
use crate::s3::xml;

const DEFAULT_MAX_KEYS: i64 = 1000;

#[derive(Deserialize, Default, Debug)]
pub struct GetBucketParams {
    location: Option<String>,
    versioning: Option<String>,
    #[serde(rename = "object-lock")]
    object_lock: Option<String>,
    cors: Option<String>,
    lifecycle: Option<String>,
    versions: Option<String>,
    #[serde(rename = "list-type")]
    list_type: Option<String>,
    prefix: Option<String>,
    delimiter: Option<String>,
    #[serde(rename = "start-after")]
    start_after: Option<String>,
    #[serde(rename = "max-keys")]
    max_keys: Option<i64>,
}

/// Splits listed rows into contents and delimiter-collapsed common
/// prefixes. Folder markers land only in the prefixes, never twice.
fn collapse_prefixes(
    rows: Vec<ObjectRecord>,
    prefix: &str,
    delimiter: Option<&str>,
) -> (Vec<ObjectRecord>, Vec<String>) {
    let Some(delimiter) = delimiter.filter(|d| !d.is_empty()) else {
        return (rows, Vec::new());
    };

    let mut contents = Vec::new();
    let mut prefixes = BTreeSet::new();
    for row in rows {
        let rest = &row.object_key[prefix.len()..];
        match rest.find(delimiter) {
            Some(index) => {
                prefixes.insert(format!(
                    "{prefix}{}",
                    &rest[..index + delimiter.len()]
                ));
            }
            None => contents.push(row),
        }
    }
    (contents, prefixes.into_iter().collect())
}

#[axum::debug_handler]
/// Bucket-level GETs: `ListObjectsV2`, `ListObjectVersions`,
/// `GetBucketLocation`, `GetBucketVersioning`, `GetObjectLockConfiguration`
/// and the stored CORS / lifecycle documents.
pub async fn get_bucket(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path(bucket): Path<String>,
    Query(params): Query<GetBucketParams>,
) -> Result<Response, S3Error> {
    let bucket_row = super::require_bucket(&state, &bucket).await?;

    if params.location.is_some() {
        super::allow(&state, &principal, "s3:GetBucketLocation", &bucket_arn(&bucket)).await?;
        return Ok(super::xml_response(format!(
            "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n\
             <LocationConstraint xmlns=\"{}\">{}</LocationConstraint>",
            xml::S3_XMLNS,
            quick_xml::escape::escape(state.config.region.as_str()),
        )));
    }

    if params.versioning.is_some() {
        super::allow(&state, &principal, "s3:GetBucketVersioning", &bucket_arn(&bucket)).await?;
        let body = xml::to_xml(&xml::VersioningConfiguration {
            status: bucket_row
                .versioning_enabled
                .then(|| "Enabled".to_string()),
        })
        .map_err(|error| S3Error::Internal(error.to_string()))?;
        return Ok(super::xml_response(body));
    }

    if params.object_lock.is_some() {
        super::allow(&state, &principal, "s3:GetBucketObjectLockConfiguration", &bucket_arn(&bucket))
            .await?;
        let body = xml::to_xml(&xml::ObjectLockConfiguration {
            object_lock_enabled: bucket_row
                .object_lock_enabled
                .then(|| "Enabled".to_string()),
        })
        .map_err(|error| S3Error::Internal(error.to_string()))?;
        return Ok(super::xml_response(body));
    }

    if params.cors.is_some() {
        super::allow(&state, &principal, "s3:GetBucketCORS", &bucket_arn(&bucket)).await?;
        let config = state.db.get_bucket_config(&bucket).await?;
        return match config.and_then(|c| c.cors_json) {
            Some(document) => Ok(super::xml_response(document)),
            None => Ok(super::empty_response(StatusCode::NOT_FOUND)),
        };
    }

    if params.lifecycle.is_some() {
        super::allow(&state, &principal, "s3:GetLifecycleConfiguration", &bucket_arn(&bucket))
            .await?;
        let config = state.db.get_bucket_config(&bucket).await?;
        return match config.and_then(|c| c.lifecycle_json) {
            Some(document) => Ok(super::xml_response(document)),
            None => Ok(super::empty_response(StatusCode::NOT_FOUND)),
        };
    }

    if params.versions.is_some() {
        return list_versions(&state, &principal, &bucket, &params).await;
    }

    list_objects_v2(&state, &principal, &bucket, &params).await
}

async fn list_objects_v2(
    state: &AppState,
    principal: &Principal,
    bucket: &str,
    params: &GetBucketParams,
) -> Result<Response, S3Error> {
    super::allow(state, principal, "s3:ListBucket", &bucket_arn(bucket)).await?;

    let prefix = params.prefix.clone().unwrap_or_default();
    let start_after = params.start_after.clone().unwrap_or_default();
    let max_keys = params.max_keys.unwrap_or(DEFAULT_MAX_KEYS).clamp(0, 1000);

    // One row over the limit tells truncation apart from an exact fit.
    let rows = state
        .db
        .list_objects(bucket, &prefix, &start_after, max_keys + 1, false)
        .await?;
    let is_truncated = rows.len() as i64 > max_keys;
    let rows = rows.into_iter().take(max_keys as usize).collect();

    let (contents, common_prefixes) =
        collapse_prefixes(rows, &prefix, params.delimiter.as_deref());
    let key_count = contents.len() + common_prefixes.len();

    let body = xml::to_xml(&xml::ListBucketResult {
        xmlns: xml::S3_XMLNS,
        name: bucket.to_string(),
        prefix,
        delimiter: params.delimiter.clone(),
        start_after: params.start_after.clone(),
        max_keys,
        key_count,
        is_truncated,
        contents: contents
            .into_iter()
            .map(|row| xml::ObjectEntry {
                key: row.object_key,
                last_modified: xml::format_timestamp(row.modified_at),
                etag: super::quoted_etag(&row.etag),
                size: row.size,
                storage_class: "STANDARD",
            })
            .collect(),
        common_prefixes: common_prefixes
            .into_iter()
            .map(|prefix| xml::CommonPrefix { prefix })
            .collect(),
    })
    .map_err(|error| S3Error::Internal(error.to_string()))?;
    Ok(super::xml_response(body))
}

async fn list_versions(
    state: &AppState,
    principal: &Principal,
    bucket: &str,
    params: &GetBucketParams,
) -> Result<Response, S3Error> {
    super::allow(state, principal, "s3:ListBucketVersions", &bucket_arn(bucket)).await?;

    let prefix = params.prefix.clone().unwrap_or_default();
    let max_keys = params.max_keys.unwrap_or(DEFAULT_MAX_KEYS).clamp(0, 1000);

    let rows = state
        .db
        .list_objects(bucket, &prefix, "", max_keys + 1, true)
        .await?;
    let is_truncated = rows.len() as i64 > max_keys;

    let mut versions = Vec::new();
    let mut markers = Vec::new();
    for row in rows.into_iter().take(max_keys as usize) {
        if row.delete_marker {
            markers.push(xml::DeleteMarkerEntry {
                key: row.object_key,
                version_id: row.version_id,
                is_latest: row.is_latest,
                last_modified: xml::format_timestamp(row.modified_at),
            });
        } else {
            versions.push(xml::VersionEntry {
                key: row.object_key,
                version_id: row.version_id,
                is_latest: row.is_latest,
                last_modified: xml::format_timestamp(row.modified_at),
                etag: super::quoted_etag(&row.etag),
                size: row.size,
            });
        }
    }

    let body = xml::to_xml(&xml::ListVersionsResult {
        xmlns: xml::S3_XMLNS,
        name: bucket.to_string(),
        prefix,
        max_keys,
        is_truncated,
        version: versions,
        delete_marker: markers,
    })
    .map_err(|error| S3Error::Internal(error.to_string()))?;
    Ok(super::xml_response(body))
}

#[axum::debug_handler]
/// `HeadBucket`: existence and permission probe.
pub async fn head_bucket(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path(bucket): Path<String>,
) -> Result<Response, S3Error> {
    if super::allow(&state, &principal, "s3:ListBucket", &bucket_arn(&bucket))
        .await
        .is_err()
    {
        return Ok(super::empty_response(StatusCode::FORBIDDEN));
    }
    match state.db.get_bucket(&bucket).await? {
        Some(_) => Ok(super::empty_response(StatusCode::OK)),
        None => Ok(super::empty_response(StatusCode::NOT_FOUND)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(key: &str) -> ObjectRecord {
        ObjectRecord {
            id: 0,
            bucket: "b".to_string(),
            object_key: key.to_string(),
            version_id: "null".to_string(),
            blob_id: Some("blob".to_string()),
            size: 1,
            etag: "etag".to_string(),
            content_type: "application/octet-stream".to_string(),
            modified_at: chrono::Utc::now().naive_utc(),
            is_latest: true,
            delete_marker: false,
            encryption_type: None,
            lock_mode: None,
            retain_until: None,
            legal_hold: false,
        }
    }

    #[test]
    fn no_delimiter_keeps_everything_in_contents() {
        let rows = vec![row("a.txt"), row("docs/b.txt")];
        let (contents, prefixes) = collapse_prefixes(rows, "", None);
        assert_eq!(contents.len(), 2);
        assert!(prefixes.is_empty());
    }

    #[test]
    fn delimiter_collapses_shared_prefixes() {
        let rows = vec![
            row("a.txt"),
            row("docs/b.txt"),
            row("docs/c.txt"),
            row("img/d.png"),
        ];
        let (contents, prefixes) = collapse_prefixes(rows, "", Some("/"));
        assert_eq!(contents.len(), 1);
        assert_eq!(contents[0].object_key, "a.txt");
        assert_eq!(prefixes, vec!["docs/".to_string(), "img/".to_string()]);
    }

    #[test]
    fn folder_markers_show_up_only_as_prefixes() {
        let rows = vec![row("docs/"), row("docs/b.txt")];
        let (contents, prefixes) = collapse_prefixes(rows, "", Some("/"));
        assert!(contents.is_empty());
        assert_eq!(prefixes, vec!["docs/".to_string()]);
    }

    #[test]
    fn listing_under_a_prefix_narrows_the_collapse() {
        let rows = vec![row("docs/b.txt"), row("docs/sub/c.txt")];
        let (contents, prefixes) = collapse_prefixes(rows, "docs/", Some("/"));
        assert_eq!(contents.len(), 1);
        assert_eq!(contents[0].object_key, "docs/b.txt");
        assert_eq!(prefixes, vec!["docs/sub/".to_string()]);
    }
}
