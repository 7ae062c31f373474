//! Pipeline tests that drive the handlers directly: real migrations on an
//! in-memory database, a scratch blob directory, and the same extractor
//! values axum would hand over.

use std::sync::Arc;

use axum::Extension;
use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::Response;
use serde_json::json;

use crate::auth::Principal;
use crate::cli::{RunConfig, SqliteConfig};
use crate::crypto::MasterKey;
use crate::database::tests::test_db;
use crate::s3::error::S3Error;
use crate::{App, AppState, audit, blobs, keyed_lock};

use super::{
    delete_bucket, delete_object, get_bucket, get_object, post_object, put_bucket, put_object,
};

async fn test_state() -> (AppState, std::path::PathBuf) {
    let db = test_db().await;
    let blob_root = std::env::temp_dir().join(format!("penha-s3-{}", super::token32()));
    let blobs = blobs::BlobStore::initialize(&blob_root).await.unwrap();
    let config = RunConfig {
        bind: "::".to_string(),
        port: 0,
        database_url: "sqlite::memory:".to_string(),
        blob_path: blob_root.clone(),
        region: "us-east-1".to_string(),
        sse_master_key: None,
        session_secret: None,
        admin_password: None,
        root: None,
        virtual_host_domain: None,
        multipart_max_age_secs: 604_800,
        gc_interval_secs: 60,
        sqlite: SqliteConfig {
            journal_mode: None,
            synchronous: None,
            auto_vacuum: None,
        },
    };
    let state = Arc::new(App {
        db,
        blobs,
        locks: keyed_lock::KeyedLocks::new(),
        audit: audit::AuditSink,
        master_key: Some(MasterKey::from_hex(&"ab".repeat(32)).unwrap()),
        tokens: crate::auth::token::TokenSigner::new(b"test-secret"),
        config,
    });
    (state, blob_root)
}

fn admin() -> Principal {
    Principal {
        username: "admin".to_string(),
        access_key_id: None,
    }
}

fn params<T: serde::de::DeserializeOwned>(value: serde_json::Value) -> Query<T> {
    Query(serde_json::from_value(value).unwrap())
}

async fn create_bucket(state: &AppState, name: &str, headers: HeaderMap) {
    let response = put_bucket::put_bucket(
        State(state.clone()),
        Extension(admin()),
        Path(name.to_string()),
        Query(Default::default()),
        headers,
        Bytes::new(),
    )
    .await
    .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

async fn put(
    state: &AppState,
    bucket: &str,
    key: &str,
    headers: HeaderMap,
    body: &[u8],
) -> Response {
    put_object::put_object(
        State(state.clone()),
        Extension(admin()),
        Path((bucket.to_string(), key.to_string())),
        Query(Default::default()),
        headers,
        Bytes::copy_from_slice(body),
    )
    .await
    .unwrap()
}

async fn get(
    state: &AppState,
    bucket: &str,
    key: &str,
    query: serde_json::Value,
) -> Result<Response, S3Error> {
    get_object::get_object(
        State(state.clone()),
        Extension(admin()),
        Path((bucket.to_string(), key.to_string())),
        params(query),
        HeaderMap::new(),
    )
    .await
}

async fn body_bytes(response: Response) -> Vec<u8> {
    axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap()
        .to_vec()
}

fn header<'a>(response: &'a Response, name: &str) -> Option<&'a str> {
    response.headers().get(name).and_then(|v| v.to_str().ok())
}

#[tokio::test]
async fn put_then_get_returns_the_same_bytes() {
    let (state, root) = test_state().await;
    create_bucket(&state, "b", HeaderMap::new()).await;

    let mut headers = HeaderMap::new();
    headers.insert(header::CONTENT_TYPE, "text/plain".parse().unwrap());
    let put_response = put(&state, "b", "hello.txt", headers, b"hello world").await;
    assert_eq!(put_response.status(), StatusCode::OK);
    assert_eq!(
        header(&put_response, "etag").unwrap(),
        format!("\"{}\"", crate::crypto::md5_hex(b"hello world"))
    );

    let get_response = get(&state, "b", "hello.txt", json!({})).await.unwrap();
    assert_eq!(get_response.status(), StatusCode::OK);
    assert_eq!(header(&get_response, "content-type").unwrap(), "text/plain");
    assert_eq!(body_bytes(get_response).await, b"hello world");

    tokio::fs::remove_dir_all(&root).await.unwrap();
}

#[tokio::test]
async fn sse_objects_round_trip_but_rest_differs() {
    let (state, root) = test_state().await;
    create_bucket(&state, "b", HeaderMap::new()).await;

    let mut headers = HeaderMap::new();
    headers.insert("x-amz-server-side-encryption", "AES256".parse().unwrap());
    let put_response = put(&state, "b", "secret.bin", headers, b"classified payload").await;
    assert_eq!(put_response.status(), StatusCode::OK);
    assert_eq!(
        header(&put_response, "x-amz-server-side-encryption").unwrap(),
        "AES256"
    );

    // What sits on disk is sealed, not the plaintext.
    let record = state.db.get_latest_object("b", "secret.bin").await.unwrap().unwrap();
    let stored = state.blobs.get(record.blob_id.as_deref().unwrap()).await.unwrap();
    assert_ne!(stored, b"classified payload");
    assert_eq!(record.encryption_type.as_deref(), Some("AES256"));

    let get_response = get(&state, "b", "secret.bin", json!({})).await.unwrap();
    assert_eq!(body_bytes(get_response).await, b"classified payload");

    tokio::fs::remove_dir_all(&root).await.unwrap();
}

#[tokio::test]
async fn range_reads_slice_the_plaintext() {
    let (state, root) = test_state().await;
    create_bucket(&state, "b", HeaderMap::new()).await;
    put(&state, "b", "k", HeaderMap::new(), b"0123456789").await;

    let mut headers = HeaderMap::new();
    headers.insert(header::RANGE, "bytes=2-5".parse().unwrap());
    let response = get_object::get_object(
        State(state.clone()),
        Extension(admin()),
        Path(("b".to_string(), "k".to_string())),
        params(json!({})),
        headers,
    )
    .await
    .unwrap();
    assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
    assert_eq!(header(&response, "content-range").unwrap(), "bytes 2-5/10");
    assert_eq!(body_bytes(response).await, b"2345");

    tokio::fs::remove_dir_all(&root).await.unwrap();
}

#[tokio::test]
async fn versioned_put_put_delete_get_sequence() {
    let (state, root) = test_state().await;
    create_bucket(&state, "b", HeaderMap::new()).await;
    state.db.set_versioning("b", true).await.unwrap();

    let first = put(&state, "b", "k", HeaderMap::new(), b"v1").await;
    let v1 = header(&first, "x-amz-version-id").unwrap().to_string();
    let second = put(&state, "b", "k", HeaderMap::new(), b"v2").await;
    let v2 = header(&second, "x-amz-version-id").unwrap().to_string();
    assert_ne!(v1, v2);

    // Untargeted delete leaves a marker.
    let deleted = delete_object::delete_object(
        State(state.clone()),
        Extension(admin()),
        Path(("b".to_string(), "k".to_string())),
        params(json!({})),
        HeaderMap::new(),
    )
    .await
    .unwrap();
    assert_eq!(deleted.status(), StatusCode::NO_CONTENT);
    assert_eq!(header(&deleted, "x-amz-delete-marker").unwrap(), "true");

    // Plain GET now 404s but announces the marker.
    let missing = get(&state, "b", "k", json!({})).await.unwrap();
    assert_eq!(missing.status(), StatusCode::NOT_FOUND);
    assert_eq!(header(&missing, "x-amz-delete-marker").unwrap(), "true");

    // The first version stays addressable.
    let old = get(&state, "b", "k", json!({"versionId": v1})).await.unwrap();
    assert_eq!(body_bytes(old).await, b"v1");

    tokio::fs::remove_dir_all(&root).await.unwrap();
}

#[tokio::test]
async fn multipart_assembles_in_part_order_with_the_composite_etag() {
    let (state, root) = test_state().await;
    create_bucket(&state, "b", HeaderMap::new()).await;

    // Create the upload session.
    let created = post_object::post_object(
        State(state.clone()),
        Extension(admin()),
        Path(("b".to_string(), "big.bin".to_string())),
        params(json!({"uploads": ""})),
        HeaderMap::new(),
        Bytes::new(),
    )
    .await
    .unwrap();
    let created_xml = String::from_utf8(body_bytes(created).await).unwrap();
    let upload_id = created_xml
        .split("<UploadId>")
        .nth(1)
        .unwrap()
        .split("</UploadId>")
        .next()
        .unwrap()
        .to_string();

    let part1 = vec![0u8; 5 * 1024 * 1024];
    let part2 = vec![1u8; 1024];
    // Upload part 2 first; completion order comes from the manifest.
    for (number, data) in [(2, &part2), (1, &part1)] {
        let response = put_object::put_object(
            State(state.clone()),
            Extension(admin()),
            Path(("b".to_string(), "big.bin".to_string())),
            params(json!({"partNumber": number, "uploadId": upload_id.as_str()})),
            HeaderMap::new(),
            Bytes::copy_from_slice(data),
        )
        .await
        .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    let e1 = crate::crypto::md5_hex(&part1);
    let e2 = crate::crypto::md5_hex(&part2);
    let manifest = format!(
        "<CompleteMultipartUpload>\
         <Part><PartNumber>1</PartNumber><ETag>\"{e1}\"</ETag></Part>\
         <Part><PartNumber>2</PartNumber><ETag>\"{e2}\"</ETag></Part>\
         </CompleteMultipartUpload>"
    );
    let completed = post_object::post_object(
        State(state.clone()),
        Extension(admin()),
        Path(("b".to_string(), "big.bin".to_string())),
        params(json!({"uploadId": upload_id.as_str()})),
        HeaderMap::new(),
        Bytes::from(manifest),
    )
    .await
    .unwrap();
    let completed_xml = String::from_utf8(body_bytes(completed).await).unwrap();
    let expected_etag =
        crate::crypto::multipart_etag(&[e1.clone(), e2.clone()]).unwrap();
    assert!(completed_xml.contains(&expected_etag));

    // GET returns the byte-exact concatenation.
    let assembled = get(&state, "b", "big.bin", json!({})).await.unwrap();
    let bytes = body_bytes(assembled).await;
    assert_eq!(bytes.len(), part1.len() + part2.len());
    assert_eq!(&bytes[..part1.len()], &part1[..]);
    assert_eq!(&bytes[part1.len()..], &part2[..]);

    // The session is gone.
    assert!(state.db.get_upload(&upload_id).await.unwrap().is_none());

    tokio::fs::remove_dir_all(&root).await.unwrap();
}

#[tokio::test]
async fn complete_rejects_wrong_etags_small_parts_and_bad_order() {
    let (state, root) = test_state().await;
    create_bucket(&state, "b", HeaderMap::new()).await;
    state
        .db
        .create_upload("upl", "b", "k", None)
        .await
        .unwrap();
    for (number, data) in [(1i64, b"tiny".as_slice()), (2, b"also tiny")] {
        state
            .db
            .upsert_part(&crate::database::MultipartPart {
                upload_id: "upl".to_string(),
                part_number: number,
                blob_id: state.blobs.put(data).await.unwrap(),
                etag: crate::crypto::md5_hex(data),
                size: data.len() as i64,
            })
            .await
            .unwrap();
    }

    let complete = |manifest: String| {
        let state = state.clone();
        async move {
            post_object::post_object(
                State(state.clone()),
                Extension(admin()),
                Path(("b".to_string(), "k".to_string())),
                params(json!({"uploadId": "upl"})),
                HeaderMap::new(),
                Bytes::from(manifest),
            )
            .await
        }
    };

    // Mismatched etag.
    let wrong_etag = complete(
        "<CompleteMultipartUpload><Part><PartNumber>1</PartNumber><ETag>\"ffff\"</ETag></Part></CompleteMultipartUpload>"
            .to_string(),
    )
    .await;
    assert!(matches!(wrong_etag, Err(S3Error::InvalidPart(_))));

    // Descending order.
    let e1 = crate::crypto::md5_hex(b"tiny");
    let e2 = crate::crypto::md5_hex(b"also tiny");
    let out_of_order = complete(format!(
        "<CompleteMultipartUpload>\
         <Part><PartNumber>2</PartNumber><ETag>\"{e2}\"</ETag></Part>\
         <Part><PartNumber>1</PartNumber><ETag>\"{e1}\"</ETag></Part>\
         </CompleteMultipartUpload>"
    ))
    .await;
    assert!(matches!(out_of_order, Err(S3Error::InvalidPartOrder(_))));

    // A non-terminal part under 5 MiB.
    let too_small = complete(format!(
        "<CompleteMultipartUpload>\
         <Part><PartNumber>1</PartNumber><ETag>\"{e1}\"</ETag></Part>\
         <Part><PartNumber>2</PartNumber><ETag>\"{e2}\"</ETag></Part>\
         </CompleteMultipartUpload>"
    ))
    .await;
    assert!(matches!(too_small, Err(S3Error::EntityTooSmall(_))));

    tokio::fs::remove_dir_all(&root).await.unwrap();
}

#[tokio::test]
async fn compliance_lock_blocks_deletion_until_expiry() {
    let (state, root) = test_state().await;
    let mut bucket_headers = HeaderMap::new();
    bucket_headers.insert("x-amz-bucket-object-lock-enabled", "true".parse().unwrap());
    create_bucket(&state, "b", bucket_headers).await;

    let mut headers = HeaderMap::new();
    headers.insert("x-amz-object-lock-mode", "COMPLIANCE".parse().unwrap());
    let retain = (chrono::Utc::now() + chrono::Duration::hours(1))
        .to_rfc3339_opts(chrono::SecondsFormat::Secs, true);
    headers.insert(
        "x-amz-object-lock-retain-until-date",
        retain.parse().unwrap(),
    );
    let put_response = put(&state, "b", "held", headers, b"held bytes").await;
    let version = header(&put_response, "x-amz-version-id").unwrap().to_string();

    let delete = |version: String| {
        let state = state.clone();
        async move {
            delete_object::delete_object(
                State(state.clone()),
                Extension(admin()),
                Path(("b".to_string(), "held".to_string())),
                params(json!({"versionId": version})),
                HeaderMap::new(),
            )
            .await
        }
    };

    // Even with a bypass header this is COMPLIANCE: denied.
    assert!(matches!(
        delete(version.clone()).await,
        Err(S3Error::AccessDenied(_))
    ));

    // Once retention lapses the version can go.
    sqlx::query("UPDATE objects SET retain_until = datetime('now', '-1 hour')")
        .execute(&state.db.pool)
        .await
        .unwrap();
    let response = delete(version).await.unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    tokio::fs::remove_dir_all(&root).await.unwrap();
}

#[tokio::test]
async fn governance_lock_yields_to_an_authorized_bypass() {
    let (state, root) = test_state().await;
    let mut bucket_headers = HeaderMap::new();
    bucket_headers.insert("x-amz-bucket-object-lock-enabled", "true".parse().unwrap());
    create_bucket(&state, "b", bucket_headers).await;

    let mut headers = HeaderMap::new();
    headers.insert("x-amz-object-lock-mode", "GOVERNANCE".parse().unwrap());
    let retain = (chrono::Utc::now() + chrono::Duration::hours(1))
        .to_rfc3339_opts(chrono::SecondsFormat::Secs, true);
    headers.insert(
        "x-amz-object-lock-retain-until-date",
        retain.parse().unwrap(),
    );
    let put_response = put(&state, "b", "held", headers, b"held bytes").await;
    let version = header(&put_response, "x-amz-version-id").unwrap().to_string();

    // Without the bypass header: denied.
    let denied = delete_object::delete_object(
        State(state.clone()),
        Extension(admin()),
        Path(("b".to_string(), "held".to_string())),
        params(json!({"versionId": version.clone()})),
        HeaderMap::new(),
    )
    .await;
    assert!(matches!(denied, Err(S3Error::AccessDenied(_))));

    // Admin with the bypass header punches through.
    let mut bypass = HeaderMap::new();
    bypass.insert("x-amz-bypass-governance-retention", "true".parse().unwrap());
    let allowed = delete_object::delete_object(
        State(state.clone()),
        Extension(admin()),
        Path(("b".to_string(), "held".to_string())),
        params(json!({"versionId": version})),
        bypass,
    )
    .await
    .unwrap();
    assert_eq!(allowed.status(), StatusCode::NO_CONTENT);

    tokio::fs::remove_dir_all(&root).await.unwrap();
}

#[tokio::test]
async fn bucket_deletion_ignores_non_current_versions() {
    let (state, root) = test_state().await;
    create_bucket(&state, "b", HeaderMap::new()).await;
    state.db.set_versioning("b", true).await.unwrap();
    put(&state, "b", "k", HeaderMap::new(), b"v1").await;

    let try_delete_bucket = || {
        let state = state.clone();
        async move {
            delete_bucket::delete_bucket(
                State(state.clone()),
                Extension(admin()),
                Path("b".to_string()),
                Query(Default::default()),
            )
            .await
        }
    };

    // A current object blocks deletion.
    assert!(matches!(
        try_delete_bucket().await,
        Err(S3Error::BucketNotEmpty(_))
    ));

    // Tombstone the key: the marker is now current and the old version is
    // history, so nothing counts as a current object anymore.
    delete_object::delete_object(
        State(state.clone()),
        Extension(admin()),
        Path(("b".to_string(), "k".to_string())),
        params(json!({})),
        HeaderMap::new(),
    )
    .await
    .unwrap();

    let response = try_delete_bucket().await.unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
    assert!(state.db.get_bucket("b").await.unwrap().is_none());

    tokio::fs::remove_dir_all(&root).await.unwrap();
}

#[tokio::test]
async fn copy_object_preserves_bytes_and_etag() {
    let (state, root) = test_state().await;
    create_bucket(&state, "src", HeaderMap::new()).await;
    create_bucket(&state, "dst", HeaderMap::new()).await;
    put(&state, "src", "orig.txt", HeaderMap::new(), b"copy me").await;

    let mut headers = HeaderMap::new();
    headers.insert("x-amz-copy-source", "/src/orig.txt".parse().unwrap());
    let copied = put(&state, "dst", "copied.txt", headers, b"").await;
    assert_eq!(copied.status(), StatusCode::OK);
    let xml = String::from_utf8(body_bytes(copied).await).unwrap();
    assert!(xml.contains(&crate::crypto::md5_hex(b"copy me")));

    let fetched = get(&state, "dst", "copied.txt", json!({})).await.unwrap();
    assert_eq!(body_bytes(fetched).await, b"copy me");

    tokio::fs::remove_dir_all(&root).await.unwrap();
}

#[tokio::test]
async fn listing_collapses_prefixes_and_hides_markers() {
    let (state, root) = test_state().await;
    create_bucket(&state, "b", HeaderMap::new()).await;
    for key in ["a.txt", "docs/one.txt", "docs/two.txt"] {
        put(&state, "b", key, HeaderMap::new(), b"x").await;
    }

    let listed = get_bucket::get_bucket(
        State(state.clone()),
        Extension(admin()),
        Path("b".to_string()),
        params(json!({"list-type": "2", "delimiter": "/"})),
    )
    .await
    .unwrap();
    let xml = String::from_utf8(body_bytes(listed).await).unwrap();
    assert!(xml.contains("<Key>a.txt</Key>"));
    assert!(!xml.contains("<Key>docs/one.txt</Key>"));
    assert!(xml.contains("<CommonPrefixes><Prefix>docs/</Prefix></CommonPrefixes>"));

    tokio::fs::remove_dir_all(&root).await.unwrap();
}

#[tokio::test]
async fn tagging_replaces_atomically() {
    let (state, root) = test_state().await;
    create_bucket(&state, "b", HeaderMap::new()).await;
    put(&state, "b", "k", HeaderMap::new(), b"x").await;

    let put_tags = |body: &str| {
        let state = state.clone();
        let body = body.to_string();
        async move {
            put_object::put_object(
                State(state.clone()),
                Extension(admin()),
                Path(("b".to_string(), "k".to_string())),
                params(json!({"tagging": ""})),
                HeaderMap::new(),
                Bytes::from(body),
            )
            .await
        }
    };

    put_tags("<Tagging><TagSet><Tag><Key>env</Key><Value>prod</Value></Tag><Tag><Key>team</Key><Value>core</Value></Tag></TagSet></Tagging>")
        .await
        .unwrap();
    put_tags("<Tagging><TagSet><Tag><Key>env</Key><Value>staging</Value></Tag></TagSet></Tagging>")
        .await
        .unwrap();

    let fetched = get(&state, "b", "k", json!({"tagging": ""})).await.unwrap();
    let xml = String::from_utf8(body_bytes(fetched).await).unwrap();
    assert!(xml.contains("<Key>env</Key><Value>staging</Value>"));
    assert!(!xml.contains("team"));

    tokio::fs::remove_dir_all(&root).await.unwrap();
}
