use axum::body::Body;
use axum::extract::Request;
use axum::http::{StatusCode, Uri, header};
use axum::response::Response;
use axum::routing::get;
use http::Method;
use rand::distr::{Alphanumeric, SampleString};
use tower_http::cors::{self, CorsLayer};

use crate::auth::{self, Principal};
use crate::database::{Bucket, Database};
use crate::{AppState, s3::error::S3Error};

pub mod error;
pub mod object_lock;
pub mod xml;

#[cfg(test)]
mod pipeline_tests;

mod delete_bucket;
mod delete_object;
mod get_bucket;
mod get_object;
mod head_object;
mod list_buckets;
mod post_object;
mod put_bucket;
mod put_object;

/// Sentinel version id of rows on unversioned buckets.
pub(crate) const NULL_VERSION_ID: &str = "null";

/// Opaque URL-safe token for version ids and upload ids.
pub(crate) fn token32() -> String {
    Alphanumeric.sample_string(&mut rand::rng(), 32)
}

pub(crate) fn quoted_etag(etag: &str) -> String {
    format!("\"{etag}\"")
}

pub(crate) fn unquote_etag(etag: &str) -> &str {
    etag.trim_matches('"')
}

pub(crate) async fn require_bucket(
    state: &AppState,
    name: &str,
) -> Result<Bucket, S3Error> {
    state
        .db
        .get_bucket(name)
        .await?
        .ok_or_else(|| S3Error::NoSuchBucket(format!("/{name}")))
}

/// Policy gate used by every handler.
pub(crate) async fn allow(
    state: &AppState,
    principal: &Principal,
    action: &str,
    resource: &str,
) -> Result<(), S3Error> {
    auth::authorize(&state.db, &state.audit, principal, action, resource).await
}

pub(crate) fn xml_response(body: String) -> Response {
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/xml")
        .body(Body::from(body))
        .unwrap_or_default()
}

pub(crate) fn empty_response(status: StatusCode) -> Response {
    Response::builder()
        .status(status)
        .body(Body::empty())
        .unwrap_or_default()
}

/// Rewrites `bucket.<domain>/key` requests to the path style the router
/// understands. Signing happened against the original URI, so this runs
/// after the authentication layer.
pub(crate) fn apply_virtual_host(domain: &str, request: &mut Request) {
    let Some(host) = request
        .headers()
        .get(header::HOST)
        .and_then(|value| value.to_str().ok())
    else {
        return;
    };
    let host = host.split(':').next().unwrap_or(host);
    let Some(bucket) = host.strip_suffix(domain).and_then(|h| h.strip_suffix('.')) else {
        return;
    };
    if bucket.is_empty() {
        return;
    }

    let path_and_query = request
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let rewritten = format!("/{bucket}{path_and_query}");
    if let Ok(uri) = rewritten.parse::<Uri>() {
        tracing::debug!(bucket, uri = %uri, "Rewrote virtual-host request");
        *request.uri_mut() = uri;
    }
}

pub fn routes(db: Database, virtual_host_domain: Option<String>) -> axum::Router<AppState> {
    // Layer order matters: authentication verifies signatures against the
    // URI the client actually signed, so the virtual-host rewrite sits
    // between it and route matching.
    let rewrite = axum::middleware::from_fn(
        move |mut request: Request, next: axum::middleware::Next| {
            let domain = virtual_host_domain.clone();
            async move {
                if let Some(domain) = &domain {
                    apply_virtual_host(domain, &mut request);
                }
                next.run(request).await
            }
        },
    );

    axum::Router::new()
        .route("/", get(list_buckets::list_buckets))
        .route(
            "/{bucket}",
            get(get_bucket::get_bucket)
                .put(put_bucket::put_bucket)
                .delete(delete_bucket::delete_bucket)
                .head(get_bucket::head_bucket),
        )
        .route(
            "/{bucket}/",
            get(get_bucket::get_bucket)
                .put(put_bucket::put_bucket)
                .delete(delete_bucket::delete_bucket)
                .head(get_bucket::head_bucket),
        )
        .route(
            "/{bucket}/{*key}",
            get(get_object::get_object)
                .put(put_object::put_object)
                .delete(delete_object::delete_object)
                .head(head_object::head_object)
                .post(post_object::post_object),
        )
        .layer(rewrite)
        .layer(auth::AuthenticationLayer::new(db))
        .layer(
            CorsLayer::new()
                .allow_headers([
                    header::CONTENT_TYPE,
                    header::RANGE,
                    header::USER_AGENT,
                    header::AUTHORIZATION,
                    header::HeaderName::from_static("x-amz-date"),
                    header::HeaderName::from_static("x-amz-content-sha256"),
                ])
                .allow_methods([
                    Method::GET,
                    Method::PUT,
                    Method::POST,
                    Method::DELETE,
                    Method::HEAD,
                    Method::OPTIONS,
                ])
                .allow_origin(cors::Any)
                .expose_headers([
                    header::CONTENT_LENGTH,
                    header::CONTENT_RANGE,
                    header::ETAG,
                    header::HeaderName::from_static("x-amz-version-id"),
                    header::HeaderName::from_static("x-amz-delete-marker"),
                ]),
        )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request_for(host: &str, path: &str) -> Request {
        Request::builder()
            .method("GET")
            .uri(format!("http://{host}{path}"))
            .header(header::HOST, host)
            .body(Body::empty())
            .unwrap()
    }

    #[test]
    fn virtual_host_requests_gain_the_bucket_prefix() {
        let mut request = request_for("photos.s3.example.net", "/cat.jpg?versionId=v1");
        apply_virtual_host("s3.example.net", &mut request);
        assert_eq!(
            request.uri().path_and_query().unwrap().as_str(),
            "/photos/cat.jpg?versionId=v1"
        );
    }

    #[test]
    fn path_style_requests_are_untouched() {
        let mut request = request_for("s3.example.net", "/photos/cat.jpg");
        apply_virtual_host("s3.example.net", &mut request);
        assert_eq!(request.uri().path(), "/photos/cat.jpg");

        let mut other_domain = request_for("elsewhere.example.com", "/photos/cat.jpg");
        apply_virtual_host("s3.example.net", &mut other_domain);
        assert_eq!(other_domain.uri().path(), "/photos/cat.jpg");
    }

    #[test]
    fn ports_are_ignored_when_matching_the_domain() {
        let mut request = request_for("photos.localhost:9000", "/cat.jpg");
        apply_virtual_host("localhost", &mut request);
        assert_eq!(request.uri().path(), "/photos/cat.jpg");
    }
}
