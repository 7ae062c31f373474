use std::pin::Pin;
use std::task::{Context, Poll};

use axum::body::Body;
use axum::extract::Request;
use axum::response::IntoResponse;
use chrono::Utc;
use futures::FutureExt;
use tower_layer::Layer;
use tower_service::Service;

pub mod chunked;
pub mod policy;
pub mod sigv4;
pub mod token;

use crate::audit::{AuditEvent, AuditSink};
use crate::database::Database;
use crate::s3::error::S3Error;
use chunked::ChunkVerifier;
use sigv4::SigV4Error;

/// The authenticated identity attached to every request that clears the
/// authentication layer.
#[derive(Debug, Clone)]
pub struct Principal {
    pub username: String,
    pub access_key_id: Option<String>,
}

impl Principal {
    pub fn anonymous() -> Self {
        Principal {
            username: policy::ANONYMOUS_USER.to_string(),
            access_key_id: None,
        }
    }
}

enum Verified {
    Plain(Principal),
    Streaming {
        principal: Principal,
        verifier: ChunkVerifier,
    },
}

fn auth_error(error: SigV4Error, resource: &str) -> S3Error {
    match error {
        SigV4Error::SignatureMismatch => S3Error::SignatureDoesNotMatch(resource.to_string()),
        SigV4Error::TimeSkewed => S3Error::RequestTimeTooSkewed(resource.to_string()),
        SigV4Error::Expired => S3Error::AccessDenied(resource.to_string()),
        SigV4Error::Malformed(detail) => S3Error::AuthorizationHeaderMalformed(detail),
        SigV4Error::UnsupportedAlgorithm(algorithm) => {
            S3Error::AuthorizationHeaderMalformed(format!("unsupported algorithm {algorithm}"))
        }
        SigV4Error::MissingField(field) => {
            S3Error::AuthorizationHeaderMalformed(format!("missing {field}"))
        }
    }
}

async fn resolve_principal(
    db: &Database,
    credential: &sigv4::Credential,
    resource: &str,
) -> Result<(Principal, String), S3Error> {
    let key = db
        .get_access_key(&credential.access_key_id)
        .await?
        .ok_or_else(|| S3Error::InvalidAccessKeyId(resource.to_string()))?;
    Ok((
        Principal {
            username: key.username,
            access_key_id: Some(key.access_key_id),
        },
        key.secret_access_key,
    ))
}

/// Runs the full SigV4 verification for one request and resolves the
/// principal. Requests with no signing material at all come back as the
/// `anonymous` principal; the policy engine decides what they may do.
async fn verify_request(db: &Database, parts: &http::request::Parts) -> Result<Verified, S3Error> {
    let resource = parts.uri.path().to_string();
    let raw_query = parts.uri.query().unwrap_or("");
    let now = Utc::now();

    let authorization = parts
        .headers
        .get(http::header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok());

    if let Some(header) = authorization {
        let amz_date = parts
            .headers
            .get("x-amz-date")
            .and_then(|value| value.to_str().ok())
            .ok_or_else(|| {
                S3Error::AuthorizationHeaderMalformed("missing x-amz-date".to_string())
            })?;

        let credential = sigv4::parse_authorization_header(header, amz_date)
            .map_err(|error| auth_error(error, &resource))?;
        sigv4::check_clock_skew(amz_date, now).map_err(|error| auth_error(error, &resource))?;

        let (principal, secret_key) = resolve_principal(db, &credential, &resource).await?;

        let payload_hash = parts
            .headers
            .get("x-amz-content-sha256")
            .and_then(|value| value.to_str().ok())
            .unwrap_or(sigv4::EMPTY_BODY_HASH);

        let canonical = sigv4::build_canonical_request(
            parts.method.as_str(),
            parts.uri.path(),
            raw_query,
            &parts.headers,
            &credential.signed_headers,
            payload_hash,
        );
        let string_to_sign = sigv4::string_to_sign(amz_date, &credential.scope, &canonical);
        let signing_key = sigv4::derive_signing_key(&secret_key, &credential.scope);
        let computed = sigv4::compute_signature(&signing_key, &string_to_sign);

        if !sigv4::signatures_match(&computed, &credential.signature) {
            tracing::debug!(canonical, "Signature mismatch");
            return Err(S3Error::SignatureDoesNotMatch(resource));
        }

        if payload_hash == sigv4::STREAMING_PAYLOAD {
            let verifier = ChunkVerifier::new(
                signing_key,
                amz_date,
                &credential.scope.to_string(),
                &credential.signature,
            );
            return Ok(Verified::Streaming { principal, verifier });
        }
        return Ok(Verified::Plain(principal));
    }

    if let Some(presigned) =
        sigv4::parse_presigned_query(raw_query).map_err(|error| auth_error(error, &resource))?
    {
        sigv4::check_presigned_expiry(&presigned.credential.amz_date, presigned.expires, now)
            .map_err(|error| auth_error(error, &resource))?;

        let (principal, secret_key) =
            resolve_principal(db, &presigned.credential, &resource).await?;

        let canonical = sigv4::build_canonical_request(
            parts.method.as_str(),
            parts.uri.path(),
            raw_query,
            &parts.headers,
            &presigned.credential.signed_headers,
            sigv4::UNSIGNED_PAYLOAD,
        );
        let string_to_sign = sigv4::string_to_sign(
            &presigned.credential.amz_date,
            &presigned.credential.scope,
            &canonical,
        );
        let signing_key = sigv4::derive_signing_key(&secret_key, &presigned.credential.scope);
        let computed = sigv4::compute_signature(&signing_key, &string_to_sign);

        if !sigv4::signatures_match(&computed, &presigned.credential.signature) {
            tracing::debug!(canonical, "Presigned signature mismatch");
            return Err(S3Error::SignatureDoesNotMatch(resource));
        }
        return Ok(Verified::Plain(principal));
    }

    Ok(Verified::Plain(Principal::anonymous()))
}

/// Tower layer running SigV4 verification in front of the S3 routes.
#[derive(Clone)]
pub struct AuthenticationLayer {
    db: Database,
}

impl AuthenticationLayer {
    pub fn new(db: Database) -> Self {
        AuthenticationLayer { db }
    }
}

impl<S> Layer<S> for AuthenticationLayer {
    type Service = AuthenticationService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        AuthenticationService {
            inner,
            db: self.db.clone(),
        }
    }
}

#[derive(Clone)]
pub struct AuthenticationService<S> {
    inner: S,
    db: Database,
}

impl<S> Service<Request> for AuthenticationService<S>
where
    S: Service<Request> + Clone + Send + 'static,
    S::Response: IntoResponse,
    S::Future: Send + 'static,
{
    type Response = axum::response::Response;
    type Error = S::Error;
    type Future =
        Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send + 'static>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, request: Request) -> Self::Future {
        let db = self.db.clone();
        // The inner service checked readiness already; hand the ready clone
        // into the future and keep the fresh one for the next call.
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);

        async move {
            let (mut parts, body) = request.into_parts();
            let verified = match verify_request(&db, &parts).await {
                Ok(verified) => verified,
                Err(error) => {
                    tracing::warn!(error = %error, path = %parts.uri.path(), "Authentication failed");
                    return Ok(error.into_response());
                }
            };

            let (principal, body) = match verified {
                Verified::Plain(principal) => (principal, body),
                Verified::Streaming { principal, verifier } => (
                    principal,
                    Body::from_stream(chunked::verified_chunk_body(body, verifier)),
                ),
            };

            tracing::debug!(user = principal.username, "Authenticated");
            parts.extensions.insert(principal);
            let request = Request::from_parts(parts, body);
            Ok(inner.call(request).await?.into_response())
        }
        .boxed()
    }
}

/// Policy decision for one (principal, action, resource) triple, auditing
/// every denial.
pub async fn authorize(
    db: &Database,
    audit: &AuditSink,
    principal: &Principal,
    action: &str,
    resource: &str,
) -> Result<(), S3Error> {
    let rows = db.policies_for(&principal.username).await?;
    let documents: Vec<policy::PolicyDocument> = rows
        .into_iter()
        .filter_map(|row| {
            match serde_json::from_str::<policy::PolicyDocument>(&row.policy_json) {
                Ok(mut document) => {
                    if document.name.is_empty() {
                        document.name = row.name;
                    }
                    Some(document)
                }
                Err(error) => {
                    tracing::error!(policy = row.name, %error, "Skipping unparseable policy");
                    None
                }
            }
        })
        .collect();

    let decision = policy::evaluate(&principal.username, &documents, action, resource);
    if !decision.is_allowed() {
        audit.record(&AuditEvent::denied(
            &principal.username,
            action,
            resource,
            decision.reason(),
        ));
        return Err(S3Error::AccessDenied(resource.to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::tests::test_db;

    const SECRET: &str = "wJalrXUtnFEMI/K7MDENG/bPxRfiCYEXAMPLEKEY";

    fn amz_now() -> String {
        Utc::now().format("%Y%m%dT%H%M%SZ").to_string()
    }

    fn sign_get(path: &str, host: &str, amz_date: &str) -> (String, String) {
        let scope = sigv4::Scope {
            date: amz_date[..8].to_string(),
            region: "us-east-1".to_string(),
            service: "s3".to_string(),
        };
        let mut headers = http::HeaderMap::new();
        headers.insert("host", host.parse().unwrap());
        headers.insert("x-amz-content-sha256", sigv4::EMPTY_BODY_HASH.parse().unwrap());
        headers.insert("x-amz-date", amz_date.parse().unwrap());
        let canonical = sigv4::build_canonical_request(
            "GET",
            path,
            "",
            &headers,
            "host;x-amz-content-sha256;x-amz-date",
            sigv4::EMPTY_BODY_HASH,
        );
        let sts = sigv4::string_to_sign(amz_date, &scope, &canonical);
        let key = sigv4::derive_signing_key(SECRET, &scope);
        let signature = sigv4::compute_signature(&key, &sts);
        let authorization = format!(
            "AWS4-HMAC-SHA256 Credential=AKIDEXAMPLE/{}/us-east-1/s3/aws4_request, \
             SignedHeaders=host;x-amz-content-sha256;x-amz-date, Signature={signature}",
            &amz_date[..8]
        );
        (authorization, signature)
    }

    fn request(path: &str, authorization: Option<&str>, amz_date: &str) -> http::request::Parts {
        let mut builder = http::Request::builder()
            .method("GET")
            .uri(format!("http://localhost:9000{path}"))
            .header("host", "localhost:9000")
            .header("x-amz-content-sha256", sigv4::EMPTY_BODY_HASH)
            .header("x-amz-date", amz_date);
        if let Some(auth) = authorization {
            builder = builder.header(http::header::AUTHORIZATION, auth);
        }
        builder.body(()).unwrap().into_parts().0
    }

    #[tokio::test]
    async fn header_auth_resolves_the_principal() {
        let db = test_db().await;
        db.upsert_access_key("AKIDEXAMPLE", SECRET, "admin").await.unwrap();

        let amz_date = amz_now();
        let (authorization, _) = sign_get("/b/k", "localhost:9000", &amz_date);
        let parts = request("/b/k", Some(&authorization), &amz_date);

        match verify_request(&db, &parts).await.unwrap() {
            Verified::Plain(principal) => assert_eq!(principal.username, "admin"),
            Verified::Streaming { .. } => panic!("not a streaming request"),
        }
    }

    #[tokio::test]
    async fn unknown_access_keys_are_rejected() {
        let db = test_db().await;
        let amz_date = amz_now();
        let (authorization, _) = sign_get("/b/k", "localhost:9000", &amz_date);
        let parts = request("/b/k", Some(&authorization), &amz_date);
        assert!(matches!(
            verify_request(&db, &parts).await,
            Err(S3Error::InvalidAccessKeyId(_))
        ));
    }

    #[tokio::test]
    async fn tampered_signatures_are_rejected() {
        let db = test_db().await;
        db.upsert_access_key("AKIDEXAMPLE", SECRET, "admin").await.unwrap();

        let amz_date = amz_now();
        let (authorization, signature) = sign_get("/b/k", "localhost:9000", &amz_date);
        let tampered = authorization.replace(&signature, &"0".repeat(64));
        let parts = request("/b/k", Some(&tampered), &amz_date);
        assert!(matches!(
            verify_request(&db, &parts).await,
            Err(S3Error::SignatureDoesNotMatch(_))
        ));
    }

    #[tokio::test]
    async fn stale_dates_are_rejected() {
        let db = test_db().await;
        db.upsert_access_key("AKIDEXAMPLE", SECRET, "admin").await.unwrap();

        let stale = "20130524T000000Z";
        let (authorization, _) = sign_get("/b/k", "localhost:9000", stale);
        let parts = request("/b/k", Some(&authorization), stale);
        assert!(matches!(
            verify_request(&db, &parts).await,
            Err(S3Error::RequestTimeTooSkewed(_))
        ));
    }

    #[tokio::test]
    async fn unsigned_requests_fall_back_to_anonymous() {
        let db = test_db().await;
        let parts = request("/public/hello", None, &amz_now());
        match verify_request(&db, &parts).await.unwrap() {
            Verified::Plain(principal) => {
                assert_eq!(principal.username, policy::ANONYMOUS_USER);
                assert!(principal.access_key_id.is_none());
            }
            Verified::Streaming { .. } => panic!("not a streaming request"),
        }
    }

    #[tokio::test]
    async fn authorize_denies_and_allows_by_policy() {
        let db = test_db().await;
        let audit = AuditSink;
        db.attach_user_policy(
            "anonymous",
            "public-read",
            r#"{"statement":[{"effect":"Allow","action":["s3:GetObject"],"resource":["arn:aws:s3:::public/*"]}]}"#,
        )
        .await
        .unwrap();

        let principal = Principal::anonymous();
        assert!(
            authorize(&db, &audit, &principal, "s3:GetObject", "arn:aws:s3:::public/hello")
                .await
                .is_ok()
        );
        assert!(matches!(
            authorize(&db, &audit, &principal, "s3:GetObject", "arn:aws:s3:::private/hello").await,
            Err(S3Error::AccessDenied(_))
        ));
    }
}
