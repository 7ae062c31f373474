use axum::body::Body;
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use rand::distr::SampleString;

/// Request failures surfaced as AWS-compatible `<Error>` XML bodies.
#[derive(Debug, thiserror::Error)]
pub enum S3Error {
    #[error("The specified bucket does not exist")]
    NoSuchBucket(String),
    #[error("The specified key does not exist")]
    NoSuchKey(String),
    #[error("The specified version does not exist")]
    NoSuchVersion(String),
    #[error("The specified multipart upload does not exist")]
    NoSuchUpload(String),
    #[error("The requested bucket name is not available")]
    BucketAlreadyExists(String),
    #[error("The bucket you tried to delete is not empty")]
    BucketNotEmpty(String),
    #[error("{0}")]
    InvalidArgument(String),
    #[error("One or more of the specified parts could not be found")]
    InvalidPart(String),
    #[error("The list of parts was not in ascending order")]
    InvalidPartOrder(String),
    #[error("Your proposed upload is smaller than the minimum allowed size")]
    EntityTooSmall(String),
    #[error("Access Denied")]
    AccessDenied(String),
    #[error("The request signature we calculated does not match the signature you provided")]
    SignatureDoesNotMatch(String),
    #[error("The difference between the request time and the server's time is too large")]
    RequestTimeTooSkewed(String),
    #[error("The AWS access key ID you provided does not exist in our records")]
    InvalidAccessKeyId(String),
    #[error("The authorization header is malformed: {0}")]
    AuthorizationHeaderMalformed(String),
    #[error("The requested range is not satisfiable")]
    InvalidRange(String),
    #[error("The XML you provided was not well-formed")]
    MalformedXml(String),
    #[error("We encountered an internal error. Please try again.")]
    Internal(String),
}

impl S3Error {
    pub fn code(&self) -> &'static str {
        match self {
            S3Error::NoSuchBucket(_) => "NoSuchBucket",
            S3Error::NoSuchKey(_) => "NoSuchKey",
            S3Error::NoSuchVersion(_) => "NoSuchVersion",
            S3Error::NoSuchUpload(_) => "NoSuchUpload",
            S3Error::BucketAlreadyExists(_) => "BucketAlreadyExists",
            S3Error::BucketNotEmpty(_) => "BucketNotEmpty",
            S3Error::InvalidArgument(_) => "InvalidArgument",
            S3Error::InvalidPart(_) => "InvalidPart",
            S3Error::InvalidPartOrder(_) => "InvalidPartOrder",
            S3Error::EntityTooSmall(_) => "EntityTooSmall",
            S3Error::AccessDenied(_) => "AccessDenied",
            S3Error::SignatureDoesNotMatch(_) => "SignatureDoesNotMatch",
            S3Error::RequestTimeTooSkewed(_) => "RequestTimeTooSkewed",
            S3Error::InvalidAccessKeyId(_) => "InvalidAccessKeyId",
            S3Error::AuthorizationHeaderMalformed(_) => "AuthorizationHeaderMalformed",
            S3Error::InvalidRange(_) => "InvalidRange",
            S3Error::MalformedXml(_) => "MalformedXML",
            S3Error::Internal(_) => "InternalError",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            S3Error::NoSuchBucket(_)
            | S3Error::NoSuchKey(_)
            | S3Error::NoSuchVersion(_)
            | S3Error::NoSuchUpload(_) => StatusCode::NOT_FOUND,
            S3Error::BucketAlreadyExists(_) | S3Error::BucketNotEmpty(_) => StatusCode::CONFLICT,
            S3Error::InvalidArgument(_)
            | S3Error::InvalidPart(_)
            | S3Error::InvalidPartOrder(_)
            | S3Error::EntityTooSmall(_)
            | S3Error::AuthorizationHeaderMalformed(_)
            | S3Error::MalformedXml(_) => StatusCode::BAD_REQUEST,
            S3Error::AccessDenied(_)
            | S3Error::SignatureDoesNotMatch(_)
            | S3Error::RequestTimeTooSkewed(_)
            | S3Error::InvalidAccessKeyId(_) => StatusCode::FORBIDDEN,
            S3Error::InvalidRange(_) => StatusCode::RANGE_NOT_SATISFIABLE,
            S3Error::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn resource(&self) -> &str {
        match self {
            S3Error::NoSuchBucket(r)
            | S3Error::NoSuchKey(r)
            | S3Error::NoSuchVersion(r)
            | S3Error::NoSuchUpload(r)
            | S3Error::BucketAlreadyExists(r)
            | S3Error::BucketNotEmpty(r)
            | S3Error::InvalidPart(r)
            | S3Error::InvalidPartOrder(r)
            | S3Error::EntityTooSmall(r)
            | S3Error::AccessDenied(r)
            | S3Error::SignatureDoesNotMatch(r)
            | S3Error::RequestTimeTooSkewed(r)
            | S3Error::InvalidAccessKeyId(r)
            | S3Error::InvalidRange(r) => r,
            S3Error::InvalidArgument(_)
            | S3Error::AuthorizationHeaderMalformed(_)
            | S3Error::MalformedXml(_)
            | S3Error::Internal(_) => "",
        }
    }

    pub fn into_xml(&self) -> String {
        let request_id = rand::distr::Alphanumeric.sample_string(&mut rand::rng(), 16);
        let message = self.to_string();
        format!(
            "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n\
             <Error><Code>{}</Code><Message>{}</Message><Resource>{}</Resource><RequestId>{}</RequestId></Error>",
            self.code(),
            quick_xml::escape::escape(message.as_str()),
            quick_xml::escape::escape(self.resource()),
            request_id,
        )
    }
}

impl IntoResponse for S3Error {
    fn into_response(self) -> Response {
        if let S3Error::Internal(detail) = &self {
            tracing::error!(detail, "Internal error");
        }
        Response::builder()
            .status(self.status())
            .header(header::CONTENT_TYPE, "application/xml")
            .body(Body::from(self.into_xml()))
            .unwrap_or_default()
    }
}

impl From<crate::database::DatabaseError> for S3Error {
    fn from(error: crate::database::DatabaseError) -> Self {
        S3Error::Internal(error.to_string())
    }
}

impl From<crate::blobs::BlobError> for S3Error {
    fn from(error: crate::blobs::BlobError) -> Self {
        S3Error::Internal(error.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_aws_shaped_xml() {
        let xml = S3Error::NoSuchBucket("/missing".to_string()).into_xml();
        assert!(xml.contains("<Code>NoSuchBucket</Code>"));
        assert!(xml.contains("<Resource>/missing</Resource>"));
        assert!(xml.contains("<RequestId>"));
    }

    #[test]
    fn escapes_interpolated_content() {
        let xml = S3Error::InvalidArgument("bad <tag> & more".to_string()).into_xml();
        assert!(xml.contains("bad &lt;tag&gt; &amp; more"));
    }

    #[test]
    fn auth_failures_are_forbidden() {
        assert_eq!(
            S3Error::SignatureDoesNotMatch(String::new()).status(),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            S3Error::RequestTimeTooSkewed(String::new()).status(),
            StatusCode::FORBIDDEN
        );
    }
}
