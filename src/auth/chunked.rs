use axum::body::Body;
use bytes::Bytes;
use futures::{AsyncBufReadExt, AsyncReadExt, Stream, TryStreamExt};
use sha2::{Digest, Sha256};

use super::sigv4;

/// Per-chunk algorithm label from the streaming signing spec.
const CHUNK_ALGORITHM: &str = "AWS4-HMAC-SHA256-PAYLOAD";

#[derive(Debug, thiserror::Error)]
pub enum ChunkError {
    #[error("Could not parse chunk frame: {0}")]
    Frame(String),
    #[error("Chunk signature does not match")]
    SignatureMismatch,
    #[error("Could not read body")]
    IoRead(#[from] std::io::Error),
}

/// Rolling verifier for `STREAMING-AWS4-HMAC-SHA256-PAYLOAD` bodies.
///
/// Each chunk signature chains from the previous one, seeded by the
/// signature of the request headers:
///
/// ```text
/// sig_n = HMAC(kSigning, "AWS4-HMAC-SHA256-PAYLOAD" \n amzDate \n scope \n
///                         sig_{n-1} \n sha256("") \n sha256(chunk_n))
/// ```
pub struct ChunkVerifier {
    signing_key: Vec<u8>,
    amz_date: String,
    scope: String,
    previous_signature: String,
}

impl ChunkVerifier {
    pub fn new(signing_key: Vec<u8>, amz_date: &str, scope: &str, seed_signature: &str) -> Self {
        ChunkVerifier {
            signing_key,
            amz_date: amz_date.to_string(),
            scope: scope.to_string(),
            previous_signature: seed_signature.to_string(),
        }
    }

    fn verify(&mut self, chunk: &[u8], provided: &str) -> Result<(), ChunkError> {
        let string_to_sign = format!(
            "{CHUNK_ALGORITHM}\n{}\n{}\n{}\n{}\n{}",
            self.amz_date,
            self.scope,
            self.previous_signature,
            sigv4::EMPTY_BODY_HASH,
            hex::encode(Sha256::digest(chunk)),
        );
        let computed = sigv4::compute_signature(&self.signing_key, &string_to_sign);
        if !sigv4::signatures_match(&computed, provided) {
            return Err(ChunkError::SignatureMismatch);
        }
        self.previous_signature = computed;
        Ok(())
    }
}

/// Provides a body following the chunk signature specs, yielding only
/// plaintext whose chunk signature verified. A mismatch aborts the stream.
///
/// <https://docs.aws.amazon.com/AmazonS3/latest/API/sigv4-streaming.html>
pub fn verified_chunk_body(
    body: Body,
    verifier: ChunkVerifier,
) -> impl Stream<Item = Result<Bytes, ChunkError>> {
    let buffer = body
        .into_data_stream()
        .map_err(std::io::Error::other)
        .inspect_err(|error| tracing::error!(%error, "Failed to read body"))
        .into_async_read();

    futures::stream::try_unfold(
        (buffer, verifier),
        |(mut buffer, mut verifier)| async move {
            let mut frame_header = Vec::new();
            buffer.read_until(b'\n', &mut frame_header).await?;
            let (chunk_size, signature) = parse_frame_header(&frame_header)?;

            let mut chunk = vec![0; chunk_size];
            buffer.read_exact(&mut chunk).await?;
            verifier.verify(&chunk, &signature)?;

            if chunk_size == 0 {
                // Final frame; anything after it (trailers) is unsigned noise.
                return Ok(None);
            }

            // Drop the \r\n that closes the chunk.
            let mut crlf = [0; 2];
            buffer.read_exact(&mut crlf).await?;

            Ok(Some((Bytes::from(chunk), (buffer, verifier))))
        },
    )
}

/// Parses `<hex-size>;chunk-signature=<64 hex>\r\n`.
fn parse_frame_header(line: &[u8]) -> Result<(usize, String), ChunkError> {
    let line = str::from_utf8(line)
        .map_err(|_| ChunkError::Frame("frame header is not UTF-8".into()))?
        .trim_end_matches(['\r', '\n']);
    let (size, rest) = line
        .split_once(';')
        .ok_or_else(|| ChunkError::Frame(format!("missing ';' in {line:?}")))?;
    let chunk_size = usize::from_str_radix(size, 16)
        .map_err(|_| ChunkError::Frame(format!("bad chunk size {size:?}")))?;
    let signature = rest
        .strip_prefix("chunk-signature=")
        .ok_or_else(|| ChunkError::Frame(format!("missing chunk-signature in {line:?}")))?;
    if signature.len() != 64 || !signature.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(ChunkError::Frame("chunk signature is not 64 hex chars".into()));
    }
    Ok((chunk_size, signature.to_string()))
}
