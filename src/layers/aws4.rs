//! AWS Signature Version 4.
//!
//! Runs after the message layer (headers final, `Host` present) and
//! needs no transport state. Buffered bodies are hashed; streaming
//! bodies are signed as `UNSIGNED-PAYLOAD`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use url::Url;

use crate::error::Result;
use crate::message::{Body, Request, Response};

use super::{Exchange, Layer, Next};

type HmacSha256 = Hmac<Sha256>;

const UNSIGNED_PAYLOAD: &str = "UNSIGNED-PAYLOAD";

#[derive(Debug, Clone)]
pub struct Aws4Credentials {
    pub access_key_id: String,
    pub secret_access_key: String,
    pub session_token: Option<String>,
    pub region: String,
    pub service: String,
}

impl Aws4Credentials {
    /// Credentials from the conventional environment variables, when the
    /// caller enabled signing without providing any.
    pub fn from_env() -> Option<Self> {
        let access_key_id = std::env::var("AWS_ACCESS_KEY_ID").ok()?;
        let secret_access_key = std::env::var("AWS_SECRET_ACCESS_KEY").ok()?;
        Some(Aws4Credentials {
            access_key_id,
            secret_access_key,
            session_token: std::env::var("AWS_SESSION_TOKEN").ok(),
            region: std::env::var("AWS_DEFAULT_REGION").unwrap_or_else(|_| "us-east-1".into()),
            service: "s3".into(),
        })
    }
}

pub struct Aws4AuthLayer {
    creds: Aws4Credentials,
    /// Fixed signing time for deterministic tests; wall clock otherwise.
    signing_time: Option<DateTime<Utc>>,
}

impl Aws4AuthLayer {
    pub fn new(creds: Aws4Credentials) -> Self {
        Aws4AuthLayer { creds, signing_time: None }
    }

    #[cfg(test)]
    fn with_signing_time(creds: Aws4Credentials, at: DateTime<Utc>) -> Self {
        Aws4AuthLayer { creds, signing_time: Some(at) }
    }
}

#[async_trait]
impl Layer for Aws4AuthLayer {
    async fn handle(&self, mut ex: Exchange, next: Next<'_>) -> Result<Response> {
        let now = self.signing_time.unwrap_or_else(Utc::now);
        sign_request(&mut ex.request, &ex.body, &self.creds, now);
        next.run(ex).await
    }
}

/// Add `X-Amz-Date`, `X-Amz-Content-Sha256` and `Authorization` per the
/// SigV4 canonical request procedure.
pub(crate) fn sign_request(
    request: &mut Request,
    body: &Body,
    creds: &Aws4Credentials,
    now: DateTime<Utc>,
) {
    let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();
    let date = now.format("%Y%m%d").to_string();

    let payload_hash = match body {
        Body::Bytes(bytes) => sha256_hex(bytes),
        Body::Empty => sha256_hex(b""),
        Body::Stream { .. } | Body::Streamed => UNSIGNED_PAYLOAD.to_string(),
    };

    request.headers.set("X-Amz-Date", amz_date.clone());
    request.headers.set("X-Amz-Content-Sha256", payload_hash.clone());
    if let Some(token) = &creds.session_token {
        request.headers.set("X-Amz-Security-Token", token.clone());
    }

    let (signed_names, canonical_headers) = canonical_headers(request);
    let canonical_request = format!(
        "{method}\n{uri}\n{query}\n{headers}\n{signed}\n{payload}",
        method = request.method.as_str(),
        uri = canonical_uri(&request.url),
        query = canonical_query(&request.url),
        headers = canonical_headers,
        signed = signed_names,
        payload = payload_hash,
    );

    let scope = format!("{date}/{}/{}/aws4_request", creds.region, creds.service);
    let string_to_sign = format!(
        "AWS4-HMAC-SHA256\n{amz_date}\n{scope}\n{}",
        sha256_hex(canonical_request.as_bytes())
    );

    let mut key = hmac_sha256(format!("AWS4{}", creds.secret_access_key).as_bytes(), date.as_bytes());
    for part in [creds.region.as_str(), creds.service.as_str(), "aws4_request"] {
        key = hmac_sha256(&key, part.as_bytes());
    }
    let signature = hex::encode(hmac_sha256(&key, string_to_sign.as_bytes()));

    request.headers.set(
        "Authorization",
        format!(
            "AWS4-HMAC-SHA256 Credential={}/{scope}, SignedHeaders={signed_names}, Signature={signature}",
            creds.access_key_id
        ),
    );
    tracing::debug!(signed_headers = signed_names, "aws4: signed request");
}

/// Headers included in the signature: `host`, `content-type` and every
/// `x-amz-*`, lowercased and sorted.
fn canonical_headers(request: &Request) -> (String, String) {
    let mut entries: Vec<(String, String)> = request
        .headers
        .iter()
        .filter_map(|(name, value)| {
            let lower = name.to_ascii_lowercase();
            let relevant =
                lower == "host" || lower == "content-type" || lower.starts_with("x-amz-");
            relevant.then(|| (lower, value.trim().to_string()))
        })
        .collect();
    entries.sort();

    let signed_names = entries
        .iter()
        .map(|(name, _)| name.as_str())
        .collect::<Vec<_>>()
        .join(";");
    let block = entries
        .iter()
        .map(|(name, value)| format!("{name}:{value}\n"))
        .collect::<String>();
    (signed_names, block)
}

fn canonical_uri(url: &Url) -> String {
    let path = url.path();
    if path.is_empty() {
        "/".to_string()
    } else {
        path.to_string()
    }
}

fn canonical_query(url: &Url) -> String {
    let mut pairs: Vec<(String, String)> = url
        .query_pairs()
        .map(|(k, v)| (uri_encode(&k, true), uri_encode(&v, true)))
        .collect();
    pairs.sort();
    pairs
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join("&")
}

/// Strict AWS URI encoding: unreserved characters pass, everything else
/// becomes `%XX`.
fn uri_encode(input: &str, encode_slash: bool) -> String {
    let mut out = String::with_capacity(input.len());
    for byte in input.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~' => {
                out.push(byte as char);
            }
            b'/' if !encode_slash => out.push('/'),
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}

fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(key).expect("HMAC-SHA256 takes any key length");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}
