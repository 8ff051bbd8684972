//! Content-type detection: sniff a type from the body bytes when the
//! caller set none.

use async_trait::async_trait;

use crate::error::Result;
use crate::message::{Body, Response};

use super::{Exchange, Layer, Next};

pub struct ContentTypeLayer;

#[async_trait]
impl Layer for ContentTypeLayer {
    async fn handle(&self, mut ex: Exchange, next: Next<'_>) -> Result<Response> {
        if !ex.request.headers.contains("Content-Type") {
            if let Body::Bytes(bytes) = &ex.body {
                if !bytes.is_empty() {
                    let detected = sniff(bytes);
                    tracing::debug!(content_type = detected, "content-type: sniffed from body");
                    ex.request.headers.set("Content-Type", detected);
                }
            }
        }
        next.run(ex).await
    }
}

const MAGIC: &[(&[u8], &str)] = &[
    (b"%PDF-", "application/pdf"),
    (b"\x89PNG\r\n\x1a\n", "image/png"),
    (b"\xff\xd8\xff", "image/jpeg"),
    (b"GIF87a", "image/gif"),
    (b"GIF89a", "image/gif"),
    (b"PK\x03\x04", "application/zip"),
    (b"\x1f\x8b", "application/gzip"),
];

/// Guess a media type from leading bytes. Falls back to `text/plain` for
/// UTF-8 and `application/octet-stream` otherwise.
pub(crate) fn sniff(data: &[u8]) -> &'static str {
    for (prefix, media_type) in MAGIC {
        if data.starts_with(prefix) {
            return media_type;
        }
    }

    let trimmed = trim_ascii_start(data);
    if starts_with_ignore_case(trimmed, b"<!doctype html") || starts_with_ignore_case(trimmed, b"<html") {
        return "text/html";
    }
    if trimmed.starts_with(b"<?xml") {
        return "application/xml";
    }
    if trimmed.first() == Some(&b'{') || trimmed.first() == Some(&b'[') {
        return "application/json";
    }
    if std::str::from_utf8(data).is_ok() {
        return "text/plain";
    }
    "application/octet-stream"
}

fn trim_ascii_start(data: &[u8]) -> &[u8] {
    let mut rest = data;
    while let Some((first, tail)) = rest.split_first() {
        if first.is_ascii_whitespace() {
            rest = tail;
        } else {
            break;
        }
    }
    rest
}

fn starts_with_ignore_case(data: &[u8], prefix: &[u8]) -> bool {
    data.len() >= prefix.len() && data[..prefix.len()].eq_ignore_ascii_case(prefix)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sniffs_binary_signatures() {
        assert_eq!(sniff(b"%PDF-1.7 ..."), "application/pdf");
        assert_eq!(sniff(b"\x89PNG\r\n\x1a\nrest"), "image/png");
        assert_eq!(sniff(b"\xff\xd8\xff\xe0JFIF"), "image/jpeg");
        assert_eq!(sniff(b"GIF89a..."), "image/gif");
        assert_eq!(sniff(b"PK\x03\x04zip"), "application/zip");
        assert_eq!(sniff(b"\x1f\x8b\x08gz"), "application/gzip");
    }

    #[test]
    fn sniffs_text_formats() {
        assert_eq!(sniff(b"  <!DOCTYPE html><html>"), "text/html");
        assert_eq!(sniff(b"<HTML><body>"), "text/html");
        assert_eq!(sniff(b"<?xml version=\"1.0\"?><a/>"), "application/xml");
        assert_eq!(sniff(b"{\"k\": 1}"), "application/json");
        assert_eq!(sniff(b"[1, 2, 3]"), "application/json");
        assert_eq!(sniff("just text".as_bytes()), "text/plain");
    }

    #[test]
    fn binary_falls_back_to_octet_stream() {
        assert_eq!(sniff(&[0x00, 0xff, 0xfe, 0x01]), "application/octet-stream");
    }
}
