//! Purpose: S3-compatible object storage backend over blocking HTTP with SigV4 signing.
//! Exports: `S3Config`, `S3Storage`.
//! Role: Remote object-store target for exports; works with AWS and S3-compatible servers.
//! Invariants: Uploads stream through part-sized buffers; memory stays bounded per job.
//! Invariants: Pre-encoded bodies carry `Content-Encoding` metadata instead of re-compression.
//! Invariants: A 404 on GET is "absent" (probing continues); every other failure is an error.
use super::Storage;
use crate::core::codec::BoxRead;
use crate::core::error::{Error, ErrorKind, Result};
use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::fmt::Write as _;
use std::io::Read;
use time::OffsetDateTime;
use tracing::{debug, warn};
use url::Url;

const DEFAULT_PART_SIZE: usize = 16 * 1024 * 1024;
const MIN_PART_SIZE: usize = 5 * 1024 * 1024;
const EMPTY_SHA256: &str = "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

type HmacSha256 = Hmac<Sha256>;

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct S3Config {
    pub bucket: String,
    pub region: String,
    /// Custom endpoint for S3-compatible servers; AWS regional endpoint when unset.
    pub endpoint: Option<String>,
    /// Key prefix every object name is placed under.
    pub prefix: String,
    pub access_key: String,
    pub secret_key: String,
    pub path_style: bool,
    pub part_size: Option<usize>,
}

pub struct S3Storage {
    agent: ureq::Agent,
    base_url: Url,
    /// Path every object key is appended to (`/` or `/<bucket>/`).
    base_path: String,
    region: String,
    prefix: String,
    access_key: String,
    secret_key: String,
    part_size: usize,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ListBucketResult {
    #[serde(default)]
    contents: Vec<ListedObject>,
    #[serde(default)]
    common_prefixes: Vec<CommonPrefix>,
    #[serde(default)]
    is_truncated: bool,
    next_continuation_token: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ListedObject {
    key: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct CommonPrefix {
    prefix: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InitiateMultipartUploadResult {
    upload_id: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct S3ErrorBody {
    code: Option<String>,
    message: Option<String>,
}

struct Request<'a> {
    method: &'a str,
    key: &'a str,
    query: Vec<(&'a str, String)>,
    headers: Vec<(&'a str, String)>,
    body: Option<&'a [u8]>,
}

impl<'a> Request<'a> {
    fn new(method: &'a str, key: &'a str) -> Self {
        Self {
            method,
            key,
            query: Vec::new(),
            headers: Vec::new(),
            body: None,
        }
    }

    fn query(mut self, name: &'a str, value: impl Into<String>) -> Self {
        self.query.push((name, value.into()));
        self
    }

    fn header(mut self, name: &'a str, value: impl Into<String>) -> Self {
        self.headers.push((name, value.into()));
        self
    }

    fn body(mut self, body: &'a [u8]) -> Self {
        self.body = Some(body);
        self
    }
}

impl S3Storage {
    pub fn new(config: S3Config) -> Result<Self> {
        if config.bucket.trim().is_empty() {
            return Err(config_error("s3 storage requires a bucket", "Pass --s3-bucket <name>."));
        }
        if config.access_key.is_empty() || config.secret_key.is_empty() {
            return Err(config_error(
                "s3 storage requires an access key and a secret key",
                "Pass --s3-access-key and --s3-secret-key-file.",
            ));
        }
        let region = if config.region.trim().is_empty() {
            "us-east-1".to_string()
        } else {
            config.region.trim().to_string()
        };
        let raw_endpoint = config
            .endpoint
            .clone()
            .filter(|endpoint| !endpoint.trim().is_empty())
            .unwrap_or_else(|| format!("https://s3.{region}.amazonaws.com"));
        let endpoint = Url::parse(raw_endpoint.trim_end_matches('/')).map_err(|err| {
            config_error("invalid s3 endpoint URL", "Use http(s)://host[:port].").with_source(err)
        })?;
        if endpoint.host_str().is_none() || !matches!(endpoint.scheme(), "http" | "https") {
            return Err(config_error(
                "s3 endpoint must be an http(s) URL with a host",
                "Use http(s)://host[:port].",
            ));
        }
        let part_size = config
            .part_size
            .unwrap_or(DEFAULT_PART_SIZE)
            .max(MIN_PART_SIZE);
        let prefix = config.prefix.trim_matches('/');
        let prefix = if prefix.is_empty() {
            String::new()
        } else {
            format!("{prefix}/")
        };

        let bucket = config.bucket.trim();
        let mut base_url = endpoint;
        let base_path = if config.path_style {
            format!("/{bucket}/")
        } else {
            let host = base_url.host_str().unwrap_or_default().to_string();
            base_url
                .set_host(Some(&format!("{bucket}.{host}")))
                .map_err(|err| {
                    config_error(
                        "bucket name is not a valid host label",
                        "Use --s3-path-style for buckets with dots or uppercase.",
                    )
                    .with_source(err)
                })?;
            "/".to_string()
        };

        Ok(Self {
            agent: ureq::AgentBuilder::new().build(),
            base_url,
            base_path,
            region,
            prefix,
            access_key: config.access_key,
            secret_key: config.secret_key,
            part_size,
        })
    }

    fn key(&self, name: &str) -> String {
        format!("{}{name}", self.prefix)
    }

    fn object_url(&self, key: &str) -> Url {
        let mut url = self.base_url.clone();
        if key.is_empty() {
            // Bucket-level requests (listing) address the bucket itself.
            let path = self.base_path.trim_end_matches('/');
            url.set_path(if path.is_empty() { "/" } else { path });
        } else {
            url.set_path(&format!("{}{}", self.base_path, uri_encode(key, false)));
        }
        url
    }

    fn send(&self, request: Request<'_>) -> std::result::Result<ureq::Response, ureq::Error> {
        let mut url = self.object_url(request.key);
        let mut query = request
            .query
            .iter()
            .map(|(name, value)| (uri_encode(name, true), uri_encode(value, true)))
            .collect::<Vec<_>>();
        query.sort();
        let canonical_query = query
            .iter()
            .map(|(name, value)| format!("{name}={value}"))
            .collect::<Vec<_>>()
            .join("&");
        url.set_query(if canonical_query.is_empty() {
            None
        } else {
            Some(&canonical_query)
        });

        let payload_hash = match request.body {
            Some(body) => hex(&Sha256::digest(body)),
            None => EMPTY_SHA256.to_string(),
        };
        let now = OffsetDateTime::now_utc();
        let amz_date = amz_timestamp(now);
        let host = match url.port() {
            Some(port) => format!("{}:{port}", url.host_str().unwrap_or_default()),
            None => url.host_str().unwrap_or_default().to_string(),
        };
        let authorization = self.authorization(
            request.method,
            url.path(),
            &canonical_query,
            &host,
            &amz_date,
            &payload_hash,
        );

        let mut http = self
            .agent
            .request_url(request.method, &url)
            .set("x-amz-date", &amz_date)
            .set("x-amz-content-sha256", &payload_hash)
            .set("Authorization", &authorization);
        for (name, value) in &request.headers {
            http = http.set(name, value);
        }
        match request.body {
            Some(body) => http.send_bytes(body),
            None => http.call(),
        }
    }

    fn authorization(
        &self,
        method: &str,
        canonical_uri: &str,
        canonical_query: &str,
        host: &str,
        amz_date: &str,
        payload_hash: &str,
    ) -> String {
        let date = &amz_date[..8];
        let scope = format!("{date}/{}/s3/aws4_request", self.region);
        let signed_headers = "host;x-amz-content-sha256;x-amz-date";
        let canonical_request = format!(
            "{method}\n{canonical_uri}\n{canonical_query}\nhost:{host}\nx-amz-content-sha256:{payload_hash}\nx-amz-date:{amz_date}\n\n{signed_headers}\n{payload_hash}"
        );
        let string_to_sign = format!(
            "AWS4-HMAC-SHA256\n{amz_date}\n{scope}\n{}",
            hex(&Sha256::digest(canonical_request.as_bytes()))
        );
        let key = hmac(format!("AWS4{}", self.secret_key).as_bytes(), date.as_bytes());
        let key = hmac(&key, self.region.as_bytes());
        let key = hmac(&key, b"s3");
        let key = hmac(&key, b"aws4_request");
        let signature = hex(&hmac(&key, string_to_sign.as_bytes()));
        format!(
            "AWS4-HMAC-SHA256 Credential={}/{scope}, SignedHeaders={signed_headers}, Signature={signature}",
            self.access_key
        )
    }

    fn expect_ok(&self, request: Request<'_>, what: &str) -> Result<ureq::Response> {
        let key = request.key.to_string();
        self.send(request)
            .map_err(|err| request_error(err, what).with_object(key))
    }

    fn put_single(&self, key: &str, body: &[u8], content_encoding: Option<&str>) -> Result<()> {
        let mut request = Request::new("PUT", key).body(body);
        if let Some(encoding) = content_encoding {
            request = request.header("Content-Encoding", encoding);
        }
        self.expect_ok(request, "put object")?;
        Ok(())
    }

    fn put_multipart(
        &self,
        key: &str,
        first_part: Vec<u8>,
        body: &mut dyn Read,
        content_encoding: Option<&str>,
    ) -> Result<()> {
        let mut request = Request::new("POST", key).query("uploads", "");
        if let Some(encoding) = content_encoding {
            request = request.header("Content-Encoding", encoding);
        }
        let response = self.expect_ok(request, "create multipart upload")?;
        let initiated: InitiateMultipartUploadResult = read_xml(response, "create multipart upload")?;
        let upload_id = initiated.upload_id;
        debug!(object = key, upload_id = %upload_id, "started multipart upload");

        match self.upload_parts(key, &upload_id, first_part, body) {
            Ok(parts) => self.complete_multipart(key, &upload_id, &parts),
            Err(err) => {
                let abort = Request::new("DELETE", key).query("uploadId", upload_id.clone());
                if let Err(abort_err) = self.expect_ok(abort, "abort multipart upload") {
                    warn!(object = key, error = %abort_err, "failed to abort multipart upload");
                }
                Err(err)
            }
        }
    }

    fn upload_parts(
        &self,
        key: &str,
        upload_id: &str,
        first_part: Vec<u8>,
        body: &mut dyn Read,
    ) -> Result<Vec<(u32, String)>> {
        let mut parts = Vec::new();
        let mut part = first_part;
        let mut number = 1u32;
        while !part.is_empty() {
            let request = Request::new("PUT", key)
                .query("partNumber", number.to_string())
                .query("uploadId", upload_id)
                .body(&part);
            let response = self.expect_ok(request, "upload part")?;
            let etag = response.header("ETag").unwrap_or_default().to_string();
            parts.push((number, etag));
            number += 1;
            part = read_part(body, self.part_size)?;
        }
        Ok(parts)
    }

    fn complete_multipart(&self, key: &str, upload_id: &str, parts: &[(u32, String)]) -> Result<()> {
        let mut xml = String::from("<CompleteMultipartUpload>");
        for (number, etag) in parts {
            let _ = write!(
                xml,
                "<Part><PartNumber>{number}</PartNumber><ETag>{}</ETag></Part>",
                xml_escape(etag)
            );
        }
        xml.push_str("</CompleteMultipartUpload>");
        let request = Request::new("POST", key)
            .query("uploadId", upload_id)
            .header("Content-Type", "application/xml")
            .body(xml.as_bytes());
        let response = self.expect_ok(request, "complete multipart upload")?;
        // S3 may report a failed completion with a 200 status and an error body.
        let text = response
            .into_string()
            .map_err(|err| Error::io("failed to read complete multipart response", err))?;
        if text.contains("<Error>") {
            let detail = quick_xml::de::from_str::<S3ErrorBody>(&text).ok();
            return Err(Error::new(ErrorKind::Io)
                .with_message(format!(
                    "complete multipart upload failed: {}",
                    describe_s3_error(detail.as_ref())
                ))
                .with_object(key));
        }
        Ok(())
    }
}

impl Storage for S3Storage {
    fn kind(&self) -> &'static str {
        "s3"
    }

    fn put_object(
        &self,
        name: &str,
        body: &mut dyn Read,
        content_encoding: Option<&str>,
    ) -> Result<()> {
        let key = self.key(name);
        let first = read_part(body, self.part_size)?;
        if first.len() < self.part_size {
            return self.put_single(&key, &first, content_encoding);
        }
        self.put_multipart(&key, first, body, content_encoding)
    }

    fn get_object(&self, name: &str) -> Result<Option<BoxRead>> {
        let key = self.key(name);
        match self.send(Request::new("GET", &key)) {
            Ok(response) => Ok(Some(Box::new(response.into_reader()))),
            Err(ureq::Error::Status(404, _)) => Ok(None),
            Err(err) => Err(request_error(err, "get object").with_object(key)),
        }
    }

    fn list_objects(&self, prefix: &str, recursive: bool) -> Result<Vec<String>> {
        let full_prefix = self.key(prefix);
        let mut names = Vec::new();
        let mut token: Option<String> = None;
        loop {
            let mut request = Request::new("GET", "")
                .query("list-type", "2")
                .query("prefix", full_prefix.clone());
            if !recursive {
                request = request.query("delimiter", "/");
            }
            if let Some(token) = &token {
                request = request.query("continuation-token", token.clone());
            }
            let response = self.expect_ok(request, "list objects")?;
            let page: ListBucketResult = read_xml(response, "list objects")?;
            let keys = page
                .contents
                .into_iter()
                .map(|object| object.key)
                .chain(page.common_prefixes.into_iter().map(|prefix| prefix.prefix));
            for key in keys {
                if let Some(name) = key.strip_prefix(&self.prefix) {
                    names.push(name.to_string());
                }
            }
            match page.next_continuation_token {
                Some(next) if page.is_truncated => token = Some(next),
                _ => break,
            }
        }
        names.sort();
        names.dedup();
        Ok(names)
    }
}

fn config_error(message: &str, hint: &str) -> Error {
    Error::new(ErrorKind::Config)
        .with_message(message)
        .with_hint(hint)
}

fn request_error(err: ureq::Error, what: &str) -> Error {
    match err {
        ureq::Error::Status(code, response) => {
            let text = response.into_string().unwrap_or_default();
            let detail = quick_xml::de::from_str::<S3ErrorBody>(&text).ok();
            let kind = if code == 404 {
                ErrorKind::NotFound
            } else {
                ErrorKind::Io
            };
            Error::new(kind).with_message(format!(
                "{what} failed with status {code}: {}",
                describe_s3_error(detail.as_ref())
            ))
        }
        ureq::Error::Transport(err) => Error::new(ErrorKind::Io)
            .with_message(format!("{what} request failed"))
            .with_source(err),
    }
}

fn describe_s3_error(detail: Option<&S3ErrorBody>) -> String {
    match detail {
        Some(S3ErrorBody {
            code: Some(code),
            message: Some(message),
        }) => format!("{code}: {message}"),
        Some(S3ErrorBody {
            code: Some(code), ..
        }) => code.clone(),
        _ => "no error detail".to_string(),
    }
}

fn read_xml<T: serde::de::DeserializeOwned>(response: ureq::Response, what: &str) -> Result<T> {
    let text = response
        .into_string()
        .map_err(|err| Error::io(format!("failed to read {what} response"), err))?;
    quick_xml::de::from_str(&text).map_err(|err| {
        Error::new(ErrorKind::Io)
            .with_message(format!("malformed {what} response"))
            .with_source(err)
    })
}

/// Reads until `limit` bytes or EOF.
fn read_part(body: &mut dyn Read, limit: usize) -> Result<Vec<u8>> {
    let mut part = Vec::with_capacity(limit.min(1024 * 1024));
    body.take(limit as u64)
        .read_to_end(&mut part)
        .map_err(|err| Error::from_io("failed to read upload body", err))?;
    Ok(part)
}

fn amz_timestamp(now: OffsetDateTime) -> String {
    format!(
        "{:04}{:02}{:02}T{:02}{:02}{:02}Z",
        now.year(),
        u8::from(now.month()),
        now.day(),
        now.hour(),
        now.minute(),
        now.second()
    )
}

fn hmac(key: &[u8], data: &[u8]) -> Vec<u8> {
    // HMAC accepts keys of any length, so construction cannot fail.
    let mut mac = match HmacSha256::new_from_slice(key) {
        Ok(mac) => mac,
        Err(_) => unreachable!("hmac accepts any key length"),
    };
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

fn hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        let _ = write!(out, "{byte:02x}");
    }
    out
}

/// RFC 3986 encoding as SigV4 expects; `/` is kept in paths and encoded in query values.
fn uri_encode(value: &str, encode_slash: bool) -> String {
    let mut out = String::with_capacity(value.len());
    for byte in value.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~' => {
                out.push(byte as char)
            }
            b'/' if !encode_slash => out.push('/'),
            _ => {
                let _ = write!(out, "%{byte:02X}");
            }
        }
    }
    out
}

fn xml_escape(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}
