//! Purpose: Query client contract plus a ClickHouse HTTP implementation.
//! Exports: `QueryClient`, `QueryStream`, `HttpQueryClient`, `quote_identifier`.
//! Role: The only path from the orchestrators to the source/destination database.
//! Invariants: Clients are shared across workers; implementations hold no per-call mutable state.
//! Invariants: Non-success statuses become `Execution` errors with the server text; transport
//! failures become `Io`.
//! Invariants: Response bodies are never transparently decoded, so a server-side
//! `Content-Encoding` can be passed through to storage untouched.
#![allow(clippy::result_large_err)]

use crate::core::codec::BoxRead;
use crate::core::error::{Error, ErrorKind, Result};
use std::io::{Cursor, Read};
use std::path::Path;
use std::sync::Arc;
use tracing::debug;
use url::Url;

/// Longest server error text kept in an error message.
const MAX_ERROR_TEXT: usize = 2048;

/// A streamed response and the encoding the server applied to it, if any.
pub struct QueryStream {
    pub reader: BoxRead,
    pub content_encoding: Option<String>,
}

pub trait QueryClient: Send + Sync {
    /// Runs `sql` and buffers the full response.
    fn execute_query(&self, sql: &[u8]) -> Result<Vec<u8>>;

    /// Runs `sql` and returns the response unbuffered. `accept_encoding` asks the server to
    /// compress; the returned `content_encoding` reports what it actually did.
    fn execute_query_streaming(
        &self,
        sql: &str,
        accept_encoding: Option<&str>,
    ) -> Result<QueryStream>;
}

#[derive(Clone)]
pub struct HttpQueryClient {
    inner: Arc<HttpQueryClientInner>,
}

#[derive(Clone)]
struct HttpQueryClientInner {
    base_url: Url,
    user: Option<String>,
    password: Option<String>,
    agent: ureq::Agent,
}

impl HttpQueryClient {
    pub fn new(base_url: impl AsRef<str>) -> Result<Self> {
        let base_url = normalize_base_url(base_url.as_ref())?;
        Ok(Self {
            inner: Arc::new(HttpQueryClientInner {
                base_url,
                user: None,
                password: None,
                agent: ureq::AgentBuilder::new().build(),
            }),
        })
    }

    pub fn with_credentials(mut self, user: impl Into<String>, password: Option<String>) -> Self {
        let inner = Arc::make_mut(&mut self.inner);
        inner.user = Some(user.into());
        inner.password = password;
        self
    }

    pub fn with_tls_ca_file(mut self, path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let cert_bytes = std::fs::read(path).map_err(|err| {
            Error::new(ErrorKind::Config)
                .with_message(format!("failed to read TLS CA file {}", path.display()))
                .with_source(err)
        })?;
        let mut cert_reader = Cursor::new(cert_bytes);
        let certs = rustls_pemfile::certs(&mut cert_reader)
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|err| {
                Error::new(ErrorKind::Config)
                    .with_message(format!("failed to parse TLS CA file {}", path.display()))
                    .with_source(err)
            })?;
        if certs.is_empty() {
            return Err(Error::new(ErrorKind::Config)
                .with_message(format!("TLS CA file {} contains no certificates", path.display())));
        }

        let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
        let mut root_store = rustls::RootCertStore::empty();
        let (added, _) = root_store.add_parsable_certificates(certs);
        if added == 0 {
            return Err(Error::new(ErrorKind::Config).with_message(format!(
                "TLS CA file {} contains no parsable certificates",
                path.display()
            )));
        }
        let tls_config = rustls::ClientConfig::builder()
            .with_root_certificates(root_store)
            .with_no_client_auth();
        let agent = ureq::builder().tls_config(Arc::new(tls_config)).build();
        Arc::make_mut(&mut self.inner).agent = agent;
        Ok(self)
    }

    pub fn base_url(&self) -> &Url {
        &self.inner.base_url
    }

    fn request(&self, compress: bool) -> ureq::Request {
        let mut url = self.inner.base_url.clone();
        if compress {
            url.query_pairs_mut()
                .append_pair("enable_http_compression", "1");
        }
        let mut request = self.inner.agent.request_url("POST", &url);
        if let Some(user) = &self.inner.user {
            request = request.set("X-ClickHouse-User", user);
        }
        if let Some(password) = &self.inner.password {
            request = request.set("X-ClickHouse-Key", password);
        }
        request
    }
}

impl QueryClient for HttpQueryClient {
    fn execute_query(&self, sql: &[u8]) -> Result<Vec<u8>> {
        let response = self
            .request(false)
            .send_bytes(sql)
            .map_err(|err| response_error(err, sql))?;
        let mut body = Vec::new();
        response
            .into_reader()
            .read_to_end(&mut body)
            .map_err(|err| Error::io("failed to read query response", err))?;
        Ok(body)
    }

    fn execute_query_streaming(
        &self,
        sql: &str,
        accept_encoding: Option<&str>,
    ) -> Result<QueryStream> {
        let mut request = self.request(accept_encoding.is_some());
        if let Some(encoding) = accept_encoding {
            request = request.set("Accept-Encoding", encoding);
        }
        let response = request
            .send_string(sql)
            .map_err(|err| response_error(err, sql.as_bytes()))?;
        let content_encoding = response
            .header("Content-Encoding")
            .map(str::trim)
            .filter(|encoding| !encoding.is_empty())
            .map(str::to_ascii_lowercase);
        debug!(
            content_encoding = content_encoding.as_deref().unwrap_or("identity"),
            "streaming query response"
        );
        Ok(QueryStream {
            reader: Box::new(response.into_reader()),
            content_encoding,
        })
    }
}

fn normalize_base_url(raw: &str) -> Result<Url> {
    let url = Url::parse(raw.trim()).map_err(|err| {
        Error::new(ErrorKind::Config)
            .with_message(format!("invalid ClickHouse URL {raw:?}"))
            .with_hint("Use http(s)://host:8123.")
            .with_source(err)
    })?;
    if !matches!(url.scheme(), "http" | "https") || url.host_str().is_none() {
        return Err(Error::new(ErrorKind::Config)
            .with_message(format!("ClickHouse URL must be http(s) with a host: {raw}"))
            .with_hint("Use http(s)://host:8123."));
    }
    Ok(url)
}

fn response_error(err: ureq::Error, sql: &[u8]) -> Error {
    let statement = String::from_utf8_lossy(&sql[..sql.len().min(512)]).to_string();
    match err {
        ureq::Error::Status(code, response) => {
            let mut text = response.into_string().unwrap_or_default();
            if text.len() > MAX_ERROR_TEXT {
                let mut cut = MAX_ERROR_TEXT;
                while !text.is_char_boundary(cut) {
                    cut -= 1;
                }
                text.truncate(cut);
            }
            Error::new(ErrorKind::Execution)
                .with_message(format!("query failed with status {code}: {}", text.trim()))
                .with_statement(&statement)
        }
        ureq::Error::Transport(err) => Error::new(ErrorKind::Io)
            .with_message("query request failed")
            .with_statement(&statement)
            .with_source(err),
    }
}

/// Backtick-quotes an identifier for ClickHouse.
pub fn quote_identifier(name: &str) -> String {
    format!("`{}`", name.replace('\\', "\\\\").replace('`', "\\`"))
}

/// Single-quotes a string literal for ClickHouse.
pub fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\\', "\\\\").replace('\'', "\\'"))
}

#[cfg(test)]
mod tests {
    use super::{HttpQueryClient, normalize_base_url, quote_identifier, quote_literal};
    use crate::core::error::ErrorKind;

    #[test]
    fn base_url_must_be_http() {
        assert!(normalize_base_url("http://localhost:8123").is_ok());
        let err = normalize_base_url("tcp://localhost:9000").expect_err("scheme");
        assert_eq!(err.kind(), ErrorKind::Config);
        let err = normalize_base_url("not a url").expect_err("parse");
        assert_eq!(err.kind(), ErrorKind::Config);
    }

    #[test]
    fn credentials_do_not_alter_base_url() {
        let client = HttpQueryClient::new("https://ch.example:8443/")
            .expect("client")
            .with_credentials("default", Some("secret".to_string()));
        assert_eq!(client.base_url().as_str(), "https://ch.example:8443/");
    }

    #[test]
    fn quoting_escapes_delimiters() {
        assert_eq!(quote_identifier("we`ird"), "`we\\`ird`");
        assert_eq!(quote_literal("it's"), "'it\\'s'");
        assert_eq!(quote_literal("a\\b"), "'a\\\\b'");
    }

    #[test]
    fn missing_ca_file_is_a_config_error() {
        let client = HttpQueryClient::new("https://ch.example:8443").expect("client");
        let err = client
            .with_tls_ca_file("/nonexistent/ca.pem")
            .err()
            .expect("missing file");
        assert_eq!(err.kind(), ErrorKind::Config);
    }
}
