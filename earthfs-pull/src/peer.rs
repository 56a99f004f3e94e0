//! HTTP client for a peer earthfs repository.
//!
//! Three endpoints: the long-lived URI listing (`/query`), per-file
//! fetches (`/file/<algo>/<hash>`), and session auth (`/auth`).

use earthfs_core::{EfsError, Result};
use reqwest::blocking::{Client, Response};
use reqwest::header::{CONTENT_LENGTH, CONTENT_TYPE, COOKIE, SET_COOKIE};
use std::io::{BufRead, BufReader, Read};
use std::time::Duration;

/// Maximum length of one listing line.
pub const URI_MAX: usize = 1024;

fn net_err(e: reqwest::Error) -> EfsError {
    EfsError::Network(e.to_string())
}

/// Blocking client for one peer host. Cheap to create; connections are
/// reused across requests.
pub struct PeerClient {
    origin: String,
    client: Client,
}

impl PeerClient {
    pub fn new(host: &str) -> Result<Self> {
        // The listing response stays open indefinitely, so only the
        // connect phase gets a deadline.
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(None)
            .build()
            .map_err(net_err)?;
        let origin = if host.contains("://") {
            host.trim_end_matches('/').to_string()
        } else {
            format!("http://{}", host.trim_end_matches('/'))
        };
        Ok(Self { origin, client })
    }

    fn get(&self, path: &str, cookie: Option<&str>) -> Result<Response> {
        let mut req = self.client.get(format!("{}{}", self.origin, path));
        if let Some(cookie) = cookie {
            req = req.header(COOKIE, cookie);
        }
        let resp = req.send().map_err(net_err)?;
        match resp.status().as_u16() {
            200..=299 => Ok(resp),
            403 => Err(EfsError::AuthRequired),
            status => Err(EfsError::Status(status)),
        }
    }

    /// Open the listing: `GET /query?count=all`, one URI per line.
    pub fn query_listing(&self, cookie: Option<&str>) -> Result<Listing> {
        let resp = self.get("/query?count=all", cookie)?;
        Ok(Listing {
            body: BufReader::new(resp),
        })
    }

    /// Fetch one file by content address, streaming the body.
    pub fn fetch_file(&self, algo: &str, hash: &str, cookie: Option<&str>) -> Result<FileResponse> {
        let resp = self.get(&format!("/file/{algo}/{hash}"), cookie)?;
        let content_type = resp
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("application/octet-stream")
            .to_string();
        Ok(FileResponse {
            content_type,
            body: resp,
        })
    }

    /// `POST /auth` and capture the session cookie from `Set-Cookie`.
    pub fn auth(&self) -> Result<String> {
        let resp = self
            .client
            .post(format!("{}/auth", self.origin))
            .header(CONTENT_LENGTH, 0)
            .send()
            .map_err(net_err)?;
        let status = resp.status();
        if !status.is_success() {
            return Err(EfsError::Status(status.as_u16()));
        }
        resp.headers()
            .get(SET_COOKIE)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.split(';').next().unwrap_or(v).trim().to_string())
            .filter(|v| !v.is_empty())
            .ok_or_else(|| EfsError::Parse("auth response missing Set-Cookie".to_string()))
    }
}

/// The long-lived listing response, consumed one URI line at a time.
pub struct Listing {
    body: BufReader<Response>,
}

impl Listing {
    /// Read one newline-terminated URI. `Ok(None)` when the listing is
    /// over (connection close or empty line).
    pub fn read_uri(&mut self) -> Result<Option<String>> {
        let mut line = String::new();
        let n = (&mut self.body)
            .take(URI_MAX as u64 + 1)
            .read_line(&mut line)?;
        if n == 0 {
            return Ok(None);
        }
        if n > URI_MAX {
            return Err(EfsError::Parse("listing line exceeds URI_MAX".to_string()));
        }
        let uri = line.trim_end_matches(['\r', '\n']);
        if uri.is_empty() {
            return Ok(None);
        }
        Ok(Some(uri.to_string()))
    }
}

/// A streaming file-fetch response.
pub struct FileResponse {
    content_type: String,
    body: Response,
}

impl FileResponse {
    pub fn content_type(&self) -> &str {
        &self.content_type
    }
}

impl Read for FileResponse {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.body.read(buf)
    }
}
