//! A minimal `LocalHandler` demo: serves files from a directory behind an
//! HTTP Basic Auth challenge. Gives the CLI something runnable to point a
//! tunnel at; not part of the core and carries no invariants of its own.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use subtle::ConstantTimeEq;

use crate::tunnel::{HttpRequest, HttpResponse, LocalHandler};

pub struct StaticFileHandler {
    root: PathBuf,
    username: String,
    password: String,
}

impl StaticFileHandler {
    pub fn new(root: impl Into<PathBuf>, username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            username: username.into(),
            password: password.into(),
        }
    }

    /// Constant-time comparison of both the username and password against
    /// the `Authorization: Basic` header, mirroring `subtle.ConstantTimeCompare`.
    fn authenticate(&self, headers: &std::collections::HashMap<String, Vec<String>>) -> bool {
        let Some(header) = find_header(headers, "authorization") else {
            return false;
        };
        let Some(encoded) = header.strip_prefix("Basic ") else {
            return false;
        };
        let Ok(decoded) = STANDARD.decode(encoded) else {
            return false;
        };
        let Ok(decoded) = String::from_utf8(decoded) else {
            return false;
        };
        let Some((user, pass)) = decoded.split_once(':') else {
            return false;
        };

        let user_ok: bool = user.as_bytes().ct_eq(self.username.as_bytes()).into();
        let pass_ok: bool = pass.as_bytes().ct_eq(self.password.as_bytes()).into();
        user_ok && pass_ok
    }

    fn resolve(&self, request_path: &str) -> Option<PathBuf> {
        let relative = request_path.trim_start_matches('/');
        let candidate = self.root.join(relative);
        let candidate = if candidate.is_dir() {
            candidate.join("index.html")
        } else {
            candidate
        };
        // Reject any resolved path that escapes the configured root.
        let root = self.root.canonicalize().ok()?;
        let resolved = candidate.canonicalize().ok()?;
        if resolved.starts_with(&root) {
            Some(resolved)
        } else {
            None
        }
    }
}

fn find_header<'a>(headers: &'a std::collections::HashMap<String, Vec<String>>, name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(key, _)| key.eq_ignore_ascii_case(name))
        .and_then(|(_, values)| values.first())
        .map(String::as_str)
}

#[async_trait]
impl LocalHandler for StaticFileHandler {
    async fn handle(&self, req: HttpRequest) -> HttpResponse {
        if !self.authenticate(&req.headers) {
            return HttpResponse::new(401)
                .with_header("WWW-Authenticate", r#"Basic realm="tunnel""#);
        }

        let path = req.path.split('?').next().unwrap_or("/");
        match self.resolve(path) {
            Some(file_path) => serve_file(&file_path).await,
            None => HttpResponse::new(404).with_body("not found"),
        }
    }
}

async fn serve_file(path: &Path) -> HttpResponse {
    match tokio::fs::read(path).await {
        Ok(body) => HttpResponse::new(200)
            .with_header("content-type", guess_content_type(path))
            .with_body(body),
        Err(_) => HttpResponse::new(404).with_body("not found"),
    }
}

fn guess_content_type(path: &Path) -> &'static str {
    match path.extension().and_then(|ext| ext.to_str()) {
        Some("html") => "text/html; charset=utf-8",
        Some("css") => "text/css",
        Some("js") => "application/javascript",
        Some("json") => "application/json",
        Some("png") => "image/png",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        _ => "application/octet-stream",
    }
}
