//! Local documents served for paths no proxy rule claims

use crate::response::{ProxyBody, empty_body, full_body, text_response};
use hyper::header::{CONTENT_LENGTH, CONTENT_TYPE, HeaderValue};
use hyper::{Method, Response, StatusCode};
use std::path::{Path, PathBuf};
use tracing::debug;

const INDEX_FILE: &str = "index.html";

#[derive(Debug, Clone)]
pub struct StaticFiles {
    root: PathBuf,
}

impl StaticFiles {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// File under the root for a request path, `None` for traversal attempts
    pub fn resolve(&self, path: &str) -> Option<PathBuf> {
        let relative = path.trim_start_matches('/');
        if relative.split('/').any(|segment| segment == "..") || relative.contains('\\') {
            return None;
        }

        let mut file = self.root.clone();
        if !relative.is_empty() {
            file.push(relative);
        }
        Some(file)
    }

    pub async fn serve(&self, method: &Method, path: &str) -> Response<ProxyBody> {
        if method != Method::GET && method != Method::HEAD {
            return text_response(StatusCode::METHOD_NOT_ALLOWED, "Method not allowed");
        }

        let Some(mut file) = self.resolve(path) else {
            debug!("rejected static path {}", path);
            return text_response(StatusCode::NOT_FOUND, "Not found");
        };

        if tokio::fs::metadata(&file).await.map(|m| m.is_dir()).unwrap_or(false) {
            file.push(INDEX_FILE);
        }

        let data = match tokio::fs::read(&file).await {
            Ok(data) => data,
            Err(e) => {
                debug!("static file {} not served: {}", file.display(), e);
                return text_response(StatusCode::NOT_FOUND, "Not found");
            }
        };

        let mime = mime_guess::from_path(&file).first_or_octet_stream();
        let length = data.len();
        let body = if method == Method::HEAD {
            empty_body()
        } else {
            full_body(data)
        };

        let mut response = Response::new(body);
        if let Ok(value) = HeaderValue::from_str(mime.as_ref()) {
            response.headers_mut().insert(CONTENT_TYPE, value);
        }
        response.headers_mut().insert(CONTENT_LENGTH, HeaderValue::from(length));
        response
    }
}
