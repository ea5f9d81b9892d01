//! Response body type and constructors shared by the gate, the login flow
//! and the proxy stage

use bytes::Bytes;
use http_body_util::{BodyExt, Empty, Full, combinators::BoxBody};
use hyper::header::{CONTENT_TYPE, HeaderValue, LOCATION};
use hyper::{Response, StatusCode};

/// Body type of every response the gateway produces
pub type ProxyBody = BoxBody<Bytes, hyper::Error>;

/// Body returned with every authentication or authorization denial
pub const ACCESS_DENIED: &str = "Access denied";

/// Create full body
pub fn full_body(bytes: impl Into<Bytes>) -> ProxyBody {
    Full::new(bytes.into())
        .map_err(|never| match never {})
        .boxed()
}

/// Create empty body
pub fn empty_body() -> ProxyBody {
    Empty::<Bytes>::new()
        .map_err(|never| match never {})
        .boxed()
}

/// Create a plain text response
pub fn text_response(status: StatusCode, body: &str) -> Response<ProxyBody> {
    let mut response = Response::new(full_body(body.to_string()));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("text/plain; charset=utf-8"));
    response
}

/// 403 with the fixed denial body
pub fn forbidden() -> Response<ProxyBody> {
    text_response(StatusCode::FORBIDDEN, ACCESS_DENIED)
}

/// 302 to `location`; an unrepresentable location falls back to `/`
pub fn redirect_response(location: &str) -> Response<ProxyBody> {
    let mut response = Response::new(empty_body());
    *response.status_mut() = StatusCode::FOUND;
    let value = HeaderValue::from_str(location).unwrap_or_else(|_| HeaderValue::from_static("/"));
    response.headers_mut().insert(LOCATION, value);
    response
}
