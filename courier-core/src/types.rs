use std::sync::Arc;

use bytes::Bytes;
use courier_metrics::Meter;
use http::{header::HeaderName, HeaderMap, HeaderValue, Method, StatusCode};

/// Identifies a remote operation. Immutable and cheap to clone; create one
/// per call site and reuse it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    inner: Arc<EndpointInner>,
}

#[derive(Debug, PartialEq, Eq, Hash)]
struct EndpointInner {
    service_name: String,
    endpoint_name: String,
    method: Method,
    path_template: String,
}

impl Endpoint {
    pub fn new(
        service_name: impl Into<String>,
        endpoint_name: impl Into<String>,
        method: Method,
        path_template: impl Into<String>,
    ) -> Self {
        Self {
            inner: Arc::new(EndpointInner {
                service_name: service_name.into(),
                endpoint_name: endpoint_name.into(),
                method,
                path_template: path_template.into(),
            }),
        }
    }

    pub fn service_name(&self) -> &str {
        &self.inner.service_name
    }

    pub fn endpoint_name(&self) -> &str {
        &self.inner.endpoint_name
    }

    pub fn method(&self) -> &Method {
        &self.inner.method
    }

    pub fn path_template(&self) -> &str {
        &self.inner.path_template
    }
}

/// An outgoing request. Immutable; the body is a shared reference so
/// clones are cheap and retries can replay it.
#[derive(Debug, Clone, Default)]
pub struct Request {
    inner: Arc<RequestInner>,
}

#[derive(Debug, Clone, Default)]
struct RequestInner {
    headers: HeaderMap,
    path_params: Vec<(String, String)>,
    query_params: Vec<(String, String)>,
    body: Option<Bytes>,
    host_override: Option<usize>,
}

impl Request {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn builder() -> RequestBuilder {
        RequestBuilder { inner: RequestInner::default() }
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.inner.headers
    }

    pub fn path_params(&self) -> &[(String, String)] {
        &self.inner.path_params
    }

    pub fn query_params(&self) -> &[(String, String)] {
        &self.inner.query_params
    }

    pub fn body(&self) -> Option<&Bytes> {
        self.inner.body.as_ref()
    }

    /// Routing attachment set by the redirect-handling retry path: when
    /// present, node selection dispatches to exactly this host.
    pub(crate) fn host_override(&self) -> Option<usize> {
        self.inner.host_override
    }

    pub(crate) fn with_host_override(&self, host: usize) -> Request {
        let mut inner = (*self.inner).clone();
        inner.host_override = Some(host);
        Request { inner: Arc::new(inner) }
    }
}

#[derive(Debug, Default)]
pub struct RequestBuilder {
    inner: RequestInner,
}

impl RequestBuilder {
    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.inner.headers.append(name, value);
        self
    }

    pub fn path_param(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.inner.path_params.push((name.into(), value.into()));
        self
    }

    pub fn query_param(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.inner.query_params.push((name.into(), value.into()));
        self
    }

    pub fn body(mut self, body: Bytes) -> Self {
        self.inner.body = Some(body);
        self
    }

    pub fn build(self) -> Request {
        Request { inner: Arc::new(self.inner) }
    }
}

/// A completed response. The body is a scoped resource: consume it with
/// [`Response::into_body`] or discard it with [`Response::close`], exactly
/// once. A response dropped without either fires the body-leak meter when
/// leak tracking is installed.
#[derive(Debug)]
pub struct Response {
    status: StatusCode,
    headers: HeaderMap,
    body: Body,
}

#[derive(Debug, Default)]
struct Body {
    data: Option<Bytes>,
    leak_meter: Option<Meter>,
    released: bool,
}

impl Response {
    pub fn new(status: StatusCode) -> Self {
        Self { status, headers: HeaderMap::new(), body: Body::default() }
    }

    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.append(name, value);
        self
    }

    pub fn with_body(mut self, data: Bytes) -> Self {
        self.body.data = Some(data);
        self
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Borrows the body without releasing it.
    pub fn body(&self) -> Option<&Bytes> {
        self.body.data.as_ref()
    }

    /// Releases the body, consuming the response.
    pub fn close(mut self) {
        self.body.released = true;
    }

    /// Takes ownership of the body, releasing it.
    pub fn into_body(mut self) -> Option<Bytes> {
        self.body.released = true;
        self.body.data.take()
    }

    pub(crate) fn track_leaks(&mut self, meter: Meter) {
        if !self.body.released {
            self.body.leak_meter = Some(meter);
        }
    }
}

impl Drop for Body {
    fn drop(&mut self) {
        if !self.released {
            if let Some(meter) = &self.leak_meter {
                meter.mark();
            }
        }
    }
}
