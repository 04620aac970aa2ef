//! Transport stubs for pipeline tests.

use std::{
    collections::VecDeque,
    io,
    sync::atomic::{AtomicUsize, Ordering},
};

use courier_core::{Channel, ClientError, Endpoint, Request, Response, ResponseFuture};
use http::{header::HeaderName, HeaderValue, StatusCode};
use parking_lot::Mutex;

/// What a [`TransportStub`] does with one request.
pub enum Script {
    Respond(StatusCode),
    RespondWithHeader(StatusCode, HeaderName, HeaderValue),
    Reset,
    /// Never completes; the response future resolves only if the stub is
    /// dropped.
    Hang,
}

/// A per-host transport that replays a script, then keeps responding with
/// its fallback status.
pub struct TransportStub {
    script: Mutex<VecDeque<Script>>,
    fallback: StatusCode,
    hits: AtomicUsize,
}

impl TransportStub {
    pub fn new(script: Vec<Script>) -> std::sync::Arc<Self> {
        std::sync::Arc::new(Self {
            script: Mutex::new(script.into()),
            fallback: StatusCode::OK,
            hits: AtomicUsize::new(0),
        })
    }

    pub fn always(status: StatusCode) -> std::sync::Arc<Self> {
        std::sync::Arc::new(Self {
            script: Mutex::new(VecDeque::new()),
            fallback: status,
            hits: AtomicUsize::new(0),
        })
    }

    pub fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }
}

impl Channel for TransportStub {
    fn execute(&self, _endpoint: &Endpoint, _request: &Request) -> ResponseFuture {
        self.hits.fetch_add(1, Ordering::SeqCst);
        let next = self.script.lock().pop_front();
        match next {
            Some(Script::Respond(status)) => Box::pin(async move { Ok(Response::new(status)) }),
            Some(Script::RespondWithHeader(status, name, value)) => {
                Box::pin(async move { Ok(Response::new(status).with_header(name, value)) })
            }
            Some(Script::Reset) => Box::pin(async {
                Err(ClientError::Io(io::Error::new(io::ErrorKind::ConnectionReset, "reset")))
            }),
            Some(Script::Hang) => Box::pin(futures::future::pending()),
            None => {
                let status = self.fallback;
                Box::pin(async move { Ok(Response::new(status)) })
            }
        }
    }
}

pub async fn settle() {
    for _ in 0..32 {
        tokio::task::yield_now().await;
    }
}
