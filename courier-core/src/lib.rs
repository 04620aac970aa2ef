//! Client-side request admission and routing for RPC clients.
//!
//! Given an outgoing request, this crate decides whether and where to send
//! it, queues it while no host is willing to accept it, retries it on
//! failure, and bounds concurrency to each upstream host with a per-host
//! adaptive (AIMD) limit.
//!
//! The transport itself is not provided here: callers hand the
//! [`ClientBuilder`] one [`Channel`] per host and get back a composed
//! pipeline that is itself a [`Channel`].

#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]
#![cfg_attr(not(test), warn(unused_crate_dependencies))]

mod builder;
mod channel;
mod config;
mod error;
mod limited;
mod limiter;
pub mod metrics;
mod queue;
mod retry;
mod selection;
mod types;

pub use builder::{Client, ClientBuilder};
pub use channel::{Channel, LimitedChannel, ResponseFuture};
pub use config::{
    ClientConfig, ClientQos, NodeSelectionStrategy, RetryOnTimeout, ServerQos,
};
pub use error::{BuildError, ClientError};
pub use queue::{QueuedChannel, StickySessionFactory};
pub use types::{Endpoint, Request, RequestBuilder, Response};
