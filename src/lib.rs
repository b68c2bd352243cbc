#![warn(missing_docs, missing_debug_implementations)]
#![warn(clippy::all)]

//! An asynchronous HTTP/1 client transport with connection pooling.
//!
//! This library provides the client side of the HTTP/1.1 (and 1.0) spec
//! as a transport: it serializes requests onto some unnamed async
//! connection, pools those connections per remote endpoint for
//! keep-alive reuse, and decodes response bodies — chunked
//! transfer-coding, `Content-Length` delineation, read-until-close and
//! gzip/deflate content decoding — back into readable streams. Which
//! async runtime to use, TCP, DNS, proxies and TLS are handled outside
//! this library behind the [`Connect`] trait.
//!
//! ## In scope
//!
//! * Per-endpoint connection pooling with a connection limit, FIFO
//!   queueing at the limit and idle reaping.
//! * `Content-Length` and `Transfer-Encoding: chunked` body delineation,
//!   trailer consumption included.
//! * `Connection: keep-alive`/`close` handling deciding connection reuse.
//! * `Content-Encoding: gzip`/`deflate` response decoding.
//! * Cancellation and caller-driven deadlines at every suspension point.
//!
//! ## Out of scope
//!
//! Application level logic, and everything below the byte stream:
//!
//! * Following redirects
//! * Cookie handling
//! * Authentication (the status code and headers are there to act on)
//! * `Expect: 100-Continue` interim responses
//! * Socket connection, name resolution, proxy selection and TLS, which
//!   live inside the [`Connect`] implementation
//!
//! # Usage
//!
//! Implement [`Connect`] for your transport (plain TCP, TLS-wrapped,
//! in-memory for tests), hand it to a [`Client`], and send
//! `http::Request`s. The response body is read from the returned
//! [`RecvBody`] stream; once it ends the connection quietly goes back to
//! the pool for the next request to the same endpoint.
//!
//! [`Connect`]: pool::Connect
//! [`Client`]: client::Client
//! [`RecvBody`]: client::RecvBody

#[macro_use]
extern crate log;

mod body;
mod cancel;
mod complete;
mod conn;
mod decode;
mod error;

#[doc(hidden)]
pub mod chunked;

#[doc(hidden)]
pub mod http11;

pub(crate) use futures_io::{AsyncRead, AsyncWrite};

pub mod client;
pub mod pool;

pub use cancel::Cancel;
pub use complete::Completion;
pub use conn::Conn;
pub use error::Error;

pub use client::{Body, Client, RecvBody};
pub use pool::{Connect, ConnectFuture, EndpointKey, Pool, PoolConfig};
