//! Per-endpoint connection pooling.
//!
//! Connections are bucketed by [`EndpointKey`] and bounded per bucket.
//! `acquire` prefers an idle connection, opens a new one while under the
//! limit, and otherwise parks the caller in a FIFO queue. The pool mutex
//! covers bookkeeping only: connecting and all I/O happen outside it, and
//! handoff to parked callers goes through [`Completion`] cells.

use crate::cancel::Cancel;
use crate::complete::Completion;
use crate::conn::Conn;
use crate::Error;
use crate::{AsyncRead, AsyncWrite};
use futures_util::future::poll_fn;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Future type produced by [`Connect`] implementations.
pub type ConnectFuture<S> = Pin<Box<dyn Future<Output = Result<S, Error>> + Send>>;

/// Opens transport streams for the pool.
///
/// DNS resolution, proxy substitution and TLS wrapping all live behind
/// this trait; by the time the pool sees the stream those are done.
/// Classify failures as [`Error::Resolve`] or [`Error::Connect`] so
/// callers can tell lookup trouble from transport trouble.
pub trait Connect: Send + Sync + 'static {
    /// The transport stream produced, TLS already applied if any.
    type Stream: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    /// Open a stream to the endpoint.
    fn connect(&self, key: &EndpointKey) -> ConnectFuture<Self::Stream>;
}

/// Identifies one pool bucket. All connections under one key are
/// interchangeable for any request addressed to it.
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub struct EndpointKey {
    /// Uri scheme, typically `http` or `https`.
    pub scheme: String,
    /// Host name as it appeared in the request uri.
    pub host: String,
    /// Explicit or scheme-default port.
    pub port: u16,
    /// Connection group name. Distinct groups never share connections,
    /// even for the same host.
    pub group: String,
}

impl EndpointKey {
    /// Key with the empty connection group.
    pub fn new(scheme: &str, host: &str, port: u16) -> Self {
        EndpointKey {
            scheme: scheme.into(),
            host: host.into(),
            port,
            group: String::new(),
        }
    }

    /// Same endpoint, named connection group.
    pub fn with_group(mut self, group: &str) -> Self {
        self.group = group.into();
        self
    }

    /// Derive the key from a request uri.
    pub fn from_uri(uri: &http::Uri, group: &str) -> Result<Self, Error> {
        let scheme = uri.scheme_str().unwrap_or("http");

        let host = uri
            .host()
            .ok_or_else(|| Error::User(format!("Request uri has no host: {}", uri)))?;

        let port = uri.port_u16().unwrap_or(match scheme {
            "https" => 443,
            _ => 80,
        });

        Ok(EndpointKey {
            scheme: scheme.into(),
            host: host.into(),
            port,
            group: group.into(),
        })
    }
}

impl fmt::Display for EndpointKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}:{}", self.scheme, self.host, self.port)?;
        if !self.group.is_empty() {
            write!(f, "#{}", self.group)?;
        }
        Ok(())
    }
}

/// Pool tuning knobs.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Connection limit per endpoint key. With 1, requests to an endpoint
    /// serialize strictly through one connection.
    pub max_connections_per_endpoint: usize,
    /// Idle connections older than this are closed.
    pub max_idle_time: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        PoolConfig {
            max_connections_per_endpoint: 6,
            max_idle_time: Duration::from_secs(90),
        }
    }
}

/// What a parked acquire receives when capacity frees up.
pub(crate) enum Reclaim<S> {
    /// A released connection, ready to carry the next request.
    Reused(Conn<S>),
    /// A capacity slot; the receiver opens a fresh connection.
    OpenSlot,
}

struct Idle<S> {
    conn: Conn<S>,
    since: Instant,
}

struct Group<S> {
    idle: Vec<Idle<S>>,
    waiters: VecDeque<Completion<Reclaim<S>>>,
    /// Connections in existence for this key, idle and lent out alike.
    count: usize,
}

impl<S> Default for Group<S> {
    fn default() -> Self {
        Group {
            idle: Vec::new(),
            waiters: VecDeque::new(),
            count: 0,
        }
    }
}

/// Connection pool over a [`Connect`] implementation.
pub struct Pool<C: Connect> {
    connector: C,
    config: PoolConfig,
    groups: Mutex<HashMap<EndpointKey, Group<C::Stream>>>,
}

enum Plan<S> {
    Ready(Conn<S>),
    Connect,
    Wait(Completion<Reclaim<S>>),
}

impl<C: Connect> Pool<C> {
    pub fn new(connector: C, config: PoolConfig) -> Self {
        Pool {
            connector,
            config,
            groups: Mutex::new(HashMap::new()),
        }
    }

    /// Check out a connection for the endpoint: an idle one if available,
    /// a new one while under the limit, otherwise parked FIFO until a
    /// connection or slot frees up. Cancellation while parked removes the
    /// waiter without affecting others.
    pub async fn acquire(
        &self,
        key: &EndpointKey,
        cancel: &Cancel,
    ) -> Result<Conn<C::Stream>, Error> {
        let plan = {
            let mut lock = self.groups.lock().unwrap();
            let group = lock.entry(key.clone()).or_insert_with(Group::default);

            reap_locked(group, &self.config);

            if let Some(idle) = group.idle.pop() {
                debug!("Acquire reuses idle connection: {}", key);
                Plan::Ready(idle.conn)
            } else if group.count < self.config.max_connections_per_endpoint {
                group.count += 1;
                Plan::Connect
            } else {
                debug!("Acquire parked at limit: {}", key);
                let waiter = Completion::new();
                group.waiters.push_back(waiter.clone());
                Plan::Wait(waiter)
            }
        };

        match plan {
            Plan::Ready(conn) => Ok(conn),

            Plan::Connect => self.connect_slot(key, cancel).await,

            Plan::Wait(waiter) => {
                let res = poll_fn(|cx| {
                    cancel.check(cx)?;
                    waiter.poll_wait(cx)
                })
                .await;

                match res {
                    Ok(Reclaim::Reused(conn)) => Ok(conn),
                    Ok(Reclaim::OpenSlot) => self.connect_slot(key, cancel).await,
                    Err(e) => {
                        if !waiter.try_cancel() {
                            // A handoff raced our cancellation; put it back
                            // so other waiters are unaffected.
                            match waiter.take_now() {
                                Some(Reclaim::Reused(conn)) => self.release(conn),
                                Some(Reclaim::OpenSlot) => self.free_slot(key),
                                None => {}
                            }
                        }
                        Err(e)
                    }
                }
            }
        }
    }

    /// Return a checked-out connection. Reusable ones go straight to the
    /// next parked waiter or into the idle set; anything else is closed,
    /// its slot granted onward.
    pub fn release(&self, conn: Conn<C::Stream>) {
        let key = conn.key().clone();
        let mut lock = self.groups.lock().unwrap();

        let group = match lock.get_mut(&key) {
            Some(g) => g,
            // pool was purged of the group; just close the connection.
            None => return,
        };

        reap_locked(group, &self.config);

        if conn.is_reusable() {
            let mut conn = Some(conn);

            while let Some(waiter) = group.waiters.pop_front() {
                match waiter.try_complete(Reclaim::Reused(conn.take().expect("conn present"))) {
                    Ok(()) => {
                        trace!("Release handed connection to parked waiter: {}", key);
                        return;
                    }
                    // waiter canceled, try the next one.
                    Err(Reclaim::Reused(c)) => conn = Some(c),
                    Err(Reclaim::OpenSlot) => panic!("handoff returned foreign value"),
                }
            }

            let conn = conn.expect("conn present");
            debug!("Release pools connection: {} (age {:?})", key, conn.age());
            group.idle.push(Idle {
                conn,
                since: Instant::now(),
            });
        } else {
            debug!("Release closes connection: {} (age {:?})", key, conn.age());
            drop(conn);
            group.count -= 1;
            grant_next_locked(group, &self.config);
        }
    }

    /// Close a connection that must not be reused (cancellation, framing
    /// or transport failure) and free its slot.
    pub fn discard(&self, mut conn: Conn<C::Stream>) {
        conn.mark_not_reusable();
        self.release(conn);
    }

    /// Close idle connections past their idle time and drop empty
    /// buckets.
    pub fn purge_idle(&self) {
        let mut lock = self.groups.lock().unwrap();

        for group in lock.values_mut() {
            reap_locked(group, &self.config);
        }

        lock.retain(|_, g| g.count > 0 || !g.waiters.is_empty());
    }

    /// Idle connections currently pooled for the endpoint.
    pub fn idle_count(&self, key: &EndpointKey) -> usize {
        let lock = self.groups.lock().unwrap();
        lock.get(key).map(|g| g.idle.len()).unwrap_or(0)
    }

    /// Connections in existence for the endpoint, lent out or idle.
    pub fn connection_count(&self, key: &EndpointKey) -> usize {
        let lock = self.groups.lock().unwrap();
        lock.get(key).map(|g| g.count).unwrap_or(0)
    }

    /// Requests currently parked waiting for the endpoint.
    pub fn pending_count(&self, key: &EndpointKey) -> usize {
        let lock = self.groups.lock().unwrap();
        lock.get(key)
            .map(|g| g.waiters.iter().filter(|w| w.is_running()).count())
            .unwrap_or(0)
    }

    /// Connect outside the lock; the slot was already counted. On failure
    /// the slot is freed and granted to the next waiter.
    async fn connect_slot(
        &self,
        key: &EndpointKey,
        cancel: &Cancel,
    ) -> Result<Conn<C::Stream>, Error> {
        debug!("Opening new connection: {}", key);

        let mut fut = self.connector.connect(key);

        let res = poll_fn(|cx| {
            cancel.check(cx)?;
            fut.as_mut().poll(cx)
        })
        .await;

        match res {
            Ok(stream) => Ok(Conn::new(stream, key.clone())),
            Err(e) => {
                trace!("Connect failed: {}", e);
                self.free_slot(key);
                Err(e)
            }
        }
    }

    fn free_slot(&self, key: &EndpointKey) {
        let mut lock = self.groups.lock().unwrap();
        if let Some(group) = lock.get_mut(key) {
            group.count -= 1;
            grant_next_locked(group, &self.config);
        }
    }
}

/// Grant one freed slot to the next live waiter, skipping canceled ones.
fn grant_next_locked<S>(group: &mut Group<S>, config: &PoolConfig) {
    while group.count < config.max_connections_per_endpoint {
        let waiter = match group.waiters.pop_front() {
            Some(w) => w,
            None => return,
        };

        if waiter.try_complete(Reclaim::OpenSlot).is_ok() {
            group.count += 1;
            return;
        }
    }
}

/// Close idle connections older than the configured idle time. Each one
/// frees a slot which may unpark a waiter.
fn reap_locked<S>(group: &mut Group<S>, config: &PoolConfig) {
    let before = group.idle.len();

    group.idle.retain(|i| i.since.elapsed() <= config.max_idle_time);

    let dropped = before - group.idle.len();

    if dropped > 0 {
        debug!("Reaped {} idle connections", dropped);
        group.count -= dropped;
        for _ in 0..dropped {
            grant_next_locked(group, config);
        }
    }
}

impl<C: Connect> fmt::Debug for Pool<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let lock = self.groups.lock().unwrap();
        write!(f, "Pool({} buckets)", lock.len())
    }
}
