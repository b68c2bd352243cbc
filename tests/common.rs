use async_std::net::{TcpListener, TcpStream};
use futures_util::AsyncReadExt;
use hpool_h1::{Body, Cancel, Client, Connect, ConnectFuture, EndpointKey, Error, PoolConfig};
use std::future::Future;
use std::sync::Once;

/// Connector used by every test: plain TCP, no resolution games.
pub struct TcpConnector;

impl Connect for TcpConnector {
    type Stream = TcpStream;

    fn connect(&self, key: &EndpointKey) -> ConnectFuture<TcpStream> {
        let addr = format!("{}:{}", key.host, key.port);
        Box::pin(async move { TcpStream::connect(addr).await.map_err(Error::Connect) })
    }
}

pub fn client() -> Client<TcpConnector> {
    setup_logger();
    Client::new(TcpConnector)
}

pub fn client_with_limit(limit: usize) -> Client<TcpConnector> {
    setup_logger();
    let config = PoolConfig {
        max_connections_per_endpoint: limit,
        ..PoolConfig::default()
    };
    Client::with_config(TcpConnector, config)
}

/// Test server handle.
pub struct TestServer {
    pub port: u16,
}

impl TestServer {
    pub fn uri(&self, path: &str) -> String {
        format!("http://127.0.0.1:{}{}", self.port, path)
    }

    pub fn key(&self) -> EndpointKey {
        EndpointKey::new("http", "127.0.0.1", self.port)
    }
}

/// Start a server calling `f` once per received request with the parsed
/// request head, the socket and a global request ordinal. The closure
/// writes its own response bytes and returns the socket plus whether to
/// keep serving that connection; returning `false` closes it. Accepted
/// connections are served concurrently so pooled overlap works.
pub async fn serve<F, R>(f: F) -> Result<TestServer, Error>
where
    F: Fn(String, TcpStream, usize) -> R + Send + Sync + 'static,
    R: Future<Output = Result<(TcpStream, bool), Error>> + Send,
{
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    setup_logger();

    let l = TcpListener::bind("127.0.0.1:0").await?;
    let port = l.local_addr()?.port();

    let f = Arc::new(f);
    let count = Arc::new(AtomicUsize::new(0));

    async_std::task::spawn(async move {
        loop {
            let (tcp, _) = match l.accept().await {
                Ok(v) => v,
                Err(_) => break,
            };

            let f = f.clone();
            let count = count.clone();

            async_std::task::spawn(async move {
                let mut tcp = tcp;

                loop {
                    let head = match read_head(&mut tcp).await {
                        Ok(v) => v,
                        // client went away.
                        Err(_) => return,
                    };

                    let seq = count.fetch_add(1, Ordering::SeqCst);

                    let (t, keep) = f(head, tcp, seq).await.expect("serve closure failed");
                    tcp = t;

                    if !keep {
                        return;
                    }
                }
            });
        }
    });

    Ok(TestServer { port })
}

/// Read a request head byte by byte so no body bytes are consumed.
pub async fn read_head(tcp: &mut TcpStream) -> Result<String, Error> {
    let mut buf = vec![];
    let mut one = [0_u8; 1];

    loop {
        let amount = tcp.read(&mut one[..]).await?;
        if amount == 0 {
            return Err(Error::Closed("EOF before complete request head".into()));
        }

        buf.push(one[0]);

        if buf.ends_with(b"\r\n\r\n") {
            break;
        }
    }

    Ok(String::from_utf8(buf).expect("request head is utf8"))
}

/// Read exactly `len` body bytes off the socket.
pub async fn read_body(tcp: &mut TcpStream, len: usize) -> Result<Vec<u8>, Error> {
    let mut buf = vec![0_u8; len];
    tcp.read_exact(&mut buf[..]).await?;
    Ok(buf)
}

/// Send a request and read the whole response body.
pub async fn run(
    client: &Client<TcpConnector>,
    req: http::Request<Body>,
) -> Result<(http::response::Parts, Vec<u8>), Error> {
    let cancel = Cancel::new();
    let res = client.send(req, &cancel).await?;

    let (parts, mut body) = res.into_parts();
    let v = body.read_to_vec().await?;

    Ok((parts, v))
}

pub fn setup_logger() {
    static START: Once = Once::new();
    START.call_once(|| {
        let test_log = std::env::var("TEST_LOG")
            .map(|x| x != "0" && x.to_lowercase() != "false")
            .unwrap_or(false);
        let level = if test_log {
            log::LevelFilter::Trace
        } else {
            log::LevelFilter::Info
        };
        pretty_env_logger::formatted_builder()
            .filter_level(log::LevelFilter::Warn)
            .filter_module("hpool_h1", level)
            .target(env_logger::Target::Stdout)
            .init();
    });
}
