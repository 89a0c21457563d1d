//! `vfs-daemon`: the out-of-process host for every scheme's virtual
//! filesystem backend.
//!
//! Clients (typically `vfs-client`'s `ProxyBackend`) connect over a Unix
//! socket or TCP and speak the length-prefixed MsgPack protocol defined in
//! `vfs-protocol`. Each connection gets its own [`session::ClientSession`],
//! which lazily resolves backends from a shared [`vfs_core::MethodRegistry`]
//! and drives them through [`vfs_core::job::Job`].
//!
//! ## Wire protocol
//!
//! ```text
//! ┌──────────────────┬──────────────────────────┐
//! │ 4 bytes BE u32   │  MessagePack payload      │
//! │ (payload length) │  (Request | Response | …) │
//! └──────────────────┴──────────────────────────┘
//! ```
//!
//! ## Shutdown
//!
//! The daemon runs until killed; an individual connection ends when its
//! socket closes or a fatal I/O error occurs, and is logged but does not
//! bring down the listener.

mod dispatch;
mod registry;
mod session;

use std::net::SocketAddr;
use std::sync::Arc;

use rmpv::Value;
use session::ClientSession;
use tokio::io::{AsyncRead, AsyncWrite, BufReader, BufWriter};
use tokio::sync::Mutex as AsyncMutex;
use vfs_core::MethodRegistry;
use vfs_protocol::{Ack, Cancel, ErrorData, ProtocolError, Request, Response, ToClient, ToDaemon};

// ---------------------------------------------------------------------------
// Listen address parsing
// ---------------------------------------------------------------------------

/// Parsed `--listen` address.
#[derive(Debug, Clone)]
enum ListenAddr {
    /// TCP listener on `addr:port`. Port 0 means pick a random free port.
    Tcp(SocketAddr),
    /// Unix domain socket listener at the given path.
    #[cfg(unix)]
    Unix(String),
}

/// Parse a `--listen` argument string.
///
/// Accepted formats:
///   - `tcp:<host>:<port>`   e.g. `tcp:127.0.0.1:9631` or `tcp:0.0.0.0:0`
///   - `unix:<path>`         e.g. `unix:/run/vfs-daemon.sock`
///
/// When no scheme prefix is present, the value is treated as a TCP address
/// if it parses as `<host>:<port>`, otherwise as a Unix socket path.
fn parse_listen_addr(s: &str) -> Result<ListenAddr, String> {
    if let Some(rest) = s.strip_prefix("tcp:") {
        let addr: SocketAddr = rest.parse().map_err(|e| format!("invalid TCP address '{rest}': {e}"))?;
        return Ok(ListenAddr::Tcp(addr));
    }

    #[cfg(unix)]
    if let Some(rest) = s.strip_prefix("unix:") {
        if rest.is_empty() {
            return Err("unix socket path cannot be empty".into());
        }
        return Ok(ListenAddr::Unix(rest.to_string()));
    }

    #[cfg(not(unix))]
    if s.starts_with("unix:") {
        return Err("Unix domain sockets are not supported on this platform".into());
    }

    if let Ok(addr) = s.parse::<SocketAddr>() {
        return Ok(ListenAddr::Tcp(addr));
    }

    #[cfg(unix)]
    return Ok(ListenAddr::Unix(s.to_string()));

    #[cfg(not(unix))]
    return Err(format!("cannot parse listen address '{s}', use tcp:<host>:<port>"));
}

// ---------------------------------------------------------------------------
// Connection serving (transport-agnostic)
// ---------------------------------------------------------------------------

/// How long a connection may stay silent before the daemon declares the
/// client dead. Clients that sit idle are expected to send a `ping`
/// request well inside this window.
const CLIENT_IDLE_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(15 * 60);

/// Serve a single client connection: read requests off `reader`, dispatch
/// each against a fresh [`ClientSession`], and write responses/notifications
/// to `writer`. Non-`list_directory` requests and listings both run as their
/// own spawned task so a slow op never blocks `Ack`/`Cancel` for others in
/// flight on the same connection.
async fn serve_connection<R, W>(reader: R, writer: W, label: String, registry: Arc<MethodRegistry>)
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let mut reader = BufReader::new(reader);
    let writer = Arc::new(AsyncMutex::new(BufWriter::new(writer)));
    let session = ClientSession::new(registry);

    loop {
        let read = tokio::time::timeout(CLIENT_IDLE_TIMEOUT, vfs_protocol::read_to_daemon(&mut reader)).await;
        let incoming = match read {
            Err(_) => {
                // No frame (not even a ping) for the whole window: treat
                // the client as dead rather than holding its resources.
                tracing::warn!(%label, "client idle timeout");
                break;
            }
            Ok(Ok(msg)) => msg,
            Ok(Err(ProtocolError::ConnectionClosed)) => {
                tracing::info!(%label, "connection closed");
                break;
            }
            Ok(Err(e)) => {
                tracing::warn!(%label, error = %e, "read error");
                if matches!(e, ProtocolError::Io(_)) {
                    break;
                }
                continue;
            }
        };

        match incoming {
            ToDaemon::Request(req) => {
                let session = session.clone();
                let writer = writer.clone();
                tokio::spawn(async move {
                    handle_request(&session, &writer, req).await;
                });
            }
            ToDaemon::Cancel(Cancel { id, .. }) => {
                session.cancel(id).await;
            }
            ToDaemon::Ack(Ack { id, .. }) => {
                session.ack(id).await;
            }
        }
    }

    session.shutdown().await;
    tracing::info!(%label, "connection ended");
}

async fn handle_request<W>(session: &Arc<ClientSession>, writer: &Arc<AsyncMutex<BufWriter<W>>>, req: Request)
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let Request { id, op, params, .. } = req;

    if op == "list_directory" {
        handle_listing(session, writer, id, &params).await;
        return;
    }

    let outcome = dispatch::dispatch_call(session, id, &op, &params).await;
    let message = match outcome {
        Ok(result) => ToClient::Response(Response::ok(id, result)),
        Err(err) => ToClient::Response(Response::err(id, ErrorData::from(&err))),
    };
    write_message(writer, &message).await;
}

async fn handle_listing<W>(session: &Arc<ClientSession>, writer: &Arc<AsyncMutex<BufWriter<W>>>, id: u64, params: &Value)
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (uri, options) = match dispatch::decode_listing_request(params) {
        Ok(v) => v,
        Err(err) => {
            let message = ToClient::Response(Response::err(id, ErrorData::from(&err)));
            write_message(writer, &message).await;
            return;
        }
    };

    let scheme = session.scheme_of(&uri);
    let mut rx = match session.start_listing(id, &scheme, uri, options).await {
        Ok(rx) => rx,
        Err(err) => {
            let message = ToClient::Response(Response::err(id, ErrorData::from(&err)));
            write_message(writer, &message).await;
            return;
        }
    };

    while let Some(notification) = rx.recv().await {
        let is_final = notification.result.as_ref().is_none_or(|r| {
            !matches!(r, Ok(vfs_core::OpResponse::DirectoryListing { eof: false, .. }))
        });
        let wire = dispatch::encode_listing_chunk(notification);
        write_message(writer, &ToClient::Notification(wire)).await;
        if is_final {
            break;
        }
    }

    session.finish_listing(id).await;
}

async fn write_message<W>(writer: &Arc<AsyncMutex<BufWriter<W>>>, message: &ToClient)
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let mut w = writer.lock().await;
    if let Err(e) = vfs_protocol::write_to_client(&mut *w, message).await {
        tracing::warn!(error = %e, "write error");
    }
}

// ---------------------------------------------------------------------------
// Listener modes
// ---------------------------------------------------------------------------

/// Run as a TCP listener. Every accepted connection is spawned as its own
/// task so the daemon serves multiple clients concurrently.
async fn run_tcp_listener(addr: SocketAddr, registry: Arc<MethodRegistry>) {
    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(l) => l,
        Err(e) => {
            eprintln!("vfs-daemon: failed to bind TCP {addr}: {e}");
            std::process::exit(1);
        }
    };

    let local_addr = match listener.local_addr() {
        Ok(a) => a,
        Err(e) => {
            eprintln!("vfs-daemon: failed to read bound TCP address: {e}");
            std::process::exit(1);
        }
    };
    eprintln!("LISTEN:tcp:{local_addr}");
    tracing::info!(%local_addr, "listening on tcp");

    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!(error = %e, "TCP accept error");
                continue;
            }
        };

        let label = format!("tcp:{peer}");
        tracing::info!(%label, "accepted connection");
        let (read_half, write_half) = stream.into_split();
        tokio::spawn(serve_connection(read_half, write_half, label, registry.clone()));
    }
}

/// Run as a Unix domain socket listener. Every accepted connection is
/// spawned as its own task.
#[cfg(unix)]
async fn run_unix_listener(path: &str, registry: Arc<MethodRegistry>) {
    let _ = std::fs::remove_file(path);

    let listener = match tokio::net::UnixListener::bind(path) {
        Ok(l) => l,
        Err(e) => {
            eprintln!("vfs-daemon: failed to bind Unix socket {path}: {e}");
            std::process::exit(1);
        }
    };

    eprintln!("LISTEN:unix:{path}");
    tracing::info!(%path, "listening on unix");

    let socket_path = path.to_string();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        let _ = std::fs::remove_file(&socket_path);
        std::process::exit(0);
    });

    loop {
        let (stream, _) = match listener.accept().await {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!(error = %e, "Unix accept error");
                continue;
            }
        };

        let label = format!("unix:{path}");
        tracing::info!(%label, "accepted connection");
        let (read_half, write_half) = stream.into_split();
        tokio::spawn(serve_connection(read_half, write_half, label, registry.clone()));
    }
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() {
    let args: Vec<String> = std::env::args().collect();
    if args.iter().any(|a| a == "--version" || a == "-V") {
        println!("vfs-daemon {}", env!("CARGO_PKG_VERSION"));
        return;
    }

    tracing_subscriber::fmt().with_writer(std::io::stderr).init();

    let listen_addr = args
        .windows(2)
        .find(|w| w[0] == "--listen")
        .map(|w| w[1].clone())
        .or_else(|| {
            args.iter()
                .find_map(|a| a.strip_prefix("--listen="))
                .map(str::to_string)
        });

    let Some(addr_str) = listen_addr else {
        eprintln!("vfs-daemon: --listen <tcp:host:port|unix:path> is required");
        std::process::exit(1);
    };

    let addr = match parse_listen_addr(&addr_str) {
        Ok(a) => a,
        Err(e) => {
            eprintln!("vfs-daemon: invalid --listen address: {e}");
            std::process::exit(1);
        }
    };

    tracing::info!(pid = std::process::id(), version = env!("CARGO_PKG_VERSION"), "vfs-daemon starting");

    let registry = registry::build();

    match addr {
        ListenAddr::Tcp(sock_addr) => run_tcp_listener(sock_addr, registry).await,
        #[cfg(unix)]
        ListenAddr::Unix(path) => run_unix_listener(&path, registry).await,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_listen_addr_tcp_explicit() {
        let addr = parse_listen_addr("tcp:127.0.0.1:9631").unwrap();
        match addr {
            ListenAddr::Tcp(a) => {
                assert_eq!(a.ip(), std::net::Ipv4Addr::new(127, 0, 0, 1));
                assert_eq!(a.port(), 9631);
            }
            #[cfg(unix)]
            _ => panic!("expected Tcp"),
        }
    }

    #[test]
    fn parse_listen_addr_auto_tcp() {
        let addr = parse_listen_addr("127.0.0.1:8080").unwrap();
        match addr {
            ListenAddr::Tcp(a) => assert_eq!(a.port(), 8080),
            #[cfg(unix)]
            _ => panic!("expected Tcp"),
        }
    }

    #[cfg(unix)]
    #[test]
    fn parse_listen_addr_unix_explicit() {
        let addr = parse_listen_addr("unix:/tmp/vfs-daemon.sock").unwrap();
        match addr {
            ListenAddr::Unix(path) => assert_eq!(path, "/tmp/vfs-daemon.sock"),
            _ => panic!("expected Unix"),
        }
    }

    #[cfg(unix)]
    #[test]
    fn parse_listen_addr_unix_empty_rejected() {
        assert!(parse_listen_addr("unix:").is_err());
    }

    #[tokio::test]
    async fn serve_connection_answers_ping_over_tcp() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let local_addr = listener.local_addr().unwrap();
        let registry = registry::build();

        let server = tokio::spawn(async move {
            let (stream, _peer) = listener.accept().await.unwrap();
            let (r, w) = stream.into_split();
            serve_connection(r, w, "test".into(), registry).await;
        });

        let mut stream = tokio::net::TcpStream::connect(local_addr).await.unwrap();
        let req = Request::new(1, "ping", Value::Map(vec![]));
        let payload = rmp_serde::to_vec_named(&ToDaemon::Request(req)).unwrap();
        stream.write_all(&(payload.len() as u32).to_be_bytes()).await.unwrap();
        stream.write_all(&payload).await.unwrap();
        stream.flush().await.unwrap();

        let mut len_buf = [0u8; 4];
        stream.read_exact(&mut len_buf).await.unwrap();
        let len = u32::from_be_bytes(len_buf) as usize;
        let mut buf = vec![0u8; len];
        stream.read_exact(&mut buf).await.unwrap();
        let reply: ToClient = rmp_serde::from_slice(&buf).unwrap();

        let ToClient::Response(resp) = reply else { panic!("expected a Response") };
        assert_eq!(resp.id, 1);
        assert!(resp.error.is_none());

        drop(stream);
        tokio::time::timeout(std::time::Duration::from_secs(5), server).await.unwrap().unwrap();
    }
}
