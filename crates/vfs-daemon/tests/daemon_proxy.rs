//! Client/daemon bridge end to end: a real `vfs-daemon` process serving a
//! real `ProxyBackend` over TCP.

use std::io::{BufRead, BufReader};
use std::net::SocketAddr;
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};

use vfs_client::TcpProxyBackend;
use vfs_core::{Backend, CancellationToken, Error, InfoOptions, OpenMode, OperationContext};
use vfs_uri::Uri;

struct DaemonProcess {
    child: Child,
    addr: SocketAddr,
}

impl DaemonProcess {
    /// Spawn `vfs-daemon --listen tcp:127.0.0.1:0` and scrape the bound
    /// address from its `LISTEN:tcp:<addr>` stderr line.
    fn spawn() -> Self {
        let mut child = Command::new(env!("CARGO_BIN_EXE_vfs-daemon"))
            .arg("--listen")
            .arg("tcp:127.0.0.1:0")
            .stderr(Stdio::piped())
            .stdout(Stdio::null())
            .spawn()
            .expect("spawn vfs-daemon");

        let stderr = child.stderr.take().expect("daemon stderr is piped");
        let mut lines = BufReader::new(stderr).lines();
        let deadline = Instant::now() + Duration::from_secs(15);
        let addr = loop {
            assert!(Instant::now() < deadline, "daemon never reported its listen address");
            let Some(Ok(line)) = lines.next() else {
                panic!("daemon stderr closed before reporting its listen address");
            };
            if let Some(rest) = line.strip_prefix("LISTEN:tcp:") {
                break rest.parse().expect("daemon printed a valid address");
            }
        };

        // Keep draining stderr so the daemon never blocks on a full pipe.
        std::thread::spawn(move || for _ in lines.flatten() {});

        DaemonProcess { child, addr }
    }
}

impl Drop for DaemonProcess {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

fn ctx() -> OperationContext {
    OperationContext::new(CancellationToken::new())
}

fn file_uri(path: &Path) -> Uri {
    Uri::parse(&format!("file://{}", path.display())).unwrap()
}

#[test]
fn stat_and_read_through_the_daemon() {
    let daemon = DaemonProcess::spawn();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("remote.txt");
    std::fs::write(&path, b"served by the daemon").unwrap();

    let proxy = TcpProxyBackend::connect(daemon.addr).unwrap();
    let ctx = ctx();

    let info = proxy.get_file_info(&file_uri(&path), InfoOptions::default(), &ctx).unwrap();
    assert_eq!(info.name, "remote.txt");
    assert_eq!(info.size, 20);

    let handle = proxy.open(&file_uri(&path), OpenMode::Read, &ctx).unwrap();
    let mut buf = [0u8; 64];
    let n = proxy.read(&handle, &mut buf, &ctx).unwrap();
    assert_eq!(&buf[..n], b"served by the daemon");
    proxy.close(&handle, &ctx).unwrap();
}

#[test]
fn write_then_read_back_through_the_daemon() {
    let daemon = DaemonProcess::spawn();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("out.txt");

    let proxy = TcpProxyBackend::connect(daemon.addr).unwrap();
    let ctx = ctx();

    let handle = proxy
        .create(&file_uri(&path), OpenMode::Write, false, 0o644, &ctx)
        .unwrap();
    let written = proxy.write(&handle, b"round trip", &ctx).unwrap();
    assert_eq!(written, 10);
    proxy.close(&handle, &ctx).unwrap();

    assert_eq!(std::fs::read(&path).unwrap(), b"round trip");
}

#[test]
fn missing_file_surfaces_as_not_found() {
    let daemon = DaemonProcess::spawn();
    let proxy = TcpProxyBackend::connect(daemon.addr).unwrap();
    let err = proxy
        .get_file_info(
            &Uri::parse("file:///no/such/path/anywhere").unwrap(),
            InfoOptions::default(),
            &ctx(),
        )
        .unwrap_err();
    assert!(matches!(err, Error::NotFound));
}

#[test]
fn move_across_schemes_is_rejected_without_side_effects() {
    let daemon = DaemonProcess::spawn();
    let dir = tempfile::tempdir().unwrap();
    let src = dir.path().join("stay.txt");
    std::fs::write(&src, b"do not move me").unwrap();

    let proxy = TcpProxyBackend::connect(daemon.addr).unwrap();
    let err = proxy
        .move_(
            &file_uri(&src),
            &Uri::parse("ftp://host.invalid/stay.txt").unwrap(),
            false,
            &ctx(),
        )
        .unwrap_err();
    assert!(matches!(err, Error::NotSameFilesystem));
    assert_eq!(std::fs::read(&src).unwrap(), b"do not move me");
}

#[test]
fn directory_listing_streams_through_the_daemon() {
    let daemon = DaemonProcess::spawn();
    let dir = tempfile::tempdir().unwrap();
    for i in 0..500 {
        std::fs::write(dir.path().join(format!("e{i:04}")), b"x").unwrap();
    }

    let proxy = TcpProxyBackend::connect(daemon.addr).unwrap();
    let ctx = ctx();

    let handle = proxy
        .open_directory(&file_uri(dir.path()), InfoOptions::default(), &ctx)
        .unwrap();
    let mut count = 0;
    loop {
        match proxy.read_directory(&handle, &ctx) {
            Ok(_) => count += 1,
            Err(Error::Eof) => break,
            Err(e) => panic!("unexpected listing error: {e:?}"),
        }
    }
    proxy.close_directory(&handle, &ctx).unwrap();
    assert_eq!(count, 500);
}

#[test]
fn two_clients_are_isolated() {
    let daemon = DaemonProcess::spawn();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("shared.txt");
    std::fs::write(&path, b"visible to both").unwrap();

    let proxy_a = TcpProxyBackend::connect(daemon.addr).unwrap();
    let proxy_b = TcpProxyBackend::connect(daemon.addr).unwrap();
    let ctx = ctx();

    let handle_a = proxy_a.open(&file_uri(&path), OpenMode::Read, &ctx).unwrap();

    // Dropping client B's connection entirely must not disturb client A's
    // open handle.
    drop(proxy_b);

    let mut buf = [0u8; 32];
    let n = proxy_a.read(&handle_a, &mut buf, &ctx).unwrap();
    assert_eq!(&buf[..n], b"visible to both");
    proxy_a.close(&handle_a, &ctx).unwrap();
}
