//! The job engine driving the local backend end to end: submission order,
//! cancellation, handle accounting, and streamed listings with ack-based
//! backpressure.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use vfs_backend_file::LocalBackend;
use vfs_core::job::{Job, OpRequest, OpResponse};
use vfs_core::{CancellationToken, Error, InfoOptions, OpenMode, OperationContext};
use vfs_uri::Uri;

fn ctx() -> OperationContext {
    OperationContext::new(CancellationToken::new())
}

fn file_uri(path: &Path) -> Uri {
    Uri::parse(&format!("file://{}", path.display())).unwrap()
}

fn recv(job: &Job) -> vfs_core::job::Notification {
    job.recv_timeout(Duration::from_secs(10)).expect("job result within timeout")
}

#[test]
fn open_read_close_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("hello.txt");
    std::fs::write(&path, b"hello engine").unwrap();

    let job = Job::new(Arc::new(LocalBackend::new()));
    job.call(OpRequest::Open { uri: file_uri(&path), mode: OpenMode::Read }, ctx());
    let opened = recv(&job);
    let Some(Ok(OpResponse::Opened(handle))) = opened.result else {
        panic!("expected an opened handle, got {:?}", opened.result);
    };

    job.call(OpRequest::Read { handle: handle.clone(), len: 64 }, ctx());
    let read = recv(&job);
    let Some(Ok(OpResponse::Read(data))) = read.result else {
        panic!("expected read data, got {:?}", read.result);
    };
    assert_eq!(data, b"hello engine");

    job.call(OpRequest::Close { handle }, ctx());
    let closed = recv(&job);
    assert!(matches!(closed.result, Some(Ok(OpResponse::Closed))));
}

#[test]
fn results_arrive_in_submission_order() {
    let dir = tempfile::tempdir().unwrap();
    for name in ["a.txt", "b.txt", "c.txt"] {
        std::fs::write(dir.path().join(name), b"x").unwrap();
    }

    let job = Job::new(Arc::new(LocalBackend::new()));
    let ids: Vec<u64> = ["a.txt", "b.txt", "c.txt"]
        .iter()
        .map(|name| {
            job.call(
                OpRequest::GetFileInfo {
                    uri: file_uri(&dir.path().join(name)),
                    options: InfoOptions::default(),
                },
                ctx(),
            )
        })
        .collect();

    for expected in ids {
        assert_eq!(recv(&job).op_id, expected);
    }
}

#[test]
fn cancel_before_dispatch_suppresses_the_read() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("big.bin");
    std::fs::write(&path, vec![0u8; 64 * 1024 * 1024]).unwrap();

    let job = Job::new(Arc::new(LocalBackend::new()));
    job.call(OpRequest::Open { uri: file_uri(&path), mode: OpenMode::Read }, ctx());
    let Some(Ok(OpResponse::Opened(handle))) = recv(&job).result else {
        panic!("expected an opened handle");
    };

    // A token that is already cancelled when the worker picks the op up:
    // the backend never runs and no bytes are transferred.
    let token = CancellationToken::new();
    token.cancel();
    job.call(
        OpRequest::Read { handle: handle.clone(), len: 64 * 1024 * 1024 },
        OperationContext::new(token),
    );
    let read = recv(&job);
    assert!(matches!(read.result, Some(Err(Error::Cancelled))));

    // The handle is still accounted for and closes cleanly afterwards.
    job.call(OpRequest::Close { handle }, ctx());
    assert!(matches!(recv(&job).result, Some(Ok(OpResponse::Closed))));
}

#[test]
fn cancelled_job_stops_delivering_for_pending_ops() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("big.bin");
    std::fs::write(&path, vec![0u8; 64 * 1024 * 1024]).unwrap();

    let job = Job::new(Arc::new(LocalBackend::new()));
    job.call(OpRequest::Open { uri: file_uri(&path), mode: OpenMode::Read }, ctx());
    let Some(Ok(OpResponse::Opened(handle))) = recv(&job).result else {
        panic!("expected an opened handle");
    };

    job.call(OpRequest::Read { handle: handle.clone(), len: 64 * 1024 * 1024 }, ctx());
    std::thread::sleep(Duration::from_millis(10));
    job.cancel();

    // Mid-flight cancellation lands inside the chunked read loop; if the
    // read won the race instead, it completes with the full payload. Both
    // are legal outcomes; what may not happen is a partial Ok.
    let read = recv(&job);
    match read.result {
        Some(Err(Error::Cancelled)) => {}
        Some(Ok(OpResponse::Read(data))) => assert_eq!(data.len(), 64 * 1024 * 1024),
        other => panic!("unexpected read outcome: {other:?}"),
    }

    job.call(OpRequest::Close { handle }, ctx());
    assert!(matches!(recv(&job).result, Some(Ok(OpResponse::Closed))));
}

#[test]
fn streaming_listing_applies_backpressure_between_chunks() {
    let dir = tempfile::tempdir().unwrap();
    for i in 0..300 {
        std::fs::write(dir.path().join(format!("f{i:04}")), b"x").unwrap();
    }

    let job = Job::new(Arc::new(LocalBackend::new()));
    job.list_directory(file_uri(dir.path()), InfoOptions::default(), 100, ctx());

    let first = recv(&job);
    let Some(Ok(OpResponse::DirectoryListing { entries, eof })) = first.result else {
        panic!("expected a listing chunk");
    };
    assert_eq!(entries.len(), 100);
    assert!(!eof);
    assert!(first.needs_ack);

    // Without an ack the worker must not produce the next chunk.
    assert!(job.recv_timeout(Duration::from_millis(200)).is_none());

    let mut total = entries.len();
    job.ack();
    loop {
        let chunk = recv(&job);
        let needs_ack = chunk.needs_ack;
        let Some(Ok(OpResponse::DirectoryListing { entries, eof })) = chunk.result else {
            panic!("expected a listing chunk");
        };
        total += entries.len();
        if eof {
            break;
        }
        if needs_ack {
            job.ack();
        }
    }
    assert_eq!(total, 300);
}
