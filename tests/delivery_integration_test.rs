// Integration tests for end-to-end object delivery over a live server

use std::os::unix::net::UnixStream;
use std::sync::Arc;
use std::time::Duration;

use objmapper::client::Connection;
use objmapper::protocol::{caps, DeliveryMode, Status, V1Request, V1ResponseHeader};
use objmapper::session::{Session, SessionConfig};
use objmapper::transport::UnixTransport;
use objmapper::{BackendConfig, BackendManager, BackendType, Server, ServerConfig};

/// The canonical 64-byte test object body
fn fixture() -> Vec<u8> {
    let mut body = b"Hello from FD passing!\n".to_vec();
    body.resize(64, b'.');
    body
}

/// Manager with one persistent backend holding `/test1.txt`
fn fixture_manager(dir: &std::path::Path) -> Arc<BackendManager> {
    let manager = Arc::new(BackendManager::new());
    manager
        .register_backend(BackendConfig::persistent(
            1,
            BackendType::Ssd,
            dir.join("backing"),
            1 << 30,
        ))
        .unwrap();
    std::fs::write(dir.join("backing/test1.txt"), fixture()).unwrap();
    manager.scan_all().unwrap();
    manager
}

/// Run a session over one end of a socket pair, returning the client end
fn spawn_session(manager: Arc<BackendManager>) -> Connection {
    let (client_end, server_end) = UnixStream::pair().unwrap();
    std::thread::spawn(move || {
        Session::new(
            Box::new(UnixTransport::new(server_end)),
            manager,
            SessionConfig::default(),
        )
        .run();
    });
    Connection::from_transport(Box::new(UnixTransport::new(client_end)))
}

#[test]
fn test_v1_fd_pass_delivery() {
    let dir = tempfile::tempdir().unwrap();
    let manager = fixture_manager(dir.path());
    let mut client = spawn_session(manager);

    let response = client
        .request_v1(DeliveryMode::FdPass, "/test1.txt")
        .unwrap();
    assert_eq!(response.status, Status::Ok);
    assert_eq!(response.size(), Some(64));
    assert!(response.body.is_empty());
    assert_eq!(response.fds_received, 1);

    // Reading 64 bytes from the passed descriptor yields the content.
    let fd = response.fd.unwrap();
    let mut buf = vec![0u8; 64];
    let n = nix::sys::uio::pread(&fd, &mut buf, 0).unwrap();
    assert_eq!(&buf[..n], fixture().as_slice());
}

#[test]
fn test_v1_copy_delivery() {
    let dir = tempfile::tempdir().unwrap();
    let manager = fixture_manager(dir.path());
    let mut client = spawn_session(manager);

    let response = client.request_v1(DeliveryMode::Copy, "/test1.txt").unwrap();
    assert_eq!(response.status, Status::Ok);
    assert_eq!(response.body, fixture());
    assert!(response.fd.is_none());
    assert_eq!(response.fds_received, 0);
}

#[test]
fn test_v1_splice_delivery() {
    let dir = tempfile::tempdir().unwrap();
    let manager = fixture_manager(dir.path());
    let mut client = spawn_session(manager);

    let response = client
        .request_v1(DeliveryMode::Splice, "/test1.txt")
        .unwrap();
    assert_eq!(response.status, Status::Ok);
    assert_eq!(response.body, fixture());
}

#[test]
fn test_v1_not_found_carries_message() {
    let dir = tempfile::tempdir().unwrap();
    let manager = fixture_manager(dir.path());
    let mut client = spawn_session(manager);

    let response = client.request_v1(DeliveryMode::Copy, "/missing").unwrap();
    assert_eq!(response.status, Status::NotFound);
    assert!(response.error_message().is_some());
    assert_eq!(response.fds_received, 0);

    // The session survives an error response.
    let ok = client.request_v1(DeliveryMode::Copy, "/test1.txt").unwrap();
    assert_eq!(ok.status, Status::Ok);
}

#[test]
fn test_v2_put_get_stat_delete_cycle() {
    let dir = tempfile::tempdir().unwrap();
    let manager = fixture_manager(dir.path());
    let mut client = spawn_session(manager);

    let ack = client
        .handshake(caps::OOO_REPLIES | caps::PIPELINING | caps::SEGMENTED_DELIVERY, 8)
        .unwrap();
    assert!(ack.capabilities & caps::SEGMENTED_DELIVERY != 0);

    let put = client
        .put("/data/new.bin", b"created over the wire".to_vec(), false)
        .unwrap();
    assert_eq!(put.status, Status::Ok);
    assert_eq!(put.size(), Some(21));

    let get = client.get("/data/new.bin", DeliveryMode::Copy).unwrap();
    assert_eq!(get.status, Status::Ok);
    assert_eq!(get.body, b"created over the wire");

    let stat = client.stat("/data/new.bin").unwrap();
    assert_eq!(stat.status, Status::Ok);
    assert_eq!(stat.size(), Some(21));
    assert!(stat.body.is_empty());

    let delete = client.delete("/data/new.bin").unwrap();
    assert_eq!(delete.status, Status::Ok);

    let again = client.delete("/data/new.bin").unwrap();
    assert_eq!(again.status, Status::NotFound);
}

#[test]
fn test_v2_fd_pass_and_segmented() {
    let dir = tempfile::tempdir().unwrap();
    let manager = fixture_manager(dir.path());
    let mut client = spawn_session(manager);
    client
        .handshake(caps::OOO_REPLIES | caps::SEGMENTED_DELIVERY, 4)
        .unwrap();

    let fd_response = client.get("/test1.txt", DeliveryMode::FdPass).unwrap();
    assert_eq!(fd_response.status, Status::Ok);
    assert_eq!(fd_response.fds_received, 1);

    // Server-composed segmented response: one FD segment on a Unix
    // transport, reassembled by the client.
    let segmented = client.get("/test1.txt", DeliveryMode::Segmented).unwrap();
    assert_eq!(segmented.status, Status::Ok);
    assert_eq!(segmented.body, fixture());
    assert_eq!(segmented.fds_received, 1);
}

#[test]
fn test_segmented_without_capability_is_refused() {
    let dir = tempfile::tempdir().unwrap();
    let manager = fixture_manager(dir.path());
    let mut client = spawn_session(manager);
    client.handshake(caps::OOO_REPLIES, 4).unwrap();

    let response = client.get("/test1.txt", DeliveryMode::Segmented).unwrap();
    assert_eq!(response.status, Status::CapabilityError);

    // Policy errors do not kill the connection.
    let ok = client.get("/test1.txt", DeliveryMode::Copy).unwrap();
    assert_eq!(ok.status, Status::Ok);
}

#[test]
fn test_close_drain() {
    let dir = tempfile::tempdir().unwrap();
    let manager = fixture_manager(dir.path());
    let mut client = spawn_session(manager);
    client.handshake(caps::OOO_REPLIES, 4).unwrap();

    let ack = client.close().unwrap();
    assert_eq!(ack.outstanding, 0);
}

#[test]
fn test_uri_length_boundary() {
    use std::io::Write;

    let dir = tempfile::tempdir().unwrap();
    let manager = fixture_manager(dir.path());

    // At the limit: accepted (object simply does not exist).
    let mut client = spawn_session(Arc::clone(&manager));
    let at_limit = format!("/{}", "a".repeat(objmapper::protocol::MAX_URI_LEN - 1));
    let response = client.request_v1(DeliveryMode::Copy, &at_limit).unwrap();
    assert_eq!(response.status, Status::NotFound);

    // One past the limit: the client refuses to encode it, so write the
    // frame by hand and expect URI_TOO_LONG back.
    let (mut raw, server_end) = UnixStream::pair().unwrap();
    let manager_clone = Arc::clone(&manager);
    std::thread::spawn(move || {
        Session::new(
            Box::new(UnixTransport::new(server_end)),
            manager_clone,
            SessionConfig::default(),
        )
        .run();
    });
    let over = objmapper::protocol::MAX_URI_LEN + 1;
    let mut frame = vec![DeliveryMode::Copy as u8];
    frame.extend_from_slice(&(over as u16).to_be_bytes());
    frame.extend_from_slice(&vec![b'a'; over]);
    raw.write_all(&frame).unwrap();

    let header = V1ResponseHeader::read_from(&mut raw).unwrap();
    assert_eq!(header.status, Status::UriTooLong);

    // Sanity: the client-side encoder enforces the same boundary.
    assert!(V1Request {
        mode: DeliveryMode::Copy,
        uri: "a".repeat(over),
    }
    .encode()
    .is_err());
}

#[test]
fn test_tcp_downgrades_fd_pass_to_copy() {
    let dir = tempfile::tempdir().unwrap();
    let manager = fixture_manager(dir.path());

    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let manager_clone = Arc::clone(&manager);
    std::thread::spawn(move || {
        let (stream, peer) = listener.accept().unwrap();
        Session::new(
            Box::new(objmapper::transport::TcpTransport::with_peer(stream, peer)),
            manager_clone,
            SessionConfig::default(),
        )
        .run();
    });

    let mut client = Connection::connect_tcp(addr).unwrap();
    assert!(!client.supports_fd_passing());

    // FD_PASS over TCP arrives as an inline copy.
    let response = client.request_v1(DeliveryMode::FdPass, "/test1.txt").unwrap();
    assert_eq!(response.status, Status::Ok);
    assert_eq!(response.body, fixture());
    assert_eq!(response.fds_received, 0);
}

#[test]
fn test_full_server_over_unix_socket() {
    let dir = tempfile::tempdir().unwrap();
    let socket_path = dir.path().join("objmapper.sock");

    let mut config = ServerConfig::default();
    config.socket_path = socket_path.clone();
    config.backing_dir = dir.path().join("objects");
    config.max_connections = 4;
    std::fs::create_dir_all(&config.backing_dir).unwrap();
    std::fs::write(config.backing_dir.join("served.bin"), b"full stack").unwrap();

    let server = Server::new(Arc::new(BackendManager::new()), config);
    server.bootstrap().unwrap();
    std::thread::spawn(move || {
        let _ = server.run();
    });

    // Wait for the listener to come up.
    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    while !socket_path.exists() {
        assert!(std::time::Instant::now() < deadline, "server never bound");
        std::thread::sleep(Duration::from_millis(10));
    }

    let mut client = Connection::connect_unix(&socket_path).unwrap();
    let response = client.request_v1(DeliveryMode::Copy, "/served.bin").unwrap();
    assert_eq!(response.status, Status::Ok);
    assert_eq!(response.body, b"full stack");

    let mut v2 = Connection::connect_unix(&socket_path).unwrap();
    v2.handshake(caps::OOO_REPLIES, 4).unwrap();
    let fd_response = v2.get("/served.bin", DeliveryMode::FdPass).unwrap();
    assert_eq!(fd_response.status, Status::Ok);
    assert_eq!(fd_response.fds_received, 1);
}
