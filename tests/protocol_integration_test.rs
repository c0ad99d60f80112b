// Integration tests for V2 protocol behaviours that need a scripted peer:
// out-of-order replies and hand-composed segmented responses.

use std::io::{Read, Write};
use std::os::fd::AsRawFd;
use std::os::unix::net::UnixStream;
use std::sync::Arc;

use objmapper::client::Connection;
use objmapper::protocol::segment::SegmentHeader;
use objmapper::protocol::{
    caps, DeliveryMode, Hello, HelloAck, RequestOp, Status, V2Request, V2ResponseHeader,
    V2SegmentedHeader, PROTOCOL_VERSION,
};
use objmapper::session::{Session, SessionConfig};
use objmapper::transport::{Transport, UnixTransport};
use objmapper::{BackendConfig, BackendManager, BackendType};

/// Accept the HELLO on a scripted server and echo every capability back
fn scripted_handshake(transport: &mut UnixTransport) -> Hello {
    let mut first = [0u8; 1];
    transport.read_exact(&mut first).unwrap();
    assert_eq!(first[0], b'O');
    let hello = Hello::read_after_first_byte(transport).unwrap();
    let ack = HelloAck {
        version: PROTOCOL_VERSION,
        capabilities: hello.capabilities,
        max_pipeline: hello.max_pipeline,
        backend_parallelism: 1,
    };
    transport.write_all(&ack.encode()).unwrap();
    hello
}

fn read_request(transport: &mut UnixTransport) -> V2Request {
    let mut tag = [0u8; 1];
    transport.read_exact(&mut tag).unwrap();
    assert_eq!(tag[0], 0x01);
    V2Request::read_after_tag(transport).unwrap()
}

#[test]
fn test_out_of_order_replies_are_stashed() {
    let (client_end, server_end) = UnixStream::pair().unwrap();

    let server = std::thread::spawn(move || {
        let mut transport = UnixTransport::new(server_end);
        scripted_handshake(&mut transport);

        let ids: Vec<u32> = (0..4).map(|_| read_request(&mut transport).request_id).collect();
        assert_eq!(ids, vec![1, 2, 3, 4]);

        // Scramble the reply order.
        for id in [3u32, 1, 4, 2] {
            let body = format!("response-{id}").into_bytes();
            let header = V2ResponseHeader {
                status: Status::Ok,
                request_id: id,
                content_len: body.len() as u64,
                metadata: Vec::new(),
            };
            transport.write_all(&header.encode().unwrap()).unwrap();
            transport.write_all(&body).unwrap();
        }
    });

    let mut client = Connection::from_transport(Box::new(UnixTransport::new(client_end)));
    client
        .handshake(caps::OOO_REPLIES | caps::PIPELINING, 8)
        .unwrap();

    for _ in 0..4 {
        client
            .send_request(RequestOp::Get, DeliveryMode::Copy, "/obj", Vec::new(), 0)
            .unwrap();
    }

    // Waiting for id 2 stashes 3, 1, 4 along the way.
    let response = client.recv_response_for(2).unwrap();
    assert_eq!(response.body, b"response-2");

    // The stashed replies come straight out of the pending map.
    for id in [1u32, 3, 4] {
        let stashed = client.recv_response_for(id).unwrap();
        assert_eq!(stashed.body, format!("response-{id}").into_bytes());
    }
    server.join().unwrap();
}

#[test]
fn test_segmented_response_with_fd_reuse() {
    let (client_end, server_end) = UnixStream::pair().unwrap();

    let page: Vec<u8> = (0..4096u32).map(|i| (i % 251) as u8).collect();
    let page_for_server = page.clone();

    let server = std::thread::spawn(move || {
        let mut transport = UnixTransport::new(server_end);
        scripted_handshake(&mut transport);
        let request = read_request(&mut transport);
        assert_eq!(request.mode, DeliveryMode::Segmented);

        let mut file = tempfile::tempfile().unwrap();
        file.write_all(&page_for_server).unwrap();

        // FD page + inline trailer + zero-length FIN segment reusing the
        // same descriptor: exactly one descriptor crosses the socket.
        let header = V2SegmentedHeader {
            status: Status::Ok,
            request_id: request.request_id,
            metadata: Vec::new(),
            segments: vec![
                SegmentHeader::fd(4096, 0, 4096, false, false),
                SegmentHeader::inline(16, false),
                SegmentHeader::fd(0, 0, 0, true, true),
            ],
        };
        transport.write_all(&header.encode().unwrap()).unwrap();
        transport.write_all(b"trailer metadata").unwrap();
        transport.send_fd(file.as_raw_fd()).unwrap();
    });

    let mut client = Connection::from_transport(Box::new(UnixTransport::new(client_end)));
    client.handshake(caps::SEGMENTED_DELIVERY, 4).unwrap();
    let response = client.get("/obj", DeliveryMode::Segmented).unwrap();

    assert_eq!(response.status, Status::Ok);
    assert_eq!(response.body.len(), 4096 + 16);
    assert_eq!(&response.body[..4096], page.as_slice());
    assert_eq!(&response.body[4096..], b"trailer metadata");
    assert_eq!(response.fds_received, 1);
    server.join().unwrap();
}

#[test]
fn test_unknown_frame_fails_the_session() {
    let dir = tempfile::tempdir().unwrap();
    let manager = Arc::new(BackendManager::new());
    manager
        .register_backend(BackendConfig::persistent(
            1,
            BackendType::Ssd,
            dir.path().join("backing"),
            1 << 20,
        ))
        .unwrap();

    let (mut raw, server_end) = UnixStream::pair().unwrap();
    let session = std::thread::spawn(move || {
        Session::new(
            Box::new(UnixTransport::new(server_end)),
            manager,
            SessionConfig::default(),
        )
        .run()
    });

    // Complete a handshake, then send garbage.
    raw.write_all(
        &Hello {
            version: PROTOCOL_VERSION,
            capabilities: 0,
            max_pipeline: 1,
        }
        .encode(),
    )
    .unwrap();
    let mut ack = [0u8; 10];
    raw.read_exact(&mut ack).unwrap();

    raw.write_all(&[0xEE]).unwrap();

    // The server drops the connection and the session ends failed.
    let state = session.join().unwrap();
    assert_eq!(state, objmapper::SessionState::Failed);
    let mut probe = [0u8; 1];
    assert_eq!(raw.read(&mut probe).unwrap_or(0), 0);
}

#[test]
fn test_unknown_v1_mode_gets_invalid_mode_response() {
    // A first byte that is neither the V2 magic nor a known mode is
    // treated as a V1 request with an unknown mode: the server consumes
    // the frame and answers INVALID_MODE instead of dropping the peer.
    let dir = tempfile::tempdir().unwrap();
    let manager = Arc::new(BackendManager::new());
    manager
        .register_backend(BackendConfig::persistent(
            1,
            BackendType::Ssd,
            dir.path().join("backing"),
            1 << 20,
        ))
        .unwrap();

    let (mut raw, server_end) = UnixStream::pair().unwrap();
    let session = std::thread::spawn(move || {
        Session::new(
            Box::new(UnixTransport::new(server_end)),
            manager,
            SessionConfig::default(),
        )
        .run()
    });

    raw.write_all(&[0x7F, 0x00, 0x01, b'x']).unwrap();
    let header = objmapper::protocol::V1ResponseHeader::read_from(&mut raw).unwrap();
    assert_eq!(header.status, Status::InvalidMode);

    drop(raw);
    let state = session.join().unwrap();
    assert_eq!(state, objmapper::SessionState::Closed);
}
