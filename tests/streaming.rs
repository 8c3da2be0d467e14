//! End-to-end tests of a frame server fed through a stream bridge.

use std::collections::HashSet;
use std::io::Read;
use std::net::{SocketAddr, TcpStream};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use camstream::capture::{Frame, FrameObserver, PixelFormat};
use camstream::server::{FrameStreamHandler, Server, ServerConfig, ServerStatus};
use camstream::stream::header::{read_frame, LegacyHeader};
use camstream::stream::{HeaderFormat, OverflowPolicy, StreamBridge, StreamState};

fn frame(id: u64, len: usize) -> Frame {
    Frame::new(vec![id as u8; len], 16, (len / 16) as u32, PixelFormat::MONO8, id, id * 1000)
}

fn start_server(
    bridge: &Arc<StreamBridge>,
    format: HeaderFormat,
    send_timeout: Duration,
) -> (Server, SocketAddr) {
    let config = ServerConfig::new("camserver_test", "127.0.0.1:0".parse().unwrap())
        .with_send_timeout(send_timeout)
        .with_accept_poll(Duration::from_millis(20));
    let handler = FrameStreamHandler::new(Arc::clone(bridge), format, Duration::from_secs(3));
    let server = Server::start(config, handler).unwrap();
    let addr = server.wait_until_running(Duration::from_secs(5)).unwrap();
    (server, addr)
}

fn wait_for_state(bridge: &StreamBridge, state: StreamState) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while bridge.state() != state {
        assert!(Instant::now() < deadline, "stream stuck in {}", bridge.state());
        thread::sleep(Duration::from_millis(5));
    }
}

fn connect(addr: SocketAddr) -> TcpStream {
    let client = TcpStream::connect(addr).unwrap();
    client
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    client
}

#[test]
fn test_client_receives_every_frame_in_order() {
    let bridge = Arc::new(StreamBridge::new(
        "scenario",
        2,
        OverflowPolicy::Block {
            timeout: Duration::from_secs(2),
        },
    ));
    let (mut server, addr) = start_server(&bridge, HeaderFormat::Extended, Duration::from_secs(10));
    let mut client = connect(addr);
    wait_for_state(&bridge, StreamState::StartRequested);

    let producer = {
        let bridge = Arc::clone(&bridge);
        thread::spawn(move || {
            for id in 1..=5 {
                bridge.frame_received(frame(id, 256));
                thread::sleep(Duration::from_millis(20));
            }
        })
    };

    let mut received = Vec::new();
    for _ in 0..5 {
        let (header, payload) = read_frame(&mut client).unwrap();
        assert_eq!(header.buffer_size as usize, payload.len());
        assert_eq!(header.width, 16);
        assert_eq!(header.height, 16);
        assert_eq!(header.pixel_format, PixelFormat::MONO8.code());
        assert_eq!(header.timestamp, header.frame_id * 1000);
        assert!(payload.iter().all(|&b| b == header.frame_id as u8));
        received.push(header.frame_id);
    }
    producer.join().unwrap();
    assert_eq!(received, vec![1, 2, 3, 4, 5]);

    // Every buffer came back exactly once.
    let returned = bridge.returned();
    let deadline = Instant::now() + Duration::from_secs(5);
    let mut ids = Vec::new();
    while ids.len() < 5 && Instant::now() < deadline {
        if let Ok(frame) = returned.recv_timeout(Duration::from_millis(50)) {
            ids.push(frame.frame_id());
        }
    }
    ids.sort_unstable();
    assert_eq!(ids, vec![1, 2, 3, 4, 5]);
    assert!(returned.try_recv().is_err());

    let stats = bridge.snapshot();
    assert_eq!(stats.sent, 5);
    assert_eq!(stats.bytes_sent, 5 * 256);
    assert_eq!(stats.dropped, 0);

    drop(client);
    server.stop();
    assert_eq!(server.status(), ServerStatus::Stopped);
}

#[test]
fn test_frames_before_connect_are_never_sent() {
    let bridge = Arc::new(StreamBridge::new("gated", 2, OverflowPolicy::DropOldest));
    let (mut server, addr) = start_server(&bridge, HeaderFormat::Extended, Duration::from_secs(10));

    for id in 1..=3 {
        bridge.frame_received(frame(id, 64));
    }
    let early: Vec<u64> = bridge.returned().try_iter().map(|f| f.frame_id()).collect();
    assert_eq!(early, vec![1, 2, 3]);
    assert_eq!(bridge.snapshot().rejected, 3);

    let mut client = connect(addr);
    wait_for_state(&bridge, StreamState::StartRequested);
    bridge.frame_received(frame(100, 64));
    let (header, _) = read_frame(&mut client).unwrap();
    assert_eq!(header.frame_id, 100);

    drop(client);
    server.stop();
}

#[test]
fn test_queue_never_exceeds_capacity() {
    let bridge = Arc::new(StreamBridge::new("bounded", 2, OverflowPolicy::DropOldest));
    let (mut server, addr) = start_server(&bridge, HeaderFormat::Extended, Duration::from_secs(10));
    let client = connect(addr);
    wait_for_state(&bridge, StreamState::StartRequested);

    // Frames large enough to fill the socket buffers while the client
    // reads nothing.
    for id in 1..=40 {
        bridge.frame_received(frame(id, 1 << 20));
        assert!(bridge.queue_len() <= 2);
    }
    let stats = bridge.snapshot();
    assert!(stats.queue_len <= 2);
    assert!(stats.dropped > 0);
    assert_eq!(stats.queued, 40);

    drop(client);
    server.stop();
    assert_eq!(bridge.queue_len(), 0);
}

#[test]
fn test_stop_during_blocked_send_returns_every_frame() {
    let bridge = Arc::new(StreamBridge::new("shutdown", 3, OverflowPolicy::DropOldest));
    let (mut server, addr) = start_server(&bridge, HeaderFormat::Extended, Duration::from_secs(30));
    let _client = connect(addr);
    wait_for_state(&bridge, StreamState::StartRequested);

    let pushed = 12u64;
    for id in 1..=pushed {
        bridge.frame_received(frame(id, 4 << 20));
    }
    thread::sleep(Duration::from_millis(100));

    let started = Instant::now();
    server.stop();
    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(server.status(), ServerStatus::Stopped);

    let returned: HashSet<u64> = bridge.returned().try_iter().map(|f| f.frame_id()).collect();
    assert_eq!(returned, (1..=pushed).collect::<HashSet<_>>());
    assert_eq!(bridge.snapshot().returned, pushed);
    assert_eq!(bridge.state(), StreamState::Init);
}

#[test]
fn test_new_client_after_disconnect() {
    let bridge = Arc::new(StreamBridge::new("reconnect", 2, OverflowPolicy::DropOldest));
    let (mut server, addr) = start_server(&bridge, HeaderFormat::Extended, Duration::from_secs(10));

    let mut first = connect(addr);
    wait_for_state(&bridge, StreamState::StartRequested);
    bridge.frame_received(frame(1, 64));
    let (header, _) = read_frame(&mut first).unwrap();
    assert_eq!(header.frame_id, 1);
    drop(first);

    // Keep producing until the sender notices the client is gone.
    let deadline = Instant::now() + Duration::from_secs(10);
    let mut id = 2;
    while bridge.state() == StreamState::Streaming {
        assert!(Instant::now() < deadline, "disconnect not detected");
        bridge.frame_received(frame(id, 64));
        id += 1;
        thread::sleep(Duration::from_millis(10));
    }
    assert_eq!(server.status(), ServerStatus::Running);

    let mut second = connect(addr);
    wait_for_state(&bridge, StreamState::StartRequested);
    bridge.frame_received(frame(1000, 64));
    let (header, _) = read_frame(&mut second).unwrap();
    assert_eq!(header.frame_id, 1000);
    assert_eq!(server.connections(), 2);

    drop(second);
    server.stop();
}

#[test]
fn test_legacy_header() {
    let bridge = Arc::new(StreamBridge::new("legacy", 2, OverflowPolicy::DropOldest));
    let (mut server, addr) = start_server(&bridge, HeaderFormat::Legacy, Duration::from_secs(10));
    let mut client = connect(addr);
    wait_for_state(&bridge, StreamState::StartRequested);

    let sent = Frame::new(vec![7; 32 * 4 * 2], 32, 4, PixelFormat::MONO16, 9, 0);
    bridge.frame_received(sent);
    let header = LegacyHeader::read_from(&mut client).unwrap();
    assert_eq!((header.width, header.height, header.bytes_per_pixel), (32, 4, 2));
    let mut payload = vec![0u8; header.payload_len()];
    client.read_exact(&mut payload).unwrap();
    assert!(payload.iter().all(|&b| b == 7));

    drop(client);
    server.stop();
}

#[test]
fn test_legacy_header_drops_client_on_packed_format() {
    let bridge = Arc::new(StreamBridge::new("packed", 2, OverflowPolicy::DropOldest));
    let (mut server, addr) = start_server(&bridge, HeaderFormat::Legacy, Duration::from_secs(10));
    let mut client = connect(addr);
    wait_for_state(&bridge, StreamState::StartRequested);

    let format = PixelFormat::MONO12_PACKED;
    bridge.frame_received(Frame::new(vec![0; format.payload_size(16, 4)], 16, 4, format, 1, 0));

    // Nothing is written; the connection is closed instead.
    let mut buf = [0u8; 16];
    assert_eq!(client.read(&mut buf).unwrap_or(0), 0);
    wait_for_state(&bridge, StreamState::StoppedOnError);
    let returned: Vec<u64> = bridge.returned().try_iter().map(|f| f.frame_id()).collect();
    assert_eq!(returned, vec![1]);
    assert_eq!(bridge.snapshot().sent, 0);

    server.stop();
}
