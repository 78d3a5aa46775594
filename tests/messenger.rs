//! End-to-end tests over real localhost UDP sockets.
//!
//! Each test starts a server and a client on ephemeral ports and drives `update()` on
//! the test thread the way an application loop would.

#![allow(clippy::expect_used, clippy::unwrap_used, clippy::panic)]

use std::net::{SocketAddr, UdpSocket};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serial_test::serial;
use udp_messenger::utils::crypto::ChaChaCipher;
use udp_messenger::{
    ChannelKind, Client, ClientRole, DeliveryMethod, DenialReason, MessengerEvent,
    NetworkConfig, OutboundPacket, ProtocolError, RpcValue, Server, ServerRole,
};

const LOCALHOST: &str = "127.0.0.1:0";

fn test_config() -> NetworkConfig {
    NetworkConfig::default_with_overrides(|c| {
        c.client.max_connection_attempts = 5;
        c.client.connection_attempt_timeout = Duration::from_millis(200);
    })
}

fn start_server(config: NetworkConfig) -> (Server, SocketAddr) {
    let role = ServerRole::new(&config);
    let server = Server::new(config, role);
    let addr = server.start(LOCALHOST.parse().unwrap()).expect("server bind");
    (server, addr)
}

fn start_client(config: NetworkConfig) -> Client {
    let client = Client::new(config, ClientRole::new());
    client.start(LOCALHOST.parse().unwrap()).expect("client bind");
    client
}

/// Polls `done` every few milliseconds until it holds or `limit` passes.
fn wait_until(limit: Duration, mut done: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + limit;
    while Instant::now() < deadline {
        if done() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    done()
}

fn connected_pair() -> (Client, Server, SocketAddr) {
    let (server, server_addr) = start_server(test_config());
    let client = start_client(test_config());
    client.connect(server_addr, None).expect("connect");
    assert!(wait_until(Duration::from_secs(2), || server.connection_count() == 1));
    (client, server, server_addr)
}

#[test]
#[serial]
fn test_connect_over_localhost() {
    let (client, server, server_addr) = connected_pair();

    let connection = client.server_connection().expect("server connection");
    assert_eq!(connection.remote_addr(), server_addr);
    assert!(connection.is_connected());

    let client_addr = client.local_addr().unwrap();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    server.on_connected(move |connection| sink.lock().push(connection.remote_addr()));

    assert!(wait_until(Duration::from_secs(1), || {
        server.update();
        !seen.lock().is_empty()
    }));
    assert_eq!(seen.lock()[0].port(), client_addr.port());
}

#[test]
#[serial]
fn test_wrong_password_denied() {
    let config = NetworkConfig::default_with_overrides(|c| {
        c.server.password = Some("opensesame".to_string());
        c.client.connection_attempt_timeout = Duration::from_millis(200);
    });
    let (server, server_addr) = start_server(config);
    let client = start_client(test_config());

    match client.connect(server_addr, Some("guess")) {
        Err(ProtocolError::ConnectionDenied(DenialReason::InvalidPassword)) => {}
        other => panic!("expected invalid password, got {other:?}"),
    }
    assert_eq!(server.connection_count(), 0);

    client
        .connect(server_addr, Some("opensesame"))
        .expect("correct password accepted");
}

#[test]
#[serial]
fn test_silent_endpoint_times_out() {
    // bound but never answers
    let silent = UdpSocket::bind(LOCALHOST).unwrap();
    let client = start_client(NetworkConfig::default_with_overrides(|c| {
        c.client.max_connection_attempts = 2;
        c.client.connection_attempt_timeout = Duration::from_millis(100);
    }));

    let started = Instant::now();
    let result = client.connect(silent.local_addr().unwrap(), None);
    assert!(matches!(result, Err(ProtocolError::Timeout)));
    assert!(started.elapsed() >= Duration::from_millis(200));
    assert!(client.server_connection().is_none());
}

#[test]
#[serial]
fn test_lifecycle_misuse() {
    let client = Client::new(test_config(), ClientRole::new());
    let server_addr: SocketAddr = "127.0.0.1:9".parse().unwrap();
    assert!(matches!(
        client.connect(server_addr, None),
        Err(ProtocolError::NotRunning)
    ));

    client.start(LOCALHOST.parse().unwrap()).unwrap();
    assert!(matches!(
        client.start(LOCALHOST.parse().unwrap()),
        Err(ProtocolError::AlreadyRunning)
    ));

    client.shutdown("done");
    assert!(!client.is_running());
    assert!(client.local_addr().is_none());
}

#[test]
#[serial]
fn test_ordered_packets_arrive_in_order() {
    let (client, server, _) = connected_pair();
    let connection = client.server_connection().unwrap();

    for n in 0..100u32 {
        let mut packet = OutboundPacket::custom(DeliveryMethod::ReliableOrdered);
        packet.write_u32(n);
        connection.send_packet(packet).unwrap();
    }

    let mut received = Vec::new();
    assert!(wait_until(Duration::from_secs(5), || {
        while let Some(packet) = server.read_packet() {
            received.push(packet.reader().read_u32().unwrap());
        }
        received.len() == 100
    }));
    assert_eq!(received, (0..100).collect::<Vec<_>>());
}

#[test]
#[serial]
fn test_large_packet_fragmented_over_udp() {
    let (client, server, _) = connected_pair();
    let connection = client.server_connection().unwrap();

    let blob: Vec<u8> = (0..20_000u32).map(|i| (i % 253) as u8).collect();
    let mut packet = OutboundPacket::custom(DeliveryMethod::Reliable);
    packet.write_block(&blob);
    connection.send_packet(packet).unwrap();

    let mut payload = None;
    assert!(wait_until(Duration::from_secs(3), || {
        payload = server.read_packet();
        payload.is_some()
    }));
    let packet = payload.unwrap();
    assert_eq!(packet.reader().read_block().unwrap(), blob.as_slice());
}

#[test]
#[serial]
fn test_server_replies_to_sender() {
    let (client, server, _) = connected_pair();
    let connection = client.server_connection().unwrap();

    let mut packet = OutboundPacket::custom(DeliveryMethod::Reliable);
    packet.write_string("ping");
    connection.send_packet(packet).unwrap();

    let mut request = None;
    assert!(wait_until(Duration::from_secs(2), || {
        request = server.read_packet();
        request.is_some()
    }));
    let sender = request.unwrap().sender();

    let mut reply = OutboundPacket::custom(DeliveryMethod::Reliable);
    reply.write_string("pong");
    server.send_to(&sender, reply).unwrap();

    let mut text = None;
    assert!(wait_until(Duration::from_secs(2), || {
        if let Some(packet) = client.read_packet() {
            text = Some(packet.reader().read_string().unwrap());
        }
        text.is_some()
    }));
    assert_eq!(text.as_deref(), Some("pong"));
}

#[test]
#[serial]
fn test_rpc_function_over_udp() {
    let (client, server, _) = connected_pair();
    let connection = client.server_connection().unwrap();

    server
        .channel(ChannelKind::Normal, 1)
        .add_remote_function("concat", |_, reader, argc| {
            let args = RpcValue::read_all(reader, argc).unwrap();
            let joined: String = args.iter().filter_map(RpcValue::as_str).collect();
            vec![RpcValue::String(joined)]
        });

    let result = Arc::new(Mutex::new(None));
    let slot = Arc::clone(&result);
    client
        .channel(ChannelKind::Normal, 1)
        .call_function(
            "concat",
            &connection,
            move |_, reader, argc| {
                let values = RpcValue::read_all(reader, argc).unwrap();
                *slot.lock() = values.into_iter().next();
            },
            &[RpcValue::String("udp-".into()), RpcValue::String("rpc".into())],
        )
        .unwrap();

    assert!(wait_until(Duration::from_secs(3), || {
        server.update();
        client.update();
        result.lock().is_some()
    }));
    assert_eq!(*result.lock(), Some(RpcValue::String("udp-rpc".into())));
    assert_eq!(client.channel(ChannelKind::Normal, 1).pending_calls(), 0);
}

#[test]
#[serial]
fn test_encrypted_packets_with_shared_key() {
    let key = ChaChaCipher::generate_key().unwrap();
    let config = test_config();
    let server = Server::new(config.clone(), ServerRole::new(&config))
        .with_cipher(ChaChaCipher::new(&key));
    let server_addr = server.start(LOCALHOST.parse().unwrap()).unwrap();
    let client = Client::new(test_config(), ClientRole::new()).with_cipher(ChaChaCipher::new(&key));
    client.start(LOCALHOST.parse().unwrap()).unwrap();

    let connection = client.connect(server_addr, None).unwrap();
    let mut packet = OutboundPacket::custom(DeliveryMethod::Reliable).encrypted();
    packet.write_string("classified");
    connection.send_packet(packet).unwrap();

    let mut text = None;
    assert!(wait_until(Duration::from_secs(2), || {
        if let Some(packet) = server.read_packet() {
            text = Some(packet.reader().read_string().unwrap());
        }
        text.is_some()
    }));
    assert_eq!(text.as_deref(), Some("classified"));
}

#[test]
#[serial]
fn test_disconnect_reason_reaches_server() {
    let (client, server, _) = connected_pair();

    let reasons = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&reasons);
    server.on_disconnected(move |_, reason, lost| sink.lock().push((reason.to_string(), lost)));

    assert!(client.disconnect("leaving"));
    assert!(!client.disconnect("again"));

    assert!(wait_until(Duration::from_secs(2), || {
        server.update();
        !reasons.lock().is_empty()
    }));
    assert_eq!(reasons.lock()[0], ("leaving".to_string(), false));
    assert!(wait_until(Duration::from_secs(1), || server.connection_count() == 0));
}

#[test]
#[serial]
fn test_send_after_disconnect_rejected() {
    let (client, _server, _) = connected_pair();
    let connection = client.server_connection().unwrap();
    assert!(connection.disconnect("bye"));

    let packet = OutboundPacket::custom(DeliveryMethod::Reliable);
    assert!(matches!(
        connection.send_packet(packet),
        Err(ProtocolError::ConnectionClosed)
    ));
}

#[test]
#[serial]
fn test_mtu_discovery_reports_event() {
    let (client, _server, server_addr) = connected_pair();
    let max_mtu = client.config().transport.max_mtu;

    let mut settled = None;
    assert!(wait_until(Duration::from_secs(5), || {
        while let Some(event) = client.poll_event() {
            if let MessengerEvent::MtuSet { endpoint, mtu } = event {
                assert_eq!(endpoint, server_addr);
                settled = Some(mtu);
            }
        }
        settled.is_some()
    }));
    // loopback carries the largest configured probe
    assert_eq!(settled, Some(max_mtu));
    assert_eq!(client.server_connection().unwrap().mtu(), max_mtu);
}

#[test]
#[serial]
fn test_garbage_datagrams_counted_and_ignored() {
    let (server, server_addr) = start_server(NetworkConfig::default_with_overrides(|c| {
        c.flood.warning_threshold = 5;
    }));
    let attacker = UdpSocket::bind(LOCALHOST).unwrap();
    for _ in 0..20 {
        attacker.send_to(&[0xFF, 0xFF, 0xFF], server_addr).unwrap();
    }

    assert!(wait_until(Duration::from_secs(2), || {
        let snapshot = server.metrics().snapshot();
        snapshot.malformed_datagrams >= 6 && snapshot.ignored_datagrams > 0
    }));
    assert_eq!(server.connection_count(), 0);
}
