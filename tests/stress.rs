#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::collections::HashMap;
use std::thread;
use std::time::{Duration, Instant};

use serial_test::serial;
use udp_messenger::core::chunk::{decode_chunk, encode_chunk};
use udp_messenger::core::fragment::{split, FragmentTable};
use udp_messenger::core::packet::HEADER_SIZE;
use udp_messenger::{
    Client, ClientRole, DeliveryMethod, NetworkConfig, OutboundPacket, Server, ServerRole,
};

#[test]
fn stress_fragment_and_chunk_large_series() {
    // heavy burst of framing work, no panics and every payload intact
    let table = FragmentTable::new();
    let now = Instant::now();

    for (group, size) in [1usize, 64, 512, 4096, 65_536, 250_000].into_iter().enumerate() {
        let data = vec![(size & 0xFF) as u8; size];
        let mut whole = None;
        for body in split(&data, group as u16, 1400).unwrap() {
            whole = table.accept(&body, now).unwrap().or(whole);
        }
        assert_eq!(whole.unwrap().len(), size);
    }
    assert_eq!(table.pending_groups(), 0);

    for round in 0..10_000u16 {
        let entries = vec![round.to_le_bytes().to_vec(); (round % 16) as usize];
        let chunk = encode_chunk(round, &entries);
        assert_eq!(decode_chunk(&chunk[HEADER_SIZE..]).unwrap().len(), entries.len());
    }
}

#[test]
#[serial]
fn stress_many_clients_one_server() {
    let clients = 16usize;
    let per_client = 50u32;

    let config = NetworkConfig::default_with_overrides(|c| {
        c.server.max_connections = clients;
        c.client.connection_attempt_timeout = Duration::from_millis(250);
    });
    let server = Server::new(config.clone(), ServerRole::new(&config));
    let server_addr = server.start("127.0.0.1:0".parse().unwrap()).unwrap();

    let handles: Vec<_> = (0..clients)
        .map(|_| {
            let config = config.clone();
            thread::spawn(move || {
                let client = Client::new(config, ClientRole::new());
                client.start("127.0.0.1:0".parse().unwrap()).unwrap();
                let connection = client.connect(server_addr, None).unwrap();
                for n in 0..per_client {
                    let mut packet = OutboundPacket::custom(DeliveryMethod::ReliableOrdered);
                    packet.write_u32(n);
                    connection.send_packet(packet).unwrap();
                }
                // keep the socket alive until everything is acked
                let deadline = Instant::now() + Duration::from_secs(10);
                while connection.pending_reliable() > 0 && Instant::now() < deadline {
                    thread::sleep(Duration::from_millis(10));
                }
                client
            })
        })
        .collect();

    let mut per_sender: HashMap<_, Vec<u32>> = HashMap::new();
    let deadline = Instant::now() + Duration::from_secs(15);
    let expected = clients * per_client as usize;
    let mut total = 0;
    while total < expected && Instant::now() < deadline {
        while let Some(packet) = server.read_packet() {
            per_sender
                .entry(packet.sender())
                .or_default()
                .push(packet.reader().read_u32().unwrap());
            total += 1;
        }
        thread::sleep(Duration::from_millis(5));
    }

    let _clients: Vec<Client> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    assert_eq!(server.connection_count(), clients);
    assert_eq!(per_sender.len(), clients);
    for numbers in per_sender.values() {
        assert_eq!(*numbers, (0..per_client).collect::<Vec<_>>());
    }
}
