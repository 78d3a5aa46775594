#![no_main]

use libfuzzer_sys::fuzz_target;
use udp_messenger::core::buffer::PacketReader;
use udp_messenger::protocol::handshake::{ConnectionRequest, DenialReason};
use udp_messenger::RpcValue;

fuzz_target!(|data: &[u8]| {
    // Fuzz handshake and rpc body decoding
    let _ = ConnectionRequest::read(&mut PacketReader::new(data));
    let _ = DenialReason::read(&mut PacketReader::new(data));

    if let Some((&argc, rest)) = data.split_first() {
        let _ = RpcValue::read_all(&mut PacketReader::new(rest), argc);
    }
});
