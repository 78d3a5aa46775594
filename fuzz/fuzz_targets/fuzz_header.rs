#![no_main]

use std::time::Instant;

use libfuzzer_sys::fuzz_target;
use udp_messenger::core::chunk::decode_chunk;
use udp_messenger::core::fragment::FragmentTable;
use udp_messenger::core::packet::{PacketFlags, PacketHeader, HEADER_SIZE};

fuzz_target!(|data: &[u8]| {
    // Fuzz the inbound framing path: header, then chunk or fragment body
    let Ok(header) = PacketHeader::parse(data) else {
        return;
    };
    let body = &data[HEADER_SIZE..];

    if header.flags.contains(PacketFlags::CHUNKED) {
        if let Ok(entries) = decode_chunk(body) {
            for entry in entries {
                let _ = PacketHeader::parse(entry);
            }
        }
    }

    if header.flags.contains(PacketFlags::PARTIAL) {
        let table = FragmentTable::new();
        let _ = table.accept(body, Instant::now());
    }
});
