#![no_main]

use libfuzzer_sys::fuzz_target;
use udp_messenger::utils::compression::{maybe_compress, CompressionKind};

const LIMIT: usize = 1024 * 1024;

fuzz_target!(|data: &[u8]| {
    for kind in [CompressionKind::Lz4, CompressionKind::Zstd] {
        let compressor = kind.compressor();

        // Round trip whatever passes the entropy gate
        if let (true, Ok(Some(compressed))) =
            (data.len() <= LIMIT, maybe_compress(data, compressor.as_ref(), 0))
        {
            let restored = compressor.decompress(&compressed, LIMIT);
            assert_eq!(restored.ok().as_deref(), Some(data));
        }

        // Raw decompression of hostile input must respect the limit
        if let Ok(out) = compressor.decompress(data, LIMIT) {
            assert!(out.len() <= LIMIT);
        }
    }
});
