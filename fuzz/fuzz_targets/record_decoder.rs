//! Fuzz testing for the record decoder.
//!
//! Feeds arbitrary bytes to the header parser and, when a header parses,
//! to the key and body readers in every retrieval mode. Malformed records
//! must surface as errors, never as panics or oversized allocations.

#![no_main]

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;

use htod::codec::record::{read_body, read_key, read_link, RecordMeta, RetrieveMode};

#[derive(Debug, Arbitrary)]
struct DecoderInput {
    carry_cache_section: bool,
    data: Vec<u8>,
}

fuzz_target!(|input: DecoderInput| {
    let data = input.data.as_slice();
    let _ = read_link(data, 0);

    let Ok(meta) = RecordMeta::read(data, 0) else {
        return;
    };
    // Lengths are only trusted up to what the buffer could hold.
    if meta.data_size as usize > data.len() {
        return;
    }

    let mut key = Vec::new();
    if read_key(data, 0, &meta, &mut key).is_err() {
        return;
    }
    for mode in [RetrieveMode::Key, RetrieveMode::KeyValue, RetrieveMode::All] {
        let _ = read_body(data, 0, &meta, mode, input.carry_cache_section);
    }
});
