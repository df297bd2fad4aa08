#![no_main]

use iorecorder::cst::CallSignatureTable;
use iorecorder::grammar::Grammar;
use iorecorder::persist::decode_merged_timestamps;
use iorecorder::signature::decode_key;
use iorecorder::timestamps::TimestampStream;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    // None of the decoders may panic on arbitrary bytes
    let _ = decode_key(data);
    let _ = CallSignatureTable::deserialize(data, 0);
    let _ = decode_merged_timestamps(data);

    if let Ok(stream) = TimestampStream::from_payload(data, 1e-7) {
        let _ = stream.count();
    }

    if let Ok(grammar) = Grammar::from_bytes(data) {
        // Accepted grammars are acyclic, so expansion terminates
        let _ = grammar.iter().take(1 << 16).count();
    }
});
