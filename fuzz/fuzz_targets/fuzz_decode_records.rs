#![no_main]
use libfuzzer_sys::fuzz_target;
use nvpk_rs::core::entry::FileEntry;
use nvpk_rs::core::header::Header;
use nvpk_rs::core::signature::decode_chain;

// Record decoders must reject arbitrary bytes without panicking
fuzz_target!(|data: &[u8]| {
    let _ = Header::from_bytes(data);
    if let Ok((entry, used)) = FileEntry::decode(data) {
        assert!(used <= data.len());
        let _ = entry.encode();
    }
    let _ = decode_chain(data);
});
