#![no_main]
use libfuzzer_sys::fuzz_target;
use nvpk_rs::Package;
use std::io::Write;

fuzz_target!(|data: &[u8]| {
    let mut file = match tempfile::NamedTempFile::new() {
        Ok(f) => f,
        Err(_) => return,
    };
    if file.write_all(data).is_err() {
        return;
    }

    // Opening and reading a malformed package must fail cleanly
    if let Ok(package) = Package::open_read_only(file.path()) {
        let ids: Vec<u64> = package.files().map(|e| e.file_id).collect();
        for id in ids {
            let _ = package.read_file(id);
        }
    }
});
