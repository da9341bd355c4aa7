//! Malformed and corrupted package files must be rejected with structured errors

use nvpk_rs::core::header::HEADER_SIZE;
use nvpk_rs::{
    AddFileOptions, CompressionChoice, ErrorKind, Package, PackageConfig, PackageError,
};
use std::fs::OpenOptions;
use std::io::{Seek, SeekFrom, Write};
use std::path::Path;
use tempfile::tempdir;

/// Helper: overwrite bytes at `offset`
fn patch(path: &Path, offset: u64, bytes: &[u8]) {
    let mut file = OpenOptions::new().write(true).open(path).unwrap();
    file.seek(SeekFrom::Start(offset)).unwrap();
    file.write_all(bytes).unwrap();
    file.flush().unwrap();
}

fn written_package(path: &Path, config: PackageConfig) {
    let mut package = Package::with_config(config).unwrap();
    package
        .add_file("a.txt", b"first file content", &AddFileOptions::new())
        .unwrap();
    package
        .add_file("b.txt", b"second file content", &AddFileOptions::new())
        .unwrap();
    package.set_comment("corruption fixture").unwrap();
    package
        .write(path, CompressionChoice::None, false)
        .unwrap();
}

#[test]
fn test_bad_magic_is_format_error() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("bad.nvpk");
    written_package(&path, PackageConfig::default());
    patch(&path, 0, b"ZIP!");

    let err = Package::open(&path).err().unwrap();
    assert!(matches!(err, PackageError::InvalidMagic { .. }));
    assert_eq!(err.kind(), ErrorKind::Format);
    assert!(err.to_string().contains("Magic mismatch"));
}

#[test]
fn test_missing_package_is_not_found() {
    let dir = tempdir().unwrap();
    let err = Package::open(dir.path().join("absent.nvpk")).err().unwrap();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

#[test]
fn test_reserved_header_field_rejected() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("reserved.nvpk");
    written_package(&path, PackageConfig::default());
    // Header.Reserved follows LocaleID at offset 44
    patch(&path, 44, &1u32.to_le_bytes());

    let err = Package::open(&path).err().unwrap();
    assert!(matches!(
        err,
        PackageError::ReservedNotZero {
            structure: "Header",
            field: "Reserved",
            ..
        }
    ));
}

#[test]
fn test_truncated_package_rejected() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("short.nvpk");
    written_package(&path, PackageConfig::default());
    let len = std::fs::metadata(&path).unwrap().len();
    OpenOptions::new()
        .write(true)
        .open(&path)
        .unwrap()
        .set_len(len - 10)
        .unwrap();

    let err = Package::open(&path).err().unwrap();
    assert_eq!(err.kind(), ErrorKind::Validation);
}

#[test]
fn test_flipped_data_byte_fails_package_crc() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("crc.nvpk");
    written_package(&path, PackageConfig::default());
    // The first entry's data block ends right before the second entry
    let package = Package::open(&path).unwrap();
    let first = package.file_by_path("a.txt").unwrap();
    let data_offset = HEADER_SIZE as u64 + first.encoded_size().unwrap() as u64;
    drop(package);
    patch(&path, data_offset, b"F");

    let err = Package::open(&path).err().unwrap();
    assert!(matches!(err, PackageError::ChecksumMismatch { .. }));
    assert_eq!(err.kind(), ErrorKind::Corruption);
}

#[test]
fn test_flipped_data_byte_without_package_crc_fails_on_read() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("nocrc.nvpk");
    let mut config = PackageConfig::default();
    config.write.compute_crc = false;
    written_package(&path, config);

    let package = Package::open(&path).unwrap();
    assert_eq!(package.header().package_crc, 0);
    let first = package.file_by_path("a.txt").unwrap();
    let data_offset = HEADER_SIZE as u64 + first.encoded_size().unwrap() as u64;
    drop(package);
    patch(&path, data_offset, b"F");

    let package = Package::open(&path).unwrap();
    let err = package.read_file_by_path("a.txt").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Corruption);
    assert_eq!(
        package.read_file_by_path("b.txt").unwrap(),
        b"second file content"
    );
}

#[test]
fn test_index_pointing_at_wrong_entry_is_inconsistent() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("index.nvpk");
    let mut config = PackageConfig::default();
    config.write.compute_crc = false;
    written_package(&path, config);

    let package = Package::open(&path).unwrap();
    let index_start = package.header().index_start;
    drop(package);
    // First record's FileID sits right after the 16-byte index prefix
    patch(&path, index_start + 16, &99u64.to_le_bytes());

    let err = Package::open(&path).err().unwrap();
    assert!(matches!(err, PackageError::InconsistentIndex(_)));
}

#[test]
fn test_oversized_stored_size_is_validation_error() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("stored_size.nvpk");
    let mut config = PackageConfig::default();
    config.write.compute_crc = false;
    written_package(&path, config);
    // StoredSize sits at offset 16 of the first entry's fixed prefix
    patch(&path, HEADER_SIZE as u64 + 16, &u64::MAX.to_le_bytes());

    let err = Package::open_read_only(&path).err().unwrap();
    assert!(matches!(
        err,
        PackageError::OutOfBounds {
            field: "StoredSize",
            ..
        }
    ));
    assert_eq!(err.kind(), ErrorKind::Validation);
}

#[test]
fn test_largest_file_id_opens_but_allows_no_new_ids() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("max_id.nvpk");
    let mut config = PackageConfig::default();
    config.write.compute_crc = false;
    written_package(&path, config);

    let package = Package::open(&path).unwrap();
    let index_start = package.header().index_start;
    drop(package);
    // Second index record: FileID then the offset of its entry
    let raw = std::fs::read(&path).unwrap();
    let record = index_start as usize + 16 + 16;
    let mut offset = [0u8; 8];
    offset.copy_from_slice(&raw[record + 8..record + 16]);
    let entry_offset = u64::from_le_bytes(offset);
    patch(&path, record as u64, &u64::MAX.to_le_bytes());
    patch(&path, entry_offset, &u64::MAX.to_le_bytes());

    let mut package = Package::open(&path).unwrap();
    assert_eq!(
        package.read_file(u64::MAX).unwrap(),
        b"second file content"
    );
    let err = package
        .add_file("c.txt", b"third", &AddFileOptions::new())
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);
}
