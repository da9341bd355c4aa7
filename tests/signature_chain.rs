//! Signature chain behaviour against real package files

use nvpk_rs::{
    AddFileOptions, ErrorKind, KeyRing, Package, SignatureStatus, SignatureType, X509Ed25519Key,
};
use std::fs::OpenOptions;
use std::io::{Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::Arc;
use tempfile::tempdir;

fn signed_package(path: &Path, keys: &[X509Ed25519Key]) {
    let mut package = Package::new();
    package
        .add_file("app/main.wasm", b"\0asm\x01\0\0\0 module", &AddFileOptions::new())
        .unwrap();
    package.set_comment("release 1.4.2").unwrap();
    for (i, key) in keys.iter().enumerate() {
        package.sign(key, &format!("signer {}", i)).unwrap();
    }
    package.safe_write(path).unwrap();
}

fn ring(keys: &[X509Ed25519Key]) -> KeyRing {
    let mut ring = KeyRing::new();
    for key in keys {
        ring.add(Arc::new(key.public_key()));
    }
    ring
}

#[test]
fn test_chain_validates_in_order() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("signed.nvpk");
    let keys: Vec<X509Ed25519Key> = (0..3).map(|_| X509Ed25519Key::generate()).collect();
    signed_package(&path, &keys);

    let package = Package::open_read_only(&path).unwrap();
    assert!(package.is_signed());
    assert_eq!(package.signature_count(), 3);
    let reports = package.validate_all_signatures(&ring(&keys)).unwrap();
    assert_eq!(
        reports.iter().map(|r| r.index).collect::<Vec<_>>(),
        vec![0, 1, 2]
    );
    assert!(reports.iter().all(|r| r.status.is_valid()));
    assert_eq!(reports[1].comment, "signer 1");
    assert_eq!(reports[2].signature_type, SignatureType::X509);
    assert_eq!(
        package.read_file_by_path("app/main.wasm").unwrap(),
        b"\0asm\x01\0\0\0 module"
    );
}

#[test]
fn test_remove_signature_truncates_chain() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("signed.nvpk");
    let keys: Vec<X509Ed25519Key> = (0..3).map(|_| X509Ed25519Key::generate()).collect();
    signed_package(&path, &keys);

    let mut package = Package::open(&path).unwrap();
    package.remove_signature(1).unwrap();
    assert_eq!(package.signature_count(), 1);
    package.safe_write(&path).unwrap();

    let reopened = Package::open(&path).unwrap();
    assert_eq!(reopened.signature_count(), 1);
    let status = reopened
        .validate_signature_index(0, &ring(&keys))
        .unwrap();
    assert_eq!(status, SignatureStatus::Valid);
    let err = reopened
        .validate_signature_index(1, &ring(&keys))
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

#[test]
fn test_tampering_invalidates_later_signatures() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("signed.nvpk");
    let keys: Vec<X509Ed25519Key> = (0..3).map(|_| X509Ed25519Key::generate()).collect();
    signed_package(&path, &keys);

    let package = Package::open(&path).unwrap();
    let signature_offset = package.header().signature_offset;
    // Last byte of the first block's signature data
    let first_block_end = signature_offset + package.signatures()[0].encoded_size() as u64;
    drop(package);

    let mut file = OpenOptions::new().write(true).open(&path).unwrap();
    file.seek(SeekFrom::Start(first_block_end - 1)).unwrap();
    file.write_all(&[0xA5]).unwrap();
    drop(file);

    let package = Package::open(&path).unwrap();
    let reports = package.validate_all_signatures(&ring(&keys)).unwrap();
    assert!(!reports[0].status.is_valid());
    assert!(!reports[1].status.is_valid());
    assert!(!reports[2].status.is_valid());
}

#[test]
fn test_tampering_after_first_block_spares_it() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("signed.nvpk");
    let keys: Vec<X509Ed25519Key> = (0..2).map(|_| X509Ed25519Key::generate()).collect();
    signed_package(&path, &keys);

    let len = std::fs::metadata(&path).unwrap().len();
    let mut file = OpenOptions::new().write(true).open(&path).unwrap();
    file.seek(SeekFrom::Start(len - 1)).unwrap();
    file.write_all(&[0x5A]).unwrap();
    drop(file);

    let package = Package::open(&path).unwrap();
    let reports = package.validate_all_signatures(&ring(&keys)).unwrap();
    assert!(reports[0].status.is_valid());
    assert!(!reports[1].status.is_valid());
}

#[test]
fn test_unknown_key_fails_closed() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("signed.nvpk");
    let keys = vec![X509Ed25519Key::generate()];
    signed_package(&path, &keys);

    let package = Package::open(&path).unwrap();
    let stranger = X509Ed25519Key::generate();
    let reports = package
        .validate_all_signatures(&ring(&[stranger]))
        .unwrap();
    assert!(matches!(reports[0].status, SignatureStatus::Invalid(_)));
    assert!(matches!(
        package.validate_signature_index(0, &KeyRing::new()).unwrap(),
        SignatureStatus::Invalid(_)
    ));
    assert!(matches!(
        package
            .validate_signature_with_key(0, &X509Ed25519Key::generate().public_key())
            .unwrap(),
        SignatureStatus::Invalid(_)
    ));
    assert!(package
        .validate_signature_with_key(0, &keys[0].public_key())
        .unwrap()
        .is_valid());
}

#[test]
fn test_validate_by_type() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("signed.nvpk");
    let keys: Vec<X509Ed25519Key> = (0..2).map(|_| X509Ed25519Key::generate()).collect();
    signed_package(&path, &keys);

    let package = Package::open(&path).unwrap();
    let x509 = package
        .validate_signature_type(SignatureType::X509, &ring(&keys))
        .unwrap();
    assert_eq!(x509.len(), 2);
    let pgp = package
        .validate_signature_type(SignatureType::Pgp, &ring(&keys))
        .unwrap();
    assert!(pgp.is_empty());
}

#[test]
fn test_signed_package_is_immutable_until_cleared() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("signed.nvpk");
    let keys = vec![X509Ed25519Key::generate()];
    signed_package(&path, &keys);

    let mut package = Package::open(&path).unwrap();
    let err = package
        .add_file("extra.txt", b"late addition", &AddFileOptions::new())
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Immutability);

    package.clear_signatures().unwrap();
    package
        .add_file("extra.txt", b"late addition", &AddFileOptions::new())
        .unwrap();
    package.safe_write(&path).unwrap();
    let reopened = Package::open(&path).unwrap();
    assert!(!reopened.is_signed());
    assert_eq!(reopened.header().signature_offset, 0);
    assert_eq!(reopened.file_count(), 2);
}

#[test]
fn test_signing_a_loaded_package_covers_disk_data() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("plain.nvpk");
    let mut package = Package::new();
    package
        .add_file("data.bin", &[7u8; 4096], &AddFileOptions::new())
        .unwrap();
    package.safe_write(&path).unwrap();

    let key = X509Ed25519Key::generate();
    let mut loaded = Package::open(&path).unwrap();
    loaded.sign(&key, "post-hoc").unwrap();
    loaded.safe_write(&path).unwrap();

    let reopened = Package::open(&path).unwrap();
    let reports = reopened.validate_all_signatures(&ring(&[key])).unwrap();
    assert!(reports[0].status.is_valid());
    assert_eq!(reopened.read_file_by_path("data.bin").unwrap(), vec![7u8; 4096]);
}
