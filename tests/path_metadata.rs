//! Path metadata persisted through the special metadata file

use nvpk_rs::core::header::{FLAG_HAS_EXTENDED_ATTRS, FLAG_HAS_SPECIAL_METADATA};
use nvpk_rs::core::path_metadata::{PATH_METADATA_FILE_NAME, PATH_METADATA_FILE_TYPE};
use nvpk_rs::{
    AddFileOptions, CompressionChoice, DirectoryDetails, ErrorKind, Package, PathFileSystem,
    PathInheritance, PathMetadataEntry, WriteStrategy, X509Ed25519Key,
};
use tempfile::tempdir;

fn sample_package() -> Package {
    let mut package = Package::new();
    for (path, body) in [
        ("assets/textures/stone.png", &b"stone"[..]),
        ("assets/sounds/step.ogg", &b"step"[..]),
        ("bin/launch.sh", &b"#!/bin/sh\nexec game\n"[..]),
    ] {
        package.add_file(path, body, &AddFileOptions::new()).unwrap();
    }
    package
        .add_directory_metadata(
            "assets",
            [("license".to_string(), "cc-by-4.0".to_string())],
            Some(PathInheritance::new(1)),
            Some(DirectoryDetails {
                description: Some("Game assets".into()),
                ..DirectoryDetails::default()
            }),
        )
        .unwrap();
    package
        .add_path_metadata(PathMetadataEntry::file("bin/launch.sh").with_filesystem(
            PathFileSystem {
                is_executable: true,
                mode: Some(0o755),
                extended_attrs: [("user.signed-by".to_string(), "ci".to_string())].into(),
                ..PathFileSystem::default()
            },
        ))
        .unwrap();
    package
}

#[test]
fn test_path_metadata_survives_write_and_open() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("game.nvpk");
    let mut package = sample_package();
    let expected = package.path_metadata().to_vec();
    package
        .write(&path, CompressionChoice::Unspecified, false)
        .unwrap();

    let reopened = Package::open_read_only(&path).unwrap();
    assert_eq!(reopened.path_metadata(), expected.as_slice());
    assert!(reopened.header().has_feature(FLAG_HAS_SPECIAL_METADATA));
    assert!(reopened.header().has_feature(FLAG_HAS_EXTENDED_ATTRS));

    let special = reopened.file_by_path(PATH_METADATA_FILE_NAME).unwrap();
    assert_eq!(special.file_type, PATH_METADATA_FILE_TYPE);

    let inherited = reopened
        .inherited_properties("assets/textures/stone.png")
        .unwrap();
    assert_eq!(inherited["license"], "cc-by-4.0");
    assert!(reopened
        .path_metadata_for("bin/launch.sh")
        .unwrap()
        .filesystem
        .is_executable);
}

#[test]
fn test_metadata_changes_fast_write_in_place() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("game.nvpk");
    let mut package = sample_package();
    package.safe_write(&path).unwrap();

    let mut package = Package::open(&path).unwrap();
    package
        .update_path_metadata("assets", |entry| {
            entry.properties.insert("owner".into(), "art-team".into());
        })
        .unwrap();
    assert_eq!(
        package
            .write(&path, CompressionChoice::Unspecified, false)
            .unwrap(),
        WriteStrategy::FastWrite
    );

    let reopened = Package::open_read_only(&path).unwrap();
    let assets = reopened.path_metadata_for("assets/").unwrap();
    assert_eq!(assets.properties["owner"], "art-team");
    assert_eq!(assets.properties["license"], "cc-by-4.0");
}

#[test]
fn test_removing_all_metadata_drops_the_special_file() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("game.nvpk");
    let mut package = sample_package();
    package.remove_path_metadata("assets").unwrap();
    package.remove_path_metadata("bin/launch.sh").unwrap();
    assert!(package.file_by_path(PATH_METADATA_FILE_NAME).is_none());
    assert!(!package.header().has_feature(FLAG_HAS_SPECIAL_METADATA));
    package.safe_write(&path).unwrap();

    let reopened = Package::open_read_only(&path).unwrap();
    assert!(reopened.path_metadata().is_empty());
    assert!(!reopened.header().has_feature(FLAG_HAS_SPECIAL_METADATA));
    assert_eq!(reopened.file_count(), 3);
}

#[test]
fn test_directories_listed_after_reopen() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("game.nvpk");
    let mut package = sample_package();
    package.safe_write(&path).unwrap();

    let reopened = Package::open_read_only(&path).unwrap();
    let paths: Vec<String> = reopened
        .list_directories()
        .into_iter()
        .map(|info| info.path)
        .collect();
    assert_eq!(
        paths,
        vec!["assets/", "assets/sounds/", "assets/textures/", "bin/"]
    );
    let assets = reopened.path_info("assets").unwrap();
    assert!(assets.entry.is_some());
    assert_eq!(assets.file_count, 0);
    assert_eq!(assets.subdirectories.len(), 2);
}

#[test]
fn test_signed_and_read_only_packages_reject_metadata_changes() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("game.nvpk");
    let mut package = sample_package();
    package.safe_write(&path).unwrap();

    let mut read_only = Package::open_read_only(&path).unwrap();
    let err = read_only
        .add_path_metadata(PathMetadataEntry::directory("docs"))
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Immutability);

    package.sign(&X509Ed25519Key::generate(), "release").unwrap();
    let err = package.remove_path_metadata("assets").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Immutability);
    assert_eq!(package.path_metadata().len(), 2);
}
