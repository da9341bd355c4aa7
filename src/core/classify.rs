//! File-type tags and the classifier seam
//!
//! Content sniffing lives outside the crate. The core only needs a tag per
//! file: it is stored in the FileEntry `Type` field and feeds automatic
//! compression selection.

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u16)]
pub enum FileTypeTag {
    #[default]
    Unknown = 0,
    Text = 1,
    Binary = 2,
    Image = 3,
    Audio = 4,
    Video = 5,
    Archive = 6,
    Executable = 7,
    Document = 8,
}

impl FileTypeTag {
    pub fn from_u16(value: u16) -> Self {
        match value {
            1 => FileTypeTag::Text,
            2 => FileTypeTag::Binary,
            3 => FileTypeTag::Image,
            4 => FileTypeTag::Audio,
            5 => FileTypeTag::Video,
            6 => FileTypeTag::Archive,
            7 => FileTypeTag::Executable,
            8 => FileTypeTag::Document,
            _ => FileTypeTag::Unknown,
        }
    }

    /// Content that is normally stored already compressed
    pub fn is_compressed_media(self) -> bool {
        matches!(
            self,
            FileTypeTag::Image | FileTypeTag::Audio | FileTypeTag::Video | FileTypeTag::Archive
        )
    }
}

/// Supplies a type tag from a file name and a content sample
pub trait FileClassifier: Send + Sync {
    fn classify(&self, name: &str, sample: &[u8]) -> FileTypeTag;
}

/// Classifier used when none is configured
#[derive(Debug, Clone, Copy, Default)]
pub struct NullClassifier;

impl FileClassifier for NullClassifier {
    fn classify(&self, _name: &str, _sample: &[u8]) -> FileTypeTag {
        FileTypeTag::Unknown
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tag_codes() {
        assert_eq!(FileTypeTag::from_u16(3), FileTypeTag::Image);
        assert_eq!(FileTypeTag::from_u16(999), FileTypeTag::Unknown);
        assert_eq!(FileTypeTag::Video as u16, 5);
    }

    #[test]
    fn test_null_classifier() {
        assert_eq!(
            NullClassifier.classify("a.png", &[0x89, b'P', b'N', b'G']),
            FileTypeTag::Unknown
        );
        assert!(FileTypeTag::Archive.is_compressed_media());
        assert!(!FileTypeTag::Text.is_compressed_media());
    }
}
