//! Multi-stage content deduplication
//!
//! Stages, in pipeline order:
//! - **raw**: original content, before compression
//! - **processed**: compressed bytes, before encryption
//! - **final**: the exact bytes that would be stored
//!
//! Each stage maps an XXH3 digest (pre-filter) to canonical slots that also
//! carry a SHA-256 digest; two payloads only match when both agree. Every key
//! also carries the encryption type, and processed and final keys carry the
//! codec settings, so bytes produced under a different compression type or
//! level never match.

use crate::compression::CompressionType;
use crate::encryption::EncryptionType;
use ahash::AHashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::debug;
use xxhash_rust::xxh3::xxh3_64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DedupConfig {
    pub raw: bool,
    pub processed: bool,
    #[serde(rename = "final")]
    pub final_stage: bool,
}

impl Default for DedupConfig {
    fn default() -> Self {
        DedupConfig {
            raw: true,
            processed: false,
            final_stage: false,
        }
    }
}

impl DedupConfig {
    pub fn disabled() -> Self {
        DedupConfig {
            raw: false,
            processed: false,
            final_stage: false,
        }
    }

    pub fn all() -> Self {
        DedupConfig {
            raw: true,
            processed: true,
            final_stage: true,
        }
    }

    pub fn enabled(&self, stage: DedupStage) -> bool {
        match stage {
            DedupStage::Raw => self.raw,
            DedupStage::Processed => self.processed,
            DedupStage::Final => self.final_stage,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DedupStage {
    Raw,
    Processed,
    Final,
}

impl DedupStage {
    pub const ALL: [DedupStage; 3] = [DedupStage::Raw, DedupStage::Processed, DedupStage::Final];

    fn slot(self) -> usize {
        match self {
            DedupStage::Raw => 0,
            DedupStage::Processed => 1,
            DedupStage::Final => 2,
        }
    }
}

/// Fast and collision-resistant digests of one payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContentDigest {
    pub fast: u64,
    pub strong: [u8; 32],
}

impl ContentDigest {
    pub fn compute(data: &[u8]) -> Self {
        ContentDigest {
            fast: xxh3_64(data),
            strong: Sha256::digest(data).into(),
        }
    }
}

/// Codec settings a processed or final payload was produced under
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct StageVariant {
    pub compression: u8,
    pub level: u8,
    pub encryption: u8,
}

impl StageVariant {
    /// Raw content keyed by the encryption it will be stored under
    pub fn raw(encryption: EncryptionType) -> Self {
        StageVariant {
            compression: 0,
            level: 0,
            encryption: encryption as u8,
        }
    }

    /// Key for processed and final stage payloads
    pub fn coded(compression: CompressionType, level: u8, encryption: EncryptionType) -> Self {
        StageVariant {
            compression: compression as u8,
            level,
            encryption: encryption as u8,
        }
    }
}

/// Result of [`DedupEngine::claim_or_join`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Claim {
    /// The caller's file is now the canonical copy
    Canonical,
    /// Identical content is already held by this FileID
    Existing(u64),
}

#[derive(Debug, Clone, Copy)]
struct Slot {
    strong: [u8; 32],
    file_id: u64,
}

type StageMap = AHashMap<(u64, StageVariant), Vec<Slot>>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DedupStats {
    pub raw_hits: u64,
    pub processed_hits: u64,
    pub final_hits: u64,
    pub bytes_saved: u64,
}

/// Hash-to-canonical maps for the three stages
#[derive(Default)]
pub struct DedupEngine {
    stages: [Mutex<StageMap>; 3],
    stats: Mutex<DedupStats>,
}

impl DedupEngine {
    pub fn new() -> Self {
        DedupEngine::default()
    }

    /// Canonical FileID holding identical content, if any
    pub fn lookup(
        &self,
        stage: DedupStage,
        variant: StageVariant,
        digest: &ContentDigest,
    ) -> Option<u64> {
        let map = self.stages[stage.slot()].lock();
        map.get(&(digest.fast, variant)).and_then(|slots| {
            slots
                .iter()
                .find(|slot| slot.strong == digest.strong)
                .map(|slot| slot.file_id)
        })
    }

    /// Atomically register `file_id` as canonical or return the existing holder
    ///
    /// A fast-hash collision with a different strong digest registers a new
    /// canonical slot under the same key.
    pub fn claim_or_join(
        &self,
        stage: DedupStage,
        variant: StageVariant,
        digest: &ContentDigest,
        file_id: u64,
    ) -> Claim {
        let mut map = self.stages[stage.slot()].lock();
        let slots = map.entry((digest.fast, variant)).or_default();
        if let Some(existing) = slots.iter().find(|slot| slot.strong == digest.strong) {
            return Claim::Existing(existing.file_id);
        }
        slots.push(Slot {
            strong: digest.strong,
            file_id,
        });
        debug!(?stage, file_id, "Registered canonical content");
        Claim::Canonical
    }

    /// Drop every slot owned by `file_id`
    pub fn release(&self, file_id: u64) {
        for stage in &self.stages {
            let mut map = stage.lock();
            map.retain(|_, slots| {
                slots.retain(|slot| slot.file_id != file_id);
                !slots.is_empty()
            });
        }
    }

    pub fn record_hit(&self, stage: DedupStage, bytes_saved: u64) {
        let mut stats = self.stats.lock();
        match stage {
            DedupStage::Raw => stats.raw_hits += 1,
            DedupStage::Processed => stats.processed_hits += 1,
            DedupStage::Final => stats.final_hits += 1,
        }
        stats.bytes_saved += bytes_saved;
    }

    pub fn stats(&self) -> DedupStats {
        *self.stats.lock()
    }

    pub fn canonical_count(&self, stage: DedupStage) -> usize {
        self.stages[stage.slot()]
            .lock()
            .values()
            .map(Vec::len)
            .sum()
    }

    pub fn clear(&self) {
        for stage in &self.stages {
            stage.lock().clear();
        }
        *self.stats.lock() = DedupStats::default();
    }
}
