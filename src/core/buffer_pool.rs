//! Size-classed byte buffer pool for streaming compression
//!
//! Buffers are grouped into power-of-two size classes. Each class keeps its
//! idle buffers in a small LRU list; eviction works across classes by last
//! use, after first dropping anything idle longer than the configured
//! timeout.
//!
//! **Accounting**: the pool tracks both idle bytes and bytes currently
//! checked out. `acquire` fails only when evicting every idle buffer still
//! would not make room under `max_total_bytes`.

use crate::error::{PackageError, Result};
use lru::LruCache;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::num::NonZeroUsize;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};
use validator::Validate;

/// Smallest size class (4 KiB)
pub const MIN_CLASS_SIZE: usize = 4 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct BufferPoolConfig {
    /// Upper bound for idle plus checked-out bytes
    #[validate(range(min = 4096))]
    pub max_total_bytes: usize,
    /// Idle buffers older than this are swept
    #[validate(range(min = 1))]
    pub idle_timeout_secs: u64,
    #[validate(range(min = 1, max = 1024))]
    pub max_buffers_per_class: usize,
}

impl Default for BufferPoolConfig {
    fn default() -> Self {
        BufferPoolConfig {
            max_total_bytes: 256 * 1024 * 1024,
            idle_timeout_secs: 30,
            max_buffers_per_class: 16,
        }
    }
}

impl BufferPoolConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

/// Size class that serves a request of `size` bytes
pub fn size_class(size: usize) -> usize {
    size.max(MIN_CLASS_SIZE).next_power_of_two()
}

/// An idle buffer considered for eviction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EvictionCandidate {
    pub class: usize,
    pub id: u64,
    pub bytes: usize,
    pub last_used: Instant,
}

/// Pick idle buffers to drop
///
/// Everything idle for longer than `idle_timeout` goes first; after that the
/// least recently used buffers are taken until `current_total + needed`
/// fits under `limit` (or no candidates remain).
pub fn plan_eviction(
    candidates: &[EvictionCandidate],
    current_total: usize,
    needed: usize,
    limit: usize,
    now: Instant,
    idle_timeout: Duration,
) -> Vec<EvictionCandidate> {
    let mut ordered: Vec<EvictionCandidate> = candidates.to_vec();
    ordered.sort_by_key(|c| (c.last_used, c.id));

    let mut total = current_total;
    let mut chosen = Vec::new();
    let mut rest = Vec::new();
    for candidate in ordered {
        if now.saturating_duration_since(candidate.last_used) >= idle_timeout {
            total = total.saturating_sub(candidate.bytes);
            chosen.push(candidate);
        } else {
            rest.push(candidate);
        }
    }
    for candidate in rest {
        if total.saturating_add(needed) <= limit {
            break;
        }
        total = total.saturating_sub(candidate.bytes);
        chosen.push(candidate);
    }
    chosen
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BufferPoolStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub idle_buffers: usize,
    pub idle_bytes: usize,
    pub outstanding_bytes: usize,
}

impl BufferPoolStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            (self.hits as f64 / total as f64) * 100.0
        }
    }
}

struct IdleBuffer {
    data: Vec<u8>,
    last_used: Instant,
}

struct PoolState {
    classes: BTreeMap<usize, LruCache<u64, IdleBuffer>>,
    next_id: u64,
    idle_bytes: usize,
    outstanding_bytes: usize,
    stats: BufferPoolStats,
}

impl PoolState {
    fn candidates(&self) -> Vec<EvictionCandidate> {
        self.classes
            .iter()
            .flat_map(|(class, lru)| {
                lru.iter().map(move |(id, buf)| EvictionCandidate {
                    class: *class,
                    id: *id,
                    bytes: buf.data.capacity(),
                    last_used: buf.last_used,
                })
            })
            .collect()
    }

    fn evict(&mut self, victims: &[EvictionCandidate]) {
        for victim in victims {
            if let Some(lru) = self.classes.get_mut(&victim.class) {
                if let Some(buf) = lru.pop(&victim.id) {
                    self.idle_bytes -= buf.data.capacity();
                    self.stats.evictions += 1;
                }
            }
        }
    }
}

struct Shared {
    config: BufferPoolConfig,
    state: Mutex<PoolState>,
}

/// Thread-safe buffer pool; clones share the same buffers
#[derive(Clone)]
pub struct BufferPool {
    shared: Arc<Shared>,
}

impl BufferPool {
    pub fn new(config: BufferPoolConfig) -> Self {
        BufferPool {
            shared: Arc::new(Shared {
                config,
                state: Mutex::new(PoolState {
                    classes: BTreeMap::new(),
                    next_id: 0,
                    idle_bytes: 0,
                    outstanding_bytes: 0,
                    stats: BufferPoolStats::default(),
                }),
            }),
        }
    }

    pub fn config(&self) -> &BufferPoolConfig {
        &self.shared.config
    }

    /// Check out a zero-length buffer with capacity for at least `size` bytes
    pub fn acquire(&self, size: usize) -> Result<PooledBuffer> {
        let class = size_class(size);
        let config = &self.shared.config;
        let mut state = self.shared.state.lock();

        if let Some(lru) = state.classes.get_mut(&class) {
            if let Some((_, idle)) = lru.pop_lru() {
                let bytes = idle.data.capacity();
                state.idle_bytes -= bytes;
                state.outstanding_bytes += bytes;
                state.stats.hits += 1;
                let mut data = idle.data;
                data.clear();
                return Ok(PooledBuffer {
                    data,
                    pool: Some(self.clone()),
                });
            }
        }

        state.stats.misses += 1;
        let current = state.idle_bytes + state.outstanding_bytes;
        let victims = plan_eviction(
            &state.candidates(),
            current,
            class,
            config.max_total_bytes,
            Instant::now(),
            config.idle_timeout(),
        );
        if !victims.is_empty() {
            warn!(
                evicted = victims.len(),
                requested = class,
                "Buffer pool evicting idle buffers"
            );
            state.evict(&victims);
        }

        let total = state.idle_bytes + state.outstanding_bytes;
        if total + class > config.max_total_bytes {
            return Err(PackageError::BufferPoolExhausted {
                requested: class,
                in_use: state.outstanding_bytes,
                limit: config.max_total_bytes,
            });
        }

        state.outstanding_bytes += class;
        debug!(class, "Allocating pooled buffer");
        Ok(PooledBuffer {
            data: Vec::with_capacity(class),
            pool: Some(self.clone()),
        })
    }

    fn release(&self, mut data: Vec<u8>) {
        let bytes = data.capacity();
        let class = size_class(bytes);
        let mut state = self.shared.state.lock();
        state.outstanding_bytes = state.outstanding_bytes.saturating_sub(bytes);

        // Buffers that grew past their class are not reused
        if class != bytes {
            return;
        }

        data.clear();
        let id = state.next_id;
        state.next_id += 1;
        let cap = NonZeroUsize::new(self.shared.config.max_buffers_per_class)
            .unwrap_or(NonZeroUsize::MIN);
        let lru = state
            .classes
            .entry(class)
            .or_insert_with(|| LruCache::new(cap));
        let displaced = lru.push(
            id,
            IdleBuffer {
                data,
                last_used: Instant::now(),
            },
        );
        state.idle_bytes += bytes;
        if let Some((_, old)) = displaced {
            state.idle_bytes -= old.data.capacity();
            state.stats.evictions += 1;
        }
    }

    fn detach(&self, bytes: usize) {
        let mut state = self.shared.state.lock();
        state.outstanding_bytes = state.outstanding_bytes.saturating_sub(bytes);
    }

    /// Drop idle buffers older than the idle timeout
    pub fn sweep_idle(&self) -> usize {
        self.sweep_idle_at(Instant::now())
    }

    fn sweep_idle_at(&self, now: Instant) -> usize {
        let timeout = self.shared.config.idle_timeout();
        let mut state = self.shared.state.lock();
        let victims: Vec<_> = state
            .candidates()
            .into_iter()
            .filter(|c| now.saturating_duration_since(c.last_used) >= timeout)
            .collect();
        state.evict(&victims);
        victims.len()
    }

    /// Drop every idle buffer
    pub fn clear(&self) {
        let mut state = self.shared.state.lock();
        let victims = state.candidates();
        state.evict(&victims);
    }

    pub fn stats(&self) -> BufferPoolStats {
        let state = self.shared.state.lock();
        BufferPoolStats {
            idle_buffers: state.classes.values().map(|lru| lru.len()).sum(),
            idle_bytes: state.idle_bytes,
            outstanding_bytes: state.outstanding_bytes,
            ..state.stats
        }
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        BufferPool::new(BufferPoolConfig::default())
    }
}

/// A checked-out buffer, returned to its pool on drop
pub struct PooledBuffer {
    data: Vec<u8>,
    pool: Option<BufferPool>,
}

impl PooledBuffer {
    /// Take the bytes out of the pool's accounting
    pub fn into_vec(mut self) -> Vec<u8> {
        let data = std::mem::take(&mut self.data);
        if let Some(pool) = self.pool.take() {
            pool.detach(data.capacity());
        }
        data
    }
}

impl Deref for PooledBuffer {
    type Target = Vec<u8>;

    fn deref(&self) -> &Vec<u8> {
        &self.data
    }
}

impl DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut Vec<u8> {
        &mut self.data
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        if let Some(pool) = self.pool.take() {
            pool.release(std::mem::take(&mut self.data));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_pool(max_total_bytes: usize) -> BufferPool {
        BufferPool::new(BufferPoolConfig {
            max_total_bytes,
            idle_timeout_secs: 60,
            max_buffers_per_class: 4,
        })
    }

    #[test]
    fn test_size_classes() {
        assert_eq!(size_class(0), MIN_CLASS_SIZE);
        assert_eq!(size_class(4096), 4096);
        assert_eq!(size_class(4097), 8192);
        assert_eq!(size_class(100_000), 131_072);
    }

    #[test]
    fn test_reuse_after_release() {
        let pool = small_pool(1 << 20);
        {
            let mut buf = pool.acquire(1000).unwrap();
            buf.extend_from_slice(b"hello");
            assert!(buf.capacity() >= 1000);
        }
        let stats = pool.stats();
        assert_eq!(stats.idle_buffers, 1);
        assert_eq!(stats.outstanding_bytes, 0);

        let buf = pool.acquire(2000).unwrap();
        assert!(buf.is_empty());
        let stats = pool.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.outstanding_bytes, MIN_CLASS_SIZE);
    }

    #[test]
    fn test_limit_evicts_idle_buffers_first() {
        let pool = small_pool(3 * MIN_CLASS_SIZE);
        let a = pool.acquire(MIN_CLASS_SIZE).unwrap();
        let b = pool.acquire(MIN_CLASS_SIZE).unwrap();
        drop(a);
        drop(b);
        assert_eq!(pool.stats().idle_bytes, 2 * MIN_CLASS_SIZE);

        // Needs 8 KiB; only 4 KiB is free until idle buffers go
        let big = pool.acquire(2 * MIN_CLASS_SIZE).unwrap();
        assert_eq!(big.capacity(), 2 * MIN_CLASS_SIZE);
        let stats = pool.stats();
        assert!(stats.evictions >= 1);
        assert!(stats.idle_bytes + stats.outstanding_bytes <= 3 * MIN_CLASS_SIZE);
    }

    #[test]
    fn test_exhaustion_reported() {
        let pool = small_pool(2 * MIN_CLASS_SIZE);
        let _a = pool.acquire(MIN_CLASS_SIZE).unwrap();
        let _b = pool.acquire(MIN_CLASS_SIZE).unwrap();
        let err = pool.acquire(MIN_CLASS_SIZE).err().unwrap();
        assert!(matches!(err, PackageError::BufferPoolExhausted { .. }));
    }

    #[test]
    fn test_into_vec_detaches() {
        let pool = small_pool(1 << 20);
        let buf = pool.acquire(10).unwrap();
        let vec = buf.into_vec();
        assert!(vec.capacity() >= 10);
        let stats = pool.stats();
        assert_eq!(stats.outstanding_bytes, 0);
        assert_eq!(stats.idle_buffers, 0);
    }

    #[test]
    fn test_per_class_cap() {
        let pool = small_pool(1 << 20);
        let bufs: Vec<_> = (0..6).map(|_| pool.acquire(100).unwrap()).collect();
        drop(bufs);
        let stats = pool.stats();
        assert_eq!(stats.idle_buffers, 4);
        assert_eq!(stats.evictions, 2);
    }

    #[test]
    fn test_sweep_idle() {
        let pool = small_pool(1 << 20);
        drop(pool.acquire(100).unwrap());
        assert_eq!(pool.sweep_idle(), 0);
        let later = Instant::now() + Duration::from_secs(61);
        assert_eq!(pool.sweep_idle_at(later), 1);
        assert_eq!(pool.stats().idle_buffers, 0);
    }

    #[test]
    fn test_plan_eviction_prefers_expired_then_lru() {
        let old = Instant::now();
        let mid = old + Duration::from_secs(95);
        let fresh = old + Duration::from_secs(99);
        let now = old + Duration::from_secs(100);
        let candidates = [
            EvictionCandidate { class: 4096, id: 1, bytes: 4096, last_used: fresh },
            EvictionCandidate { class: 4096, id: 2, bytes: 4096, last_used: old },
            EvictionCandidate { class: 8192, id: 3, bytes: 8192, last_used: mid },
        ];

        // Expired buffer alone frees enough
        let plan = plan_eviction(&candidates, 16384, 4096, 16384, now, Duration::from_secs(30));
        assert_eq!(plan.iter().map(|c| c.id).collect::<Vec<_>>(), vec![2]);

        // Still short: least recently used live buffer goes next
        let plan = plan_eviction(&candidates, 16384, 8192, 16384, now, Duration::from_secs(30));
        assert_eq!(plan.iter().map(|c| c.id).collect::<Vec<_>>(), vec![2, 3]);

        // Nothing expired and room available
        let plan = plan_eviction(&candidates, 4096, 4096, 1 << 20, now, Duration::from_secs(300));
        assert!(plan.is_empty());
    }

    #[test]
    fn test_concurrent_acquire_release() {
        let pool = small_pool(64 * MIN_CLASS_SIZE);
        crossbeam::scope(|s| {
            for _ in 0..8 {
                let pool = pool.clone();
                s.spawn(move |_| {
                    for i in 0..200 {
                        let mut buf = pool.acquire(100 + i).unwrap();
                        buf.push(1);
                    }
                });
            }
        })
        .unwrap();
        let stats = pool.stats();
        assert_eq!(stats.outstanding_bytes, 0);
        assert_eq!(stats.hits + stats.misses, 1600);
    }
}
