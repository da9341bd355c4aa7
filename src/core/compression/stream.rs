//! Chunked, parallel streaming compression
//!
//! **Frame format**: a sequence of chunks, each `[raw_len u32][stored_len u32]`
//! followed by `stored_len` codec bytes, terminated by a `[0u32][0u32]`
//! marker. Chunks never carry zero raw bytes, so the marker is unambiguous.
//!
//! **Pipeline**:
//! - a producer thread reads chunks into pooled buffers
//! - a fixed pool of workers runs the codec
//! - the calling thread writes results strictly in input order
//!
//! Cancellation is checked per chunk on both ends of the pipeline.

use super::memory::{ResourceMonitor, ResourceSnapshot, SystemMonitor};
use super::{compress, decompress_exact, CompressionType};
use crate::buffer_pool::{BufferPool, PooledBuffer};
use crate::context::Context;
use crate::error::{PackageError, Result};
use crossbeam::channel;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, warn};
use validator::Validate;

pub const MIN_CHUNK_SIZE: usize = 64 * 1024;
pub const MAX_CHUNK_SIZE: usize = 16 * 1024 * 1024;

const FRAME_HEADER_SIZE: usize = 8;

/// Streaming knobs; zero values mean "derive from the system"
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct StreamConfig {
    /// Bytes per chunk (0 = auto from available memory)
    pub chunk_size: usize,
    /// In-flight memory budget in bytes (0 = half of available memory)
    pub max_memory_usage: u64,
    /// Directory for spill files (empty = system temp dir)
    pub temp_dir: String,
    /// Codec workers (0 = available parallelism)
    #[validate(range(max = 256))]
    pub worker_count: usize,
    /// Shrink chunks while the system is under memory or CPU pressure
    pub adaptive_chunking: bool,
    /// Spill buffered output to a temp file once it exceeds the budget
    pub use_disk_buffering: bool,
}

impl StreamConfig {
    /// Checks the derive rules cannot express
    pub fn check(&self) -> Result<()> {
        self.validate()
            .map_err(|e| PackageError::Config(format!("streaming: {}", e)))?;
        if self.chunk_size != 0 && !(MIN_CHUNK_SIZE..=MAX_CHUNK_SIZE).contains(&self.chunk_size) {
            return Err(PackageError::Config(format!(
                "streaming.chunk_size must be 0 or within {}..={}",
                MIN_CHUNK_SIZE, MAX_CHUNK_SIZE
            )));
        }
        Ok(())
    }
}

/// Concrete sizes derived from a [`StreamConfig`] and a resource snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamPlan {
    pub chunk_size: usize,
    pub workers: usize,
    pub max_memory: u64,
    /// Bounded channel depth between pipeline stages
    pub queue_depth: usize,
}

impl StreamPlan {
    pub fn resolve(config: &StreamConfig, snapshot: &ResourceSnapshot) -> Self {
        let workers = if config.worker_count == 0 {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        } else {
            config.worker_count
        };

        let max_memory = if config.max_memory_usage == 0 {
            (snapshot.available_memory / 2).max(MIN_CHUNK_SIZE as u64 * 4)
        } else {
            config.max_memory_usage
        };

        // Each in-flight chunk holds roughly an input and an output buffer
        let per_chunk_budget = (max_memory / (workers as u64 * 4).max(1)) as usize;
        let mut chunk_size = if config.chunk_size == 0 {
            per_chunk_budget.clamp(MIN_CHUNK_SIZE, MAX_CHUNK_SIZE)
        } else {
            config.chunk_size
        };
        if config.adaptive_chunking && snapshot.under_pressure() {
            chunk_size = (chunk_size / 2).max(MIN_CHUNK_SIZE);
        }

        let queue_depth = ((max_memory / (chunk_size as u64 * 2).max(1)) as usize)
            .clamp(1, workers * 2);

        StreamPlan {
            chunk_size,
            workers,
            max_memory,
            queue_depth,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StreamStats {
    pub chunks: u64,
    pub bytes_in: u64,
    pub bytes_out: u64,
    /// Chunk size in effect when the stream ended
    pub final_chunk_size: usize,
    pub spilled: bool,
}

/// Output held in memory or spilled to an anonymous temp file
#[derive(Debug)]
pub enum SpooledOutput {
    Memory(Vec<u8>),
    Disk { file: File, len: u64 },
}

impl SpooledOutput {
    pub fn len(&self) -> u64 {
        match self {
            SpooledOutput::Memory(buf) => buf.len() as u64,
            SpooledOutput::Disk { len, .. } => *len,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_spilled(&self) -> bool {
        matches!(self, SpooledOutput::Disk { .. })
    }

    pub fn into_vec(self) -> Result<Vec<u8>> {
        match self {
            SpooledOutput::Memory(buf) => Ok(buf),
            SpooledOutput::Disk { mut file, len } => {
                file.seek(SeekFrom::Start(0))?;
                let mut out = Vec::with_capacity(len as usize);
                file.read_to_end(&mut out)?;
                Ok(out)
            }
        }
    }
}

struct SpoolWriter {
    buf: Vec<u8>,
    file: Option<File>,
    len: u64,
    limit: u64,
    spill: bool,
    temp_dir: Option<PathBuf>,
}

impl SpoolWriter {
    fn spill_file(&self) -> io::Result<File> {
        match &self.temp_dir {
            Some(dir) => tempfile::tempfile_in(dir),
            None => tempfile::tempfile(),
        }
    }

    fn finish(self) -> SpooledOutput {
        match self.file {
            Some(file) => SpooledOutput::Disk {
                file,
                len: self.len,
            },
            None => SpooledOutput::Memory(self.buf),
        }
    }
}

impl Write for SpoolWriter {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        if self.file.is_none() && self.spill && self.len + data.len() as u64 > self.limit {
            let mut file = self.spill_file()?;
            file.write_all(&self.buf)?;
            warn!(
                buffered = self.buf.len(),
                limit = self.limit,
                "Spilling stream output to disk"
            );
            self.buf = Vec::new();
            self.file = Some(file);
        }
        match &mut self.file {
            Some(file) => file.write_all(data)?,
            None => self.buf.extend_from_slice(data),
        }
        self.len += data.len() as u64;
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        match &mut self.file {
            Some(file) => file.flush(),
            None => Ok(()),
        }
    }
}

/// Fill `buf` up to `want` bytes; a short result means end of input
fn read_chunk<R: Read>(reader: &mut R, buf: &mut Vec<u8>, want: usize) -> io::Result<usize> {
    buf.resize(want, 0);
    let mut filled = 0;
    while filled < want {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    buf.truncate(filled);
    Ok(filled)
}

fn pipeline_panic() -> PackageError {
    PackageError::Compression {
        algorithm: "stream",
        message: "pipeline worker panicked".to_string(),
    }
}

fn frame_error(message: impl Into<String>) -> PackageError {
    PackageError::malformed("CompressedStream", "Frame", message)
}

/// Run `work` over produced jobs on `workers` threads, consuming results in
/// production order
fn run_ordered<J, O, P, W, C>(
    workers: usize,
    depth: usize,
    ctx: &Context,
    mut produce: P,
    work: W,
    mut consume: C,
) -> Result<()>
where
    J: Send,
    O: Send,
    P: FnMut() -> Result<Option<J>> + Send,
    W: Fn(J) -> Result<O> + Sync,
    C: FnMut(O) -> Result<()>,
{
    let (job_tx, job_rx) = channel::bounded::<(u64, J)>(depth);
    let (out_tx, out_rx) = channel::bounded::<(u64, Result<O>)>(depth);

    crossbeam::scope(|s| {
        let producer = s.spawn(move |_| -> Result<u64> {
            let mut seq = 0u64;
            loop {
                ctx.check("stream read")?;
                match produce()? {
                    Some(job) => {
                        if job_tx.send((seq, job)).is_err() {
                            break;
                        }
                        seq += 1;
                    }
                    None => break,
                }
            }
            Ok(seq)
        });

        for _ in 0..workers.max(1) {
            let job_rx = job_rx.clone();
            let out_tx = out_tx.clone();
            let work = &work;
            s.spawn(move |_| {
                for (seq, job) in job_rx.iter() {
                    if out_tx.send((seq, work(job))).is_err() {
                        break;
                    }
                }
            });
        }
        drop(job_rx);
        drop(out_tx);

        let mut pending = BTreeMap::new();
        let mut next = 0u64;
        let mut failure = None;
        for (seq, result) in out_rx.iter() {
            let output = match result {
                Ok(output) => output,
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            };
            pending.insert(seq, output);
            while let Some(output) = pending.remove(&next) {
                if let Err(e) = ctx.check("stream write").and_then(|_| consume(output)) {
                    failure = Some(e);
                    break;
                }
                next += 1;
            }
            if failure.is_some() {
                break;
            }
        }
        // Closing the result channel unblocks workers and then the producer
        drop(out_rx);

        let produced = producer.join().map_err(|_| pipeline_panic())?;
        if let Some(e) = failure {
            return Err(e);
        }
        let produced = produced?;
        if next != produced || !pending.is_empty() {
            return Err(PackageError::Compression {
                algorithm: "stream",
                message: format!("reassembled {} of {} chunks", next, produced),
            });
        }
        Ok(())
    })
    .map_err(|_| pipeline_panic())?
}

/// Parallel chunked compressor sharing one buffer pool
#[derive(Clone)]
pub struct StreamingCompressor {
    config: StreamConfig,
    pool: BufferPool,
    monitor: Arc<dyn ResourceMonitor>,
}

impl StreamingCompressor {
    pub fn new(config: StreamConfig, pool: BufferPool) -> Self {
        StreamingCompressor::with_monitor(config, pool, Arc::new(SystemMonitor))
    }

    pub fn with_monitor(
        config: StreamConfig,
        pool: BufferPool,
        monitor: Arc<dyn ResourceMonitor>,
    ) -> Self {
        StreamingCompressor {
            config,
            pool,
            monitor,
        }
    }

    pub fn config(&self) -> &StreamConfig {
        &self.config
    }

    pub fn pool(&self) -> &BufferPool {
        &self.pool
    }

    pub fn plan(&self) -> StreamPlan {
        StreamPlan::resolve(&self.config, &self.monitor.snapshot())
    }

    /// Compress everything from `reader` into framed chunks on `writer`
    pub fn compress<R, W>(
        &self,
        reader: R,
        writer: &mut W,
        compression: CompressionType,
        level: u8,
        ctx: &Context,
    ) -> Result<StreamStats>
    where
        R: Read + Send,
        W: Write,
    {
        let level = compression.effective_level(level)?;
        let plan = self.plan();
        debug!(
            algorithm = compression.name(),
            chunk_size = plan.chunk_size,
            workers = plan.workers,
            "Starting streaming compression"
        );

        let mut reader = reader;
        let mut chunk_size = plan.chunk_size;
        let mut bytes_in = 0u64;
        let pool = &self.pool;
        let monitor = &self.monitor;
        let adaptive = self.config.adaptive_chunking;

        let mut stats = StreamStats::default();
        let (final_chunk_size, read_total) = {
            let final_size = std::cell::Cell::new(chunk_size);
            let total = std::cell::Cell::new(0u64);
            let produce = || -> Result<Option<_>> {
                if adaptive && monitor.snapshot().under_pressure() && chunk_size > MIN_CHUNK_SIZE {
                    chunk_size = (chunk_size / 2).max(MIN_CHUNK_SIZE);
                    warn!(chunk_size, "Resource pressure, shrinking chunk size");
                }
                let mut buf = pool.acquire(chunk_size)?;
                let n = read_chunk(&mut reader, &mut buf, chunk_size)?;
                bytes_in += n as u64;
                if n == 0 {
                    return Ok(None);
                }
                Ok(Some((buf, bytes_in, chunk_size)))
            };
            let work = |(buf, seen, size): (PooledBuffer, u64, usize)| -> Result<(usize, Vec<u8>, u64, usize)> {
                let packed = compress(&buf, compression, level)?;
                Ok((buf.len(), packed, seen, size))
            };
            let consume = |(raw_len, packed, seen, size): (usize, Vec<u8>, u64, usize)| -> Result<()> {
                writer.write_all(&(raw_len as u32).to_le_bytes())?;
                writer.write_all(&(packed.len() as u32).to_le_bytes())?;
                writer.write_all(&packed)?;
                stats.chunks += 1;
                stats.bytes_out += (FRAME_HEADER_SIZE + packed.len()) as u64;
                final_size.set(size);
                total.set(seen);
                Ok(())
            };
            run_ordered(plan.workers, plan.queue_depth, ctx, produce, work, consume)?;
            (final_size.get(), total.get())
        };

        writer.write_all(&[0u8; FRAME_HEADER_SIZE])?;
        stats.bytes_out += FRAME_HEADER_SIZE as u64;
        stats.bytes_in = read_total;
        stats.final_chunk_size = final_chunk_size;
        debug!(
            chunks = stats.chunks,
            bytes_in = stats.bytes_in,
            bytes_out = stats.bytes_out,
            "Streaming compression finished"
        );
        Ok(stats)
    }

    /// Compress `data` into an in-memory framed buffer
    pub fn compress_to_vec(
        &self,
        data: &[u8],
        compression: CompressionType,
        level: u8,
        ctx: &Context,
    ) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(data.len() / 2 + FRAME_HEADER_SIZE * 2);
        self.compress(data, &mut out, compression, level, ctx)?;
        Ok(out)
    }

    /// Compress into memory, spilling to a temp file past the memory budget
    /// when disk buffering is enabled
    pub fn compress_spooled<R: Read + Send>(
        &self,
        reader: R,
        compression: CompressionType,
        level: u8,
        ctx: &Context,
    ) -> Result<(SpooledOutput, StreamStats)> {
        let plan = self.plan();
        let mut spool = SpoolWriter {
            buf: Vec::new(),
            file: None,
            len: 0,
            limit: plan.max_memory,
            spill: self.config.use_disk_buffering,
            temp_dir: if self.config.temp_dir.is_empty() {
                None
            } else {
                Some(PathBuf::from(&self.config.temp_dir))
            },
        };
        let mut stats = self.compress(reader, &mut spool, compression, level, ctx)?;
        let output = spool.finish();
        stats.spilled = output.is_spilled();
        Ok((output, stats))
    }

    /// Decode framed chunks from `reader`, writing original bytes to `writer`
    pub fn decompress<R, W>(
        &self,
        reader: R,
        writer: &mut W,
        compression: CompressionType,
        ctx: &Context,
    ) -> Result<u64>
    where
        R: Read + Send,
        W: Write,
    {
        let plan = self.plan();
        let mut reader = reader;
        let pool = &self.pool;
        let mut finished = false;
        let mut written = 0u64;

        let produce = || -> Result<Option<_>> {
            if finished {
                return Ok(None);
            }
            let mut frame = [0u8; FRAME_HEADER_SIZE];
            reader.read_exact(&mut frame).map_err(|e| {
                if e.kind() == io::ErrorKind::UnexpectedEof {
                    frame_error("stream ends before the terminator")
                } else {
                    PackageError::Io(e)
                }
            })?;
            let raw_len = u32::from_le_bytes([frame[0], frame[1], frame[2], frame[3]]) as usize;
            let stored_len = u32::from_le_bytes([frame[4], frame[5], frame[6], frame[7]]) as usize;
            if raw_len == 0 {
                if stored_len != 0 {
                    return Err(frame_error("terminator carries a payload"));
                }
                finished = true;
                return Ok(None);
            }
            if raw_len > MAX_CHUNK_SIZE || stored_len > MAX_CHUNK_SIZE * 2 {
                return Err(frame_error(format!(
                    "chunk of {} bytes ({} stored) exceeds the chunk limit",
                    raw_len, stored_len
                )));
            }
            let mut buf = pool.acquire(stored_len)?;
            let n = read_chunk(&mut reader, &mut buf, stored_len)?;
            if n != stored_len {
                return Err(frame_error("truncated chunk payload"));
            }
            Ok(Some((buf, raw_len)))
        };
        let work = |(buf, raw_len): (PooledBuffer, usize)| -> Result<Vec<u8>> {
            decompress_exact(&buf, compression, raw_len as u64)
        };
        let consume = |data: Vec<u8>| -> Result<()> {
            writer.write_all(&data)?;
            written += data.len() as u64;
            Ok(())
        };
        run_ordered(plan.workers, plan.queue_depth, ctx, produce, work, consume)?;
        Ok(written)
    }

    /// Decode a framed buffer, checking the total against `expected_len`
    pub fn decompress_to_vec(
        &self,
        data: &[u8],
        compression: CompressionType,
        expected_len: u64,
        ctx: &Context,
    ) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(expected_len.min(MAX_CHUNK_SIZE as u64 * 4) as usize);
        let mut cursor = data;
        self.decompress(&mut cursor, &mut out, compression, ctx)?;
        if !cursor.is_empty() {
            return Err(frame_error(format!(
                "{} bytes follow the terminator",
                cursor.len()
            )));
        }
        if out.len() as u64 != expected_len {
            return Err(PackageError::Compression {
                algorithm: compression.name(),
                message: format!(
                    "stream decoded to {} bytes, expected {}",
                    out.len(),
                    expected_len
                ),
            });
        }
        Ok(out)
    }
}
