//! Recording chunker & compressor.
//!
//! Consumes the pipeline's lossless tick stream, frames it into fixed-size
//! chunks (about a minute of data per chunk at any target rate), compresses
//! each joint's relative-rotation series through the QDG1 codec, and hands
//! the sealed container to the blob sink. Upload failures retry with
//! exponential backoff and then spill locally — a broken sink never stops an
//! active recording.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use imu_codec::chunk as chunk_codec;
use imu_codec::quat_stream;
use imu_types::error::{CodedError, ErrorCode};
use imu_types::joint::{chunk_size_for_rate, Chunk, Session, TickQuality, COMPRESSION_VERSION};
use imu_types::quat::Quaternion;

use crate::pipeline::{TickBatch, MAX_JOINTS};

// ── Blob sink capability ──────────────────────────────────────────────────────

/// Where sealed chunks go. Implementations own durability; the recorder only
/// guarantees ordered, dense `chunk_index` values per session.
#[async_trait]
pub trait BlobSink: Send + Sync + 'static {
    async fn put(
        &self,
        session_id: &str,
        chunk_index: u32,
        bytes: &[u8],
    ) -> Result<(), CodedError>;
}

/// Filesystem sink: `<root>/<session_id>/chunk-<index>.chunk`.
pub struct FsBlobSink {
    root: PathBuf,
}

impl FsBlobSink {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl BlobSink for FsBlobSink {
    async fn put(
        &self,
        session_id: &str,
        chunk_index: u32,
        bytes: &[u8],
    ) -> Result<(), CodedError> {
        let dir = self.root.join(session_id);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| CodedError::new(ErrorCode::ServiceUnavailable, e.to_string()))?;
        let path = dir.join(format!("chunk-{chunk_index:05}.chunk"));
        tokio::fs::write(&path, bytes)
            .await
            .map_err(|e| CodedError::new(ErrorCode::ServiceUnavailable, e.to_string()))?;
        Ok(())
    }
}

// ── Recorder ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct RecorderConfig {
    pub upload_attempts: u32,
    pub backoff_base: Duration,
    /// Depth of the pipeline → recorder channel. The pipeline backpressures
    /// (never drops) when this fills.
    pub channel_depth: usize,
    pub spill_dir: PathBuf,
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            upload_attempts: 3,
            backoff_base: Duration::from_millis(500),
            channel_depth: 1024,
            spill_dir: PathBuf::from("./data/spill"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RecordingSummary {
    pub session_id: String,
    pub chunk_count: u32,
    pub total_ticks: u64,
    pub duration_ms: u64,
    pub failed_uploads: u32,
}

/// A running recording: feed it through `tx` (held by the pipeline), await
/// `handle` after dropping `tx` to flush and finalize.
pub struct ActiveRecording {
    pub tx: mpsc::Sender<TickBatch>,
    pub handle: JoinHandle<RecordingSummary>,
}

struct JointBuilder {
    name: String,
    components: Vec<f64>,
    interpolated: Vec<u32>,
    missing: Vec<u32>,
    last_rotation: Quaternion,
}

pub struct Recorder {
    sink: std::sync::Arc<dyn BlobSink>,
    cfg: RecorderConfig,
}

impl Recorder {
    pub fn new(sink: std::sync::Arc<dyn BlobSink>, cfg: RecorderConfig) -> Self {
        Self { sink, cfg }
    }

    /// Start consuming ticks for a session. The returned sender goes to the
    /// pipeline; dropping it flushes the partial chunk and finishes.
    pub fn start(&self, session: Session) -> ActiveRecording {
        let (tx, rx) = mpsc::channel(self.cfg.channel_depth);
        let sink = self.sink.clone();
        let cfg = self.cfg.clone();
        let handle = tokio::spawn(run_recording(session, rx, sink, cfg));
        ActiveRecording { tx, handle }
    }
}

async fn run_recording(
    session: Session,
    mut rx: mpsc::Receiver<TickBatch>,
    sink: std::sync::Arc<dyn BlobSink>,
    cfg: RecorderConfig,
) -> RecordingSummary {
    let chunk_size = chunk_size_for_rate(session.sample_rate_hz) as u64;
    let period_ms = (1000 / session.sample_rate_hz.max(1)) as u64;
    let joint_count = session.active_joints.len().min(MAX_JOINTS);

    let mut builders: Vec<JointBuilder> = session.active_joints[..joint_count]
        .iter()
        .map(|name| JointBuilder {
            name: name.clone(),
            components: Vec::with_capacity(chunk_size as usize * 4),
            interpolated: Vec::new(),
            missing: Vec::new(),
            last_rotation: Quaternion::IDENTITY,
        })
        .collect();

    let mut chunk_index: u32 = 0;
    let mut tick_in_chunk: u64 = 0;
    let mut chunk_start_ms: u64 = session.start_master_ms;
    let mut total_ticks: u64 = 0;
    let mut failed_uploads: u32 = 0;
    let mut last_tick_ms: u64 = session.start_master_ms;

    info!(
        "recorder: session {} started ({} joints, {}Hz, {} samples/chunk)",
        session.session_id, joint_count, session.sample_rate_hz, chunk_size
    );

    while let Some(batch) = rx.recv().await {
        if tick_in_chunk == 0 {
            chunk_start_ms = batch.timestamp_ms;
        }
        last_tick_ms = batch.timestamp_ms;

        for (idx, builder) in builders.iter_mut().enumerate() {
            let tick_idx = tick_in_chunk as u32;
            match batch.ticks[idx] {
                Some(tick) => {
                    builder.last_rotation = tick.rotation;
                    push_rotation(&mut builder.components, tick.rotation);
                    match tick.quality {
                        TickQuality::Valid => {}
                        TickQuality::Interpolated => builder.interpolated.push(tick_idx),
                        TickQuality::Missing => builder.missing.push(tick_idx),
                    }
                }
                None => {
                    // Joint went inactive mid-session: dense stream, sparse flag
                    let repeat = builder.last_rotation;
                    push_rotation(&mut builder.components, repeat);
                    builder.missing.push(tick_idx);
                }
            }
        }

        tick_in_chunk += 1;
        total_ticks += 1;

        if tick_in_chunk >= chunk_size {
            let sealed = seal_chunk(
                &session,
                chunk_index,
                chunk_start_ms,
                tick_in_chunk,
                period_ms,
                &mut builders,
            )
            .await;
            match sealed {
                Ok(bytes) => {
                    if !upload_with_retry(&*sink, &session.session_id, chunk_index, &bytes, &cfg)
                        .await
                    {
                        failed_uploads += 1;
                        spill_chunk(&cfg.spill_dir, &session.session_id, chunk_index, &bytes)
                            .await;
                    }
                }
                Err(e) => warn!("recorder: chunk {chunk_index} failed to seal: {e}"),
            }
            chunk_index += 1;
            tick_in_chunk = 0;
        }
    }

    // Flush the partial chunk on stop
    if tick_in_chunk > 0 {
        match seal_chunk(
            &session,
            chunk_index,
            chunk_start_ms,
            tick_in_chunk,
            period_ms,
            &mut builders,
        )
        .await
        {
            Ok(bytes) => {
                if !upload_with_retry(&*sink, &session.session_id, chunk_index, &bytes, &cfg).await
                {
                    failed_uploads += 1;
                    spill_chunk(&cfg.spill_dir, &session.session_id, chunk_index, &bytes).await;
                }
                chunk_index += 1;
            }
            Err(e) => warn!("recorder: final chunk failed to seal: {e}"),
        }
    }

    let duration_ms = last_tick_ms.saturating_sub(session.start_master_ms) + period_ms;
    info!(
        "recorder: session {} finished ({chunk_index} chunks, {total_ticks} ticks, {failed_uploads} failed uploads)",
        session.session_id
    );
    RecordingSummary {
        session_id: session.session_id.clone(),
        chunk_count: chunk_index,
        total_ticks,
        duration_ms,
        failed_uploads,
    }
}

fn push_rotation(components: &mut Vec<f64>, q: Quaternion) {
    components.extend_from_slice(&[q.w, q.x, q.y, q.z]);
}

/// Compress every joint's series and encode the chunk container. The
/// compression runs on the blocking pool; the tick path is never stalled by
/// deflate.
async fn seal_chunk(
    session: &Session,
    chunk_index: u32,
    start_ms: u64,
    sample_count: u64,
    period_ms: u64,
    builders: &mut [JointBuilder],
) -> Result<Vec<u8>, CodedError> {
    let mut per_joint: Vec<(String, Vec<f64>, Vec<u32>, Vec<u32>)> = builders
        .iter_mut()
        .map(|b| {
            (
                b.name.clone(),
                std::mem::take(&mut b.components),
                std::mem::take(&mut b.interpolated),
                std::mem::take(&mut b.missing),
            )
        })
        .collect();

    let session_id = session.session_id.clone();
    let end_ms = start_ms + sample_count * period_ms;
    let sealed = tokio::task::spawn_blocking(move || {
        let mut chunk = Chunk {
            session_id,
            chunk_index,
            start_ms,
            end_ms,
            sample_count: sample_count as u32,
            per_joint_compressed: HashMap::new(),
            per_joint_interpolated: HashMap::new(),
            per_joint_missing: HashMap::new(),
            compression_version: COMPRESSION_VERSION.to_string(),
        };
        for (name, components, interpolated, missing) in per_joint.drain(..) {
            let blob = quat_stream::compress(&components)
                .map_err(|e| CodedError::new(ErrorCode::DataCorruption, e.to_string()))?;
            chunk.per_joint_compressed.insert(name.clone(), blob);
            chunk.per_joint_interpolated.insert(name.clone(), interpolated);
            chunk.per_joint_missing.insert(name, missing);
        }
        chunk_codec::encode_chunk(&chunk)
            .map_err(|e| CodedError::new(ErrorCode::DataCorruption, e.to_string()))
    })
    .await
    .map_err(|e| CodedError::new(ErrorCode::MotionProcessingFailed, e.to_string()))??;
    Ok(sealed)
}

async fn upload_with_retry(
    sink: &dyn BlobSink,
    session_id: &str,
    chunk_index: u32,
    bytes: &[u8],
    cfg: &RecorderConfig,
) -> bool {
    for attempt in 1..=cfg.upload_attempts {
        match sink.put(session_id, chunk_index, bytes).await {
            Ok(()) => return true,
            Err(e) => {
                warn!(
                    "recorder: upload of {session_id}/{chunk_index} attempt {attempt} failed: {e}"
                );
                if attempt < cfg.upload_attempts {
                    tokio::time::sleep(cfg.backoff_base * 2u32.pow(attempt - 1)).await;
                }
            }
        }
    }
    false
}

async fn spill_chunk(spill_dir: &PathBuf, session_id: &str, chunk_index: u32, bytes: &[u8]) {
    let dir = spill_dir.join(session_id);
    if let Err(e) = tokio::fs::create_dir_all(&dir).await {
        warn!("recorder: cannot create spill dir: {e}");
        return;
    }
    let path = dir.join(format!("chunk-{chunk_index:05}.chunk"));
    match tokio::fs::write(&path, bytes).await {
        Ok(()) => warn!("recorder: chunk {chunk_index} spilled to {}", path.display()),
        Err(e) => warn!("recorder: spill write failed: {e}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::{Arc, Mutex};

    use crate::pipeline::JointTick;

    struct MemorySink {
        chunks: Mutex<Vec<(String, u32, Vec<u8>)>>,
        fail_first: AtomicU32,
    }

    impl MemorySink {
        fn new() -> Arc<Self> {
            Arc::new(Self { chunks: Mutex::new(Vec::new()), fail_first: AtomicU32::new(0) })
        }
    }

    #[async_trait]
    impl BlobSink for MemorySink {
        async fn put(
            &self,
            session_id: &str,
            chunk_index: u32,
            bytes: &[u8],
        ) -> Result<(), CodedError> {
            if self.fail_first.load(Ordering::SeqCst) > 0 {
                self.fail_first.fetch_sub(1, Ordering::SeqCst);
                return Err(CodedError::new(ErrorCode::ServiceUnavailable, "sink down"));
            }
            self.chunks.lock().unwrap().push((session_id.to_string(), chunk_index, bytes.to_vec()));
            Ok(())
        }
    }

    fn session(rate: u32) -> Session {
        Session {
            session_id: "sess-A".into(),
            exercise_id: "ex-1".into(),
            set_number: 1,
            start_master_ms: 0,
            sample_rate_hz: rate,
            active_joints: vec!["left_knee".into(), "right_knee".into()],
        }
    }

    fn batch(ts: u64, quality: TickQuality) -> TickBatch {
        let tick = JointTick {
            angle_deg: 30.0,
            rotation: Quaternion::from_euler(0.5, 0.0, 0.0),
            quality,
        };
        let mut ticks = [None; MAX_JOINTS];
        ticks[0] = Some(tick);
        ticks[1] = Some(tick);
        TickBatch { timestamp_ms: ts, ticks }
    }

    fn test_cfg(spill: &std::path::Path) -> RecorderConfig {
        RecorderConfig {
            upload_attempts: 2,
            backoff_base: Duration::from_millis(5),
            channel_depth: 64,
            spill_dir: spill.to_path_buf(),
        }
    }

    #[tokio::test]
    async fn partial_chunk_flushes_on_stop() {
        let sink = MemorySink::new();
        let spill = std::env::temp_dir().join(format!("tropx-rec-{}", uuid::Uuid::new_v4()));
        let recorder = Recorder::new(sink.clone(), test_cfg(&spill));

        let active = recorder.start(session(100));
        for i in 0..250u64 {
            active.tx.send(batch(i * 10, TickQuality::Valid)).await.unwrap();
        }
        drop(active.tx);
        let summary = active.handle.await.unwrap();

        assert_eq!(summary.chunk_count, 1);
        assert_eq!(summary.total_ticks, 250);
        assert_eq!(summary.failed_uploads, 0);

        let chunks = sink.chunks.lock().unwrap();
        assert_eq!(chunks.len(), 1);
        let decoded = chunk_codec::decode_chunk(&chunks[0].2).unwrap();
        assert_eq!(decoded.sample_count, 250);
        assert_eq!(decoded.start_ms, 0);
        assert_eq!(decoded.end_ms, 2500);
        let left = quat_stream::decompress(&decoded.per_joint_compressed["left_knee"]).unwrap();
        assert_eq!(left.len(), 250 * 4);
    }

    #[tokio::test]
    async fn quality_flags_become_sparse_indices() {
        let sink = MemorySink::new();
        let spill = std::env::temp_dir().join(format!("tropx-rec-{}", uuid::Uuid::new_v4()));
        let recorder = Recorder::new(sink.clone(), test_cfg(&spill));

        let active = recorder.start(session(100));
        for i in 0..100u64 {
            let quality = if (40..45).contains(&i) {
                TickQuality::Missing
            } else if i == 50 {
                TickQuality::Interpolated
            } else {
                TickQuality::Valid
            };
            active.tx.send(batch(i * 10, quality)).await.unwrap();
        }
        drop(active.tx);
        active.handle.await.unwrap();

        let chunks = sink.chunks.lock().unwrap();
        let decoded = chunk_codec::decode_chunk(&chunks[0].2).unwrap();
        assert_eq!(decoded.per_joint_missing["left_knee"], vec![40, 41, 42, 43, 44]);
        assert_eq!(decoded.per_joint_interpolated["left_knee"], vec![50]);
    }

    #[tokio::test]
    async fn failed_upload_spills_and_recording_continues() {
        let sink = MemorySink::new();
        sink.fail_first.store(10, Ordering::SeqCst); // exhaust both attempts
        let spill = std::env::temp_dir().join(format!("tropx-rec-{}", uuid::Uuid::new_v4()));
        let recorder = Recorder::new(sink.clone(), test_cfg(&spill));

        let active = recorder.start(session(100));
        for i in 0..10u64 {
            active.tx.send(batch(i * 10, TickQuality::Valid)).await.unwrap();
        }
        drop(active.tx);
        let summary = active.handle.await.unwrap();

        assert_eq!(summary.failed_uploads, 1);
        let spilled = spill.join("sess-A").join("chunk-00000.chunk");
        let bytes = tokio::fs::read(&spilled).await.unwrap();
        assert!(chunk_codec::decode_chunk(&bytes).is_ok());
        let _ = tokio::fs::remove_dir_all(&spill).await;
    }

    #[tokio::test]
    async fn chunks_are_dense_and_contiguous() {
        let sink = MemorySink::new();
        let spill = std::env::temp_dir().join(format!("tropx-rec-{}", uuid::Uuid::new_v4()));
        let mut cfg = test_cfg(&spill);
        cfg.channel_depth = 16;
        let recorder = Recorder::new(sink.clone(), cfg);

        // 400 Hz → 24000-sample chunks; send 2.5 chunks worth is too slow for
        // a unit test, so use 100 Hz (6000) and send 2.5 chunks of ticks.
        let active = recorder.start(session(100));
        for i in 0..15_000u64 {
            active.tx.send(batch(i * 10, TickQuality::Valid)).await.unwrap();
        }
        drop(active.tx);
        let summary = active.handle.await.unwrap();
        assert_eq!(summary.chunk_count, 3);

        let chunks = sink.chunks.lock().unwrap();
        assert_eq!(chunks.len(), 3);
        let mut next_start = 0u64;
        for (i, (_, index, bytes)) in chunks.iter().enumerate() {
            assert_eq!(*index, i as u32);
            let decoded = chunk_codec::decode_chunk(bytes).unwrap();
            assert_eq!(decoded.start_ms, next_start);
            next_start = decoded.end_ms;
        }
        assert_eq!(next_start, 150_000);
    }
}
