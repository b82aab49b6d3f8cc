//! main.rs — imu-sim entry point
//!
//! Offline session generator: synthesizes dual-knee motion at the target
//! rate, runs it through the real QDG1 + chunk container codec path, writes
//! the chunks where a recording backend would, and reports compression
//! statistics. Useful for sizing storage and eyeballing codec behavior
//! without spinning up the full backend.

use std::collections::HashMap;
use std::path::PathBuf;

use clap::Parser;
use tracing::info;

use imu_codec::{chunk as chunk_codec, quat_stream};
use imu_simulator::motion::{KneeMotionModel, MotionConfig};
use imu_types::joint::{chunk_size_for_rate, Chunk, COMPRESSION_VERSION};
use imu_types::mapping::{JointName, MountPosition};
use imu_types::quat::relative_rotation;

// ── CLI ───────────────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(name = "imu-sim", about = "TropX synthetic session generator")]
struct Args {
    /// Config file path
    #[arg(short, long, default_value = "config.toml")]
    config: String,
    /// Target pipeline rate in Hz (100, 200 or 400)
    #[arg(long)]
    rate: Option<u32>,
    /// Session length in seconds
    #[arg(long)]
    seconds: Option<u64>,
    /// Output directory for chunk files
    #[arg(long, default_value = "./sim-out")]
    out: PathBuf,
    /// Session id stamped into the chunks
    #[arg(long, default_value = "sim-session")]
    session_id: String,
}

// ── Config structs ────────────────────────────────────────────────────────────

#[derive(Debug, serde::Deserialize)]
struct FullConfig {
    session: SessionConfig,
    motion: MotionTomlConfig,
}

#[derive(Debug, serde::Deserialize)]
struct SessionConfig {
    rate_hz: u32,
    seconds: u64,
}

#[derive(Debug, serde::Deserialize)]
struct MotionTomlConfig {
    flexion_amplitude_deg: f64,
    cycle_period_s: f64,
    noise_deg: f64,
    seed: u64,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "imu_sim=info".into()),
        )
        .init();

    let args = Args::parse();

    let config_str = std::fs::read_to_string(&args.config)
        .unwrap_or_else(|_| include_str!("../config.toml").to_string());
    let cfg: FullConfig = toml::from_str(&config_str)?;

    let rate = args.rate.unwrap_or(cfg.session.rate_hz);
    let seconds = args.seconds.unwrap_or(cfg.session.seconds);
    let motion_cfg = MotionConfig {
        flexion_amplitude_deg: cfg.motion.flexion_amplitude_deg,
        cycle_period_s: cfg.motion.cycle_period_s,
        noise_deg: cfg.motion.noise_deg,
        seed: cfg.motion.seed,
    };

    let total_samples = (seconds * rate as u64) as usize;
    let chunk_samples = chunk_size_for_rate(rate) as usize;
    info!(
        "🎬 generating {seconds}s @ {rate}Hz → {total_samples} samples/joint, chunks of {chunk_samples}"
    );

    std::fs::create_dir_all(&args.out)?;

    // Per-joint relative-rotation component streams
    let joints = [JointName::LeftKnee, JointName::RightKnee];
    let mut streams: HashMap<&str, Vec<f64>> = HashMap::new();
    for joint in joints {
        let mut model = KneeMotionModel::new(joint, motion_cfg.clone());
        let mut components = Vec::with_capacity(total_samples * 4);
        for i in 0..total_samples {
            let t = i as f64 / rate as f64;
            let top = model.orientation(MountPosition::Top, t);
            let bottom = model.orientation(MountPosition::Bottom, t);
            let q = relative_rotation(&top, &bottom);
            components.extend_from_slice(&[q.w, q.x, q.y, q.z]);
        }
        streams.insert(joint.as_str(), components);
    }

    // Chunk + compress through the production codec path
    let mut raw_total = 0usize;
    let mut packed_total = 0usize;
    let chunk_count = total_samples.div_ceil(chunk_samples);
    let period_ms = 1000 / rate as u64;

    for index in 0..chunk_count {
        let first = index * chunk_samples;
        let last = ((index + 1) * chunk_samples).min(total_samples);
        let mut chunk = Chunk {
            session_id: args.session_id.clone(),
            chunk_index: index as u32,
            start_ms: first as u64 * period_ms,
            end_ms: last as u64 * period_ms,
            sample_count: (last - first) as u32,
            per_joint_compressed: Default::default(),
            per_joint_interpolated: Default::default(),
            per_joint_missing: Default::default(),
            compression_version: COMPRESSION_VERSION.into(),
        };
        for joint in joints {
            let name = joint.as_str();
            let slice = &streams[name][first * 4..last * 4];
            raw_total += slice.len() * 8;
            let blob = quat_stream::compress(slice)?;
            packed_total += blob.len();
            chunk.per_joint_compressed.insert(name.to_string(), blob);
            chunk.per_joint_interpolated.insert(name.to_string(), Vec::new());
            chunk.per_joint_missing.insert(name.to_string(), Vec::new());
        }
        let bytes = chunk_codec::encode_chunk(&chunk)?;
        let path = args.out.join(format!("{}-{index:05}.chunk", args.session_id));
        std::fs::write(&path, &bytes)?;
        info!(
            "📦 chunk {index}: {} samples/joint → {} bytes ({})",
            chunk.sample_count,
            bytes.len(),
            path.display()
        );
    }

    let ratio = raw_total as f64 / packed_total.max(1) as f64;
    info!(
        "✅ {chunk_count} chunks, raw {raw_total} B, compressed {packed_total} B, ratio {ratio:.1}×"
    );
    Ok(())
}
