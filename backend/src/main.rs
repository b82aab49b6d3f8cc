use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use imu_simulator::{FleetConfig, SimFleet};
use imu_types::transport::DeviceTransport;

use tropx_backend::clock::MasterClock;
use tropx_backend::config::HubConfig;
use tropx_backend::coordinator::Coordinator;
use tropx_backend::pipeline::MotionPipeline;
use tropx_backend::recorder::{FsBlobSink, Recorder, RecorderConfig};
use tropx_backend::registry::DeviceRegistry;
use tropx_backend::server::{
    build_router, spawn_device_status_broadcast, spawn_heartbeat, spawn_motion_broadcast,
    AppState, StreamingServer,
};
use tropx_backend::timesync::{TimeSyncConfig, TimeSyncManager};

#[tokio::main]
async fn main() {
    // Logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tropx_backend=info,imu_simulator=info".into()),
        )
        .init();

    let cfg = HubConfig::default();
    let transport_mode = std::env::var("TROPX_TRANSPORT").unwrap_or_else(|_| "sim".into());
    info!(
        "🦵 TropX Motion Backend v{} starting — transport: {transport_mode}, {}Hz pipeline",
        env!("CARGO_PKG_VERSION"),
        cfg.target_hz
    );

    let clock = MasterClock::new();
    let registry = Arc::new(DeviceRegistry::new(clock));
    let pipeline = Arc::new(MotionPipeline::new(cfg.target_hz, cfg.joints.clone(), clock));

    // Transport: the simulated fleet. A BLE GATT stack implements the same
    // capability and would be selected here instead.
    let fleet = SimFleet::with_default_fleet(FleetConfig {
        sample_rate_hz: cfg.target_hz,
        ..FleetConfig::default()
    })
    .await;
    let transport: Arc<dyn DeviceTransport> = Arc::new(fleet);

    let recorder = Recorder::new(
        Arc::new(FsBlobSink::new(cfg.data_dir.clone())),
        RecorderConfig { spill_dir: cfg.spill_dir.clone(), ..RecorderConfig::default() },
    );
    let timesync = TimeSyncManager::new(
        transport.clone(),
        registry.clone(),
        clock,
        TimeSyncConfig::default(),
    );
    let server = Arc::new(StreamingServer::new(
        cfg.client_queue,
        cfg.client_overrun_limit,
        clock,
    ));

    let coordinator = Arc::new(Coordinator::new(
        cfg.clone(),
        clock,
        transport,
        registry.clone(),
        pipeline.clone(),
        recorder,
        timesync,
        server.clone(),
    ));
    coordinator
        .initialize()
        .await
        .expect("registry initialization cannot fail");

    // Background loops
    pipeline.spawn_tick_loop();
    spawn_motion_broadcast(server.clone(), pipeline.ui().subscribe(), cfg.ui_rate_hz);
    spawn_heartbeat(server.clone(), Duration::from_secs(cfg.heartbeat_secs));
    spawn_device_status_broadcast(server.clone(), registry.clone());

    // HTTP + WebSocket surface
    let state = AppState {
        coordinator,
        server,
        command_timeout: Duration::from_millis(cfg.command_timeout_ms),
    };
    let app = build_router(state);

    let addr = format!("0.0.0.0:{}", cfg.port);
    info!("🚀 Listening on {addr}");
    let listener = tokio::net::TcpListener::bind(&addr).await.unwrap();
    axum::serve(listener, app).await.unwrap();
}
