// In src/main.rs

// Declare modules
pub mod color;
pub mod config;
pub mod daemon;
pub mod os;
pub mod output;

use std::path::PathBuf;

use anyhow::Context;
use log::{error, info, warn};

use crate::{
    config::{DaemonConfig, OperatingMode, SurfaceConfig, SurfaceKind},
    daemon::collaborators::{
        BridgeListener, NoopChannelInput, NoopGpio, NoopPlayer, NoopScheduler, NoopTester,
    },
    daemon::sockets::{CommandSocket, SyncLink, UdpBridge},
    daemon::{Collaborators, ControlLoop, LoopSettings, RunFlag, StatusCell},
    output::fb::FbMatrixSurface,
    output::thread::{ChannelData, RenderThread},
    output::virt::{PixelLayout, VirtualDisplaySurface},
    output::OutputSurface,
};

/// Builds the surface variant a configuration string selects.
fn build_surface(cfg: SurfaceConfig) -> anyhow::Result<Box<dyn OutputSurface>> {
    match cfg.kind {
        SurfaceKind::Framebuffer => Ok(Box::new(FbMatrixSurface::open(cfg)?)),
        SurfaceKind::Virtual => {
            let layout = match &cfg.pixel_map {
                Some(path) => PixelLayout::load(path)?,
                None => PixelLayout::default(),
            };
            let mut surface = VirtualDisplaySurface::new(
                cfg.width,
                cfg.height,
                cfg.scale,
                cfg.start_channel,
                cfg.channel_count,
                layout,
            )?;
            if let Some(path) = &cfg.background {
                surface.load_background(path, f32::from(cfg.brightness) / 100.0)?;
            }
            Ok(Box::new(surface))
        }
    }
}

/// Main entry point for the `pixeld` daemon.
fn main() -> anyhow::Result<()> {
    // Initialize the logger. Default filter is "info" if RUST_LOG is not set.
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_micros()
        .init();

    info!("Starting pixeld...");

    os::signals::install().context("Failed to install crash handlers")?;

    // --- Configuration ---
    let config = match std::env::args().nth(1) {
        Some(path) => {
            let path = PathBuf::from(path);
            let cfg = DaemonConfig::load(&path)?;
            info!("Configuration loaded from {}", path.display());
            cfg
        }
        None => {
            info!("No settings file given, using defaults.");
            DaemonConfig::default()
        }
    };

    // --- Output surfaces ---
    // A surface that fails to open is skipped, not fatal: the daemon can
    // still bridge or play for the surfaces that did come up.
    let mut surfaces: Vec<Box<dyn OutputSurface>> = Vec::new();
    for entry in &config.surfaces {
        let surface = SurfaceConfig::parse(entry.start_channel, entry.channel_count, &entry.config)
            .map_err(anyhow::Error::from)
            .and_then(build_surface);
        match surface {
            Ok(surface) => surfaces.push(surface),
            Err(e) => error!("Skipping output surface {:?}: {e:#}", entry.config),
        }
    }
    info!("{} output surface(s) configured.", surfaces.len());

    // The channel buffer must cover every surface's range even when the
    // settings file understates it.
    let needed = surfaces
        .iter()
        .map(|s| s.channel_range().1 + 1)
        .max()
        .unwrap_or(0);
    let channel_count = config.channel_count.max(needed);
    let channel_data = ChannelData::new(channel_count);
    info!("Channel buffer: {channel_count} channels.");

    let mut render_thread = RenderThread::new(channel_data.clone(), surfaces);

    // --- Control-plane endpoints ---
    let mut command_socket =
        CommandSocket::bind(&config.command_socket).context("Failed to open command socket")?;
    let mut sync_link =
        SyncLink::bind(config.sync_port).context("Failed to open sync control socket")?;
    let mut bridge = (config.mode == OperatingMode::Bridge)
        .then(|| UdpBridge::bind(config.e131_port, config.ddp_port, channel_data.clone()));

    // --- Collaborators ---
    // The playback and scheduling integrations are external; the no-op
    // defaults keep the loop's sequencing exercised without them.
    let mut player = NoopPlayer;
    let mut scheduler = NoopScheduler;
    let mut gpio = NoopGpio;

    let status = StatusCell::default();
    let run = RunFlag::new();

    let settings = LoopSettings {
        always_transmit: config.always_transmit,
        bridging_interval_ms: config.bridging_interval_ms.clamp(1, 1000) as u32,
    };

    let mut control_loop = ControlLoop::new(
        config.mode,
        settings,
        &status,
        run,
        Collaborators {
            player: &mut player,
            scheduler: &mut scheduler,
            output: &mut render_thread,
            bridge: bridge.as_mut().map(|b| b as &mut dyn BridgeListener),
            commands: &mut command_socket,
            sync: &mut sync_link,
            gpio: &mut gpio,
            tester: &NoopTester,
            channel_input: &NoopChannelInput,
        },
    )
    .context("Failed to initialize control loop")?;

    // --- Main event loop ---
    control_loop.run();
    drop(control_loop);

    // --- Cleanup ---
    // The loop already stopped the render thread; reclaim the surfaces and
    // close them so framebuffer modes are restored before exit.
    info!("Closing output surfaces...");
    for mut surface in render_thread.into_surfaces() {
        if let Err(e) = surface.close() {
            warn!("Surface close failed: {e}");
        }
    }

    os::signals::uninstall();
    info!("pixeld exited successfully.");
    Ok(())
}
