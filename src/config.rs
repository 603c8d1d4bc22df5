// src/config.rs

//! Daemon settings and surface configuration parsing.
//!
//! The daemon settings file is JSON, deserialized with serde; every field
//! has a sensible default so a missing or partial file still yields a
//! runnable configuration. Surface configuration uses the compact
//! semicolon-separated `key=value` string format consumed by surface
//! initialization.

use std::fs::File;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::color::ColorOrder;
use crate::output::OutputError;

/// Operating mode, selected once at startup. Modes are orthogonal to the
/// playback status state machine and never transition at runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum OperatingMode {
    /// Plays local playlists under scheduler control.
    #[default]
    Player,
    /// Relays externally received show data straight to outputs.
    Bridge,
    /// Follows a remote master's media cues.
    Remote,
}

/// Top-level daemon settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    pub mode: OperatingMode,
    /// Keep the output thread transmitting even with nothing playing.
    pub always_transmit: bool,
    /// Target output interval in milliseconds; the output thread's refresh
    /// rate is derived as `1000 / interval` before it starts.
    pub bridging_interval_ms: u64,
    /// Path of the Unix datagram command socket.
    pub command_socket: PathBuf,
    /// UDP port of the multi-host sync control socket.
    pub sync_port: u16,
    /// UDP port for E1.31/sACN bridge input.
    pub e131_port: u16,
    /// UDP port for DDP bridge input.
    pub ddp_port: u16,
    /// Size of the global flat channel buffer.
    pub channel_count: usize,
    /// Output surfaces, each mapped onto a channel range.
    pub surfaces: Vec<SurfaceEntry>,
}

/// One configured output surface: its slice of the channel buffer plus
/// the device-specific configuration string.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SurfaceEntry {
    pub start_channel: usize,
    pub channel_count: usize,
    pub config: String,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        DaemonConfig {
            mode: OperatingMode::Player,
            always_transmit: false,
            bridging_interval_ms: 50,
            command_socket: PathBuf::from("/tmp/pixeld.sock"),
            sync_port: 32320,
            e131_port: 5568,
            ddp_port: 4048,
            channel_count: 0,
            surfaces: Vec::new(),
        }
    }
}

impl DaemonConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let file = File::open(path)
            .with_context(|| format!("Failed to open settings file {}", path.display()))?;
        serde_json::from_reader(file)
            .with_context(|| format!("Failed to parse settings file {}", path.display()))
    }
}

/// Directory under which surface `device=` names are resolved.
const DEVICE_DIR: &str = "/dev";

/// Which surface implementation a configuration string selects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SurfaceKind {
    #[default]
    Framebuffer,
    Virtual,
}

/// Immutable per-surface configuration, parsed from a semicolon-separated
/// `key=value` string.
///
/// Invariant: `channel_count == width * height * 3`. Violating
/// configurations fail parsing; they are never silently truncated.
#[derive(Debug, Clone)]
pub struct SurfaceConfig {
    pub kind: SurfaceKind,
    pub width: usize,
    pub height: usize,
    pub color_order: ColorOrder,
    pub inverted: bool,
    pub device: PathBuf,
    pub start_channel: usize,
    pub channel_count: usize,
    /// Pixel layout file for virtual surfaces.
    pub pixel_map: Option<PathBuf>,
    /// Logical pixel block size for virtual surfaces.
    pub scale: usize,
    /// Optional background image for virtual surfaces, with a 0..=100
    /// brightness percentage applied at load.
    pub background: Option<PathBuf>,
    pub brightness: u8,
}

impl SurfaceConfig {
    /// Parses a configuration string such as
    /// `layout=64x32;colorOrder=RGB;invert=0;device=fb1`.
    ///
    /// Unknown keys are ignored. A `layout` value without an `x` separator
    /// is a hard failure, as is a channel count that does not match the
    /// parsed geometry.
    pub fn parse(
        start_channel: usize,
        channel_count: usize,
        config_str: &str,
    ) -> Result<Self, OutputError> {
        let mut kind = SurfaceKind::default();
        let mut width = 0usize;
        let mut height = 0usize;
        let mut color_order = ColorOrder::default();
        let mut inverted = false;
        let mut device = PathBuf::from(DEVICE_DIR).join("fb0");
        let mut pixel_map = None;
        let mut scale = 1usize;
        let mut background = None;
        let mut brightness = 100u8;

        for elem in config_str.split(';') {
            let Some((key, value)) = elem.split_once('=') else {
                continue;
            };
            match key {
                "layout" => {
                    let (w, h) = value.split_once('x').ok_or_else(|| {
                        OutputError::Config(format!("malformed layout '{value}': missing 'x'"))
                    })?;
                    width = w.parse().map_err(|_| {
                        OutputError::Config(format!("malformed layout width '{w}'"))
                    })?;
                    height = h.parse().map_err(|_| {
                        OutputError::Config(format!("malformed layout height '{h}'"))
                    })?;
                }
                "colorOrder" => {
                    color_order = ColorOrder::from_name(value).ok_or_else(|| {
                        OutputError::Config(format!("unknown colorOrder '{value}'"))
                    })?;
                }
                "invert" => {
                    inverted = value != "0";
                }
                "device" => {
                    device = PathBuf::from(DEVICE_DIR).join(value);
                }
                "type" => {
                    kind = match value {
                        "fb" => SurfaceKind::Framebuffer,
                        "virtual" => SurfaceKind::Virtual,
                        other => {
                            return Err(OutputError::Config(format!(
                                "unknown surface type '{other}'"
                            )))
                        }
                    };
                }
                "pixelMap" => {
                    pixel_map = Some(PathBuf::from(value));
                }
                "scale" => {
                    scale = value.parse().map_err(|_| {
                        OutputError::Config(format!("malformed scale '{value}'"))
                    })?;
                }
                "background" => {
                    background = Some(PathBuf::from(value));
                }
                "brightness" => {
                    brightness = value.parse().map_err(|_| {
                        OutputError::Config(format!("malformed brightness '{value}'"))
                    })?;
                }
                _ => {
                    log::debug!("Ignoring unknown surface config key '{key}'");
                }
            }
        }

        if channel_count != width * height * 3 {
            return Err(OutputError::Config(format!(
                "channel count {} does not match layout {}x{} (expected {})",
                channel_count,
                width,
                height,
                width * height * 3
            )));
        }

        Ok(SurfaceConfig {
            kind,
            width,
            height,
            color_order,
            inverted,
            device,
            start_channel,
            channel_count,
            pixel_map,
            scale,
            background,
            brightness,
        })
    }
}
