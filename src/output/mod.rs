// src/output/mod.rs

//! The real-time channel-output pipeline: surfaces that render a flat
//! buffer of per-channel color values into a hardware-specific or
//! in-process display target, plus the render thread that drives them.

pub mod blit;
pub mod fb;
pub mod thread;
pub mod virt;

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Errors reported by surface initialization, rendering and teardown.
///
/// These never unwind into the control loop; callers decide whether to
/// disable the surface or abort startup.
#[derive(Debug, Error)]
pub enum OutputError {
    /// Malformed or inconsistent surface configuration. Always fatal to
    /// that surface's initialization and never partially applied.
    #[error("surface configuration: {0}")]
    Config(String),

    /// A device open/ioctl/mmap failure. Fatal to the surface, not the
    /// daemon.
    #[error("device {path}: {op}: {source}")]
    Device {
        path: PathBuf,
        op: &'static str,
        source: io::Error,
    },

    /// An operation on a surface that has already been torn down.
    #[error("surface is closed")]
    Closed,
}

impl OutputError {
    pub(crate) fn device(path: &std::path::Path, op: &'static str) -> Self {
        OutputError::Device {
            path: path.to_path_buf(),
            op,
            source: io::Error::last_os_error(),
        }
    }
}

/// A renderable target for channel data.
///
/// Implementations are owned and driven exclusively by the render thread;
/// the control loop never touches a surface directly. `Send` so the render
/// thread can take ownership.
pub trait OutputSurface: Send {
    /// Renders one frame of channel data. Returns the number of channels
    /// consumed, which is always the surface's full channel count.
    fn render(&mut self, channel_data: &[u8]) -> Result<usize, OutputError>;

    /// Inclusive `[min, max]` global channel indices this surface occupies,
    /// for upstream buffer routing.
    fn channel_range(&self) -> (usize, usize);

    /// Logs the effective configuration at debug level.
    fn dump_config(&self);

    /// Tears the surface down. Safe to call after a partial initialization
    /// failure and safe to call more than once.
    fn close(&mut self) -> Result<(), OutputError>;
}
