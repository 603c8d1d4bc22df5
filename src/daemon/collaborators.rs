// src/daemon/collaborators.rs

//! Seams between the control loop and the subsystems it drives.
//!
//! The loop itself only sequences: what it sequences is expressed as
//! traits so that tests can substitute mocks and so that a build can run
//! with any subset of subsystems wired in. The `Noop*` types are the
//! default implementations for subsystems a deployment does not use.

use std::os::unix::io::RawFd;

use anyhow::Result;

use crate::daemon::{RunFlag, StatusCell};

/// Drives playlist playback in player mode.
pub trait PlaylistPlayer {
    /// Begins playback of whatever the schedule selected.
    fn start(&mut self, status: &StatusCell);
    /// Advances playback by one loop iteration.
    fn process(&mut self, status: &StatusCell);
    /// Releases playback resources after a playlist ends.
    fn cleanup(&mut self);
    /// Advances any media (audio/video) attached to the current entry.
    fn process_media(&mut self);
    /// True while media is attached and playing.
    fn media_active(&self) -> bool;
    /// True when the last playlist was stopped by an operator rather than
    /// running to completion.
    fn force_stopped(&self) -> bool;
}

/// Decides when the player should be playing.
pub trait SchedulePolicy {
    /// Starts playback via the status cell if the schedule says so.
    fn check_if_should_be_playing_now(&mut self, status: &StatusCell);
    /// Re-reads the schedule after a playlist finishes.
    fn reload_current_schedule(&mut self);
    /// Per-iteration schedule bookkeeping while in player mode.
    fn schedule_proc(&mut self, status: &StatusCell);
}

/// Controls the background channel-output thread.
pub trait OutputThreadDriver {
    fn is_running(&self) -> bool;
    /// Sets the frame rate in frames per second. Values below 1 clamp to 1.
    fn set_refresh_rate(&mut self, fps: u32);
    fn start(&mut self);
    fn stop(&mut self);
    /// Wakes the thread for an immediate out-of-cycle frame.
    fn force_output_now(&self);
}

/// Receives channel data pushed over the network in bridge mode.
pub trait BridgeListener {
    fn e131_fd(&self) -> Option<RawFd>;
    fn ddp_fd(&self) -> Option<RawFd>;
    /// Drains pending E1.31 packets. Returns true if channel data arrived.
    fn receive_e131(&mut self) -> Result<bool>;
    /// Drains pending DDP packets. Returns true if channel data arrived.
    fn receive_ddp(&mut self) -> Result<bool>;
    fn shutdown(&mut self);
}

/// Handles operator commands arriving on the control socket.
pub trait CommandProcessor {
    fn fd(&self) -> Option<RawFd>;
    fn process(&mut self, status: &StatusCell, run: &RunFlag) -> Result<()>;
}

/// Handles multisync control packets from a master player.
pub trait SyncPeer {
    fn control_fd(&self) -> Option<RawFd>;
    fn process_control_packet(&mut self) -> Result<()>;
}

/// Polls local GPIO inputs for button/trigger events.
pub trait GpioInputs {
    fn poll(&mut self);
}

/// Reports whether a channel test pattern is active.
pub trait ChannelTester {
    fn testing(&self) -> bool;
}

/// Reports whether an external process is feeding channel data directly
/// (the memory-mapped channel input).
pub trait ChannelDataInput {
    fn active(&self) -> bool;
}

pub struct NoopPlayer;

impl PlaylistPlayer for NoopPlayer {
    fn start(&mut self, _status: &StatusCell) {}
    fn process(&mut self, _status: &StatusCell) {}
    fn cleanup(&mut self) {}
    fn process_media(&mut self) {}
    fn media_active(&self) -> bool {
        false
    }
    fn force_stopped(&self) -> bool {
        false
    }
}

pub struct NoopScheduler;

impl SchedulePolicy for NoopScheduler {
    fn check_if_should_be_playing_now(&mut self, _status: &StatusCell) {}
    fn reload_current_schedule(&mut self) {}
    fn schedule_proc(&mut self, _status: &StatusCell) {}
}

pub struct NoopGpio;

impl GpioInputs for NoopGpio {
    fn poll(&mut self) {}
}

pub struct NoopTester;

impl ChannelTester for NoopTester {
    fn testing(&self) -> bool {
        false
    }
}

pub struct NoopChannelInput;

impl ChannelDataInput for NoopChannelInput {
    fn active(&self) -> bool {
        false
    }
}
