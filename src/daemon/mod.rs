// src/daemon/mod.rs

//! The daemon control loop.
//!
//! One thread multiplexes every control-plane input (command socket,
//! multisync, bridge data) and runs the per-mode bookkeeping between
//! wakeups: playlist state transitions in player mode, media sync in
//! remote mode, forced frames in bridge mode. Channel rendering itself
//! happens on the output thread; the loop only decides when that thread
//! starts, stops, and is forced.

pub mod collaborators;
pub mod sockets;


use std::cell::Cell;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::{debug, error, info, warn};

use crate::config::OperatingMode;
use crate::daemon::collaborators::{
    BridgeListener, ChannelDataInput, ChannelTester, CommandProcessor, GpioInputs,
    OutputThreadDriver, PlaylistPlayer, SchedulePolicy, SyncPeer,
};
use crate::os::event_loop::Multiplexer;

/// Coarse playback state, shared between the loop and command handlers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FrameStatus {
    #[default]
    Idle,
    PlaylistPlaying,
    StoppingGracefully,
}

impl fmt::Display for FrameStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FrameStatus::Idle => "idle",
            FrameStatus::PlaylistPlaying => "playing",
            FrameStatus::StoppingGracefully => "stopping gracefully",
        };
        f.write_str(name)
    }
}

/// Single-threaded status cell. Everything that mutates playback status
/// runs on the control-loop thread, so a `Cell` suffices.
#[derive(Default)]
pub struct StatusCell(Cell<FrameStatus>);

impl StatusCell {
    pub fn new(initial: FrameStatus) -> Self {
        StatusCell(Cell::new(initial))
    }

    pub fn get(&self) -> FrameStatus {
        self.0.get()
    }

    pub fn set(&self, next: FrameStatus) {
        let prev = self.0.replace(next);
        if prev != next {
            info!("Playback status: {prev} -> {next}");
        }
    }
}

/// Cross-thread shutdown request flag.
#[derive(Clone, Default)]
pub struct RunFlag(Arc<AtomicBool>);

impl RunFlag {
    pub fn new() -> Self {
        RunFlag(Arc::new(AtomicBool::new(false)))
    }

    pub fn is_running(&self) -> bool {
        !self.0.load(Ordering::SeqCst)
    }

    pub fn request_stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

pub const TOKEN_COMMAND: u64 = 1;
pub const TOKEN_CONTROL: u64 = 2;
pub const TOKEN_E131: u64 = 3;
pub const TOKEN_DDP: u64 = 4;

/// Wait between iterations while idle.
const IDLE_WAIT_MS: u64 = 50;
/// Wait between iterations while a playlist or media is active.
const ACTIVE_WAIT_MS: u64 = 10;

/// Everything the loop drives, borrowed for its lifetime.
pub struct Collaborators<'a> {
    pub player: &'a mut dyn PlaylistPlayer,
    pub scheduler: &'a mut dyn SchedulePolicy,
    pub output: &'a mut dyn OutputThreadDriver,
    pub bridge: Option<&'a mut dyn BridgeListener>,
    pub commands: &'a mut dyn CommandProcessor,
    pub sync: &'a mut dyn SyncPeer,
    pub gpio: &'a mut dyn GpioInputs,
    pub tester: &'a dyn ChannelTester,
    pub channel_input: &'a dyn ChannelDataInput,
}

/// Loop settings lifted out of the full daemon config.
#[derive(Debug, Clone, Copy)]
pub struct LoopSettings {
    pub always_transmit: bool,
    pub bridging_interval_ms: u32,
}

pub struct ControlLoop<'a> {
    mux: Multiplexer,
    mode: OperatingMode,
    settings: LoopSettings,
    status: &'a StatusCell,
    prev_status: FrameStatus,
    wait_ms: u64,
    run: RunFlag,
    collab: Collaborators<'a>,
}

impl<'a> ControlLoop<'a> {
    pub fn new(
        mode: OperatingMode,
        settings: LoopSettings,
        status: &'a StatusCell,
        run: RunFlag,
        collab: Collaborators<'a>,
    ) -> anyhow::Result<Self> {
        let mux = Multiplexer::new()?;
        if let Some(fd) = collab.commands.fd() {
            mux.register(fd, TOKEN_COMMAND)?;
        }
        if let Some(fd) = collab.sync.control_fd() {
            mux.register(fd, TOKEN_CONTROL)?;
        }
        if let Some(bridge) = collab.bridge.as_deref() {
            if let Some(fd) = bridge.e131_fd() {
                mux.register(fd, TOKEN_E131)?;
            }
            if let Some(fd) = bridge.ddp_fd() {
                mux.register(fd, TOKEN_DDP)?;
            }
        }
        Ok(ControlLoop {
            mux,
            mode,
            settings,
            status,
            prev_status: FrameStatus::Idle,
            wait_ms: IDLE_WAIT_MS,
            run,
            collab,
        })
    }

    /// Runs until a stop is requested, then tears the subsystems down in
    /// order: output thread first so no frame renders against surfaces
    /// the caller is about to close.
    pub fn run(&mut self) {
        info!("Control loop starting in {:?} mode", self.mode);

        if self.mode == OperatingMode::Player {
            self.collab
                .scheduler
                .check_if_should_be_playing_now(self.status);
            if self.settings.always_transmit && !self.collab.output.is_running() {
                self.start_output_thread();
            }
        }

        while self.run.is_running() {
            let ready: Vec<u64> = match self.mux.wait(self.wait_ms) {
                Ok(events) => events.iter().map(|e| e.token).collect(),
                Err(e) => {
                    error!("Control loop wait failed: {e:#}");
                    break;
                }
            };
            self.iterate(&ready);
        }

        info!("Control loop exiting");
        self.collab.output.stop();
        if let Some(bridge) = self.collab.bridge.as_deref_mut() {
            bridge.shutdown();
        }
    }

    /// One loop iteration: drain ready descriptors, then run the
    /// per-mode bookkeeping.
    fn iterate(&mut self, ready: &[u64]) {
        let mut bridge_data = false;

        for token in ready {
            match *token {
                TOKEN_COMMAND => {
                    if let Err(e) = self.collab.commands.process(self.status, &self.run) {
                        warn!("Command processing failed: {e:#}");
                    }
                }
                TOKEN_CONTROL => {
                    if let Err(e) = self.collab.sync.process_control_packet() {
                        warn!("Sync control packet failed: {e:#}");
                    }
                }
                TOKEN_E131 => {
                    if let Some(bridge) = self.collab.bridge.as_deref_mut() {
                        match bridge.receive_e131() {
                            Ok(got) => bridge_data |= got,
                            Err(e) => warn!("E1.31 receive failed: {e:#}"),
                        }
                    }
                }
                TOKEN_DDP => {
                    if let Some(bridge) = self.collab.bridge.as_deref_mut() {
                        match bridge.receive_ddp() {
                            Ok(got) => bridge_data |= got,
                            Err(e) => warn!("DDP receive failed: {e:#}"),
                        }
                    }
                }
                other => debug!("Spurious readiness token {other}"),
            }
        }

        self.maybe_start_output_thread();

        match self.mode {
            OperatingMode::Player => self.player_tick(),
            OperatingMode::Remote => self.remote_tick(),
            OperatingMode::Bridge => self.bridge_tick(bridge_data),
        }

        self.collab.gpio.poll();
    }

    /// Starts the output thread lazily once anything needs channel data
    /// on the wire. Bridge mode transmits per-packet instead.
    fn maybe_start_output_thread(&mut self) {
        if self.collab.output.is_running() || self.mode == OperatingMode::Bridge {
            return;
        }
        if self.collab.channel_input.active()
            || self.collab.tester.testing()
            || self.settings.always_transmit
        {
            self.start_output_thread();
        }
    }

    fn start_output_thread(&mut self) {
        let interval = self.settings.bridging_interval_ms.max(1);
        self.collab.output.set_refresh_rate(1000 / interval);
        self.collab.output.start();
    }

    fn player_tick(&mut self) {
        let status = self.status.get();

        if status != FrameStatus::Idle {
            if self.prev_status == FrameStatus::Idle {
                self.collab.player.start(self.status);
            }
            // Starting can drop straight back to idle, for example when the
            // requested playlist no longer exists. Re-read before processing.
            if self.status.get() != FrameStatus::Idle {
                self.collab.player.process(self.status);
            }
        }

        let status = self.status.get();
        if status == FrameStatus::Idle {
            if self.prev_status != FrameStatus::Idle {
                self.collab.player.cleanup();
                self.collab.scheduler.reload_current_schedule();
                if !self.collab.player.force_stopped() {
                    self.collab
                        .scheduler
                        .check_if_should_be_playing_now(self.status);
                }
            }
            // A check above may have restarted playback immediately. Reset
            // the previous status so the next iteration runs the playlist
            // startup path again.
            if self.status.get() != FrameStatus::Idle {
                self.prev_status = FrameStatus::Idle;
            } else {
                self.prev_status = status;
            }
        } else {
            self.prev_status = status;
        }

        self.wait_ms = if self.status.get() != FrameStatus::Idle {
            ACTIVE_WAIT_MS
        } else {
            IDLE_WAIT_MS
        };

        self.collab.scheduler.schedule_proc(self.status);
    }

    fn remote_tick(&mut self) {
        if self.collab.player.media_active() {
            self.collab.player.process_media();
            self.wait_ms = ACTIVE_WAIT_MS;
        } else {
            self.wait_ms = IDLE_WAIT_MS;
        }
    }

    fn bridge_tick(&mut self, bridge_data: bool) {
        if bridge_data {
            self.collab.output.force_output_now();
        }
    }

    #[cfg(test)]
    pub(crate) fn wait_ms(&self) -> u64 {
        self.wait_ms
    }

    #[cfg(test)]
    pub(crate) fn tick(&mut self, ready: &[u64]) {
        self.iterate(ready);
    }
}
