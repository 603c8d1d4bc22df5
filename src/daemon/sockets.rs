// src/daemon/sockets.rs

//! Concrete control-plane endpoints: the operator command socket, the
//! multisync control port, and the bridge-mode data ports. Protocol
//! decoding beyond the command vocabulary lives in the collaborators
//! that consume these feeds; the sockets here only move bytes.

use std::io;
use std::net::UdpSocket;
use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::net::UnixDatagram;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use log::{debug, info, warn};

use crate::daemon::collaborators::{BridgeListener, CommandProcessor, SyncPeer};
use crate::daemon::{FrameStatus, RunFlag, StatusCell};
use crate::output::thread::ChannelData;

const MAX_DATAGRAM: usize = 65536;

/// Unix datagram socket taking text commands from local controllers.
pub struct CommandSocket {
    socket: UnixDatagram,
    path: PathBuf,
    buf: Box<[u8; MAX_DATAGRAM]>,
}

impl CommandSocket {
    pub fn bind(path: &Path) -> Result<Self> {
        // A stale socket file from a previous run would make bind fail.
        if path.exists() {
            std::fs::remove_file(path)
                .with_context(|| format!("Failed to remove stale socket {}", path.display()))?;
        }
        let socket = UnixDatagram::bind(path)
            .with_context(|| format!("Failed to bind command socket {}", path.display()))?;
        socket
            .set_nonblocking(true)
            .context("Failed to set command socket nonblocking")?;
        info!("Command socket listening at {}", path.display());
        Ok(CommandSocket {
            socket,
            path: path.to_path_buf(),
            buf: Box::new([0u8; MAX_DATAGRAM]),
        })
    }

    fn dispatch(command: &str, status: &StatusCell, run: &RunFlag) {
        match command {
            "start" => {
                if status.get() == FrameStatus::Idle {
                    status.set(FrameStatus::PlaylistPlaying);
                } else {
                    debug!("Ignoring start command while {}", status.get());
                }
            }
            "stop" => {
                if status.get() == FrameStatus::PlaylistPlaying {
                    status.set(FrameStatus::StoppingGracefully);
                }
            }
            "stopnow" => status.set(FrameStatus::Idle),
            "shutdown" => {
                info!("Shutdown requested over command socket");
                run.request_stop();
            }
            other => warn!("Unknown command: {other:?}"),
        }
    }
}

impl CommandProcessor for CommandSocket {
    fn fd(&self) -> Option<RawFd> {
        Some(self.socket.as_raw_fd())
    }

    fn process(&mut self, status: &StatusCell, run: &RunFlag) -> Result<()> {
        loop {
            match self.socket.recv(&mut self.buf[..]) {
                Ok(len) => {
                    let text = String::from_utf8_lossy(&self.buf[..len]);
                    let command = text.trim();
                    debug!("Command received: {command:?}");
                    Self::dispatch(command, status, run);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) => return Err(e).context("Command socket receive failed"),
            }
        }
    }
}

impl Drop for CommandSocket {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != io::ErrorKind::NotFound {
                warn!("Failed to remove socket {}: {e}", self.path.display());
            }
        }
    }
}

/// Multisync control port. Packets are drained here and handed to the
/// sync collaborator for decoding in a fuller deployment; standalone, the
/// port is drained and counted so a master's traffic never backs up.
pub struct SyncLink {
    socket: UdpSocket,
    buf: Box<[u8; MAX_DATAGRAM]>,
    packets: u64,
}

impl SyncLink {
    pub fn bind(port: u16) -> Result<Self> {
        let socket = UdpSocket::bind(("0.0.0.0", port))
            .with_context(|| format!("Failed to bind sync control port {port}"))?;
        socket
            .set_nonblocking(true)
            .context("Failed to set sync socket nonblocking")?;
        info!("Sync control socket listening on port {port}");
        Ok(SyncLink {
            socket,
            buf: Box::new([0u8; MAX_DATAGRAM]),
            packets: 0,
        })
    }
}

impl SyncPeer for SyncLink {
    fn control_fd(&self) -> Option<RawFd> {
        Some(self.socket.as_raw_fd())
    }

    fn process_control_packet(&mut self) -> Result<()> {
        loop {
            match self.socket.recv(&mut self.buf[..]) {
                Ok(len) => {
                    self.packets += 1;
                    debug!("Sync control packet #{}: {len} bytes", self.packets);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) => return Err(e).context("Sync socket receive failed"),
            }
        }
    }
}

/// Bridge-mode data ports. A received datagram's payload lands at the
/// start of the shared channel buffer; decoding the E1.31 or DDP framing
/// around it is the bridge collaborator's business.
pub struct UdpBridge {
    e131: Option<UdpSocket>,
    ddp: Option<UdpSocket>,
    data: ChannelData,
    buf: Box<[u8; MAX_DATAGRAM]>,
}

impl UdpBridge {
    pub fn bind(e131_port: u16, ddp_port: u16, data: ChannelData) -> Self {
        UdpBridge {
            e131: Self::bind_port("E1.31", e131_port),
            ddp: Self::bind_port("DDP", ddp_port),
            data,
            buf: Box::new([0u8; MAX_DATAGRAM]),
        }
    }

    // Absence of one bridge port is not fatal; the other may still feed us.
    fn bind_port(name: &str, port: u16) -> Option<UdpSocket> {
        match UdpSocket::bind(("0.0.0.0", port)) {
            Ok(socket) => match socket.set_nonblocking(true) {
                Ok(()) => {
                    info!("{name} bridge socket listening on port {port}");
                    Some(socket)
                }
                Err(e) => {
                    warn!("Failed to set {name} socket nonblocking: {e}");
                    None
                }
            },
            Err(e) => {
                warn!("Failed to bind {name} bridge port {port}: {e}");
                None
            }
        }
    }

    fn drain(
        socket: &UdpSocket,
        buf: &mut [u8],
        data: &ChannelData,
        name: &str,
    ) -> Result<bool> {
        let mut got = false;
        loop {
            match socket.recv(buf) {
                Ok(len) => {
                    data.write_at(0, &buf[..len]);
                    got = true;
                    debug!("{name} datagram: {len} bytes of channel data");
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(got),
                Err(e) => return Err(e).context("Bridge socket receive failed"),
            }
        }
    }
}

impl BridgeListener for UdpBridge {
    fn e131_fd(&self) -> Option<RawFd> {
        self.e131.as_ref().map(|s| s.as_raw_fd())
    }

    fn ddp_fd(&self) -> Option<RawFd> {
        self.ddp.as_ref().map(|s| s.as_raw_fd())
    }

    fn receive_e131(&mut self) -> Result<bool> {
        match &self.e131 {
            Some(socket) => Self::drain(socket, &mut self.buf[..], &self.data, "E1.31"),
            None => Ok(false),
        }
    }

    fn receive_ddp(&mut self) -> Result<bool> {
        match &self.ddp {
            Some(socket) => Self::drain(socket, &mut self.buf[..], &self.data, "DDP"),
            None => Ok(false),
        }
    }

    fn shutdown(&mut self) {
        if self.e131.take().is_some() {
            debug!("E1.31 bridge socket closed");
        }
        if self.ddp.take().is_some() {
            debug!("DDP bridge socket closed");
        }
    }
}
