// src/output/fb.rs

//! Framebuffer-backed output surface.
//!
//! Negotiates geometry and bit depth with a memory-mapped framebuffer
//! device via the fb ioctl interface, then renders every frame through the
//! shared `FrameBlitter`. When driving the primary console framebuffer the
//! text console is switched to graphics mode for the lifetime of the
//! surface so terminal output cannot corrupt the display.

use std::ffi::CString;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::io::RawFd;
use std::path::Path;
use std::ptr;
use std::slice;

use log::{debug, error, info, warn};

use crate::color::Bitfield;
use crate::config::SurfaceConfig;
use crate::output::blit::{FrameBlitter, PixelDepth};
use crate::output::{OutputError, OutputSurface};

const FBIOGET_VSCREENINFO: libc::c_ulong = 0x4600;
const FBIOPUT_VSCREENINFO: libc::c_ulong = 0x4601;
const FBIOGET_FSCREENINFO: libc::c_ulong = 0x4602;
const KDSETMODE: libc::c_ulong = 0x4B3A;
const KD_TEXT: libc::c_int = 0x00;
const KD_GRAPHICS: libc::c_int = 0x01;

/// The device whose text console must be hidden while rendering.
const CONSOLE_FB: &str = "/dev/fb0";
const CONSOLE_TTY: &str = "/dev/console";

/// Mirror of `struct fb_bitfield` from `linux/fb.h`.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct FbBitfield {
    pub offset: u32,
    pub length: u32,
    pub msb_right: u32,
}

impl From<FbBitfield> for Bitfield {
    fn from(f: FbBitfield) -> Self {
        Bitfield {
            offset: f.offset,
            length: f.length,
        }
    }
}

/// Mirror of `struct fb_var_screeninfo` from `linux/fb.h`.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct FbVarScreeninfo {
    pub xres: u32,
    pub yres: u32,
    pub xres_virtual: u32,
    pub yres_virtual: u32,
    pub xoffset: u32,
    pub yoffset: u32,
    pub bits_per_pixel: u32,
    pub grayscale: u32,
    pub red: FbBitfield,
    pub green: FbBitfield,
    pub blue: FbBitfield,
    pub transp: FbBitfield,
    pub nonstd: u32,
    pub activate: u32,
    pub height: u32,
    pub width: u32,
    pub accel_flags: u32,
    pub pixclock: u32,
    pub left_margin: u32,
    pub right_margin: u32,
    pub upper_margin: u32,
    pub lower_margin: u32,
    pub hsync_len: u32,
    pub vsync_len: u32,
    pub sync: u32,
    pub vmode: u32,
    pub rotate: u32,
    pub colorspace: u32,
    pub reserved: [u32; 4],
}

/// Mirror of `struct fb_fix_screeninfo` from `linux/fb.h`.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct FbFixScreeninfo {
    pub id: [u8; 16],
    pub smem_start: libc::c_ulong,
    pub smem_len: u32,
    pub type_: u32,
    pub type_aux: u32,
    pub visual: u32,
    pub xpanstep: u16,
    pub ypanstep: u16,
    pub ywrapstep: u16,
    pub line_length: u32,
    pub mmio_start: libc::c_ulong,
    pub mmio_len: u32,
    pub accel: u32,
    pub capabilities: u16,
    pub reserved: [u16; 2],
}

impl Default for FbFixScreeninfo {
    fn default() -> Self {
        // All-zero is a valid resting state for a plain C struct.
        unsafe { std::mem::zeroed() }
    }
}

nix::ioctl_read_bad!(fb_get_vscreeninfo, FBIOGET_VSCREENINFO, FbVarScreeninfo);
nix::ioctl_write_ptr_bad!(fb_put_vscreeninfo, FBIOPUT_VSCREENINFO, FbVarScreeninfo);
nix::ioctl_read_bad!(fb_get_fscreeninfo, FBIOGET_FSCREENINFO, FbFixScreeninfo);
nix::ioctl_write_int_bad!(kd_set_mode, KDSETMODE);

/// An output surface writing directly into a memory-mapped framebuffer.
///
/// The mapped region and diff snapshot are touched only by the render
/// thread; the control loop merely owns the start/stop ordering.
pub struct FbMatrixSurface {
    config: SurfaceConfig,
    fb_fd: RawFd,
    tty_fd: RawFd,
    mapped: *mut u8,
    screen_size: usize,
    var_orig: FbVarScreeninfo,
    /// Set once the device's video mode has been mutated; close restores
    /// the captured original mode only in that case.
    restore_mode: bool,
    blitter: FrameBlitter,
}

// The raw mapping pointer is exclusively owned and only dereferenced
// through `render`, which takes `&mut self`.
unsafe impl Send for FbMatrixSurface {}

impl FbMatrixSurface {
    /// Opens and configures the framebuffer device described by `config`.
    ///
    /// On any failure after the device's video mode has been committed,
    /// the captured original mode is restored before returning: no partial
    /// mutation of global device state survives a failed open.
    pub fn open(config: SurfaceConfig) -> Result<Self, OutputError> {
        debug!(
            "FbMatrixSurface::open({}, {}x{})",
            config.device.display(),
            config.width,
            config.height
        );

        let fd = open_rdwr(&config.device)?;

        let mut vinfo = FbVarScreeninfo::default();
        if let Err(e) = unsafe { fb_get_vscreeninfo(fd, &mut vinfo) } {
            close_fd(fd);
            return Err(deverr(&config.device, "FBIOGET_VSCREENINFO", e));
        }
        let var_orig = vinfo;

        // 32-bit reports are driven as 24-bit; anything else but 16/24 is
        // unsupported.
        if vinfo.bits_per_pixel == 32 {
            vinfo.bits_per_pixel = 24;
        }
        let bpp = vinfo.bits_per_pixel as usize;
        debug!("FrameBuffer is using {bpp} BPP");
        if bpp != 16 && bpp != 24 {
            close_fd(fd);
            return Err(OutputError::Config(format!(
                "do not know how to handle {bpp} BPP"
            )));
        }

        if bpp == 16 {
            // Force the committed layout to RGB565.
            vinfo.red = FbBitfield {
                offset: 11,
                length: 5,
                msb_right: 0,
            };
            vinfo.green = FbBitfield {
                offset: 5,
                length: 6,
                msb_right: 0,
            };
            vinfo.blue = FbBitfield {
                offset: 0,
                length: 5,
                msb_right: 0,
            };
            vinfo.transp = FbBitfield::default();
        }

        vinfo.xres = config.width as u32;
        vinfo.xres_virtual = config.width as u32;
        vinfo.yres = config.height as u32;
        vinfo.yres_virtual = config.height as u32;

        if let Err(e) = unsafe { fb_put_vscreeninfo(fd, &vinfo) } {
            close_fd(fd);
            return Err(deverr(&config.device, "FBIOPUT_VSCREENINFO", e));
        }
        // The device mode is mutated from here on; every failure path must
        // restore `var_orig`.

        // The driver is free to adjust the requested mode, writing what it
        // actually accepted back into the var info. Read that back and run
        // the rest of the setup against the accepted mode, not the request.
        if let Err(e) = unsafe { fb_get_vscreeninfo(fd, &mut vinfo) } {
            restore_and_close(fd, &config.device, &var_orig);
            return Err(deverr(&config.device, "FBIOGET_VSCREENINFO", e));
        }
        if vinfo.bits_per_pixel == 32 {
            vinfo.bits_per_pixel = 24;
        }
        let bpp = vinfo.bits_per_pixel as usize;

        let mut finfo = FbFixScreeninfo::default();
        if let Err(e) = unsafe { fb_get_fscreeninfo(fd, &mut finfo) } {
            restore_and_close(fd, &config.device, &var_orig);
            return Err(deverr(&config.device, "FBIOGET_FSCREENINFO", e));
        }

        let screen_size = match accepted_screen_size(&vinfo, &config) {
            Ok(size) => size,
            Err(e) => {
                restore_and_close(fd, &config.device, &var_orig);
                return Err(e);
            }
        };
        if config.channel_count != config.width * config.height * 3 {
            restore_and_close(fd, &config.device, &var_orig);
            return Err(OutputError::Config(format!(
                "channel count {} does not cover {}x{} pixels",
                config.channel_count, config.width, config.height
            )));
        }

        // Hide the text console while we own the primary framebuffer.
        let tty_fd = if config.device == Path::new(CONSOLE_FB) {
            let tty = match open_rdwr(Path::new(CONSOLE_TTY)) {
                Ok(fd) => fd,
                Err(e) => {
                    restore_and_close(fd, &config.device, &var_orig);
                    return Err(e);
                }
            };
            if let Err(e) = unsafe { kd_set_mode(tty, KD_GRAPHICS) } {
                close_fd(tty);
                restore_and_close(fd, &config.device, &var_orig);
                return Err(deverr(&config.device, "KDSETMODE KD_GRAPHICS", e));
            }
            tty
        } else {
            -1
        };

        let mapped = unsafe {
            libc::mmap(
                ptr::null_mut(),
                screen_size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                0,
            )
        };
        if mapped == libc::MAP_FAILED {
            let e = OutputError::device(&config.device, "mmap");
            if tty_fd >= 0 {
                let _ = unsafe { kd_set_mode(tty_fd, KD_TEXT) };
                close_fd(tty_fd);
            }
            restore_and_close(fd, &config.device, &var_orig);
            return Err(e);
        }

        let depth = if bpp == 16 {
            PixelDepth::Bpp16 {
                red: vinfo.red.into(),
                green: vinfo.green.into(),
                blue: vinfo.blue.into(),
            }
        } else {
            PixelDepth::Bpp24
        };
        let blitter = match FrameBlitter::new(
            config.width,
            config.height,
            config.color_order,
            config.inverted,
            depth,
        ) {
            Ok(b) => b,
            Err(e) => {
                unsafe { libc::munmap(mapped as *mut libc::c_void, screen_size) };
                if tty_fd >= 0 {
                    let _ = unsafe { kd_set_mode(tty_fd, KD_TEXT) };
                    close_fd(tty_fd);
                }
                restore_and_close(fd, &config.device, &var_orig);
                return Err(e);
            }
        };

        info!(
            "Framebuffer surface ready on {} ({}x{} @ {bpp} BPP, {} channels)",
            config.device.display(),
            config.width,
            config.height,
            config.channel_count
        );

        Ok(FbMatrixSurface {
            config,
            fb_fd: fd,
            tty_fd,
            mapped: mapped as *mut u8,
            screen_size,
            var_orig,
            restore_mode: true,
            blitter,
        })
    }
}

impl OutputSurface for FbMatrixSurface {
    fn render(&mut self, channel_data: &[u8]) -> Result<usize, OutputError> {
        if self.mapped.is_null() {
            return Err(OutputError::Closed);
        }
        if channel_data.len() < self.config.channel_count {
            return Err(OutputError::Config(format!(
                "render called with {} channels, surface needs {}",
                channel_data.len(),
                self.config.channel_count
            )));
        }
        let dst = unsafe { slice::from_raw_parts_mut(self.mapped, self.screen_size) };
        Ok(self
            .blitter
            .blit(&channel_data[..self.config.channel_count], dst))
    }

    fn channel_range(&self) -> (usize, usize) {
        let start = self.config.start_channel;
        (start, start + self.config.width * self.config.height * 3 - 1)
    }

    fn dump_config(&self) {
        debug!("FbMatrixSurface::dump_config()");
        debug!("    device : {}", self.config.device.display());
        debug!("    width  : {}", self.config.width);
        debug!("    height : {}", self.config.height);
        debug!("    order  : {:?}", self.config.color_order);
        debug!("    invert : {}", self.config.inverted);
    }

    /// Unmaps the device, restores the captured video mode (best effort),
    /// re-enables the text console and closes all descriptors. Idempotent,
    /// and safe after a partial open failure.
    fn close(&mut self) -> Result<(), OutputError> {
        if !self.mapped.is_null() {
            if unsafe { libc::munmap(self.mapped as *mut libc::c_void, self.screen_size) } != 0 {
                warn!(
                    "munmap of {} failed: {}",
                    self.config.device.display(),
                    std::io::Error::last_os_error()
                );
            }
            self.mapped = ptr::null_mut();
        }

        if self.fb_fd >= 0 {
            if self.restore_mode {
                if let Err(e) = unsafe { fb_put_vscreeninfo(self.fb_fd, &self.var_orig) } {
                    error!(
                        "Error restoring video mode on {}: {e}",
                        self.config.device.display()
                    );
                }
                self.restore_mode = false;
            }
            close_fd(self.fb_fd);
            self.fb_fd = -1;
        }

        if self.tty_fd >= 0 {
            if let Err(e) = unsafe { kd_set_mode(self.tty_fd, KD_TEXT) } {
                error!("Error re-enabling text console: {e}");
            }
            close_fd(self.tty_fd);
            self.tty_fd = -1;
        }

        Ok(())
    }
}

impl Drop for FbMatrixSurface {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            error!("FbMatrixSurface close during drop failed: {e}");
        }
    }
}

fn open_rdwr(path: &Path) -> Result<RawFd, OutputError> {
    let cpath = CString::new(path.as_os_str().as_bytes())
        .map_err(|_| OutputError::Config(format!("device path {} contains NUL", path.display())))?;
    let fd = unsafe { libc::open(cpath.as_ptr(), libc::O_RDWR) };
    if fd < 0 {
        return Err(OutputError::device(path, "open"));
    }
    Ok(fd)
}

fn close_fd(fd: RawFd) {
    if unsafe { libc::close(fd) } != 0 {
        warn!("close({fd}) failed: {}", std::io::Error::last_os_error());
    }
}

/// Screen size in bytes for the mode the device accepted, checked against
/// the configured layout. The driver may hand back a different geometry or
/// depth than the one requested.
fn accepted_screen_size(
    vinfo: &FbVarScreeninfo,
    config: &SurfaceConfig,
) -> Result<usize, OutputError> {
    let bpp = vinfo.bits_per_pixel as usize;
    if bpp != 16 && bpp != 24 {
        return Err(OutputError::Config(format!(
            "device committed an unsupported {bpp} BPP mode"
        )));
    }
    if vinfo.xres as usize != config.width || vinfo.yres as usize != config.height {
        return Err(OutputError::Config(format!(
            "device accepted {}x{}, layout wants {}x{}",
            vinfo.xres, vinfo.yres, config.width, config.height
        )));
    }
    Ok(config.width * config.height * bpp / 8)
}

/// Failed-open cleanup: put the captured mode back and release the device.
fn restore_and_close(fd: RawFd, path: &Path, orig: &FbVarScreeninfo) {
    if let Err(e) = unsafe { fb_put_vscreeninfo(fd, orig) } {
        error!("Error restoring video mode on {}: {e}", path.display());
    }
    close_fd(fd);
}

fn deverr(path: &Path, op: &'static str, errno: nix::errno::Errno) -> OutputError {
    OutputError::Device {
        path: path.to_path_buf(),
        op,
        source: std::io::Error::from_raw_os_error(errno as i32),
    }
}
