// src/output/thread.rs

//! The dedicated rendering thread and the shared channel-data buffer it
//! consumes.
//!
//! The control loop owns this driver's lifecycle but never renders: it
//! starts the thread, stops it (joining before any surface is closed), and
//! may request an out-of-band render that bypasses the periodic timer.

use std::mem;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use log::{debug, error, info, warn};

use crate::daemon::collaborators::OutputThreadDriver;
use crate::output::OutputSurface;

/// The daemon-wide flat channel buffer. Written by upstream collaborators
/// (playlist engine, network bridge), read by the render thread. Each
/// render pass works from a snapshot copy, so a frame is internally stable
/// even while writers keep going.
#[derive(Clone)]
pub struct ChannelData {
    inner: Arc<Mutex<Vec<u8>>>,
}

impl ChannelData {
    pub fn new(len: usize) -> Self {
        ChannelData {
            inner: Arc::new(Mutex::new(vec![0u8; len])),
        }
    }

    pub fn len(&self) -> usize {
        lock_ignoring_poison(&self.inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copies `bytes` into the buffer at `offset`, clamped to the buffer
    /// end.
    pub fn write_at(&self, offset: usize, bytes: &[u8]) {
        let mut data = lock_ignoring_poison(&self.inner);
        let len = data.len();
        if offset >= len {
            warn!("channel write at offset {offset} past buffer end {len}");
            return;
        }
        let n = bytes.len().min(len - offset);
        data[offset..offset + n].copy_from_slice(&bytes[..n]);
    }

    /// Snapshots the current contents into `frame`, resizing it to match.
    pub fn snapshot_into(&self, frame: &mut Vec<u8>) {
        let data = lock_ignoring_poison(&self.inner);
        frame.clear();
        frame.extend_from_slice(&data);
    }
}

fn lock_ignoring_poison<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    // A panicking render pass must not wedge the daemon's shutdown path.
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

#[derive(Default)]
struct ThreadState {
    stop: bool,
    force: bool,
    running: bool,
}

struct Shared {
    state: Mutex<ThreadState>,
    cond: Condvar,
    /// Surfaces parked here while the thread is not running; the thread
    /// takes them at start and returns them on exit, which is what makes
    /// "join before close" enforceable.
    surfaces: Mutex<Option<Vec<Box<dyn OutputSurface>>>>,
}

/// Drives the output surfaces on a timer, with force-now override.
pub struct RenderThread {
    shared: Arc<Shared>,
    data: ChannelData,
    handle: Option<JoinHandle<()>>,
    refresh_rate: u32,
}

impl RenderThread {
    pub fn new(data: ChannelData, surfaces: Vec<Box<dyn OutputSurface>>) -> Self {
        for s in &surfaces {
            s.dump_config();
        }
        RenderThread {
            shared: Arc::new(Shared {
                state: Mutex::new(ThreadState::default()),
                cond: Condvar::new(),
                surfaces: Mutex::new(Some(surfaces)),
            }),
            data,
            handle: None,
            refresh_rate: 20,
        }
    }

    /// Stops the thread and hands the surfaces back for teardown. The
    /// thread is joined first, so closing them afterwards is safe.
    pub fn into_surfaces(mut self) -> Vec<Box<dyn OutputSurface>> {
        self.stop();
        lock_ignoring_poison(&self.shared.surfaces)
            .take()
            .unwrap_or_default()
    }

    fn thread_main(shared: Arc<Shared>, data: ChannelData, refresh_rate: u32) {
        let interval = Duration::from_millis(1000 / u64::from(refresh_rate.max(1)));
        debug!("Render thread running at {refresh_rate} fps ({interval:?})");

        let Some(mut surfaces) = lock_ignoring_poison(&shared.surfaces).take() else {
            error!("Render thread started with no surfaces to drive");
            return;
        };

        let mut frame = Vec::new();
        loop {
            let mut state = lock_ignoring_poison(&shared.state);
            let deadline = Instant::now() + interval;
            while !state.stop && !state.force {
                let now = Instant::now();
                if now >= deadline {
                    break;
                }
                let (guard, _timeout) = shared
                    .cond
                    .wait_timeout(state, deadline - now)
                    .unwrap_or_else(|e| e.into_inner());
                state = guard;
            }
            let stop = state.stop;
            let forced = mem::take(&mut state.force);
            drop(state);

            if stop {
                break;
            }
            if forced {
                debug!("Out-of-band render requested");
            }

            data.snapshot_into(&mut frame);
            render_frame(&mut surfaces, &frame);
        }

        *lock_ignoring_poison(&shared.surfaces) = Some(surfaces);
        debug!("Render thread exited");
    }
}

/// Drives one frame through every surface, handing each the slice of the
/// global buffer its channel range claims.
fn render_frame(surfaces: &mut [Box<dyn OutputSurface>], frame: &[u8]) {
    for surface in surfaces {
        let (start, end) = surface.channel_range();
        if start >= frame.len() {
            warn!(
                "Surface channels {start}..={end} start past frame end {}",
                frame.len()
            );
            continue;
        }
        let end = end.min(frame.len() - 1);
        if let Err(e) = surface.render(&frame[start..=end]) {
            error!("Surface render failed: {e}");
        }
    }
}

impl OutputThreadDriver for RenderThread {
    fn is_running(&self) -> bool {
        lock_ignoring_poison(&self.shared.state).running
    }

    fn set_refresh_rate(&mut self, fps: u32) {
        self.refresh_rate = fps.max(1);
    }

    fn start(&mut self) {
        let mut state = lock_ignoring_poison(&self.shared.state);
        if state.running {
            return;
        }
        state.stop = false;
        state.force = false;
        state.running = true;
        drop(state);

        info!("Starting channel output thread at {} fps", self.refresh_rate);
        let shared = Arc::clone(&self.shared);
        let data = self.data.clone();
        let rate = self.refresh_rate;
        self.handle = Some(std::thread::spawn(move || {
            Self::thread_main(shared, data, rate);
        }));
    }

    fn stop(&mut self) {
        {
            let mut state = lock_ignoring_poison(&self.shared.state);
            if !state.running {
                return;
            }
            state.stop = true;
            state.running = false;
        }
        self.shared.cond.notify_all();
        if let Some(handle) = self.handle.take() {
            info!("Stopping channel output thread");
            if handle.join().is_err() {
                error!("Render thread panicked before join");
            }
        }
    }

    fn force_output_now(&self) {
        let mut state = lock_ignoring_poison(&self.shared.state);
        if !state.running {
            // No thread to wake, so render the parked surfaces in place.
            // Bridge mode relies on this path: it never starts the timer
            // thread, yet arriving network data must still reach the
            // hardware.
            drop(state);
            let mut parked = lock_ignoring_poison(&self.shared.surfaces);
            if let Some(surfaces) = parked.as_mut() {
                let mut frame = Vec::new();
                self.data.snapshot_into(&mut frame);
                render_frame(surfaces, &frame);
            }
            return;
        }
        state.force = true;
        drop(state);
        self.shared.cond.notify_all();
    }
}

impl Drop for RenderThread {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output::OutputError;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingSurface {
        range: (usize, usize),
        renders: Arc<AtomicUsize>,
        last_seen: Arc<Mutex<Vec<u8>>>,
    }

    impl CountingSurface {
        fn boxed(
            range: (usize, usize),
            renders: &Arc<AtomicUsize>,
            last_seen: &Arc<Mutex<Vec<u8>>>,
        ) -> Box<dyn OutputSurface> {
            Box::new(CountingSurface {
                range,
                renders: Arc::clone(renders),
                last_seen: Arc::clone(last_seen),
            })
        }
    }

    impl OutputSurface for CountingSurface {
        fn render(&mut self, channel_data: &[u8]) -> Result<usize, OutputError> {
            self.renders.fetch_add(1, Ordering::SeqCst);
            *lock_ignoring_poison(&self.last_seen) = channel_data.to_vec();
            Ok(channel_data.len())
        }
        fn channel_range(&self) -> (usize, usize) {
            self.range
        }
        fn dump_config(&self) {}
        fn close(&mut self) -> Result<(), OutputError> {
            Ok(())
        }
    }

    #[test]
    fn force_now_renders_without_waiting_for_the_timer() {
        let renders = Arc::new(AtomicUsize::new(0));
        let last_seen = Arc::new(Mutex::new(Vec::new()));
        let data = ChannelData::new(3);
        let mut thread = RenderThread::new(
            data,
            vec![CountingSurface::boxed((0, 2), &renders, &last_seen)],
        );
        // One frame per second: any render observed within the test window
        // came from force-now, not the timer.
        thread.set_refresh_rate(1);
        thread.start();
        assert!(thread.is_running());

        for _ in 0..3 {
            thread.force_output_now();
            std::thread::sleep(Duration::from_millis(50));
        }
        thread.stop();
        assert!(!thread.is_running());
        assert!(renders.load(Ordering::SeqCst) >= 1);

        let surfaces = thread.into_surfaces();
        assert_eq!(surfaces.len(), 1);
    }

    #[test]
    fn surfaces_see_only_their_own_channel_slice() {
        let renders = Arc::new(AtomicUsize::new(0));
        let head = Arc::new(Mutex::new(Vec::new()));
        let tail = Arc::new(Mutex::new(Vec::new()));
        let mut surfaces = vec![
            CountingSurface::boxed((0, 2), &renders, &head),
            CountingSurface::boxed((3, 5), &renders, &tail),
        ];

        render_frame(&mut surfaces, &[1, 2, 3, 4, 5, 6]);

        assert_eq!(*lock_ignoring_poison(&head), vec![1, 2, 3]);
        assert_eq!(*lock_ignoring_poison(&tail), vec![4, 5, 6]);

        // A short frame clamps the tail slice instead of panicking, and a
        // range starting past the end skips the surface entirely.
        render_frame(&mut surfaces, &[9, 9, 9, 9, 9]);
        assert_eq!(*lock_ignoring_poison(&tail), vec![9, 9]);
        let before = renders.load(Ordering::SeqCst);
        render_frame(&mut surfaces[1..], &[1, 2]);
        assert_eq!(renders.load(Ordering::SeqCst), before);
    }

    #[test]
    fn force_now_on_a_stopped_thread_renders_once_in_place() {
        let renders = Arc::new(AtomicUsize::new(0));
        let last_seen = Arc::new(Mutex::new(Vec::new()));
        let data = ChannelData::new(6);
        data.write_at(0, &[1, 2, 3, 4, 5, 6]);
        let thread = RenderThread::new(
            data,
            vec![CountingSurface::boxed((3, 5), &renders, &last_seen)],
        );

        assert!(!thread.is_running());
        thread.force_output_now();

        assert_eq!(renders.load(Ordering::SeqCst), 1);
        assert_eq!(*lock_ignoring_poison(&last_seen), vec![4, 5, 6]);
    }

    #[test]
    fn start_twice_spawns_once_and_stop_is_idempotent() {
        let renders = Arc::new(AtomicUsize::new(0));
        let last_seen = Arc::new(Mutex::new(Vec::new()));
        let mut thread = RenderThread::new(
            ChannelData::new(3),
            vec![CountingSurface::boxed((0, 2), &renders, &last_seen)],
        );
        thread.set_refresh_rate(1);
        thread.start();
        thread.start();
        thread.stop();
        thread.stop();
        assert!(!thread.is_running());
    }

    #[test]
    fn channel_data_write_and_snapshot() {
        let data = ChannelData::new(6);
        data.write_at(2, &[7, 8, 9]);
        data.write_at(5, &[1, 2, 3]); // clamped at the end
        data.write_at(99, &[4]); // past the end, ignored
        let mut frame = Vec::new();
        data.snapshot_into(&mut frame);
        assert_eq!(frame, vec![0, 0, 7, 8, 9, 1]);
    }
}
