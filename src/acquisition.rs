// The acquisition thread. It idles until a run is armed, then retrieves frames
// from the camera and hands them to the FrameSink until the frame budget is
// used up, the sink or the caller asks to stop, or retrieval fails. At the end
// of each run it stops the camera's capture itself and goes back to idle.

use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread;

use log::{debug, error, info, trace, warn};

use crate::abstract_camera::{Frame, FrameSink, Status};
use crate::camera_sdk::{CameraDevice, SdkError};
use crate::error::CameraError;

// State shared between the caller's thread and the acquisition thread.
struct State {
    status: Status,

    // Set by start, cleared by stop. A run in progress ends when this goes
    // false.
    armed: bool,

    // True while the acquisition thread is in a run.
    running: bool,

    // Ends the acquisition thread; only honored while idle.
    quit: bool,

    // Frames dispatched in the current run, and how many to acquire (zero
    // means no limit).
    image_number: u32,
    frame_count: u32,
}

/// One mutex and one condition variable guarding everything the caller and
/// the acquisition thread both touch.
pub struct SharedState {
    state: Mutex<State>,
    cond: Condvar,
}

impl SharedState {
    pub fn new(frame_count: u32) -> Self {
        SharedState{
            state: Mutex::new(State{status: Status::Ready,
                                    armed: false,
                                    running: false,
                                    quit: false,
                                    image_number: 0,
                                    frame_count}),
            cond: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<State> {
        self.state.lock().unwrap()
    }

    pub fn status(&self) -> Status {
        self.lock().status
    }

    /// A Fault status sticks: it is only replaced when `force` is set.
    pub fn set_status(&self, status: Status, force: bool) {
        let mut locked_state = self.lock();
        if force || locked_state.status != Status::Fault {
            locked_state.status = status;
        }
    }

    pub fn is_armed(&self) -> bool {
        self.lock().armed
    }

    /// Waits for a run that has been disarmed, or has ended on its own, to
    /// finish winding down. Returns at once if the acquisition thread is idle.
    pub fn wait_until_idle(&self) {
        let mut locked_state = self.lock();
        while locked_state.running && !locked_state.armed {
            locked_state = self.cond.wait(locked_state).unwrap();
        }
    }

    pub fn image_number(&self) -> u32 {
        self.lock().image_number
    }

    pub fn reset_image_number(&self) {
        self.lock().image_number = 0;
    }

    pub fn frame_count(&self) -> u32 {
        self.lock().frame_count
    }

    pub fn set_frame_count(&self, frame_count: u32) {
        self.lock().frame_count = frame_count;
    }

    /// Returns false, and changes nothing, if a run is already armed or in
    /// progress.
    pub fn arm(&self) -> bool {
        let mut locked_state = self.lock();
        if locked_state.armed || locked_state.running {
            return false;
        }
        locked_state.armed = true;
        self.cond.notify_all();
        true
    }

    /// Ends the current run, if any, and waits for the acquisition thread to
    /// go idle. Must not be called from the acquisition thread.
    ///
    /// If the run was armed but the acquisition thread had not picked it up
    /// yet, it never will; the caller is then responsible for stopping the
    /// camera's capture and `stop()` returns true.
    pub fn stop(&self) -> bool {
        let mut locked_state = self.lock();
        if !locked_state.armed && !locked_state.running {
            return false;
        }
        let picked_up = locked_state.running;
        locked_state.armed = false;
        self.cond.notify_all();

        // Wait for the acquisition thread to finish.
        while locked_state.running {
            locked_state = self.cond.wait(locked_state).unwrap();
        }
        !picked_up
    }

    // Returns true if another frame is wanted in the current run.
    fn budget_remaining(&self) -> bool {
        let locked_state = self.lock();
        locked_state.frame_count == 0 ||
            locked_state.image_number < locked_state.frame_count
    }
}

/// Owns the acquisition thread. Dropping it (or calling `shutdown()`) ends any
/// run in progress, asks the thread to quit, and joins it.
pub struct AcquisitionThread {
    shared: Arc<SharedState>,
    handle: Option<thread::JoinHandle<()>>,
}

impl AcquisitionThread {
    pub fn spawn(shared: Arc<SharedState>,
                 device: Arc<dyn CameraDevice>,
                 sink: Arc<dyn FrameSink>) -> Result<Self, CameraError> {
        let cloned_shared = shared.clone();
        let handle = match thread::Builder::new()
            .name("acquisition".to_string())
            .spawn(move || { worker(cloned_shared, device, sink); }) {
                Ok(x) => x,
                Err(e) => return Err(CameraError::Hardware(
                    format!("Failed to spawn acquisition thread: {}", e)))
            };
        Ok(AcquisitionThread{shared, handle: Some(handle)})
    }

    pub fn shutdown(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        {
            let mut locked_state = self.shared.lock();
            locked_state.quit = true;
            // Otherwise an unbounded run would never let us join.
            locked_state.armed = false;
            self.shared.cond.notify_all();
        }
        if handle.join().is_err() {
            error!("Acquisition thread panicked");
        }
    }
}

impl Drop for AcquisitionThread {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker(shared: Arc<SharedState>,
          device: Arc<dyn CameraDevice>,
          sink: Arc<dyn FrameSink>) {
    raise_priority();

    let mut locked_state = shared.lock();
    loop {
        while !locked_state.armed && !locked_state.quit {
            debug!("Acquisition thread waiting");
            locked_state.running = false;
            shared.cond.notify_all();
            locked_state = shared.cond.wait(locked_state).unwrap();
        }
        if locked_state.quit {
            locked_state.running = false;
            shared.cond.notify_all();
            return;
        }
        locked_state.running = true;
        // Forced: a new run clears a previous Fault.
        locked_state.status = Status::Exposure;
        drop(locked_state);

        debug!("Acquisition thread running");
        run(&shared, device.as_ref(), sink.as_ref());
        finish_run(&shared, device.as_ref());

        locked_state = shared.lock();
    }
}

fn run(shared: &SharedState, device: &dyn CameraDevice, sink: &dyn FrameSink) {
    let mut continue_acq = true;
    while continue_acq && shared.budget_remaining() {
        // Blocks; the shared state is not locked meanwhile.
        match device.retrieve_buffer() {
            Ok(image) => {
                // Check if acquisition has been stopped.
                if !shared.is_armed() {
                    break;
                }
                shared.set_status(Status::Readout, false);
                let frame = Frame{data: &image.data,
                                  width: image.cols,
                                  height: image.rows,
                                  video_mode: sink.video_mode()};
                trace!("image# {} acquired", shared.image_number());
                continue_acq = sink.new_image(&frame);
                shared.lock().image_number += 1;
            },
            Err(SdkError::ImageConsistency(msg)) => {
                warn!("No image acquired: {}", CameraError::FrameConsistency(msg));
            },
            Err(e) => {
                error!("No image acquired: {}", CameraError::Retrieval(e.to_string()));
                shared.set_status(Status::Fault, true);
                continue_acq = false;
            },
        }
    }
}

// Stop sequence at the end of a run, executed on the acquisition thread. Does
// not wait for anything; the thread goes idle right afterwards.
fn finish_run(shared: &SharedState, device: &dyn CameraDevice) {
    shared.lock().armed = false;
    info!("Stop acquisition");
    if let Err(e) = device.stop_capture() {
        error!("{}", CameraError::CaptureStop(e.to_string()));
        shared.set_status(Status::Fault, true);
    }
    // Not forced, so a Fault from this run persists.
    shared.set_status(Status::Ready, false);
}

// Frame retrieval should preempt everything else so the camera's buffers do
// not back up. Needs privileges we usually don't have.
#[cfg(target_os = "linux")]
fn raise_priority() {
    // SAFETY: plain libc calls on the current thread; sched_param is POD and
    // zero is valid for all of its fields.
    let result = unsafe {
        let mut param: libc::sched_param = std::mem::zeroed();
        param.sched_priority = libc::sched_get_priority_max(libc::SCHED_FIFO);
        libc::pthread_setschedparam(libc::pthread_self(), libc::SCHED_FIFO, &param)
    };
    if result != 0 {
        warn!("Could not set FIFO scheduling for acquisition thread (error {})",
              result);
    }
}

#[cfg(not(target_os = "linux"))]
fn raise_priority() {
    debug!("Real-time scheduling not available for acquisition thread");
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use image::GrayImage;

    use super::*;
    use crate::image_sdk::{ImageDevice, RetrievalOutcome};
    use crate::image_sink::ImageSink;

    fn wait_for(what: &str, cond: impl Fn() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(10);
        while !cond() {
            assert!(Instant::now() < deadline, "timed out waiting for {}", what);
            thread::sleep(Duration::from_millis(1));
        }
    }

    struct Fixture {
        shared: Arc<SharedState>,
        device: Arc<ImageDevice>,
        sink: Arc<ImageSink>,
        thread: AcquisitionThread,
    }

    impl Fixture {
        fn new(frame_count: u32) -> Self {
            let shared = Arc::new(SharedState::new(frame_count));
            let device = Arc::new(ImageDevice::new(42, GrayImage::new(8, 4)));
            let sink = Arc::new(ImageSink::new(4));
            let thread = AcquisitionThread::spawn(
                shared.clone(), device.clone(), sink.clone()).unwrap();
            Fixture{shared, device, sink, thread}
        }

        // What the session does on start.
        fn start(&self) {
            self.device.start_capture().unwrap();
            assert!(self.shared.arm());
        }

        fn wait_idle(&self) {
            wait_for("idle", || {
                let locked_state = self.shared.lock();
                !locked_state.armed && !locked_state.running
            });
        }
    }

    #[test]
    fn test_set_status_fault_sticks() {
        let shared = SharedState::new(1);
        shared.set_status(Status::Fault, true);
        shared.set_status(Status::Ready, false);
        assert_eq!(shared.status(), Status::Fault);
        shared.set_status(Status::Ready, true);
        assert_eq!(shared.status(), Status::Ready);
    }

    #[test]
    fn test_stop_when_idle_is_noop() {
        let fixture = Fixture::new(1);
        assert!(!fixture.shared.stop());
        assert_eq!(fixture.shared.status(), Status::Ready);
    }

    #[test]
    fn test_budget_is_honored() {
        for frame_count in [1, 3, 7] {
            let fixture = Fixture::new(frame_count);
            fixture.start();
            fixture.wait_idle();
            assert_eq!(fixture.shared.image_number(), frame_count);
            assert_eq!(fixture.sink.frames_received(), frame_count as u64);
            assert_eq!(fixture.shared.status(), Status::Ready);
            assert!(!fixture.device.is_capturing());
        }
    }

    #[test]
    fn test_consistency_error_is_skipped() {
        let fixture = Fixture::new(2);
        fixture.device.push_outcome(RetrievalOutcome::Frame);
        fixture.device.push_outcome(RetrievalOutcome::ConsistencyError);
        fixture.device.push_outcome(RetrievalOutcome::ConsistencyError);
        fixture.device.push_outcome(RetrievalOutcome::Frame);
        fixture.start();
        fixture.wait_idle();
        assert_eq!(fixture.shared.image_number(), 2);
        assert_eq!(fixture.sink.frames_received(), 2);
        assert_eq!(fixture.shared.status(), Status::Ready);
    }

    #[test]
    fn test_fatal_error_faults() {
        let fixture = Fixture::new(10);
        fixture.device.push_outcome(RetrievalOutcome::Frame);
        fixture.device.push_outcome(RetrievalOutcome::Frame);
        fixture.device.push_outcome(RetrievalOutcome::FatalError);
        fixture.start();
        fixture.wait_idle();
        assert_eq!(fixture.shared.image_number(), 2);
        assert_eq!(fixture.shared.status(), Status::Fault);
        assert!(!fixture.device.is_capturing());

        // Fault survives the end-of-run stop and a later stop request.
        assert!(!fixture.shared.stop());
        assert_eq!(fixture.shared.status(), Status::Fault);
    }

    #[test]
    fn test_new_run_clears_fault() {
        let fixture = Fixture::new(1);
        fixture.device.push_outcome(RetrievalOutcome::FatalError);
        fixture.start();
        fixture.wait_idle();
        assert_eq!(fixture.shared.status(), Status::Fault);

        fixture.shared.reset_image_number();
        fixture.start();
        fixture.wait_idle();
        assert_eq!(fixture.shared.image_number(), 1);
        assert_eq!(fixture.shared.status(), Status::Ready);
    }

    #[test]
    fn test_wait_until_idle_outlasts_run_wind_down() {
        let shared = Arc::new(SharedState::new(1));
        // A run that has reported Ready but not yet gone idle.
        shared.lock().running = true;

        let cloned_shared = shared.clone();
        let winder = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            let mut locked_state = cloned_shared.lock();
            locked_state.running = false;
            cloned_shared.cond.notify_all();
        });
        shared.wait_until_idle();
        assert!(!shared.lock().running);
        assert!(shared.arm());
        winder.join().unwrap();
    }

    #[test]
    fn test_wait_until_idle_when_idle() {
        let shared = SharedState::new(1);
        shared.wait_until_idle();
        assert!(shared.arm());
    }

    #[test]
    fn test_sink_can_end_run() {
        let fixture = Fixture::new(0);
        fixture.sink.set_stop_after(Some(4));
        fixture.start();
        fixture.wait_idle();
        assert_eq!(fixture.shared.image_number(), 4);
        assert_eq!(fixture.shared.status(), Status::Ready);
    }

    #[test]
    fn test_unbounded_run_until_stop() {
        let fixture = Fixture::new(0);
        fixture.start();
        assert!(!fixture.shared.arm());
        wait_for("frames", || fixture.shared.image_number() >= 10);

        assert!(!fixture.shared.stop());
        let locked_state = fixture.shared.lock();
        assert!(!locked_state.running);
        assert_ne!(locked_state.status, Status::Exposure);
        assert_ne!(locked_state.status, Status::Readout);
        let frames = locked_state.image_number;
        drop(locked_state);

        thread::sleep(Duration::from_millis(20));
        assert_eq!(fixture.shared.image_number(), frames);
        assert!(!fixture.device.is_capturing());
    }

    #[test]
    fn test_stop_races_natural_completion() {
        for _ in 0..50 {
            let fixture = Fixture::new(1);
            fixture.start();
            fixture.shared.stop();
            fixture.wait_idle();
            assert_eq!(fixture.shared.status(), Status::Ready);
        }
    }

    #[test]
    fn test_shutdown_during_unbounded_run() {
        let mut fixture = Fixture::new(0);
        fixture.start();
        wait_for("frames", || fixture.shared.image_number() >= 3);
        fixture.thread.shutdown();
        assert!(!fixture.device.is_capturing());
        // Idempotent.
        fixture.thread.shutdown();
    }
}
