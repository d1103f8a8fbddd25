//! Camera screen state machine: bind, capture, flash, upload, release.
//!
//! Everything here runs on the UI thread. Provider acquisition, image writes
//! and uploads happen elsewhere and report back through [`FlowEvent`]s that
//! [`CaptureFlow::pump`] drains. Each event carries the camera session it was
//! started in so results that outlive a released session cannot touch the
//! next one.

use std::{
    path::PathBuf,
    sync::{
        mpsc::{channel, Receiver, RecvTimeoutError, Sender},
        Arc,
    },
    time::Duration,
};

use anyhow::Result;
use log::{debug, error, info, warn};

use crate::{
    camera::{CameraBinder, CameraInfo, CameraProvider, CameraSelector},
    capture::{CaptureJob, CaptureWorker, CapturedImage, Clock, SystemClock},
    config::DEFAULT_FOLDER,
    upload::{UploadTarget, UploadedObject, Uploader},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowState {
    Unbound,
    /// camera provider being acquired
    Binding,
    /// preview live, shutter enabled
    Idle,
    /// at least one image write in flight
    Capturing,
}

/// Shutter effect: white after `delay`, cleared `hold` later.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlashTiming {
    pub delay: Duration,
    pub hold: Duration,
}

impl Default for FlashTiming {
    fn default() -> Self {
        FlashTiming {
            delay: Duration::from_millis(100),
            hold: Duration::from_millis(50),
        }
    }
}

/// The parts of the camera screen the flow drives.
pub trait CameraScreen {
    fn set_shutter_enabled(&self, enabled: bool);
    fn flash(&self, timing: FlashTiming);
}

pub enum FlowEvent {
    ProviderReady {
        session: u64,
        result: Result<Vec<CameraInfo>>,
    },
    ImageSaved {
        session: u64,
        result: Result<CapturedImage>,
    },
    UploadFinished {
        target: UploadTarget,
        result: Result<UploadedObject>,
    },
}

pub struct FlowOptions {
    pub media_dir: PathBuf,
    pub remote_folder: String,
    pub selector: CameraSelector,
    pub flash: FlashTiming,
}

impl FlowOptions {
    pub fn new(media_dir: impl Into<PathBuf>) -> Self {
        FlowOptions {
            media_dir: media_dir.into(),
            remote_folder: DEFAULT_FOLDER.to_string(),
            selector: CameraSelector::DefaultBack,
            flash: FlashTiming::default(),
        }
    }
}

pub struct CaptureFlow {
    provider: Arc<dyn CameraProvider>,
    binder: Box<dyn CameraBinder>,
    screen: Box<dyn CameraScreen>,
    uploader: Arc<dyn Uploader>,
    clock: Box<dyn Clock>,
    worker: CaptureWorker,
    options: FlowOptions,
    state: FlowState,
    session: u64,
    pending_captures: usize,
    sender: Sender<FlowEvent>,
    events: Receiver<FlowEvent>,
}

impl CaptureFlow {
    pub fn new(
        provider: Arc<dyn CameraProvider>,
        binder: Box<dyn CameraBinder>,
        screen: Box<dyn CameraScreen>,
        uploader: Arc<dyn Uploader>,
        options: FlowOptions,
    ) -> Result<Self> {
        let (sender, events) = channel();
        let saved = sender.clone();
        let worker = CaptureWorker::spawn(move |session, result| {
            let _ = saved.send(FlowEvent::ImageSaved { session, result });
        })?;
        screen.set_shutter_enabled(false);
        Ok(CaptureFlow {
            provider,
            binder,
            screen,
            uploader,
            clock: Box::new(SystemClock),
            worker,
            options,
            state: FlowState::Unbound,
            session: 0,
            pending_captures: 0,
            sender,
            events,
        })
    }

    pub fn with_clock(mut self, clock: impl Clock + 'static) -> Self {
        self.clock = Box::new(clock);
        self
    }

    pub fn state(&self) -> FlowState {
        self.state
    }

    pub fn session(&self) -> u64 {
        self.session
    }

    /// Starts a new camera session. The provider is acquired in the
    /// background; the shutter stays disabled until the bind completes.
    pub fn bind_camera(&mut self) {
        self.session += 1;
        self.pending_captures = 0;
        self.state = FlowState::Binding;
        self.screen.set_shutter_enabled(false);

        let session = self.session;
        let provider = self.provider.clone();
        let sender = self.sender.clone();
        let spawned = std::thread::Builder::new()
            .name("camera-provider".into())
            .spawn(move || {
                let result = provider.cameras();
                let _ = sender.send(FlowEvent::ProviderReady { session, result });
            });
        if let Err(err) = spawned {
            error!("Error starting camera: {err}");
            self.state = FlowState::Unbound;
        }
    }

    /// Unbinds the camera and invalidates everything started in this session.
    pub fn release_camera(&mut self) {
        self.binder.unbind_all();
        self.session += 1;
        self.pending_captures = 0;
        self.state = FlowState::Unbound;
        self.screen.set_shutter_enabled(false);
        debug!("camera released");
    }

    /// The activity left the screen. Frees the camera for other apps.
    pub fn screen_stopped(&mut self) {
        if self.state != FlowState::Unbound {
            info!("screen stopped, releasing camera");
            self.release_camera();
        }
    }

    /// The activity is visible again; rebinds if the camera screen is the
    /// one showing.
    pub fn screen_started(&mut self, camera_open: bool) {
        if camera_open && self.state == FlowState::Unbound {
            self.bind_camera();
        }
    }

    /// Queues one still for writing. Repeated taps are not debounced.
    pub fn capture(&mut self) {
        if !matches!(self.state, FlowState::Idle | FlowState::Capturing) {
            warn!("shutter pressed while camera is {:?}", self.state);
            return;
        }
        let frame = match self.binder.take_still() {
            Ok(frame) => frame,
            Err(err) => {
                error!("Photo capture failed: {err:#}");
                return;
            }
        };
        let image = CapturedImage::at(&self.options.media_dir, self.clock.now_millis());
        let job = CaptureJob {
            session: self.session,
            frame,
            image,
        };
        match self.worker.submit(job) {
            Ok(()) => {
                self.pending_captures += 1;
                self.state = FlowState::Capturing;
            }
            Err(err) => error!("Photo capture failed: {err:#}"),
        }
    }

    pub fn flash(&self) {
        self.screen.flash(self.options.flash);
    }

    /// Fire and forget: the outcome is only logged.
    pub fn upload_async(&self, image: &CapturedImage) {
        let target = UploadTarget::for_image(&self.options.remote_folder, image);
        let uploader = self.uploader.clone();
        let sender = self.sender.clone();
        let path = image.path.clone();
        let spawned = std::thread::Builder::new()
            .name("image-upload".into())
            .spawn(move || {
                let result = uploader.upload(&target, &path);
                let _ = sender.send(FlowEvent::UploadFinished { target, result });
            });
        if let Err(err) = spawned {
            error!("Image upload failed: {err}");
        }
    }

    /// Handles every completion that has arrived. Returns how many.
    pub fn pump(&mut self) -> usize {
        let mut handled = 0;
        while let Ok(event) = self.events.try_recv() {
            self.handle(event);
            handled += 1;
        }
        handled
    }

    /// Waits up to `timeout` for one completion and handles it.
    pub fn wait_event(&mut self, timeout: Duration) -> bool {
        match self.events.recv_timeout(timeout) {
            Ok(event) => {
                self.handle(event);
                true
            }
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => false,
        }
    }

    fn handle(&mut self, event: FlowEvent) {
        match event {
            FlowEvent::ProviderReady { session, result } => self.on_provider_ready(session, result),
            FlowEvent::ImageSaved { session, result } => self.on_image_saved(session, result),
            FlowEvent::UploadFinished { target, result } => match result {
                Ok(object) => info!(
                    "Image uploaded successfully: {} ({} bytes)",
                    object.name,
                    object.size.as_deref().unwrap_or("?")
                ),
                Err(err) => error!("Image upload failed: {}: {err:#}", target.object_key()),
            },
        }
    }

    fn on_provider_ready(&mut self, session: u64, result: Result<Vec<CameraInfo>>) {
        if session != self.session || self.state != FlowState::Binding {
            debug!("dropping camera provider of stale session {session}");
            return;
        }
        match result.and_then(|cameras| self.attach(&cameras)) {
            Ok(camera) => {
                info!("camera {} bound ({:?})", camera.id, camera.facing);
                self.state = FlowState::Idle;
                self.screen.set_shutter_enabled(true);
            }
            Err(err) => {
                error!("Error starting camera: {err:#}");
                self.state = FlowState::Unbound;
            }
        }
    }

    fn attach(&mut self, cameras: &[CameraInfo]) -> Result<CameraInfo> {
        let camera = self.options.selector.select(cameras)?.clone();
        self.binder.unbind_all();
        self.binder.bind(&camera)?;
        Ok(camera)
    }

    fn on_image_saved(&mut self, session: u64, result: Result<CapturedImage>) {
        let current = session == self.session;
        if current {
            self.pending_captures = self.pending_captures.saturating_sub(1);
            if self.pending_captures == 0 && self.state == FlowState::Capturing {
                self.state = FlowState::Idle;
            }
        }
        match result {
            Ok(image) => {
                debug!("Photo capture succeeded: {}", image.path.display());
                self.upload_async(&image);
                if current {
                    self.flash();
                } else {
                    debug!("session {session} ended before {} was written", image.name);
                }
            }
            Err(err) => error!("Photo capture failed: {err:#}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::{Frame, LensFacing};
    use anyhow::anyhow;
    use slint::{Rgba8Pixel, SharedPixelBuffer};
    use std::{
        path::Path,
        sync::{
            atomic::{AtomicU64, Ordering},
            Mutex,
        },
    };
    use tempfile::TempDir;

    const WAIT: Duration = Duration::from_secs(10);

    struct Provider(std::result::Result<Vec<CameraInfo>, String>);

    impl CameraProvider for Provider {
        fn cameras(&self) -> Result<Vec<CameraInfo>> {
            self.0.clone().map_err(|e| anyhow!(e))
        }
    }

    fn rear() -> Vec<CameraInfo> {
        vec![
            CameraInfo {
                id: "1".into(),
                facing: LensFacing::Front,
                sensor_orientation: 270,
                stream_sizes: vec![(640, 480)],
            },
            CameraInfo {
                id: "0".into(),
                facing: LensFacing::Back,
                sensor_orientation: 90,
                stream_sizes: vec![(640, 480)],
            },
        ]
    }

    #[derive(Default)]
    struct BinderLog {
        calls: Vec<String>,
        active: usize,
        max_active: usize,
    }

    struct Binder {
        log: Arc<Mutex<BinderLog>>,
        fail_bind: bool,
        frame: Option<Frame>,
    }

    impl CameraBinder for Binder {
        fn unbind_all(&mut self) {
            let mut log = self.log.lock().unwrap();
            log.calls.push("unbind_all".into());
            log.active = 0;
        }

        fn bind(&mut self, camera: &CameraInfo) -> Result<()> {
            let mut log = self.log.lock().unwrap();
            log.calls.push(format!("bind:{}", camera.id));
            if self.fail_bind {
                return Err(anyhow!("camera in use"));
            }
            log.active += 1;
            log.max_active = log.max_active.max(log.active);
            Ok(())
        }

        fn take_still(&mut self) -> Result<Frame> {
            if self.log.lock().unwrap().active == 0 {
                return Err(anyhow!("camera is not open"));
            }
            self.frame.clone().ok_or_else(|| anyhow!("no preview frame available yet"))
        }
    }

    #[derive(Default)]
    struct ScreenLog {
        shutter: Vec<bool>,
        flashes: Vec<FlashTiming>,
    }

    struct Screen(Arc<Mutex<ScreenLog>>);

    impl CameraScreen for Screen {
        fn set_shutter_enabled(&self, enabled: bool) {
            self.0.lock().unwrap().shutter.push(enabled);
        }

        fn flash(&self, timing: FlashTiming) {
            self.0.lock().unwrap().flashes.push(timing);
        }
    }

    #[derive(Default)]
    struct RecordingUploader {
        calls: Mutex<Vec<(UploadTarget, PathBuf, bool)>>,
        fail: bool,
    }

    impl Uploader for RecordingUploader {
        fn upload(&self, target: &UploadTarget, file: &Path) -> Result<UploadedObject> {
            self.calls
                .lock()
                .unwrap()
                .push((target.clone(), file.to_path_buf(), file.exists()));
            if self.fail {
                return Err(anyhow!("503 Service Unavailable"));
            }
            Ok(UploadedObject {
                name: target.object_key(),
                bucket: "test".into(),
                size: None,
                content_type: Some("image/jpeg".into()),
            })
        }
    }

    struct FixedClock(Arc<AtomicU64>);

    impl Clock for FixedClock {
        fn now_millis(&self) -> u128 {
            self.0.load(Ordering::SeqCst) as u128
        }
    }

    struct Harness {
        flow: CaptureFlow,
        binder: Arc<Mutex<BinderLog>>,
        screen: Arc<Mutex<ScreenLog>>,
        uploader: Arc<RecordingUploader>,
        clock: Arc<AtomicU64>,
        dir: TempDir,
    }

    struct Setup {
        cameras: std::result::Result<Vec<CameraInfo>, String>,
        fail_bind: bool,
        frame: bool,
        fail_upload: bool,
    }

    impl Default for Setup {
        fn default() -> Self {
            Setup {
                cameras: Ok(rear()),
                fail_bind: false,
                frame: true,
                fail_upload: false,
            }
        }
    }

    impl Setup {
        fn build(self) -> Harness {
            let dir = TempDir::new().unwrap();
            let binder = Arc::new(Mutex::new(BinderLog::default()));
            let screen = Arc::new(Mutex::new(ScreenLog::default()));
            let uploader = Arc::new(RecordingUploader {
                fail: self.fail_upload,
                ..Default::default()
            });
            let clock = Arc::new(AtomicU64::new(1_700_000_000_000));
            let flow = CaptureFlow::new(
                Arc::new(Provider(self.cameras)),
                Box::new(Binder {
                    log: binder.clone(),
                    fail_bind: self.fail_bind,
                    frame: self
                        .frame
                        .then(|| SharedPixelBuffer::<Rgba8Pixel>::new(16, 12)),
                }),
                Box::new(Screen(screen.clone())),
                uploader.clone(),
                FlowOptions::new(dir.path().join("media")),
            )
            .unwrap()
            .with_clock(FixedClock(clock.clone()));
            Harness {
                flow,
                binder,
                screen,
                uploader,
                clock,
                dir,
            }
        }
    }

    impl Harness {
        fn settle(&mut self, events: usize) {
            for n in 0..events {
                assert!(self.flow.wait_event(WAIT), "event {n} of {events} never arrived");
            }
        }

        fn bound(mut self) -> Self {
            self.flow.bind_camera();
            self.settle(1);
            assert_eq!(self.flow.state(), FlowState::Idle);
            self
        }

        fn shutter(&self) -> Vec<bool> {
            self.screen.lock().unwrap().shutter.clone()
        }

        fn flashes(&self) -> usize {
            self.screen.lock().unwrap().flashes.len()
        }

        fn uploads(&self) -> Vec<(UploadTarget, PathBuf, bool)> {
            self.uploader.calls.lock().unwrap().clone()
        }

        fn binder_calls(&self) -> Vec<String> {
            self.binder.lock().unwrap().calls.clone()
        }
    }

    #[test]
    fn shutter_enabled_only_after_bind() {
        let mut h = Setup::default().build();
        assert_eq!(h.flow.state(), FlowState::Unbound);
        assert_eq!(h.shutter(), [false]);

        h.flow.bind_camera();
        assert_eq!(h.flow.state(), FlowState::Binding);
        assert_eq!(h.shutter().last(), Some(&false));

        h.settle(1);
        assert_eq!(h.flow.state(), FlowState::Idle);
        assert_eq!(h.shutter().last(), Some(&true));
        assert_eq!(h.binder_calls(), ["unbind_all", "bind:0"]);
    }

    #[test]
    fn rebinding_releases_previous_session_first() {
        let mut h = Setup::default().build().bound();
        h.flow.bind_camera();
        h.settle(1);
        assert_eq!(h.binder_calls(), ["unbind_all", "bind:0", "unbind_all", "bind:0"]);
        assert_eq!(h.binder.lock().unwrap().max_active, 1);
    }

    #[test]
    fn bind_failure_keeps_shutter_disabled() {
        for setup in [
            Setup {
                fail_bind: true,
                ..Default::default()
            },
            Setup {
                cameras: Err("camera service unavailable".into()),
                ..Default::default()
            },
            Setup {
                cameras: Ok(vec![]),
                ..Default::default()
            },
        ] {
            let mut h = setup.build();
            h.flow.bind_camera();
            h.settle(1);
            assert_eq!(h.flow.state(), FlowState::Unbound);
            assert!(h.shutter().iter().all(|enabled| !enabled));
            h.flow.capture();
            assert_eq!(h.flow.pump(), 0);
        }
    }

    #[test]
    fn capture_writes_file_uploads_once_and_flashes() {
        let mut h = Setup::default().build().bound();
        h.flow.capture();
        assert_eq!(h.flow.state(), FlowState::Capturing);

        // image saved, then upload finished
        h.settle(2);
        assert_eq!(h.flow.state(), FlowState::Idle);

        let file = h.dir.path().join("media").join("IMG_1700000000000.jpg");
        assert!(file.exists());
        let uploads = h.uploads();
        assert_eq!(uploads.len(), 1);
        let (target, path, existed) = &uploads[0];
        assert_eq!(target.object_key(), "images/IMG_1700000000000.jpg");
        assert_eq!(target.name, "IMG_1700000000000.jpg");
        assert_eq!(path, &file);
        assert!(existed);
        assert_eq!(h.flashes(), 1);
        assert_eq!(h.screen.lock().unwrap().flashes[0], FlashTiming::default());
    }

    #[test]
    fn captures_at_different_millis_get_distinct_files() {
        let mut h = Setup::default().build().bound();
        h.flow.capture();
        h.clock.fetch_add(1, Ordering::SeqCst);
        h.flow.capture();
        h.settle(4);
        let mut keys: Vec<String> = h.uploads().iter().map(|(t, _, _)| t.object_key()).collect();
        keys.sort();
        assert_eq!(keys, ["images/IMG_1700000000000.jpg", "images/IMG_1700000000001.jpg"]);
        assert_eq!(h.flashes(), 2);
    }

    #[test]
    fn double_tap_in_same_millisecond_is_not_guarded() {
        let mut h = Setup::default().build().bound();
        h.flow.capture();
        h.flow.capture();
        assert_eq!(h.flow.state(), FlowState::Capturing);
        h.settle(4);
        assert_eq!(h.flow.state(), FlowState::Idle);
        let uploads = h.uploads();
        assert_eq!(uploads.len(), 2);
        assert_eq!(uploads[0].0, uploads[1].0);
        let files = std::fs::read_dir(h.dir.path().join("media")).unwrap().count();
        assert_eq!(files, 1);
    }

    #[test]
    fn capture_without_frame_is_logged_only() {
        let mut h = Setup {
            frame: false,
            ..Default::default()
        }
        .build()
        .bound();
        h.flow.capture();
        assert_eq!(h.flow.state(), FlowState::Idle);
        assert!(!h.flow.wait_event(Duration::from_millis(200)));
        assert!(h.uploads().is_empty());
        assert_eq!(h.flashes(), 0);
    }

    #[test]
    fn capture_before_bind_is_ignored() {
        let mut h = Setup::default().build();
        h.flow.capture();
        h.flow.bind_camera();
        h.flow.capture();
        assert_eq!(h.flow.state(), FlowState::Binding);
        h.settle(1);
        assert!(!h.flow.wait_event(Duration::from_millis(200)));
        assert!(h.uploads().is_empty());
    }

    #[test]
    fn upload_failure_is_logged_only() {
        let mut h = Setup {
            fail_upload: true,
            ..Default::default()
        }
        .build()
        .bound();
        h.flow.capture();
        h.settle(2);
        assert_eq!(h.uploads().len(), 1);
        assert_eq!(h.flow.state(), FlowState::Idle);
        h.flow.capture();
        h.settle(2);
        assert_eq!(h.uploads().len(), 2);
    }

    #[test]
    fn release_then_rebind_starts_clean() {
        let mut h = Setup::default().build().bound();
        h.flow.release_camera();
        assert_eq!(h.flow.state(), FlowState::Unbound);
        assert_eq!(h.shutter().last(), Some(&false));
        assert_eq!(h.binder.lock().unwrap().active, 0);

        let mut h = h.bound();
        assert_eq!(h.shutter().last(), Some(&true));
        h.flow.capture();
        h.settle(2);
        assert_eq!(h.uploads().len(), 1);
    }

    #[test]
    fn provider_arriving_after_release_is_dropped() {
        let mut h = Setup::default().build();
        h.flow.bind_camera();
        h.flow.release_camera();
        h.settle(1);
        assert_eq!(h.flow.state(), FlowState::Unbound);
        assert_eq!(h.binder_calls(), ["unbind_all"]);
        assert!(h.shutter().iter().all(|enabled| !enabled));
    }

    #[test]
    fn capture_finishing_after_release_uploads_without_flash() {
        let mut h = Setup::default().build().bound();
        h.flow.capture();
        h.flow.release_camera();
        h.settle(2);
        assert_eq!(h.flow.state(), FlowState::Unbound);
        assert_eq!(h.uploads().len(), 1);
        assert_eq!(h.flashes(), 0);
    }

    #[test]
    fn failed_write_returns_to_idle_without_upload_or_flash() {
        let mut h = Setup::default().build().bound();
        // a regular file where the media directory should be
        std::fs::write(h.dir.path().join("media"), b"x").unwrap();
        h.flow.capture();
        assert_eq!(h.flow.state(), FlowState::Capturing);
        h.settle(1);
        assert_eq!(h.flow.state(), FlowState::Idle);
        assert!(!h.flow.wait_event(Duration::from_millis(200)));
        assert!(h.uploads().is_empty());
        assert_eq!(h.flashes(), 0);
        assert_eq!(h.shutter().last(), Some(&true));
    }

    #[test]
    fn screen_stop_releases_and_start_rebinds() {
        let mut h = Setup::default().build().bound();
        h.flow.screen_stopped();
        assert_eq!(h.flow.state(), FlowState::Unbound);
        assert_eq!(h.binder.lock().unwrap().active, 0);
        assert_eq!(h.shutter().last(), Some(&false));

        h.flow.screen_started(true);
        assert_eq!(h.flow.state(), FlowState::Binding);
        h.settle(1);
        assert_eq!(h.flow.state(), FlowState::Idle);
        assert_eq!(h.binder.lock().unwrap().active, 1);
        assert_eq!(h.binder_calls().last().map(String::as_str), Some("bind:0"));
        assert_eq!(h.shutter().last(), Some(&true));
    }

    #[test]
    fn screen_start_on_launcher_leaves_camera_closed() {
        let mut h = Setup::default().build();
        h.flow.screen_stopped();
        h.flow.screen_started(false);
        assert_eq!(h.flow.state(), FlowState::Unbound);
        assert!(!h.flow.wait_event(Duration::from_millis(200)));
        assert!(h.binder_calls().is_empty());
    }

    #[test]
    fn screen_stop_while_binding_drops_the_bind() {
        let mut h = Setup::default().build();
        h.flow.bind_camera();
        h.flow.screen_stopped();
        h.settle(1);
        assert_eq!(h.flow.state(), FlowState::Unbound);
        assert_eq!(h.binder_calls(), ["unbind_all"]);
    }
}
