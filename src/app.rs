use std::{
    cell::RefCell,
    path::PathBuf,
    rc::Rc,
    sync::{mpsc::channel, Arc},
    time::Duration,
};

use anyhow::Result;
use log::{error, info, warn};
use slint::{Image, Timer, TimerMode};

use crate::{
    camera::{PlatformCamera, PlatformProvider},
    config::StorageConfig,
    flow::{CameraScreen, CaptureFlow, FlashTiming, FlowOptions},
    permission::{GateDecision, PermissionGate, PERMISSION_DENIED_NOTICE},
    upload::FirebaseUploader,
};

/// How long the denial notice stays up.
const NOTICE_DURATION: Duration = Duration::from_millis(1500);
const PUMP_INTERVAL: Duration = Duration::from_millis(10);

slint::slint! {
    import { Button } from "std-widgets.slint";

    export component MainWindow inherits Window {
        in-out property <bool> camera-open: false;
        in-out property <image> camera-texture <=> preview.source;
        in property <bool> shutter-enabled: false;
        in property <bool> flash: false;
        in property <string> notice: "";
        callback open-camera();
        callback take-photo();
        callback close-camera();

        title: "Camera Upload";
        preferred-width: 480px;
        preferred-height: 800px;
        forward-focus: scope;

        scope := FocusScope {
            width: 100%;
            height: 100%;
            key-pressed(event) => {
                if (event.text == Key.Escape && root.camera-open) {
                    root.close-camera();
                    return accept;
                }
                return reject;
            }

            Rectangle {
                width: 100%;
                height: 100%;
                background: black;
                visible: root.camera-open;

                preview := Image {
                    width: 100%;
                    height: 100%;
                    image-fit: contain;
                }

                Button {
                    text: "Take photo";
                    enabled: root.shutter-enabled;
                    x: (parent.width - self.width) / 2;
                    y: parent.height - self.height - 32px;
                    clicked => {
                        root.take-photo();
                    }
                }
            }

            if !root.camera-open: Rectangle {
                width: 100%;
                height: 100%;
                HorizontalLayout {
                    alignment: center;
                    VerticalLayout {
                        alignment: center;
                        Button {
                            text: "Open camera";
                            clicked => {
                                root.open-camera();
                            }
                        }
                    }
                }
            }

            Rectangle {
                width: 100%;
                height: 100%;
                background: white;
                visible: root.flash;
            }

            if root.notice != "": Rectangle {
                x: (parent.width - self.width) / 2;
                y: parent.height - self.height - 24px;
                width: 80%;
                height: 48px;
                border-radius: 4px;
                background: #323232;
                Text {
                    text: root.notice;
                    color: white;
                    vertical-alignment: center;
                    horizontal-alignment: center;
                }
            }
        }
    }
}

struct SlintCameraScreen {
    window: slint::Weak<MainWindow>,
}

impl CameraScreen for SlintCameraScreen {
    fn set_shutter_enabled(&self, enabled: bool) {
        if let Some(ui) = self.window.upgrade() {
            ui.set_shutter_enabled(enabled);
        }
    }

    fn flash(&self, timing: FlashTiming) {
        let window = self.window.clone();
        Timer::single_shot(timing.delay, move || {
            if let Some(ui) = window.upgrade() {
                ui.set_flash(true);
            }
            Timer::single_shot(timing.hold, move || {
                if let Some(ui) = window.upgrade() {
                    ui.set_flash(false);
                }
            });
        });
    }
}

/// Carries activity start/stop from the android event listener to the
/// camera screen once [`run`] has built it.
#[cfg(target_os = "android")]
#[derive(Clone, Default)]
pub struct Lifecycle(Rc<RefCell<Option<(Rc<RefCell<CaptureFlow>>, slint::Weak<MainWindow>)>>>);

#[cfg(target_os = "android")]
impl Lifecycle {
    fn attach(&self, flow: Rc<RefCell<CaptureFlow>>, window: slint::Weak<MainWindow>) {
        *self.0.borrow_mut() = Some((flow, window));
    }

    fn detach(&self) {
        self.0.borrow_mut().take();
    }

    pub fn stopped(&self) {
        if let Some((flow, _)) = &*self.0.borrow() {
            match flow.try_borrow_mut() {
                Ok(mut flow) => flow.screen_stopped(),
                Err(_) => warn!("camera flow busy on stop"),
            }
        }
    }

    pub fn started(&self) {
        if let Some((flow, window)) = &*self.0.borrow() {
            let camera_open = window.upgrade().map(|ui| ui.get_camera_open()).unwrap_or(false);
            match flow.try_borrow_mut() {
                Ok(mut flow) => flow.screen_started(camera_open),
                Err(_) => warn!("camera flow busy on start"),
            }
        }
    }
}

fn show_notice(window: &slint::Weak<MainWindow>, text: &str) {
    if let Some(ui) = window.upgrade() {
        ui.set_notice(text.into());
    }
    let window = window.clone();
    Timer::single_shot(NOTICE_DURATION, move || {
        if let Some(ui) = window.upgrade() {
            ui.set_notice("".into());
        }
    });
}

#[cfg(not(target_os = "android"))]
fn media_dir() -> PathBuf {
    dirs::picture_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("camera-upload")
}

fn storage_config(search_dir: PathBuf) -> StorageConfig {
    match StorageConfig::load(&search_dir) {
        Ok((config, source)) => {
            info!("uploading to bucket {} (from {source})", config.bucket);
            config
        }
        Err(err) => {
            error!("Firebase storage is not configured, uploads will fail: {err:#}");
            StorageConfig::default()
        }
    }
}

pub fn run(
    #[cfg(target_os = "android")]
    android_app: slint::android::AndroidApp,
    #[cfg(target_os = "android")]
    lifecycle: Lifecycle,
) -> Result<()> {
    let app = MainWindow::new()?;

    let (frame_sender, frame_receiver) = channel();

    #[cfg(target_os = "android")]
    let (media_dir, requester) = (
        crate::android::external_media_dir(&android_app)?,
        crate::android::AndroidPermissions::new(android_app.clone()),
    );
    #[cfg(not(target_os = "android"))]
    let (media_dir, requester) = (media_dir(), crate::permission::AlwaysGranted);
    info!("photos go to {}", media_dir.display());

    // google-services.json is looked up in the app's internal files dir on
    // android and in the working directory elsewhere
    #[cfg(target_os = "android")]
    let config_dir = android_app.internal_data_path().unwrap_or_default();
    #[cfg(not(target_os = "android"))]
    let config_dir = std::env::current_dir().unwrap_or_default();
    let uploader = Arc::new(FirebaseUploader::new(storage_config(config_dir))?);
    let options = FlowOptions::new(media_dir);

    let flow = Rc::new(RefCell::new(CaptureFlow::new(
        Arc::new(PlatformProvider),
        Box::new(PlatformCamera::new(frame_sender)),
        Box::new(SlintCameraScreen {
            window: app.as_weak(),
        }),
        uploader,
        options,
    )?));
    let gate = PermissionGate::new(requester);
    #[cfg(target_os = "android")]
    lifecycle.attach(flow.clone(), app.as_weak());

    let window = app.as_weak();
    let flow_clone = flow.clone();
    app.on_open_camera(move || {
        let window = window.clone();
        let flow = flow_clone.clone();
        gate.open_camera(move |decision| match decision {
            GateDecision::Proceed => {
                if let Some(ui) = window.upgrade() {
                    ui.set_camera_open(true);
                }
                flow.borrow_mut().bind_camera();
            }
            GateDecision::Denied { denied } => {
                warn!("staying on the launcher, denied: {:?}", denied);
                show_notice(&window, PERMISSION_DENIED_NOTICE);
            }
        });
    });

    let flow_clone = flow.clone();
    app.on_take_photo(move || flow_clone.borrow_mut().capture());

    let window = app.as_weak();
    let flow_clone = flow.clone();
    app.on_close_camera(move || {
        flow_clone.borrow_mut().release_camera();
        if let Some(ui) = window.upgrade() {
            ui.set_camera_open(false);
        }
    });

    let window = app.as_weak();
    let flow_clone = flow.clone();
    let timer = Timer::default();
    timer.start(TimerMode::Repeated, PUMP_INTERVAL, move || {
        if let (Some(buffer), Some(ui)) = (frame_receiver.try_iter().last(), window.upgrade()) {
            ui.set_camera_texture(Image::from_rgba8(buffer));
        }
        flow_clone.borrow_mut().pump();
    });

    let result = app.run();
    #[cfg(target_os = "android")]
    lifecycle.detach();
    flow.borrow_mut().release_camera();
    Ok(result?)
}
