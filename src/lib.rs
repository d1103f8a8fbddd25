pub mod app;
pub mod camera;
pub mod capture;
pub mod config;
pub mod flow;
pub mod permission;
pub mod upload;

#[cfg(target_os = "android")]
pub mod android;

#[cfg(target_os = "android")]
use slint::android::android_activity::{MainEvent, PollEvent};

#[cfg(target_os = "android")]
#[no_mangle]
fn android_main(app: slint::android::AndroidApp) {
    android_logger::init_once(
        android_logger::Config::default()
            .with_max_level(log::LevelFilter::Debug)
            .with_tag("camera-upload"),
    );

    let lifecycle = app::Lifecycle::default();
    let events = lifecycle.clone();
    // Pause also fires under the permission dialog, so only Stop/Start count
    let listener = move |event: &PollEvent<'_>| match event {
        PollEvent::Main(MainEvent::Stop) => events.stopped(),
        PollEvent::Main(MainEvent::Start) => events.started(),
        _ => {}
    };
    if let Err(err) = slint::android::init_with_event_listener(app.clone(), listener) {
        log::error!("slint android init failed: {err}");
        return;
    }
    if let Err(err) = app::run(app, lifecycle) {
        log::error!("{err:#}");
    }
}
