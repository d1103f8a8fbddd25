#[cfg(not(target_os = "android"))]
fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    camera_upload::app::run()
}

// android builds start from `android_main` in the cdylib
#[cfg(target_os = "android")]
fn main() {}
