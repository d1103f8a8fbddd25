//! JNI calls into the hosting `NativeActivity`.

use std::{
    path::PathBuf,
    rc::Rc,
    time::{Duration, Instant},
};

use anyhow::{anyhow, Result};
use jni::{
    objects::{JObject, JObjectArray, JString, JValueGen},
    sys::{jint, JNIInvokeInterface_, _jobject},
    JNIEnv, JavaVM,
};
use log::{debug, info, warn};
use slint::android::AndroidApp;
use slint::{Timer, TimerMode};

use crate::permission::{Permission, PermissionCallback, PermissionRequester, PermissionResults};

const PERMISSION_REQUEST_CODE: i32 = 100;
/// Runtime permissions exist from Android 6 (API 23).
const RUNTIME_PERMISSIONS_SDK: i32 = 23;
const FOCUS_POLL: Duration = Duration::from_millis(100);
/// No dialog showed up within this time: the system answered on its own.
const DIALOG_GRACE: Duration = Duration::from_millis(1000);

fn with_activity<T>(app: &AndroidApp, f: impl FnOnce(&mut JNIEnv, &JObject) -> Result<T>) -> Result<T> {
    unsafe {
        let vm = JavaVM::from_raw(app.vm_as_ptr() as *mut *const JNIInvokeInterface_)?;
        let mut env = vm.attach_current_thread()?;
        let activity = JObject::from_raw(app.activity_as_ptr() as *mut _jobject);
        f(&mut env, &activity)
    }
}

pub fn sdk_version(app: &AndroidApp) -> Result<i32> {
    with_activity(app, |env, _| {
        Ok(env
            .get_static_field("android/os/Build$VERSION", "SDK_INT", "I")?
            .i()?)
    })
}

pub fn check_self_permission(app: &AndroidApp, permission: &str) -> Result<bool> {
    with_activity(app, |env, activity| {
        let granted_int = env
            .get_static_field(
                "android/content/pm/PackageManager",
                "PERMISSION_GRANTED",
                "I",
            )?
            .i()?;
        let permission_str = env.new_string(permission)?;
        let result = env
            .call_method(
                activity,
                "checkSelfPermission",
                "(Ljava/lang/String;)I",
                &[JValueGen::Object(&JObject::from(permission_str))],
            )?
            .i()?;
        Ok(result == granted_int)
    })
}

pub fn request_permissions(app: &AndroidApp, permissions: &[&str], request_code: i32) -> Result<()> {
    with_activity(app, |env, activity| {
        let java_permission_array =
            env.new_object_array(permissions.len() as jint, "java/lang/String", JObject::null())?;
        for (index, permission) in permissions.iter().enumerate() {
            let permission_str = env.new_string(*permission)?;
            env.set_object_array_element(&java_permission_array, index as jint, permission_str)?;
        }
        env.call_method(
            activity,
            "requestPermissions",
            "([Ljava/lang/String;I)V",
            &[
                JValueGen::Object(&JObject::from(java_permission_array)),
                request_code.into(),
            ],
        )?;
        Ok(())
    })
}

/// False while a system dialog (such as the permission prompt) covers the
/// activity.
pub fn has_window_focus(app: &AndroidApp) -> Result<bool> {
    with_activity(app, |env, activity| {
        Ok(env.call_method(activity, "hasWindowFocus", "()Z", &[])?.z()?)
    })
}

fn absolute_path(env: &mut JNIEnv, file: &JObject) -> Result<PathBuf> {
    if file.is_null() {
        return Err(anyhow!("file is null"));
    }
    let path = env
        .call_method(file, "getAbsolutePath", "()Ljava/lang/String;", &[])?
        .l()?;
    let path: JString = path.into();
    let path: String = env.get_string(&path)?.into();
    Ok(PathBuf::from(path))
}

/// `Context.getExternalMediaDirs()[0]`, or the internal files directory
/// when no external volume is mounted.
pub fn external_media_dir(app: &AndroidApp) -> Result<PathBuf> {
    with_activity(app, |env, activity| {
        let dirs = env
            .call_method(activity, "getExternalMediaDirs", "()[Ljava/io/File;", &[])?
            .l()?;
        if !dirs.is_null() {
            let dirs = JObjectArray::from(dirs);
            if env.get_array_length(&dirs)? > 0 {
                let first = env.get_object_array_element(&dirs, 0)?;
                if let Ok(path) = absolute_path(env, &first) {
                    return Ok(path);
                }
            }
        }
        warn!("no external media dir, using files dir");
        let files = env
            .call_method(activity, "getFilesDir", "()Ljava/io/File;", &[])?
            .l()?;
        absolute_path(env, &files)
    })
}

fn current_grants(app: &AndroidApp, permissions: &[Permission]) -> PermissionResults {
    permissions
        .iter()
        .map(|p| {
            let granted = check_self_permission(app, p.android_name()).unwrap_or_else(|err| {
                warn!("checkSelfPermission({}) failed: {err:#}", p.android_name());
                false
            });
            (*p, granted)
        })
        .collect()
}

/// `NativeActivity` does not forward `onRequestPermissionsResult`, so the
/// answer is read back once the dialog gives the window focus back.
pub struct AndroidPermissions {
    app: AndroidApp,
    poll: Rc<Timer>,
}

impl AndroidPermissions {
    pub fn new(app: AndroidApp) -> Self {
        AndroidPermissions {
            app,
            poll: Rc::new(Timer::default()),
        }
    }
}

impl PermissionRequester for AndroidPermissions {
    fn request(&self, permissions: &[Permission], done: PermissionCallback) {
        let sdk = sdk_version(&self.app).unwrap_or(RUNTIME_PERMISSIONS_SDK);
        if sdk < RUNTIME_PERMISSIONS_SDK {
            done(permissions.iter().map(|p| (*p, true)).collect());
            return;
        }
        let grants = current_grants(&self.app, permissions);
        if grants.values().all(|granted| *granted) {
            done(grants);
            return;
        }

        let names: Vec<&str> = permissions.iter().map(|p| p.android_name()).collect();
        info!("requesting {:?} (sdk {sdk})", names);
        if let Err(err) = request_permissions(&self.app, &names, PERMISSION_REQUEST_CODE) {
            warn!("requestPermissions failed: {err:#}");
            done(grants);
            return;
        }

        let app = self.app.clone();
        let permissions = permissions.to_vec();
        let mut done = Some(done);
        let started = Instant::now();
        let mut dialog_seen = false;
        let poll = Rc::downgrade(&self.poll);
        self.poll.start(TimerMode::Repeated, FOCUS_POLL, move || {
            let focused = has_window_focus(&app).unwrap_or(true);
            if !focused {
                dialog_seen = true;
                return;
            }
            if !dialog_seen && started.elapsed() < DIALOG_GRACE {
                return;
            }
            if let Some(timer) = poll.upgrade() {
                timer.stop();
            }
            if let Some(done) = done.take() {
                let grants = current_grants(&app, &permissions);
                debug!("permission dialog closed: {:?}", grants);
                done(grants);
            }
        });
    }
}
