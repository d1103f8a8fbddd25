//! Runtime permissions the camera screen needs before it may open.

use std::{cell::Cell, collections::HashMap, rc::Rc};

use log::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Permission {
    Camera,
    WriteExternalStorage,
}

impl Permission {
    pub fn android_name(&self) -> &'static str {
        match self {
            Permission::Camera => "android.permission.CAMERA",
            Permission::WriteExternalStorage => "android.permission.WRITE_EXTERNAL_STORAGE",
        }
    }
}

/// Requested together as one batch.
pub const REQUIRED_PERMISSIONS: [Permission; 2] =
    [Permission::Camera, Permission::WriteExternalStorage];

pub const PERMISSION_DENIED_NOTICE: &str = "Permission denied";

pub type PermissionResults = HashMap<Permission, bool>;

pub type PermissionCallback = Box<dyn FnOnce(PermissionResults)>;

/// Shows the platform dialog. `done` runs exactly once, on the UI thread,
/// whenever the user answers.
pub trait PermissionRequester {
    fn request(&self, permissions: &[Permission], done: PermissionCallback);
}

/// Hosts without runtime permissions.
pub struct AlwaysGranted;

impl PermissionRequester for AlwaysGranted {
    fn request(&self, permissions: &[Permission], done: PermissionCallback) {
        done(permissions.iter().map(|p| (*p, true)).collect())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateDecision {
    Proceed,
    Denied { denied: Vec<Permission> },
}

/// Every requested permission must be present and granted. A permission
/// missing from `results` (dialog dismissed) counts as denied.
pub fn evaluate(requested: &[Permission], results: &PermissionResults) -> GateDecision {
    let mut denied: Vec<Permission> = requested
        .iter()
        .filter(|p| !results.get(*p).copied().unwrap_or(false))
        .copied()
        .collect();
    if denied.is_empty() {
        GateDecision::Proceed
    } else {
        denied.sort();
        denied.dedup();
        GateDecision::Denied { denied }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateState {
    Ungated,
    Requesting,
    Gated,
}

pub struct PermissionGate {
    requester: Box<dyn PermissionRequester>,
    state: Rc<Cell<GateState>>,
}

impl PermissionGate {
    pub fn new(requester: impl PermissionRequester + 'static) -> Self {
        PermissionGate {
            requester: Box::new(requester),
            state: Rc::new(Cell::new(GateState::Ungated)),
        }
    }

    pub fn state(&self) -> GateState {
        self.state.get()
    }

    /// Asks for [`REQUIRED_PERMISSIONS`] and hands the decision to
    /// `on_decision`. Taps while a dialog is up are ignored.
    pub fn open_camera(&self, on_decision: impl FnOnce(GateDecision) + 'static) {
        if self.state.get() == GateState::Requesting {
            debug!("permission request already in flight");
            return;
        }
        self.state.set(GateState::Requesting);
        let state = self.state.clone();
        self.requester.request(
            &REQUIRED_PERMISSIONS,
            Box::new(move |results| {
                let decision = evaluate(&REQUIRED_PERMISSIONS, &results);
                match &decision {
                    GateDecision::Proceed => {
                        info!("camera and storage permissions granted");
                        state.set(GateState::Gated);
                    }
                    GateDecision::Denied { denied } => {
                        warn!("permissions denied: {:?}", denied);
                        state.set(GateState::Ungated);
                    }
                }
                on_decision(decision);
            }),
        );
    }
}
