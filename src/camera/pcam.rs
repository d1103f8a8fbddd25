use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc::Sender,
        Arc, Mutex,
    },
    time::Duration,
};

use anyhow::{anyhow, Context, Result};
use kamera::Camera as KCamera;
use log::{info, warn};
use slint::SharedPixelBuffer;

use super::{CameraInfo, Frame, LensFacing};

/// kamera has no lens metadata; the default device is reported as an
/// external camera.
pub fn list_cameras() -> Result<Vec<CameraInfo>> {
    Ok(match KCamera::new_device(0) {
        Some(_) => vec![CameraInfo {
            id: "0".to_string(),
            facing: LensFacing::External,
            sensor_orientation: 0,
            stream_sizes: vec![],
        }],
        None => vec![],
    })
}

pub struct Camera {
    running: Option<Arc<AtomicBool>>,
    camera_task: Option<std::thread::JoinHandle<Result<()>>>,
    frames: Sender<Frame>,
    latest: Arc<Mutex<Option<Frame>>>,
}

impl Camera {
    pub fn new(frames: Sender<Frame>) -> Self {
        Self {
            running: None,
            camera_task: None,
            frames,
            latest: Arc::new(Mutex::new(None)),
        }
    }

    pub fn open(&mut self, camera: &CameraInfo) -> Result<()> {
        self.close();
        let index: usize = camera
            .id
            .parse()
            .with_context(|| format!("bad camera id {}", camera.id))?;
        let running = Arc::new(AtomicBool::new(true));
        self.running = Some(running.clone());
        let frames = self.frames.clone();
        let latest = self.latest.clone();
        self.camera_task = Some(std::thread::spawn(move || {
            let camera = match KCamera::new_device(index) {
                None => return Err(anyhow!("camera id not exist")),
                Some(v) => v,
            };
            camera.start();
            let mut rgba_buffer = vec![];
            while running.load(Ordering::Acquire) {
                let frame = match camera.wait_for_frame() {
                    Some(f) => f,
                    None => {
                        warn!("no frame from camera {index}");
                        std::thread::sleep(Duration::from_millis(10));
                        continue;
                    }
                };

                let (width, height) = frame.size_u32();
                rgba_buffer.resize((width * height * 4) as usize, 0);
                let frame_data = frame.data();
                for (idx, bgra) in frame_data.data_u8().chunks(4).enumerate() {
                    rgba_buffer[idx * 4] = bgra[2];
                    rgba_buffer[idx * 4 + 1] = bgra[1];
                    rgba_buffer[idx * 4 + 2] = bgra[0];
                    rgba_buffer[idx * 4 + 3] = bgra[3];
                }

                let buf = SharedPixelBuffer::clone_from_slice(&rgba_buffer, width, height);
                if let Ok(mut slot) = latest.lock() {
                    *slot = Some(buf.clone());
                }
                if frames.send(buf).is_err() {
                    break;
                }
            }
            camera.stop();
            Ok(())
        }));
        Ok(())
    }

    pub fn latest_frame(&self) -> Result<Frame> {
        if self.running.is_none() {
            return Err(anyhow!("camera is not open"));
        }
        self.latest
            .lock()
            .map_err(|_| anyhow!("frame slot poisoned"))?
            .clone()
            .ok_or_else(|| anyhow!("no preview frame available yet"))
    }

    pub fn close(&mut self) {
        if let Some(running) = self.running.take() {
            running.store(false, Ordering::Release);
            if let Some(handle) = self.camera_task.take() {
                let res = handle.join();
                info!("stop preview: {:?}", res);
            }
        }
        if let Ok(mut slot) = self.latest.lock() {
            *slot = None;
        }
    }
}

impl Drop for Camera {
    fn drop(&mut self) {
        self.close();
    }
}
