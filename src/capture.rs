//! Captured image files and the single background worker that writes them.

use std::{
    fs,
    path::{Path, PathBuf},
    sync::mpsc::{sync_channel, SyncSender, TrySendError},
    thread::JoinHandle,
    time::{SystemTime, UNIX_EPOCH},
};

use anyhow::{anyhow, Context, Result};
use image::{DynamicImage, ImageFormat, RgbaImage};
use log::{debug, warn};

use crate::camera::Frame;

/// Jobs waiting behind the one being written.
pub const CAPTURE_QUEUE_DEPTH: usize = 8;

/// `IMG_<unix-epoch-millis>.jpg`
pub fn image_file_name(epoch_millis: u128) -> String {
    format!("IMG_{epoch_millis}.jpg")
}

pub trait Clock: Send {
    fn now_millis(&self) -> u128;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> u128 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or_default()
    }
}

/// A photo on the device. Nothing deletes it after upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapturedImage {
    pub name: String,
    pub path: PathBuf,
}

impl CapturedImage {
    pub fn at(media_dir: &Path, epoch_millis: u128) -> Self {
        let name = image_file_name(epoch_millis);
        CapturedImage {
            path: media_dir.join(&name),
            name,
        }
    }
}

pub struct CaptureJob {
    /// Camera session the shutter was pressed in.
    pub session: u64,
    pub frame: Frame,
    pub image: CapturedImage,
}

type Completion = Box<dyn Fn(u64, Result<CapturedImage>) + Send>;

/// Single-slot sequential executor: jobs are written one at a time in the
/// order they were submitted.
pub struct CaptureWorker {
    jobs: Option<SyncSender<CaptureJob>>,
    handle: Option<JoinHandle<()>>,
}

impl CaptureWorker {
    pub fn spawn(on_done: impl Fn(u64, Result<CapturedImage>) + Send + 'static) -> Result<Self> {
        let on_done: Completion = Box::new(on_done);
        let (jobs, queue) = sync_channel::<CaptureJob>(CAPTURE_QUEUE_DEPTH);
        let handle = std::thread::Builder::new()
            .name("image-capture".into())
            .spawn(move || {
                for job in queue {
                    let result = write_jpeg(&job.frame, &job.image.path).map(|_| job.image);
                    on_done(job.session, result);
                }
                debug!("capture worker stopped");
            })
            .context("failed to start capture worker")?;
        Ok(CaptureWorker {
            jobs: Some(jobs),
            handle: Some(handle),
        })
    }

    pub fn submit(&self, job: CaptureJob) -> Result<()> {
        let jobs = self
            .jobs
            .as_ref()
            .ok_or_else(|| anyhow!("capture worker is shut down"))?;
        jobs.try_send(job).map_err(|err| match err {
            TrySendError::Full(job) => anyhow!("capture queue full, dropping {}", job.image.name),
            TrySendError::Disconnected(job) => {
                anyhow!("capture worker is gone, dropping {}", job.image.name)
            }
        })
    }

    /// Lets queued jobs finish, then joins the thread.
    pub fn shutdown(&mut self) {
        self.jobs.take();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("capture worker panicked");
            }
        }
    }
}

impl Drop for CaptureWorker {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Encodes `frame` as JPEG at `path`, creating the directory if needed.
pub fn write_jpeg(frame: &Frame, path: &Path) -> Result<()> {
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir).with_context(|| format!("create {}", dir.display()))?;
    }
    let rgba = RgbaImage::from_raw(frame.width(), frame.height(), frame.as_bytes().to_vec())
        .ok_or_else(|| anyhow!("frame does not hold {}x{} pixels", frame.width(), frame.height()))?;
    DynamicImage::ImageRgba8(rgba)
        .to_rgb8()
        .save_with_format(path, ImageFormat::Jpeg)
        .with_context(|| format!("write {}", path.display()))
}
