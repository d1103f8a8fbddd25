use std::sync::mpsc::Sender;

use anyhow::{anyhow, Result};
use image::{
    imageops::{rotate180, rotate270, rotate90},
    RgbaImage,
};
use slint::{Rgba8Pixel, SharedPixelBuffer};

#[cfg(target_os = "android")]
mod camera2;

#[cfg(any(target_os = "windows", target_os = "macos"))]
mod pcam;

/// One RGBA picture coming out of the preview pipeline.
pub type Frame = SharedPixelBuffer<Rgba8Pixel>;

/// Preview streams are capped at this size.
pub const MAX_PREVIEW_WIDTH: u32 = 1280;
pub const MAX_PREVIEW_HEIGHT: u32 = 720;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LensFacing {
    Front,
    Back,
    External,
}

impl LensFacing {
    /// Maps the `ACAMERA_LENS_FACING` metadata value.
    pub fn from_metadata(value: u8) -> Self {
        match value {
            0 => LensFacing::Front,
            1 => LensFacing::Back,
            _ => LensFacing::External,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CameraInfo {
    pub id: String,
    pub facing: LensFacing,
    pub sensor_orientation: i32,
    /// width,height of the supported YUV output streams
    pub stream_sizes: Vec<(u32, u32)>,
}

/// Process wide view of the camera hardware. Enumeration may block, so the
/// flow calls it off the UI thread.
pub trait CameraProvider: Send + Sync + 'static {
    fn cameras(&self) -> Result<Vec<CameraInfo>>;
}

/// Owns the preview and still pipelines of at most one opened device.
pub trait CameraBinder {
    /// Closes whatever is bound. Safe to call when nothing is.
    fn unbind_all(&mut self);
    /// Opens `camera` and starts feeding preview frames.
    fn bind(&mut self, camera: &CameraInfo) -> Result<()>;
    /// The most recent full frame of the bound camera.
    fn take_still(&mut self) -> Result<Frame>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CameraSelector {
    #[default]
    DefaultBack,
}

impl CameraSelector {
    fn lens(&self) -> LensFacing {
        match self {
            CameraSelector::DefaultBack => LensFacing::Back,
        }
    }

    /// Picks the first camera with the wanted lens. Desktop webcams carry no
    /// lens metadata, so an external camera stands in when nothing matches.
    pub fn select<'a>(&self, cameras: &'a [CameraInfo]) -> Result<&'a CameraInfo> {
        if cameras.is_empty() {
            return Err(anyhow!("No camera device detected."));
        }
        let wanted = self.lens();
        cameras
            .iter()
            .find(|c| c.facing == wanted)
            .or_else(|| cameras.iter().find(|c| c.facing == LensFacing::External))
            .ok_or_else(|| anyhow!("No {:?} camera among {} device(s)", wanted, cameras.len()))
    }
}

/// Largest supported stream that fits inside `max_width` x `max_height`,
/// otherwise the smallest one the device offers.
pub fn choose_preview_size(sizes: &[(u32, u32)], max_width: u32, max_height: u32) -> Option<(u32, u32)> {
    let area = |(w, h): &(u32, u32)| (*w as u64) * (*h as u64);
    sizes
        .iter()
        .filter(|(w, h)| *w <= max_width && *h <= max_height)
        .max_by_key(|s| area(*s))
        .or_else(|| sizes.iter().min_by_key(|s| area(*s)))
        .copied()
}

/// android: YUV420SP(NV21) 转 rgba
pub fn decode_yuv420sp(data: &[u8], width: usize, height: usize) -> Result<Vec<u8>> {
    // one VU pair per 2x2 block
    if width % 2 != 0 || height % 2 != 0 {
        return Err(anyhow!("yuv420sp needs even dimensions, got {width}x{height}"));
    }
    let frame_size = width * height;
    if data.len() < frame_size + frame_size / 2 {
        return Err(anyhow!(
            "yuv buffer too short: {} bytes for {width}x{height}",
            data.len()
        ));
    }
    let mut rgba_data = Vec::with_capacity(frame_size * 4);
    let mut yp = 0;
    for j in 0..height {
        let (mut uvp, mut u, mut v) = (frame_size + (j >> 1) * width, 0, 0);
        for i in 0..width {
            let y = (data[yp] as i32 - 16).max(0);
            if i & 1 == 0 {
                v = data[uvp] as i32 - 128;
                u = data[uvp + 1] as i32 - 128;
                uvp += 2;
            }
            let y1192 = 1192 * y;
            let r = (y1192 + 1634 * v).clamp(0, 262143);
            let g = (y1192 - 833 * v - 400 * u).clamp(0, 262143);
            let b = (y1192 + 2066 * u).clamp(0, 262143);
            rgba_data.extend_from_slice(&[(r >> 10) as u8, (g >> 10) as u8, (b >> 10) as u8, 255]);
            yp += 1;
        }
    }
    Ok(rgba_data)
}

/// Turns a sensor-oriented image upright.
pub fn rotate_for_display(image: RgbaImage, sensor_orientation: i32) -> RgbaImage {
    match sensor_orientation.rem_euclid(360) {
        90 => rotate90(&image),
        180 => rotate180(&image),
        270 => rotate270(&image),
        _ => image,
    }
}

pub fn frame_from_image(image: &RgbaImage) -> Frame {
    SharedPixelBuffer::clone_from_slice(image.as_raw(), image.width(), image.height())
}

/// Enumerates the cameras of the device the app runs on.
pub struct PlatformProvider;

impl CameraProvider for PlatformProvider {
    fn cameras(&self) -> Result<Vec<CameraInfo>> {
        #[cfg(target_os = "android")]
        return camera2::list_cameras();
        #[cfg(any(target_os = "windows", target_os = "macos"))]
        return pcam::list_cameras();
        #[cfg(not(any(target_os = "android", target_os = "windows", target_os = "macos")))]
        Ok(vec![])
    }
}

pub struct PlatformCamera {
    #[cfg(target_os = "android")]
    camera: camera2::AndroidCamera,
    #[cfg(any(target_os = "windows", target_os = "macos"))]
    camera: pcam::Camera,
    #[cfg(not(any(target_os = "android", target_os = "windows", target_os = "macos")))]
    _frames: Sender<Frame>,
}

impl PlatformCamera {
    pub fn new(frames: Sender<Frame>) -> Self {
        PlatformCamera {
            #[cfg(target_os = "android")]
            camera: camera2::AndroidCamera::new(frames),
            #[cfg(any(target_os = "windows", target_os = "macos"))]
            camera: pcam::Camera::new(frames),
            #[cfg(not(any(target_os = "android", target_os = "windows", target_os = "macos")))]
            _frames: frames,
        }
    }
}

impl CameraBinder for PlatformCamera {
    fn unbind_all(&mut self) {
        #[cfg(any(target_os = "android", target_os = "windows", target_os = "macos"))]
        self.camera.close();
    }

    fn bind(&mut self, camera: &CameraInfo) -> Result<()> {
        #[cfg(any(target_os = "android", target_os = "windows", target_os = "macos"))]
        return self.camera.open(camera);
        #[cfg(not(any(target_os = "android", target_os = "windows", target_os = "macos")))]
        Err(anyhow!("no camera backend for camera {}", camera.id))
    }

    fn take_still(&mut self) -> Result<Frame> {
        #[cfg(any(target_os = "android", target_os = "windows", target_os = "macos"))]
        return self.camera.latest_frame();
        #[cfg(not(any(target_os = "android", target_os = "windows", target_os = "macos")))]
        Err(anyhow!("no camera bound"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(id: &str, facing: LensFacing) -> CameraInfo {
        CameraInfo {
            id: id.to_string(),
            facing,
            sensor_orientation: 90,
            stream_sizes: vec![],
        }
    }

    #[test]
    fn selects_rear_camera() {
        let cameras = vec![info("1", LensFacing::Front), info("0", LensFacing::Back)];
        let picked = CameraSelector::DefaultBack.select(&cameras).unwrap();
        assert_eq!(picked.id, "0");
    }

    #[test]
    fn external_camera_stands_in_for_missing_rear() {
        let cameras = vec![info("usb", LensFacing::External)];
        let picked = CameraSelector::DefaultBack.select(&cameras).unwrap();
        assert_eq!(picked.id, "usb");
    }

    #[test]
    fn no_rear_camera_is_an_error() {
        assert!(CameraSelector::DefaultBack.select(&[]).is_err());
        let front_only = vec![info("1", LensFacing::Front)];
        assert!(CameraSelector::DefaultBack.select(&front_only).is_err());
    }

    #[test]
    fn lens_facing_metadata() {
        assert_eq!(LensFacing::from_metadata(0), LensFacing::Front);
        assert_eq!(LensFacing::from_metadata(1), LensFacing::Back);
        assert_eq!(LensFacing::from_metadata(2), LensFacing::External);
    }

    #[test]
    fn preview_size_fits_inside_cap() {
        let sizes = [(1920, 1080), (1280, 720), (640, 480), (320, 240)];
        assert_eq!(choose_preview_size(&sizes, 1280, 720), Some((1280, 720)));
        assert_eq!(choose_preview_size(&sizes, 800, 600), Some((640, 480)));
        assert_eq!(choose_preview_size(&[(4000, 3000), (1920, 1080)], 1280, 720), Some((1920, 1080)));
        assert_eq!(choose_preview_size(&[], 1280, 720), None);
    }

    #[test]
    fn decodes_grey_nv21() {
        // 2x2 luma, one VU pair
        let black = decode_yuv420sp(&[16, 16, 16, 16, 128, 128], 2, 2).unwrap();
        assert_eq!(black.len(), 16);
        assert!(black.chunks(4).all(|px| px == [0, 0, 0, 255]));

        let white = decode_yuv420sp(&[235, 235, 235, 235, 128, 128], 2, 2).unwrap();
        assert!(white.chunks(4).all(|px| px == [254, 254, 254, 255]));
    }

    #[test]
    fn short_yuv_buffer_is_rejected() {
        assert!(decode_yuv420sp(&[0; 4], 2, 2).is_err());
        assert!(decode_yuv420sp(&[0; 5], 2, 2).is_err());
    }

    #[test]
    fn odd_yuv_dimensions_are_rejected() {
        // 3x2 passes the w*h*3/2 length check but its last VU pair would
        // sit past the end
        assert!(decode_yuv420sp(&[128; 9], 3, 2).is_err());
        assert!(decode_yuv420sp(&[128; 12], 2, 3).is_err());
        assert!(decode_yuv420sp(&[128; 64], 3, 2).is_err());
    }

    #[test]
    fn rotation_follows_sensor_orientation() {
        let image = RgbaImage::new(4, 2);
        assert_eq!(rotate_for_display(image.clone(), 90).dimensions(), (2, 4));
        assert_eq!(rotate_for_display(image.clone(), 270).dimensions(), (2, 4));
        assert_eq!(rotate_for_display(image.clone(), 180).dimensions(), (4, 2));
        assert_eq!(rotate_for_display(image, 0).dimensions(), (4, 2));
    }

    #[test]
    fn frame_keeps_pixels() {
        let mut image = RgbaImage::new(3, 1);
        image.put_pixel(2, 0, image::Rgba([1, 2, 3, 4]));
        let frame = frame_from_image(&image);
        assert_eq!((frame.width(), frame.height()), (3, 1));
        assert_eq!(&frame.as_bytes()[8..12], &[1, 2, 3, 4]);
    }
}
