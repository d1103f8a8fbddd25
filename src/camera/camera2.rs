use anyhow::{anyhow, Context, Result};
use core::slice;
use image::RgbaImage;
use log::{debug, error, info, warn};
use ndk_sys::{
    acamera_metadata_tag, camera_status_t, media_status_t, ACameraCaptureSession,
    ACameraCaptureSession_close, ACameraCaptureSession_setRepeatingRequest,
    ACameraCaptureSession_stateCallbacks, ACameraDevice, ACameraDevice_StateCallbacks,
    ACameraDevice_close, ACameraDevice_createCaptureRequest, ACameraDevice_createCaptureSession,
    ACameraDevice_getId, ACameraDevice_request_template, ACameraManager, ACameraManager_create,
    ACameraManager_delete, ACameraManager_deleteCameraIdList,
    ACameraManager_getCameraCharacteristics, ACameraManager_getCameraIdList,
    ACameraManager_openCamera, ACameraMetadata, ACameraMetadata_const_entry, ACameraMetadata_free,
    ACameraMetadata_getConstEntry, ACameraOutputTarget, ACameraOutputTarget_create,
    ACameraOutputTarget_free, ACaptureRequest, ACaptureRequest_addTarget, ACaptureRequest_free,
    ACaptureSessionOutput, ACaptureSessionOutputContainer, ACaptureSessionOutputContainer_add,
    ACaptureSessionOutputContainer_create, ACaptureSessionOutputContainer_free,
    ACaptureSessionOutput_create, ACaptureSessionOutput_free, AImage, AImageReader,
    AImageReader_ImageListener, AImageReader_acquireLatestImage, AImageReader_delete,
    AImageReader_getFormat, AImageReader_getHeight, AImageReader_getWidth,
    AImageReader_getWindow, AImageReader_new, AImageReader_setImageListener, AImage_delete,
    AImage_getPlaneData, ANativeWindow, AIMAGE_FORMATS,
};
use std::{
    ffi::{c_int, c_void, CStr, CString},
    mem::zeroed,
    ptr::null_mut,
    sync::{mpsc::Sender, Arc, Mutex},
    time::Instant,
};

use super::{
    choose_preview_size, decode_yuv420sp, frame_from_image, rotate_for_display, CameraInfo, Frame,
    LensFacing, MAX_PREVIEW_HEIGHT, MAX_PREVIEW_WIDTH,
};

#[link(name = "camera2ndk")]
extern "C" {}

#[link(name = "mediandk")]
extern "C" {}

/// Lists every camera the NDK camera service knows about.
pub fn list_cameras() -> Result<Vec<CameraInfo>> {
    unsafe {
        let camera_manager = ACameraManager_create();
        if camera_manager.is_null() {
            return Err(anyhow!("Failed to create camera manager"));
        }
        let cameras = enumerate_cameras(camera_manager);
        ACameraManager_delete(camera_manager);
        cameras
    }
}

unsafe fn enumerate_cameras(camera_manager: *mut ACameraManager) -> Result<Vec<CameraInfo>> {
    let mut camera_id_list_raw = null_mut();
    let camera_status = ACameraManager_getCameraIdList(camera_manager, &mut camera_id_list_raw);
    if camera_status != camera_status_t::ACAMERA_OK {
        return Err(anyhow!(
            "Failed to get camera id list (reason: {:?})",
            camera_status
        ));
    }
    if camera_id_list_raw.is_null() {
        return Err(anyhow!(
            "Failed to get camera id list (reason: camera_id_list is null)"
        ));
    }

    let camera_id_list = &*camera_id_list_raw;
    let camera_ids = if camera_id_list.numCameras > 0 {
        slice::from_raw_parts(camera_id_list.cameraIds, camera_id_list.numCameras as usize)
    } else {
        &[]
    };

    let mut cameras = Vec::with_capacity(camera_ids.len());
    for raw_id in camera_ids {
        let Some(id) = get_cstr(*raw_id) else {
            continue;
        };
        let mut camera_metadata = null_mut();
        let camera_status =
            ACameraManager_getCameraCharacteristics(camera_manager, *raw_id, &mut camera_metadata);
        if camera_status != camera_status_t::ACAMERA_OK {
            warn!("Failed to get camera meta data of id:{id} ({camera_status:?})");
            continue;
        }
        let (lens_facing, sensor_orientation) = lens_metadata(camera_metadata);
        let stream_sizes = yuv_stream_sizes(camera_metadata).unwrap_or_else(|err| {
            warn!("camera {id}: {err:#}");
            vec![]
        });
        ACameraMetadata_free(camera_metadata);

        cameras.push(CameraInfo {
            id: id.to_string(),
            facing: LensFacing::from_metadata(lens_facing),
            sensor_orientation,
            stream_sizes,
        });
    }
    ACameraManager_deleteCameraIdList(camera_id_list_raw);
    info!("cameras: {:?}", cameras);
    Ok(cameras)
}

unsafe fn lens_metadata(camera_metadata: *mut ACameraMetadata) -> (u8, i32) {
    let mut lens_facing: ACameraMetadata_const_entry = zeroed();
    let mut sensor_orientation: ACameraMetadata_const_entry = zeroed();

    ACameraMetadata_getConstEntry(
        camera_metadata,
        acamera_metadata_tag::ACAMERA_LENS_FACING.0,
        &mut lens_facing,
    );
    ACameraMetadata_getConstEntry(
        camera_metadata,
        acamera_metadata_tag::ACAMERA_SENSOR_ORIENTATION.0,
        &mut sensor_orientation,
    );

    let facing = if lens_facing.count > 0 {
        *lens_facing.data.u8_
    } else {
        2
    };
    let orientation = if sensor_orientation.count > 0 {
        *sensor_orientation.data.i32_
    } else {
        0
    };
    (facing, orientation)
}

// 获取相机支持的 YUV 分辨率
unsafe fn yuv_stream_sizes(camera_metadata: *mut ACameraMetadata) -> Result<Vec<(u32, u32)>> {
    let mut available_configs: ACameraMetadata_const_entry = zeroed();
    let camera_status = ACameraMetadata_getConstEntry(
        camera_metadata,
        acamera_metadata_tag::ACAMERA_SCALER_AVAILABLE_STREAM_CONFIGURATIONS.0,
        &mut available_configs,
    );
    if camera_status != camera_status_t::ACAMERA_OK {
        return Err(anyhow!(
            "Failed to get stream configurations res={:?}",
            camera_status
        ));
    }

    // 数据格式: format, width, height, input?
    let data: &[i32] =
        slice::from_raw_parts(available_configs.data.i32_, available_configs.count as usize);
    Ok(data
        .chunks_exact(4)
        .filter(|c| c[3] == 0 && c[0] == AIMAGE_FORMATS::AIMAGE_FORMAT_YUV_420_888.0 as i32)
        .map(|c| (c[1] as u32, c[2] as u32))
        .collect())
}

/// Receives frames from the image reader on the NDK callback thread.
struct FrameSink {
    image_reader: *mut AImageReader,
    sensor_orientation: i32,
    frames: Sender<Frame>,
    latest: Arc<Mutex<Option<Frame>>>,
    timer: Mutex<(Instant, u32)>,
}

/// Deletes the acquired image on every exit path.
struct AcquiredImage(*mut AImage);

impl Drop for AcquiredImage {
    fn drop(&mut self) {
        unsafe { AImage_delete(self.0) }
    }
}

impl FrameSink {
    unsafe fn on_image_available(&self) -> Result<()> {
        let mut image = null_mut();
        let media_status = AImageReader_acquireLatestImage(self.image_reader, &mut image);
        if media_status != media_status_t::AMEDIA_OK {
            return Err(
                if media_status == media_status_t::AMEDIA_IMGREADER_NO_BUFFER_AVAILABLE {
                    anyhow!("An image reader frame was discarded")
                } else {
                    anyhow!(
                        "Failed to acquire latest image from image reader, error: {:?}.",
                        media_status
                    )
                },
            );
        }
        let image = AcquiredImage(image);

        let mut format = 0;
        let res = AImageReader_getFormat(self.image_reader, &mut format);
        if res != media_status_t::AMEDIA_OK {
            return Err(anyhow!("AImageReader_getFormat error res={:?}.", res));
        }
        if format != AIMAGE_FORMATS::AIMAGE_FORMAT_YUV_420_888.0 as i32 {
            return Err(anyhow!("format is not AIMAGE_FORMAT_YUV_420_888"));
        }
        let mut width = 0;
        let mut height = 0;
        let res = AImageReader_getWidth(self.image_reader, &mut width);
        if res != media_status_t::AMEDIA_OK {
            return Err(anyhow!("AImageReader_getWidth error res={:?}.", res));
        }
        let res = AImageReader_getHeight(self.image_reader, &mut height);
        if res != media_status_t::AMEDIA_OK {
            return Err(anyhow!("AImageReader_getHeight error res={:?}.", res));
        }

        // Y 平面和交错的 VU 平面在同一块连续内存里
        let mut y_pixel = null_mut();
        let mut y_len = 0;
        AImage_getPlaneData(image.0, 0, &mut y_pixel, &mut y_len);
        if y_pixel.is_null() {
            return Err(anyhow!("image has no luma plane"));
        }
        let (width, height) = (width as usize, height as usize);
        let yuv_data = slice::from_raw_parts(y_pixel, width * height + width * height / 2);
        let rgba = decode_yuv420sp(yuv_data, width, height)?;
        drop(image);

        let upright = RgbaImage::from_raw(width as u32, height as u32, rgba)
            .map(|img| rotate_for_display(img, self.sensor_orientation))
            .ok_or_else(|| anyhow!("rgba buffer does not match {width}x{height}"))?;
        let frame = frame_from_image(&upright);
        if let Ok(mut latest) = self.latest.lock() {
            *latest = Some(frame.clone());
        }
        self.frames.send(frame).map_err(|err| anyhow!("{:?}", err))?;

        // 预览回调帧率正常是 30FPS
        if let Ok(mut timer) = self.timer.lock() {
            timer.1 += 1;
            if timer.0.elapsed().as_millis() > 1000 {
                debug!("预览 FPS:{}", timer.1);
                *timer = (Instant::now(), 0);
            }
        }
        Ok(())
    }
}

pub struct AndroidCamera {
    camera_device: *mut ACameraDevice,
    capture_request: *mut ACaptureRequest,
    camera_output_target: *mut ACameraOutputTarget,
    session_output: *mut ACaptureSessionOutput,
    capture_session_output_container: *mut ACaptureSessionOutputContainer,
    capture_session: *mut ACameraCaptureSession,
    image_reader: *mut AImageReader,
    image_listener: Box<AImageReader_ImageListener>,
    capture_session_state_callbacks: Box<ACameraCaptureSession_stateCallbacks>,
    device_state_callbacks: Box<ACameraDevice_StateCallbacks>,
    sink: Option<Box<FrameSink>>,
    camera_id: Option<String>,
    frames: Sender<Frame>,
    latest: Arc<Mutex<Option<Frame>>>,
}

impl AndroidCamera {
    pub fn new(frames: Sender<Frame>) -> Self {
        Self {
            camera_device: null_mut(),
            capture_request: null_mut(),
            camera_output_target: null_mut(),
            session_output: null_mut(),
            capture_session_output_container: null_mut(),
            capture_session: null_mut(),
            image_reader: null_mut(),
            image_listener: Box::new(AImageReader_ImageListener {
                context: null_mut(),
                onImageAvailable: None,
            }),
            capture_session_state_callbacks: Box::new(unsafe { zeroed() }),
            device_state_callbacks: Box::new(unsafe { zeroed() }),
            sink: None,
            camera_id: None,
            frames,
            latest: Arc::new(Mutex::new(None)),
        }
    }

    /// Opens the device and starts the repeating preview request.
    pub fn open(&mut self, camera: &CameraInfo) -> Result<()> {
        self.close();
        let res = unsafe { self.start(camera) };
        if res.is_err() {
            self.close();
        }
        res
    }

    pub fn latest_frame(&self) -> Result<Frame> {
        if self.camera_device.is_null() {
            return Err(anyhow!("camera is not open"));
        }
        self.latest
            .lock()
            .map_err(|_| anyhow!("frame slot poisoned"))?
            .clone()
            .ok_or_else(|| anyhow!("no preview frame available yet"))
    }

    unsafe fn start(&mut self, camera: &CameraInfo) -> Result<()> {
        self.open_device(&camera.id)?;

        let (width, height) =
            choose_preview_size(&camera.stream_sizes, MAX_PREVIEW_WIDTH, MAX_PREVIEW_HEIGHT)
                .unwrap_or((MAX_PREVIEW_WIDTH, MAX_PREVIEW_HEIGHT));
        info!("camera {} preview {width}x{height}", camera.id);
        self.create_image_reader(width, height, camera.sensor_orientation)?;

        let camera_status = ACameraDevice_createCaptureRequest(
            self.camera_device,
            ACameraDevice_request_template::TEMPLATE_PREVIEW,
            &mut self.capture_request,
        );
        if camera_status != camera_status_t::ACAMERA_OK {
            return Err(anyhow!(
                "Failed to create preview capture request (id: {:?})",
                self.camera_id
            ));
        }

        let mut native_window: *mut ANativeWindow = null_mut();
        let res = AImageReader_getWindow(self.image_reader, &mut native_window);
        if res != media_status_t::AMEDIA_OK {
            return Err(anyhow!("AImageReader_getWindow error res={:?}", res));
        }

        ACameraOutputTarget_create(native_window, &mut self.camera_output_target);
        ACaptureRequest_addTarget(self.capture_request, self.camera_output_target);
        ACaptureSessionOutput_create(native_window, &mut self.session_output);

        let camera_status =
            ACaptureSessionOutputContainer_create(&mut self.capture_session_output_container);
        if camera_status != camera_status_t::ACAMERA_OK {
            return Err(anyhow!(
                "Failed to create capture session output container (reason: {:?})",
                camera_status
            ));
        }
        ACaptureSessionOutputContainer_add(
            self.capture_session_output_container,
            self.session_output,
        );

        unsafe extern "C" fn capture_session_on_ready(
            _context: *mut c_void,
            session: *mut ACameraCaptureSession,
        ) {
            debug!("Session is ready. {:?}", session);
        }

        unsafe extern "C" fn capture_session_on_active(
            _context: *mut c_void,
            session: *mut ACameraCaptureSession,
        ) {
            debug!("Session is activated. {:?}", session);
        }

        unsafe extern "C" fn capture_session_on_closed(
            _context: *mut c_void,
            session: *mut ACameraCaptureSession,
        ) {
            debug!("Session is closed. {:?}", session);
        }

        self.capture_session_state_callbacks.onReady = Some(capture_session_on_ready);
        self.capture_session_state_callbacks.onActive = Some(capture_session_on_active);
        self.capture_session_state_callbacks.onClosed = Some(capture_session_on_closed);

        let camera_status = ACameraDevice_createCaptureSession(
            self.camera_device,
            self.capture_session_output_container,
            &*self.capture_session_state_callbacks,
            &mut self.capture_session,
        );
        if camera_status != camera_status_t::ACAMERA_OK {
            return Err(anyhow!(
                "Failed to create capture session (reason: {:?})",
                camera_status
            ));
        }

        let camera_status = ACameraCaptureSession_setRepeatingRequest(
            self.capture_session,
            null_mut(),
            1,
            &mut self.capture_request,
            null_mut(),
        );
        if camera_status != camera_status_t::ACAMERA_OK {
            return Err(anyhow!(
                "Failed to set repeating request (reason: {:?})",
                camera_status
            ));
        }
        Ok(())
    }

    unsafe fn open_device(&mut self, camera_id: &str) -> Result<()> {
        unsafe extern "C" fn on_disconnected(_data: *mut c_void, device: *mut ACameraDevice) {
            info!(
                "Camera(id: {:?}) is disconnected.",
                get_cstr(ACameraDevice_getId(device))
            );
        }

        unsafe extern "C" fn on_error(_data: *mut c_void, device: *mut ACameraDevice, error: c_int) {
            error!(
                "Error(code: {}) on Camera(id: {:?}).",
                error,
                get_cstr(ACameraDevice_getId(device))
            );
        }

        self.device_state_callbacks.onDisconnected = Some(on_disconnected);
        self.device_state_callbacks.onError = Some(on_error);

        let id = CString::new(camera_id).context("camera id contains a nul byte")?;
        let camera_manager = ACameraManager_create();
        let camera_status = ACameraManager_openCamera(
            camera_manager,
            id.as_ptr(),
            &mut *self.device_state_callbacks,
            &mut self.camera_device,
        );
        ACameraManager_delete(camera_manager);

        if camera_status != camera_status_t::ACAMERA_OK {
            return Err(anyhow!(
                "Failed to open camera device (id: {camera_id}, reason: {camera_status:?})"
            ));
        }
        self.camera_id = Some(camera_id.to_string());
        Ok(())
    }

    unsafe fn create_image_reader(&mut self, width: u32, height: u32, sensor_orientation: i32) -> Result<()> {
        let res = AImageReader_new(
            width as i32,
            height as i32,
            AIMAGE_FORMATS::AIMAGE_FORMAT_YUV_420_888.0 as i32,
            2,
            &mut self.image_reader,
        );
        if res != media_status_t::AMEDIA_OK {
            return Err(anyhow!("create Image Reader error res={:?}", res));
        }

        unsafe extern "C" fn on_image_available(context: *mut c_void, _image_reader: *mut AImageReader) {
            // 还原 FrameSink 指针
            let sink = &*(context as *const FrameSink);
            if let Err(err) = sink.on_image_available() {
                debug!("preview frame dropped: {err:#}");
            }
        }

        let sink = Box::new(FrameSink {
            image_reader: self.image_reader,
            sensor_orientation,
            frames: self.frames.clone(),
            latest: self.latest.clone(),
            timer: Mutex::new((Instant::now(), 0)),
        });
        self.image_listener.context = &*sink as *const FrameSink as *mut c_void;
        self.image_listener.onImageAvailable = Some(on_image_available);
        self.sink = Some(sink);

        let res = AImageReader_setImageListener(self.image_reader, &mut *self.image_listener);
        if res != media_status_t::AMEDIA_OK {
            return Err(anyhow!("set Image Listener error res={:?}", res));
        }
        Ok(())
    }

    pub fn close(&mut self) {
        unsafe {
            if !self.capture_session.is_null() {
                ACameraCaptureSession_close(self.capture_session);
                self.capture_session = null_mut();
            }

            if !self.camera_device.is_null() {
                let camera_status = ACameraDevice_close(self.camera_device);
                if camera_status != camera_status_t::ACAMERA_OK {
                    error!("Failed to close CameraDevice.");
                }
                self.camera_device = null_mut();
            }

            if !self.capture_request.is_null() {
                ACaptureRequest_free(self.capture_request);
                self.capture_request = null_mut();
            }

            if !self.camera_output_target.is_null() {
                ACameraOutputTarget_free(self.camera_output_target);
                self.camera_output_target = null_mut();
            }

            if !self.session_output.is_null() {
                ACaptureSessionOutput_free(self.session_output);
                self.session_output = null_mut();
            }

            if !self.capture_session_output_container.is_null() {
                ACaptureSessionOutputContainer_free(self.capture_session_output_container);
                self.capture_session_output_container = null_mut();
            }

            // 删除 reader 之后不会再有帧回调, 之后才能释放 sink
            if !self.image_reader.is_null() {
                AImageReader_delete(self.image_reader);
                self.image_reader = null_mut();
            }
        }
        self.sink = None;
        if let Ok(mut latest) = self.latest.lock() {
            *latest = None;
        }
        if let Some(id) = self.camera_id.take() {
            info!("Close Camera {id}");
        }
    }
}

impl Drop for AndroidCamera {
    fn drop(&mut self) {
        self.close();
    }
}

pub unsafe fn get_cstr<'a>(s: *const ::std::os::raw::c_char) -> Option<&'a str> {
    if s.is_null() {
        return None;
    }
    CStr::from_ptr(s).to_str().ok()
}
