//! Windows Graphics Capture session bound to one window.

pub use imp::CaptureSession;

#[cfg(windows)]
mod imp {
    use super::super::{
        pack_rows, CaptureError, CaptureFrame, FrameTiming, LatestFrame, StagingCache,
    };
    use crate::window;
    use std::sync::Arc;
    use tracing::{debug, info, warn};
    use windows::core::{IInspectable, Interface};
    use windows::Foundation::TypedEventHandler;
    use windows::Graphics::Capture::{
        Direct3D11CaptureFramePool, GraphicsCaptureItem, GraphicsCaptureSession,
    };
    use windows::Graphics::DirectX::Direct3D11::IDirect3DDevice;
    use windows::Graphics::DirectX::DirectXPixelFormat;
    use windows::Win32::Foundation::*;
    use windows::Win32::Graphics::Direct3D::*;
    use windows::Win32::Graphics::Direct3D11::*;
    use windows::Win32::Graphics::Dxgi::Common::*;
    use windows::Win32::Graphics::Dxgi::IDXGIDevice;
    use windows::Win32::System::WinRT::Direct3D11::{
        CreateDirect3D11DeviceFromDXGIDevice, IDirect3DDxgiInterfaceAccess,
    };
    use windows::Win32::System::WinRT::Graphics::Capture::IGraphicsCaptureItemInterop;

    /// A frame texture handed from the compositor thread to the capture caller.
    #[derive(Clone)]
    struct FrameTexture {
        texture: ID3D11Texture2D,
        width: u32,
        height: u32,
    }

    // SAFETY: the device is created without D3D11_CREATE_DEVICE_SINGLETHREADED, so its
    // resources may be referenced from any thread. Only the immediate context is
    // thread-affine, and it never leaves CaptureSession.
    unsafe impl Send for FrameTexture {}
    // SAFETY: see above; the texture is only read through the immediate context.
    unsafe impl Sync for FrameTexture {}

    struct Gpu {
        device: ID3D11Device,
        context: ID3D11DeviceContext,
    }

    struct Live {
        session: GraphicsCaptureSession,
        pool: Direct3D11CaptureFramePool,
        token: i64,
    }

    struct SendPool(Direct3D11CaptureFramePool);

    // SAFETY: a free-threaded frame pool is agile by construction.
    unsafe impl Send for SendPool {}

    pub struct CaptureSession {
        window: isize,
        timing: FrameTiming,
        latest: Arc<LatestFrame<FrameTexture>>,
        staging: StagingCache<ID3D11Texture2D>,
        live: Option<Live>,
        gpu: Option<Gpu>,
    }

    fn device_error(e: windows::core::Error) -> CaptureError {
        CaptureError::Device(e.message())
    }

    fn session_error(e: windows::core::Error) -> CaptureError {
        CaptureError::Session(e.message())
    }

    fn staging_error(e: windows::core::Error) -> CaptureError {
        CaptureError::Staging(e.message())
    }

    fn create_device() -> Result<Gpu, CaptureError> {
        let levels = [
            D3D_FEATURE_LEVEL_11_1,
            D3D_FEATURE_LEVEL_11_0,
            D3D_FEATURE_LEVEL_10_1,
            D3D_FEATURE_LEVEL_10_0,
        ];

        let mut device = None;
        let mut context = None;
        unsafe {
            D3D11CreateDevice(
                None,
                D3D_DRIVER_TYPE_HARDWARE,
                HMODULE::default(),
                D3D11_CREATE_DEVICE_BGRA_SUPPORT,
                Some(&levels),
                D3D11_SDK_VERSION,
                Some(&mut device),
                None,
                Some(&mut context),
            )
        }
        .map_err(device_error)?;

        match (device, context) {
            (Some(device), Some(context)) => Ok(Gpu { device, context }),
            _ => Err(CaptureError::Device("D3D11CreateDevice returned no device".into())),
        }
    }

    fn winrt_device(device: &ID3D11Device) -> Result<IDirect3DDevice, CaptureError> {
        let dxgi: IDXGIDevice = device.cast().map_err(device_error)?;
        let inspectable = unsafe { CreateDirect3D11DeviceFromDXGIDevice(&dxgi) }.map_err(device_error)?;
        inspectable.cast().map_err(device_error)
    }

    fn capture_item(window: isize) -> Result<GraphicsCaptureItem, CaptureError> {
        let interop =
            windows::core::factory::<GraphicsCaptureItem, IGraphicsCaptureItemInterop>()
                .map_err(session_error)?;
        unsafe { interop.CreateForWindow(HWND(window as *mut _)) }.map_err(session_error)
    }

    fn create_staging(device: &ID3D11Device, width: u32, height: u32) -> Result<ID3D11Texture2D, CaptureError> {
        let desc = D3D11_TEXTURE2D_DESC {
            Width: width,
            Height: height,
            MipLevels: 1,
            ArraySize: 1,
            Format: DXGI_FORMAT_B8G8R8A8_UNORM,
            SampleDesc: DXGI_SAMPLE_DESC {
                Count: 1,
                Quality: 0,
            },
            Usage: D3D11_USAGE_STAGING,
            BindFlags: 0,
            CPUAccessFlags: D3D11_CPU_ACCESS_READ.0 as u32,
            MiscFlags: 0,
        };

        let mut texture = None;
        unsafe { device.CreateTexture2D(&desc, None, Some(&mut texture)) }.map_err(staging_error)?;
        texture.ok_or_else(|| CaptureError::Staging("CreateTexture2D returned no texture".into()))
    }

    fn next_frame(pool: &Direct3D11CaptureFramePool) -> windows::core::Result<FrameTexture> {
        let frame = pool.TryGetNextFrame()?;
        let access: IDirect3DDxgiInterfaceAccess = frame.Surface()?.cast()?;
        let texture: ID3D11Texture2D = unsafe { access.GetInterface() }?;

        let mut desc = D3D11_TEXTURE2D_DESC::default();
        unsafe { texture.GetDesc(&mut desc) };
        Ok(FrameTexture {
            texture,
            width: desc.Width,
            height: desc.Height,
        })
    }

    impl CaptureSession {
        pub fn is_supported() -> bool {
            GraphicsCaptureSession::IsSupported().unwrap_or(false)
        }

        /// Start capturing `window`. Frames start arriving on a compositor thread right away.
        pub fn start(window: isize, timing: FrameTiming) -> Result<Self, CaptureError> {
            if !Self::is_supported() {
                return Err(CaptureError::Unsupported);
            }
            if !window::is_window(window) {
                return Err(CaptureError::InvalidWindow(window));
            }

            let mut this = Self {
                window,
                timing,
                latest: Arc::new(LatestFrame::new()),
                staging: StagingCache::new(),
                live: None,
                gpu: Some(create_device()?),
            };
            // From here on, an early return drops `this`, which stops whatever was started.
            this.start_session()?;

            info!(window = format_args!("{window:#x}"), "Capture session started");
            Ok(this)
        }

        fn start_session(&mut self) -> Result<(), CaptureError> {
            let gpu = self.gpu.as_ref().ok_or(CaptureError::Closed)?;
            let device = winrt_device(&gpu.device)?;
            let item = capture_item(self.window)?;
            let size = item.Size().map_err(session_error)?;

            // One buffer: only the newest frame is ever consumed.
            let pool = Direct3D11CaptureFramePool::CreateFreeThreaded(
                &device,
                DirectXPixelFormat::B8G8R8A8UIntNormalized,
                1,
                size,
            )
            .map_err(session_error)?;
            let session = pool.CreateCaptureSession(&item).map_err(session_error)?;

            let latest = self.latest.clone();
            let source = SendPool(pool.clone());
            let handler = TypedEventHandler::<Direct3D11CaptureFramePool, IInspectable>::new(
                move |_, _| {
                    if let Ok(frame) = next_frame(&source.0) {
                        latest.publish(frame);
                    }
                    Ok(())
                },
            );
            let token = pool.FrameArrived(&handler).map_err(session_error)?;
            self.live = Some(Live {
                session,
                pool,
                token,
            });

            if let Some(live) = &self.live {
                if let Err(e) = live.session.SetIsCursorCaptureEnabled(false) {
                    debug!(error = %e.message(), "Cursor overlay suppression unavailable");
                }
                if let Err(e) = live.session.SetIsBorderRequired(false) {
                    debug!(error = %e.message(), "Capture border suppression unavailable");
                }
                live.session.StartCapture().map_err(session_error)?;
            }
            Ok(())
        }

        /// Copy of the newest frame, waiting briefly for a fresh one.
        ///
        /// Fails only if the window is gone or no frame has arrived since the session started.
        pub fn capture(&mut self) -> Result<CaptureFrame, CaptureError> {
            if self.live.is_none() {
                return Err(CaptureError::Closed);
            }
            if !window::is_window(self.window) {
                return Err(CaptureError::InvalidWindow(self.window));
            }

            if !self.latest.wait_fresh(self.timing) {
                debug!("No new frame within wait, reusing latest");
            }
            let (frame, generation) = self.latest.take_latest().ok_or(CaptureError::NoFrame {
                waited_ms: self.timing.wait.as_millis() as u64,
            })?;

            let gpu = self.gpu.as_ref().ok_or(CaptureError::Closed)?;
            let staging = self
                .staging
                .get_or_create(frame.width, frame.height, |w, h| create_staging(&gpu.device, w, h))?;

            unsafe { gpu.context.CopyResource(staging, &frame.texture) };

            let mut mapped = D3D11_MAPPED_SUBRESOURCE::default();
            unsafe { gpu.context.Map(staging, 0, D3D11_MAP_READ, 0, Some(&mut mapped)) }
                .map_err(staging_error)?;

            let row_pitch = mapped.RowPitch as usize;
            let len = row_pitch * frame.height as usize;
            // SAFETY: a mapped staging texture exposes RowPitch * height readable bytes until
            // Unmap below.
            let bytes = unsafe { std::slice::from_raw_parts(mapped.pData as *const u8, len) };
            let packed = pack_rows(bytes, row_pitch, frame.width, frame.height);
            unsafe { gpu.context.Unmap(staging, 0) };

            debug!(generation, width = frame.width, height = frame.height, "Frame captured");
            CaptureFrame::new(frame.width, frame.height, packed?)
        }

        /// Stop the session and release every resource. Idempotent.
        pub fn stop(&mut self) {
            if let Some(live) = self.live.take() {
                if let Err(e) = live.session.Close() {
                    warn!(error = %e.message(), "Closing capture session failed");
                }
                let _ = live.pool.RemoveFrameArrived(live.token);
                let _ = live.pool.Close();
                debug!("Capture session stopped");
            }

            self.staging.clear();
            self.latest.clear();

            if let Some(gpu) = self.gpu.take() {
                unsafe { gpu.context.ClearState() };
            }
        }
    }

    impl Drop for CaptureSession {
        fn drop(&mut self) {
            self.stop();
        }
    }
}

#[cfg(not(windows))]
mod imp {
    use super::super::{CaptureError, CaptureFrame, FrameTiming};

    pub struct CaptureSession {
        _private: (),
    }

    impl CaptureSession {
        pub fn is_supported() -> bool {
            false
        }

        pub fn start(_window: isize, _timing: FrameTiming) -> Result<Self, CaptureError> {
            Err(CaptureError::Unsupported)
        }

        pub fn capture(&mut self) -> Result<CaptureFrame, CaptureError> {
            Err(CaptureError::Unsupported)
        }

        pub fn stop(&mut self) {}
    }
}
