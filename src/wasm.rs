use std::cell::RefCell;
use std::rc::Rc;

use wasm_bindgen::prelude::*;
use wasm_bindgen::JsCast;
use wasm_bindgen_futures::JsFuture;
use web_sys::{HtmlCanvasElement, Response};

use crate::config::AvatarConfig;
use crate::gpu::WgpuBackend;
use crate::loader::{self, AssetFetcher, FetchError};
use crate::motion::Priority;
use crate::session::Session;

/// Fetches assets over HTTP relative to the page.
pub struct WebFetcher;

fn fetch_failed(path: &str, err: JsValue) -> FetchError {
    FetchError::Failed {
        path: path.to_string(),
        message: format!("{:?}", err),
    }
}

impl AssetFetcher for WebFetcher {
    async fn fetch(&self, path: &str) -> Result<Vec<u8>, FetchError> {
        let window = web_sys::window().ok_or_else(|| fetch_failed(path, JsValue::from_str("no window")))?;
        let value = JsFuture::from(window.fetch_with_str(path))
            .await
            .map_err(|e| fetch_failed(path, e))?;
        let response: Response = value.dyn_into().map_err(|e| fetch_failed(path, e))?;
        if response.status() == 404 {
            return Err(FetchError::NotFound(path.to_string()));
        }
        if !response.ok() {
            return Err(FetchError::Failed {
                path: path.to_string(),
                message: format!("HTTP {}", response.status()),
            });
        }
        let buffer = JsFuture::from(response.array_buffer().map_err(|e| fetch_failed(path, e))?)
            .await
            .map_err(|e| fetch_failed(path, e))?;
        Ok(js_sys::Uint8Array::new(&buffer).to_vec())
    }
}

#[wasm_bindgen]
pub struct WasmAvatar {
    inner: Rc<RefCell<AvatarContext>>,
}

struct AvatarContext {
    session: Session<WgpuBackend>,
    surface: wgpu::Surface<'static>,
    config: wgpu::SurfaceConfiguration,
}

#[wasm_bindgen]
pub fn init_panic_hook() {
    console_error_panic_hook::set_once();
    let _ = console_log::init_with_level(log::Level::Info);
}

#[wasm_bindgen]
impl WasmAvatar {
    #[wasm_bindgen(constructor)]
    pub fn new() -> Result<WasmAvatar, JsValue> {
        Err(JsValue::from_str("Use the create_avatar async constructor"))
    }

    /// Load a model directory. Resolves to whether the model became ready;
    /// a newer call supersedes any load still in flight.
    pub fn switch_character(&self, dir: String, file: String) -> js_sys::Promise {
        let inner = Rc::clone(&self.inner);
        wasm_bindgen_futures::future_to_promise(async move {
            let (ticket, config) = {
                let mut ctx = inner.borrow_mut();
                (ctx.session.begin_switch(), ctx.session.config().clone())
            };
            log::info!("Switching character to {}", loader::asset_path(&dir, &file));
            let progress = Rc::clone(&inner);
            let result = loader::load_model(&WebFetcher, &dir, &file, &config, |stage| {
                progress.borrow_mut().session.report_stage(ticket, stage);
            })
            .await;
            let ready = inner.borrow_mut().session.finish_switch(ticket, result);
            Ok(JsValue::from_bool(ready))
        })
    }

    pub fn is_ready(&self) -> bool {
        self.inner.borrow().session.is_ready()
    }

    /// Name of the last load stage reached, or an empty string before any load.
    pub fn load_stage(&self) -> String {
        self.inner
            .borrow()
            .session
            .stage()
            .map(|s| format!("{:?}", s))
            .unwrap_or_default()
    }

    /// Returns whether the motion started. Priorities: 1 idle, 2 normal, 3 force.
    pub fn start_motion(&self, group: &str, index: usize, priority: i32) -> bool {
        let mut inner = self.inner.borrow_mut();
        inner
            .session
            .avatar_mut()
            .is_some_and(|a| a.start_motion(group, index, Priority::from_i32(priority)).is_valid())
    }

    pub fn set_expression(&self, name: &str) -> bool {
        let mut inner = self.inner.borrow_mut();
        inner.session.avatar_mut().is_some_and(|a| a.set_expression(name).is_valid())
    }

    pub fn set_random_expression(&self) -> bool {
        let mut inner = self.inner.borrow_mut();
        inner.session.avatar_mut().is_some_and(|a| a.set_random_expression().is_valid())
    }

    pub fn hit_test(&self, area: &str, x: f32, y: f32) -> bool {
        let inner = self.inner.borrow();
        inner.session.avatar().is_some_and(|a| a.hit_test(area, x, y))
    }

    pub fn set_lip_sync_weight(&self, weight: f32) {
        self.inner.borrow_mut().session.set_lip_sync_weight(weight);
    }

    /// Queue a WAV buffer for lip sync.
    pub fn push_audio(&self, wav: &[u8]) {
        let mut inner = self.inner.borrow_mut();
        match inner.session.avatar_mut() {
            Some(avatar) => avatar.push_audio(wav.to_vec()),
            None => log::warn!("Audio pushed before a model is ready; dropped"),
        }
    }

    pub fn clear_audio(&self) {
        if let Some(avatar) = self.inner.borrow_mut().session.avatar_mut() {
            avatar.clear_audio();
        }
    }

    /// RMS of the audio window consumed on the last frame.
    pub fn amplitude(&self) -> f32 {
        self.inner.borrow().session.avatar().map_or(0.0, |a| a.amplitude())
    }

    pub fn resize(&self, width: u32, height: u32) {
        if width == 0 || height == 0 {
            return;
        }

        let mut inner = self.inner.borrow_mut();
        let ctx = &mut *inner;

        ctx.config.width = width;
        ctx.config.height = height;
        ctx.session.resize(width, height);

        ctx.surface.configure(ctx.session.backend().device(), &ctx.config);
    }

    pub fn render(&self, dt: f32) {
        let mut inner = self.inner.borrow_mut();
        let ctx = &mut *inner;

        ctx.session.update(dt);
        if !ctx.session.draw() {
            return;
        }

        match ctx.surface.get_current_texture() {
            Ok(output) => {
                let view = output.texture.create_view(&wgpu::TextureViewDescriptor::default());
                ctx.session.backend_mut().submit(&view);
                output.present();
            }
            Err(wgpu::SurfaceError::Lost) => {
                ctx.surface.configure(ctx.session.backend().device(), &ctx.config);
            }
            Err(wgpu::SurfaceError::OutOfMemory) => {
                log::error!("Surface out of memory");
            }
            Err(e) => {
                log::warn!("Surface error: {:?}", e);
            }
        }
    }

    /// Drop the model and every GPU object it used.
    pub fn release(&self) {
        self.inner.borrow_mut().session.release();
    }
}

/// Create an avatar renderer bound to `canvas`. `config_json` may be empty for defaults.
#[wasm_bindgen]
pub async fn create_avatar(canvas: HtmlCanvasElement, config_json: String) -> Result<WasmAvatar, JsValue> {
    init_panic_hook();

    let avatar_config = if config_json.trim().is_empty() {
        AvatarConfig::default()
    } else {
        AvatarConfig::from_json(&config_json).map_err(|e| JsValue::from_str(&format!("Invalid config: {}", e)))?
    };

    let instance = wgpu::Instance::new(wgpu::InstanceDescriptor {
        backends: wgpu::Backends::all(),
        dx12_shader_compiler: Default::default(),
        flags: wgpu::InstanceFlags::default(),
        gles_minor_version: wgpu::Gles3MinorVersion::Automatic,
    });

    let target = wgpu::SurfaceTarget::Canvas(canvas.clone());
    let surface = instance.create_surface(target)
        .map_err(|e| JsValue::from_str(&format!("Failed to create surface: {}", e)))?;

    let adapter = instance.request_adapter(&wgpu::RequestAdapterOptions {
        power_preference: wgpu::PowerPreference::None,
        compatible_surface: Some(&surface),
        force_fallback_adapter: false,
    }).await.ok_or_else(|| JsValue::from_str("Failed to find an appropriate adapter"))?;

    let (device, queue) = adapter.request_device(
        &wgpu::DeviceDescriptor {
            label: None,
            required_features: wgpu::Features::empty(),
            required_limits: wgpu::Limits::downlevel_webgl2_defaults(),
            memory_hints: Default::default(),
        },
        None,
    ).await.map_err(|e| JsValue::from_str(&format!("Failed to create device: {}", e)))?;

    // Colors are premultiplied and already in display space.
    let surface_caps = surface.get_capabilities(&adapter);
    let surface_format = surface_caps.formats.iter()
        .copied()
        .find(|f: &wgpu::TextureFormat| !f.is_srgb())
        .or_else(|| surface_caps.formats.first().copied())
        .ok_or_else(|| JsValue::from_str("Surface reports no formats"))?;
    let alpha_mode = if surface_caps.alpha_modes.contains(&wgpu::CompositeAlphaMode::PreMultiplied) {
        wgpu::CompositeAlphaMode::PreMultiplied
    } else {
        surface_caps.alpha_modes.first().copied().unwrap_or(wgpu::CompositeAlphaMode::Auto)
    };

    let config = wgpu::SurfaceConfiguration {
        usage: wgpu::TextureUsages::RENDER_ATTACHMENT,
        format: surface_format,
        width: canvas.width().max(1),
        height: canvas.height().max(1),
        present_mode: surface_caps.present_modes.first().copied().unwrap_or(wgpu::PresentMode::Fifo),
        alpha_mode,
        view_formats: vec![],
        desired_maximum_frame_latency: 2,
    };
    surface.configure(&device, &config);

    let backend = WgpuBackend::new(device, queue, config.format);
    let session = Session::new(backend, avatar_config, config.width, config.height);

    Ok(WasmAvatar {
        inner: Rc::new(RefCell::new(AvatarContext {
            session,
            surface,
            config,
        })),
    })
}
