//! wgpu implementation of [`RenderBackend`].
//!
//! Draw calls are recorded into passes while the frame is built, then encoded
//! into one command buffer by [`WgpuBackend::submit`]. Uniform, vertex and
//! index data for the whole frame are written before any pass is encoded,
//! since `queue.write_buffer()` is immediate and not part of the command stream.

use std::collections::HashMap;
use std::iter;
use std::ops::Range;
use std::sync::Arc;

use crate::gpu::mesh::{FrameGeometry, Vertex};
use crate::gpu::pipeline::{self, BuildStatus, ShaderSet};
use crate::gpu::texture::{GpuTexture, TEXTURE_FORMAT};
use crate::model::Drawable;
use crate::render::{DrawBinding, DrawUniforms, ProgramDesc, RenderBackend, RenderError, ShaderKey};
use crate::texture::TextureImage;

/// Uniform buffer alignment (WebGPU minUniformBufferOffsetAlignment is typically 256 bytes)
const UNIFORM_ALIGNMENT: usize = 256;

/// Draw slots allocated up front; the buffers grow past this on demand.
const INITIAL_DRAW_SLOTS: usize = 256;
const INITIAL_VERTEX_COUNT: usize = 16 * 1024;

const MASK_CLEAR: wgpu::Color = wgpu::Color::WHITE;

/// Drawable texture slot plus optional mask texture.
type TextureKey = (usize, Option<usize>);

#[derive(Clone, Copy, Debug, PartialEq)]
enum PassTarget {
    Surface,
    Mask(usize),
}

struct DrawCommand {
    program: Arc<ShaderSet>,
    culling: bool,
    uniform_slot: usize,
    textures: TextureKey,
    indices: Range<u32>,
    base_vertex: i32,
}

struct PassRecord {
    target: PassTarget,
    clear: Option<wgpu::Color>,
    draws: Vec<DrawCommand>,
}

pub struct WgpuBackend {
    device: wgpu::Device,
    queue: wgpu::Queue,
    surface_format: wgpu::TextureFormat,
    shader: wgpu::ShaderModule,

    uniform_layout: wgpu::BindGroupLayout,
    texture_layout: wgpu::BindGroupLayout,
    pipeline_layout: wgpu::PipelineLayout,

    uniform_buffer: wgpu::Buffer,
    uniform_bind_group: wgpu::BindGroup,
    vertex_buffer: wgpu::Buffer,
    index_buffer: wgpu::Buffer,
    sampler: wgpu::Sampler,

    textures: Vec<Option<GpuTexture>>,
    mask_targets: Vec<GpuTexture>,
    blank_mask: GpuTexture,
    bind_groups: HashMap<TextureKey, wgpu::BindGroup>,

    passes: Vec<PassRecord>,
    uniforms: Vec<DrawUniforms>,
    geometry: FrameGeometry,
}

fn to_color(c: [f32; 4]) -> wgpu::Color {
    wgpu::Color {
        r: c[0] as f64,
        g: c[1] as f64,
        b: c[2] as f64,
        a: c[3] as f64,
    }
}

fn texture_entry(binding: u32) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::FRAGMENT,
        ty: wgpu::BindingType::Texture {
            sample_type: wgpu::TextureSampleType::Float { filterable: true },
            view_dimension: wgpu::TextureViewDimension::D2,
            multisampled: false,
        },
        count: None,
    }
}

fn sampler_entry(binding: u32) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::FRAGMENT,
        ty: wgpu::BindingType::Sampler(wgpu::SamplerBindingType::Filtering),
        count: None,
    }
}

fn create_uniform_bind_group(
    device: &wgpu::Device,
    layout: &wgpu::BindGroupLayout,
    buffer: &wgpu::Buffer,
) -> wgpu::BindGroup {
    device.create_bind_group(&wgpu::BindGroupDescriptor {
        label: Some("draw_uniform_bind_group"),
        layout,
        entries: &[wgpu::BindGroupEntry {
            binding: 0,
            resource: wgpu::BindingResource::Buffer(wgpu::BufferBinding {
                buffer,
                offset: 0,
                size: wgpu::BufferSize::new(std::mem::size_of::<DrawUniforms>() as u64),
            }),
        }],
    })
}

fn create_buffer(device: &wgpu::Device, label: &str, size: u64, usage: wgpu::BufferUsages) -> wgpu::Buffer {
    device.create_buffer(&wgpu::BufferDescriptor {
        label: Some(label),
        size,
        usage: usage | wgpu::BufferUsages::COPY_DST,
        mapped_at_creation: false,
    })
}

impl WgpuBackend {
    pub fn new(device: wgpu::Device, queue: wgpu::Queue, surface_format: wgpu::TextureFormat) -> Self {
        let shader = device.create_shader_module(wgpu::include_wgsl!("shader.wgsl"));

        let uniform_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            entries: &[wgpu::BindGroupLayoutEntry {
                binding: 0,
                visibility: wgpu::ShaderStages::VERTEX_FRAGMENT,
                ty: wgpu::BindingType::Buffer {
                    ty: wgpu::BufferBindingType::Uniform,
                    has_dynamic_offset: true,
                    min_binding_size: wgpu::BufferSize::new(std::mem::size_of::<DrawUniforms>() as u64),
                },
                count: None,
            }],
            label: Some("draw_uniform_layout"),
        });
        let texture_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            entries: &[texture_entry(0), sampler_entry(1), texture_entry(2), sampler_entry(3)],
            label: Some("draw_texture_layout"),
        });
        let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("Drawable Pipeline Layout"),
            bind_group_layouts: &[&uniform_layout, &texture_layout],
            push_constant_ranges: &[],
        });

        let uniform_buffer = create_buffer(
            &device,
            "Draw Uniform Buffer (Dynamic)",
            (UNIFORM_ALIGNMENT * INITIAL_DRAW_SLOTS) as u64,
            wgpu::BufferUsages::UNIFORM,
        );
        let uniform_bind_group = create_uniform_bind_group(&device, &uniform_layout, &uniform_buffer);
        let vertex_buffer = create_buffer(
            &device,
            "Drawable Vertex Buffer",
            (std::mem::size_of::<Vertex>() * INITIAL_VERTEX_COUNT) as u64,
            wgpu::BufferUsages::VERTEX,
        );
        let index_buffer = create_buffer(
            &device,
            "Drawable Index Buffer",
            (std::mem::size_of::<u16>() * INITIAL_VERTEX_COUNT * 3) as u64,
            wgpu::BufferUsages::INDEX,
        );

        let sampler = device.create_sampler(&wgpu::SamplerDescriptor {
            label: Some("Drawable Sampler"),
            address_mode_u: wgpu::AddressMode::ClampToEdge,
            address_mode_v: wgpu::AddressMode::ClampToEdge,
            mag_filter: wgpu::FilterMode::Linear,
            min_filter: wgpu::FilterMode::Linear,
            ..Default::default()
        });

        let blank_mask = GpuTexture::from_image(&device, &queue, &TextureImage::solid(1, 1, [255; 4]), "Blank Mask");

        Self {
            device,
            queue,
            surface_format,
            shader,
            uniform_layout,
            texture_layout,
            pipeline_layout,
            uniform_buffer,
            uniform_bind_group,
            vertex_buffer,
            index_buffer,
            sampler,
            textures: Vec::new(),
            mask_targets: Vec::new(),
            blank_mask,
            bind_groups: HashMap::new(),
            passes: Vec::new(),
            uniforms: Vec::new(),
            geometry: FrameGeometry::default(),
        }
    }

    pub fn device(&self) -> &wgpu::Device {
        &self.device
    }

    pub fn queue(&self) -> &wgpu::Queue {
        &self.queue
    }

    pub fn surface_format(&self) -> wgpu::TextureFormat {
        self.surface_format
    }

    pub fn texture_count(&self) -> usize {
        self.textures.iter().filter(|t| t.is_some()).count()
    }

    fn bind_group(&mut self, key: TextureKey) -> bool {
        if self.bind_groups.contains_key(&key) {
            return true;
        }
        let Some(Some(texture)) = self.textures.get(key.0) else {
            return false;
        };
        let mask = match key.1 {
            Some(i) => match self.mask_targets.get(i) {
                Some(target) => target,
                None => return false,
            },
            None => &self.blank_mask,
        };
        let group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("draw_texture_bind_group"),
            layout: &self.texture_layout,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: wgpu::BindingResource::TextureView(&texture.view),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: wgpu::BindingResource::Sampler(&self.sampler),
                },
                wgpu::BindGroupEntry {
                    binding: 2,
                    resource: wgpu::BindingResource::TextureView(&mask.view),
                },
                wgpu::BindGroupEntry {
                    binding: 3,
                    resource: wgpu::BindingResource::Sampler(&self.sampler),
                },
            ],
        });
        self.bind_groups.insert(key, group);
        true
    }

    /// Grow the per-frame buffers to fit everything recorded this frame.
    fn reserve_buffers(&mut self) {
        let uniform_bytes = (self.uniforms.len().max(1) * UNIFORM_ALIGNMENT) as u64;
        if self.uniform_buffer.size() < uniform_bytes {
            self.uniform_buffer = create_buffer(
                &self.device,
                "Draw Uniform Buffer (Dynamic)",
                uniform_bytes.next_power_of_two(),
                wgpu::BufferUsages::UNIFORM,
            );
            self.uniform_bind_group = create_uniform_bind_group(&self.device, &self.uniform_layout, &self.uniform_buffer);
        }
        let vertex_bytes = std::mem::size_of_val(self.geometry.vertices.as_slice()) as u64;
        if self.vertex_buffer.size() < vertex_bytes {
            self.vertex_buffer = create_buffer(
                &self.device,
                "Drawable Vertex Buffer",
                vertex_bytes.next_power_of_two(),
                wgpu::BufferUsages::VERTEX,
            );
        }
        let index_bytes = self.geometry.index_bytes();
        if self.index_buffer.size() < index_bytes.len() as u64 {
            self.index_buffer = create_buffer(
                &self.device,
                "Drawable Index Buffer",
                (index_bytes.len() as u64).next_power_of_two(),
                wgpu::BufferUsages::INDEX,
            );
        }

        if !self.uniforms.is_empty() {
            self.queue
                .write_buffer(&self.uniform_buffer, 0, bytemuck::cast_slice(&self.uniforms));
        }
        if !self.geometry.vertices.is_empty() {
            self.queue
                .write_buffer(&self.vertex_buffer, 0, bytemuck::cast_slice(&self.geometry.vertices));
        }
        if !index_bytes.is_empty() {
            self.queue.write_buffer(&self.index_buffer, 0, &index_bytes);
        }
    }

    /// Encode and submit every pass recorded since [`RenderBackend::begin_frame`].
    pub fn submit(&mut self, view: &wgpu::TextureView) {
        if self.passes.is_empty() {
            return;
        }
        self.reserve_buffers();

        let mut encoder = self.device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("Render Encoder"),
        });

        for pass in &self.passes {
            let target = match pass.target {
                PassTarget::Surface => view,
                PassTarget::Mask(i) => match self.mask_targets.get(i) {
                    Some(t) => &t.view,
                    None => continue,
                },
            };
            let load = match pass.clear {
                Some(color) => wgpu::LoadOp::Clear(color),
                None => wgpu::LoadOp::Load,
            };
            let mut render_pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                label: Some(match pass.target {
                    PassTarget::Surface => "Model Render Pass",
                    PassTarget::Mask(_) => "Mask Render Pass",
                }),
                color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                    view: target,
                    resolve_target: None,
                    ops: wgpu::Operations {
                        load,
                        store: wgpu::StoreOp::Store,
                    },
                })],
                depth_stencil_attachment: None,
                timestamp_writes: None,
                occlusion_query_set: None,
            });
            if pass.draws.is_empty() {
                continue;
            }

            render_pass.set_vertex_buffer(0, self.vertex_buffer.slice(..));
            render_pass.set_index_buffer(self.index_buffer.slice(..), wgpu::IndexFormat::Uint16);
            for cmd in &pass.draws {
                let Some(textures) = self.bind_groups.get(&cmd.textures) else {
                    continue;
                };
                let dynamic_offset = (cmd.uniform_slot * UNIFORM_ALIGNMENT) as u32;
                render_pass.set_pipeline(cmd.program.pipeline(cmd.culling));
                render_pass.set_bind_group(0, &self.uniform_bind_group, &[dynamic_offset]);
                render_pass.set_bind_group(1, textures, &[]);
                render_pass.draw_indexed(cmd.indices.clone(), cmd.base_vertex, 0..1);
            }
        }

        self.queue.submit(iter::once(encoder.finish()));
        self.passes.clear();
    }
}

impl RenderBackend for WgpuBackend {
    type Program = Arc<ShaderSet>;

    fn compile_program(&mut self, desc: &ProgramDesc) -> Result<Arc<ShaderSet>, RenderError> {
        let format = match desc.key {
            ShaderKey::SetupMask => TEXTURE_FORMAT,
            ShaderKey::Draw { .. } => self.surface_format,
        };

        self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let set = ShaderSet {
            culled: pipeline::create_render_pipeline(&self.device, &self.pipeline_layout, &self.shader, desc, format, true),
            unculled: pipeline::create_render_pipeline(&self.device, &self.pipeline_layout, &self.shader, desc, format, false),
            status: BuildStatus::default(),
        };
        let error = self.device.pop_error_scope();

        #[cfg(not(target_arch = "wasm32"))]
        if let Some(e) = pollster::block_on(error) {
            return Err(RenderError::Program(desc.key.label(), e.to_string()));
        }
        // The browser resolves error scopes asynchronously. A late error flags
        // the set so the program cache drops it on the next lookup.
        #[cfg(target_arch = "wasm32")]
        {
            let label = desc.key.label();
            let status = set.status.clone();
            wasm_bindgen_futures::spawn_local(async move {
                if let Some(e) = error.await {
                    log::error!("shader program '{}' failed to build: {}", label, e);
                    status.mark_failed();
                }
            });
        }

        Ok(Arc::new(set))
    }

    fn is_program_usable(&self, program: &Arc<ShaderSet>) -> bool {
        !program.status.is_failed()
    }

    fn begin_frame(&mut self, clear_color: [f32; 4]) {
        self.passes.clear();
        self.uniforms.clear();
        self.geometry.clear();
        self.passes.push(PassRecord {
            target: PassTarget::Surface,
            clear: Some(to_color(clear_color)),
            draws: Vec::new(),
        });
    }

    fn ensure_mask_targets(&mut self, count: usize, size: u32) {
        let current = self.mask_targets.first().map(GpuTexture::size);
        if self.mask_targets.len() == count && current == Some(size.max(1)) {
            return;
        }
        log::debug!("Creating {} mask targets of {}x{}", count, size, size);
        self.mask_targets = (0..count)
            .map(|i| GpuTexture::render_target(&self.device, size, &format!("Mask Target {}", i)))
            .collect();
        self.bind_groups.retain(|(_, mask), _| mask.is_none());
    }

    fn bind_mask_target(&mut self, buffer_index: usize, clear: bool) {
        self.passes.push(PassRecord {
            target: PassTarget::Mask(buffer_index),
            clear: clear.then_some(MASK_CLEAR),
            draws: Vec::new(),
        });
    }

    fn restore_default_target(&mut self) {
        self.passes.push(PassRecord {
            target: PassTarget::Surface,
            clear: None,
            draws: Vec::new(),
        });
    }

    fn upload_texture(&mut self, slot: usize, image: &TextureImage) {
        if self.textures.len() <= slot {
            self.textures.resize_with(slot + 1, || None);
        }
        let label = format!("Drawable Texture {}", slot);
        self.textures[slot] = Some(GpuTexture::from_image(&self.device, &self.queue, image, &label));
        self.bind_groups.retain(|(t, _), _| *t != slot);
    }

    fn release_textures(&mut self) {
        self.textures.clear();
        self.bind_groups.clear();
    }

    fn is_texture_bound(&self, slot: usize) -> bool {
        matches!(self.textures.get(slot), Some(Some(_)))
    }

    fn draw(&mut self, program: &Arc<ShaderSet>, drawable: &Drawable, binding: &DrawBinding) {
        if program.status.is_failed() {
            log::warn!("Drawable '{}' uses a shader that failed to build; skipped", drawable.id);
            return;
        }
        let textures = (binding.texture, binding.mask_texture);
        if !self.bind_group(textures) {
            log::warn!("Drawable '{}' references a missing texture; skipped", drawable.id);
            return;
        }
        if self.passes.is_empty() {
            log::warn!("Draw issued outside a frame; skipped");
            return;
        }

        let uniform_slot = self.uniforms.len();
        self.uniforms.push(binding.uniforms);
        let (indices, base_vertex) = self.geometry.push(drawable);
        if let Some(pass) = self.passes.last_mut() {
            pass.draws.push(DrawCommand {
                program: Arc::clone(program),
                culling: binding.culling,
                uniform_slot,
                textures,
                indices,
                base_vertex,
            });
        }
    }
}
