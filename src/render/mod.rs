//! Backend-neutral rendering: shader variant selection and the per-frame
//! mask/draw state machine. GPU work goes through [`RenderBackend`].

pub mod pipeline;
pub mod shader;

use bytemuck::{Pod, Zeroable};

use crate::model::{BlendMode, Drawable};
use crate::texture::TextureImage;

pub use pipeline::{FrameStats, ModelRenderer};
pub use shader::{ShaderProgramManager, ShaderKey, MaskState};

#[derive(Debug, thiserror::Error)]
pub enum RenderError {
    #[error("shader program '{0}' failed to build: {1}")]
    Program(String, String),
}

/// Blend factor vocabulary shared by every backend.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BlendFactor {
    Zero,
    One,
    Dst,
    OneMinusSrc,
    OneMinusSrcAlpha,
}

/// Source and destination factors for the color and alpha channels.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct BlendFactors {
    pub src_color: BlendFactor,
    pub dst_color: BlendFactor,
    pub src_alpha: BlendFactor,
    pub dst_alpha: BlendFactor,
}

impl BlendFactors {
    const fn new(src_color: BlendFactor, dst_color: BlendFactor, src_alpha: BlendFactor, dst_alpha: BlendFactor) -> Self {
        Self { src_color, dst_color, src_alpha, dst_alpha }
    }

    pub const NORMAL: BlendFactors = BlendFactors::new(
        BlendFactor::One,
        BlendFactor::OneMinusSrcAlpha,
        BlendFactor::One,
        BlendFactor::OneMinusSrcAlpha,
    );
    pub const ADDITIVE: BlendFactors =
        BlendFactors::new(BlendFactor::One, BlendFactor::One, BlendFactor::Zero, BlendFactor::One);
    pub const MULTIPLICATIVE: BlendFactors = BlendFactors::new(
        BlendFactor::Dst,
        BlendFactor::OneMinusSrcAlpha,
        BlendFactor::Zero,
        BlendFactor::One,
    );
    /// Mask generation multiplies the cleared target by `1 - coverage`.
    pub const MASK: BlendFactors = BlendFactors::new(
        BlendFactor::Zero,
        BlendFactor::OneMinusSrc,
        BlendFactor::Zero,
        BlendFactor::OneMinusSrcAlpha,
    );

    pub fn for_blend_mode(mode: BlendMode) -> Self {
        match mode {
            BlendMode::Normal => Self::NORMAL,
            BlendMode::Additive => Self::ADDITIVE,
            BlendMode::Multiplicative => Self::MULTIPLICATIVE,
        }
    }
}

/// Everything a backend needs to build one shader set.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ProgramDesc {
    pub key: ShaderKey,
    pub blend: BlendFactors,
}

/// Per-draw uniform block. Padded to one 256-byte dynamic uniform slot.
#[repr(C)]
#[derive(Debug, Copy, Clone, PartialEq, Pod, Zeroable)]
pub struct DrawUniforms {
    pub matrix: [[f32; 4]; 4],
    pub clip_matrix: [[f32; 4]; 4],
    /// Mask generation reuses this slot for the layout rectangle in clip space.
    pub base_color: [f32; 4],
    pub multiply_color: [f32; 4],
    pub screen_color: [f32; 4],
    pub channel_flag: [f32; 4],
    _padding: [f32; 16],
}

impl Default for DrawUniforms {
    fn default() -> Self {
        Self {
            matrix: glam::Mat4::IDENTITY.to_cols_array_2d(),
            clip_matrix: glam::Mat4::IDENTITY.to_cols_array_2d(),
            base_color: [1.0, 1.0, 1.0, 1.0],
            multiply_color: [1.0, 1.0, 1.0, 1.0],
            screen_color: [0.0, 0.0, 0.0, 1.0],
            channel_flag: [0.0, 0.0, 0.0, 0.0],
            _padding: [0.0; 16],
        }
    }
}

/// Resolved state for one draw call.
#[derive(Clone, Debug, PartialEq)]
pub struct DrawBinding {
    pub key: ShaderKey,
    pub culling: bool,
    /// Drawable texture slot, bound to unit 0.
    pub texture: usize,
    /// Mask render texture, bound to unit 1 when the draw is masked.
    pub mask_texture: Option<usize>,
    pub uniforms: DrawUniforms,
}

/// The texture/framebuffer operations the renderer needs from a GPU API.
pub trait RenderBackend {
    /// One compiled shader set.
    type Program: Clone;

    fn compile_program(&mut self, desc: &ProgramDesc) -> Result<Self::Program, RenderError>;

    /// False once a program that compiled has since been reported broken.
    /// Backends that learn about build errors late override this.
    fn is_program_usable(&self, _program: &Self::Program) -> bool {
        true
    }

    /// Start a frame on the default target, cleared to `clear_color`.
    fn begin_frame(&mut self, clear_color: [f32; 4]);

    /// Make sure `count` mask textures of `size` x `size` pixels exist.
    fn ensure_mask_targets(&mut self, count: usize, size: u32);

    /// Redirect draws into mask texture `buffer_index`, optionally clearing it to white.
    fn bind_mask_target(&mut self, buffer_index: usize, clear: bool);

    /// Redirect draws back to the default target and viewport.
    fn restore_default_target(&mut self);

    /// Upload a decoded drawable texture into `slot`.
    fn upload_texture(&mut self, slot: usize, image: &TextureImage);

    /// Drop every drawable texture, e.g. when the model is replaced.
    fn release_textures(&mut self);

    fn is_texture_bound(&self, slot: usize) -> bool;

    fn draw(&mut self, program: &Self::Program, drawable: &Drawable, binding: &DrawBinding);
}
