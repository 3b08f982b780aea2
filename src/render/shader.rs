use std::collections::HashMap;

use glam::Mat4;

use super::{BlendFactors, DrawBinding, DrawUniforms, ProgramDesc, RenderBackend};
use crate::clipping::MaskLayout;
use crate::model::{BlendMode, Model};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MaskState {
    None,
    Masked,
    MaskedInverted,
}

impl MaskState {
    pub const ALL: [MaskState; 3] = [MaskState::None, MaskState::Masked, MaskState::MaskedInverted];
}

/// Identifies one of the ten shader variants.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ShaderKey {
    SetupMask,
    Draw { blend: BlendMode, mask: MaskState },
}

impl ShaderKey {
    pub fn all() -> Vec<ShaderKey> {
        let mut keys = vec![ShaderKey::SetupMask];
        for blend in BlendMode::ALL {
            for mask in MaskState::ALL {
                keys.push(ShaderKey::Draw { blend, mask });
            }
        }
        keys
    }

    pub fn label(&self) -> String {
        match self {
            ShaderKey::SetupMask => "setup_mask".to_string(),
            ShaderKey::Draw { blend, mask } => format!("draw_{:?}_{:?}", blend, mask).to_lowercase(),
        }
    }
}

/// Lazily builds and caches every shader variant for one render session.
///
/// A variant that fails to build is cached as absent so callers skip the
/// draw instead of retrying the compile every frame.
pub struct ShaderProgramManager<B: RenderBackend> {
    table: HashMap<ShaderKey, ProgramDesc>,
    programs: HashMap<ShaderKey, Option<B::Program>>,
    warned_non_premultiplied: bool,
}

impl<B: RenderBackend> Default for ShaderProgramManager<B> {
    fn default() -> Self {
        Self::new()
    }
}

impl<B: RenderBackend> ShaderProgramManager<B> {
    pub fn new() -> Self {
        let table = ShaderKey::all()
            .into_iter()
            .map(|key| {
                let blend = match key {
                    ShaderKey::SetupMask => BlendFactors::MASK,
                    ShaderKey::Draw { blend, .. } => BlendFactors::for_blend_mode(blend),
                };
                (key, ProgramDesc { key, blend })
            })
            .collect();
        Self {
            table,
            programs: HashMap::new(),
            warned_non_premultiplied: false,
        }
    }

    pub fn desc(&self, key: ShaderKey) -> Option<&ProgramDesc> {
        self.table.get(&key)
    }

    /// Number of variants requested so far, including failed ones.
    pub fn cached_count(&self) -> usize {
        self.programs.len()
    }

    pub fn get_or_create(&mut self, backend: &mut B, key: ShaderKey) -> Option<B::Program> {
        if let Some(cached) = self.programs.get(&key).cloned() {
            if let Some(program) = &cached {
                if !backend.is_program_usable(program) {
                    log::error!("Shader variant {} failed after compiling; dropped", key.label());
                    self.programs.insert(key, None);
                    return None;
                }
            }
            return cached;
        }
        let desc = self.table.get(&key)?;
        let program = match backend.compile_program(desc) {
            Ok(program) => {
                log::debug!("Built shader variant {}", key.label());
                Some(program)
            }
            Err(e) => {
                log::error!("{}", e);
                None
            }
        };
        self.programs.insert(key, program.clone());
        program
    }

    /// Drop every cached variant. Used on teardown and device loss.
    pub fn release(&mut self) {
        self.programs.clear();
    }

    /// State for drawing masking drawable `drawable` into `layout`'s channel.
    pub fn bind_for_mask(&self, model: &Model, drawable: usize, layout: &MaskLayout) -> Option<DrawBinding> {
        let d = model.drawable(drawable)?;
        let rect = layout.bounds;
        let uniforms = DrawUniforms {
            matrix: layout.matrix_for_mask.to_cols_array_2d(),
            base_color: [
                rect.x * 2.0 - 1.0,
                rect.y * 2.0 - 1.0,
                rect.right() * 2.0 - 1.0,
                rect.bottom() * 2.0 - 1.0,
            ],
            channel_flag: layout.channel_color(),
            ..DrawUniforms::default()
        };
        Some(DrawBinding {
            key: ShaderKey::SetupMask,
            culling: d.culling,
            texture: d.texture_index,
            mask_texture: None,
            uniforms,
        })
    }

    /// State for the final draw of `drawable`, sampling `mask` when present.
    pub fn bind_for_draw(
        &mut self,
        model: &Model,
        drawable: usize,
        mask: Option<&MaskLayout>,
        mvp: Mat4,
    ) -> Option<DrawBinding> {
        let d = model.drawable(drawable)?;
        let base_color = model.drawable_color(drawable);
        self.check_premultiplied(&d.id, base_color);

        let mask_state = match mask {
            None => MaskState::None,
            Some(_) if d.inverted_mask => MaskState::MaskedInverted,
            Some(_) => MaskState::Masked,
        };
        let mut uniforms = DrawUniforms {
            matrix: mvp.to_cols_array_2d(),
            base_color,
            multiply_color: model.multiply_color(),
            screen_color: model.screen_color(),
            ..DrawUniforms::default()
        };
        if let Some(layout) = mask {
            uniforms.clip_matrix = layout.matrix_for_draw.to_cols_array_2d();
            uniforms.channel_flag = layout.channel_color();
        }

        Some(DrawBinding {
            key: ShaderKey::Draw {
                blend: d.blend_mode,
                mask: mask_state,
            },
            culling: d.culling,
            texture: d.texture_index,
            mask_texture: mask.map(|l| l.buffer_index),
            uniforms,
        })
    }

    fn check_premultiplied(&mut self, id: &str, color: [f32; 4]) {
        if self.warned_non_premultiplied {
            return;
        }
        if color[..3].iter().any(|c| *c > color[3] + 1e-4) {
            self.warned_non_premultiplied = true;
            log::warn!(
                "Drawable '{}' color {:?} is not premultiplied; blending will be wrong",
                id,
                color
            );
        }
    }
}
