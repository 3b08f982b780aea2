use glam::Mat4;

use super::{RenderBackend, ShaderKey, ShaderProgramManager};
use crate::clipping::{ClippingManager, MaskLayout};
use crate::config::AvatarConfig;
use crate::model::Model;

/// Counters for the last rendered frame.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct FrameStats {
    /// Clears issued per mask texture.
    pub mask_clears: Vec<usize>,
    pub mask_draws: usize,
    pub draws: usize,
    /// Drawables skipped for a missing texture or shader program.
    pub skipped: usize,
}

/// Draws one model: masks first, then every visible drawable in render order.
pub struct ModelRenderer {
    clipping: Option<ClippingManager>,
    high_precision: bool,
    mvp: Mat4,
    sorted: Vec<usize>,
    cleared: Vec<bool>,
    stats: FrameStats,
}

impl ModelRenderer {
    pub fn new(model: &Model, config: &AvatarConfig) -> Self {
        let clipping = if model.drawables().iter().any(|d| !d.masks.is_empty()) {
            let mut manager = ClippingManager::new(
                config.render_texture_count,
                config.masks_per_texture,
                config.mask_buffer_size,
            );
            manager.initialize(model);
            Some(manager)
        } else {
            None
        };

        let mut sorted: Vec<usize> = (0..model.drawable_count()).collect();
        sorted.sort_by_key(|&i| model.drawables()[i].render_order);

        let texture_count = clipping.as_ref().map_or(0, ClippingManager::render_texture_count);
        Self {
            clipping,
            high_precision: config.high_precision(),
            mvp: Mat4::IDENTITY,
            sorted,
            cleared: vec![false; texture_count],
            stats: FrameStats::default(),
        }
    }

    pub fn set_mvp_matrix(&mut self, mvp: Mat4) {
        self.mvp = mvp;
    }

    pub fn mvp_matrix(&self) -> Mat4 {
        self.mvp
    }

    pub fn set_high_precision(&mut self, enabled: bool) {
        self.high_precision = enabled;
    }

    pub fn is_high_precision(&self) -> bool {
        self.high_precision
    }

    pub fn clipping(&self) -> Option<&ClippingManager> {
        self.clipping.as_ref()
    }

    pub fn last_frame(&self) -> &FrameStats {
        &self.stats
    }

    /// Render one frame of `model`. The backend frame must already be started.
    pub fn draw<B: RenderBackend>(&mut self, backend: &mut B, shaders: &mut ShaderProgramManager<B>, model: &Model) {
        // pre-draw
        self.cleared.fill(false);
        self.stats = FrameStats {
            mask_clears: vec![0; self.cleared.len()],
            ..FrameStats::default()
        };

        if let Some(clipping) = self.clipping.as_mut() {
            backend.ensure_mask_targets(clipping.render_texture_count(), clipping.mask_buffer_size());
            if self.high_precision {
                clipping.setup_high_precision(model);
            } else if clipping.setup_clipping_context(model) > 0 {
                self.generate_masks(backend, shaders, model);
            }
        }

        self.draw_visible(backend, shaders, model);
    }

    /// Render every in-use context's masks into its texture, clearing each texture once.
    fn generate_masks<B: RenderBackend>(&mut self, backend: &mut B, shaders: &mut ShaderProgramManager<B>, model: &Model) {
        let Some(clipping) = self.clipping.as_ref() else {
            return;
        };
        for buffer in 0..clipping.render_texture_count() {
            let clear = !self.cleared[buffer];
            backend.bind_mask_target(buffer, clear);
            if clear {
                self.cleared[buffer] = true;
                self.stats.mask_clears[buffer] += 1;
            }
            for context in clipping.contexts() {
                if !context.is_using() || context.layout().buffer_index != buffer {
                    continue;
                }
                for &mask in context.mask_drawables() {
                    if Self::draw_mask(backend, shaders, model, mask, context.layout()) {
                        self.stats.mask_draws += 1;
                    }
                }
            }
        }
        backend.restore_default_target();
    }

    fn draw_mask<B: RenderBackend>(
        backend: &mut B,
        shaders: &mut ShaderProgramManager<B>,
        model: &Model,
        mask: usize,
        layout: &MaskLayout,
    ) -> bool {
        let (Some(drawable), Some(binding)) = (model.drawable(mask), shaders.bind_for_mask(model, mask, layout)) else {
            return false;
        };
        if !backend.is_texture_bound(binding.texture) {
            return false;
        }
        match shaders.get_or_create(backend, ShaderKey::SetupMask) {
            Some(program) => {
                backend.draw(&program, drawable, &binding);
                true
            }
            None => false,
        }
    }

    /// Per-drawable mask pass used in high-precision mode.
    fn generate_drawable_mask<B: RenderBackend>(
        &mut self,
        backend: &mut B,
        shaders: &mut ShaderProgramManager<B>,
        model: &Model,
        drawable: usize,
    ) -> Option<MaskLayout> {
        let clipping = self.clipping.as_ref()?;
        let context = clipping.context_for_drawable(drawable)?;
        let layout = clipping.layout_for_drawable(model, drawable)?;

        backend.bind_mask_target(layout.buffer_index, true);
        if let Some(count) = self.stats.mask_clears.get_mut(layout.buffer_index) {
            *count += 1;
        }
        for &mask in context.mask_drawables() {
            if Self::draw_mask(backend, shaders, model, mask, &layout) {
                self.stats.mask_draws += 1;
            }
        }
        backend.restore_default_target();
        Some(layout)
    }

    fn draw_visible<B: RenderBackend>(&mut self, backend: &mut B, shaders: &mut ShaderProgramManager<B>, model: &Model) {
        for index in 0..self.sorted.len() {
            let i = self.sorted[index];
            let Some(drawable) = model.drawable(i) else {
                continue;
            };
            if !drawable.is_visible() {
                continue;
            }
            if !backend.is_texture_bound(drawable.texture_index) {
                self.stats.skipped += 1;
                continue;
            }

            let layout = if self.high_precision {
                self.generate_drawable_mask(backend, shaders, model, i)
            } else {
                self.clipping
                    .as_ref()
                    .and_then(|c| c.context_for_drawable(i))
                    .filter(|c| c.is_using())
                    .map(|c| *c.layout())
            };

            let Some(binding) = shaders.bind_for_draw(model, i, layout.as_ref(), self.mvp) else {
                continue;
            };
            match shaders.get_or_create(backend, binding.key) {
                Some(program) => {
                    backend.draw(&program, drawable, &binding);
                    self.stats.draws += 1;
                }
                None => self.stats.skipped += 1,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MaskPrecision;
    use crate::model::tests::{model_from, quad_json};
    use crate::model::BlendMode;
    use crate::render::testing::{Event, RecordingBackend};
    use crate::render::MaskState;

    fn render(model: &Model, config: &AvatarConfig, backend: &mut RecordingBackend) -> FrameStats {
        let mut shaders = ShaderProgramManager::new();
        let mut renderer = ModelRenderer::new(model, config);
        backend.begin_frame(config.clear_color);
        renderer.draw(backend, &mut shaders, model);
        renderer.last_frame().clone()
    }

    /// `groups` masks plus one clipped quad per mask.
    fn masked_model(groups: usize) -> Model {
        let mut drawables = Vec::new();
        for g in 0..groups {
            drawables.push(quad_json(&format!("Mask{}", g), g as f32, 0.0, 0.5, &[], 0));
        }
        for g in 0..groups {
            drawables.push(quad_json(&format!("Clip{}", g), g as f32, 0.0, 0.4, &[g], 1));
        }
        model_from(serde_json::json!({ "Drawables": drawables }))
    }

    #[test]
    fn test_each_mask_texture_cleared_once_per_frame() {
        let model = masked_model(12);
        for textures in 1..=3 {
            let config = AvatarConfig {
                render_texture_count: textures,
                ..AvatarConfig::default()
            };
            let mut backend = RecordingBackend::default();
            let mut shaders = ShaderProgramManager::new();
            let mut renderer = ModelRenderer::new(&model, &config);
            for frame in 0..4 {
                backend.events.clear();
                backend.begin_frame(config.clear_color);
                renderer.draw(&mut backend, &mut shaders, &model);
                for t in 0..textures {
                    assert_eq!(backend.clears(t), 1, "texture {} frame {}", t, frame);
                    assert_eq!(renderer.last_frame().mask_clears[t], 1);
                }
                assert_eq!(renderer.last_frame().mask_draws, 12);
                assert_eq!(renderer.last_frame().draws, 24);
            }
            assert_eq!(backend.mask_targets, textures);
        }
    }

    #[test]
    fn test_masks_render_before_visible_draws() {
        let model = masked_model(2);
        let mut backend = RecordingBackend::default();
        render(&model, &AvatarConfig::default(), &mut backend);

        let restore = backend.events.iter().position(|e| *e == Event::Restore).unwrap();
        let first_mask_draw = backend
            .events
            .iter()
            .position(|e| matches!(e, Event::Draw { key: ShaderKey::SetupMask, .. }))
            .unwrap();
        let first_visible = backend
            .events
            .iter()
            .position(|e| matches!(e, Event::Draw { key: ShaderKey::Draw { .. }, .. }))
            .unwrap();
        assert!(first_mask_draw < restore && restore < first_visible);

        let draws = backend.draws();
        let visible: Vec<_> = draws.iter().filter(|(k, _)| *k != ShaderKey::SetupMask).collect();
        // render order 0 before 1
        assert_eq!(visible[0].1, "Mask0");
        assert_eq!(
            visible[2].0,
            ShaderKey::Draw { blend: BlendMode::Normal, mask: MaskState::Masked }
        );
    }

    #[test]
    fn test_unmasked_model_skips_mask_generation() {
        let model = model_from(serde_json::json!({
            "Drawables": [quad_json("A", 0.0, 0.0, 1.0, &[], 0)]
        }));
        let mut backend = RecordingBackend::default();
        let stats = render(&model, &AvatarConfig::default(), &mut backend);
        assert!(stats.mask_clears.is_empty());
        assert!(!backend.events.iter().any(|e| matches!(e, Event::BindMask { .. })));
        assert_eq!(stats.draws, 1);
    }

    #[test]
    fn test_invisible_and_unbound_drawables_are_skipped() {
        let mut json = serde_json::json!({
            "Drawables": [
                quad_json("Hidden", 0.0, 0.0, 1.0, &[], 0),
                quad_json("NoTexture", 0.0, 0.0, 1.0, &[], 1),
                quad_json("Shown", 0.0, 0.0, 1.0, &[], 2)
            ]
        });
        json["Drawables"][0]["Visible"] = serde_json::json!(false);
        json["Drawables"][1]["Texture"] = serde_json::json!(1);
        let model = model_from(json);
        let mut backend = RecordingBackend {
            unbound_textures: vec![1],
            ..RecordingBackend::default()
        };
        let stats = render(&model, &AvatarConfig::default(), &mut backend);
        let drawn: Vec<_> = backend.draws().into_iter().map(|(_, id)| id).collect();
        assert_eq!(drawn, vec!["Shown".to_string()]);
        assert_eq!(stats.skipped, 1);
    }

    #[test]
    fn test_failed_program_skips_draw_without_panicking() {
        let model = masked_model(1);
        let mut backend = RecordingBackend {
            failing: vec![ShaderKey::Draw { blend: BlendMode::Normal, mask: MaskState::Masked }],
            ..RecordingBackend::default()
        };
        let stats = render(&model, &AvatarConfig::default(), &mut backend);
        assert_eq!(stats.draws, 1);
        assert_eq!(stats.skipped, 1);
    }

    #[test]
    fn test_program_broken_between_frames_skips_draw() {
        let model = masked_model(1);
        let config = AvatarConfig::default();
        let masked = ShaderKey::Draw { blend: BlendMode::Normal, mask: MaskState::Masked };
        let mut backend = RecordingBackend::default();
        let mut shaders = ShaderProgramManager::new();
        let mut renderer = ModelRenderer::new(&model, &config);

        backend.begin_frame(config.clear_color);
        renderer.draw(&mut backend, &mut shaders, &model);
        assert_eq!(renderer.last_frame().draws, 2);

        backend.invalidated.push(masked);
        backend.events.clear();
        backend.begin_frame(config.clear_color);
        renderer.draw(&mut backend, &mut shaders, &model);
        assert_eq!(renderer.last_frame().draws, 1);
        assert_eq!(renderer.last_frame().skipped, 1);
        assert!(!backend.draws().iter().any(|(k, _)| *k == masked));
    }

    #[test]
    fn test_high_precision_masks_each_clipped_drawable() {
        let model = masked_model(3);
        let config = AvatarConfig {
            mask_precision: MaskPrecision::HighPrecision,
            ..AvatarConfig::default()
        };
        let mut backend = RecordingBackend::default();
        let stats = render(&model, &config, &mut backend);
        assert_eq!(backend.clears(0), 3);
        assert_eq!(stats.mask_clears, vec![3]);
        assert_eq!(stats.mask_draws, 3);
        let restores = backend.events.iter().filter(|e| **e == Event::Restore).count();
        assert_eq!(restores, 3);
        // every mask pass is followed directly by the draw it serves
        for (i, e) in backend.events.iter().enumerate() {
            if *e == Event::Restore {
                assert!(matches!(
                    backend.events[i + 1],
                    Event::Draw { key: ShaderKey::Draw { mask: MaskState::Masked, .. }, .. }
                ));
            }
        }
    }
}
