//! One loaded character: its model, animation managers, effects and renderer.

use std::collections::BTreeMap;
use std::rc::Rc;

use glam::Mat4;

use crate::config::AvatarConfig;
use crate::effects::{Breath, EyeBlink, Physics, Pose};
use crate::lipsync::LipSyncDriver;
use crate::loader::{self, LoadedModel, UserData, IDLE_GROUP};
use crate::math::ModelMatrix;
use crate::model::Model;
use crate::motion::{Expression, ExpressionManager, Motion, MotionHandle, MotionManager, Priority};
use crate::render::{ModelRenderer, RenderBackend, ShaderProgramManager};
use crate::setting::ModelSetting;
use crate::texture::TextureImage;

pub struct Avatar {
    setting: ModelSetting,
    model: Model,
    model_matrix: ModelMatrix,
    motions: BTreeMap<String, Rc<Motion>>,
    expressions: Vec<(String, Rc<Expression>)>,
    motion_manager: MotionManager,
    expression_manager: ExpressionManager,
    eye_blink: Option<EyeBlink>,
    breath: Option<Breath>,
    physics: Option<Physics>,
    pose: Option<Pose>,
    user_data: Option<UserData>,
    lip_sync: LipSyncDriver,
    renderer: ModelRenderer,
    pending_textures: Vec<Option<TextureImage>>,
}

impl Avatar {
    pub fn new(loaded: LoadedModel, config: &AvatarConfig) -> Self {
        let renderer = ModelRenderer::new(&loaded.model, config);
        let lip_sync = LipSyncDriver::new(loaded.lip_sync_ids, config.lip_sync_weight);
        Self {
            setting: loaded.setting,
            model: loaded.model,
            model_matrix: loaded.model_matrix,
            motions: loaded.motions,
            expressions: loaded.expressions,
            motion_manager: MotionManager::new(),
            expression_manager: ExpressionManager::new(),
            eye_blink: loaded.eye_blink,
            breath: loaded.breath,
            physics: loaded.physics,
            pose: loaded.pose,
            user_data: loaded.user_data,
            lip_sync,
            renderer,
            pending_textures: loaded.textures,
        }
    }

    pub fn model(&self) -> &Model {
        &self.model
    }

    pub fn model_mut(&mut self) -> &mut Model {
        &mut self.model
    }

    pub fn setting(&self) -> &ModelSetting {
        &self.setting
    }

    pub fn model_matrix(&self) -> &ModelMatrix {
        &self.model_matrix
    }

    pub fn model_matrix_mut(&mut self) -> &mut ModelMatrix {
        &mut self.model_matrix
    }

    pub fn renderer(&self) -> &ModelRenderer {
        &self.renderer
    }

    pub fn user_data(&self) -> Option<&UserData> {
        self.user_data.as_ref()
    }

    pub fn motion_manager(&self) -> &MotionManager {
        &self.motion_manager
    }

    pub fn expression_manager(&self) -> &ExpressionManager {
        &self.expression_manager
    }

    /// Advance every animation layer by `delta_seconds` and deform the model.
    pub fn update(&mut self, delta_seconds: f32) {
        self.model.load_parameters();
        let mut motion_updated = false;
        if self.motion_manager.is_finished() {
            self.start_random_motion(IDLE_GROUP, Priority::Idle);
        } else {
            motion_updated = self.motion_manager.update(&mut self.model, delta_seconds);
        }
        self.model.save_parameters();

        if !motion_updated {
            if let Some(eye_blink) = self.eye_blink.as_mut() {
                eye_blink.update(&mut self.model, delta_seconds);
            }
        }

        self.expression_manager.update(&mut self.model, delta_seconds);

        if let Some(breath) = self.breath.as_mut() {
            breath.update(&mut self.model, delta_seconds);
        }
        if let Some(physics) = self.physics.as_ref() {
            physics.evaluate(&mut self.model);
        }
        self.lip_sync.update(&mut self.model, delta_seconds);
        if let Some(pose) = self.pose.as_mut() {
            pose.update(&mut self.model, delta_seconds);
        }

        self.model.update();
    }

    /// Start motion `index` of `group`. Returns [`MotionHandle::INVALID`] when
    /// the motion is missing or a higher priority motion holds the queue.
    pub fn start_motion(&mut self, group: &str, index: usize, priority: Priority) -> MotionHandle {
        if !self.motion_manager.reserve(priority) {
            log::debug!("Motion {}_{} rejected at priority {:?}", group, index, priority);
            return MotionHandle::INVALID;
        }
        let Some(motion) = self.motions.get(&loader::motion_name(group, index)).cloned() else {
            log::warn!("Motion {}_{} is not loaded", group, index);
            self.motion_manager.cancel_reservation(priority);
            return MotionHandle::INVALID;
        };
        log::debug!("Starting motion {}_{}", group, index);
        self.motion_manager.start_reserved(motion, priority)
    }

    pub fn start_random_motion(&mut self, group: &str, priority: Priority) -> MotionHandle {
        let count = self.setting.motion_count(group);
        if count == 0 {
            return MotionHandle::INVALID;
        }
        self.start_motion(group, rand::random_range(0..count), priority)
    }

    /// Asset path of the sound attached to a motion, for the caller to fetch
    /// and feed back through [`Avatar::push_audio`].
    pub fn motion_sound(&self, group: &str, index: usize) -> Option<&str> {
        self.motions.get(&loader::motion_name(group, index))?.sound()
    }

    pub fn expression_names(&self) -> impl Iterator<Item = &str> {
        self.expressions.iter().map(|(name, _)| name.as_str())
    }

    pub fn set_expression(&mut self, name: &str) -> MotionHandle {
        match self.expressions.iter().find(|(n, _)| n == name) {
            Some((_, expression)) => {
                log::debug!("Expression '{}'", name);
                self.expression_manager.start(Rc::clone(expression))
            }
            None => {
                log::warn!("Expression '{}' is not loaded", name);
                MotionHandle::INVALID
            }
        }
    }

    pub fn set_random_expression(&mut self) -> MotionHandle {
        if self.expressions.is_empty() {
            return MotionHandle::INVALID;
        }
        let index = rand::random_range(0..self.expressions.len());
        let expression = Rc::clone(&self.expressions[index].1);
        self.expression_manager.start(expression)
    }

    /// Whether the view-space point `(x, y)` lies on the named hit area.
    pub fn hit_test(&self, area_name: &str, x: f32, y: f32) -> bool {
        if self.model.opacity() < 1.0 {
            return false;
        }
        let Some(area) = self
            .setting
            .hit_areas()
            .iter()
            .find(|a| a.name == area_name || a.id == area_name)
        else {
            return false;
        };
        let Some(index) = self.model.drawable_index(&area.id) else {
            return false;
        };
        let (mx, my) = self.model_matrix.invert_point(x, y);
        self.model
            .drawable(index)
            .and_then(|d| d.bounds())
            .is_some_and(|b| b.contains(mx, my))
    }

    pub fn push_audio(&mut self, wav: Vec<u8>) {
        self.lip_sync.push_audio(wav);
    }

    pub fn clear_audio(&mut self) {
        self.lip_sync.clear();
    }

    pub fn set_lip_sync_weight(&mut self, weight: f32) {
        self.lip_sync.set_weight(weight);
    }

    pub fn amplitude(&self) -> f32 {
        self.lip_sync.amplitude()
    }

    pub fn is_speaking(&self) -> bool {
        self.lip_sync.is_playing()
    }

    /// Hand decoded textures to the backend. Only the first call uploads anything.
    pub fn upload_textures<B: RenderBackend>(&mut self, backend: &mut B) {
        for (slot, image) in self.pending_textures.drain(..).enumerate() {
            if let Some(image) = image {
                backend.upload_texture(slot, &image);
            }
        }
    }

    pub fn draw<B: RenderBackend>(&mut self, backend: &mut B, shaders: &mut ShaderProgramManager<B>, projection: Mat4) {
        self.renderer.set_mvp_matrix(projection * self.model_matrix.to_mat4());
        self.renderer.draw(backend, shaders, &self.model);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loader::{load_model, tests::fixture};
    use crate::render::testing::RecordingBackend;

    fn avatar() -> Avatar {
        let config = AvatarConfig::default();
        let loaded = pollster::block_on(load_model(&fixture(), "m", "a.model3.json", &config, |_| {})).unwrap();
        Avatar::new(loaded, &config)
    }

    #[test]
    fn test_idle_motion_starts_when_queue_is_empty() {
        let mut avatar = avatar();
        assert!(avatar.motion_manager().is_finished());
        avatar.update(1.0 / 60.0);
        assert_eq!(avatar.motion_manager().entry_count(), 1);
        assert_eq!(avatar.motion_manager().current_priority(), Priority::Idle);
    }

    #[test]
    fn test_priority_rejection() {
        let mut avatar = avatar();
        let handle = avatar.start_motion("TapBody", 0, Priority::Normal);
        assert!(handle.is_valid());
        assert!(avatar.motion_manager().state(handle).is_some());

        assert!(!avatar.start_motion("Idle", 0, Priority::Idle).is_valid());
        assert!(avatar.start_motion("Idle", 0, Priority::Force).is_valid());
        // missing motions release the reservation
        assert!(!avatar.start_motion("TapBody", 1, Priority::Force).is_valid());
        assert_eq!(avatar.motion_manager().reserve_priority(), Priority::None);
    }

    #[test]
    fn test_motion_drives_parameter() {
        let mut avatar = avatar();
        avatar.start_motion("TapBody", 0, Priority::Normal);
        for _ in 0..120 {
            avatar.update(1.0 / 60.0);
        }
        assert!(avatar.model().parameter_value("ParamAngleX") > 0.0);
    }

    #[test]
    fn test_expressions() {
        let mut avatar = avatar();
        assert!(avatar.set_expression("smile").is_valid());
        assert!(!avatar.set_expression("frown").is_valid());
        assert!(avatar.set_random_expression().is_valid());
        assert_eq!(avatar.expression_names().collect::<Vec<_>>(), vec!["smile"]);
    }

    #[test]
    fn test_hit_test_uses_area_bounds() {
        let mut avatar = avatar();
        assert!(avatar.hit_test("Body", 0.1, 0.1));
        assert!(!avatar.hit_test("Body", 0.95, 0.95));
        assert!(!avatar.hit_test("Head", 0.1, 0.1));

        avatar.model_mut().set_opacity(0.5);
        assert!(!avatar.hit_test("Body", 0.1, 0.1));
    }

    #[test]
    fn test_textures_upload_once() {
        let mut avatar = avatar();
        let mut backend = RecordingBackend::default();
        avatar.upload_textures(&mut backend);
        avatar.upload_textures(&mut backend);
        assert_eq!(backend.uploaded, vec![0]);
    }

    #[test]
    fn test_draw_uses_model_matrix() {
        let mut avatar = avatar();
        let mut backend = RecordingBackend::default();
        let mut shaders = ShaderProgramManager::new();
        avatar.update(0.0);
        avatar.draw(&mut backend, &mut shaders, Mat4::from_scale(glam::Vec3::new(0.5, 1.0, 1.0)));
        assert_eq!(avatar.renderer().mvp_matrix().x_axis.x, 0.5);
        assert_eq!(avatar.renderer().last_frame().draws, 2);
    }
}
