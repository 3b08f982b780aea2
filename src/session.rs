//! The render service: owns the backend, the shader programs and the current avatar.

use glam::{Mat4, Vec3};

use crate::avatar::Avatar;
use crate::config::AvatarConfig;
use crate::loader::{self, AssetFetcher, LoadError, LoadStage, LoadedModel};
use crate::render::{RenderBackend, ShaderProgramManager};

/// Identifies one `switch_character` request; completions for older ones are dropped.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LoadTicket(u64);

pub struct Session<B: RenderBackend> {
    backend: B,
    shaders: ShaderProgramManager<B>,
    config: AvatarConfig,
    avatar: Option<Avatar>,
    generation: u64,
    stage: Option<LoadStage>,
    width: u32,
    height: u32,
}

impl<B: RenderBackend> Session<B> {
    pub fn new(backend: B, config: AvatarConfig, width: u32, height: u32) -> Self {
        Self {
            backend,
            shaders: ShaderProgramManager::new(),
            config,
            avatar: None,
            generation: 0,
            stage: None,
            width: width.max(1),
            height: height.max(1),
        }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    pub fn config(&self) -> &AvatarConfig {
        &self.config
    }

    pub fn avatar(&self) -> Option<&Avatar> {
        self.avatar.as_ref()
    }

    pub fn avatar_mut(&mut self) -> Option<&mut Avatar> {
        self.avatar.as_mut()
    }

    pub fn is_ready(&self) -> bool {
        self.avatar.is_some()
    }

    /// Last stage the current load reported, if a load was started.
    pub fn stage(&self) -> Option<LoadStage> {
        self.stage
    }

    pub fn resize(&mut self, width: u32, height: u32) {
        self.width = width.max(1);
        self.height = height.max(1);
    }

    pub fn size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    /// Drop the current avatar and its textures and hand out a ticket for the next load.
    pub fn begin_switch(&mut self) -> LoadTicket {
        self.generation += 1;
        self.avatar = None;
        self.stage = Some(LoadStage::LoadModel);
        self.backend.release_textures();
        LoadTicket(self.generation)
    }

    /// Record stage progress for `ticket`, ignoring stale tickets.
    pub fn report_stage(&mut self, ticket: LoadTicket, stage: LoadStage) {
        if ticket.0 == self.generation {
            self.stage = Some(stage);
        }
    }

    /// Install the result of a load. Returns whether an avatar became ready.
    pub fn finish_switch(&mut self, ticket: LoadTicket, result: Result<LoadedModel, LoadError>) -> bool {
        if ticket.0 != self.generation {
            log::info!("Dropping stale model load {}", ticket.0);
            return false;
        }
        match result {
            Ok(loaded) => {
                let mut avatar = Avatar::new(loaded, &self.config);
                avatar.upload_textures(&mut self.backend);
                self.avatar = Some(avatar);
                self.stage = Some(LoadStage::Ready);
                true
            }
            Err(e) => {
                log::error!("Model load failed: {}", e);
                false
            }
        }
    }

    /// Replace the character with the model at `dir/file`.
    pub async fn switch_character<F: AssetFetcher>(&mut self, fetcher: &F, dir: &str, file: &str) -> bool {
        log::info!("Switching character to {}", loader::asset_path(dir, file));
        let ticket = self.begin_switch();
        let mut stages = Vec::new();
        let result = loader::load_model(fetcher, dir, file, &self.config, |stage| stages.push(stage)).await;
        if let Some(&stage) = stages.last() {
            self.report_stage(ticket, stage);
        }
        self.finish_switch(ticket, result)
    }

    pub fn update(&mut self, delta_seconds: f32) {
        if let Some(avatar) = self.avatar.as_mut() {
            avatar.update(delta_seconds);
        }
    }

    /// View projection for the current viewport. Portrait viewports fit a
    /// wide model to the view width instead of its height.
    pub fn projection(&mut self) -> Mat4 {
        let (w, h) = (self.width as f32, self.height as f32);
        let portrait = match self.avatar.as_mut() {
            Some(avatar) if avatar.model().canvas_width() > 1.0 && w < h => {
                avatar.model_matrix_mut().set_width(2.0);
                true
            }
            _ => false,
        };
        if portrait {
            Mat4::from_scale(Vec3::new(1.0, w / h, 1.0))
        } else {
            Mat4::from_scale(Vec3::new(h / w, 1.0, 1.0))
        }
    }

    /// Record one frame. Does nothing until a model is ready.
    pub fn draw(&mut self) -> bool {
        if self.avatar.is_none() {
            return false;
        }
        let projection = self.projection();
        let Some(avatar) = self.avatar.as_mut() else {
            return false;
        };
        self.backend.begin_frame(self.config.clear_color);
        avatar.draw(&mut self.backend, &mut self.shaders, projection);
        true
    }

    pub fn set_lip_sync_weight(&mut self, weight: f32) {
        self.config.lip_sync_weight = weight;
        if let Some(avatar) = self.avatar.as_mut() {
            avatar.set_lip_sync_weight(weight);
        }
    }

    /// Release every GPU object the session created.
    pub fn release(&mut self) {
        self.avatar = None;
        self.shaders.release();
        self.backend.release_textures();
    }
}
