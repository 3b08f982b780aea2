//! Staged asynchronous model loading.
//!
//! Stages run strictly in order. Every fetch a stage needs runs concurrently
//! and the stage ends only when all of them resolved. A broken model
//! definition or mesh blob aborts the load; any other asset that fails is
//! logged and left out.

use std::collections::{BTreeMap, HashMap};
use std::rc::Rc;

use futures::future::join_all;
use serde::Deserialize;
use thiserror::Error;

use crate::config::AvatarConfig;
use crate::effects::{Breath, EyeBlink, Physics, Pose};
use crate::math::ModelMatrix;
use crate::model::{Model, ModelError};
use crate::motion::{Expression, Motion};
use crate::setting::ModelSetting;
use crate::texture::TextureImage;

pub const IDLE_GROUP: &str = "Idle";

#[derive(Error, Debug, Clone, PartialEq)]
pub enum FetchError {
    #[error("asset '{0}' not found")]
    NotFound(String),
    #[error("fetching '{path}' failed: {message}")]
    Failed { path: String, message: String },
}

#[derive(Error, Debug)]
pub enum LoadError {
    #[error("fetch error: {0}")]
    Fetch(#[from] FetchError),
    #[error("model definition error: {0}")]
    Setting(#[from] serde_json::Error),
    #[error("model error: {0}")]
    Model(#[from] ModelError),
}

/// Source of asset bytes addressed by path.
#[allow(async_fn_in_trait)]
pub trait AssetFetcher {
    async fn fetch(&self, path: &str) -> Result<Vec<u8>, FetchError>;
}

/// Fetcher over an in-memory map, for tests and embedded assets.
#[derive(Default, Clone)]
pub struct MemoryFetcher {
    files: HashMap<String, Vec<u8>>,
}

impl MemoryFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, path: impl Into<String>, bytes: impl Into<Vec<u8>>) {
        self.files.insert(path.into(), bytes.into());
    }
}

impl AssetFetcher for MemoryFetcher {
    async fn fetch(&self, path: &str) -> Result<Vec<u8>, FetchError> {
        self.files
            .get(path)
            .cloned()
            .ok_or_else(|| FetchError::NotFound(path.to_string()))
    }
}

/// Reads assets from the local filesystem.
#[cfg(not(target_arch = "wasm32"))]
pub struct FsFetcher;

#[cfg(not(target_arch = "wasm32"))]
impl AssetFetcher for FsFetcher {
    async fn fetch(&self, path: &str) -> Result<Vec<u8>, FetchError> {
        std::fs::read(path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => FetchError::NotFound(path.to_string()),
            _ => FetchError::Failed {
                path: path.to_string(),
                message: e.to_string(),
            },
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LoadStage {
    LoadModel,
    LoadExpressions,
    LoadPhysics,
    LoadPose,
    SetupEyeBlink,
    SetupBreath,
    LoadUserData,
    SetupEyeBlinkIds,
    SetupLipSyncIds,
    SetupLayout,
    LoadMotions,
    LoadTextures,
    Ready,
}

impl LoadStage {
    pub const ORDER: [LoadStage; 13] = [
        LoadStage::LoadModel,
        LoadStage::LoadExpressions,
        LoadStage::LoadPhysics,
        LoadStage::LoadPose,
        LoadStage::SetupEyeBlink,
        LoadStage::SetupBreath,
        LoadStage::LoadUserData,
        LoadStage::SetupEyeBlinkIds,
        LoadStage::SetupLipSyncIds,
        LoadStage::SetupLayout,
        LoadStage::LoadMotions,
        LoadStage::LoadTextures,
        LoadStage::Ready,
    ];
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct UserDataEntry {
    #[serde(default)]
    pub target: String,
    pub id: String,
    #[serde(default)]
    pub value: String,
}

/// Read-only annotations from `*.userdata3.json`.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct UserData {
    #[serde(default)]
    pub user_data: Vec<UserDataEntry>,
}

impl UserData {
    pub fn from_json(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }

    pub fn entries(&self) -> &[UserDataEntry] {
        &self.user_data
    }
}

/// Everything a finished load produced.
pub struct LoadedModel {
    pub setting: ModelSetting,
    pub model: Model,
    pub expressions: Vec<(String, Rc<Expression>)>,
    pub physics: Option<Physics>,
    pub pose: Option<Pose>,
    pub eye_blink: Option<EyeBlink>,
    pub breath: Option<Breath>,
    pub user_data: Option<UserData>,
    pub eye_blink_ids: Vec<String>,
    pub lip_sync_ids: Vec<String>,
    pub model_matrix: ModelMatrix,
    /// Keyed `"{group}_{index}"`.
    pub motions: BTreeMap<String, Rc<Motion>>,
    /// One entry per texture slot; `None` leaves the slot unbound.
    pub textures: Vec<Option<TextureImage>>,
}

impl LoadedModel {
    pub fn motion(&self, group: &str, index: usize) -> Option<Rc<Motion>> {
        self.motions.get(&motion_name(group, index)).cloned()
    }

    pub fn expression(&self, name: &str) -> Option<Rc<Expression>> {
        self.expressions
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, e)| Rc::clone(e))
    }
}

pub fn motion_name(group: &str, index: usize) -> String {
    format!("{}_{}", group, index)
}

/// Join a model directory and a relative asset path.
pub fn asset_path(dir: &str, file: &str) -> String {
    if dir.is_empty() || dir.ends_with('/') {
        format!("{}{}", dir, file)
    } else {
        format!("{}/{}", dir, file)
    }
}

/// Fetch and parse one optional asset, degrading to `None` on any failure.
async fn fetch_optional<F, T, E>(fetcher: &F, dir: &str, file: Option<&str>, kind: &str, parse: impl Fn(&[u8]) -> Result<T, E>) -> Option<T>
where
    F: AssetFetcher,
    E: std::fmt::Display,
{
    let file = file.filter(|f| !f.is_empty())?;
    match fetcher.fetch(&asset_path(dir, file)).await {
        Ok(bytes) => match parse(&bytes) {
            Ok(value) => Some(value),
            Err(e) => {
                log::warn!("Failed to parse {} '{}': {}", kind, file, e);
                None
            }
        },
        Err(e) => {
            log::warn!("Failed to load {}: {}", kind, e);
            None
        }
    }
}

/// Run the whole load. `on_stage` is told about every stage as it begins.
pub async fn load_model<F: AssetFetcher>(
    fetcher: &F,
    dir: &str,
    file: &str,
    config: &AvatarConfig,
    mut on_stage: impl FnMut(LoadStage),
) -> Result<LoadedModel, LoadError> {
    on_stage(LoadStage::LoadModel);
    let setting_bytes = fetcher.fetch(&asset_path(dir, file)).await?;
    let setting = ModelSetting::from_json(&setting_bytes)?;
    let moc_bytes = fetcher.fetch(&asset_path(dir, setting.model_file())).await?;
    let model = Model::from_json(&moc_bytes)?;
    log::info!(
        "Loaded model '{}' ({} drawables, {} parameters)",
        file,
        model.drawable_count(),
        model.parameters().len()
    );

    on_stage(LoadStage::LoadExpressions);
    let expression_results = join_all(setting.expressions().iter().map(|r| async move {
        let parsed = fetch_optional(fetcher, dir, Some(r.file.as_str()), "expression", Expression::from_json).await;
        (r.name.clone(), parsed)
    }))
    .await;
    let expressions = expression_results
        .into_iter()
        .filter_map(|(name, e)| e.map(|e| (name, Rc::new(e))))
        .collect();

    on_stage(LoadStage::LoadPhysics);
    let physics = fetch_optional(fetcher, dir, setting.physics_file(), "physics", Physics::from_json).await;

    on_stage(LoadStage::LoadPose);
    let mut pose = fetch_optional(fetcher, dir, setting.pose_file(), "pose", Pose::from_json).await;

    on_stage(LoadStage::SetupEyeBlink);
    let eye_blink = (config.eye_blink && !setting.eye_blink_parameter_ids().is_empty())
        .then(|| EyeBlink::new(setting.eye_blink_parameter_ids()));

    on_stage(LoadStage::SetupBreath);
    let breath = config.breath.then(Breath::standard);

    on_stage(LoadStage::LoadUserData);
    let user_data = fetch_optional(fetcher, dir, setting.user_data_file(), "user data", UserData::from_json).await;

    on_stage(LoadStage::SetupEyeBlinkIds);
    let eye_blink_ids = setting.eye_blink_parameter_ids();

    on_stage(LoadStage::SetupLipSyncIds);
    let lip_sync_ids = setting.lip_sync_parameter_ids();

    on_stage(LoadStage::SetupLayout);
    let mut model_matrix = ModelMatrix::new(model.canvas_width(), model.canvas_height());
    model_matrix.setup_from_layout(setting.layout());

    on_stage(LoadStage::LoadMotions);
    let mut requests = Vec::new();
    for group in setting.motion_groups() {
        for index in 0..setting.motion_count(group) {
            if let Some(r) = setting.motion(group, index) {
                requests.push((group.to_string(), index, r.clone()));
            }
        }
    }
    let motion_results = join_all(requests.iter().map(|(group, index, r)| {
        let (eye, lip) = (&eye_blink_ids, &lip_sync_ids);
        async move {
            let parsed = fetch_optional(fetcher, dir, Some(r.file.as_str()), "motion", Motion::from_json).await;
            let motion = parsed.map(|m| {
                m.with_fade_overrides(r.fade_in_time, r.fade_out_time)
                    .with_effect_ids(eye.clone(), lip.clone())
                    .with_sound(r.sound.clone().filter(|s| !s.is_empty()))
            });
            (motion_name(group, *index), motion)
        }
    }))
    .await;
    let motions: BTreeMap<String, Rc<Motion>> = motion_results
        .into_iter()
        .filter_map(|(name, m)| m.map(|m| (name, Rc::new(m))))
        .collect();
    log::debug!("Loaded {} of {} motions", motions.len(), requests.len());

    on_stage(LoadStage::LoadTextures);
    let texture_results = join_all((0..setting.texture_count()).map(|i| {
        let file = setting.texture_file(i);
        async move {
            if file.is_none() {
                log::warn!("Texture slot {} has no file; it stays unbound", i);
            }
            fetch_optional(fetcher, dir, file, "texture", TextureImage::decode).await
        }
    }))
    .await;

    let mut model = model;
    if let Some(pose) = pose.as_mut() {
        pose.reset(&mut model);
    }
    model.update();

    on_stage(LoadStage::Ready);
    Ok(LoadedModel {
        setting,
        model,
        expressions,
        physics,
        pose,
        eye_blink,
        breath,
        user_data,
        eye_blink_ids,
        lip_sync_ids,
        model_matrix,
        motions,
        textures: texture_results,
    })
}
