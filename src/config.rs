use serde::{Deserialize, Serialize};

use crate::clipping::DEFAULT_MASK_BUFFER_SIZE;
use crate::lipsync::DEFAULT_LIP_SYNC_WEIGHT;

/// How clipping masks are generated.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MaskPrecision {
    /// Masks are rendered once per frame into shared textures.
    #[default]
    Buffer,
    /// Each masked drawable renders its own mask right before it is drawn.
    HighPrecision,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AvatarConfig {
    pub lip_sync_weight: f32,
    pub render_texture_count: usize,
    /// Falls back to 36 with one render texture and 32 per texture otherwise.
    pub masks_per_texture: Option<usize>,
    pub mask_buffer_size: u32,
    pub mask_precision: MaskPrecision,
    pub clear_color: [f32; 4],
    pub eye_blink: bool,
    pub breath: bool,
}

impl Default for AvatarConfig {
    fn default() -> Self {
        Self {
            lip_sync_weight: DEFAULT_LIP_SYNC_WEIGHT,
            render_texture_count: 1,
            masks_per_texture: None,
            mask_buffer_size: DEFAULT_MASK_BUFFER_SIZE,
            mask_precision: MaskPrecision::Buffer,
            clear_color: [0.0, 0.0, 0.0, 0.0],
            eye_blink: true,
            breath: true,
        }
    }
}

impl AvatarConfig {
    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    pub fn high_precision(&self) -> bool {
        self.mask_precision == MaskPrecision::HighPrecision
    }
}
