//! Model definition (`*.model3.json`) parsing.

use std::collections::{BTreeMap, HashMap};

use serde::Deserialize;

pub const GROUP_EYE_BLINK: &str = "EyeBlink";
pub const GROUP_LIP_SYNC: &str = "LipSync";

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ExpressionRef {
    pub name: String,
    pub file: String,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct MotionRef {
    pub file: String,
    #[serde(default)]
    pub sound: Option<String>,
    #[serde(default)]
    pub fade_in_time: Option<f32>,
    #[serde(default)]
    pub fade_out_time: Option<f32>,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct FileReferences {
    pub moc: String,
    #[serde(default)]
    pub textures: Vec<String>,
    #[serde(default)]
    pub physics: Option<String>,
    #[serde(default)]
    pub pose: Option<String>,
    #[serde(default)]
    pub user_data: Option<String>,
    #[serde(default)]
    pub expressions: Vec<ExpressionRef>,
    /// Keyed by group name; ordered so group iteration is stable.
    #[serde(default)]
    pub motions: BTreeMap<String, Vec<MotionRef>>,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ParameterGroup {
    #[serde(default)]
    pub target: String,
    pub name: String,
    #[serde(default)]
    pub ids: Vec<String>,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct HitArea {
    pub id: String,
    #[serde(default)]
    pub name: String,
}

/// Parsed model definition. Every path is relative to the model directory.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ModelSetting {
    #[serde(default)]
    pub version: u32,
    pub file_references: FileReferences,
    #[serde(default)]
    pub groups: Vec<ParameterGroup>,
    #[serde(default)]
    pub layout: HashMap<String, f32>,
    #[serde(default)]
    pub hit_areas: Vec<HitArea>,
}

impl ModelSetting {
    pub fn from_json(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }

    pub fn model_file(&self) -> &str {
        &self.file_references.moc
    }

    pub fn texture_count(&self) -> usize {
        self.file_references.textures.len()
    }

    /// Texture file for a slot. An empty name leaves the slot unbound.
    pub fn texture_file(&self, index: usize) -> Option<&str> {
        self.file_references
            .textures
            .get(index)
            .map(String::as_str)
            .filter(|f| !f.is_empty())
    }

    pub fn physics_file(&self) -> Option<&str> {
        non_empty(&self.file_references.physics)
    }

    pub fn pose_file(&self) -> Option<&str> {
        non_empty(&self.file_references.pose)
    }

    pub fn user_data_file(&self) -> Option<&str> {
        non_empty(&self.file_references.user_data)
    }

    pub fn expressions(&self) -> &[ExpressionRef] {
        &self.file_references.expressions
    }

    pub fn motion_groups(&self) -> impl Iterator<Item = &str> {
        self.file_references.motions.keys().map(String::as_str)
    }

    pub fn motion_count(&self, group: &str) -> usize {
        self.file_references.motions.get(group).map_or(0, Vec::len)
    }

    pub fn motion(&self, group: &str, index: usize) -> Option<&MotionRef> {
        self.file_references.motions.get(group)?.get(index)
    }

    fn group_ids(&self, name: &str) -> Vec<String> {
        self.groups
            .iter()
            .filter(|g| g.name == name && (g.target.is_empty() || g.target == "Parameter"))
            .flat_map(|g| g.ids.iter().cloned())
            .collect()
    }

    pub fn eye_blink_parameter_ids(&self) -> Vec<String> {
        self.group_ids(GROUP_EYE_BLINK)
    }

    pub fn lip_sync_parameter_ids(&self) -> Vec<String> {
        self.group_ids(GROUP_LIP_SYNC)
    }

    pub fn hit_areas(&self) -> &[HitArea] {
        &self.hit_areas
    }

    pub fn layout(&self) -> &HashMap<String, f32> {
        &self.layout
    }
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|s| !s.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    const SETTING: &str = r#"{
        "Version": 3,
        "FileReferences": {
            "Moc": "haru.mesh.json",
            "Textures": ["tex_00.png", ""],
            "Physics": "haru.physics3.json",
            "Pose": "",
            "Expressions": [{"Name": "smile", "File": "exp/smile.exp3.json"}],
            "Motions": {
                "Idle": [{"File": "idle_0.motion3.json"}, {"File": "idle_1.motion3.json", "FadeInTime": 0.2}],
                "TapBody": [{"File": "tap.motion3.json", "Sound": "tap.wav"}]
            }
        },
        "Groups": [
            {"Target": "Parameter", "Name": "EyeBlink", "Ids": ["ParamEyeLOpen", "ParamEyeROpen"]},
            {"Target": "Parameter", "Name": "LipSync", "Ids": ["ParamMouthOpenY"]}
        ],
        "Layout": {"CenterX": 0.0, "Width": 2.0},
        "HitAreas": [{"Id": "HitHead", "Name": "Head"}]
    }"#;

    #[test]
    fn test_parse_model_setting() {
        let s = ModelSetting::from_json(SETTING.as_bytes()).unwrap();
        assert_eq!(s.model_file(), "haru.mesh.json");
        assert_eq!(s.texture_count(), 2);
        assert_eq!(s.texture_file(0), Some("tex_00.png"));
        assert_eq!(s.texture_file(1), None);
        assert_eq!(s.physics_file(), Some("haru.physics3.json"));
        assert_eq!(s.pose_file(), None);
        assert_eq!(s.motion_count("Idle"), 2);
        assert_eq!(s.motion("Idle", 1).and_then(|m| m.fade_in_time), Some(0.2));
        assert_eq!(s.motion("TapBody", 0).and_then(|m| m.sound.as_deref()), Some("tap.wav"));
        assert_eq!(s.motion_groups().collect::<Vec<_>>(), vec!["Idle", "TapBody"]);
        assert_eq!(s.eye_blink_parameter_ids(), vec!["ParamEyeLOpen", "ParamEyeROpen"]);
        assert_eq!(s.lip_sync_parameter_ids(), vec!["ParamMouthOpenY"]);
        assert_eq!(s.hit_areas()[0].name, "Head");
        assert_eq!(s.layout().get("Width"), Some(&2.0));
    }

    #[test]
    fn test_missing_moc_is_error() {
        assert!(ModelSetting::from_json(br#"{"FileReferences": {}}"#).is_err());
    }
}
