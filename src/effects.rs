//! Procedural parameter effects applied after motions each tick: eye blink,
//! breathing, pose part switching and precomputed physics deltas.

use serde::Deserialize;

use crate::model::Model;

// ---------------------------------------------------------------------------
// Eye blink
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum BlinkState {
    First,
    Interval,
    Closing,
    Closed,
    Opening,
}

/// Periodic blink written to the eye-open parameters.
pub struct EyeBlink {
    parameter_ids: Vec<String>,
    state: BlinkState,
    state_start: f32,
    next_blink: f32,
    time: f32,
    interval_seconds: f32,
    closing_seconds: f32,
    closed_seconds: f32,
    opening_seconds: f32,
}

impl EyeBlink {
    pub fn new(parameter_ids: Vec<String>) -> Self {
        Self {
            parameter_ids,
            state: BlinkState::First,
            state_start: 0.0,
            next_blink: 0.0,
            time: 0.0,
            interval_seconds: 4.0,
            closing_seconds: 0.1,
            closed_seconds: 0.05,
            opening_seconds: 0.15,
        }
    }

    pub fn set_parameter_ids(&mut self, ids: Vec<String>) {
        self.parameter_ids = ids;
    }

    pub fn parameter_ids(&self) -> &[String] {
        &self.parameter_ids
    }

    pub fn set_interval(&mut self, seconds: f32) {
        self.interval_seconds = seconds;
    }

    fn schedule_next(&mut self) {
        let r: f32 = rand::random();
        self.next_blink = self.time + r * (2.0 * self.interval_seconds - 1.0);
    }

    pub fn update(&mut self, model: &mut Model, delta_seconds: f32) {
        self.time += delta_seconds;
        let elapsed = self.time - self.state_start;

        let value = match self.state {
            BlinkState::Closing => {
                let t = elapsed / self.closing_seconds;
                if t >= 1.0 {
                    self.state = BlinkState::Closed;
                    self.state_start = self.time;
                    0.0
                } else {
                    1.0 - t
                }
            }
            BlinkState::Closed => {
                if elapsed / self.closed_seconds >= 1.0 {
                    self.state = BlinkState::Opening;
                    self.state_start = self.time;
                }
                0.0
            }
            BlinkState::Opening => {
                let t = elapsed / self.opening_seconds;
                if t >= 1.0 {
                    self.state = BlinkState::Interval;
                    self.schedule_next();
                    1.0
                } else {
                    t
                }
            }
            BlinkState::Interval => {
                if self.next_blink < self.time {
                    self.state = BlinkState::Closing;
                    self.state_start = self.time;
                }
                1.0
            }
            BlinkState::First => {
                self.state = BlinkState::Interval;
                self.schedule_next();
                1.0
            }
        };

        for id in &self.parameter_ids {
            model.set_parameter_value(id, value, 1.0);
        }
    }
}

// ---------------------------------------------------------------------------
// Breath
// ---------------------------------------------------------------------------

#[derive(Clone, Debug)]
pub struct BreathParameter {
    pub id: String,
    pub offset: f32,
    pub peak: f32,
    pub cycle: f32,
    pub weight: f32,
}

impl BreathParameter {
    pub fn new(id: &str, offset: f32, peak: f32, cycle: f32, weight: f32) -> Self {
        Self { id: id.to_string(), offset, peak, cycle, weight }
    }
}

/// Sinusoidal idle sway added on top of the current parameter values.
pub struct Breath {
    parameters: Vec<BreathParameter>,
    time: f32,
}

impl Breath {
    pub fn new(parameters: Vec<BreathParameter>) -> Self {
        Self { parameters, time: 0.0 }
    }

    /// Head and body sway used when a model does not specify its own.
    pub fn standard() -> Self {
        Self::new(vec![
            BreathParameter::new("ParamAngleX", 0.0, 15.0, 6.5345, 0.5),
            BreathParameter::new("ParamAngleY", 0.0, 8.0, 3.5345, 0.5),
            BreathParameter::new("ParamAngleZ", 0.0, 10.0, 5.5345, 0.5),
            BreathParameter::new("ParamBodyAngleX", 0.0, 4.0, 15.5345, 0.5),
            BreathParameter::new("ParamBreath", 0.5, 0.5, 3.2345, 1.0),
        ])
    }

    pub fn parameters(&self) -> &[BreathParameter] {
        &self.parameters
    }

    pub fn update(&mut self, model: &mut Model, delta_seconds: f32) {
        self.time += delta_seconds;
        let phase = self.time * 2.0 * std::f32::consts::PI;
        for p in &self.parameters {
            if p.cycle <= 0.0 {
                continue;
            }
            let value = p.offset + p.peak * (phase / p.cycle).sin();
            model.add_parameter_value(&p.id, value, p.weight);
        }
    }
}

// ---------------------------------------------------------------------------
// Pose
// ---------------------------------------------------------------------------

const POSE_DEFAULT_FADE_SECONDS: f32 = 0.5;
const POSE_PHI: f32 = 0.5;
const POSE_BACK_OPACITY_THRESHOLD: f32 = 0.15;
const POSE_VISIBLE_EPSILON: f32 = 0.001;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct PoseJson {
    #[serde(default)]
    fade_in_time: Option<f32>,
    #[serde(default)]
    groups: Vec<Vec<PosePartJson>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct PosePartJson {
    id: String,
    #[serde(default)]
    link: Vec<String>,
}

#[derive(Clone, Debug)]
struct PosePart {
    id: String,
    links: Vec<String>,
}

/// Exclusive part groups: one part per group is shown, swaps cross-fade.
pub struct Pose {
    groups: Vec<Vec<PosePart>>,
    fade_seconds: f32,
    initialized: bool,
}

impl Pose {
    pub fn from_json(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        let json: PoseJson = serde_json::from_slice(bytes)?;
        Ok(Self {
            fade_seconds: json
                .fade_in_time
                .filter(|v| *v >= 0.0)
                .unwrap_or(POSE_DEFAULT_FADE_SECONDS),
            groups: json
                .groups
                .into_iter()
                .map(|g| g.into_iter().map(|p| PosePart { id: p.id, links: p.link }).collect())
                .collect(),
            initialized: false,
        })
    }

    pub fn group_count(&self) -> usize {
        self.groups.len()
    }

    /// Show the first part of every group, hide the rest.
    pub fn reset(&mut self, model: &mut Model) {
        for group in &self.groups {
            for (i, part) in group.iter().enumerate() {
                let opacity = if i == 0 { 1.0 } else { 0.0 };
                if let Some(index) = model.part_index(&part.id) {
                    model.set_part_opacity(index, opacity);
                }
                model.set_parameter_value(&part.id, opacity, 1.0);
            }
        }
        self.initialized = true;
    }

    pub fn update(&mut self, model: &mut Model, delta_seconds: f32) {
        if !self.initialized {
            self.reset(model);
        }
        let dt = delta_seconds.max(0.0);
        for group in &self.groups {
            Self::fade_group(model, group, dt, self.fade_seconds);
        }
        self.copy_links(model);
    }

    fn fade_group(model: &mut Model, group: &[PosePart], dt: f32, fade_seconds: f32) {
        if group.is_empty() {
            return;
        }
        let parts: Vec<Option<usize>> = group.iter().map(|p| model.part_index(&p.id)).collect();

        let visible = group
            .iter()
            .position(|p| model.parameter_value(&p.id) > POSE_VISIBLE_EPSILON)
            .unwrap_or(0);

        let mut new_opacity = parts[visible].map_or(1.0, |i| model.part_opacity(i));
        if fade_seconds > 0.0 {
            new_opacity = (new_opacity + dt / fade_seconds).min(1.0);
        } else {
            new_opacity = 1.0;
        }

        for (i, part) in parts.iter().enumerate() {
            let Some(index) = *part else { continue };
            if i == visible {
                model.set_part_opacity(index, new_opacity);
                continue;
            }
            let mut opacity = if new_opacity < POSE_PHI {
                new_opacity * (POSE_PHI - 1.0) / POSE_PHI + 1.0
            } else {
                (1.0 - new_opacity) * POSE_PHI / (1.0 - POSE_PHI)
            };
            let back = (1.0 - opacity) * (1.0 - new_opacity);
            if back > POSE_BACK_OPACITY_THRESHOLD {
                opacity = 1.0 - POSE_BACK_OPACITY_THRESHOLD / (1.0 - new_opacity);
            }
            if model.part_opacity(index) > opacity {
                model.set_part_opacity(index, opacity);
            }
        }
    }

    fn copy_links(&self, model: &mut Model) {
        for part in self.groups.iter().flatten() {
            let Some(src) = model.part_index(&part.id) else { continue };
            let opacity = model.part_opacity(src);
            for link in &part.links {
                if let Some(dst) = model.part_index(link) {
                    model.set_part_opacity(dst, opacity);
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Physics (precomputed deltas)
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct PhysicsJson {
    #[serde(default)]
    physics_settings: Vec<PhysicsSettingJson>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct PhysicsSettingJson {
    #[serde(default)]
    input: Vec<PhysicsInputJson>,
    #[serde(default)]
    output: Vec<PhysicsOutputJson>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct PhysicsTargetJson {
    id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct PhysicsInputJson {
    source: PhysicsTargetJson,
    #[serde(default = "default_percent")]
    weight: f32,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct PhysicsOutputJson {
    destination: PhysicsTargetJson,
    #[serde(default = "default_scale")]
    scale: f32,
    #[serde(default = "default_percent")]
    weight: f32,
}

fn default_percent() -> f32 {
    100.0
}

fn default_scale() -> f32 {
    1.0
}

#[derive(Clone, Debug)]
struct PhysicsRig {
    inputs: Vec<(String, f32)>,
    outputs: Vec<(String, f32, f32)>,
}

/// Feeds input parameters through fixed linear gains into output parameters.
/// There is no simulated pendulum; each output receives its delta additively.
pub struct Physics {
    rigs: Vec<PhysicsRig>,
}

impl Physics {
    pub fn from_json(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        let json: PhysicsJson = serde_json::from_slice(bytes)?;
        let rigs = json
            .physics_settings
            .into_iter()
            .map(|s| PhysicsRig {
                inputs: s.input.into_iter().map(|i| (i.source.id, i.weight / 100.0)).collect(),
                outputs: s
                    .output
                    .into_iter()
                    .map(|o| (o.destination.id, o.scale, o.weight / 100.0))
                    .collect(),
            })
            .collect();
        Ok(Self { rigs })
    }

    pub fn rig_count(&self) -> usize {
        self.rigs.len()
    }

    pub fn evaluate(&self, model: &mut Model) {
        for rig in &self.rigs {
            let drive: f32 = rig
                .inputs
                .iter()
                .map(|(id, w)| model.parameter_value(id) * w)
                .sum();
            for (id, scale, weight) in &rig.outputs {
                model.add_parameter_value(id, drive * scale, *weight);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::tests::{model_from, quad_json};

    fn param_model(ids: &[&str]) -> Model {
        let params: Vec<_> = ids
            .iter()
            .map(|id| serde_json::json!({"Id": id, "Min": -100.0, "Max": 100.0, "Default": 0.0}))
            .collect();
        model_from(serde_json::json!({"Parameters": params, "Drawables": []}))
    }

    #[test]
    fn test_eye_blink_cycles_closed_and_open() {
        let mut m = param_model(&["EyeL"]);
        let mut blink = EyeBlink::new(vec!["EyeL".to_string()]);
        blink.set_interval(0.5);
        let mut saw_closed = false;
        for _ in 0..400 {
            blink.update(&mut m, 1.0 / 60.0);
            let v = m.parameter_value("EyeL");
            assert!((0.0..=1.0).contains(&v));
            if v == 0.0 {
                saw_closed = true;
            }
        }
        assert!(saw_closed);
    }

    #[test]
    fn test_breath_oscillates_around_offset() {
        let mut breath = Breath::new(vec![BreathParameter::new("B", 0.0, 1.0, 1.0, 1.0)]);
        let mut m = param_model(&["B"]);
        breath.update(&mut m, 0.25);
        assert!((m.parameter_value("B") - 1.0).abs() < 1e-5);
        assert_eq!(Breath::standard().parameters().len(), 5);
    }

    #[test]
    fn test_physics_adds_scaled_delta() {
        let mut m = param_model(&["In", "Out"]);
        m.set_parameter_value("In", 10.0, 1.0);
        let physics = Physics::from_json(
            br#"{"PhysicsSettings": [{
                "Input": [{"Source": {"Target": "Parameter", "Id": "In"}, "Weight": 50}],
                "Output": [{"Destination": {"Target": "Parameter", "Id": "Out"}, "Scale": 2.0, "Weight": 100}]
            }]}"#,
        )
        .unwrap();
        physics.evaluate(&mut m);
        assert!((m.parameter_value("Out") - 10.0).abs() < 1e-6);
    }

    #[test]
    fn test_pose_switches_visible_part() {
        let mut a = quad_json("ArmA", 0.0, 0.0, 1.0, &[], 0);
        a["Part"] = serde_json::json!("PartArmA");
        let mut b = quad_json("ArmB", 0.0, 0.0, 1.0, &[], 1);
        b["Part"] = serde_json::json!("PartArmB");
        let mut m = model_from(serde_json::json!({
            "Parameters": [
                {"Id": "PartArmA", "Min": 0.0, "Max": 1.0, "Default": 1.0},
                {"Id": "PartArmB", "Min": 0.0, "Max": 1.0, "Default": 0.0}
            ],
            "Parts": [{"Id": "PartArmA"}, {"Id": "PartArmB"}],
            "Drawables": [a, b]
        }));
        let mut pose = Pose::from_json(br#"{"Groups": [[{"Id": "PartArmA", "Link": []}, {"Id": "PartArmB", "Link": []}]]}"#).unwrap();
        pose.update(&mut m, 0.0);
        assert_eq!(m.part_opacity(0), 1.0);
        assert_eq!(m.part_opacity(1), 0.0);

        m.set_parameter_value("PartArmA", 0.0, 1.0);
        m.set_parameter_value("PartArmB", 1.0, 1.0);
        for _ in 0..60 {
            pose.update(&mut m, 1.0 / 60.0);
        }
        assert!((m.part_opacity(1) - 1.0).abs() < 1e-6);
        assert!(m.part_opacity(0) < 1e-6);
    }
}
