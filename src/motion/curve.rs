//! Keyframed motions (`*.motion3.json`).

use serde::Deserialize;

use super::QueueMotion;
use crate::model::Model;

const DEFAULT_FADE_SECONDS: f32 = 1.0;

const SEGMENT_LINEAR: u32 = 0;
const SEGMENT_BEZIER: u32 = 1;
const SEGMENT_STEPPED: u32 = 2;
const SEGMENT_INVERSE_STEPPED: u32 = 3;

const MODEL_CURVE_EYE_BLINK: &str = "EyeBlink";
const MODEL_CURVE_LIP_SYNC: &str = "LipSync";
const MODEL_CURVE_OPACITY: &str = "Opacity";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct MotionJson {
    meta: MetaJson,
    #[serde(default)]
    curves: Vec<CurveJson>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct MetaJson {
    duration: f32,
    #[serde(default)]
    r#loop: bool,
    #[serde(default)]
    fade_in_time: Option<f32>,
    #[serde(default)]
    fade_out_time: Option<f32>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct CurveJson {
    target: String,
    id: String,
    #[serde(default)]
    fade_in_time: Option<f32>,
    #[serde(default)]
    fade_out_time: Option<f32>,
    segments: Vec<f32>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CurveTarget {
    Model,
    Parameter,
    PartOpacity,
}

#[derive(Clone, Copy, Debug, PartialEq)]
struct Point {
    time: f32,
    value: f32,
}

#[derive(Clone, Copy, Debug)]
enum Segment {
    Linear(usize),
    Bezier(usize),
    Stepped(usize),
    InverseStepped(usize),
}

impl Segment {
    fn first_point(&self) -> usize {
        match *self {
            Segment::Linear(i) | Segment::Bezier(i) | Segment::Stepped(i) | Segment::InverseStepped(i) => i,
        }
    }

    fn last_point(&self) -> usize {
        match *self {
            Segment::Bezier(i) => i + 3,
            other => other.first_point() + 1,
        }
    }

    fn evaluate(&self, points: &[Point], time: f32) -> f32 {
        match *self {
            Segment::Linear(i) => {
                let (p0, p1) = (points[i], points[i + 1]);
                let span = p1.time - p0.time;
                let t = if span > 0.0 { ((time - p0.time) / span).max(0.0) } else { 1.0 };
                p0.value + (p1.value - p0.value) * t
            }
            Segment::Bezier(i) => {
                let p = &points[i..i + 4];
                let span = p[3].time - p[0].time;
                let t = if span > 0.0 { ((time - p[0].time) / span).clamp(0.0, 1.0) } else { 1.0 };
                let lerp = |a: f32, b: f32| a + (b - a) * t;
                let p01 = lerp(p[0].value, p[1].value);
                let p12 = lerp(p[1].value, p[2].value);
                let p23 = lerp(p[2].value, p[3].value);
                lerp(lerp(p01, p12), lerp(p12, p23))
            }
            Segment::Stepped(i) => points[i].value,
            Segment::InverseStepped(i) => points[i + 1].value,
        }
    }
}

#[derive(Clone, Debug)]
pub struct Curve {
    pub target: CurveTarget,
    pub id: String,
    fade_in_time: Option<f32>,
    fade_out_time: Option<f32>,
    points: Vec<Point>,
    segments: Vec<Segment>,
}

impl Curve {
    fn parse(json: CurveJson) -> Result<Self, String> {
        let target = match json.target.as_str() {
            "Model" => CurveTarget::Model,
            "Parameter" => CurveTarget::Parameter,
            "PartOpacity" => CurveTarget::PartOpacity,
            other => return Err(format!("unknown curve target '{}'", other)),
        };

        let raw = &json.segments;
        if raw.len() < 2 {
            return Err(format!("curve '{}' has no points", json.id));
        }
        let mut points = vec![Point { time: raw[0], value: raw[1] }];
        let mut segments = Vec::new();
        let mut i = 2;
        while i < raw.len() {
            let base = points.len() - 1;
            let kind = raw[i];
            if !kind.is_finite() || kind.fract() != 0.0 || !(0.0..=3.0).contains(&kind) {
                return Err(format!("curve '{}': unknown segment type {}", json.id, kind));
            }
            let (segment, count) = match kind as u32 {
                SEGMENT_LINEAR => (Segment::Linear(base), 1),
                SEGMENT_BEZIER => (Segment::Bezier(base), 3),
                SEGMENT_STEPPED => (Segment::Stepped(base), 1),
                SEGMENT_INVERSE_STEPPED => (Segment::InverseStepped(base), 1),
                other => return Err(format!("curve '{}': unknown segment type {}", json.id, other)),
            };
            i += 1;
            if i + count * 2 > raw.len() {
                return Err(format!("curve '{}': truncated segment", json.id));
            }
            for _ in 0..count {
                points.push(Point { time: raw[i], value: raw[i + 1] });
                i += 2;
            }
            segments.push(segment);
        }

        Ok(Self {
            target,
            id: json.id,
            fade_in_time: json.fade_in_time.filter(|v| *v >= 0.0),
            fade_out_time: json.fade_out_time.filter(|v| *v >= 0.0),
            points,
            segments,
        })
    }

    /// Value at `time` seconds into the motion. Clamps before the first and after the last point.
    pub fn evaluate(&self, time: f32) -> f32 {
        for segment in &self.segments {
            if self.points[segment.last_point()].time > time {
                if time <= self.points[segment.first_point()].time {
                    return self.points[segment.first_point()].value;
                }
                return segment.evaluate(&self.points, time);
            }
        }
        self.points.last().map_or(0.0, |p| p.value)
    }
}

/// A loaded keyframed motion.
#[derive(Clone, Debug)]
pub struct Motion {
    duration: f32,
    looping: bool,
    fade_in_seconds: f32,
    fade_out_seconds: f32,
    curves: Vec<Curve>,
    eye_blink_ids: Vec<String>,
    lip_sync_ids: Vec<String>,
    sound: Option<String>,
}

impl Motion {
    pub fn from_json(bytes: &[u8]) -> Result<Self, String> {
        let json: MotionJson = serde_json::from_slice(bytes).map_err(|e| e.to_string())?;
        let curves = json
            .curves
            .into_iter()
            .map(Curve::parse)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            duration: json.meta.duration.max(0.0),
            looping: json.meta.r#loop,
            fade_in_seconds: json.meta.fade_in_time.filter(|v| *v >= 0.0).unwrap_or(DEFAULT_FADE_SECONDS),
            fade_out_seconds: json.meta.fade_out_time.filter(|v| *v >= 0.0).unwrap_or(DEFAULT_FADE_SECONDS),
            curves,
            eye_blink_ids: Vec::new(),
            lip_sync_ids: Vec::new(),
            sound: None,
        })
    }

    /// Fade overrides from the model definition win when non-negative.
    pub fn with_fade_overrides(mut self, fade_in: Option<f32>, fade_out: Option<f32>) -> Self {
        if let Some(v) = fade_in.filter(|v| *v >= 0.0) {
            self.fade_in_seconds = v;
        }
        if let Some(v) = fade_out.filter(|v| *v >= 0.0) {
            self.fade_out_seconds = v;
        }
        self
    }

    pub fn with_effect_ids(mut self, eye_blink: Vec<String>, lip_sync: Vec<String>) -> Self {
        self.eye_blink_ids = eye_blink;
        self.lip_sync_ids = lip_sync;
        self
    }

    pub fn with_sound(mut self, sound: Option<String>) -> Self {
        self.sound = sound;
        self
    }

    pub fn sound(&self) -> Option<&str> {
        self.sound.as_deref()
    }

    pub fn is_looping(&self) -> bool {
        self.looping
    }

    pub fn curves(&self) -> &[Curve] {
        &self.curves
    }

    /// Write this motion's values into the model for the given playback time.
    ///
    /// `weight` is the entry's fade weight; curves with their own fade times
    /// recompute a weight from `fade_in_weight`/`end` instead.
    pub fn apply(&self, model: &mut Model, elapsed: f32, weight: f32, curve_weight: impl Fn(Option<f32>, Option<f32>) -> f32) {
        let mut time = elapsed;
        if self.looping && self.duration > 0.0 {
            time %= self.duration;
        }

        let mut eye_blink = None;
        let mut lip_sync = None;

        for curve in &self.curves {
            let value = curve.evaluate(time);
            match curve.target {
                CurveTarget::Model => match curve.id.as_str() {
                    MODEL_CURVE_EYE_BLINK => eye_blink = Some(value),
                    MODEL_CURVE_LIP_SYNC => lip_sync = Some(value),
                    MODEL_CURVE_OPACITY => model.set_opacity(value),
                    _ => {}
                },
                CurveTarget::Parameter => {
                    let w = if curve.fade_in_time.is_none() && curve.fade_out_time.is_none() {
                        weight
                    } else {
                        curve_weight(curve.fade_in_time, curve.fade_out_time)
                    };
                    let source = model.parameter_value(&curve.id);
                    model.set_parameter_value(&curve.id, source + (value - source) * w, 1.0);
                }
                CurveTarget::PartOpacity => {
                    if let Some(index) = model.part_index(&curve.id) {
                        model.set_part_opacity(index, value);
                    }
                }
            }
        }

        // Effect curves only drive ids that no parameter curve already covers.
        let covered = |id: &str| {
            self.curves
                .iter()
                .any(|c| c.target == CurveTarget::Parameter && c.id == id)
        };
        for (value, ids) in [(eye_blink, &self.eye_blink_ids), (lip_sync, &self.lip_sync_ids)] {
            let Some(value) = value else { continue };
            for id in ids.iter().filter(|id| !covered(id)) {
                let source = model.parameter_value(id);
                model.set_parameter_value(id, source + (value - source) * weight, 1.0);
            }
        }
    }
}

impl QueueMotion for Motion {
    fn fade_in_seconds(&self) -> f32 {
        self.fade_in_seconds
    }

    fn fade_out_seconds(&self) -> f32 {
        self.fade_out_seconds
    }

    fn duration(&self) -> Option<f32> {
        if self.looping || self.duration <= 0.0 {
            None
        } else {
            Some(self.duration)
        }
    }
}
