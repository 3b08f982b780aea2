//! Facial expressions (`*.exp3.json`) and their accumulate-then-compose blending.

use std::rc::Rc;

use serde::Deserialize;

use super::{MotionHandle, MotionQueue, Priority, QueueMotion};
use crate::model::Model;

const DEFAULT_FADE_SECONDS: f32 = 1.0;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ExpressionBlend {
    #[default]
    Add,
    Multiply,
    Overwrite,
}

impl ExpressionBlend {
    fn parse(value: Option<&str>) -> Self {
        match value {
            Some("Multiply") => ExpressionBlend::Multiply,
            Some("Overwrite") => ExpressionBlend::Overwrite,
            _ => ExpressionBlend::Add,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ExpressionJson {
    #[serde(default)]
    fade_in_time: Option<f32>,
    #[serde(default)]
    fade_out_time: Option<f32>,
    #[serde(default)]
    parameters: Vec<ExpressionParameterJson>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ExpressionParameterJson {
    id: String,
    value: f32,
    #[serde(default)]
    blend: Option<String>,
}

#[derive(Clone, Debug)]
pub struct ExpressionParameter {
    pub id: String,
    pub value: f32,
    pub blend: ExpressionBlend,
}

/// A flat per-parameter blend spec.
#[derive(Clone, Debug)]
pub struct Expression {
    fade_in_seconds: f32,
    fade_out_seconds: f32,
    parameters: Vec<ExpressionParameter>,
}

impl Expression {
    pub fn from_json(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        let json: ExpressionJson = serde_json::from_slice(bytes)?;
        Ok(Self {
            fade_in_seconds: json.fade_in_time.filter(|v| *v >= 0.0).unwrap_or(DEFAULT_FADE_SECONDS),
            fade_out_seconds: json.fade_out_time.filter(|v| *v >= 0.0).unwrap_or(DEFAULT_FADE_SECONDS),
            parameters: json
                .parameters
                .into_iter()
                .map(|p| ExpressionParameter {
                    blend: ExpressionBlend::parse(p.blend.as_deref()),
                    id: p.id,
                    value: p.value,
                })
                .collect(),
        })
    }

    pub fn parameters(&self) -> &[ExpressionParameter] {
        &self.parameters
    }

    fn parameter(&self, id: &str) -> Option<&ExpressionParameter> {
        self.parameters.iter().find(|p| p.id == id)
    }
}

impl QueueMotion for Expression {
    fn fade_in_seconds(&self) -> f32 {
        self.fade_in_seconds
    }

    fn fade_out_seconds(&self) -> f32 {
        self.fade_out_seconds
    }

    fn duration(&self) -> Option<f32> {
        None
    }
}

/// Per-parameter accumulator rebuilt every tick from all active expressions.
#[derive(Clone, Debug, PartialEq)]
pub struct ExpressionParameterValue {
    pub id: String,
    pub additive: f32,
    pub multiply: f32,
    pub overwrite: f32,
}

fn lerp(a: f32, b: f32, t: f32) -> f32 {
    a * (1.0 - t) + b * t
}

/// Plays any number of expressions at once, folding their contributions together.
#[derive(Default)]
pub struct ExpressionManager {
    queue: MotionQueue<Expression>,
    values: Vec<ExpressionParameterValue>,
}

impl ExpressionManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn start(&mut self, expression: Rc<Expression>) -> MotionHandle {
        self.queue.start(expression, Priority::Force)
    }

    pub fn entry_count(&self) -> usize {
        self.queue.len()
    }

    pub fn values(&self) -> &[ExpressionParameterValue] {
        &self.values
    }

    pub fn stop_all(&mut self) {
        self.queue.stop_all();
    }

    /// Blend every active expression into the model. Returns whether anything was applied.
    pub fn update(&mut self, model: &mut Model, delta_seconds: f32) -> bool {
        let now = self.queue.advance(delta_seconds);

        // register ids seen for the first time
        for entry in self.queue.entries() {
            for p in entry.motion().parameters() {
                if model.parameter_index(&p.id).is_none() || self.values.iter().any(|v| v.id == p.id) {
                    continue;
                }
                self.values.push(ExpressionParameterValue {
                    id: p.id.clone(),
                    additive: 0.0,
                    multiply: 1.0,
                    overwrite: model.parameter_value(&p.id),
                });
            }
        }
        for v in &mut self.values {
            v.additive = 0.0;
            v.multiply = 1.0;
        }

        let mut expression_weight = 0.0;
        let mut updated = false;
        for (index, entry) in self.queue.entries_mut().iter_mut().enumerate() {
            entry.begin(now);
            let fade_weight = entry.update_fade_weight(now);
            Self::accumulate(&mut self.values, model, entry.motion(), index, fade_weight);
            expression_weight += entry.fade_in_weight(now);
            updated = true;
        }

        self.queue.retire();

        if !updated {
            return false;
        }
        let weight = expression_weight.min(1.0);
        for v in &self.values {
            model.set_parameter_value(&v.id, (v.overwrite + v.additive) * v.multiply, weight);
        }
        true
    }

    /// Fold one expression into the accumulators. The first entry assigns;
    /// later ones blend toward their own values by `fade_weight`.
    fn accumulate(
        values: &mut [ExpressionParameterValue],
        model: &Model,
        expression: &Expression,
        index: usize,
        fade_weight: f32,
    ) {
        for v in values.iter_mut() {
            let current = model.parameter_value(&v.id);
            let (additive, multiply, overwrite) = match expression.parameter(&v.id) {
                Some(p) => match p.blend {
                    ExpressionBlend::Add => (p.value, 1.0, current),
                    ExpressionBlend::Multiply => (0.0, p.value, current),
                    ExpressionBlend::Overwrite => (0.0, 1.0, p.value),
                },
                None => (0.0, 1.0, current),
            };

            if index == 0 {
                v.additive = additive;
                v.multiply = multiply;
                v.overwrite = overwrite;
            } else {
                v.additive = lerp(v.additive, additive, fade_weight);
                v.multiply = lerp(v.multiply, multiply, fade_weight);
                v.overwrite = lerp(v.overwrite, overwrite, fade_weight);
            }
        }
    }
}
