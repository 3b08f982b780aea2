//! Puppet model: drawables, parameters and parts.
//!
//! The model blob referenced by a model definition is a JSON mesh document.
//! Parameters are plain range-bounded scalars; drawables deform linearly from
//! their rest pose through per-parameter bindings when [`Model::update`] runs.

use std::collections::HashMap;

use serde::Deserialize;

use crate::math::Rect;

/// How a drawable composites onto what is already in the target.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Deserialize)]
pub enum BlendMode {
    #[default]
    Normal,
    Additive,
    #[serde(alias = "Multiply")]
    Multiplicative,
}

impl BlendMode {
    pub const ALL: [BlendMode; 3] = [BlendMode::Normal, BlendMode::Additive, BlendMode::Multiplicative];
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CanvasInfo {
    pub width: f32,
    pub height: f32,
    #[serde(default = "default_pixels_per_unit")]
    pub pixels_per_unit: f32,
    #[serde(default)]
    pub origin_x: f32,
    #[serde(default)]
    pub origin_y: f32,
}

fn default_pixels_per_unit() -> f32 {
    1.0
}

impl Default for CanvasInfo {
    fn default() -> Self {
        Self {
            width: 2.0,
            height: 2.0,
            pixels_per_unit: 1.0,
            origin_x: 1.0,
            origin_y: 1.0,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ParameterDef {
    pub id: String,
    #[serde(default)]
    pub min: f32,
    #[serde(default = "default_one")]
    pub max: f32,
    #[serde(default)]
    pub default: f32,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct PartDef {
    pub id: String,
    #[serde(default = "default_one")]
    pub opacity: f32,
}

/// Linear deformation driven by one parameter.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Binding {
    pub parameter: String,
    #[serde(default)]
    pub translate: [f32; 2],
    #[serde(default)]
    pub opacity: f32,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct DrawableDef {
    pub id: String,
    #[serde(default)]
    pub texture: usize,
    #[serde(default)]
    pub render_order: i32,
    #[serde(default)]
    pub blend: BlendMode,
    /// Indices of the drawables that mask this one.
    #[serde(default)]
    pub masks: Vec<usize>,
    #[serde(default)]
    pub inverted_mask: bool,
    #[serde(default)]
    pub culling: bool,
    #[serde(default = "default_true")]
    pub visible: bool,
    #[serde(default = "default_one")]
    pub opacity: f32,
    #[serde(default)]
    pub part: Option<String>,
    /// Flat `[x0, y0, x1, y1, ...]`.
    pub positions: Vec<f32>,
    #[serde(default)]
    pub uvs: Vec<f32>,
    pub indices: Vec<u16>,
    #[serde(default)]
    pub bindings: Vec<Binding>,
}

/// The on-disk mesh document.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct PuppetMesh {
    #[serde(default)]
    pub version: u32,
    #[serde(default)]
    pub canvas: CanvasInfo,
    #[serde(default)]
    pub parameters: Vec<ParameterDef>,
    #[serde(default)]
    pub parts: Vec<PartDef>,
    pub drawables: Vec<DrawableDef>,
}

fn default_one() -> f32 {
    1.0
}

fn default_true() -> bool {
    true
}

#[derive(Clone, Debug)]
pub struct Parameter {
    pub id: String,
    pub min: f32,
    pub max: f32,
    pub default: f32,
    value: f32,
}

impl Parameter {
    pub fn value(&self) -> f32 {
        self.value
    }

    fn assign(&mut self, value: f32) {
        self.value = value.clamp(self.min, self.max);
    }
}

#[derive(Clone, Debug)]
pub struct Part {
    pub id: String,
    opacity: f32,
}

impl Part {
    pub fn opacity(&self) -> f32 {
        self.opacity
    }
}

/// One renderable mesh.
#[derive(Clone, Debug)]
pub struct Drawable {
    pub id: String,
    pub texture_index: usize,
    pub render_order: i32,
    pub blend_mode: BlendMode,
    pub masks: Vec<usize>,
    pub inverted_mask: bool,
    pub culling: bool,
    pub indices: Vec<u16>,
    pub uvs: Vec<[f32; 2]>,
    base_visible: bool,
    base_opacity: f32,
    base_positions: Vec<[f32; 2]>,
    part: Option<usize>,
    bindings: Vec<(usize, Binding)>,
    positions: Vec<[f32; 2]>,
    opacity: f32,
    positions_changed: bool,
}

impl Drawable {
    /// Current deformed vertex positions in model space.
    pub fn vertex_positions(&self) -> &[[f32; 2]] {
        &self.positions
    }

    pub fn opacity(&self) -> f32 {
        self.opacity
    }

    pub fn is_visible(&self) -> bool {
        self.base_visible && self.opacity > 0.0
    }

    pub fn vertex_positions_changed(&self) -> bool {
        self.positions_changed
    }

    pub fn bounds(&self) -> Option<Rect> {
        Rect::bounding(self.positions.iter().copied())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ModelError {
    #[error("invalid mesh document: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("drawable '{0}': {1}")]
    Drawable(String, String),
}

/// A loaded puppet with its live parameter state.
#[derive(Clone, Debug)]
pub struct Model {
    canvas: CanvasInfo,
    parameters: Vec<Parameter>,
    parameter_index: HashMap<String, usize>,
    saved_parameters: Vec<f32>,
    parts: Vec<Part>,
    part_index: HashMap<String, usize>,
    drawables: Vec<Drawable>,
    drawable_index: HashMap<String, usize>,
    opacity: f32,
    multiply_color: [f32; 4],
    screen_color: [f32; 4],
}

impl Model {
    pub fn from_json(bytes: &[u8]) -> Result<Self, ModelError> {
        let mesh: PuppetMesh = serde_json::from_slice(bytes)?;
        Self::from_mesh(mesh)
    }

    pub fn from_mesh(mesh: PuppetMesh) -> Result<Self, ModelError> {
        let parameters: Vec<Parameter> = mesh
            .parameters
            .into_iter()
            .map(|p| {
                let (min, max) = if p.min <= p.max { (p.min, p.max) } else { (p.max, p.min) };
                Parameter {
                    value: p.default.clamp(min, max),
                    default: p.default.clamp(min, max),
                    id: p.id,
                    min,
                    max,
                }
            })
            .collect();
        let parameter_index: HashMap<String, usize> = parameters
            .iter()
            .enumerate()
            .map(|(i, p)| (p.id.clone(), i))
            .collect();

        let parts: Vec<Part> = mesh
            .parts
            .into_iter()
            .map(|p| Part { id: p.id, opacity: p.opacity.clamp(0.0, 1.0) })
            .collect();
        let part_index: HashMap<String, usize> =
            parts.iter().enumerate().map(|(i, p)| (p.id.clone(), i)).collect();

        let drawable_count = mesh.drawables.len();
        let mut drawables = Vec::with_capacity(drawable_count);
        for def in mesh.drawables {
            if def.positions.len() % 2 != 0 {
                return Err(ModelError::Drawable(def.id, "odd position count".to_string()));
            }
            let positions: Vec<[f32; 2]> = def.positions.chunks_exact(2).map(|c| [c[0], c[1]]).collect();
            let mut uvs: Vec<[f32; 2]> = def.uvs.chunks_exact(2).map(|c| [c[0], c[1]]).collect();
            uvs.resize(positions.len(), [0.0, 0.0]);
            if let Some(&bad) = def.indices.iter().find(|&&i| i as usize >= positions.len()) {
                return Err(ModelError::Drawable(def.id, format!("index {} out of range", bad)));
            }
            if let Some(&bad) = def.masks.iter().find(|&&m| m >= drawable_count) {
                return Err(ModelError::Drawable(def.id, format!("mask {} out of range", bad)));
            }

            let part = def.part.as_ref().and_then(|p| part_index.get(p).copied());
            let bindings = def
                .bindings
                .into_iter()
                .filter_map(|b| match parameter_index.get(&b.parameter) {
                    Some(&i) => Some((i, b)),
                    None => {
                        log::warn!("Drawable '{}' binds unknown parameter '{}'", def.id, b.parameter);
                        None
                    }
                })
                .collect();

            drawables.push(Drawable {
                id: def.id,
                texture_index: def.texture,
                render_order: def.render_order,
                blend_mode: def.blend,
                masks: def.masks,
                inverted_mask: def.inverted_mask,
                culling: def.culling,
                indices: def.indices,
                uvs,
                base_visible: def.visible,
                base_opacity: def.opacity.clamp(0.0, 1.0),
                base_positions: positions.clone(),
                part,
                bindings,
                positions,
                opacity: def.opacity.clamp(0.0, 1.0),
                positions_changed: true,
            });
        }
        let drawable_index = drawables
            .iter()
            .enumerate()
            .map(|(i, d)| (d.id.clone(), i))
            .collect();

        let saved_parameters = parameters.iter().map(|p| p.value).collect();
        let mut model = Self {
            canvas: mesh.canvas,
            parameters,
            parameter_index,
            saved_parameters,
            parts,
            part_index,
            drawables,
            drawable_index,
            opacity: 1.0,
            multiply_color: [1.0, 1.0, 1.0, 1.0],
            screen_color: [0.0, 0.0, 0.0, 1.0],
        };
        model.update();
        Ok(model)
    }

    pub fn canvas(&self) -> &CanvasInfo {
        &self.canvas
    }

    pub fn canvas_width(&self) -> f32 {
        self.canvas.width
    }

    pub fn canvas_height(&self) -> f32 {
        self.canvas.height
    }

    pub fn pixels_per_unit(&self) -> f32 {
        self.canvas.pixels_per_unit
    }

    // --- parameters ---

    pub fn parameters(&self) -> &[Parameter] {
        &self.parameters
    }

    pub fn parameter_index(&self, id: &str) -> Option<usize> {
        self.parameter_index.get(id).copied()
    }

    /// Current value, or 0 for an unknown id.
    pub fn parameter_value(&self, id: &str) -> f32 {
        self.parameter_index(id)
            .map_or(0.0, |i| self.parameters[i].value)
    }

    /// `value = current * (1 - weight) + value * weight`
    pub fn set_parameter_value(&mut self, id: &str, value: f32, weight: f32) {
        if let Some(i) = self.parameter_index(id) {
            let p = &mut self.parameters[i];
            let blended = if weight >= 1.0 { value } else { p.value * (1.0 - weight) + value * weight };
            p.assign(blended);
        }
    }

    /// `value = current + value * weight`
    pub fn add_parameter_value(&mut self, id: &str, value: f32, weight: f32) {
        if let Some(i) = self.parameter_index(id) {
            let p = &mut self.parameters[i];
            p.assign(p.value + value * weight);
        }
    }

    /// `value = current * (1 + (value - 1) * weight)`
    pub fn multiply_parameter_value(&mut self, id: &str, value: f32, weight: f32) {
        if let Some(i) = self.parameter_index(id) {
            let p = &mut self.parameters[i];
            p.assign(p.value * (1.0 + (value - 1.0) * weight));
        }
    }

    pub fn save_parameters(&mut self) {
        self.saved_parameters.clear();
        self.saved_parameters.extend(self.parameters.iter().map(|p| p.value));
    }

    pub fn load_parameters(&mut self) {
        for (p, &v) in self.parameters.iter_mut().zip(&self.saved_parameters) {
            p.value = v;
        }
    }

    // --- parts ---

    pub fn parts(&self) -> &[Part] {
        &self.parts
    }

    pub fn part_index(&self, id: &str) -> Option<usize> {
        self.part_index.get(id).copied()
    }

    pub fn part_opacity(&self, index: usize) -> f32 {
        self.parts.get(index).map_or(0.0, |p| p.opacity)
    }

    pub fn set_part_opacity(&mut self, index: usize, opacity: f32) {
        if let Some(p) = self.parts.get_mut(index) {
            p.opacity = opacity.clamp(0.0, 1.0);
        }
    }

    // --- drawables ---

    pub fn drawables(&self) -> &[Drawable] {
        &self.drawables
    }

    pub fn drawable(&self, index: usize) -> Option<&Drawable> {
        self.drawables.get(index)
    }

    pub fn drawable_count(&self) -> usize {
        self.drawables.len()
    }

    pub fn drawable_index(&self, id: &str) -> Option<usize> {
        self.drawable_index.get(id).copied()
    }

    /// Largest texture index referenced by any drawable, plus one.
    pub fn texture_slot_count(&self) -> usize {
        self.drawables.iter().map(|d| d.texture_index + 1).max().unwrap_or(0)
    }

    // --- colors ---

    pub fn opacity(&self) -> f32 {
        self.opacity
    }

    pub fn set_opacity(&mut self, opacity: f32) {
        self.opacity = opacity.clamp(0.0, 1.0);
    }

    /// Base color for a drawable, premultiplied by its final opacity.
    pub fn drawable_color(&self, index: usize) -> [f32; 4] {
        let a = self.opacity * self.drawables.get(index).map_or(0.0, |d| d.opacity);
        [a, a, a, a]
    }

    pub fn multiply_color(&self) -> [f32; 4] {
        self.multiply_color
    }

    pub fn screen_color(&self) -> [f32; 4] {
        self.screen_color
    }

    /// Deform every drawable from the current parameter and part state.
    pub fn update(&mut self) {
        let params = &self.parameters;
        let parts = &self.parts;
        for d in &mut self.drawables {
            let mut offset = [0.0f32; 2];
            let mut opacity = d.base_opacity;
            for (pi, b) in &d.bindings {
                let v = params[*pi].value;
                offset[0] += b.translate[0] * v;
                offset[1] += b.translate[1] * v;
                opacity += b.opacity * v;
            }
            if let Some(part) = d.part {
                opacity *= parts[part].opacity;
            }
            d.opacity = opacity.clamp(0.0, 1.0);

            let mut changed = false;
            for (dst, base) in d.positions.iter_mut().zip(&d.base_positions) {
                let p = [base[0] + offset[0], base[1] + offset[1]];
                if *dst != p {
                    *dst = p;
                    changed = true;
                }
            }
            d.positions_changed = changed;
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Square drawable centred on (cx, cy) with half-size `h`.
    pub(crate) fn quad_json(id: &str, cx: f32, cy: f32, h: f32, masks: &[usize], order: i32) -> serde_json::Value {
        serde_json::json!({
            "Id": id,
            "RenderOrder": order,
            "Masks": masks,
            "Positions": [cx - h, cy - h, cx + h, cy - h, cx + h, cy + h, cx - h, cy + h],
            "Uvs": [0.0, 0.0, 1.0, 0.0, 1.0, 1.0, 0.0, 1.0],
            "Indices": [0, 1, 2, 0, 2, 3]
        })
    }

    pub(crate) fn model_from(value: serde_json::Value) -> Model {
        Model::from_json(value.to_string().as_bytes()).unwrap()
    }

    #[test]
    fn test_parameter_ops_clamp_and_blend() {
        let mut model = model_from(serde_json::json!({
            "Parameters": [{"Id": "ParamA", "Min": -1.0, "Max": 1.0, "Default": 0.0}],
            "Drawables": []
        }));
        model.set_parameter_value("ParamA", 0.8, 0.5);
        assert!((model.parameter_value("ParamA") - 0.4).abs() < 1e-6);
        model.add_parameter_value("ParamA", 1.0, 1.0);
        assert!((model.parameter_value("ParamA") - 1.0).abs() < 1e-6);
        model.multiply_parameter_value("ParamA", 0.5, 1.0);
        assert!((model.parameter_value("ParamA") - 0.5).abs() < 1e-6);
        // unknown ids are ignored
        model.set_parameter_value("Missing", 1.0, 1.0);
        assert_eq!(model.parameter_value("Missing"), 0.0);
    }

    #[test]
    fn test_save_and_load_parameters() {
        let mut model = model_from(serde_json::json!({
            "Parameters": [{"Id": "P", "Min": 0.0, "Max": 10.0, "Default": 1.0}],
            "Drawables": []
        }));
        model.save_parameters();
        model.set_parameter_value("P", 7.0, 1.0);
        model.load_parameters();
        assert!((model.parameter_value("P") - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_bindings_deform_drawable() {
        let mut quad = quad_json("Mouth", 0.0, 0.0, 0.5, &[], 0);
        quad["Bindings"] = serde_json::json!([{"Parameter": "ParamMouthOpenY", "Translate": [0.0, -0.2], "Opacity": 0.0}]);
        let mut model = model_from(serde_json::json!({
            "Parameters": [{"Id": "ParamMouthOpenY", "Min": 0.0, "Max": 1.0, "Default": 0.0}],
            "Drawables": [quad]
        }));
        let before = model.drawable(0).unwrap().bounds().unwrap();
        model.set_parameter_value("ParamMouthOpenY", 1.0, 1.0);
        model.update();
        let d = model.drawable(0).unwrap();
        assert!(d.vertex_positions_changed());
        let after = d.bounds().unwrap();
        assert!((after.y - (before.y - 0.2)).abs() < 1e-6);
    }

    #[test]
    fn test_part_opacity_hides_drawable() {
        let mut quad = quad_json("Arm", 0.0, 0.0, 0.5, &[], 0);
        quad["Part"] = serde_json::json!("PartArmA");
        let mut model = model_from(serde_json::json!({
            "Parts": [{"Id": "PartArmA", "Opacity": 1.0}],
            "Drawables": [quad]
        }));
        assert!(model.drawable(0).unwrap().is_visible());
        model.set_part_opacity(0, 0.0);
        model.update();
        assert!(!model.drawable(0).unwrap().is_visible());
    }

    #[test]
    fn test_rejects_out_of_range_mask() {
        let doc = serde_json::json!({ "Drawables": [quad_json("A", 0.0, 0.0, 1.0, &[3], 0)] });
        assert!(Model::from_json(doc.to_string().as_bytes()).is_err());
    }
}
