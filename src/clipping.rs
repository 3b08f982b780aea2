//! Clipping mask allocation.
//!
//! Drawables that share an identical set of masking drawables share one
//! [`ClippingContext`]. Every frame the in-use contexts are packed into the
//! RGBA channels of a small number of offscreen mask textures, each channel
//! further split into a grid when several contexts land on it.

use glam::Mat4;

use crate::math::{scale_relative, translate_relative, Rect};
use crate::model::Model;

/// Channel selector written by mask generation and read back when drawing.
pub const CHANNEL_COLORS: [[f32; 4]; 4] = [
    [1.0, 0.0, 0.0, 0.0],
    [0.0, 1.0, 0.0, 0.0],
    [0.0, 0.0, 1.0, 0.0],
    [0.0, 0.0, 0.0, 1.0],
];

/// Fraction of the clipped bounds added on every side before fitting into the layout cell.
pub const MASK_MARGIN: f32 = 0.05;

pub const MAX_MASKS_SINGLE_TEXTURE: usize = 36;
pub const MAX_MASKS_PER_TEXTURE_MULTI: usize = 32;
pub const DEFAULT_MASK_BUFFER_SIZE: u32 = 256;

const CHANNEL_COUNT: usize = 4;
const MAX_GRID_CELLS: usize = 9;

/// Where a mask lives and how to map model space into it.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct MaskLayout {
    pub buffer_index: usize,
    pub channel: usize,
    pub bounds: Rect,
    pub matrix_for_mask: Mat4,
    pub matrix_for_draw: Mat4,
}

impl MaskLayout {
    pub fn channel_color(&self) -> [f32; 4] {
        CHANNEL_COLORS[self.channel % CHANNEL_COUNT]
    }
}

#[derive(Clone, Debug)]
pub struct ClippingContext {
    mask_drawables: Vec<usize>,
    clipped_drawables: Vec<usize>,
    is_using: bool,
    all_clipped_draw_rect: Rect,
    overflowed: bool,
    layout: MaskLayout,
}

impl ClippingContext {
    fn new(mask_drawables: Vec<usize>) -> Self {
        Self {
            mask_drawables,
            clipped_drawables: Vec::new(),
            is_using: false,
            all_clipped_draw_rect: Rect::default(),
            overflowed: false,
            layout: MaskLayout {
                buffer_index: 0,
                channel: 0,
                bounds: Rect::UNIT,
                matrix_for_mask: Mat4::IDENTITY,
                matrix_for_draw: Mat4::IDENTITY,
            },
        }
    }

    /// Same masking set, ignoring order.
    fn has_mask_set(&self, masks: &[usize]) -> bool {
        self.mask_drawables.len() == masks.len() && masks.iter().all(|m| self.mask_drawables.contains(m))
    }

    pub fn mask_drawables(&self) -> &[usize] {
        &self.mask_drawables
    }

    pub fn clipped_drawables(&self) -> &[usize] {
        &self.clipped_drawables
    }

    pub fn is_using(&self) -> bool {
        self.is_using
    }

    pub fn all_clipped_draw_rect(&self) -> Rect {
        self.all_clipped_draw_rect
    }

    pub fn is_overflowed(&self) -> bool {
        self.overflowed
    }

    pub fn layout(&self) -> &MaskLayout {
        &self.layout
    }

    /// Union of the current bounds of every clipped drawable.
    fn calc_clipped_draw_total_bounds(&mut self, model: &Model) {
        let points = self
            .clipped_drawables
            .iter()
            .filter_map(|&i| model.drawable(i))
            .flat_map(|d| d.vertex_positions().iter().copied());
        match Rect::bounding(points) {
            Some(rect) => {
                self.all_clipped_draw_rect = rect;
                self.is_using = true;
            }
            None => {
                self.all_clipped_draw_rect = Rect::default();
                self.is_using = false;
            }
        }
    }
}

/// Build the mask and draw matrices that fit `model_bounds` into `layout_bounds`.
fn fit_matrices(layout_bounds: Rect, model_bounds: Rect, scale_x: f32, scale_y: f32) -> (Mat4, Mat4) {
    let draw = translate_relative(Mat4::IDENTITY, layout_bounds.x, layout_bounds.y);
    let draw = scale_relative(draw, scale_x, scale_y);
    let draw = translate_relative(draw, -model_bounds.x, -model_bounds.y);

    // texture space [0, 1] to clip space [-1, 1]
    let to_clip = scale_relative(translate_relative(Mat4::IDENTITY, -1.0, -1.0), 2.0, 2.0);
    (to_clip * draw, draw)
}

fn ratio(num: f32, den: f32) -> f32 {
    if den > 0.0 {
        num / den
    } else {
        0.0
    }
}

/// Grid cell `index` of a channel split into `count` cells.
fn grid_cell(count: usize, index: usize) -> Rect {
    match count {
        0 | 1 => Rect::UNIT,
        2 => Rect::new((index % 2) as f32 * 0.5, 0.0, 0.5, 1.0),
        3 | 4 => Rect::new((index % 2) as f32 * 0.5, (index / 2) as f32 * 0.5, 0.5, 0.5),
        _ => {
            let third = 1.0 / 3.0;
            Rect::new((index % 3) as f32 * third, (index / 3) as f32 * third, third, third)
        }
    }
}

/// Owns every clipping context of one model and lays them out each frame.
pub struct ClippingManager {
    contexts: Vec<ClippingContext>,
    context_for_draw: Vec<Option<usize>>,
    render_texture_count: usize,
    masks_per_texture: usize,
    mask_buffer_size: u32,
    last_overflow: usize,
    capacity_errors: usize,
}

impl ClippingManager {
    /// `masks_per_texture` defaults to 36 for a single texture and 32 per texture otherwise.
    pub fn new(render_texture_count: usize, masks_per_texture: Option<usize>, mask_buffer_size: u32) -> Self {
        let render_texture_count = render_texture_count.max(1);
        let default_cap = if render_texture_count == 1 {
            MAX_MASKS_SINGLE_TEXTURE
        } else {
            MAX_MASKS_PER_TEXTURE_MULTI
        };
        let masks_per_texture = masks_per_texture
            .unwrap_or(default_cap)
            .clamp(1, CHANNEL_COUNT * MAX_GRID_CELLS);
        Self {
            contexts: Vec::new(),
            context_for_draw: Vec::new(),
            render_texture_count,
            masks_per_texture,
            mask_buffer_size: mask_buffer_size.max(1),
            last_overflow: 0,
            capacity_errors: 0,
        }
    }

    /// Register one context per distinct masking set.
    pub fn initialize(&mut self, model: &Model) {
        self.contexts.clear();
        self.context_for_draw = vec![None; model.drawable_count()];

        for (i, drawable) in model.drawables().iter().enumerate() {
            if drawable.masks.is_empty() {
                continue;
            }
            let index = match self.find_same_clip(&drawable.masks) {
                Some(index) => index,
                None => {
                    self.contexts.push(ClippingContext::new(drawable.masks.clone()));
                    self.contexts.len() - 1
                }
            };
            self.contexts[index].clipped_drawables.push(i);
            self.context_for_draw[i] = Some(index);
        }
        log::debug!(
            "Clipping: {} contexts for {} drawables",
            self.contexts.len(),
            model.drawable_count()
        );
    }

    fn find_same_clip(&self, masks: &[usize]) -> Option<usize> {
        self.contexts.iter().position(|c| c.has_mask_set(masks))
    }

    pub fn contexts(&self) -> &[ClippingContext] {
        &self.contexts
    }

    pub fn context_index_for_drawable(&self, drawable: usize) -> Option<usize> {
        self.context_for_draw.get(drawable).copied().flatten()
    }

    pub fn context_for_drawable(&self, drawable: usize) -> Option<&ClippingContext> {
        self.context_index_for_drawable(drawable)
            .and_then(|i| self.contexts.get(i))
    }

    pub fn render_texture_count(&self) -> usize {
        self.render_texture_count
    }

    pub fn mask_buffer_size(&self) -> u32 {
        self.mask_buffer_size
    }

    /// Total number of contexts that fit before the fallback kicks in.
    pub fn capacity(&self) -> usize {
        self.masks_per_texture * self.render_texture_count
    }

    /// How many times a capacity overflow has been reported.
    pub fn capacity_error_count(&self) -> usize {
        self.capacity_errors
    }

    fn update_bounds(&mut self, model: &Model) -> usize {
        for context in &mut self.contexts {
            context.calc_clipped_draw_total_bounds(model);
        }
        self.contexts.iter().filter(|c| c.is_using).count()
    }

    /// Buffer mode: lay out every in-use context and compute its matrices.
    /// Returns the number of contexts in use.
    pub fn setup_clipping_context(&mut self, model: &Model) -> usize {
        let using = self.update_bounds(model);
        if using == 0 {
            return 0;
        }
        self.setup_layout_bounds();

        for context in self.contexts.iter_mut().filter(|c| c.is_using) {
            let mut bounds = context.all_clipped_draw_rect;
            bounds.expand(bounds.width * MASK_MARGIN, bounds.height * MASK_MARGIN);
            let cell = context.layout.bounds;
            let scale_x = ratio(cell.width, bounds.width);
            let scale_y = ratio(cell.height, bounds.height);
            let (mask, draw) = fit_matrices(cell, bounds, scale_x, scale_y);
            context.layout.matrix_for_mask = mask;
            context.layout.matrix_for_draw = draw;
        }
        using
    }

    /// High-precision mode: every context uses the whole of texture 0, channel 0;
    /// matrices are produced per drawable by [`Self::layout_for_drawable`].
    pub fn setup_high_precision(&mut self, model: &Model) -> usize {
        let using = self.update_bounds(model);
        for context in &mut self.contexts {
            context.overflowed = false;
            context.layout.buffer_index = 0;
            context.layout.channel = 0;
            context.layout.bounds = Rect::UNIT;
        }
        using
    }

    /// Mask layout fitted to one clipped drawable's own bounds.
    ///
    /// Small drawables are rendered at their native pixel density instead of
    /// being stretched over the full mask texture.
    pub fn layout_for_drawable(&self, model: &Model, drawable: usize) -> Option<MaskLayout> {
        let context = self.context_for_drawable(drawable)?;
        let mut bounds = model.drawable(drawable)?.bounds()?;
        let ppu = model.pixels_per_unit();
        let cell = Rect::UNIT;
        let physical_w = cell.width * self.mask_buffer_size as f32;
        let physical_h = cell.height * self.mask_buffer_size as f32;

        let scale_x = if bounds.width * ppu > physical_w {
            bounds.expand(bounds.width * MASK_MARGIN, 0.0);
            ratio(cell.width, bounds.width)
        } else {
            ratio(ppu, physical_w)
        };
        let scale_y = if bounds.height * ppu > physical_h {
            bounds.expand(0.0, bounds.height * MASK_MARGIN);
            ratio(cell.height, bounds.height)
        } else {
            ratio(ppu, physical_h)
        };

        let (matrix_for_mask, matrix_for_draw) = fit_matrices(cell, bounds, scale_x, scale_y);
        Some(MaskLayout {
            buffer_index: context.layout.buffer_index,
            channel: context.layout.channel,
            bounds: cell,
            matrix_for_mask,
            matrix_for_draw,
        })
    }

    /// Assign texture, channel and grid cell to every in-use context, in registration order.
    fn setup_layout_bounds(&mut self) {
        let using: Vec<usize> = (0..self.contexts.len()).filter(|&i| self.contexts[i].is_using).collect();
        let capacity = self.capacity();
        let placed = using.len().min(capacity);
        let overflow = using.len() - placed;

        let rt_count = self.render_texture_count;
        let cells_per_channel = self.masks_per_texture.div_ceil(CHANNEL_COUNT).min(MAX_GRID_CELLS);
        let per_texture = placed.div_ceil(rt_count) as isize;
        let reduce = (placed % rt_count) as isize;
        let div = per_texture / CHANNEL_COUNT as isize;
        let modulo = per_texture % CHANNEL_COUNT as isize;
        let check_channel = modulo + if div < 1 { -1 } else { 0 };

        let mut next = 0usize;
        for rt in 0..rt_count {
            for channel in 0..CHANNEL_COUNT {
                let mut count = div + if (channel as isize) < modulo { 1 } else { 0 };
                if channel as isize == check_channel && reduce > 0 && rt as isize >= reduce {
                    count -= 1;
                }
                let count = count.max(0) as usize;
                debug_assert!(count <= cells_per_channel);

                for cell in 0..count {
                    let Some(&ci) = using.get(next) else { break };
                    next += 1;
                    let context = &mut self.contexts[ci];
                    context.overflowed = false;
                    context.layout.buffer_index = rt;
                    context.layout.channel = channel;
                    context.layout.bounds = grid_cell(count, cell);
                }
            }
        }

        for &ci in &using[next..] {
            let context = &mut self.contexts[ci];
            context.overflowed = true;
            context.layout.buffer_index = 0;
            context.layout.channel = 0;
            context.layout.bounds = Rect::UNIT;
        }

        if overflow > 0 && overflow != self.last_overflow {
            self.capacity_errors += 1;
            log::error!(
                "Clipping mask capacity exceeded: {} groups in use, capacity {} ({} per texture x {} textures); {} groups fall back to channel 0",
                using.len(),
                capacity,
                self.masks_per_texture,
                rt_count,
                overflow
            );
        }
        self.last_overflow = overflow;
    }
}
