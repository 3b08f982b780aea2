use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::gpu::mesh::Vertex;
use crate::render::{BlendFactor, BlendFactors, ProgramDesc, ShaderKey, MaskState};

/// Set when a validation error for a pipeline arrives after it was handed out.
#[derive(Clone, Default, Debug)]
pub struct BuildStatus(Arc<AtomicBool>);

impl BuildStatus {
    pub fn mark_failed(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_failed(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// One shader variant, built for both cull modes.
pub struct ShaderSet {
    pub culled: wgpu::RenderPipeline,
    pub unculled: wgpu::RenderPipeline,
    pub status: BuildStatus,
}

impl ShaderSet {
    pub fn pipeline(&self, culling: bool) -> &wgpu::RenderPipeline {
        if culling {
            &self.culled
        } else {
            &self.unculled
        }
    }
}

fn to_wgpu_factor(factor: BlendFactor) -> wgpu::BlendFactor {
    match factor {
        BlendFactor::Zero => wgpu::BlendFactor::Zero,
        BlendFactor::One => wgpu::BlendFactor::One,
        BlendFactor::Dst => wgpu::BlendFactor::Dst,
        BlendFactor::OneMinusSrc => wgpu::BlendFactor::OneMinusSrc,
        BlendFactor::OneMinusSrcAlpha => wgpu::BlendFactor::OneMinusSrcAlpha,
    }
}

pub fn to_blend_state(factors: &BlendFactors) -> wgpu::BlendState {
    wgpu::BlendState {
        color: wgpu::BlendComponent {
            src_factor: to_wgpu_factor(factors.src_color),
            dst_factor: to_wgpu_factor(factors.dst_color),
            operation: wgpu::BlendOperation::Add,
        },
        alpha: wgpu::BlendComponent {
            src_factor: to_wgpu_factor(factors.src_alpha),
            dst_factor: to_wgpu_factor(factors.dst_alpha),
            operation: wgpu::BlendOperation::Add,
        },
    }
}

/// Vertex and fragment entry points in `shader.wgsl` for a variant.
pub fn entry_points(key: ShaderKey) -> (&'static str, &'static str) {
    match key {
        ShaderKey::SetupMask => ("vs_mask", "fs_mask"),
        ShaderKey::Draw { mask: MaskState::None, .. } => ("vs_draw", "fs_draw"),
        ShaderKey::Draw { mask: MaskState::Masked, .. } => ("vs_draw", "fs_draw_masked"),
        ShaderKey::Draw { mask: MaskState::MaskedInverted, .. } => ("vs_draw", "fs_draw_masked_inverted"),
    }
}

pub fn create_render_pipeline(
    device: &wgpu::Device,
    layout: &wgpu::PipelineLayout,
    shader: &wgpu::ShaderModule,
    desc: &ProgramDesc,
    color_format: wgpu::TextureFormat,
    culling: bool,
) -> wgpu::RenderPipeline {
    let (vs, fs) = entry_points(desc.key);
    let label = format!("{} Pipeline{}", desc.key.label(), if culling { " (culled)" } else { "" });

    device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
        label: Some(&label),
        layout: Some(layout),
        vertex: wgpu::VertexState {
            module: shader,
            entry_point: Some(vs),
            buffers: &[Vertex::desc()],
            compilation_options: wgpu::PipelineCompilationOptions::default(),
        },
        fragment: Some(wgpu::FragmentState {
            module: shader,
            entry_point: Some(fs),
            targets: &[Some(wgpu::ColorTargetState {
                format: color_format,
                blend: Some(to_blend_state(&desc.blend)),
                write_mask: wgpu::ColorWrites::ALL,
            })],
            compilation_options: wgpu::PipelineCompilationOptions::default(),
        }),
        primitive: wgpu::PrimitiveState {
            topology: wgpu::PrimitiveTopology::TriangleList,
            strip_index_format: None,
            front_face: wgpu::FrontFace::Ccw,
            cull_mode: if culling { Some(wgpu::Face::Back) } else { None },
            // Setting this to anything other than Fill requires Features::NON_FILL_POLYGON_MODE
            polygon_mode: wgpu::PolygonMode::Fill,
            unclipped_depth: false,
            conservative: false,
        },
        depth_stencil: None,
        multisample: wgpu::MultisampleState {
            count: 1,
            mask: !0,
            alpha_to_coverage_enabled: false,
        },
        multiview: None,
        cache: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::BlendMode;

    #[test]
    fn test_multiplicative_blend_state() {
        let state = to_blend_state(&BlendFactors::for_blend_mode(BlendMode::Multiplicative));
        assert_eq!(state.color.src_factor, wgpu::BlendFactor::Dst);
        assert_eq!(state.color.dst_factor, wgpu::BlendFactor::OneMinusSrcAlpha);
        assert_eq!(state.alpha.src_factor, wgpu::BlendFactor::Zero);
        assert_eq!(state.alpha.dst_factor, wgpu::BlendFactor::One);
    }

    #[test]
    fn test_build_status_is_shared_between_clones() {
        let status = BuildStatus::default();
        let reporter = status.clone();
        assert!(!status.is_failed());
        reporter.mark_failed();
        assert!(status.is_failed());
    }

    #[test]
    fn test_every_variant_has_entry_points() {
        for key in ShaderKey::all() {
            let (vs, fs) = entry_points(key);
            assert!(vs.starts_with("vs_") && fs.starts_with("fs_"));
        }
    }
}
