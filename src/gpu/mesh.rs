use bytemuck::{Pod, Zeroable};

use crate::model::Drawable;

#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, Pod, Zeroable)]
pub struct Vertex {
    pub position: [f32; 2],
    pub uv: [f32; 2],
}

impl Vertex {
    pub fn desc<'a>() -> wgpu::VertexBufferLayout<'a> {
        wgpu::VertexBufferLayout {
            array_stride: std::mem::size_of::<Vertex>() as wgpu::BufferAddress,
            step_mode: wgpu::VertexStepMode::Vertex,
            attributes: &[
                wgpu::VertexAttribute {
                    offset: 0,
                    shader_location: 0,
                    format: wgpu::VertexFormat::Float32x2,
                },
                wgpu::VertexAttribute {
                    offset: 8, // [f32; 2] is 8 bytes
                    shader_location: 1,
                    format: wgpu::VertexFormat::Float32x2,
                },
            ],
        }
    }
}

/// Interleave a drawable's current positions with its UVs.
pub fn drawable_vertices(drawable: &Drawable) -> impl Iterator<Item = Vertex> + '_ {
    drawable
        .vertex_positions()
        .iter()
        .zip(&drawable.uvs)
        .map(|(&position, &uv)| Vertex { position, uv })
}

/// Per-frame staging for vertex and index data shared by every draw.
#[derive(Default)]
pub struct FrameGeometry {
    pub vertices: Vec<Vertex>,
    pub indices: Vec<u16>,
}

impl FrameGeometry {
    pub fn clear(&mut self) {
        self.vertices.clear();
        self.indices.clear();
    }

    /// Append a drawable. Returns its index range and base vertex.
    pub fn push(&mut self, drawable: &Drawable) -> (std::ops::Range<u32>, i32) {
        let base_vertex = self.vertices.len() as i32;
        let first = self.indices.len() as u32;
        self.vertices.extend(drawable_vertices(drawable));
        self.indices.extend_from_slice(&drawable.indices);
        (first..self.indices.len() as u32, base_vertex)
    }

    /// Index bytes padded to the 4-byte copy alignment.
    pub fn index_bytes(&self) -> Vec<u8> {
        let mut bytes = bytemuck::cast_slice::<u16, u8>(&self.indices).to_vec();
        bytes.resize(bytes.len().next_multiple_of(wgpu::COPY_BUFFER_ALIGNMENT as usize), 0);
        bytes
    }
}
