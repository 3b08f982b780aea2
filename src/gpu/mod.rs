pub mod mesh;
pub mod pipeline;
pub mod renderer;
pub mod texture;

pub use renderer::WgpuBackend;
