pub mod gpu;
pub mod render;
pub mod clipping;
pub mod config;
pub mod math;
pub mod texture;

// Model data and animation
pub mod model;
pub mod setting;
pub mod motion;
pub mod effects;

// Audio
pub mod wav;
pub mod lipsync;

// Loading and the per-character service
pub mod loader;
pub mod avatar;
pub mod session;

#[cfg(not(target_arch = "wasm32"))]
pub mod cli;

#[cfg(target_arch = "wasm32")]
pub mod wasm;
