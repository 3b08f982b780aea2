use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};

use crate::clipping::ClippingManager;
use crate::config::AvatarConfig;
use crate::gpu::texture::TEXTURE_FORMAT;
use crate::gpu::WgpuBackend;
use crate::loader::{self, FsFetcher, LoadStage};
use crate::motion::Priority;
use crate::session::Session;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Render frames to disk
    Render {
        /// Model directory
        #[arg(long)]
        model: PathBuf,

        /// Model definition file inside the model directory
        #[arg(long)]
        file: String,

        /// Output directory for frames
        #[arg(long)]
        out: PathBuf,

        /// WAV file driving lip sync
        #[arg(long)]
        audio: Option<PathBuf>,

        /// Motion to play: group and index
        #[arg(long, num_args = 2, value_names = ["GROUP", "INDEX"])]
        motion: Option<Vec<String>>,

        /// Expression name to apply
        #[arg(long)]
        expression: Option<String>,

        /// Frames per second
        #[arg(long, default_value_t = 30.0)]
        fps: f32,

        /// Duration in seconds
        #[arg(long, default_value_t = 3.0)]
        duration: f32,

        /// Output width
        #[arg(long, default_value_t = 800)]
        width: u32,

        /// Output height
        #[arg(long, default_value_t = 800)]
        height: u32,

        /// JSON avatar configuration
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Load a model and print its drawables and mask layout
    Inspect {
        /// Model directory
        #[arg(long)]
        model: PathBuf,

        /// Model definition file inside the model directory
        #[arg(long)]
        file: String,

        /// JSON avatar configuration
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

pub fn run() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Render { model, file, out, audio, motion, expression, fps, duration, width, height, config } => {
            let options = RenderOptions {
                audio,
                motion,
                expression,
                fps,
                duration,
                width,
                height,
            };
            pollster::block_on(render_offline(&model, &file, &out, read_config(config.as_deref())?, options))?;
        }
        Commands::Inspect { model, file, config } => {
            pollster::block_on(inspect(&model, &file, read_config(config.as_deref())?))?;
        }
    }
    Ok(())
}

fn read_config(path: Option<&Path>) -> Result<AvatarConfig> {
    match path {
        Some(path) => {
            let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
            Ok(AvatarConfig::from_json(&text)?)
        }
        None => Ok(AvatarConfig::default()),
    }
}

struct RenderOptions {
    audio: Option<PathBuf>,
    motion: Option<Vec<String>>,
    expression: Option<String>,
    fps: f32,
    duration: f32,
    width: u32,
    height: u32,
}

async fn render_offline(model_dir: &Path, file: &str, out_dir: &Path, config: AvatarConfig, options: RenderOptions) -> Result<()> {
    let RenderOptions { width, height, fps, .. } = options;
    let total_frames = (options.duration * fps).ceil() as usize;
    let dt = 1.0 / fps;

    std::fs::create_dir_all(out_dir)?;

    // WGPU Init
    let instance = wgpu::Instance::new(wgpu::InstanceDescriptor::default());
    let adapter = instance
        .request_adapter(&wgpu::RequestAdapterOptions {
            power_preference: wgpu::PowerPreference::HighPerformance,
            compatible_surface: None, // Headless
            force_fallback_adapter: false,
        })
        .await
        .ok_or_else(|| anyhow::anyhow!("No adapter found"))?;

    let (device, queue) = adapter
        .request_device(&wgpu::DeviceDescriptor::default(), None)
        .await?;

    let texture_desc = wgpu::TextureDescriptor {
        label: Some("Target Texture"),
        size: wgpu::Extent3d { width, height, depth_or_array_layers: 1 },
        mip_level_count: 1,
        sample_count: 1,
        dimension: wgpu::TextureDimension::D2,
        format: TEXTURE_FORMAT,
        usage: wgpu::TextureUsages::RENDER_ATTACHMENT | wgpu::TextureUsages::COPY_SRC,
        view_formats: &[],
    };

    let texture = device.create_texture(&texture_desc);
    let texture_view = texture.create_view(&wgpu::TextureViewDescriptor::default());

    // Buffer for reading back data
    let unpadded_bytes_per_row = 4 * width;
    let align = wgpu::COPY_BYTES_PER_ROW_ALIGNMENT;
    let padded_bytes_per_row = unpadded_bytes_per_row.div_ceil(align) * align;

    let output_buffer = device.create_buffer(&wgpu::BufferDescriptor {
        label: Some("Output Buffer"),
        size: (padded_bytes_per_row * height) as wgpu::BufferAddress,
        usage: wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::MAP_READ,
        mapped_at_creation: false,
    });

    let backend = WgpuBackend::new(device, queue, texture_desc.format);
    let mut session = Session::new(backend, config, width, height);

    let dir = model_dir.to_string_lossy();
    if !session.switch_character(&FsFetcher, &dir, file).await {
        anyhow::bail!("Failed to load model {}", model_dir.join(file).display());
    }

    if let Some(avatar) = session.avatar_mut() {
        if let Some(motion) = &options.motion {
            let index: usize = motion[1].parse().with_context(|| format!("bad motion index '{}'", motion[1]))?;
            if !avatar.start_motion(&motion[0], index, Priority::Force).is_valid() {
                log::warn!("Motion {}_{} could not be started", motion[0], index);
            }
        }
        if let Some(name) = &options.expression {
            avatar.set_expression(name);
        }
        if let Some(audio) = &options.audio {
            let bytes = std::fs::read(audio).with_context(|| format!("reading {}", audio.display()))?;
            avatar.push_audio(bytes);
        }
    }

    println!("Rendering {} frames to {:?}...", total_frames, out_dir);

    for i in 0..total_frames {
        session.update(dt);
        session.draw();
        session.backend_mut().submit(&texture_view);

        let backend = session.backend();
        let mut encoder = backend.device().create_command_encoder(&wgpu::CommandEncoderDescriptor { label: None });

        encoder.copy_texture_to_buffer(
            wgpu::ImageCopyTexture {
                texture: &texture,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            wgpu::ImageCopyBuffer {
                buffer: &output_buffer,
                layout: wgpu::ImageDataLayout {
                    offset: 0,
                    bytes_per_row: Some(padded_bytes_per_row),
                    rows_per_image: Some(height),
                },
            },
            texture_desc.size,
        );
        backend.queue().submit(Some(encoder.finish()));

        // Map buffer and save
        let buffer_slice = output_buffer.slice(..);
        let (tx, rx) = std::sync::mpsc::channel();
        buffer_slice.map_async(wgpu::MapMode::Read, move |v| {
            let _ = tx.send(v);
        });
        backend.device().poll(wgpu::Maintain::Wait);
        rx.recv()??;

        let data = buffer_slice.get_mapped_range();
        let mut unpadded_data = Vec::with_capacity((width * height * 4) as usize);
        for row in 0..height {
            let start = (row * padded_bytes_per_row) as usize;
            let end = start + unpadded_bytes_per_row as usize;
            unpadded_data.extend_from_slice(&data[start..end]);
        }

        let frame_path = out_dir.join(format!("frame_{:05}.png", i));
        image::save_buffer(&frame_path, &unpadded_data, width, height, image::ColorType::Rgba8)?;

        drop(data);
        output_buffer.unmap();

        if i % 30 == 0 {
            print!(".");
            use std::io::Write;
            std::io::stdout().flush()?;
        }
    }
    println!("\nDone.");

    if let Some(stats) = session.avatar().map(|a| a.renderer().last_frame().clone()) {
        log::info!(
            "Last frame: {} draws, {} mask draws, {} skipped",
            stats.draws,
            stats.mask_draws,
            stats.skipped
        );
    }

    Ok(())
}

async fn inspect(model_dir: &Path, file: &str, config: AvatarConfig) -> Result<()> {
    let dir = model_dir.to_string_lossy();
    let loaded = loader::load_model(&FsFetcher, &dir, file, &config, |stage| {
        if stage != LoadStage::Ready {
            log::debug!("Stage {:?}", stage);
        }
    })
    .await?;
    let model = &loaded.model;

    println!(
        "Canvas {}x{} units, {} parameters, {} parts, {} drawables",
        model.canvas_width(),
        model.canvas_height(),
        model.parameters().len(),
        model.parts().len(),
        model.drawable_count()
    );
    for (i, d) in model.drawables().iter().enumerate() {
        println!(
            "  [{:3}] {:24} tex {} order {:4} {:?} masks {:?}{}",
            i,
            d.id,
            d.texture_index,
            d.render_order,
            d.blend_mode,
            d.masks,
            if d.inverted_mask { " (inverted)" } else { "" }
        );
    }

    let textures = loaded.textures.iter().filter(|t| t.is_some()).count();
    println!(
        "{} of {} textures, {} motions, {} expressions",
        textures,
        loaded.textures.len(),
        loaded.motions.len(),
        loaded.expressions.len()
    );

    let mut clipping = ClippingManager::new(config.render_texture_count, config.masks_per_texture, config.mask_buffer_size);
    clipping.initialize(model);
    if clipping.contexts().is_empty() {
        println!("No clipping masks");
        return Ok(());
    }
    clipping.setup_clipping_context(model);
    println!(
        "{} mask contexts, capacity {} across {} texture(s) of {}px",
        clipping.contexts().len(),
        clipping.capacity(),
        clipping.render_texture_count(),
        clipping.mask_buffer_size()
    );
    for (i, ctx) in clipping.contexts().iter().enumerate() {
        let layout = ctx.layout();
        println!(
            "  context {:3}: masks {:?} clips {:?} texture {} channel {} bounds ({:.3}, {:.3}, {:.3}, {:.3}){}",
            i,
            ctx.mask_drawables(),
            ctx.clipped_drawables(),
            layout.buffer_index,
            layout.channel,
            layout.bounds.x,
            layout.bounds.y,
            layout.bounds.width,
            layout.bounds.height,
            if ctx.is_overflowed() { " OVERFLOW" } else { "" }
        );
    }
    Ok(())
}
