//! End-to-end checks through the public API: load a model from memory, animate
//! it, and render through a backend that only counts what it is asked to do.

use std::io::Cursor;

use marionette::config::AvatarConfig;
use marionette::loader::{LoadStage, MemoryFetcher};
use marionette::model::Drawable;
use marionette::render::{DrawBinding, ProgramDesc, RenderBackend, RenderError};
use marionette::session::Session;
use marionette::texture::TextureImage;
use serde_json::json;

#[derive(Default)]
struct CountingBackend {
    frames: usize,
    clears: Vec<usize>,
    draws: usize,
    textures: Vec<usize>,
}

impl RenderBackend for CountingBackend {
    type Program = ();

    fn compile_program(&mut self, _desc: &ProgramDesc) -> Result<(), RenderError> {
        Ok(())
    }

    fn begin_frame(&mut self, _clear_color: [f32; 4]) {
        self.frames += 1;
    }

    fn ensure_mask_targets(&mut self, count: usize, _size: u32) {
        if self.clears.len() < count {
            self.clears.resize(count, 0);
        }
    }

    fn bind_mask_target(&mut self, buffer_index: usize, clear: bool) {
        if clear {
            self.clears[buffer_index] += 1;
        }
    }

    fn restore_default_target(&mut self) {}

    fn upload_texture(&mut self, slot: usize, _image: &TextureImage) {
        self.textures.push(slot);
    }

    fn release_textures(&mut self) {
        self.textures.clear();
    }

    fn is_texture_bound(&self, slot: usize) -> bool {
        self.textures.contains(&slot)
    }

    fn draw(&mut self, _program: &(), _drawable: &Drawable, _binding: &DrawBinding) {
        self.draws += 1;
    }
}

fn quad(id: &str, cx: f32, cy: f32, masks: &[usize], order: i32) -> serde_json::Value {
    let h = 0.05;
    json!({
        "Id": id,
        "RenderOrder": order,
        "Masks": masks,
        "Positions": [cx - h, cy - h, cx + h, cy - h, cx + h, cy + h, cx - h, cy + h],
        "Uvs": [0.0, 0.0, 1.0, 0.0, 1.0, 1.0, 0.0, 1.0],
        "Indices": [0, 1, 2, 0, 2, 3]
    })
}

fn png() -> Vec<u8> {
    let img = image::RgbaImage::from_pixel(4, 4, image::Rgba([200, 100, 50, 255]));
    let mut bytes = Vec::new();
    img.write_to(&mut Cursor::new(&mut bytes), image::ImageFormat::Png)
        .unwrap();
    bytes
}

/// `groups` mask sources, each clipping one drawable of its own.
fn masked_fetcher(groups: usize) -> MemoryFetcher {
    let mut drawables = Vec::new();
    for i in 0..groups {
        let x = -0.8 + 0.3 * i as f32;
        drawables.push(quad(&format!("Mask{}", i), x, 0.0, &[], i as i32));
    }
    for i in 0..groups {
        let x = -0.8 + 0.3 * i as f32;
        drawables.push(quad(&format!("Clipped{}", i), x, 0.0, &[i], 100 + i as i32));
    }

    let mut f = MemoryFetcher::new();
    f.insert(
        "puppet/puppet.model3.json",
        json!({
            "Version": 3,
            "FileReferences": {"Moc": "puppet.mesh.json", "Textures": ["texture_00.png"]},
            "Groups": [{"Target": "Parameter", "Name": "LipSync", "Ids": ["ParamMouthOpenY"]}]
        })
        .to_string(),
    );
    f.insert(
        "puppet/puppet.mesh.json",
        json!({
            "Parameters": [{"Id": "ParamMouthOpenY", "Min": 0.0, "Max": 1.0, "Default": 0.0}],
            "Drawables": drawables
        })
        .to_string(),
    );
    f.insert("puppet/texture_00.png", png());
    f
}

fn sine_wav(seconds: f32, amplitude: f32) -> Vec<u8> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate: 16_000,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut cursor = Cursor::new(Vec::new());
    {
        let mut writer = hound::WavWriter::new(&mut cursor, spec).unwrap();
        let count = (seconds * spec.sample_rate as f32) as usize;
        for n in 0..count {
            let t = n as f32 / spec.sample_rate as f32;
            let v = amplitude * (2.0 * std::f32::consts::PI * 220.0 * t).sin();
            writer.write_sample((v * i16::MAX as f32) as i16).unwrap();
        }
        writer.finalize().unwrap();
    }
    cursor.into_inner()
}

fn ready_session(fetcher: &MemoryFetcher, config: AvatarConfig) -> Session<CountingBackend> {
    let mut session = Session::new(CountingBackend::default(), config, 640, 480);
    assert!(pollster::block_on(session.switch_character(fetcher, "puppet", "puppet.model3.json")));
    assert_eq!(session.stage(), Some(LoadStage::Ready));
    session
}

#[test]
fn test_overflowing_masks_still_render() {
    let fetcher = masked_fetcher(5);
    let config = AvatarConfig {
        masks_per_texture: Some(4),
        ..AvatarConfig::default()
    };
    let mut session = ready_session(&fetcher, config);

    for _ in 0..3 {
        session.update(1.0 / 30.0);
        assert!(session.draw());
    }

    let avatar = session.avatar().unwrap();
    let clipping = avatar.renderer().clipping().unwrap();
    assert_eq!(clipping.contexts().len(), 5);
    assert!(clipping.contexts()[4].is_overflowed());
    // reported once, not once per frame
    assert_eq!(clipping.capacity_error_count(), 1);
    assert_eq!(avatar.renderer().last_frame().draws, 10);
    assert_eq!(avatar.renderer().last_frame().skipped, 0);
}

#[test]
fn test_each_mask_texture_cleared_once_per_frame() {
    let fetcher = masked_fetcher(6);
    let config = AvatarConfig {
        render_texture_count: 2,
        ..AvatarConfig::default()
    };
    let mut session = ready_session(&fetcher, config);

    for _ in 0..4 {
        session.update(1.0 / 30.0);
        session.draw();
    }

    assert_eq!(session.backend().frames, 4);
    assert_eq!(session.backend().clears, vec![4, 4]);
}

#[test]
fn test_lip_sync_opens_mouth() {
    let fetcher = masked_fetcher(1);
    let mut session = ready_session(&fetcher, AvatarConfig::default());
    session.set_lip_sync_weight(2.0);
    session.avatar_mut().unwrap().push_audio(sine_wav(1.0, 0.5));

    for _ in 0..10 {
        session.update(1.0 / 30.0);
    }

    let avatar = session.avatar().unwrap();
    // RMS of a sine with amplitude 0.5 is about 0.354
    assert!((avatar.amplitude() - 0.3535).abs() < 0.02);
    assert!(avatar.model().parameter_value("ParamMouthOpenY") > 0.5);

    session.avatar_mut().unwrap().clear_audio();
    session.update(1.0 / 30.0);
    assert!(session.avatar().unwrap().amplitude() < 1e-6);
}

#[test]
fn test_switching_releases_previous_model() {
    let fetcher = masked_fetcher(2);
    let mut session = ready_session(&fetcher, AvatarConfig::default());
    assert_eq!(session.backend().textures, vec![0]);

    assert!(!pollster::block_on(session.switch_character(&fetcher, "puppet", "other.model3.json")));
    assert!(!session.is_ready());
    assert!(session.backend().textures.is_empty());
    assert!(!session.draw());
}
