//! Texture decoding into the premultiplied RGBA8 layout the renderer expects.

/// Decoded RGBA8 pixels with color already multiplied by alpha.
#[derive(Clone, Debug, PartialEq)]
pub struct TextureImage {
    pub width: u32,
    pub height: u32,
    pub pixels: Vec<u8>,
}

impl TextureImage {
    /// Decode a PNG (or any format `image` was built with) and premultiply it.
    pub fn decode(bytes: &[u8]) -> Result<Self, image::ImageError> {
        let rgba = image::load_from_memory(bytes)?.to_rgba8();
        let (width, height) = rgba.dimensions();
        let mut pixels = rgba.into_raw();
        premultiply(&mut pixels);
        Ok(Self { width, height, pixels })
    }

    pub fn solid(width: u32, height: u32, color: [u8; 4]) -> Self {
        let mut pixels = color.repeat((width * height) as usize);
        premultiply(&mut pixels);
        Self { width, height, pixels }
    }
}

fn premultiply(pixels: &mut [u8]) {
    for px in pixels.chunks_exact_mut(4) {
        let a = px[3] as u32;
        for c in &mut px[..3] {
            *c = ((*c as u32 * a + 127) / 255) as u8;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_premultiplies() {
        let img = image::RgbaImage::from_pixel(2, 1, image::Rgba([200, 100, 0, 128]));
        let mut png = Vec::new();
        img.write_to(&mut std::io::Cursor::new(&mut png), image::ImageFormat::Png)
            .unwrap();
        let tex = TextureImage::decode(&png).unwrap();
        assert_eq!((tex.width, tex.height), (2, 1));
        assert_eq!(&tex.pixels[..4], &[100, 50, 0, 128]);
    }

    #[test]
    fn test_opaque_pixels_unchanged() {
        let tex = TextureImage::solid(1, 1, [10, 20, 30, 255]);
        assert_eq!(tex.pixels, vec![10, 20, 30, 255]);
    }

    #[test]
    fn test_garbage_is_an_error() {
        assert!(TextureImage::decode(b"not a png").is_err());
    }
}
