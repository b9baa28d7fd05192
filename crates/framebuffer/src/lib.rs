//! Off-screen RGBA composite target for one frame.
//!
//! Workers hand back packed RGB slabs; `write_rect` composites them at the
//! block's origin with alpha pinned to 255. An optional de-banding mode
//! maintains a second buffer of identical geometry carrying a noise-dithered
//! copy, which becomes the presentation surface while enabled.

use protocol::{BlockRect, FrameEpoch};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

pub struct FrameBuffer {
    width: u32,
    height: u32,
    epoch: FrameEpoch,
    primary: Vec<u8>,
    /// Present exactly while de-banding is enabled.
    secondary: Option<Vec<u8>>,
    rng: SmallRng,
}

/// Owned copy of the presentation surface, safe to hand across threads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameSnapshot {
    pub width: u32,
    pub height: u32,
    pub epoch: FrameEpoch,
    pub pixels: Vec<u8>,
}

impl FrameBuffer {
    pub fn new(width: u32, height: u32, epoch: FrameEpoch, de_band: bool) -> FrameBuffer {
        assert!(width > 0 && height > 0, "frame buffer must have pixels");
        let primary = blank_rgba(width, height);
        let secondary = de_band.then(|| blank_rgba(width, height));
        FrameBuffer {
            width,
            height,
            epoch,
            primary,
            secondary,
            rng: SmallRng::from_os_rng(),
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn epoch(&self) -> FrameEpoch {
        self.epoch
    }

    pub fn de_band(&self) -> bool {
        self.secondary.is_some()
    }

    /// Toggles de-banding. Enabling on a populated buffer back-fills the
    /// secondary from the primary so the presentation surface is uniformly
    /// treated; disabling re-presents the primary.
    pub fn set_de_band(&mut self, enabled: bool) {
        match (enabled, self.secondary.is_some()) {
            (true, false) => {
                let mut secondary = blank_rgba(self.width, self.height);
                for i in 0..(self.width as usize * self.height as usize) {
                    let offset = i * 4;
                    let [r, g, b] = shade(
                        [
                            self.primary[offset],
                            self.primary[offset + 1],
                            self.primary[offset + 2],
                        ],
                        &mut self.rng,
                    );
                    secondary[offset] = r;
                    secondary[offset + 1] = g;
                    secondary[offset + 2] = b;
                }
                self.secondary = Some(secondary);
            }
            (false, true) => {
                self.secondary = None;
            }
            _ => {}
        }
    }

    /// Composites a packed RGB slab (`3 * rect.width * rect.height` bytes,
    /// row-major) at the rect's origin. Rect out of bounds or a slab of the
    /// wrong length is a caller bug and panics.
    pub fn write_rect(&mut self, rect: BlockRect, src: &[u8]) {
        assert!(
            rect.x + rect.width <= self.width && rect.y + rect.height <= self.height,
            "rect {rect:?} escapes {}x{} frame buffer",
            self.width,
            self.height
        );
        assert_eq!(
            src.len() as u64,
            rect.area() * 3,
            "rgb slab length does not match rect {rect:?}"
        );

        for j in 0..rect.height as usize {
            for i in 0..rect.width as usize {
                let src_offset = (j * rect.width as usize + i) * 3;
                let dst_offset = ((rect.y as usize + j) * self.width as usize
                    + (rect.x as usize + i))
                    * 4;
                self.primary[dst_offset] = src[src_offset];
                self.primary[dst_offset + 1] = src[src_offset + 1];
                self.primary[dst_offset + 2] = src[src_offset + 2];
                self.primary[dst_offset + 3] = 255;

                if let Some(secondary) = &mut self.secondary {
                    let [r, g, b] = shade(
                        [src[src_offset], src[src_offset + 1], src[src_offset + 2]],
                        &mut self.rng,
                    );
                    secondary[dst_offset] = r;
                    secondary[dst_offset + 1] = g;
                    secondary[dst_offset + 2] = b;
                    secondary[dst_offset + 3] = 255;
                }
            }
        }
    }

    /// The presentation surface: the de-banded buffer while the mode is
    /// enabled, the raw composite otherwise. Valid until the next write.
    pub fn pixels(&self) -> &[u8] {
        self.secondary.as_deref().unwrap_or(&self.primary)
    }

    /// The raw composite, regardless of de-banding.
    pub fn primary_pixels(&self) -> &[u8] {
        &self.primary
    }

    pub fn snapshot(&self) -> FrameSnapshot {
        FrameSnapshot {
            width: self.width,
            height: self.height,
            epoch: self.epoch,
            pixels: self.pixels().to_vec(),
        }
    }
}

fn blank_rgba(width: u32, height: u32) -> Vec<u8> {
    let mut pixels = vec![0u8; width as usize * height as usize * 4];
    for i in 0..(width as usize * height as usize) {
        pixels[i * 4 + 3] = 255;
    }
    pixels
}

/// De-banding transform for one pixel. Green-dominated dark pixels get the
/// strongest dithering; each channel draws its own uniform variate.
fn shade([r, g, b]: [u8; 3], rng: &mut SmallRng) -> [u8; 3] {
    let denom = 0.5 * (r as f32 + b as f32);
    let greenness = if denom <= 0.0 {
        if g > 0 {
            1.0
        } else {
            0.0
        }
    } else {
        (g as f32 / denom).clamp(0.0, 1.0)
    };
    let luminance = 0.2126 * r as f32 + 0.7152 * g as f32 + 0.0722 * b as f32;
    let darkness = 1.0 - luminance / 255.0;
    let scale = 0.08 * greenness * darkness;

    let mut perturb = |channel: u8| -> u8 {
        let u: f32 = rng.random();
        let factor = u * scale + (1.0 - scale * 0.5);
        (factor * channel as f32).min(255.0) as u8
    };
    [perturb(r), perturb(g), perturb(b)]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn epoch() -> FrameEpoch {
        FrameEpoch(1)
    }

    fn solid_slab(rect: BlockRect, rgb: [u8; 3]) -> Vec<u8> {
        let mut slab = Vec::with_capacity(rect.area() as usize * 3);
        for _ in 0..rect.area() {
            slab.extend_from_slice(&rgb);
        }
        slab
    }

    #[test]
    fn fresh_buffer_is_black_with_opaque_alpha() {
        let buffer = FrameBuffer::new(4, 3, epoch(), false);
        for pixel in buffer.pixels().chunks_exact(4) {
            assert_eq!(pixel, [0, 0, 0, 255]);
        }
    }

    #[test]
    fn write_rect_lands_at_origin_with_alpha() {
        let mut buffer = FrameBuffer::new(8, 8, epoch(), false);
        let rect = BlockRect { x: 2, y: 3, width: 3, height: 2 };
        let mut slab = Vec::new();
        for value in 0..6u8 {
            slab.extend_from_slice(&[value, 100 + value, 200 + value]);
        }
        buffer.write_rect(rect, &slab);

        let pixels = buffer.pixels();
        for j in 0..2usize {
            for i in 0..3usize {
                let value = (j * 3 + i) as u8;
                let offset = ((3 + j) * 8 + 2 + i) * 4;
                assert_eq!(
                    &pixels[offset..offset + 4],
                    [value, 100 + value, 200 + value, 255]
                );
            }
        }
        // Everything outside the rect stays untouched.
        assert_eq!(&pixels[0..4], [0, 0, 0, 255]);
    }

    #[test]
    fn write_rect_twice_is_idempotent_without_de_banding() {
        let rect = BlockRect { x: 1, y: 1, width: 4, height: 4 };
        let slab = solid_slab(rect, [9, 30, 77]);

        let mut buffer = FrameBuffer::new(6, 6, epoch(), false);
        buffer.write_rect(rect, &slab);
        let first = buffer.pixels().to_vec();
        buffer.write_rect(rect, &slab);
        assert_eq!(buffer.pixels(), &first[..]);
    }

    #[test]
    fn narrow_edge_block_writes_only_its_columns() {
        let mut buffer = FrameBuffer::new(250, 100, epoch(), false);
        let rect = BlockRect { x: 200, y: 0, width: 50, height: 100 };
        let slab = solid_slab(rect, [255, 1, 2]);
        assert_eq!(slab.len(), 15000);
        buffer.write_rect(rect, &slab);

        let pixels = buffer.pixels();
        for y in 0..100usize {
            for x in 0..250usize {
                let offset = (y * 250 + x) * 4;
                if x >= 200 {
                    assert_eq!(&pixels[offset..offset + 4], [255, 1, 2, 255]);
                } else {
                    assert_eq!(&pixels[offset..offset + 4], [0, 0, 0, 255]);
                }
            }
        }
    }

    #[test]
    #[should_panic(expected = "escapes")]
    fn out_of_bounds_rect_panics() {
        let mut buffer = FrameBuffer::new(16, 16, epoch(), false);
        let rect = BlockRect { x: 8, y: 0, width: 9, height: 4 };
        let slab = solid_slab(rect, [0, 0, 0]);
        buffer.write_rect(rect, &slab);
    }

    #[test]
    #[should_panic(expected = "slab length")]
    fn short_slab_panics() {
        let mut buffer = FrameBuffer::new(16, 16, epoch(), false);
        buffer.write_rect(BlockRect { x: 0, y: 0, width: 4, height: 4 }, &[0, 0, 0]);
    }

    #[test]
    fn de_banded_green_stays_near_full_green() {
        let mut buffer = FrameBuffer::new(100, 100, epoch(), true);
        let rect = BlockRect { x: 0, y: 0, width: 100, height: 100 };
        buffer.write_rect(rect, &solid_slab(rect, [0, 255, 0]));

        let mut greens = Vec::new();
        for pixel in buffer.pixels().chunks_exact(4) {
            assert_eq!(pixel[0], 0);
            assert_eq!(pixel[2], 0);
            assert!(
                (252..=255).contains(&pixel[1]),
                "green {} escaped the band window",
                pixel[1]
            );
            greens.push(pixel[1]);
        }
        // Fresh variates per pixel: a 10k-pixel block cannot be uniform.
        assert!(greens.iter().any(|&g| g != greens[0]));
        // The raw composite keeps the exact kernel output.
        for pixel in buffer.primary_pixels().chunks_exact(4) {
            assert_eq!(pixel, [0, 255, 0, 255]);
        }
    }

    #[test]
    fn enabling_de_band_back_fills_from_primary() {
        let mut buffer = FrameBuffer::new(10, 10, epoch(), false);
        let rect = BlockRect { x: 0, y: 0, width: 10, height: 10 };
        buffer.write_rect(rect, &solid_slab(rect, [0, 200, 0]));

        buffer.set_de_band(true);
        assert!(buffer.de_band());
        for pixel in buffer.pixels().chunks_exact(4) {
            assert!(pixel[1] > 0, "back-fill lost the composited green");
            assert_eq!(pixel[3], 255);
        }

        buffer.set_de_band(false);
        for pixel in buffer.pixels().chunks_exact(4) {
            assert_eq!(pixel, [0, 200, 0, 255]);
        }
    }

    #[test]
    fn snapshot_copies_presentation_surface() {
        let mut buffer = FrameBuffer::new(3, 2, epoch(), false);
        let rect = BlockRect { x: 0, y: 0, width: 3, height: 2 };
        buffer.write_rect(rect, &solid_slab(rect, [7, 8, 9]));

        let snapshot = buffer.snapshot();
        assert_eq!(snapshot.width, 3);
        assert_eq!(snapshot.height, 2);
        assert_eq!(snapshot.epoch, epoch());
        assert_eq!(snapshot.pixels, buffer.pixels());
    }
}
