//! Synthetic class-folder dataset for exercising the pipeline end to end.
//!
//! Each image is uniform noise with a class-specific colour bias, so a model
//! can learn to tell the classes apart without any real photographs.

use std::fs;
use std::path::{Path, PathBuf};

use image::{Rgb, RgbImage};
use leaf_core::{DataSplit, Result};
use rand::Rng;
use tracing::info;

/// Class names of the LeafSense label set
pub const DEFAULT_CLASSES: [&str; 4] = ["healthy", "nutrient_deficiency", "disease", "pest_damage"];

#[derive(Debug, Clone)]
pub struct SyntheticSpec {
    pub classes: Vec<String>,
    pub train_per_class: usize,
    /// Zero skips the `val/` partition entirely
    pub val_per_class: usize,
    pub image_size: u32,
}

impl Default for SyntheticSpec {
    fn default() -> Self {
        Self {
            classes: DEFAULT_CLASSES.iter().map(|c| c.to_string()).collect(),
            train_per_class: 50,
            val_per_class: 10,
            image_size: 224,
        }
    }
}

/// Writes `<root>/<split>/<class>/<class>_NNNN.png` and returns every path written.
pub fn generate<R: Rng + ?Sized>(
    root: &Path,
    spec: &SyntheticSpec,
    rng: &mut R,
) -> Result<Vec<PathBuf>> {
    let mut written = Vec::new();

    for (split, count) in [
        (DataSplit::Train, spec.train_per_class),
        (DataSplit::Validation, spec.val_per_class),
    ] {
        if count == 0 {
            continue;
        }
        for class in &spec.classes {
            let class_dir = root.join(split.dir_name()).join(class);
            fs::create_dir_all(&class_dir)?;

            for i in 0..count {
                let path = class_dir.join(format!("{class}_{i:04}.png"));
                synthesize(class, spec.image_size, rng).save(&path)?;
                written.push(path);
            }
            info!("Created {count} images for {split}/{class}");
        }
    }

    Ok(written)
}

/// Noise image biased towards the look of `class`.
pub fn synthesize<R: Rng + ?Sized>(class: &str, size: u32, rng: &mut R) -> RgbImage {
    let mut img = RgbImage::from_fn(size, size, |_, _| Rgb(rng.gen::<[u8; 3]>()));

    match class {
        "healthy" => add_bias(&mut img, [0, 50, 0]),
        "nutrient_deficiency" => add_bias(&mut img, [40, 40, 0]),
        "disease" => {
            add_bias(&mut img, [30, 0, 0]);
            paint_spots(&mut img, 10, (5, 20), rng, |p| Rgb([p[0] / 2, p[1] / 2, p[2] / 2]));
        }
        "pest_damage" => paint_spots(&mut img, 15, (3, 10), rng, |_| Rgb([0, 0, 0])),
        _ => {}
    }

    img
}

fn add_bias(img: &mut RgbImage, bias: [u8; 3]) {
    for pixel in img.pixels_mut() {
        for c in 0..3 {
            pixel[c] = pixel[c].saturating_add(bias[c]);
        }
    }
}

/// Paints `count` discs with radii in `radius` (given for a 224 px image and
/// scaled to the actual size).
fn paint_spots<R, F>(img: &mut RgbImage, count: usize, radius: (u32, u32), rng: &mut R, paint: F)
where
    R: Rng + ?Sized,
    F: Fn(&Rgb<u8>) -> Rgb<u8>,
{
    let size = img.width() as i64;
    let scale = size as f64 / 224.0;
    let scaled = |r: u32| ((r as f64 * scale).round() as i64).max(1);
    let (r_min, r_max) = (scaled(radius.0), scaled(radius.1));

    for _ in 0..count {
        let cx = rng.gen_range(0..size);
        let cy = rng.gen_range(0..size);
        let r = rng.gen_range(r_min..=r_max);

        for dy in -r..r {
            for dx in -r..r {
                if dx * dx + dy * dy >= r * r {
                    continue;
                }
                let (x, y) = (cx + dx, cy + dy);
                if (0..size).contains(&x) && (0..size).contains(&y) {
                    let pixel = img.get_pixel_mut(x as u32, y as u32);
                    *pixel = paint(pixel);
                }
            }
        }
    }
}
