//! Images in and out of the engine.
//!
//! The network sees `1x3xHxW` F32 tensors, channels in BGR order, centered
//! on zero by removing a mean of 128 from every component.
use std::path::{Path, PathBuf};

use dream_core::internal::*;
use dream_core::ndarray::Ix4;
use image::imageops::FilterType;
use image::{Rgb, RgbImage};

const MEAN: f32 = 128.0;

/// Load an image, resize and crop it to `size` x `size`.
pub fn read_image_tensor(path: &Path, size: usize) -> DreamResult<Tensor> {
    let image = image::open(path).with_context(|| format!("Opening image {:?}", path))?;
    let side = size as u32;
    let rgb = image.resize_to_fill(side, side, FilterType::Triangle).to_rgb8();
    let mut data = Vec::with_capacity(3 * size * size);
    for c in 0..3 {
        for y in 0..side {
            for x in 0..side {
                data.push(rgb.get_pixel(x, y)[2 - c] as f32 - MEAN);
            }
        }
    }
    debug!("Read {:?} as {}x{}", path, size, size);
    Tensor::from_vec(&[1, 3, size, size], data)
}

/// First image of the batch, back in RGB pixel space.
pub fn tensor_to_image(tensor: &Tensor) -> DreamResult<RgbImage> {
    let view = tensor.to_array_view::<f32>()?.into_dimensionality::<Ix4>()?;
    let (_, channels, height, width) = view.dim();
    ensure!(channels == 3, "Expected 3 channels, got {}", tensor.fact());
    Ok(RgbImage::from_fn(width as u32, height as u32, |x, y| {
        let (x, y) = (x as usize, y as usize);
        let pixel = |c: usize| (view[[0, 2 - c, y, x]] + MEAN).clamp(0.0, 255.0) as u8;
        Rgb([pixel(0), pixel(1), pixel(2)])
    }))
}

/// Format follows the file extension.
pub fn write_image_tensor(tensor: &Tensor, path: &Path) -> DreamResult<()> {
    tensor_to_image(tensor)?.save(path).with_context(|| format!("Writing image {:?}", path))?;
    Ok(())
}

/// Zero mean, standard deviation of 100.
pub fn normalize_tensor(tensor: &Tensor) -> DreamResult<Tensor> {
    let values = tensor.as_slice::<f32>()?;
    let n = values.len().max(1) as f32;
    let mean = values.iter().sum::<f32>() / n;
    let stdev = (values.iter().map(|v| (v - mean).powi(2)).sum::<f32>() / n).sqrt();
    let scale = if stdev > 0.0 { 100.0 / stdev } else { 0.0 };
    let normalized = values.iter().map(|v| (v - mean) * scale).collect();
    Tensor::from_vec(tensor.shape(), normalized)
}

/// Write `dream_<step>.jpg` into `dir`.
pub fn render_tensor(
    tensor: &Tensor,
    step: i64,
    dir: &Path,
    normalize: bool,
) -> DreamResult<PathBuf> {
    let path = dir.join(format!("dream_{}.jpg", step));
    if normalize {
        write_image_tensor(&normalize_tensor(tensor)?, &path)?;
    } else {
        write_image_tensor(tensor, &path)?;
    }
    Ok(path)
}

/// Logs every report and renders the input as a checkpoint image.
#[derive(Clone, Debug)]
pub struct CheckpointReporter {
    pub dir: PathBuf,
    pub normalize: bool,
    pub rendered: Vec<PathBuf>,
}

impl CheckpointReporter {
    pub fn new(dir: impl Into<PathBuf>, normalize: bool) -> DreamResult<CheckpointReporter> {
        let dir = dir.into();
        fs_err::create_dir_all(&dir)?;
        Ok(CheckpointReporter { dir, normalize, rendered: vec![] })
    }
}

impl Reporter for CheckpointReporter {
    fn report(&mut self, snapshot: &Snapshot) -> DreamResult<()> {
        info!("{}", snapshot);
        let path = render_tensor(&snapshot.input, snapshot.iteration, &self.dir, self.normalize)?;
        trace!("Rendered {:?}", path);
        self.rendered.push(path);
        Ok(())
    }
}
