use crate::sampler::{Mask, SamplerOutput};
use anyhow::{ensure, Result};
use image::{Rgb, RgbImage};
use ndarray::{s, Array3, Axis};

/// Padding between and around tiles, in pixels
pub const TILE_PADDING: u32 = 10;

/// Arrange CHW tiles into one padded grid image
///
/// `nrow` is the number of tiles per grid row. Padding is black. One-channel
/// tiles are shown as gray; tiles with more than three channels show their
/// first three. Values are clamped to [0, 1].
pub fn compose_grid(tiles: &[Array3<f32>], nrow: usize, padding: u32) -> Result<RgbImage> {
    ensure!(!tiles.is_empty(), "nothing to compose");
    ensure!(nrow > 0, "grid needs at least one tile per row");

    let (_, tile_h, tile_w) = tiles[0].dim();
    for (i, tile) in tiles.iter().enumerate() {
        let (channels, h, w) = tile.dim();
        ensure!(channels > 0, "tile {} has no channels", i);
        ensure!(
            (h, w) == (tile_h, tile_w),
            "tile {} is {}x{}, expected {}x{}",
            i,
            w,
            h,
            tile_w,
            tile_h
        );
    }

    let cols = nrow.min(tiles.len());
    let rows = (tiles.len() + cols - 1) / cols;
    let (tile_w, tile_h) = (tile_w as u32, tile_h as u32);
    let width = cols as u32 * (tile_w + padding) + padding;
    let height = rows as u32 * (tile_h + padding) + padding;

    let mut grid = RgbImage::new(width, height);
    for (i, tile) in tiles.iter().enumerate() {
        let x0 = (i % cols) as u32 * (tile_w + padding) + padding;
        let y0 = (i / cols) as u32 * (tile_h + padding) + padding;
        let channels = tile.len_of(Axis(0));

        for y in 0..tile_h {
            for x in 0..tile_w {
                let mut px = [0u8; 3];
                for (c, value) in px.iter_mut().enumerate() {
                    let v = tile[[c.min(channels - 1), y as usize, x as usize]];
                    *value = to_u8(v);
                }
                grid.put_pixel(x0 + x, y0 + y, Rgb(px));
            }
        }
    }

    Ok(grid)
}

/// Per-draw inspection strip: sample, original, calibration, calibrated
pub fn member_tiles(output: &SamplerOutput) -> Vec<Array3<f32>> {
    let sample_channels = output.sample.len_of(Axis(0));
    let segmentation = output
        .sample
        .index_axis(Axis(0), sample_channels.saturating_sub(1))
        .to_owned()
        .insert_axis(Axis(0));

    // The last channel of the conditioning image is noise, not picture
    let original_channels = output.original.len_of(Axis(0));
    let keep = if original_channels > 1 {
        original_channels - 1
    } else {
        original_channels
    };
    let original = output.original.slice(s![..keep, .., ..]).to_owned();

    vec![
        normalize_for_display(&segmentation),
        original,
        mask_tile(&output.calibration),
        mask_tile(&output.calibrated),
    ]
}

/// H x W map as a one-channel tile
pub fn mask_tile(mask: &Mask) -> Array3<f32> {
    mask.clone().insert_axis(Axis(0))
}

/// Min-max scale into [0, 1]; constant input maps to zeros
pub fn normalize_for_display(array: &Array3<f32>) -> Array3<f32> {
    let min = array.iter().copied().fold(f32::INFINITY, f32::min);
    let max = array.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let range = max - min;

    if !range.is_finite() || range <= 0.0 {
        return Array3::zeros(array.dim());
    }
    array.mapv(|v| (v - min) / range)
}

fn to_u8(v: f32) -> u8 {
    (v.clamp(0.0, 1.0) * 255.0 + 0.5) as u8
}
