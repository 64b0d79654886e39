use crate::error::*;
use crate::image::Image;
use crate::kmeans::Kmeans;
use crate::nearest::Nearest;
use crate::pal::{ArgbF, FloatPalette, FloatPixel, Palette, MIN_OPAQUE_A};
use crate::quant::{quality_to_mse, QuantizationResult};
use crate::rows::{temp_buf, IndexRows, PixelRows};
use std::cell::RefCell;

#[cfg(not(feature = "threads"))]
use crate::rayoff::*;
#[cfg(feature = "threads")]
use rayon::prelude::*;
#[cfg(feature = "threads")]
use thread_local::ThreadLocal;

/// Whether dithering is limited to flat areas of the image
#[derive(Debug, Eq, PartialEq, Clone, Copy)]
pub(crate) enum DitherMapMode {
    None,
    /// Except for very large images
    Enabled,
    Always,
}

/// Palette and error of the most recent remapping
pub(crate) struct Remapped {
    pub(crate) int_palette: Palette,
    pub(crate) palette_error: Option<f64>,
}

/// Images larger than this don't get a dither map unless it's forced
const HUGE_IMAGE_PIXELS: usize = 2000 * 2000;

/// Assigns every pixel its closest palette entry, without dithering. Returns mean error per pixel.
///
/// With `refine`, non-fixed palette entries are moved to the average of the pixels they got.
/// `should_abort` is called with the row number before each row is remapped.
#[inline(never)]
pub(crate) fn remap_to_palette(
    px: &PixelRows<'_>,
    background: Option<&PixelRows<'_>>,
    output: &mut IndexRows<'_>,
    palette: &mut FloatPalette,
    refine: bool,
    should_abort: &(dyn Fn(usize) -> bool + Sync),
) -> Result<f64, Error> {
    let n = Nearest::new(palette)?;
    let colors = palette.as_slice();
    let palette_len = colors.len();

    // background is only useful if there's a transparent color to show it through
    let transparent_index = background
        .map(|_| n.search(&FloatPixel::default(), 0).0)
        .filter(|&idx| colors[usize::from(idx)].a < MIN_OPAQUE_A);
    let background = background.filter(|_| transparent_index.is_some());
    let transparent_index = transparent_index.unwrap_or(0);

    let tls = ThreadLocal::new();
    let per_thread_state = || -> Result<_, Error> {
        let bg_reader = match background {
            Some(bg) => Some(bg.reader()?),
            None => None,
        };
        Ok(RefCell::new((Kmeans::new(palette_len)?, px.reader()?, bg_reader)))
    };

    let remapping_error = output.rows_mut().enumerate().par_bridge().map(|(row, output_row)| {
        if should_abort(row) {
            return Err(Aborted);
        }
        let state = tls.get_or_try(&per_thread_state)?;
        let (kmeans, reader, bg_reader) = &mut *state.borrow_mut();
        let row_pixels = reader.row_f(row);
        let bg_pixels = match bg_reader {
            Some(bg_reader) => bg_reader.row_f(row),
            None => &[],
        };

        let mut remapping_error = 0.;
        let mut last_match = 0;
        for (col, (input, out)) in row_pixels.iter().zip(output_row.iter_mut()).enumerate() {
            let (matched, diff) = n.search(input, last_match);
            last_match = matched;
            if let Some(bg) = bg_pixels.get(col) {
                let bg_diff = bg.diff(input);
                if bg_diff <= diff {
                    remapping_error += f64::from(bg_diff);
                    *out = transparent_index;
                    continue;
                }
            }
            remapping_error += f64::from(diff);
            *out = matched;
            if refine {
                kmeans.update_color(*input, 1., matched);
            }
        }
        Ok(remapping_error)
    })
    .sum::<Result<f64, Error>>()?;

    if refine {
        let merged = tls.into_iter()
            .map(|state| state.into_inner().0)
            .reduce(Kmeans::merge);
        if let Some(mut kmeans) = merged {
            if background.is_some() {
                // keeps the transparent entry from being treated as unused
                kmeans.update_color(FloatPixel::default(), 1., transparent_index);
            }
            kmeans.finalize(palette);
        }
    }

    Ok(remapping_error / (px.width() * px.height()) as f64)
}

/// Error diffusion can create very bright or saturated pixels. This scales the error down when it would overflow.
fn get_dithered_pixel(dither_level: f32, max_dither_error: f32, thiserr: FloatPixel, px: FloatPixel) -> FloatPixel {
    const MAX_OVERFLOW: f32 = 1.1;
    const MAX_UNDERFLOW: f32 = -0.1;

    let s = thiserr.0 * dither_level;
    let dither_error = s.r * s.r + s.g * s.g + s.b * s.b + s.a * s.a;
    if dither_error < 2. / 256. / 256. {
        // unnoticeable, and not dithering makes the file smaller
        return px;
    }

    // some overflow is allowed, otherwise clamping of all channels would make undithered bands
    let mut ratio: f32 = 1.;
    for (c, e) in [(px.r, s.r), (px.g, s.g), (px.b, s.b)] {
        if c + e > MAX_OVERFLOW {
            ratio = ratio.min((MAX_OVERFLOW - c) / e);
        } else if c + e < MAX_UNDERFLOW {
            ratio = ratio.min((MAX_UNDERFLOW - c) / e);
        }
    }
    if dither_error > max_dither_error {
        ratio *= 0.8;
    }
    FloatPixel(ArgbF {
        a: (px.a + s.a).clamp(0., 1.),
        r: px.r + s.r * ratio,
        g: px.g + s.g * ratio,
        b: px.b + s.b * ratio,
    })
}

/// Serpentine Floyd-Steinberg. Returns mean error per pixel of the output.
///
/// The dither map (or the edge map) limits dithering to flat areas. Dithering on edges creates jagged lines,
/// and noisy areas are "naturally" dithered.
///
/// If `output_image_is_remapped`, the indices already in `output` are used as guesses for the nearest search.
#[inline(never)]
pub(crate) fn remap_to_palette_floyd(
    image: &Image<'_>,
    output: &mut IndexRows<'_>,
    palette: &FloatPalette,
    result: &QuantizationResult,
    max_dither_error: f32,
    output_image_is_remapped: bool,
) -> Result<f64, Error> {
    let progress_stage1 = if result.use_dither_map != DitherMapMode::None { 20. } else { 0. };
    let width = image.width();
    let height = image.height();

    let dither_map = if result.use_dither_map != DitherMapMode::None {
        image.dither_map.as_deref().or(image.edges.as_deref()).unwrap_or(&[])
    } else {
        &[]
    };

    let n = Nearest::new(palette)?;
    let colors = palette.as_slice();

    let mut reader = image.px.reader()?;
    let transparent_index = n.search(&FloatPixel::default(), 0).0;
    let mut bg_reader = match image.background.as_deref() {
        Some(bg) if colors[usize::from(transparent_index)].a < MIN_OPAQUE_A => Some(bg.px.reader()?),
        _ => None,
    };

    // +2 for neighbors of the first and last pixel
    let errwidth = width + 2;
    let mut err_rows = temp_buf::<FloatPixel>(errwidth * 2)?;
    let (mut thiserr, mut nexterr) = err_rows.split_at_mut(errwidth);

    // response to this value is non-linear, and without this curve any value < 0.8 would give almost no dithering
    let mut base_dithering_level = (1. - (1. - result.dither_level) * (1. - result.dither_level)) * (15. / 16.);
    if !dither_map.is_empty() {
        // dither map is in 0-255 scale
        base_dithering_level *= 1. / 255.;
    }

    // over a background many pixels are transparent, which makes poor guesses
    let guess_from_remapped_pixels = output_image_is_remapped && bg_reader.is_none();

    let mut total_error = 0.;
    let mut scan_forward = true;
    for (row, output_row) in output.rows_mut().enumerate() {
        if result.remap_progress(progress_stage1 + row as f32 * (100. - progress_stage1) / height as f32) {
            return Err(Aborted);
        }
        nexterr.fill(FloatPixel::default());
        let row_pixels = reader.row_f(row);
        let bg_pixels = match &mut bg_reader {
            Some(bg_reader) => bg_reader.row_f(row),
            None => &[],
        };
        let dither_map_row = dither_map.get(row * width..(row + 1) * width).unwrap_or(&[]);

        let mut undithered_bg_used = 0;
        let mut last_match = 0;
        for i in 0..width {
            let col = if scan_forward { i } else { width - 1 - i };
            let mut dither_level = base_dithering_level;
            if let Some(&scale) = dither_map_row.get(col) {
                dither_level *= f32::from(scale);
            }
            let input_px = row_pixels[col];
            let spx = get_dithered_pixel(dither_level, max_dither_error, thiserr[col + 1], input_px);
            let guessed_match = if guess_from_remapped_pixels { output_row[col] } else { last_match };
            let (mut matched, dither_diff) = n.search(&spx, guessed_match);
            last_match = matched;
            let mut output_px = colors[usize::from(matched)];

            if let Some(bg_px) = bg_pixels.get(col) {
                // background that matches better with dithering is a definitive win
                if spx.diff(bg_px) <= dither_diff {
                    output_px = *bg_px;
                    matched = transparent_index;
                } else if undithered_bg_used > 1 {
                    // too many undithered pixels in a row accumulate a large error
                    undithered_bg_used = 0;
                } else {
                    // Dithering is worse than the natural difference from the background, so static areas
                    // stay undithered if an undithered color is close enough.
                    let max_diff = input_px.diff(bg_px);
                    if input_px.diff(&output_px) > max_diff {
                        let guessed_px = colors[usize::from(guessed_match)];
                        if input_px.diff(&guessed_px) < max_diff {
                            undithered_bg_used += 1;
                            output_px = guessed_px;
                            matched = guessed_match;
                        }
                    }
                }
            }
            output_row[col] = matched;
            total_error += f64::from(input_px.diff(&output_px));

            let mut err = spx.0 - output_px.0;
            if err.r * err.r + err.g * err.g + err.b * err.b + err.a * err.a > max_dither_error {
                err *= 0.75;
            }
            if scan_forward {
                thiserr[col + 2].0 += err * (7. / 16.);
                nexterr[col + 2].0 += err * (1. / 16.);
                nexterr[col + 1].0 += err * (5. / 16.);
                nexterr[col].0 += err * (3. / 16.);
            } else {
                thiserr[col].0 += err * (7. / 16.);
                nexterr[col + 2].0 += err * (3. / 16.);
                nexterr[col + 1].0 += err * (5. / 16.);
                nexterr[col].0 += err * (1. / 16.);
            }
        }
        std::mem::swap(&mut thiserr, &mut nexterr);
        scan_forward = !scan_forward;
    }
    Ok(total_error / (width * height) as f64)
}

impl Remapped {
    /// Writes indices to `output`, and makes the final palette.
    ///
    /// The palette of `result` isn't modified, refinements go into a copy.
    pub fn new(result: &QuantizationResult, image: &mut Image<'_>, mut output: IndexRows<'_>) -> Result<Self, Error> {
        let mut palette = result.palette.clone();
        let progress_stage1: f32 = if result.use_dither_map != DitherMapMode::None { 20. } else { 0. };
        let posterize = result.min_posterization_output;
        let height = image.height() as f32;

        if result.remap_progress(progress_stage1 * 0.25) {
            return Err(Aborted);
        }

        if result.dither_level == 0. {
            let int_palette = palette.make_int_palette(result.gamma, posterize);
            let abort = |row: usize| result.remap_progress(row as f32 * 100. / height);
            let background = image.background.as_deref().map(|bg| &bg.px);
            let palette_error = remap_to_palette(&image.px, background, &mut output, &mut palette, false, &abort)?;
            return Ok(Self { int_palette, palette_error: Some(palette_error) });
        }

        // dithering reads the image more than once
        image.px.prepare(true)?;

        let mut palette_error = result.palette_error;
        let is_image_huge = image.width() * image.height() > HUGE_IMAGE_PIXELS;
        let allow_dither_map = result.use_dither_map == DitherMapMode::Always || (!is_image_huge && result.use_dither_map != DitherMapMode::None);
        let mut output_image_is_remapped = false;
        if allow_dither_map && image.dither_map.is_none() {
            image.contrast_maps()?;
            if image.edges.is_some() {
                // undithered remap shows which areas are flat, and is the last chance to refine the palette
                let abort = |row: usize| result.remap_progress(progress_stage1 * (0.25 + 0.25 * row as f32 / height));
                palette_error = Some(remap_to_palette(&image.px, None, &mut output, &mut palette, true, &abort)?);
                image.update_dither_map(&output, &palette);
                output_image_is_remapped = true;
            }
        }

        if result.remap_progress(progress_stage1 * 0.5) {
            return Err(Aborted);
        }

        let int_palette = palette.make_int_palette(result.gamma, posterize);
        let max_dither_error = (palette_error.unwrap_or(quality_to_mse(80)) * 2.4).max(quality_to_mse(35)) as f32;
        let remapping_error = remap_to_palette_floyd(image, &mut output, &palette, result, max_dither_error, output_image_is_remapped)?;

        Ok(Self { int_palette, palette_error: Some(remapping_error) })
    }
}

#[test]
fn small_errors_are_not_dithered() {
    let px = FloatPixel(ArgbF { a: 0.625, r: 0.3, g: 0.4, b: 0.2 });
    let tiny = FloatPixel(ArgbF { a: 0., r: 0.0001, g: 0., b: 0. });
    assert_eq!(px, get_dithered_pixel(1., 1., tiny, px));

    let big = FloatPixel(ArgbF { a: 0., r: 0.2, g: 0., b: 0. });
    let dithered = get_dithered_pixel(1., 1., big, px);
    assert!((dithered.r - 0.5).abs() < 1e-6);

    // can't overflow much
    let huge = FloatPixel(ArgbF { a: 0., r: 5., g: 0., b: 0. });
    assert!(get_dithered_pixel(1., 100., huge, px).r <= 1.1 + 1e-6);
}

#[test]
fn background_to_nop() {
    use crate::pal::RGBA;
    let pixels: Vec<_> = (0..200 * 200).map(|n| RGBA::new(n as u8, (n / 17) as u8, (n / 78) as u8, 255)).collect();

    let mut attr = crate::new();
    let mut img = attr.new_image_borrowed(&pixels, 200, 200, 0.).unwrap();
    let img2 = attr.new_image_borrowed(&pixels, 200, 200, 0.).unwrap();
    img.set_background(img2).unwrap();
    img.add_fixed_color(RGBA::new(0, 0, 0, 0)).unwrap();
    attr.set_max_colors(3).unwrap();
    let mut res = attr.quantize(&mut img).unwrap();
    res.set_dithering_level(0.).unwrap();
    let (pal, idx) = res.remapped(&mut img).unwrap();
    let first = idx[0];
    assert!(idx.iter().all(|&x| x == first));
    assert_eq!(0, pal[usize::from(first)].a);

    res.set_dithering_level(1.).unwrap();
    let (_, idx) = res.remapped(&mut img).unwrap();
    let first = idx[0];
    assert!(idx.iter().all(|&x| x == first));
}

#[test]
fn flat_gray_is_dithered_with_black_and_white() {
    use crate::attr::Attributes;
    use crate::hist::Histogram;
    use crate::pal::RGBA;

    let attr = Attributes::new();
    let mut hist = Histogram::new(&attr);
    hist.add_fixed_color(RGBA::new(0, 0, 0, 255), 0.).unwrap();
    hist.add_fixed_color(RGBA::new(255, 255, 255, 255), 0.).unwrap();
    let mut res = hist.quantize(&attr).unwrap();

    let pixels = vec![RGBA::new(128, 128, 128, 255); 32 * 32];
    let mut img = attr.new_image_borrowed(&pixels, 32, 32, 0.).unwrap();
    let (pal, idx) = res.remapped(&mut img).unwrap();
    assert_eq!(2, pal.len());
    let white = pal.iter().position(|&c| c == RGBA::new(255, 255, 255, 255)).unwrap();
    let whites = idx.iter().filter(|&&i| usize::from(i) == white).count();
    assert!(whites > 32 * 32 / 4 && whites < 32 * 32 * 3 / 4, "{whites}");

    res.set_dithering_level(0.).unwrap();
    let (_, idx) = res.remapped(&mut img).unwrap();
    assert!(idx.iter().all(|&i| i == idx[0]));
}
