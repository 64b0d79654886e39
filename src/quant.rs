use crate::attr::{should_abort, Attributes, ControlFlow, ProgressCallback, TransparencyOrder};
use crate::error::*;
use crate::hist::HistogramInternal;
use crate::image::Image;
use crate::kmeans::Kmeans;
use crate::mediancut::mediancut;
use crate::pal::{FloatPalette, PalLen, Palette, Popularity, MAX_COLORS, MAX_TRANSPARENT_A, RGBA, WEIGHT_MSE};
use crate::remap::{DitherMapMode, Remapped};
use crate::rows::IndexRows;
use crate::OrdFloat;
use arrayvec::ArrayVec;
use std::cmp::Reverse;
use std::fmt;
use std::sync::Arc;

/// Palette made by [`Attributes::quantize()`] or [`Histogram::quantize()`][crate::Histogram::quantize],
/// which can remap any number of images.
pub struct QuantizationResult {
    pub(crate) palette: FloatPalette,
    int_palette: Option<Palette>,
    remapped: Option<Box<Remapped>>,
    progress_callback: Option<Arc<ProgressCallback>>,
    pub(crate) dither_level: f32,
    pub(crate) gamma: f64,
    pub(crate) palette_error: Option<f64>,
    pub(crate) min_posterization_output: u8,
    pub(crate) use_dither_map: DitherMapMode,
}

impl QuantizationResult {
    pub(crate) fn new(attr: &Attributes, hist: HistogramInternal, freeze_result_colors: bool, gamma: f64) -> Result<Self, Error> {
        if attr.progress(f32::from(attr.progress_stage1)) {
            return Err(Aborted);
        }
        let (max_mse, target_mse, aim_for_perfect_quality) = attr.target_mse(hist.items.len());
        let (mut palette, palette_error) = find_best_palette(attr, target_mse, aim_for_perfect_quality, max_mse, hist)?;
        if freeze_result_colors {
            palette.freeze();
        }

        let stages_done = f32::from(attr.progress_stage1) + f32::from(attr.progress_stage2) + f32::from(attr.progress_stage3) * 0.95;
        if attr.progress(stages_done) {
            return Err(Aborted);
        }

        if let (Some(palette_error), Some(max_mse)) = (palette_error, max_mse) {
            if palette_error > max_mse {
                attr.verbose_print(format!(
                    "  image degradation MSE={:0.3} (Q={}) exceeded limit of {:0.3} ({})",
                    mse_to_standard_mse(palette_error),
                    mse_to_quality(palette_error),
                    mse_to_standard_mse(max_mse),
                    mse_to_quality(max_mse)
                ));
                return Err(QualityTooLow);
            }
        }

        sort_palette(attr, &mut palette);

        Ok(Self {
            palette,
            int_palette: None,
            remapped: None,
            progress_callback: None,
            dither_level: 1.,
            gamma,
            palette_error,
            min_posterization_output: attr.min_posterization(),
            use_dither_map: attr.dither_map_mode(),
        })
    }

    /// 0 disables dithering, 1 is full Floyd-Steinberg. Default is 1.
    pub fn set_dithering_level(&mut self, value: f32) -> Result<(), Error> {
        if !(0. ..=1.).contains(&value) {
            return Err(ValueOutOfRange);
        }
        self.remapped = None;
        self.dither_level = value;
        Ok(())
    }

    /// Gamma of the output palette, in range (0, 1). The default is the gamma of the input, usually sRGB.
    pub fn set_output_gamma(&mut self, value: f64) -> Result<(), Error> {
        if value <= 0. || value >= 1. {
            return Err(ValueOutOfRange);
        }
        self.remapped = None;
        self.int_palette = None;
        self.gamma = value;
        Ok(())
    }

    /// Approximate gamma correction value used for the output
    #[inline]
    #[must_use]
    pub fn output_gamma(&self) -> f64 {
        self.gamma
    }

    /// Number 0-100 guessing how nice the input image will look if remapped to this palette
    #[must_use]
    pub fn quantization_quality(&self) -> Option<u8> {
        self.palette_error.map(mse_to_quality)
    }

    /// Approximate mean square error of the palette, on 0-65535 scale
    #[must_use]
    pub fn quantization_error(&self) -> Option<f64> {
        self.palette_error.map(mse_to_standard_mse)
    }

    /// Mean square error of the most recent remapping, or of the palette if nothing has been remapped yet
    #[must_use]
    pub fn remapping_error(&self) -> Option<f64> {
        self.last_error().map(mse_to_standard_mse)
    }

    /// Remapping error on the same 0-100 scale as [`Attributes::set_quality()`]
    #[must_use]
    pub fn remapping_quality(&self) -> Option<u8> {
        self.last_error().map(mse_to_quality)
    }

    fn last_error(&self) -> Option<f64> {
        self.remapped.as_ref()
            .and_then(|re| re.palette_error)
            .or(self.palette_error)
    }

    /// The final palette
    ///
    /// Remapping may refine the colors, so get the palette after remapping, not before.
    #[inline]
    #[must_use]
    pub fn palette(&mut self) -> &[RGBA] {
        self.int_palette().as_slice()
    }

    /// The final palette, copied
    #[must_use]
    pub fn palette_vec(&mut self) -> Vec<RGBA> {
        self.palette().to_vec()
    }

    /// The final palette with color channels multiplied by alpha
    #[must_use]
    pub fn palette_premultiplied(&mut self) -> Vec<RGBA> {
        self.int_palette().premultiplied()
    }

    /// Number of colors in the palette, without rounding the colors
    #[must_use]
    pub fn palette_len(&self) -> usize {
        self.palette.len()
    }

    fn int_palette(&mut self) -> &Palette {
        match &self.remapped {
            Some(remapped) => &remapped.int_palette,
            None => {
                let (palette, gamma, posterize) = (&self.palette, self.gamma, self.min_posterization_output);
                self.int_palette.get_or_insert_with(|| palette.clone().make_int_palette(gamma, posterize))
            },
        }
    }

    /// Called with percentage done while remapping. Return [`ControlFlow::Break`] to abort with [`Error::Aborted`].
    #[inline]
    pub fn set_progress_callback<F: Fn(f32) -> ControlFlow + Send + Sync + 'static>(&mut self, callback: F) {
        self.progress_callback = Some(Arc::new(callback));
    }

    // true == abort
    #[inline]
    pub(crate) fn remap_progress(&self, percent: f32) -> bool {
        should_abort(self.progress_callback.as_deref(), percent)
    }

    /// Remap the image into a palette and 1-byte-per-pixel indices
    pub fn remapped(&mut self, image: &mut Image<'_>) -> Result<(Vec<RGBA>, Vec<u8>), Error> {
        let mut buf = Vec::new();
        let pal = self.remap_into_vec(image, &mut buf)?;
        Ok((pal, buf))
    }

    /// Like [`remapped()`][Self::remapped], reusing the buffer. Returns the palette.
    pub fn remap_into_vec(&mut self, image: &mut Image<'_>, buf: &mut Vec<u8>) -> Result<Vec<RGBA>, Error> {
        let len = image.width() * image.height();
        buf.clear();
        buf.try_reserve_exact(len)?;
        buf.resize(len, 0);
        self.remap_into(image, buf)?;
        Ok(self.palette_vec())
    }

    /// Writes `width * height` indices into the buffer. It can be larger, the rest is left unchanged.
    ///
    /// Get the [`palette()`][Self::palette] _after_ this call, because remapping refines it.
    pub fn remap_into(&mut self, image: &mut Image<'_>, output_buf: &mut [u8]) -> Result<(), Error> {
        let (width, height) = (image.width(), image.height());
        let output_buf = output_buf.get_mut(..width * height).ok_or(BufferTooSmall)?;
        let rows = IndexRows::contiguous(output_buf, width, height)?;
        self.remap_rows(image, rows)
    }

    /// Writes indices into separately allocated rows. Needs at least `height` rows of at least `width` bytes.
    pub fn remap_into_rows(&mut self, image: &mut Image<'_>, output_rows: &mut [&mut [u8]]) -> Result<(), Error> {
        if output_rows.is_empty() {
            return Err(InvalidPointer);
        }
        let (width, height) = (image.width(), image.height());
        if output_rows.len() < height || output_rows[..height].iter().any(|row| row.len() < width) {
            return Err(BufferTooSmall);
        }
        let rows = IndexRows::from_rows(output_rows, width, height)?;
        self.remap_rows(image, rows)
    }

    fn remap_rows(&mut self, image: &mut Image<'_>, rows: IndexRows<'_>) -> Result<(), Error> {
        let remapped = Remapped::new(self, image, rows)?;
        self.remapped = Some(Box::new(remapped));
        Ok(())
    }
}

/// Opaque colors last, or the most transparent color last, and the rest by popularity
fn sort_palette(attr: &Attributes, palette: &mut FloatPalette) {
    let transparent_last = attr.transparency_order == TransparencyOrder::TransparentLast;

    let mut tmp: ArrayVec<_, MAX_COLORS> = palette.iter_mut().map(|(c, p)| (*c, *p)).collect();
    tmp.sort_by_key(|(color, pop)| {
        let is_transparent = color.a <= MAX_TRANSPARENT_A;
        (is_transparent == transparent_last, Reverse(OrdFloat::new(pop.weight())))
    });
    for ((dst_color, dst_pop), (color, pop)) in palette.iter_mut().zip(tmp) {
        *dst_color = color;
        *dst_pop = pop;
    }

    let transparent = palette.as_slice().iter().enumerate().filter(|(_, c)| c.a <= MAX_TRANSPARENT_A);
    if transparent_last {
        let most_transparent = transparent.min_by_key(|(_, c)| OrdFloat::new(c.a)).map(|(i, _)| i);
        if let Some(idx) = most_transparent {
            let last = palette.len() - 1;
            palette.swap(last, idx);
        }
    } else if let Some(num_transparent) = transparent.map(|(i, _)| i + 1).max() {
        attr.verbose_print(format!("  eliminated opaque tRNS-chunk entries...{num_transparent} {} transparent", if num_transparent == 1 { "entry" } else { "entries" }));
    }
}

impl fmt::Debug for QuantizationResult {
    #[cold]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "QuantizationResult(colors={}, q={})", self.palette.len(), self.quantization_quality().unwrap_or(0))
    }
}

/// Repeats median cut with weights adjusted by k-means, and keeps the palette with the lowest error
#[allow(clippy::or_fun_call)]
fn find_best_palette(attr: &Attributes, target_mse: f64, aim_for_perfect_quality: bool, max_mse: Option<f64>, mut hist: HistogramInternal) -> Result<(FloatPalette, Option<f64>), Error> {
    // items include the fixed colors
    if aim_for_perfect_quality && hist.items.len() <= usize::from(attr.max_colors) {
        return Ok(palette_from_histogram(&hist, attr.max_colors));
    }

    let mut max_colors = attr.max_colors;
    let total_trials = attr.feedback_loop_trials(hist.items.len()) as i16;
    let mut trials_left = total_trials;
    let mut best_palette = None;
    let mut target_mse_overshoot = if total_trials > 0 { 1.05 } else { 1. };
    let mut fails_in_a_row = 0;
    let mut palette_error = None;

    let mut palette = loop {
        let max_mse_per_color = target_mse.max(palette_error.unwrap_or(quality_to_mse(1))).max(quality_to_mse(51)) * 1.2;
        let mut new_palette = mediancut(&mut hist, max_colors, target_mse * target_mse_overshoot, max_mse_per_color)?
            .with_fixed_colors(attr.max_colors, &hist.fixed_colors);

        let stage_done = 1. - (f32::from(trials_left.max(0)) / f32::from(total_trials + 1)).powi(2);
        let overall_done = f32::from(attr.progress_stage1) + stage_done * f32::from(attr.progress_stage2);
        attr.verbose_print(format!("  selecting colors...{}%", (100. * stage_done) as u8));

        if trials_left <= 0 {
            break Some(new_palette);
        }

        let first_run_of_target_mse = best_palette.is_none() && target_mse > 0.;
        let total_error = Kmeans::iteration(&mut hist, &mut new_palette, !first_run_of_target_mse)?;
        if best_palette.is_none() || total_error < palette_error.unwrap_or(f64::MAX) || (total_error <= target_mse && new_palette.len() < usize::from(max_colors)) {
            // if the number of colors could be reduced, try to keep it that way
            if total_error < target_mse && total_error > 0. {
                target_mse_overshoot = (target_mse_overshoot * 1.25).min(target_mse / total_error);
            }
            palette_error = Some(total_error);
            max_colors = max_colors.min(new_palette.len() as PalLen + 1);
            trials_left -= 1;
            fails_in_a_row = 0;
            best_palette = Some(new_palette);
        } else {
            fails_in_a_row += 1;
            target_mse_overshoot = 1.;
            trials_left -= 5 + fails_in_a_row;
        }
        if attr.progress(overall_done) {
            return Err(Aborted);
        }
        if trials_left <= 0 {
            break best_palette;
        }
    }.ok_or(Unsupported)?;

    refine_palette(&mut palette, attr, &mut hist, max_mse, &mut palette_error)?;

    Ok((palette, palette_error))
}

/// K-means until the error stops improving
fn refine_palette(palette: &mut FloatPalette, attr: &Attributes, hist: &mut HistogramInternal, max_mse: Option<f64>, palette_error: &mut Option<f64>) -> Result<(), Error> {
    let (iterations, iteration_limit) = attr.kmeans_iterations(hist.items.len(), palette_error.is_some());
    if iterations == 0 {
        return Ok(());
    }
    attr.verbose_print("  moving colormap towards local minimum");

    let mut i = 0;
    while i < iterations {
        let stage_done = f32::from(i) / f32::from(iterations);
        let overall_done = f32::from(attr.progress_stage1) + f32::from(attr.progress_stage2) + stage_done * f32::from(attr.progress_stage3) * 0.89;
        if attr.progress(overall_done) {
            return Err(Aborted);
        }

        let pal_err = Kmeans::iteration(hist, palette, false)?;
        debug_assert!(pal_err < 1e20);
        let previous_palette_error = palette_error.replace(pal_err);
        if let Some(previous) = previous_palette_error {
            if (previous - pal_err).abs() < iteration_limit {
                break;
            }
        }
        i += if pal_err > max_mse.unwrap_or(1e20) * 1.5 { 2 } else { 1 };
    }
    Ok(())
}

/// Every histogram color gets its own entry
#[cold]
fn palette_from_histogram(hist: &HistogramInternal, max_colors: PalLen) -> (FloatPalette, Option<f64>) {
    let mut hist_pal = FloatPalette::new();
    for item in hist.items.iter() {
        hist_pal.push(item.color, Popularity::new(item.perceptual_weight));
    }
    (hist_pal.with_fixed_colors(max_colors, &hist.fixed_colors), Some(0.))
}

/// Maps 0-100 quality to the internal mean square error
pub(crate) fn quality_to_mse(quality: u8) -> f64 {
    if quality == 0 {
        return 1e20;
    }
    if quality >= 100 {
        return 0.;
    }
    let quality = f64::from(quality);
    let extra_low_quality_fudge = (0.016 / (0.001 + quality) - 0.001).max(0.);
    WEIGHT_MSE * (extra_low_quality_fudge + 2.5 / (210. + quality).powf(1.2) * (100.1 - quality) / 100.)
}

/// The highest quality whose error limit isn't exceeded
pub(crate) fn mse_to_quality(mse: f64) -> u8 {
    (1..=100).rev()
        .find(|&q| mse <= quality_to_mse(q) + 0.000_001)
        .unwrap_or(0)
}

/// Internal error on the 0-65535 scale of 8-bit channel values
#[inline]
pub(crate) fn mse_to_standard_mse(mse: f64) -> f64 {
    (mse * 65536. / 6.) / WEIGHT_MSE
}

#[test]
fn quality_mse_conversions() {
    assert_eq!(0., quality_to_mse(100));
    assert!(quality_to_mse(0) >= 1e20);
    let mut last = quality_to_mse(1);
    for q in 2..=100 {
        let mse = quality_to_mse(q);
        assert!(mse < last);
        last = mse;
        assert_eq!(q, mse_to_quality(mse));
    }
    assert_eq!(100, mse_to_quality(0.));
    assert_eq!(0, mse_to_quality(1e30));
    assert!((mse_to_standard_mse(WEIGHT_MSE) - 65536. / 6.).abs() < 1e-6);
}

#[test]
fn sorts_transparent_first_or_last() {
    use crate::pal::{gamma_lut, FloatPixel, DEFAULT_GAMMA};
    let lut = gamma_lut(DEFAULT_GAMMA);
    let make = || {
        let mut pal = FloatPalette::new();
        pal.push(FloatPixel::from_rgba(&lut, RGBA::new(255, 0, 0, 255)), Popularity::new(1.));
        pal.push(FloatPixel::from_rgba(&lut, RGBA::new(0, 0, 0, 0)), Popularity::new(2.));
        pal.push(FloatPixel::from_rgba(&lut, RGBA::new(0, 255, 0, 255)), Popularity::new(5.));
        pal.push(FloatPixel::from_rgba(&lut, RGBA::new(0, 0, 255, 128)), Popularity::new(3.));
        pal
    };

    let mut attr = Attributes::new();
    let mut pal = make();
    sort_palette(&attr, &mut pal);
    let weights: Vec<_> = pal.pop_as_slice().iter().map(|p| p.weight()).collect();
    assert_eq!(vec![3., 2., 5., 1.], weights);

    attr.set_transparency_order(TransparencyOrder::TransparentLast);
    let mut pal = make();
    sort_palette(&attr, &mut pal);
    assert_eq!(0., pal.as_slice()[3].a);
    assert!(pal.as_slice()[..3].iter().all(|c| c.a > 0.));
}
