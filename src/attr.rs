use crate::error::Error;
use crate::hist::Histogram;
use crate::image::Image;
use crate::pal::{PalLen, MAX_COLORS, RGBA};
use crate::quant::{quality_to_mse, QuantizationResult};
use crate::remap::DitherMapMode;
use std::sync::Arc;

/// Slowest speed, best quality
pub const SPEED_SLOWEST: u8 = 1;
/// Speed used when none is set
pub const SPEED_DEFAULT: u8 = 3;
/// Fastest speed, rough palette
pub const SPEED_FASTEST: u8 = 10;

/// Accepts any palette
pub const QUALITY_WORST: u8 = 0;
/// Good enough for most images
pub const QUALITY_GOOD: u8 = 80;
/// No compromise
pub const QUALITY_BEST: u8 = 100;

/// No dithering
pub const DITHER_MIN: f32 = 0.;
/// Full Floyd-Steinberg dithering
pub const DITHER_MAX: f32 = 1.;

pub(crate) type ProgressCallback = dyn Fn(f32) -> ControlFlow + Send + Sync;
type LogCallback = dyn Fn(&Attributes, &str) + Send + Sync;
type LogFlushCallback = dyn Fn(&Attributes) + Send + Sync;

/// Where transparent colors go in the palette
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Default)]
pub enum TransparencyOrder {
    /// Entries with alpha come first, then opaque ones. Allows shortest tRNS chunk in PNG.
    #[default]
    SortedByAlpha,
    /// The most transparent entry is moved to the last index
    TransparentLast,
}

/// Starting point and settings for the quantization process
///
/// Setters validate their arguments, and leave the settings unchanged on error.
/// Clones are independent, but share the callbacks.
#[derive(Clone)]
pub struct Attributes {
    pub(crate) max_colors: PalLen,
    quality: (u8, u8),
    speed: u8,
    min_posterization_output: u8,
    pub(crate) transparency_order: TransparencyOrder,
    pub(crate) progress_stage1: u8,
    pub(crate) progress_stage2: u8,
    pub(crate) progress_stage3: u8,

    progress_callback: Option<Arc<ProgressCallback>>,
    log_callback: Option<Arc<LogCallback>>,
    log_flush_callback: Option<Arc<LogFlushCallback>>,
}

impl Attributes {
    /// New handle for library configuration
    ///
    /// Defaults are 256 colors, speed 3, quality 0-100, no posterization.
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        let mut attr = Self {
            max_colors: MAX_COLORS as PalLen,
            quality: (QUALITY_WORST, QUALITY_BEST),
            speed: SPEED_DEFAULT,
            min_posterization_output: 0,
            transparency_order: TransparencyOrder::SortedByAlpha,
            progress_stage1: 0,
            progress_stage2: 0,
            progress_stage3: 0,
            progress_callback: None,
            log_callback: None,
            log_flush_callback: None,
        };
        attr.update_progress_stages();
        attr
    }

    /// Make an image from RGBA pixels, copying them.
    ///
    /// The `pixels` argument can be `Vec<RGBA>`, `Box<[RGBA]>` or `&[RGBA]`.
    /// See [`Attributes::new_image_borrowed`] for a non-copying alternative.
    ///
    /// Use 0.0 for gamma if the image is sRGB (most images are).
    #[inline]
    pub fn new_image<VecRGBA>(&self, pixels: VecRGBA, width: usize, height: usize, gamma: f64) -> Result<Image<'static>, Error> where VecRGBA: Into<Vec<RGBA>> {
        Image::new_owned(self, pixels.into(), width, height, width, gamma)
    }

    /// Describe dimensions of a slice of RGBA pixels, without copying them
    ///
    /// Use 0.0 for gamma if the image is sRGB (most images are).
    #[inline]
    pub fn new_image_borrowed<'pixels>(&self, bitmap: &'pixels [RGBA], width: usize, height: usize, gamma: f64) -> Result<Image<'pixels>, Error> {
        Image::new(self, bitmap, width, height, gamma)
    }

    /// Like [`Attributes::new_image`], with `stride` pixels between starts of rows
    #[inline]
    pub fn new_image_stride<VecRGBA>(&self, pixels: VecRGBA, width: usize, height: usize, stride: usize, gamma: f64) -> Result<Image<'static>, Error> where VecRGBA: Into<Vec<RGBA>> {
        Image::new_owned(self, pixels.into(), width, height, stride, gamma)
    }

    /// Empty histogram for building one palette for multiple images
    #[inline]
    #[must_use]
    pub fn new_histogram(&self) -> Histogram {
        Histogram::new(self)
    }

    /// Generate palette for the image
    ///
    /// The palette may be improved further when the image is remapped.
    pub fn quantize(&self, image: &mut Image<'_>) -> Result<QuantizationResult, Error> {
        let mut hist = Histogram::new(self);
        hist.add_image(self, image)?;
        hist.quantize_internal(self, false)
    }

    /// 2-256. It's better to use `set_quality()`
    #[inline]
    pub fn set_max_colors(&mut self, colors: u32) -> Result<(), Error> {
        if !(2..=MAX_COLORS as u32).contains(&colors) {
            return Err(Error::ValueOutOfRange);
        }
        self.max_colors = colors as PalLen;
        Ok(())
    }

    /// Range 0-100, roughly like JPEG.
    ///
    /// If the minimum quality can't be met, the quantization will be aborted with [`Error::QualityTooLow`].
    ///
    /// Default is min 0, max 100, which means best effort, and never aborts the process.
    ///
    /// If max is less than 100, the library will try to use fewer colors.
    /// Images with fewer colors are not always smaller, due to increased dithering it causes.
    pub fn set_quality(&mut self, minimum: u8, target: u8) -> Result<(), Error> {
        if target > QUALITY_BEST || target < minimum {
            return Err(Error::ValueOutOfRange);
        }
        if target < 30 {
            self.verbose_print("  warning: quality set too low");
        }
        self.quality = (minimum, target);
        Ok(())
    }

    /// 1-10.
    ///
    /// Faster speeds generate images of lower quality, but may be useful
    /// for real-time generation of images.
    ///
    /// The default is 3.
    #[inline]
    pub fn set_speed(&mut self, value: i32) -> Result<(), Error> {
        if !(i32::from(SPEED_SLOWEST)..=i32::from(SPEED_FASTEST)).contains(&value) {
            return Err(Error::ValueOutOfRange);
        }
        self.speed = value as u8;
        self.update_progress_stages();
        Ok(())
    }

    /// Number of least significant bits to ignore, 0-4.
    ///
    /// Useful for generating palettes for VGA, 15-bit textures, or other retro platforms.
    #[inline]
    pub fn set_min_posterization(&mut self, value: u8) -> Result<(), Error> {
        if value > 4 {
            return Err(Error::ValueOutOfRange);
        }
        self.min_posterization_output = value;
        Ok(())
    }

    /// Returns number of bits of precision truncated
    #[inline(always)]
    #[must_use]
    pub fn min_posterization(&self) -> u8 {
        self.min_posterization_output
    }

    /// Return currently set speed/quality trade-off setting
    #[inline(always)]
    #[must_use]
    pub fn speed(&self) -> u32 {
        self.speed.into()
    }

    /// Return max number of colors set
    #[inline(always)]
    #[must_use]
    pub fn max_colors(&self) -> u32 {
        self.max_colors.into()
    }

    /// Reads values set with `set_quality`, as `(minimum, target)`
    #[inline]
    #[must_use]
    pub fn quality(&self) -> (u8, u8) {
        self.quality
    }

    /// Choose placement of transparent colors in the palette
    #[inline]
    pub fn set_transparency_order(&mut self, order: TransparencyOrder) {
        self.transparency_order = order;
    }

    /// Placement of transparent colors in the palette
    #[inline(always)]
    #[must_use]
    pub fn transparency_order(&self) -> TransparencyOrder {
        self.transparency_order
    }

    /// Move transparent color to the last entry in the palette
    ///
    /// This is less efficient for PNG, but required by some broken software
    #[inline]
    pub fn set_last_index_transparent(&mut self, is_last: bool) {
        self.transparency_order = if is_last { TransparencyOrder::TransparentLast } else { TransparencyOrder::SortedByAlpha };
    }

    /// Set callback function to be called every time the library wants to print a message.
    ///
    /// Without a callback, messages go to the `log` crate at debug level.
    ///
    /// To share data with the callback, use `Arc` or `Atomic*` types and `move ||` closures.
    #[inline]
    pub fn set_log_callback<F: Fn(&Attributes, &str) + Send + Sync + 'static>(&mut self, callback: F) {
        self.verbose_printf_flush();
        self.log_callback = Some(Arc::new(callback));
    }

    /// Callback for flushing output (if you buffer messages, that's the time to flush those buffers)
    #[inline]
    pub fn set_log_flush_callback<F: Fn(&Attributes) + Send + Sync + 'static>(&mut self, callback: F) {
        self.verbose_printf_flush();
        self.log_flush_callback = Some(Arc::new(callback));
    }

    /// Set callback function to be called every time the library makes a progress.
    /// It can be used to cancel operation early by returning [`ControlFlow::Break`].
    ///
    /// To share data with the callback, use `Arc` or `Atomic*` types and `move ||` closures.
    #[inline]
    pub fn set_progress_callback<F: Fn(f32) -> ControlFlow + Send + Sync + 'static>(&mut self, callback: F) {
        self.progress_callback = Some(Arc::new(callback));
    }

    // true == abort
    #[inline]
    #[must_use]
    pub(crate) fn progress(&self, percent: f32) -> bool {
        should_abort(self.progress_callback.as_deref(), percent)
    }

    #[inline(always)]
    pub(crate) fn verbose_print(&self, msg: impl AsRef<str>) {
        fn print(a: &Attributes, msg: &str) {
            match &a.log_callback {
                Some(f) => f(a, msg),
                None => log::debug!(target: "rgbaquant", "{}", msg.trim_start()),
            }
        }
        print(self, msg.as_ref());
    }

    #[inline]
    pub(crate) fn verbose_printf_flush(&self) {
        if let Some(f) = &self.log_flush_callback {
            f(self);
        }
    }

    fn update_progress_stages(&mut self) {
        let speed = self.speed;
        self.progress_stage1 = if self.dither_map_mode() != DitherMapMode::None { 20 } else { 8 };
        if self.feedback_loop_trials(0) < 2 {
            self.progress_stage1 += 30;
        }
        self.progress_stage3 = 50 / (1 + speed);
        self.progress_stage2 = 100 - self.progress_stage1 - self.progress_stage3;
    }

    /// Edge-aware dithering is slow, so it's used only at low speeds
    #[must_use]
    pub(crate) fn dither_map_mode(&self) -> DitherMapMode {
        match self.speed {
            0..=2 => DitherMapMode::Always,
            3..=5 => DitherMapMode::Enabled,
            _ => DitherMapMode::None,
        }
    }

    /// Histograms larger than this get posterized
    #[must_use]
    pub(crate) fn max_histogram_entries(&self) -> u32 {
        (1 << 17) + (1 << 18) * (10 - u32::from(self.speed))
    }

    #[must_use]
    pub(crate) fn feedback_loop_trials(&self, hist_items: usize) -> u16 {
        let mut trials = 56u16.saturating_sub(9 * u16::from(self.speed));
        for threshold in [5000, 25000, 50000, 100_000] {
            if hist_items > threshold {
                trials = (trials * 3 + 3) / 4;
            }
        }
        trials
    }

    /// `max_mse`, `target_mse`, user asked for perfect quality
    pub(crate) fn target_mse(&self, hist_items_len: usize) -> (Option<f64>, f64, bool) {
        let (minimum, target) = self.quality;
        let max_mse = if minimum > 0 {
            Some(quality_to_mse(minimum) * if hist_items_len <= MAX_COLORS { 0.33 } else { 1. })
        } else {
            None
        };
        let target_mse = quality_to_mse(target);
        let aim_for_perfect_quality = target_mse == 0.;
        let mut target_mse = target_mse.max((f64::from(1 << self.min_posterization_output) / 1024.).powi(2));
        if let Some(max_mse) = max_mse {
            target_mse = target_mse.min(max_mse);
        }
        (max_mse, target_mse, aim_for_perfect_quality)
    }

    /// returns iterations, `iteration_limit`
    #[must_use]
    pub(crate) fn kmeans_iterations(&self, hist_items_len: usize, palette_error_is_known: bool) -> (u16, f64) {
        let speed = u16::from(self.speed);
        let base = 8u16.saturating_sub(speed);
        let mut iterations = base + base * base / 2;
        let mut iteration_limit = 1. / f64::from(1u32 << (23 - speed));
        for threshold in [5000, 25000, 50000, 100_000] {
            if hist_items_len > threshold {
                iterations = (iterations * 3 + 3) / 4;
            }
        }
        if hist_items_len > 100_000 {
            iteration_limit *= 2.;
        }
        if iterations == 0 && !palette_error_is_known && self.quality.0 > 0 {
            iterations = 1;
        }
        (iterations, iteration_limit)
    }

    /// Bits removed while counting colors. Fast speeds ignore the lowest bit.
    #[inline]
    #[must_use]
    pub(crate) fn posterize_bits(&self) -> u8 {
        let input = if self.speed >= 8 { 1 } else { 0 };
        self.min_posterization_output.max(input)
    }
}

// true == abort
#[inline]
pub(crate) fn should_abort(callback: Option<&ProgressCallback>, percent: f32) -> bool {
    callback.map_or(false, |f| f(percent) == ControlFlow::Break)
}

impl Drop for Attributes {
    fn drop(&mut self) {
        self.verbose_printf_flush();
    }
}

impl Default for Attributes {
    #[inline(always)]
    fn default() -> Attributes {
        Attributes::new()
    }
}

/// Result of callback in [`Attributes::set_progress_callback`]
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ControlFlow {
    /// Continue processing as normal
    Continue,
    /// Abort processing and fail with [`Error::Aborted`]
    Break,
}

#[test]
fn counters() {
    let mut a = Attributes::new();
    a.set_speed(10).unwrap();
    let (iter, _) = a.kmeans_iterations(1000, false);
    assert_eq!(iter, 0);
    a.set_quality(80, 90).unwrap();
    let (iter, limit) = a.kmeans_iterations(1000, false);
    assert_eq!(iter, 1);
    assert!(limit > 0. && limit < 0.01);

    let (iter, _) = a.kmeans_iterations(1000, true);
    assert_eq!(iter, 0);

    let mut a = Attributes::new();
    a.set_quality(50, 80).unwrap();

    let (max_mse, target_mse, aim_perfect) = a.target_mse(10000);
    let max_mse = max_mse.unwrap();
    assert!(!aim_perfect);
    assert!(target_mse > 0. && target_mse < 0.01);
    assert!(max_mse > 0. && max_mse > target_mse && max_mse < 0.01);
}

#[test]
fn speed_derived_settings() {
    let mut a = Attributes::new();
    assert_eq!(3, a.speed());
    assert_eq!(29, a.feedback_loop_trials(1000));
    assert_eq!((17, 1. / f64::from(1 << 20)), a.kmeans_iterations(1000, true));
    assert_eq!(DitherMapMode::Enabled, a.dither_map_mode());
    assert_eq!((1 << 17) + (1 << 18) * 7, a.max_histogram_entries());
    assert_eq!(0, a.posterize_bits());

    a.set_speed(1).unwrap();
    assert_eq!(DitherMapMode::Always, a.dither_map_mode());
    a.set_speed(7).unwrap();
    assert_eq!(DitherMapMode::None, a.dither_map_mode());
    assert_eq!(0, a.feedback_loop_trials(10));
    a.set_speed(8).unwrap();
    assert_eq!(1, a.posterize_bits());
    assert!(a.feedback_loop_trials(200_000) <= a.feedback_loop_trials(10));
    assert_eq!(100, a.progress_stage1 + a.progress_stage2 + a.progress_stage3);
}

#[test]
fn getset() {
    let mut a = Attributes::new();
    assert!(a.set_quality(0, 101).is_err());
    assert!(a.set_quality(50, 49).is_err());
    assert_eq!((0, 100), a.quality());
    a.set_quality(60, 90).unwrap();
    assert_eq!((60, 90), a.quality());
    a.set_quality(0, 100).unwrap();
    assert!(a.feedback_loop_trials(1000) > 0);

    let (max_mse, target_mse, aim_perfect) = a.target_mse(10000);
    assert!(aim_perfect);
    assert!(target_mse < 0.0001);
    assert_eq!(max_mse, None);

    a.set_speed(5).unwrap();
    assert_eq!(5, a.speed());
    assert!(a.set_speed(99).is_err());
    assert!(a.set_speed(0).is_err());
    assert_eq!(5, a.speed());

    a.set_max_colors(5).unwrap();
    assert_eq!(5, a.max_colors());
    assert!(a.set_max_colors(0).is_err());
    assert!(a.set_max_colors(1).is_err());
    assert!(a.set_max_colors(257).is_err());
    assert_eq!(5, a.max_colors());

    a.set_min_posterization(2).unwrap();
    assert_eq!(2, a.min_posterization());
    assert_eq!(2, a.posterize_bits());
    assert!(a.set_min_posterization(8).is_err());
    assert_eq!(2, a.min_posterization());

    assert_eq!(TransparencyOrder::SortedByAlpha, a.transparency_order());
    a.set_last_index_transparent(true);
    assert_eq!(TransparencyOrder::TransparentLast, a.transparency_order());
    a.set_transparency_order(TransparencyOrder::SortedByAlpha);
    assert_eq!(TransparencyOrder::SortedByAlpha, a.transparency_order());
}

#[test]
fn clones_are_independent() {
    let mut a = Attributes::new();
    a.set_max_colors(16).unwrap();
    let mut b = a.clone();
    b.set_max_colors(32).unwrap();
    b.set_speed(9).unwrap();
    assert_eq!(16, a.max_colors());
    assert_eq!(3, a.speed());
    assert_eq!(32, b.max_colors());
}
