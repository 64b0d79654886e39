//! Converts RGBA images to 8-bit palette images with alpha channel.
//!
//! The quantizer builds a palette of up to 256 colors with median cut followed by k-means refinement,
//! and remaps images to that palette, optionally with Floyd-Steinberg dithering.
//!
//! ```rust,ignore
//! let mut attr = rgbaquant::new();
//! attr.set_speed(5)?;
//! attr.set_quality(70, 99)?;
//!
//! let mut img = attr.new_image_borrowed(&pixels, width, height, 0.0)?;
//! let mut res = attr.quantize(&mut img)?;
//! res.set_dithering_level(1.0)?;
//! let (palette, indices) = res.remapped(&mut img)?;
//! ```
//!
//! To make one palette shared by several images, collect their colors in a [`Histogram`].
#![allow(clippy::bool_to_int_with_if)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_possible_wrap)]
#![allow(clippy::if_not_else)]
#![allow(clippy::inline_always)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::redundant_closure_for_method_calls)]
#![allow(clippy::similar_names)]
#![allow(clippy::too_many_arguments)]
#![deny(missing_docs)]

mod attr;
mod blur;
mod error;
mod hist;
mod image;
mod kmeans;
mod mediancut;
mod nearest;
mod pal;
mod quant;
#[cfg(not(feature = "threads"))]
mod rayoff;
mod remap;
mod rows;

pub use attr::{Attributes, ControlFlow, TransparencyOrder};
pub use attr::{DITHER_MAX, DITHER_MIN, QUALITY_BEST, QUALITY_GOOD, QUALITY_WORST, SPEED_DEFAULT, SPEED_FASTEST, SPEED_SLOWEST};
pub use error::Error;
pub use hist::{Histogram, HistogramEntry};
pub use image::Image;
pub use pal::RGBA;
pub use quant::QuantizationResult;

/// Above this many bytes of converted pixels, rows are converted on the fly instead of being cached
pub(crate) const HIGH_MEMORY_LIMIT: usize = 1 << 26;

/// Start here: creates new handle for library configuration
///
/// See [`Attributes`]
#[inline(always)]
#[must_use]
pub fn new() -> Attributes {
    Attributes::new()
}

/// Version of this library as `(major, minor, patch)`
#[must_use]
pub fn version() -> (u32, u32, u32) {
    let part = |s: &str| s.parse().unwrap_or(0);
    (
        part(env!("CARGO_PKG_VERSION_MAJOR")),
        part(env!("CARGO_PKG_VERSION_MINOR")),
        part(env!("CARGO_PKG_VERSION_PATCH")),
    )
}

/// Version of this library as text, e.g. `"0.3.0"`
#[must_use]
pub fn version_string() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

/// Makes floats sortable. NaN is treated as equal to everything.
#[derive(Debug, Copy, Clone, PartialEq, PartialOrd)]
pub(crate) struct OrdFloat<T>(T);

impl Eq for OrdFloat<f32> {}

impl Ord for OrdFloat<f32> {
    #[inline]
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0.partial_cmp(&other.0).unwrap_or(std::cmp::Ordering::Equal)
    }
}

impl Eq for OrdFloat<f64> {}

impl Ord for OrdFloat<f64> {
    #[inline]
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0.partial_cmp(&other.0).unwrap_or(std::cmp::Ordering::Equal)
    }
}

impl OrdFloat<f32> {
    #[inline(always)]
    pub fn new(v: f32) -> Self {
        debug_assert!(!v.is_nan());
        Self(v)
    }
}

impl OrdFloat<f64> {
    #[inline(always)]
    pub fn new64(v: f64) -> Self {
        debug_assert!(!v.is_nan());
        Self(v)
    }
}

#[test]
fn version_matches_package() {
    let (major, minor, patch) = version();
    assert_eq!(version_string(), format!("{major}.{minor}.{patch}"));
}

#[test]
fn ord_float() {
    let mut v = [OrdFloat::new(3.), OrdFloat::new(-1.), OrdFloat::new(0.5)];
    v.sort();
    assert_eq!([OrdFloat::new(-1.), OrdFloat::new(0.5), OrdFloat::new(3.)], v);
    assert!(OrdFloat::new64(1e20) > OrdFloat::new64(1e19));
}

#[test]
fn public_types_are_send() {
    fn is_send<T: Send>() {}
    fn is_sync<T: Sync>() {}
    is_send::<Attributes>();
    is_sync::<Attributes>();
    is_send::<Image<'_>>();
    is_send::<QuantizationResult>();
    is_send::<Histogram>();
}

#[test]
fn takes_rgba() {
    let img = vec![RGBA::new(0, 0, 0, 0); 640 * 480];

    let attr = new();
    let mut img = attr.new_image_borrowed(&img, 1, 1, 0.0).unwrap();
    let mut res = attr.quantize(&mut img).unwrap();
    let (pal, idx) = res.remapped(&mut img).unwrap();
    assert_eq!(1, pal.len());
    assert_eq!(0, pal[0].a);
    assert_eq!(&[0], &idx[..]);
}

#[test]
fn histogram() {
    let attr = new();
    let mut hist = Histogram::new(&attr);

    let bitmap1 = [RGBA::new(0, 0, 0, 0); 1];
    let mut image1 = attr.new_image_borrowed(&bitmap1[..], 1, 1, 0.0).unwrap();
    hist.add_image(&attr, &mut image1).unwrap();

    let bitmap2 = [RGBA::new(255, 255, 255, 255); 1];
    let mut image2 = attr.new_image_borrowed(&bitmap2[..], 1, 1, 0.0).unwrap();
    hist.add_image(&attr, &mut image2).unwrap();

    hist.add_colors(&[HistogramEntry {
        color: RGBA::new(255, 128, 255, 128),
        count: 10,
    }], 0.0).unwrap();

    let mut res = hist.quantize(&attr).unwrap();
    let pal = res.palette();
    assert_eq!(3, pal.len());
}

#[test]
fn poke_it() {
    let width = 10usize;
    let height = 10usize;
    let mut fakebitmap = vec![RGBA::new(255, 255, 255, 255); width * height];

    fakebitmap[0].r = 0x55;
    fakebitmap[0].g = 0x66;
    fakebitmap[0].b = 0x77;

    // Configure the library
    let mut liq = new();
    liq.set_speed(5).unwrap();
    liq.set_quality(70, 99).unwrap();
    liq.set_min_posterization(1).unwrap();
    assert_eq!(1, liq.min_posterization());
    liq.set_min_posterization(0).unwrap();

    use std::sync::atomic::AtomicBool;
    use std::sync::atomic::Ordering::SeqCst;
    use std::sync::Arc;

    let log_called = Arc::new(AtomicBool::new(false));
    let log_called2 = log_called.clone();
    liq.set_log_callback(move |_attr, _msg| {
        log_called2.store(true, SeqCst);
    });

    let prog_called = Arc::new(AtomicBool::new(false));
    let prog_called2 = prog_called.clone();
    liq.set_progress_callback(move |_perc| {
        prog_called2.store(true, SeqCst);
        ControlFlow::Continue
    });

    // Describe the bitmap
    let img = &mut liq.new_image(&fakebitmap[..], width, height, 0.0).unwrap();

    // The magic happens in quantize()
    let mut res = match liq.quantize(img) {
        Ok(res) => res,
        Err(err) => panic!("Quantization failed, because: {err:?}"),
    };

    // Enable dithering for subsequent remappings
    res.set_dithering_level(1.0).unwrap();

    // You can reuse the result to generate several images with the same palette
    let (palette, pixels) = res.remapped(img).unwrap();

    assert_eq!(width * height, pixels.len());
    assert_eq!(100, res.quantization_quality().unwrap());
    assert_eq!(RGBA { r: 255, g: 255, b: 255, a: 255 }, palette[0]);
    assert_eq!(RGBA { r: 0x55, g: 0x66, b: 0x77, a: 255 }, palette[1]);

    assert!(log_called.load(SeqCst));
    assert!(prog_called.load(SeqCst));
}

#[test]
fn set_importance_map() {
    let mut liq = new();
    let bitmap = &[RGBA::new(255, 0, 0, 255), RGBA::new(0u8, 0, 255, 255)];
    let mut img = liq.new_image(&bitmap[..], 2, 1, 0.).unwrap();
    let map = &[255, 0];
    img.set_importance_map(map).unwrap();
    let mut res = liq.quantize(&mut img).unwrap();
    let pal = res.palette();
    assert_eq!(1, pal.len(), "{pal:?}");
    assert_eq!(bitmap[0], pal[0]);

    liq.set_max_colors(2).unwrap();
    assert!(img.set_importance_map(&[]).is_err());
    assert_eq!(Err(Error::BufferTooSmall), img.set_importance_map(&[1]));
}

#[test]
fn thread() {
    let liq = Attributes::new();
    std::thread::spawn(move || {
        let b = vec![RGBA::new(0, 0, 0, 0); 1];
        liq.new_image_borrowed(&b, 1, 1, 0.).unwrap();
    }).join().unwrap();
}

#[test]
fn r_callback_test() {
    use std::sync::atomic::AtomicU16;
    use std::sync::atomic::Ordering::SeqCst;
    use std::sync::Arc;

    let called = Arc::new(AtomicU16::new(0));
    let called2 = called.clone();
    let mut res = {
        let a = new();
        let mut img = Image::new_fn(&a, move |output_row: &mut [RGBA], y: usize| {
            assert!(y < 5);
            assert_eq!(123, output_row.len());
            for (n, out) in output_row.iter_mut().enumerate() {
                let n = n as u8;
                *out = RGBA::new(n, n, n, n);
            }
            called2.fetch_add(1, SeqCst);
        }, 123, 5, 0.).unwrap();
        a.quantize(&mut img).unwrap()
    };
    let called = called.load(SeqCst);
    assert!(called >= 5 && called < 50);
    assert_eq!(123, res.palette().len());
}

#[test]
fn sizes() {
    use pal::{FloatPalette, FloatPixel};
    assert!(std::mem::size_of::<FloatPalette>() < pal::MAX_COLORS * (8 * 4) + 32, "{}", std::mem::size_of::<FloatPalette>());
    assert!(std::mem::size_of::<FloatPixel>() <= 4 * 4);
    assert!(std::mem::size_of::<QuantizationResult>() < pal::MAX_COLORS * 4 * 8 + 256, "{}", std::mem::size_of::<QuantizationResult>());
    assert!(std::mem::size_of::<Attributes>() <= 128, "{}", std::mem::size_of::<Attributes>());
    assert!(std::mem::size_of::<Image<'_>>() <= 256, "{}", std::mem::size_of::<Image<'_>>());
    assert!(std::mem::size_of::<Histogram>() <= 128, "{}", std::mem::size_of::<Histogram>());
}
