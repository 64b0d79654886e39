use crate::OrdFloat;
use arrayvec::ArrayVec;
use rgb::ComponentMap;
use std::ops::{Deref, DerefMut};

/// 8-bit RGBA with straight (non-premultiplied) alpha. The only color format in the public API.
pub type RGBA = rgb::RGBA8;

#[allow(clippy::upper_case_acronyms)]
pub(crate) type ArgbF = rgb::alt::ARGB<f32>;

/// Gamma of the internal color space. Input and output gammas are converted to/from it.
pub const INTERNAL_GAMMA: f64 = 0.57;

/// sRGB, used when 0 is given as gamma
pub const DEFAULT_GAMMA: f64 = 0.45455;

pub(crate) const WEIGHT_A: f32 = 0.625;
pub(crate) const WEIGHT_R: f32 = 0.5;
pub(crate) const WEIGHT_G: f32 = 1.;
pub(crate) const WEIGHT_B: f32 = 0.45;

/// Channels aren't in 0..1 range after weighting, so errors need to be scaled back
pub(crate) const WEIGHT_MSE: f64 = 0.45;

pub(crate) const MIN_OPAQUE_A: f32 = 1. / 256. * WEIGHT_A;
pub(crate) const MAX_TRANSPARENT_A: f32 = 255. / 256. * WEIGHT_A;

/// Largest palette that can be remapped to 1 byte per pixel
pub const MAX_COLORS: usize = 256;

pub(crate) type PalIndex = u8;
pub(crate) type PalLen = u16;

/// Premultiplied, channel-weighted color in the internal gamma.
///
/// All color math (distances, averages, dithering error) happens in this space.
#[derive(Debug, Copy, Clone, Default, PartialEq)]
pub(crate) struct FloatPixel(pub ArgbF);

impl FloatPixel {
    /// Perceptual distance.
    ///
    /// For every color channel takes the worse of the difference when both colors are
    /// composited on black and when they're composited on white, so alpha differences
    /// are penalized as much as they'd be visible.
    #[inline(always)]
    pub fn diff(&self, other: &FloatPixel) -> f32 {
        let alphas = other.0.a - self.0.a;
        let on_black = self.0 - other.0;
        let on_white_r = on_black.r + alphas;
        let on_white_g = on_black.g + alphas;
        let on_white_b = on_black.b + alphas;
        (on_black.r * on_black.r).max(on_white_r * on_white_r)
            + (on_black.g * on_black.g).max(on_white_g * on_white_g)
            + (on_black.b * on_black.b).max(on_white_b * on_white_b)
    }

    pub fn from_rgba(gamma_lut: &[f32; 256], px: RGBA) -> Self {
        let a = f32::from(px.a) / 255.;
        Self(ArgbF {
            a: a * WEIGHT_A,
            r: gamma_lut[px.r as usize] * WEIGHT_R * a,
            g: gamma_lut[px.g as usize] * WEIGHT_G * a,
            b: gamma_lut[px.b as usize] * WEIGHT_B * a,
        })
    }

    /// Back to 8-bit straight alpha in the given gamma. Fully transparent colors all become `0,0,0,0`.
    pub fn to_rgb(&self, gamma: f64) -> RGBA {
        if self.a < MIN_OPAQUE_A {
            return RGBA::new(0, 0, 0, 0);
        }

        let r = (WEIGHT_A / WEIGHT_R) * self.r / self.a;
        let g = (WEIGHT_A / WEIGHT_G) * self.g / self.a;
        let b = (WEIGHT_A / WEIGHT_B) * self.b / self.a;
        let a = (256. / WEIGHT_A) * self.a;

        let gamma = (gamma / INTERNAL_GAMMA) as f32;
        debug_assert!(gamma.is_finite());

        // values are in 0..255.999 and get truncated; float-to-int casts saturate
        RGBA {
            r: (r.powf(gamma) * 256.) as u8,
            g: (g.powf(gamma) * 256.) as u8,
            b: (b.powf(gamma) * 256.) as u8,
            a: a as u8,
        }
    }
}

impl Deref for FloatPixel {
    type Target = ArgbF;

    #[inline(always)]
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for FloatPixel {
    #[inline(always)]
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

impl From<ArgbF> for FloatPixel {
    #[inline(always)]
    fn from(x: ArgbF) -> Self {
        Self(x)
    }
}

/// How much of the image a palette entry covers, and whether it may be moved
#[derive(Copy, Clone, Debug, PartialEq)]
pub(crate) struct Popularity {
    weight: f32,
    fixed: bool,
}

impl Popularity {
    #[inline]
    #[cfg_attr(debug_assertions, track_caller)]
    pub fn new(weight: f32) -> Self {
        debug_assert!(weight >= 0.);
        Self { weight, fixed: false }
    }

    #[inline(always)]
    pub fn is_fixed(self) -> bool {
        self.fixed
    }

    #[must_use]
    pub fn to_fixed(self) -> Self {
        Self { weight: self.weight, fixed: true }
    }

    #[inline(always)]
    #[must_use]
    pub fn weight(self) -> f32 {
        self.weight
    }
}

/// Palette being worked on, in the internal color space
#[derive(Clone)]
pub(crate) struct FloatPalette {
    colors: ArrayVec<FloatPixel, MAX_COLORS>,
    pops: ArrayVec<Popularity, MAX_COLORS>,
}

impl FloatPalette {
    #[inline]
    pub fn new() -> Self {
        Self {
            colors: ArrayVec::new(),
            pops: ArrayVec::new(),
        }
    }

    #[inline(always)]
    pub fn push(&mut self, color: FloatPixel, popularity: Popularity) {
        self.colors.push(color);
        self.pops.push(popularity);
    }

    pub fn set(&mut self, idx: usize, color: FloatPixel, popularity: Popularity) {
        self.colors[idx] = color;
        self.pops[idx] = popularity;
    }

    #[inline(always)]
    pub fn as_slice(&self) -> &[FloatPixel] {
        &self.colors
    }

    #[inline(always)]
    pub fn pop_as_slice(&self) -> &[Popularity] {
        &self.pops
    }

    #[inline(always)]
    pub fn len(&self) -> usize {
        debug_assert_eq!(self.colors.len(), self.pops.len());
        self.colors.len()
    }

    #[inline(always)]
    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&mut FloatPixel, &mut Popularity)> {
        self.colors.iter_mut().zip(self.pops.iter_mut())
    }

    #[cfg_attr(debug_assertions, track_caller)]
    pub fn swap(&mut self, a: usize, b: usize) {
        self.colors.swap(a, b);
        self.pops.swap(a, b);
    }

    /// Makes every entry immovable, so remapping won't refine the colors
    pub fn freeze(&mut self) {
        self.pops.iter_mut().for_each(|p| *p = p.to_fixed());
    }

    /// Puts fixed colors at the start of the palette, replacing whichever entries are closest to them.
    ///
    /// `max_colors` is the user's limit, which may be higher than the length of a candidate palette.
    pub fn with_fixed_colors(mut self, max_colors: PalLen, fixed_colors: &[FloatPixel]) -> Self {
        if fixed_colors.is_empty() {
            return self;
        }

        let fixed_count = fixed_colors.len().min(usize::from(max_colors));
        // a low-quality median cut may not have made enough entries for all of them
        for &extra in fixed_colors.iter().take(fixed_count).skip(self.len()) {
            self.push(extra, Popularity::new(0.));
        }

        for (i, fixed) in fixed_colors.iter().enumerate().take(fixed_count) {
            let closest = self.colors.iter().enumerate().skip(i)
                .min_by_key(|(_, c)| OrdFloat::new(c.diff(fixed)))
                .map_or(i, |(idx, _)| idx);
            self.swap(i, closest);
            self.set(i, *fixed, self.pops[i].to_fixed());
        }

        debug_assert!(self.colors.iter().zip(fixed_colors).all(|(p, f)| p == f));
        self
    }

    /// Converts to 8-bit output colors.
    ///
    /// The float colors are replaced with their rounded versions, so that remapping
    /// measures errors against the colors that will actually be written out.
    pub fn make_int_palette(&mut self, gamma: f64, posterize: u8) -> Palette {
        let lut = gamma_lut(gamma);
        let mut int_palette = Palette::default();
        for (color, _) in self.iter_mut() {
            let px = color.to_rgb(gamma).map(|c| posterize_channel(c, posterize));
            *color = FloatPixel::from_rgba(&lut, px);
            int_palette.entries.push(px);
        }
        int_palette
    }
}

/// Drops the low `bits`, refilling them from the high bits so that 0 and 255 survive
#[inline]
pub(crate) fn posterize_channel(color: u8, bits: u8) -> u8 {
    if bits == 0 {
        color
    } else {
        (color & !((1u8 << bits) - 1)) | (color >> (8 - bits))
    }
}

/// Maps 8-bit channel values from the given gamma to the internal gamma
pub(crate) fn gamma_lut(gamma: f64) -> [f32; 256] {
    debug_assert!(gamma > 0.);
    let exponent = (INTERNAL_GAMMA / gamma) as f32;
    let mut lut = [0.; 256];
    for (i, v) in lut.iter_mut().enumerate() {
        *v = (i as f32 / 255.).powf(exponent);
    }
    lut
}

/// Premultiplies color by alpha, so that `r`, `g`, `b` never exceed `a`
#[must_use]
pub fn premultiply(px: RGBA) -> RGBA {
    let a = u16::from(px.a);
    let mul = move |c: u8| ((u16::from(c) * a + 127) / 255).min(a) as u8;
    RGBA::new(mul(px.r), mul(px.g), mul(px.b), px.a)
}

/// Final 8-bit colors, in palette index order
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Palette {
    entries: ArrayVec<RGBA, MAX_COLORS>,
}

impl Palette {
    /// Palette colors
    #[inline(always)]
    #[must_use]
    pub fn as_slice(&self) -> &[RGBA] {
        &self.entries
    }

    /// Colors with alpha premultiplied, see [`premultiply`]
    #[must_use]
    pub fn premultiplied(&self) -> Vec<RGBA> {
        self.entries.iter().copied().map(premultiply).collect()
    }
}

impl Deref for Palette {
    type Target = [RGBA];

    #[inline(always)]
    fn deref(&self) -> &Self::Target {
        self.as_slice()
    }
}

#[test]
fn diff_test() {
    let a = FloatPixel(ArgbF { a: 1., r: 0.2, g: 0.3, b: 0.5 });
    let b = FloatPixel(ArgbF { a: 1., r: 0.3, g: 0.3, b: 0.5 });
    let c = FloatPixel(ArgbF { a: 1., r: 1., g: 0.3, b: 0.5 });
    let d = FloatPixel(ArgbF { a: 0., r: 1., g: 0.3, b: 0.5 });
    assert!(a.diff(&b) < b.diff(&c));
    assert!(c.diff(&b) < c.diff(&d));
    assert_eq!(0., a.diff(&a));

    // alpha alone makes a difference
    let opaque = FloatPixel(ArgbF { a: WEIGHT_A, r: 0., g: 0., b: 0. });
    let clear = FloatPixel(ArgbF { a: 0., r: 0., g: 0., b: 0. });
    assert!(opaque.diff(&clear) > 0.);
    assert_eq!(opaque.diff(&clear), clear.diff(&opaque));
}

#[test]
fn rgb_round_trip() {
    let mut p = FloatPalette::new();
    let lut = gamma_lut(DEFAULT_GAMMA);
    for i in 0..=255u8 {
        p.push(FloatPixel::from_rgba(&lut, RGBA::new(i, 255 - i, i / 3, 100 + i / 2)), Popularity::new(1.));
    }
    assert_eq!(256, p.len());

    let int_pal = p.make_int_palette(DEFAULT_GAMMA, 0);
    for i in 0..=255u8 {
        let expected = RGBA::new(i, 255 - i, i / 3, 100 + i / 2);
        assert_eq!(expected, p.as_slice()[i as usize].to_rgb(DEFAULT_GAMMA));
        assert_eq!(expected, int_pal[i as usize]);
    }
}

#[test]
fn posterized_palette() {
    let lut = gamma_lut(DEFAULT_GAMMA);
    let mut p = FloatPalette::new();
    p.push(FloatPixel::from_rgba(&lut, RGBA::new(255, 17, 130, 255)), Popularity::new(1.));
    let int_pal = p.make_int_palette(DEFAULT_GAMMA, 4);
    assert_eq!(RGBA::new(255, 17, 136, 255), int_pal[0]);
    assert_eq!(0, posterize_channel(15, 4));
    assert_eq!(255, posterize_channel(255, 2));
    assert_eq!(0b1100_1100, posterize_channel(200, 4));
    assert_eq!(255, posterize_channel(254, 1));
    assert_eq!(0, posterize_channel(1, 1));
}

#[test]
fn transparent_is_zeroed() {
    let lut = gamma_lut(DEFAULT_GAMMA);
    let px = FloatPixel::from_rgba(&lut, RGBA::new(200, 100, 50, 0));
    assert_eq!(RGBA::new(0, 0, 0, 0), px.to_rgb(DEFAULT_GAMMA));
}

#[test]
fn premultiplied_never_exceeds_alpha() {
    assert_eq!(RGBA::new(128, 0, 64, 128), premultiply(RGBA::new(255, 0, 128, 128)));
    assert_eq!(RGBA::new(10, 20, 30, 255), premultiply(RGBA::new(10, 20, 30, 255)));
    assert_eq!(RGBA::new(0, 0, 0, 0), premultiply(RGBA::new(90, 90, 90, 0)));
    for a in 0..=255u8 {
        let p = premultiply(RGBA::new(255, 254, 1, a));
        assert!(p.r <= p.a && p.g <= p.a && p.b <= p.a);
    }
}

#[test]
fn fixed_colors_go_first() {
    let lut = gamma_lut(DEFAULT_GAMMA);
    let mut p = FloatPalette::new();
    for i in 0..4u8 {
        p.push(FloatPixel::from_rgba(&lut, RGBA::new(i * 60, 0, 0, 255)), Popularity::new(1.));
    }
    let fixed = [FloatPixel::from_rgba(&lut, RGBA::new(185, 0, 0, 255))];
    let p = p.with_fixed_colors(4, &fixed);
    assert_eq!(4, p.len());
    assert_eq!(fixed[0], p.as_slice()[0]);
    assert!(p.pop_as_slice()[0].is_fixed());
    assert!(!p.pop_as_slice()[1].is_fixed());

    // more fixed colors than entries in a candidate palette
    let mut small = FloatPalette::new();
    small.push(FloatPixel::default(), Popularity::new(1.));
    let fixed: Vec<_> = (0..3u8).map(|i| FloatPixel::from_rgba(&lut, RGBA::new(0, i * 100, 0, 255))).collect();
    let small = small.with_fixed_colors(2, &fixed);
    assert_eq!(2, small.len());
    assert_eq!(&fixed[..2], small.as_slice());
}
