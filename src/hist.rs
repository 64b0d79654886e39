use crate::attr::Attributes;
use crate::error::*;
use crate::image::Image;
use crate::pal::{gamma_lut, FloatPixel, PalIndex, DEFAULT_GAMMA, MAX_COLORS, RGBA};
use crate::quant::QuantizationResult;
use crate::rows::PixelRows;
use std::collections::HashMap;
use std::fmt;
use std::hash::{BuildHasherDefault, Hasher};

/// Number of pixels in a given color for [`Histogram::add_colors()`]
///
/// Used for building a histogram manually. Otherwise see [`Histogram::add_image()`]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct HistogramEntry {
    /// The color
    pub color: RGBA,
    /// Importance of the color (e.g. number of occurrences)
    pub count: u32,
}

/// Generate one shared palette for multiple images
///
/// If you're converting one image at a time, see [`Attributes::quantize`] instead.
pub struct Histogram {
    gamma: Option<f64>,
    /// In order of addition, without duplicates
    fixed_colors: Vec<RGBA>,

    /// The key is the posterized RGBA cast to u32, 0 for all transparent colors.
    /// The value is the weight (255 per pixel) and the first color seen in that bucket.
    hashmap: HashMap<u32, (u32, RGBA), BuildHasherDefault<U32Hasher>>,

    posterize_bits: u8,
    max_histogram_entries: u32,
}

#[derive(Clone)]
pub(crate) struct HistItem {
    pub color: FloatPixel,
    pub adjusted_weight: f32,
    pub perceptual_weight: f32,
    /// temporary in median cut
    pub mc_color_weight: f32,
    /// temporary in median cut
    pub sort_key: u32,
    /// palette entry this color ended up in last time, a good first guess for nearest search
    pub likely_index: PalIndex,
}

impl fmt::Debug for HistItem {
    #[cold]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HistItem")
            .field("color", &self.color)
            .field("adjusted_weight", &self.adjusted_weight)
            .field("perceptual_weight", &self.perceptual_weight)
            .finish()
    }
}

impl Histogram {
    /// Creates histogram object that will be used to collect color statistics from multiple images.
    ///
    /// All options should be set on `attr` before the histogram object is created. Options changed later may not have effect.
    #[inline]
    #[must_use]
    pub fn new(attr: &Attributes) -> Self {
        Self {
            gamma: None,
            fixed_colors: Vec::new(),
            hashmap: HashMap::default(),
            posterize_bits: attr.posterize_bits(),
            max_histogram_entries: attr.max_histogram_entries(),
        }
    }

    /// "Learns" colors from the image, which will be later used to generate the palette.
    ///
    /// Fixed colors added to the image are also added to the histogram. If the total number of fixed colors exceeds 256,
    /// this function fails with [`Error::BufferTooSmall`] and the histogram is left unchanged.
    #[inline(never)]
    pub fn add_image(&mut self, attr: &Attributes, image: &mut Image<'_>) -> Result<(), Error> {
        if attr.progress(f32::from(attr.progress_stage1) * 0.40) {
            return Err(Aborted);
        }

        let mut fixed_colors = Vec::new();
        fixed_colors.try_reserve_exact(self.fixed_colors.len() + image.fixed_colors.len())?;
        fixed_colors.extend_from_slice(&self.fixed_colors);
        for &color in &image.fixed_colors {
            if !fixed_colors.contains(&color) {
                fixed_colors.push(color);
            }
        }
        if fixed_colors.len() > MAX_COLORS {
            attr.verbose_print(format!("  error: {} fixed colors in total, at most {MAX_COLORS} are allowed", fixed_colors.len()));
            return Err(BufferTooSmall);
        }
        let posterize_bits = attr.posterize_bits();
        let surface_area = image.width() * image.height();
        let estimated_colors = (surface_area / (usize::from(posterize_bits) + if surface_area > 512 * 512 { 7 } else { 5 })).min(250_000);
        self.reserve(estimated_colors);

        self.add_pixel_rows(&image.px, image.importance_map.as_deref())?;
        self.fixed_colors = fixed_colors;
        self.gamma = Some(image.gamma());
        self.init_posterize_bits(posterize_bits);
        if self.hashmap.len() > self.max_histogram_entries as usize && self.posterize_bits < 3 {
            attr.verbose_print(format!("  too many colors ({}), posterizing", self.hashmap.len()));
            self.init_posterize_bits(self.posterize_bits + 1);
        }
        Ok(())
    }

    /// Alternative to `add_image()`. Instead of counting colors in an image, it directly takes an array of colors and their counts.
    ///
    /// A count of `n` has the same weight as `n` pixels of that color added with `add_image()`.
    ///
    /// The gamma may be 0 to mean sRGB. All calls to `add_colors` and `add_fixed_color` should use the same gamma value.
    #[inline(never)]
    pub fn add_colors(&mut self, entries: &[HistogramEntry], gamma: f64) -> Result<(), Error> {
        if entries.is_empty() {
            return Err(InvalidPointer);
        }
        if entries.len() > 1 << 24 || !(0. ..1.).contains(&gamma) {
            return Err(ValueOutOfRange);
        }

        if self.gamma.is_none() && gamma > 0. {
            self.gamma = Some(gamma);
        }

        self.reserve(entries.len());
        for e in entries {
            self.add_color(e.color, e.count.saturating_mul(255));
        }
        Ok(())
    }

    /// Add a color guaranteed to be in the final palette
    ///
    /// The gamma may be 0 to mean sRGB. All calls to `add_colors` and `add_fixed_color` should use the same gamma value.
    pub fn add_fixed_color(&mut self, rgba: RGBA, gamma: f64) -> Result<(), Error> {
        if !(0. ..1.).contains(&gamma) {
            return Err(ValueOutOfRange);
        }
        if self.fixed_colors.contains(&rgba) {
            return Ok(());
        }
        if self.fixed_colors.len() >= MAX_COLORS {
            return Err(Unsupported);
        }

        if self.gamma.is_none() && gamma > 0. {
            self.gamma = Some(gamma);
        }
        self.fixed_colors.try_reserve(1)?;
        self.fixed_colors.push(rgba);
        Ok(())
    }

    /// Generate palette for all images/colors added to the histogram.
    ///
    /// Palette generated using this function won't be improved during remapping.
    /// If you're generating palette for only one image, it's better not to use the `Histogram`.
    #[inline]
    pub fn quantize(&mut self, attr: &Attributes) -> Result<QuantizationResult, Error> {
        self.quantize_internal(attr, true)
    }

    #[inline(never)]
    pub(crate) fn quantize_internal(&mut self, attr: &Attributes, freeze_result_colors: bool) -> Result<QuantizationResult, Error> {
        if self.hashmap.is_empty() && self.fixed_colors.is_empty() {
            return Err(Unsupported);
        }

        if attr.progress(0.) || attr.progress(f32::from(attr.progress_stage1) * 0.89) {
            return Err(Aborted);
        }

        let gamma = self.gamma.unwrap_or(DEFAULT_GAMMA);
        let hist = self.finalize_builder(gamma)?;

        attr.verbose_print(format!("  made histogram...{} colors found", hist.items.len()));

        QuantizationResult::new(attr, hist, freeze_result_colors, gamma)
    }

    #[inline(always)]
    fn add_color(&mut self, rgba: RGBA, weight: u32) {
        if weight == 0 {
            return;
        }

        let (key, rgba) = if rgba.a != 0 {
            (self.posterize_mask() & pack(rgba), rgba)
        } else {
            (0, RGBA::new(0, 0, 0, 0))
        };

        self.hashmap.entry(key)
            // it can overflow on images over 2^24 pixels large
            .and_modify(move |e| e.0 = e.0.saturating_add(weight))
            .or_insert((weight, rgba));
    }

    fn reserve(&mut self, entries: usize) {
        // assume some will be dupes, if called multiple times
        let new_entries = entries.saturating_sub(self.hashmap.len() / 3);
        self.hashmap.reserve(new_entries);
    }

    #[inline(always)]
    fn posterize_mask(&self) -> u32 {
        let channel_mask = 255u8 << self.posterize_bits;
        u32::from_ne_bytes([channel_mask; 4])
    }

    /// Merges entries that differ only in the ignored low bits
    fn init_posterize_bits(&mut self, posterize_bits: u8) {
        if self.posterize_bits >= posterize_bits {
            return;
        }
        self.posterize_bits = posterize_bits;
        let mask = self.posterize_mask();

        let new_size = (self.hashmap.len() / 3).max(self.hashmap.capacity() / 5);
        let mut merged = HashMap::with_capacity_and_hasher(new_size, BuildHasherDefault::default());
        for (key, (weight, color)) in self.hashmap.drain() {
            merged.entry(key & mask)
                .and_modify(|e: &mut (u32, RGBA)| {
                    // the heavier color represents the bucket
                    if weight > e.0 || (weight == e.0 && pack(color) < pack(e.1)) {
                        e.1 = color;
                    }
                    e.0 = e.0.saturating_add(weight);
                })
                .or_insert((weight, color));
        }
        self.hashmap = merged;
    }

    fn add_pixel_rows(&mut self, px: &PixelRows<'_>, importance_map: Option<&[u8]>) -> Result<(), Error> {
        let width = px.width();
        debug_assert!(importance_map.map_or(true, |m| m.len() >= width * px.height()));

        let mut importance_rows = importance_map.unwrap_or(&[]).chunks_exact(width);
        let mut reader = px.reader()?;
        for row in 0..px.height() {
            let pixels = reader.row_rgba(row);
            match importance_rows.next() {
                Some(weights) => {
                    for (&color, &weight) in pixels.iter().zip(weights) {
                        self.add_color(color, weight.into());
                    }
                },
                None => {
                    for &color in pixels {
                        self.add_color(color, 255);
                    }
                },
            }
        }
        Ok(())
    }

    /// Sorted, clustered, and converted to the internal color space.
    ///
    /// The hashmap is not modified, so the same histogram can be quantized again.
    pub(crate) fn finalize_builder(&self, gamma: f64) -> Result<HistogramInternal, Error> {
        debug_assert!(gamma > 0.);

        let mask = self.posterize_mask();
        let fixed_key = |c: RGBA| if c.a != 0 { mask & pack(c) } else { 0 };
        let mut fixed_keys = Vec::new();
        fixed_keys.try_reserve_exact(self.fixed_colors.len())?;
        fixed_keys.extend(self.fixed_colors.iter().map(|&c| fixed_key(c)));
        fixed_keys.sort_unstable();

        // weight 0 marks a fixed color, which gets the highest weight later
        let mut temp = Vec::new();
        temp.try_reserve_exact(self.hashmap.len() + self.fixed_colors.len())?;
        temp.extend(self.hashmap.iter()
            .filter(|(key, _)| fixed_keys.binary_search(*key).is_err())
            .map(|(&key, &(weight, color))| (key, weight, color)));
        temp.extend(self.fixed_colors.iter().map(|&color| (fixed_key(color), 0, color)));

        // hashmap iteration order depends on its history
        temp.sort_by_key(|&(key, _, _)| key);

        let mut counts = [0u32; MAX_CLUSTERS];
        for &(_, _, color) in &temp {
            counts[cluster_index(color)] += 1;
        }

        let mut clusters = [Cluster { begin: 0, end: 0 }; MAX_CLUSTERS];
        let mut next_begin = 0;
        for (cluster, count) in clusters.iter_mut().zip(counts) {
            cluster.begin = next_begin;
            cluster.end = next_begin;
            next_begin += count;
        }

        // Limit perceptual weight to 1/10th of the image surface area to prevent
        // a single color from dominating all others.
        let max_perceptual_weight = 0.1 * (temp.iter().map(|&(_, w, _)| f64::from(w)).sum::<f64>() / 256.) as f32;
        let fixed_weight = (max_perceptual_weight * 10.).max(1.);

        let mut items = Vec::new();
        items.try_reserve_exact(temp.len())?;
        items.resize(temp.len(), HistItem {
            color: FloatPixel::default(),
            adjusted_weight: 0.,
            perceptual_weight: 0.,
            mc_color_weight: 0.,
            sort_key: 0,
            likely_index: 0,
        });
        let mut items = items.into_boxed_slice();

        let lut = gamma_lut(gamma);
        let mut total_perceptual_weight = 0.;
        for (_, weight, color) in temp {
            let cluster = &mut clusters[cluster_index(color)];
            let item = &mut items[cluster.end as usize];
            cluster.end += 1;

            let weight = if weight > 0 {
                (weight as f32 * (1. / 256.)).min(max_perceptual_weight)
            } else {
                fixed_weight
            };
            total_perceptual_weight += f64::from(weight);

            item.color = FloatPixel::from_rgba(&lut, color);
            item.perceptual_weight = weight;
            item.adjusted_weight = weight;
        }

        let mut fixed_colors = Vec::new();
        fixed_colors.try_reserve_exact(self.fixed_colors.len())?;
        fixed_colors.extend(self.fixed_colors.iter().map(|&c| FloatPixel::from_rgba(&lut, c)));

        Ok(HistogramInternal {
            items,
            total_perceptual_weight,
            clusters,
            fixed_colors: fixed_colors.into_boxed_slice(),
        })
    }
}

#[inline(always)]
fn pack(color: RGBA) -> u32 {
    bytemuck::cast(color)
}

/// High bit of every channel
#[inline]
fn cluster_index(color: RGBA) -> usize {
    usize::from(((color.r >> 7) << 3) | ((color.g >> 7) << 2) | ((color.b >> 7) << 1) | (color.a >> 7))
}

/// Clusters form initial boxes for quantization, to ensure extreme colors are better represented
pub(crate) const MAX_CLUSTERS: usize = 16;

pub(crate) struct HistogramInternal {
    pub items: Box<[HistItem]>,
    pub total_perceptual_weight: f64,
    pub clusters: [Cluster; MAX_CLUSTERS],
    pub fixed_colors: Box<[FloatPixel]>,
}

/// Range of `HistogramInternal::items` with pre-grouped colors
#[derive(Copy, Clone, Debug)]
pub(crate) struct Cluster {
    pub begin: u32,
    pub end: u32,
}

/// Keys are already well-distributed colors, so a multiply is all the hashing they need
#[derive(Default, Clone, Copy)]
pub(crate) struct U32Hasher(u32);

impl Hasher for U32Hasher {
    // multiplier from fxhash
    #[inline(always)]
    fn finish(&self) -> u64 {
        u64::from(self.0).wrapping_mul(0x517c_c1b7_2722_0a95)
    }

    #[inline(always)]
    fn write_u32(&mut self, i: u32) {
        self.0 = i;
    }

    fn write(&mut self, bytes: &[u8]) {
        for &b in bytes {
            self.0 = self.0.rotate_left(8) ^ u32::from(b);
        }
    }
}

#[cfg(test)]
fn image_hist(attr: &Attributes, pixels: &[RGBA]) -> Histogram {
    let mut hist = Histogram::new(attr);
    let mut img = Image::new(attr, pixels, pixels.len(), 1, 0.).unwrap();
    hist.add_image(attr, &mut img).unwrap();
    hist
}

#[test]
fn transparent_colors_collapse() {
    let attr = Attributes::new();
    let hist = image_hist(&attr, &[RGBA::new(1, 2, 3, 0), RGBA::new(4, 5, 6, 0), RGBA::new(7, 8, 9, 255)]);
    assert_eq!(2, hist.hashmap.len());
    assert_eq!(Some(&(510, RGBA::new(0, 0, 0, 0))), hist.hashmap.get(&0));
}

#[test]
fn add_colors_errors() {
    let attr = Attributes::new();
    let mut hist = Histogram::new(&attr);
    assert_eq!(Err(InvalidPointer), hist.add_colors(&[], 0.));
    let e = [HistogramEntry { color: RGBA::new(1, 2, 3, 4), count: 1 }];
    assert_eq!(Err(ValueOutOfRange), hist.add_colors(&e, 1.));
    assert_eq!(Err(ValueOutOfRange), hist.add_colors(&e, -0.1));
    assert!(hist.hashmap.is_empty());
    assert_eq!(Err(Unsupported), hist.quantize(&attr).map(|_| ()));
    hist.add_colors(&e, 0.).unwrap();
    assert_eq!(1, hist.hashmap.len());
}

#[test]
fn counts_weigh_like_pixels() {
    let attr = Attributes::new();
    let red = RGBA::new(255, 0, 0, 255);
    let blue = RGBA::new(0, 0, 255, 255);
    let from_image = image_hist(&attr, &[red, blue, red, red]);

    let mut from_entries = Histogram::new(&attr);
    from_entries.add_colors(&[HistogramEntry { color: blue, count: 1 }, HistogramEntry { color: red, count: 3 }], 0.).unwrap();

    let a = from_image.finalize_builder(DEFAULT_GAMMA).unwrap();
    let b = from_entries.finalize_builder(DEFAULT_GAMMA).unwrap();
    assert_eq!(a.items.len(), b.items.len());
    assert_eq!(a.total_perceptual_weight, b.total_perceptual_weight);
    for (a, b) in a.items.iter().zip(b.items.iter()) {
        assert_eq!(a.color, b.color);
        assert_eq!(a.perceptual_weight, b.perceptual_weight);
    }
}

#[test]
fn finalized_order_is_deterministic() {
    let attr = Attributes::new();
    let colors: Vec<_> = (0..200u8).map(|i| RGBA::new(i, i.wrapping_mul(7), 255 - i, 128 + i / 2)).collect();
    let forward = image_hist(&attr, &colors);
    let reversed: Vec<_> = colors.iter().rev().copied().collect();
    let backward = image_hist(&attr, &reversed);

    let a = forward.finalize_builder(DEFAULT_GAMMA).unwrap();
    let b = backward.finalize_builder(DEFAULT_GAMMA).unwrap();
    assert!(a.items.iter().zip(b.items.iter()).all(|(a, b)| a.color == b.color));
    assert_eq!(0, a.clusters[0].begin);
    assert_eq!(a.items.len(), a.clusters[MAX_CLUSTERS - 1].end as usize);
    assert!(a.clusters.windows(2).all(|w| w[0].end == w[1].begin));
}

#[test]
fn fixed_colors_overflow_leaves_histogram_unchanged() {
    let attr = Attributes::new();
    let mut hist = Histogram::new(&attr);
    for i in 0..200u8 {
        hist.add_fixed_color(RGBA::new(i, 0, 0, 255), 0.).unwrap();
    }
    hist.add_fixed_color(RGBA::new(0, 0, 0, 255), 0.).unwrap();
    assert_eq!(200, hist.fixed_colors.len());

    let px = [RGBA::new(9, 9, 9, 255); 4];
    let mut img = Image::new(&attr, &px, 2, 2, 0.).unwrap();
    for i in 0..100u8 {
        img.add_fixed_color(RGBA::new(0, i, 1, 255)).unwrap();
    }
    assert_eq!(Err(BufferTooSmall), hist.add_image(&attr, &mut img));
    assert_eq!(200, hist.fixed_colors.len());
    assert_eq!(None, hist.gamma);
    assert!(hist.hashmap.is_empty());

    let finalized = hist.finalize_builder(DEFAULT_GAMMA).unwrap();
    assert_eq!(200, finalized.items.len());
    assert_eq!(200, finalized.fixed_colors.len());
    assert!(finalized.items.iter().all(|i| i.perceptual_weight > 0.));
}

#[test]
fn posterizes_when_too_many_colors() {
    let attr = Attributes::new();
    let mut hist = Histogram::new(&attr);
    hist.max_histogram_entries = 2;
    let px = [RGBA::new(10, 10, 10, 255), RGBA::new(11, 11, 11, 255), RGBA::new(100, 100, 100, 255), RGBA::new(101, 101, 101, 255)];
    let mut img = Image::new(&attr, &px, 4, 1, 0.).unwrap();
    hist.add_image(&attr, &mut img).unwrap();
    assert_eq!(1, hist.posterize_bits);
    assert_eq!(2, hist.hashmap.len());
    // buckets are keyed by the posterized color, but keep a real one
    assert_eq!(Some(&(510, RGBA::new(10, 10, 10, 255))), hist.hashmap.get(&pack(RGBA::new(10, 10, 10, 254))));
    assert_eq!(Some(&(510, RGBA::new(100, 100, 100, 255))), hist.hashmap.get(&pack(RGBA::new(100, 100, 100, 254))));
}

#[test]
fn posterized_colors_stay_opaque() {
    let mut attr = Attributes::new();
    attr.set_speed(10).unwrap();
    let px: Vec<_> = (0..64u8).map(|i| RGBA::new(i * 4, 255 - i * 3, i, 255)).collect();
    let hist = image_hist(&attr, &px);
    assert_eq!(1, hist.posterize_bits);
    assert!(hist.hashmap.values().all(|&(_, c)| c.a == 255));
    assert!(hist.hashmap.values().any(|&(_, c)| c.r % 2 == 1 || c.g % 2 == 1));
}

#[test]
fn fixed_color_replaces_its_posterized_bucket() {
    let mut attr = Attributes::new();
    attr.set_speed(10).unwrap();
    let px = [RGBA::new(10, 10, 10, 255), RGBA::new(200, 0, 0, 255)];
    let mut img = Image::new(&attr, &px, 2, 1, 0.).unwrap();
    img.add_fixed_color(RGBA::new(11, 11, 11, 255)).unwrap();
    let mut hist = Histogram::new(&attr);
    hist.add_image(&attr, &mut img).unwrap();
    assert_eq!(2, hist.hashmap.len());

    let finalized = hist.finalize_builder(DEFAULT_GAMMA).unwrap();
    assert_eq!(2, finalized.items.len());
    assert_eq!(1, finalized.fixed_colors.len());
}

#[test]
fn importance_map_weighs_pixels() {
    let attr = Attributes::new();
    let px = [RGBA::new(1, 1, 1, 255), RGBA::new(2, 2, 2, 255), RGBA::new(3, 3, 3, 255)];
    let mut img = Image::new(&attr, &px, 3, 1, 0.).unwrap();
    img.set_importance_map(&[0, 10, 255]).unwrap();
    let mut hist = Histogram::new(&attr);
    hist.add_image(&attr, &mut img).unwrap();
    assert_eq!(2, hist.hashmap.len());
    assert_eq!(10, hist.hashmap[&pack(px[1])].0);
    assert_eq!(255, hist.hashmap[&pack(px[2])].0);
}
