use crate::hist::{HistItem, HistogramInternal};
use crate::nearest::Nearest;
use crate::pal::{FloatPalette, FloatPixel, PalIndex, Popularity};
use crate::Error;
use rgb::alt::ARGB;
use rgb::ComponentMap;
use std::cell::RefCell;

#[cfg(not(feature = "threads"))]
use crate::rayoff::*;
#[cfg(feature = "threads")]
use rayon::prelude::*;
#[cfg(feature = "threads")]
use thread_local::ThreadLocal;

/// Sums of colors matched to each palette entry.
///
/// Every thread collects its own, and they're merged at the end.
pub(crate) struct Kmeans {
    averages: Vec<ColorAvg>,
    weighed_diff_sum: f64,
}

#[derive(Copy, Clone, Default)]
struct ColorAvg {
    sum: ARGB<f64>,
    total: f64,
}

impl Kmeans {
    #[inline]
    pub fn new(pal_len: usize) -> Result<Self, Error> {
        let mut averages = Vec::new();
        averages.try_reserve_exact(pal_len)?;
        averages.resize(pal_len, ColorAvg::default());
        Ok(Self { averages, weighed_diff_sum: 0. })
    }

    #[inline]
    pub fn update_color(&mut self, px: FloatPixel, value: f32, matched: PalIndex) {
        let avg = &mut self.averages[usize::from(matched)];
        avg.sum += (px.0 * value).map(f64::from);
        avg.total += f64::from(value);
    }

    /// Moves every non-fixed entry to the average of its colors, and returns the sum of weighted errors
    pub fn finalize(self, palette: &mut FloatPalette) -> f64 {
        for (avg, (color, pop)) in self.averages.iter().zip(palette.iter_mut()) {
            if pop.is_fixed() {
                continue;
            }
            let total = avg.total;
            *pop = Popularity::new(total as f32);
            if total > 0. {
                *color = avg.sum.map(|c| (c / total) as f32).into();
            }
        }
        self.weighed_diff_sum
    }

    /// One k-means step over the whole histogram: matches every color to its nearest palette entry,
    /// then moves the entries. Returns the new mean error.
    ///
    /// With `adjust_weight`, colors that are poorly represented get more weight for the next median cut.
    #[inline(never)]
    pub(crate) fn iteration(hist: &mut HistogramInternal, palette: &mut FloatPalette, adjust_weight: bool) -> Result<f64, Error> {
        if hist.items.is_empty() {
            return Ok(0.);
        }

        let n = Nearest::new(palette)?;
        let colors = palette.as_slice();
        let len = colors.len();

        let tls = ThreadLocal::new();
        let total = hist.total_perceptual_weight;

        // chunk size is a trade-off between parallelization and overhead
        hist.items.par_chunks_mut(256).for_each(|batch| {
            let state = tls.get_or(|| RefCell::new(Kmeans::new(len)));
            if let Ok(kmeans) = &mut *state.borrow_mut() {
                kmeans.iterate_batch(batch, &n, colors, adjust_weight);
            }
        });

        let merged = tls.into_iter()
            .map(RefCell::into_inner)
            .reduce(Kmeans::try_merge)
            .transpose()?;
        let diff = match merged {
            Some(kmeans) if total > 0. => kmeans.finalize(palette) / total,
            Some(kmeans) => {
                kmeans.finalize(palette);
                0.
            },
            None => 0.,
        };

        // entries that lost all their colors get a color from the histogram instead
        let mut replacements = hist.items.iter().step_by((hist.items.len() / palette.len()).max(1));
        for (color, pop) in palette.iter_mut() {
            if pop.is_fixed() || pop.weight() > 0. {
                continue;
            }
            match replacements.next() {
                Some(item) => *color = item.color,
                None => break,
            }
        }
        Ok(diff)
    }

    fn iterate_batch(&mut self, batch: &mut [HistItem], n: &Nearest<'_>, colors: &[FloatPixel], adjust_weight: bool) {
        let mut diff_sum = 0.;
        for item in batch {
            let px = item.color;
            let (matched, mut diff) = n.search(&px, item.likely_index);
            item.likely_index = matched;
            if adjust_weight {
                // how far off would a dithered pixel be
                let remapped = colors[usize::from(matched)];
                let (_, overshoot_diff) = n.search(&FloatPixel(px.0 + px.0 - remapped.0), matched);
                diff = overshoot_diff;
                item.adjusted_weight = (item.perceptual_weight + 2. * item.adjusted_weight) * (0.5 + diff);
            }
            debug_assert!(f64::from(diff) < 1e20);
            self.update_color(px, item.adjusted_weight, matched);
            diff_sum += f64::from(diff * item.perceptual_weight);
        }
        self.weighed_diff_sum += diff_sum;
    }

    #[inline]
    pub fn merge(mut self, other: Kmeans) -> Kmeans {
        self.weighed_diff_sum += other.weighed_diff_sum;
        for (mine, theirs) in self.averages.iter_mut().zip(other.averages) {
            mine.sum += theirs.sum;
            mine.total += theirs.total;
        }
        self
    }

    #[inline]
    pub fn try_merge<E>(old: Result<Self, E>, new: Result<Self, E>) -> Result<Self, E> {
        Ok(Kmeans::merge(old?, new?))
    }
}

#[test]
fn moves_entries_to_averages() {
    use crate::attr::Attributes;
    use crate::hist::{Histogram, HistogramEntry};
    use crate::pal::{gamma_lut, DEFAULT_GAMMA, RGBA};

    let attr = Attributes::new();
    let mut hist = Histogram::new(&attr);
    hist.add_colors(&[
        HistogramEntry { color: RGBA::new(10, 10, 10, 255), count: 1 },
        HistogramEntry { color: RGBA::new(20, 20, 20, 255), count: 1 },
        HistogramEntry { color: RGBA::new(240, 240, 240, 255), count: 1 },
    ], 0.).unwrap();
    let mut hist = hist.finalize_builder(DEFAULT_GAMMA).unwrap();

    let lut = gamma_lut(DEFAULT_GAMMA);
    let mut palette = FloatPalette::new();
    palette.push(FloatPixel::from_rgba(&lut, RGBA::new(0, 0, 0, 255)), Popularity::new(1.));
    palette.push(FloatPixel::from_rgba(&lut, RGBA::new(255, 255, 255, 255)), Popularity::new(1.));
    palette.push(FloatPixel::from_rgba(&lut, RGBA::new(255, 0, 0, 255)), Popularity::new(1.).to_fixed());

    let err = Kmeans::iteration(&mut hist, &mut palette, false).unwrap();
    assert!(err > 0.);

    let dark = palette.as_slice()[0];
    let expected = (FloatPixel::from_rgba(&lut, RGBA::new(10, 10, 10, 255)).0 + FloatPixel::from_rgba(&lut, RGBA::new(20, 20, 20, 255)).0) * 0.5;
    assert!((dark.g - expected.g).abs() < 1e-5, "{dark:?} {expected:?}");
    let light = palette.as_slice()[1];
    assert!(light.diff(&FloatPixel::from_rgba(&lut, RGBA::new(240, 240, 240, 255))) < 1e-9);
    // fixed entries don't move
    assert_eq!(FloatPixel::from_rgba(&lut, RGBA::new(255, 0, 0, 255)), palette.as_slice()[2]);

    let err2 = Kmeans::iteration(&mut hist, &mut palette, false).unwrap();
    assert!(err2 <= err);
}
