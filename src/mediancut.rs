use crate::hist::{HistItem, HistogramInternal};
use crate::pal::{ArgbF, FloatPalette, FloatPixel, PalLen, Popularity};
use crate::quant::quality_to_mse;
use crate::{Error, OrdFloat};
use rgb::ComponentMap;
use std::cmp::Reverse;

/// Splits the histogram into boxes, until there are enough of them or they're small enough
struct MedianCutter<'hist> {
    boxes: Vec<ColorBox<'hist>>,
    hist_total_perceptual_weight: f64,
    target_colors: PalLen,
}

struct ColorBox<'hist> {
    /// Histogram entries that fell into this bucket
    colors: &'hist mut [HistItem],
    /// Center color selected to represent the colors
    avg_color: FloatPixel,
    /// Difference from the average color, per channel, weighed using `adjusted_weight`
    variance: ArgbF,
    adjusted_weight_sum: f64,
    total_error: Option<f64>,
    /// max color difference between `avg_color` and any histogram entry
    max_error: f32,
}

#[inline(always)]
fn channels(c: ArgbF) -> [f32; 4] {
    [c.a, c.r, c.g, c.b]
}

impl<'hist> ColorBox<'hist> {
    fn new(colors: &'hist mut [HistItem]) -> Self {
        let weight_sum = colors.iter().map(|item| {
            debug_assert!(item.adjusted_weight.is_finite() && item.adjusted_weight > 0.);
            f64::from(item.adjusted_weight)
        }).sum();
        let avg_color = weighed_average_color(colors);
        Self::with_color(colors, weight_sum, avg_color)
    }

    /// Half of a split box
    fn new_half(colors: &'hist mut [HistItem], adjusted_weight_sum: f64, other_boxes: &[ColorBox<'_>]) -> Self {
        debug_assert!(!colors.is_empty());
        let mut avg_color = weighed_average_color(colors);
        // The average may be close to none of the colors, and then it's better to have
        // an actual histogram color, so that at least one entry is represented exactly
        if (colors.len() > 2 && colors.len() < 500) || Self::is_useless_color(&avg_color, colors, other_boxes) {
            if let Some(closest) = colors.iter().min_by_key(|item| OrdFloat::new(avg_color.diff(&item.color))) {
                avg_color = closest.color;
            }
        }
        Self::with_color(colors, adjusted_weight_sum, avg_color)
    }

    fn with_color(colors: &'hist mut [HistItem], adjusted_weight_sum: f64, avg_color: FloatPixel) -> Self {
        let (variance, max_error) = box_stats(colors, &avg_color);
        Self { colors, avg_color, variance, adjusted_weight_sum, total_error: None, max_error }
    }

    /// Every color has a better match in another box
    fn is_useless_color(avg_color: &FloatPixel, colors: &[HistItem], other_boxes: &[ColorBox<'_>]) -> bool {
        colors.iter().all(|item| {
            let own_diff = avg_color.diff(&item.color);
            other_boxes.iter().any(|other| other.avg_color.diff(&item.color) < own_diff)
        })
    }

    fn compute_total_error(&mut self) -> f64 {
        let avg = self.avg_color;
        let e = self.colors.iter()
            .map(|item| f64::from(avg.diff(&item.color)) * f64::from(item.perceptual_weight))
            .sum::<f64>();
        self.total_error = Some(e);
        e
    }

    /// Sort key is the channel with the highest variance, with the other channels as tie-breakers,
    /// so that repeated median cuts with different weights don't depend on sort instability.
    fn prepare_sort(&mut self) {
        let variances = channels(self.variance);
        let mut order = [0usize, 1, 2, 3];
        order.sort_by_key(|&ch| Reverse(OrdFloat::new(variances[ch])));

        for item in self.colors.iter_mut() {
            let ch = channels(item.color.0);
            let primary = (ch[order[0]] * 65535.) as u32;
            let secondary = ((ch[order[2]] + ch[order[1]] / 2. + ch[order[3]] / 4.) * 65535.) as u32;
            item.sort_key = (primary << 16) | secondary;
        }
    }

    fn median_color(&mut self) -> FloatPixel {
        let mid = self.colors.len() / 2;
        let (_, median, _) = self.colors.select_nth_unstable_by_key(mid, |item| item.sort_key);
        median.color
    }

    /// Weight for splitting, so that both halves get a similar share of the error
    fn prepare_color_weight_total(&mut self) -> f64 {
        let median = self.median_color();
        self.colors.iter_mut().map(|item| {
            let w = median.diff(&item.color).sqrt() * (1. + item.adjusted_weight).sqrt();
            debug_assert!(w.is_finite());
            item.mc_color_weight = w;
            f64::from(w)
        }).sum()
    }

    fn split(mut self, other_boxes: &[ColorBox<'_>]) -> [Self; 2] {
        self.prepare_sort();
        let half_weight = self.prepare_color_weight_total() / 2.;
        let break_at = sort_half(self.colors, half_weight).max(1);

        let (left, right) = self.colors.split_at_mut(break_at);
        let left_sum = left.iter().map(|item| f64::from(item.adjusted_weight)).sum();
        let right_sum = self.adjusted_weight_sum - left_sum;

        [ColorBox::new_half(left, left_sum, other_boxes), ColorBox::new_half(right, right_sum, other_boxes)]
    }

    /// How much splitting this box would help. Boxes with outliers worse than `max_mse` are preferred.
    fn split_priority(&self, max_mse: f64) -> f64 {
        let color_variance = self.variance.r.max(self.variance.g).max(self.variance.b);
        let mut priority = self.adjusted_weight_sum * f64::from(color_variance.max(self.variance.a));
        if f64::from(self.max_error) > max_mse {
            priority = priority * f64::from(self.max_error) / max_mse;
        }
        priority
    }
}

fn box_stats(colors: &[HistItem], avg_color: &FloatPixel) -> (ArgbF, f32) {
    let mut variance = ArgbF::default();
    let mut max_error = 0f32;
    for item in colors {
        variance += (avg_color.0 - item.color.0).map(|c| c * c) * item.adjusted_weight;
        max_error = max_error.max(avg_color.diff(&item.color));
    }
    (variance, max_error)
}

fn pivot_index(items: &[HistItem]) -> usize {
    let len = items.len();
    if len < 32 {
        return len / 2;
    }
    let mut candidates = [8, len / 2, len - 1];
    candidates.sort_unstable_by_key(|&i| items[i].sort_key);
    candidates[1]
}

/// Partitions in descending order of `sort_key`. Returns index of the pivot.
fn partition(items: &mut [HistItem]) -> usize {
    items.swap(pivot_index(items), 0);
    let pivot = items[0].sort_key;
    let mut l = 1;
    let mut r = items.len();
    while l < r {
        if items[l].sort_key >= pivot {
            l += 1;
        } else {
            r -= 1;
            while l < r && items[r].sort_key <= pivot {
                r -= 1;
            }
            items.swap(l, r);
        }
    }
    l -= 1;
    items.swap(l, 0);
    l
}

/// Partially sorts the items, so that the sum of `mc_color_weight` on the left side is
/// about `weight_half_sum`. Returns the index where the sides meet.
fn sort_half(mut items: &mut [HistItem], mut weight_half_sum: f64) -> usize {
    let mut base_index = 0;
    while !items.is_empty() {
        let pivot = partition(items);
        // pivot stays on the left side
        let (left, right) = items.split_at_mut(pivot + 1);
        let left_sum = left.iter().map(|item| f64::from(item.mc_color_weight)).sum::<f64>();
        if left_sum >= weight_half_sum {
            if pivot == 0 {
                return base_index;
            }
            items = &mut left[..pivot];
            continue;
        }
        weight_half_sum -= left_sum;
        base_index += left.len();
        items = right;
    }
    base_index
}

impl<'hist> MedianCutter<'hist> {
    fn new(hist: &'hist mut HistogramInternal, target_colors: PalLen) -> Result<Self, Error> {
        let hist_total_perceptual_weight = hist.total_perceptual_weight;

        let mut boxes = Vec::new();
        boxes.try_reserve(usize::from(target_colors))?;

        let mut items = &mut hist.items[..];
        let used_clusters = hist.clusters.iter().filter(|c| c.begin != c.end).count();
        if used_clusters <= usize::from(target_colors) / 3 {
            // clusters are laid out in order, so they can be split off one by one
            for cluster in hist.clusters.iter().filter(|c| c.begin != c.end) {
                let (this_box, rest) = std::mem::take(&mut items).split_at_mut((cluster.end - cluster.begin) as usize);
                items = rest;
                boxes.push(ColorBox::new(this_box));
            }
        } else if !items.is_empty() {
            boxes.push(ColorBox::new(items));
        }

        Ok(Self { boxes, hist_total_perceptual_weight, target_colors })
    }

    fn total_box_error_below_target(&mut self, target_mse: f64) -> bool {
        let target = target_mse * self.hist_total_perceptual_weight;
        let mut total_error = self.boxes.iter().filter_map(|b| b.total_error).sum::<f64>();
        if total_error > target {
            return false;
        }
        for b in self.boxes.iter_mut().filter(|b| b.total_error.is_none()) {
            total_error += b.compute_total_error();
            if total_error > target {
                return false;
            }
        }
        true
    }

    fn cut(mut self, target_mse: f64, max_mse: f64) -> FloatPalette {
        let max_mse = max_mse.max(quality_to_mse(20));

        while self.boxes.len() < usize::from(self.target_colors) {
            // At first only boxes with outliers get split (to have colors for things like an odd green pixel),
            // later the limit is raised to give colors to large smooth areas and gradients.
            let fraction_done = self.boxes.len() as f64 / f64::from(self.target_colors);
            let current_max_mse = max_mse + fraction_done * 16. * max_mse;
            let Some(best) = self.take_best_splittable_box(current_max_mse) else {
                break;
            };

            let halves = best.split(&self.boxes);
            self.boxes.extend(halves);

            if self.total_box_error_below_target(target_mse) {
                break;
            }
        }

        self.into_palette()
    }

    fn take_best_splittable_box(&mut self, max_mse: f64) -> Option<ColorBox<'hist>> {
        let best = self.boxes.iter().enumerate()
            .filter(|(_, b)| b.colors.len() > 1)
            .max_by_key(|(_, b)| OrdFloat::new64(b.split_priority(max_mse)))
            .map(|(i, _)| i)?;
        Some(self.boxes.swap_remove(best))
    }

    fn into_palette(self) -> FloatPalette {
        let mut palette = FloatPalette::new();
        for (i, b) in self.boxes.into_iter().enumerate() {
            let ColorBox { colors, avg_color, .. } = b;
            let mut popularity = 0.;
            for item in colors.iter_mut() {
                item.likely_index = i as _;
                popularity += f64::from(item.perceptual_weight);
            }
            palette.push(avg_color, Popularity::new(popularity as f32));
        }
        palette
    }
}

/// Initial palette made by recursively splitting the histogram
#[inline(never)]
pub(crate) fn mediancut(hist: &mut HistogramInternal, target_colors: PalLen, target_mse: f64, max_mse_per_color: f64) -> Result<FloatPalette, Error> {
    Ok(MedianCutter::new(hist, target_colors)?.cut(target_mse, max_mse_per_color))
}

fn weighed_average_color(colors: &[HistItem]) -> FloatPixel {
    debug_assert!(!colors.is_empty());
    let mut sum = ArgbF::default();
    let mut total = 0.;
    for item in colors {
        total += item.adjusted_weight;
        sum += item.color.0 * item.adjusted_weight;
    }
    if total != 0. {
        sum /= total;
    }
    FloatPixel(sum)
}

#[cfg(test)]
fn test_hist(colors: &[(crate::pal::RGBA, u32)]) -> HistogramInternal {
    use crate::attr::Attributes;
    use crate::hist::{Histogram, HistogramEntry};
    let attr = Attributes::new();
    let mut hist = Histogram::new(&attr);
    let entries: Vec<_> = colors.iter().map(|&(color, count)| HistogramEntry { color, count }).collect();
    hist.add_colors(&entries, 0.).unwrap();
    hist.finalize_builder(crate::pal::DEFAULT_GAMMA).unwrap()
}

#[test]
fn splits_far_apart_colors() {
    use crate::pal::RGBA;
    let mut hist = test_hist(&[
        (RGBA::new(255, 0, 0, 255), 10), (RGBA::new(250, 5, 0, 255), 10),
        (RGBA::new(0, 0, 255, 255), 10), (RGBA::new(5, 0, 250, 255), 10),
    ]);
    let pal = mediancut(&mut hist, 2, 0., quality_to_mse(80)).unwrap();
    assert_eq!(2, pal.len());
    let (a, b) = (pal.as_slice()[0], pal.as_slice()[1]);
    // one reddish and one bluish
    assert!((a.r > a.b) != (b.r > b.b), "{a:?} {b:?}");
    assert!(pal.pop_as_slice().iter().all(|p| p.weight() > 0.));
}

#[test]
fn stops_at_target_error() {
    use crate::pal::RGBA;
    let mut hist = test_hist(&[(RGBA::new(100, 100, 100, 255), 5), (RGBA::new(101, 100, 100, 255), 5)]);
    let pal = mediancut(&mut hist, 16, 1., quality_to_mse(80)).unwrap();
    assert!(pal.len() <= 2);
    assert!(!pal.as_slice().is_empty());
}

#[test]
fn sort_half_balances_weights() {
    use crate::pal::RGBA;
    let colors: Vec<_> = (0..100u8).map(|i| (RGBA::new(i * 2, 0, 0, 255), 1)).collect();
    let mut hist = test_hist(&colors);
    for (i, item) in hist.items.iter_mut().enumerate() {
        item.sort_key = i as u32 * 7 % 100;
        item.mc_color_weight = 1.;
    }
    let at = sort_half(&mut hist.items, 50.);
    assert!((49..=51).contains(&at), "{at}");
    let min_left = hist.items[..at].iter().map(|i| i.sort_key).min().unwrap();
    let max_right = hist.items[at..].iter().map(|i| i.sort_key).max().unwrap();
    assert!(min_left >= max_right);
}
