use crate::pal::{FloatPalette, FloatPixel, PalIndex, MAX_COLORS};
use crate::{Error, OrdFloat};
use arrayvec::ArrayVec;

/// Vantage-point tree for finding the closest palette entry
pub(crate) struct Nearest<'pal> {
    root: Node,
    palette: &'pal FloatPalette,
    /// A color closer than this to an entry can't be closer to any other entry
    nearest_other_color_dist: [f32; MAX_COLORS],
}

const LEAF_MAX_SIZE: usize = 6;

struct Node {
    vantage_point: FloatPixel,
    idx: PalIndex,
    children: Children,
}

enum Children {
    Split {
        radius: f32,
        radius_squared: f32,
        near: Box<Node>,
        far: Box<Node>,
    },
    Leaf(ArrayVec<(PalIndex, FloatPixel), LEAF_MAX_SIZE>),
}

struct Visitor {
    distance: f32,
    distance_squared: f32,
    idx: PalIndex,
    exclude: Option<PalIndex>,
}

impl Visitor {
    fn unbounded(exclude: Option<PalIndex>) -> Self {
        Self { distance: f32::INFINITY, distance_squared: f32::INFINITY, idx: 0, exclude }
    }

    #[inline]
    fn visit(&mut self, distance_squared: f32, idx: PalIndex) {
        if distance_squared < self.distance_squared && self.exclude != Some(idx) {
            self.distance = distance_squared.sqrt();
            self.distance_squared = distance_squared;
            self.idx = idx;
        }
    }
}

impl<'pal> Nearest<'pal> {
    #[inline(never)]
    pub fn new(palette: &'pal FloatPalette) -> Result<Self, Error> {
        if palette.len() > MAX_COLORS {
            return Err(Error::Unsupported);
        }
        let mut indexes = Vec::new();
        indexes.try_reserve_exact(palette.len())?;
        indexes.extend((0..palette.len()).map(|i| i as PalIndex));
        let root = Node::build(&mut indexes, palette).ok_or(Error::Unsupported)?;

        let mut nearest_other_color_dist = [0.; MAX_COLORS];
        for (i, color) in palette.as_slice().iter().enumerate() {
            let mut best = Visitor::unbounded(Some(i as PalIndex));
            root.search(color, &mut best);
            // half of the distance, squared
            nearest_other_color_dist[i] = best.distance_squared / 4.;
        }
        Ok(Self { root, palette, nearest_other_color_dist })
    }

    /// Index and distance of the closest palette entry.
    ///
    /// `likely_index` is checked first, and if it's close enough the tree isn't searched at all. It doesn't need to be valid.
    #[inline]
    pub fn search(&self, px: &FloatPixel, likely_index: PalIndex) -> (PalIndex, f32) {
        let mut best = match self.palette.as_slice().get(usize::from(likely_index)) {
            Some(guess) => {
                let guess_diff = px.diff(guess);
                if guess_diff < self.nearest_other_color_dist[usize::from(likely_index)] {
                    return (likely_index, guess_diff);
                }
                Visitor {
                    distance: guess_diff.sqrt(),
                    distance_squared: guess_diff,
                    idx: likely_index,
                    exclude: None,
                }
            },
            None => Visitor::unbounded(None),
        };
        self.root.search(px, &mut best);
        (best.idx, best.distance_squared)
    }
}

impl Node {
    /// The most popular color is the vantage point, the rest is split in half by distance from it
    fn build(indexes: &mut [PalIndex], palette: &FloatPalette) -> Option<Self> {
        let colors = palette.as_slice();
        let pops = palette.pop_as_slice();

        let most_popular = indexes.iter().enumerate()
            .max_by_key(|&(_, &idx)| OrdFloat::new(pops[usize::from(idx)].weight()))
            .map(|(n, _)| n)?;
        indexes.swap(most_popular, 0);
        let (&mut idx, rest) = indexes.split_first_mut()?;
        let vantage_point = colors[usize::from(idx)];

        rest.sort_unstable_by_key(|&i| OrdFloat::new(vantage_point.diff(&colors[usize::from(i)])));

        let children = if rest.len() <= LEAF_MAX_SIZE {
            Children::Leaf(rest.iter().map(|&i| (i, colors[usize::from(i)])).collect())
        } else {
            let (near, far) = rest.split_at_mut(rest.len() / 2);
            let radius_squared = vantage_point.diff(&colors[usize::from(far[0])]);
            Children::Split {
                radius: radius_squared.sqrt(),
                radius_squared,
                near: Box::new(Self::build(near, palette)?),
                far: Box::new(Self::build(far, palette)?),
            }
        };
        Some(Self { vantage_point, idx, children })
    }

    fn search(&self, needle: &FloatPixel, best: &mut Visitor) {
        let mut node = self;
        loop {
            let distance_squared = node.vantage_point.diff(needle);
            best.visit(distance_squared, node.idx);

            match &node.children {
                Children::Split { radius, radius_squared, near, far } => {
                    let distance = distance_squared.sqrt();
                    // the likelier side first, to narrow down the best distance early
                    if distance_squared < *radius_squared {
                        near.search(needle, best);
                        // the answer can still be just outside the radius
                        if distance >= radius - best.distance {
                            node = far;
                            continue;
                        }
                    } else {
                        far.search(needle, best);
                        if distance <= radius + best.distance {
                            node = near;
                            continue;
                        }
                    }
                    return;
                },
                Children::Leaf(entries) => {
                    for (idx, color) in entries {
                        best.visit(color.diff(needle), *idx);
                    }
                    return;
                },
            }
        }
    }
}

#[cfg(test)]
fn test_palette(colors: &[crate::pal::RGBA]) -> FloatPalette {
    use crate::pal::{gamma_lut, Popularity, DEFAULT_GAMMA};
    let lut = gamma_lut(DEFAULT_GAMMA);
    let mut pal = FloatPalette::new();
    for (i, &c) in colors.iter().enumerate() {
        pal.push(FloatPixel::from_rgba(&lut, c), Popularity::new(i as f32 % 7.));
    }
    pal
}

#[test]
fn matches_brute_force() {
    use crate::pal::{gamma_lut, RGBA, DEFAULT_GAMMA};
    let colors: Vec<_> = (0..100u32).map(|i| {
        let i = i as u8;
        RGBA::new(i.wrapping_mul(37), i.wrapping_mul(101), i.wrapping_mul(13), 255 - i)
    }).collect();
    let pal = test_palette(&colors);
    let nearest = Nearest::new(&pal).unwrap();
    let lut = gamma_lut(DEFAULT_GAMMA);

    for n in 0..500u32 {
        let px = FloatPixel::from_rgba(&lut, RGBA::new((n * 7) as u8, (n * 3) as u8, (n * 11) as u8, (n * 5) as u8));
        let best = pal.as_slice().iter().map(|c| c.diff(&px)).fold(f32::INFINITY, f32::min);
        for likely in [0, 50, 255] {
            let (idx, diff) = nearest.search(&px, likely);
            assert_eq!(best, diff);
            assert_eq!(best, pal.as_slice()[usize::from(idx)].diff(&px));
        }
    }
}

#[test]
fn exact_colors() {
    use crate::pal::RGBA;
    let colors = [RGBA::new(0, 0, 0, 255), RGBA::new(255, 255, 255, 255), RGBA::new(0, 0, 0, 0), RGBA::new(255, 0, 0, 255)];
    let pal = test_palette(&colors);
    let nearest = Nearest::new(&pal).unwrap();
    for (i, c) in pal.as_slice().iter().enumerate() {
        assert_eq!((i as PalIndex, 0.), nearest.search(c, 0));
    }
    assert!(Nearest::new(&FloatPalette::new()).is_err());
}
