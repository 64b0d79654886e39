use crate::attr::Attributes;
use crate::blur::{blur, max3, min3};
use crate::error::*;
use crate::pal::{FloatPalette, FloatPixel, DEFAULT_GAMMA, MAX_COLORS, MIN_OPAQUE_A, RGBA};
use crate::rows::{IndexRows, PixelRows, PixelsSource};
use crate::HIGH_MEMORY_LIMIT;
use rgb::ComponentMap;
use std::borrow::Cow;

/// Describes image dimensions and pixels for the library.
///
/// Borrowed pixels must outlive the image, which the `'pixels` lifetime enforces.
pub struct Image<'pixels> {
    pub(crate) px: PixelRows<'pixels>,
    pub(crate) importance_map: Option<Box<[u8]>>,
    pub(crate) edges: Option<Box<[u8]>>,
    pub(crate) dither_map: Option<Box<[u8]>>,
    pub(crate) background: Option<Box<Image<'pixels>>>,
    pub(crate) fixed_colors: Vec<RGBA>,
}

impl<'pixels> Image<'pixels> {
    pub(crate) fn new_internal(
        attr: &Attributes,
        pixels: PixelsSource<'pixels>,
        width: usize,
        height: usize,
        gamma: f64,
    ) -> Result<Self, Error> {
        let (width, height) = Self::check_image_size(width, height).ok_or_else(|| {
            attr.verbose_print("  error: image dimensions must be positive and fit in memory");
            ValueOutOfRange
        })?;

        if !(0. ..1.).contains(&gamma) {
            attr.verbose_print("  error: gamma must be >= 0 and < 1 (try 1/gamma instead)");
            return Err(ValueOutOfRange);
        }

        let img = Image {
            px: PixelRows::new(width, height, pixels, if gamma > 0. { gamma } else { DEFAULT_GAMMA }),
            importance_map: None,
            edges: None,
            dither_map: None,
            background: None,
            fixed_colors: Vec::new(),
        };
        if img.width() * img.height() > HIGH_MEMORY_LIMIT / std::mem::size_of::<FloatPixel>() {
            attr.verbose_print("  conserving memory");
        }
        Ok(img)
    }

    fn check_image_size(width: usize, height: usize) -> Option<(u32, u32)> {
        if width == 0 || height == 0 {
            return None;
        }
        if width.max(height) > i32::MAX as usize ||
            width > isize::MAX as usize / std::mem::size_of::<FloatPixel>() / height {
            return None;
        }
        Some((width as u32, height as u32))
    }

    /// Describe dimensions of a slice of RGBA pixels.
    ///
    /// See the [`rgb`] and [`bytemuck`](//lib.rs/bytemuck) crates for making `[RGBA]` slices from `[u8]` slices,
    /// or use [`Image::from_bytes`].
    ///
    /// Use `0.` for gamma if the image is sRGB (most images are).
    #[inline(always)]
    pub fn new(attr: &Attributes, pixels: &'pixels [RGBA], width: usize, height: usize, gamma: f64) -> Result<Self, Error> {
        Self::new_stride(attr, pixels, width, height, width, gamma)
    }

    /// Stride is in pixels. Allows defining regions of larger images or images with padding without copying.
    ///
    /// Otherwise the same as [`Image::new`].
    #[inline(always)]
    pub fn new_stride(attr: &Attributes, pixels: &'pixels [RGBA], width: usize, height: usize, stride: usize, gamma: f64) -> Result<Self, Error> {
        Self::new_contiguous(attr, Cow::Borrowed(pixels), width, height, stride, gamma)
    }

    /// Create new image by copying `pixels` to an internal buffer, so that it makes a self-contained type.
    ///
    /// Otherwise the same as [`Image::new_stride`].
    #[inline]
    pub fn new_stride_copy(attr: &Attributes, pixels: &[RGBA], width: usize, height: usize, stride: usize, gamma: f64) -> Result<Image<'static>, Error> {
        Image::new_contiguous(attr, Cow::Owned(pixels.to_vec()), width, height, stride, gamma)
    }

    pub(crate) fn new_owned(attr: &Attributes, pixels: Vec<RGBA>, width: usize, height: usize, stride: usize, gamma: f64) -> Result<Image<'static>, Error> {
        Image::new_contiguous(attr, Cow::Owned(pixels), width, height, stride, gamma)
    }

    /// Raw RGBA bytes, 4 per pixel, rows one after another
    ///
    /// Fails with [`Error::BufferTooSmall`] if the buffer doesn't hold `width`×`height` pixels.
    pub fn from_bytes(attr: &Attributes, bytes: &'pixels [u8], width: usize, height: usize, gamma: f64) -> Result<Self, Error> {
        let whole_pixels = bytes.len() / 4 * 4;
        let pixels: &[RGBA] = bytemuck::try_cast_slice(&bytes[..whole_pixels]).map_err(|_| BufferTooSmall)?;
        Self::new(attr, pixels, width, height, gamma)
    }

    /// Rows of RGBA bytes, each at least `width`×4 bytes long
    ///
    /// Rows don't need to be adjacent in memory.
    pub fn new_rows(attr: &Attributes, rows: &[&'pixels [u8]], width: usize, height: usize, gamma: f64) -> Result<Self, Error> {
        if rows.is_empty() {
            return Err(InvalidPointer);
        }
        if rows.len() < height {
            attr.verbose_print(format!("  error: {} rows given for image {} pixels high", rows.len(), height));
            return Err(BufferTooSmall);
        }
        let row_bytes = width.checked_mul(4).ok_or(ValueOutOfRange)?;
        let mut pixel_rows = Vec::new();
        pixel_rows.try_reserve_exact(height)?;
        for &row in &rows[..height] {
            let row = row.get(..row_bytes).ok_or(BufferTooSmall)?;
            pixel_rows.push(bytemuck::try_cast_slice::<u8, RGBA>(row).map_err(|_| BufferTooSmall)?);
        }
        Self::new_internal(attr, PixelsSource::Rows(pixel_rows.into_boxed_slice()), width, height, gamma)
    }

    /// Generate rows on demand using a callback function.
    ///
    /// The callback function gets a row to fill in and its index. It should be cheap (e.g. just byte-swap pixels),
    /// because it may be called multiple times per row, and from multiple threads at once.
    ///
    /// Use `0.` for gamma if the image is sRGB (most images are).
    pub fn new_fn<F: Fn(&mut [RGBA], usize) + Send + Sync + 'pixels>(attr: &Attributes, convert_row_fn: F, width: usize, height: usize, gamma: f64) -> Result<Self, Error> {
        Self::new_internal(attr, PixelsSource::Callback(Box::new(convert_row_fn)), width, height, gamma)
    }

    fn new_contiguous<'a>(attr: &Attributes, pixels: Cow<'a, [RGBA]>, width: usize, height: usize, stride: usize, gamma: f64) -> Result<Image<'a>, Error> {
        if stride < width {
            attr.verbose_print("  error: stride must not be smaller than width");
            return Err(ValueOutOfRange);
        }
        let required = stride.checked_mul(height.saturating_sub(1))
            .and_then(|len| len.checked_add(width))
            .ok_or(ValueOutOfRange)?;
        if pixels.len() < required {
            attr.verbose_print(format!("  error: buffer has {} pixels, which is not enough for {}×{} image with stride {}", pixels.len(), width, height, stride));
            return Err(BufferTooSmall);
        }
        Image::new_internal(attr, PixelsSource::Contiguous { pixels, stride }, width, height, gamma)
    }

    /// Remap pixels assuming they will be displayed on this background.
    ///
    /// Pixels that match the background color will be made transparent if there's a fully transparent color available in the palette.
    ///
    /// The background must have the same dimensions, and can't have a background of its own.
    pub fn set_background(&mut self, background: Image<'pixels>) -> Result<(), Error> {
        if background.background.is_some() {
            return Err(Unsupported);
        }
        if self.px.width != background.px.width || self.px.height != background.px.height {
            return Err(BufferTooSmall);
        }
        self.background = Some(Box::new(background));
        self.dither_map = None;
        Ok(())
    }

    /// Set which pixels are more important (and more likely to get a palette entry)
    ///
    /// The map must be `width`×`height` pixels large. Higher numbers = more important, 0 = ignored.
    pub fn set_importance_map(&mut self, map: &[u8]) -> Result<(), Error> {
        if map.is_empty() {
            return Err(InvalidPointer);
        }
        let map = map.get(..self.width() * self.height()).ok_or(BufferTooSmall)?;
        let mut copy = Vec::new();
        copy.try_reserve_exact(map.len())?;
        copy.extend_from_slice(map);
        self.importance_map = Some(copy.into_boxed_slice());
        Ok(())
    }

    /// Reserves a color in the output palette created from this image. It behaves as if the given color was used in the image and was very important.
    ///
    /// RGB values of the color are assumed to have the same gamma as the image.
    ///
    /// It must be called before the image is quantized.
    ///
    /// Returns error if more than 256 colors are added. If image is quantized to fewer colors than the number of fixed colors added, then excess fixed colors will be ignored.
    pub fn add_fixed_color(&mut self, color: RGBA) -> Result<(), Error> {
        if self.fixed_colors.len() >= MAX_COLORS {
            return Err(Unsupported);
        }
        self.fixed_colors.try_reserve(1)?;
        self.fixed_colors.push(color);
        Ok(())
    }

    /// Width of the image in pixels
    #[must_use]
    #[inline(always)]
    pub fn width(&self) -> usize {
        self.px.width()
    }

    /// Height of the image in pixels
    #[must_use]
    #[inline(always)]
    pub fn height(&self) -> usize {
        self.px.height()
    }

    /// Gamma of the pixels, where 0.45455 is sRGB
    #[must_use]
    #[inline(always)]
    pub fn gamma(&self) -> f64 {
        self.px.gamma
    }

    /// Builds the edge map: 255 = flat area, where dithering is welcome, 0 = noisy area or edge.
    ///
    /// Noisy areas are found from differences between horizontal and vertical neighbors, then shrunk
    /// and expanded to remove thin lines, which are edges that need to stay sharp.
    pub(crate) fn contrast_maps(&mut self) -> Result<(), Error> {
        let width = self.width();
        let height = self.height();
        if width < 4 || height < 4 || (3 * width * height) > HIGH_MEMORY_LIMIT || self.edges.is_some() {
            return Ok(());
        }

        let mut noise = crate::rows::temp_buf::<u8>(width * height)?;
        let mut edges = crate::rows::temp_buf::<u8>(width * height)?;
        let mut tmp = crate::rows::temp_buf::<u8>(width * height)?;

        let all_rows = self.px.all_rows_f()?;
        let row_at = |y: usize| &all_rows[y * width..(y + 1) * width];

        for (y, (noise_row, edges_row)) in noise.chunks_exact_mut(width).zip(edges.chunks_exact_mut(width)).enumerate() {
            let prev_row = row_at(y.saturating_sub(1));
            let curr_row = row_at(y);
            let next_row = row_at((y + 1).min(height - 1));
            for i in 0..width {
                let prev = curr_row[i.saturating_sub(1)].0;
                let curr = curr_row[i].0;
                let next = curr_row[(i + 1).min(width - 1)].0;
                // difference between pixels neighbouring horizontally and vertically, noise is amplified
                let horiz = (prev + next - curr * 2.).map(f32::abs);
                let vert = (prev_row[i].0 + next_row[i].0 - curr * 2.).map(f32::abs);
                let horiz = horiz.a.max(horiz.r).max(horiz.g.max(horiz.b));
                let vert = vert.a.max(vert.r).max(vert.g.max(vert.b));
                let edge = horiz.max(vert);
                let mut z = edge - (horiz - vert).abs() * 0.5;
                z = 1. - z.max(horiz.min(vert));
                z *= z;
                z *= z;
                // noisy pixels aren't 0, so that they still get some dithering
                noise_row[i] = (80. + z * 176.) as u8;
                edges_row[i] = ((1. - edge) * 256.) as u8;
            }
        }

        max3(&noise, &mut tmp, width, height);
        max3(&tmp, &mut noise, width, height);
        blur(&mut noise, &mut tmp, width, height, 3);
        max3(&noise, &mut tmp, width, height);
        min3(&tmp, &mut noise, width, height);
        min3(&noise, &mut tmp, width, height);
        min3(&tmp, &mut noise, width, height);
        min3(&edges, &mut tmp, width, height);
        max3(&tmp, &mut edges, width, height);
        for (edge, noise) in edges.iter_mut().zip(noise.iter()) {
            *edge = (*noise).min(*edge);
        }
        self.edges = Some(edges);
        Ok(())
    }

    /// Lowers dithering in areas where the undithered remap is already made of large flat areas of one color
    pub(crate) fn update_dither_map(&mut self, remapped_image: &IndexRows<'_>, palette: &FloatPalette) {
        let width = self.width();
        let uses_background = self.background.is_some();
        let mut edges = match self.edges.take() {
            Some(e) => e,
            None => return,
        };
        let colors = palette.as_slice();

        let mut prev_row: Option<&[u8]> = None;
        let mut rows = remapped_image.rows().map(|row| &row[..]).zip(edges.chunks_exact_mut(width)).peekable();
        while let Some((this_row, edges)) = rows.next() {
            let mut lastpixel = this_row[0];
            let mut lastcol = 0;
            for (col, px) in this_row.iter().copied().enumerate().skip(1) {
                if uses_background && colors[usize::from(px)].a < MIN_OPAQUE_A {
                    // transparency may or may not create an edge. When there's an explicit background set, assume no edge.
                    continue;
                }
                if px != lastpixel || col == width - 1 {
                    let mut neighbor_count = 10 * (col - lastcol);
                    for i in lastcol..col {
                        if prev_row.map_or(false, |prev_row| prev_row[i] == lastpixel) {
                            neighbor_count += 15;
                        }
                        if rows.peek().map_or(false, |(next_row, _)| next_row[i] == lastpixel) {
                            neighbor_count += 15;
                        }
                    }
                    while lastcol <= col {
                        let e = edges[lastcol];
                        edges[lastcol] = (f32::from(u16::from(e) + 128)
                            * (255. / (255 + 128) as f32)
                            * (1. - 20. / (20 + neighbor_count) as f32))
                            as u8;
                        lastcol += 1;
                    }
                    lastpixel = px;
                }
            }
            prev_row = Some(this_row);
        }
        self.dither_map = Some(edges);
    }
}

#[test]
fn dimensions_are_checked() {
    let attr = Attributes::new();
    let px = [RGBA::new(1, 2, 3, 4); 6];
    assert_eq!(ValueOutOfRange, Image::new(&attr, &px, 0, 1, 0.).err().unwrap());
    assert_eq!(ValueOutOfRange, Image::new(&attr, &px, 1, 0, 0.).err().unwrap());
    assert_eq!(BufferTooSmall, Image::new(&attr, &px, 3, 3, 0.).err().unwrap());
    assert_eq!(ValueOutOfRange, Image::new(&attr, &px, 2, 3, 1.).err().unwrap());
    assert_eq!(ValueOutOfRange, Image::new(&attr, &px, 2, 3, -0.5).err().unwrap());
    assert_eq!(ValueOutOfRange, Image::new_stride(&attr, &px, 3, 2, 2, 0.).err().unwrap());

    // the last row doesn't need padding
    let img = Image::new_stride(&attr, &px, 2, 2, 4, 0.).unwrap();
    assert_eq!((2, 2), (img.width(), img.height()));
    assert!((img.gamma() - DEFAULT_GAMMA).abs() < 1e-9);
    let img = Image::new(&attr, &px, 2, 3, 0.5).unwrap();
    assert_eq!(0.5, img.gamma());
}

#[test]
fn byte_inputs() {
    let attr = Attributes::new();
    let bytes = [10u8, 20, 30, 40, 50, 60, 70, 80, 90];
    let mut img = Image::from_bytes(&attr, &bytes, 2, 1, 0.).unwrap();
    let mut reader = img.px.reader().unwrap();
    assert_eq!(&[RGBA::new(10, 20, 30, 40), RGBA::new(50, 60, 70, 80)], reader.row_rgba(0));
    drop(reader);
    assert_eq!(BufferTooSmall, Image::from_bytes(&attr, &bytes, 3, 1, 0.).err().unwrap());
    img.add_fixed_color(RGBA::new(0, 0, 0, 0)).unwrap();

    let row0 = [1u8, 1, 1, 255, 2, 2, 2, 255];
    let row1 = [3u8, 3, 3, 255, 4, 4, 4, 255, 99];
    let img = Image::new_rows(&attr, &[&row0[..], &row1[..]], 2, 2, 0.).unwrap();
    let mut reader = img.px.reader().unwrap();
    assert_eq!(&[RGBA::new(3, 3, 3, 255), RGBA::new(4, 4, 4, 255)], reader.row_rgba(1));

    assert_eq!(InvalidPointer, Image::new_rows(&attr, &[], 2, 2, 0.).err().unwrap());
    assert_eq!(BufferTooSmall, Image::new_rows(&attr, &[&row0[..]], 2, 2, 0.).err().unwrap());
    assert_eq!(BufferTooSmall, Image::new_rows(&attr, &[&row0[..], &row1[..4]], 2, 2, 0.).err().unwrap());
}

#[test]
fn fixed_colors_and_background() {
    let attr = Attributes::new();
    let px = [RGBA::new(1, 2, 3, 255); 4];
    let mut img = Image::new(&attr, &px, 2, 2, 0.).unwrap();
    for i in 0..=255u8 {
        img.add_fixed_color(RGBA::new(i, i, i, 255)).unwrap();
    }
    assert_eq!(Unsupported, img.add_fixed_color(RGBA::new(1, 1, 1, 1)).unwrap_err());

    let wrong_size = Image::new(&attr, &px, 1, 4, 0.).unwrap();
    assert_eq!(BufferTooSmall, img.set_background(wrong_size).unwrap_err());

    let mut nested = Image::new(&attr, &px, 2, 2, 0.).unwrap();
    nested.set_background(Image::new(&attr, &px, 2, 2, 0.).unwrap()).unwrap();
    assert_eq!(Unsupported, img.set_background(nested).unwrap_err());

    img.set_background(Image::new(&attr, &px, 2, 2, 0.).unwrap()).unwrap();
}

#[test]
fn edge_map_of_flat_and_noisy_areas() {
    let attr = Attributes::new();
    let (width, height) = (16, 16);
    let px: Vec<_> = (0..width * height).map(|i| {
        let (x, y) = (i % width, i / width);
        if x < 8 { RGBA::new(100, 100, 100, 255) } else if (x + y) % 2 == 0 { RGBA::new(0, 0, 0, 255) } else { RGBA::new(255, 255, 255, 255) }
    }).collect();
    let mut img = Image::new(&attr, &px, width, height, 0.).unwrap();
    img.contrast_maps().unwrap();
    let edges = img.edges.as_deref().unwrap();
    assert_eq!(width * height, edges.len());
    // flat area is dithered more than the checkerboard
    assert!(edges[8 * width + 1] > edges[8 * width + 13]);

    let mut tiny = Image::new(&attr, &px[..9], 3, 3, 0.).unwrap();
    tiny.contrast_maps().unwrap();
    assert!(tiny.edges.is_none());
}
