use crate::error::Error;
use crate::pal::{gamma_lut, FloatPixel, RGBA};
use crate::HIGH_MEMORY_LIMIT;
use std::borrow::Cow;

pub(crate) type RowCallback<'a> = dyn Fn(&mut [RGBA], usize) + Send + Sync + 'a;

pub(crate) enum PixelsSource<'pixels> {
    /// One buffer, rows `stride` pixels apart
    Contiguous {
        pixels: Cow<'pixels, [RGBA]>,
        stride: usize,
    },
    /// Each row is a separate slice, at least `width` long
    Rows(Box<[&'pixels [RGBA]]>),
    Callback(Box<RowCallback<'pixels>>),
}

/// Pixels of an image, readable row by row either as RGBA or already converted to [`FloatPixel`]
pub(crate) struct PixelRows<'pixels> {
    pub(crate) width: u32,
    pub(crate) height: u32,
    f_pixels: Option<Box<[FloatPixel]>>,
    pixels: PixelsSource<'pixels>,
    pub(crate) gamma: f64,
}

/// Per-thread state for reading rows. Rows generated by a callback and rows converted
/// on the fly need scratch space, so every reader has its own.
pub(crate) struct RowReader<'parent, 'pixels> {
    px: &'parent PixelRows<'pixels>,
    lut: [f32; 256],
    temp_row: Box<[RGBA]>,
    temp_f_row: Box<[FloatPixel]>,
}

impl<'parent, 'pixels> RowReader<'parent, 'pixels> {
    #[must_use]
    pub fn row_f(&mut self, row: usize) -> &[FloatPixel] {
        let px = self.px;
        let width = px.width();
        if let Some(pixels) = px.f_pixels.as_deref() {
            let start = width * row;
            return &pixels[start..start + width];
        }
        let row_pixels = px.row_rgba(&mut self.temp_row, row);
        PixelRows::convert_row_to_f(&mut self.temp_f_row, row_pixels, &self.lut);
        &self.temp_f_row
    }

    #[must_use]
    pub fn row_rgba(&mut self, row: usize) -> &[RGBA] {
        self.px.row_rgba(&mut self.temp_row, row)
    }
}

impl<'pixels> PixelRows<'pixels> {
    /// Dimensions and buffer lengths must be checked by the caller
    #[inline]
    pub(crate) fn new(width: u32, height: u32, pixels: PixelsSource<'pixels>, gamma: f64) -> Self {
        debug_assert!(gamma > 0.);
        Self { width, height, f_pixels: None, pixels, gamma }
    }

    fn row_rgba<'px>(&'px self, temp_row: &'px mut [RGBA], row: usize) -> &'px [RGBA] {
        let width = self.width();
        match &self.pixels {
            PixelsSource::Contiguous { pixels, stride } => {
                let start = stride * row;
                &pixels[start..start + width]
            },
            PixelsSource::Rows(rows) => &rows[row][..width],
            PixelsSource::Callback(cb) => {
                cb(&mut *temp_row, row);
                temp_row
            },
        }
    }

    fn convert_row_to_f(row_f_pixels: &mut [FloatPixel], row_pixels: &[RGBA], gamma_lut: &[f32; 256]) {
        debug_assert_eq!(row_f_pixels.len(), row_pixels.len());
        for (dst, src) in row_f_pixels.iter_mut().zip(row_pixels) {
            *dst = FloatPixel::from_rgba(gamma_lut, *src);
        }
    }

    #[must_use]
    fn should_use_low_memory(&self) -> bool {
        self.width() * self.height() > HIGH_MEMORY_LIMIT / std::mem::size_of::<FloatPixel>()
    }

    /// Converts the whole image once, unless it's too large to keep a converted copy
    pub fn prepare(&mut self, allow_streamed: bool) -> Result<(), Error> {
        if self.f_pixels.is_some() || (allow_streamed && self.should_use_low_memory()) {
            return Ok(());
        }

        let width = self.width();
        let lut = gamma_lut(self.gamma);
        let mut temp_row = temp_buf(width)?;
        let mut f_pixels = temp_buf(width * self.height())?;
        for (row, f_row) in f_pixels.chunks_exact_mut(width).enumerate() {
            let row_pixels = self.row_rgba(&mut temp_row, row);
            Self::convert_row_to_f(f_row, row_pixels, &lut);
        }
        self.f_pixels = Some(f_pixels);
        Ok(())
    }

    pub fn reader(&self) -> Result<RowReader<'_, 'pixels>, Error> {
        let width = self.width();
        let needs_conversion = self.f_pixels.is_none();
        Ok(RowReader {
            px: self,
            lut: gamma_lut(self.gamma),
            temp_row: temp_buf(if matches!(self.pixels, PixelsSource::Callback(_)) { width } else { 0 })?,
            temp_f_row: temp_buf(if needs_conversion { width } else { 0 })?,
        })
    }

    pub fn all_rows_f(&mut self) -> Result<&[FloatPixel], Error> {
        self.prepare(false)?;
        self.f_pixels.as_deref().ok_or(Error::Unsupported)
    }

    #[inline(always)]
    #[must_use]
    pub fn width(&self) -> usize {
        self.width as usize
    }

    #[inline(always)]
    #[must_use]
    pub fn height(&self) -> usize {
        self.height as usize
    }
}

/// Rows of palette indices being written
pub(crate) struct IndexRows<'a> {
    rows: Vec<&'a mut [u8]>,
}

impl<'a> IndexRows<'a> {
    /// `buf` must hold at least `width * height` bytes
    pub fn contiguous(buf: &'a mut [u8], width: usize, height: usize) -> Result<Self, Error> {
        let mut rows = Vec::new();
        rows.try_reserve_exact(height)?;
        rows.extend(buf.chunks_exact_mut(width).take(height));
        Ok(Self { rows })
    }

    /// Every row must be at least `width` long, and there must be at least `height` of them
    pub fn from_rows(buf: &'a mut [&mut [u8]], width: usize, height: usize) -> Result<Self, Error> {
        let mut rows = Vec::new();
        rows.try_reserve_exact(height)?;
        rows.extend(buf.iter_mut().take(height).map(|row| &mut row[..width]));
        Ok(Self { rows })
    }

    #[inline]
    pub fn rows_mut(&mut self) -> std::slice::IterMut<'_, &'a mut [u8]> {
        self.rows.iter_mut()
    }

    #[inline]
    pub fn rows(&self) -> std::slice::Iter<'_, &'a mut [u8]> {
        self.rows.iter()
    }
}

pub(crate) fn temp_buf<T: Default + Clone>(len: usize) -> Result<Box<[T]>, Error> {
    let mut v = Vec::new();
    v.try_reserve_exact(len)?;
    v.resize(len, T::default());
    Ok(v.into_boxed_slice())
}

#[test]
fn send() {
    fn is_send<T: Send>() {}
    fn is_sync<T: Sync>() {}
    is_send::<PixelRows<'_>>();
    is_sync::<PixelRows<'_>>();
    is_send::<RowReader<'_, '_>>();
    is_send::<IndexRows<'_>>();
}

#[test]
fn strided_rows() {
    let pixels: Vec<_> = (0..12u8).map(|n| RGBA::new(n, n, n, 255)).collect();
    let px = PixelRows::new(2, 3, PixelsSource::Contiguous { pixels: Cow::Borrowed(&pixels), stride: 4 }, 0.45455);
    let mut reader = px.reader().unwrap();
    assert_eq!(&pixels[4..6], reader.row_rgba(1));
    assert_eq!(&pixels[8..10], reader.row_rgba(2));
    assert_eq!(2, reader.row_f(2).len());
}

#[test]
fn callback_rows_are_cached() {
    let mut px = PixelRows::new(3, 2, PixelsSource::Callback(Box::new(|row: &mut [RGBA], y: usize| {
        row.iter_mut().for_each(|p| *p = RGBA::new(y as u8 * 100, 0, 0, 255));
    })), 0.45455);
    let lut = gamma_lut(0.45455);
    let streamed = px.reader().unwrap().row_f(1).to_vec();
    assert_eq!(FloatPixel::from_rgba(&lut, RGBA::new(100, 0, 0, 255)), streamed[0]);

    px.prepare(false).unwrap();
    assert_eq!(6, px.all_rows_f().unwrap().len());
    assert_eq!(&streamed[..], px.reader().unwrap().row_f(1));
}

#[test]
fn index_rows() {
    let mut buf = [0u8; 7];
    let mut rows = IndexRows::contiguous(&mut buf, 3, 2).unwrap();
    for (y, row) in rows.rows_mut().enumerate() {
        row.fill(y as u8 + 1);
    }
    assert_eq!(2, rows.rows().count());
    assert_eq!([1, 1, 1, 2, 2, 2, 0], buf);

    let mut a = [9u8; 4];
    let mut b = [9u8; 5];
    let mut row_bufs = [&mut a[..], &mut b[..]];
    let mut rows = IndexRows::from_rows(&mut row_bufs, 2, 2).unwrap();
    rows.rows_mut().for_each(|r| r.fill(0));
    assert_eq!([0, 0, 9, 9], a);
    assert_eq!([0, 0, 9, 9, 9], b);
}
