/// Box-blurs rows (window of 2*size pixels) and writes them transposed to dst. Called twice gives a 2d blur.
#[inline(never)]
fn transposing_1d_blur(src: &[u8], dst: &mut [u8], width: usize, height: usize, size: u16) {
    let radius = usize::from(size);
    if width < 2 * radius + 1 || height < 2 * radius + 1 {
        return;
    }
    let window = size * 2;

    for (j, row) in src.chunks_exact(width).take(height).enumerate() {
        let mut sum = u16::from(row[0]) * size + row[..radius].iter().map(|&v| u16::from(v)).sum::<u16>();
        for i in 0..width {
            let leaving = row[i.saturating_sub(radius)];
            let entering = row[(i + radius).min(width - 1)];
            sum = sum - u16::from(leaving) + u16::from(entering);
            dst[i * height + j] = (sum / window) as u8;
        }
    }
}

/// Picks maximum of neighboring pixels (blur + lighten)
#[inline(never)]
pub(crate) fn max3(src: &[u8], dst: &mut [u8], width: usize, height: usize) {
    op3(src, dst, width, height, |a, b| a.max(b));
}

/// Picks minimum of neighboring pixels (blur + darken)
#[inline(never)]
pub(crate) fn min3(src: &[u8], dst: &mut [u8], width: usize, height: usize) {
    op3(src, dst, width, height, |a, b| a.min(b));
}

/// Combines every pixel with its 4 neighbors, repeating edge pixels
fn op3(src: &[u8], dst: &mut [u8], width: usize, height: usize, op: impl Fn(u8, u8) -> u8) {
    for (j, dst) in dst.chunks_exact_mut(width).take(height).enumerate() {
        let row = &src[j * width..][..width];
        let prevrow = &src[j.saturating_sub(1) * width..][..width];
        let nextrow = &src[(j + 1).min(height - 1) * width..][..width];
        for (i, out) in dst.iter_mut().enumerate() {
            let prev = row[i.saturating_sub(1)];
            let next = row[(i + 1).min(width - 1)];
            let horiz = op(prev, next);
            let vert = op(nextrow[i], prevrow[i]);
            *out = op(row[i], op(horiz, vert));
        }
    }
}

/// Blurs `src_dst` in place, overwriting `tmp`. Both must be `width`×`height`. Size is the radius of the box blur.
pub(crate) fn blur(src_dst: &mut [u8], tmp: &mut [u8], width: usize, height: usize, size: u16) {
    transposing_1d_blur(src_dst, tmp, width, height, size);
    transposing_1d_blur(tmp, src_dst, height, width, size);
}

#[test]
fn min_max_spread_by_one_pixel() {
    let mut src = [0u8; 25];
    src[12] = 200;
    let mut dst = [0u8; 25];
    max3(&src, &mut dst, 5, 5);
    assert_eq!(200, dst[12]);
    assert_eq!(200, dst[7]);
    assert_eq!(200, dst[11]);
    assert_eq!(0, dst[6]);
    assert_eq!(0, dst[0]);

    let mut back = [0u8; 25];
    min3(&dst, &mut back, 5, 5);
    assert_eq!(src, back);
}

#[test]
fn blur_keeps_flat_areas() {
    let mut img = [100u8; 64];
    let mut tmp = [0u8; 64];
    blur(&mut img, &mut tmp, 8, 8, 2);
    assert!(img.iter().all(|&v| v == 100));

    let mut img = [0u8; 64];
    img[3 * 8 + 3] = 255;
    blur(&mut img, &mut tmp, 8, 8, 1);
    assert!(img[3 * 8 + 3] < 255);
    assert!(img[3 * 8 + 4] > 0);
}
