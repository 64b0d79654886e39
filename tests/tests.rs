use rgb::ComponentMap;
use rgbaquant::*;

fn gradient(width: usize, height: usize) -> Vec<RGBA> {
    (0..width * height).map(|i| {
        let (x, y) = (i % width, i / width);
        RGBA::new((x * 255 / width) as u8, (y * 255 / height) as u8, ((x + y) * 127 / (width + height)) as u8, 255)
    }).collect()
}

fn max_channel_diff(a: RGBA, b: RGBA) -> u8 {
    let d = a.map(i16::from) - b.map(i16::from);
    d.r.unsigned_abs().max(d.g.unsigned_abs()).max(d.b.unsigned_abs()).max(d.a.unsigned_abs()) as u8
}

#[test]
fn red_and_blue() {
    let red = RGBA::new(255, 0, 0, 255);
    let blue = RGBA::new(0, 0, 255, 255);
    let pixels = [red, red, blue, blue];

    let mut attr = new();
    attr.set_max_colors(2).unwrap();
    let mut img = attr.new_image_borrowed(&pixels, 2, 2, 0.).unwrap();
    let mut res = attr.quantize(&mut img).unwrap();
    assert!(res.quantization_error().unwrap() < 0.01);
    assert_eq!(2, res.palette_len());

    let (pal, idx) = res.remapped(&mut img).unwrap();
    assert_eq!(2, pal.len());
    assert!(max_channel_diff(pal[usize::from(idx[0])], red) <= 1, "{pal:?}");
    assert!(max_channel_diff(pal[usize::from(idx[2])], blue) <= 1, "{pal:?}");
    assert_eq!(idx[0], idx[1]);
    assert_eq!(idx[2], idx[3]);
    assert_ne!(idx[0], idx[2]);
}

#[test]
fn transparent_pixel_with_transparent_last() {
    let mut attr = new();
    attr.set_last_index_transparent(true);
    let pixels = [RGBA::new(10, 20, 30, 0)];
    let mut img = attr.new_image_borrowed(&pixels, 1, 1, 0.).unwrap();
    let mut res = attr.quantize(&mut img).unwrap();
    let (pal, idx) = res.remapped(&mut img).unwrap();
    assert_eq!(vec![RGBA::new(0, 0, 0, 0)], pal);
    assert_eq!(vec![0], idx);
}

#[test]
fn transparent_entry_goes_last() {
    let mut pixels = gradient(16, 16);
    for px in &mut pixels[..40] {
        px.a = 0;
    }
    let mut attr = new();
    attr.set_max_colors(8).unwrap();
    attr.set_last_index_transparent(true);
    let mut img = attr.new_image(pixels, 16, 16, 0.).unwrap();
    let mut res = attr.quantize(&mut img).unwrap();
    let (pal, _) = res.remapped(&mut img).unwrap();
    assert_eq!(0, pal.last().unwrap().a);
    assert!(pal[..pal.len() - 1].iter().all(|c| c.a > 0));
}

#[test]
fn quality_too_low() {
    let pixels = [RGBA::new(255, 0, 0, 255), RGBA::new(0, 255, 0, 255), RGBA::new(0, 0, 255, 255)];
    let mut attr = new();
    attr.set_max_colors(2).unwrap();
    attr.set_quality(100, 100).unwrap();
    let mut img = attr.new_image_borrowed(&pixels, 3, 1, 0.).unwrap();
    assert_eq!(Error::QualityTooLow, attr.quantize(&mut img).unwrap_err());

    // it's achievable with enough colors
    attr.set_max_colors(3).unwrap();
    let res = attr.quantize(&mut img).unwrap();
    assert_eq!(Some(100), res.quantization_quality());
}

#[test]
fn more_colors_never_hurt() {
    let pixels = gradient(64, 64);
    let mut errors = vec![f64::INFINITY; 2];
    for colors in 2..=80 {
        let mut attr = new();
        attr.set_max_colors(colors).unwrap();
        let mut img = attr.new_image_borrowed(&pixels, 64, 64, 0.).unwrap();
        let mut res = attr.quantize(&mut img).unwrap();
        let err = res.quantization_error().unwrap();
        let best_so_far = errors.iter().copied().fold(f64::INFINITY, f64::min);
        assert!(err <= best_so_far * 1.05, "{colors} colors: {err} > {best_so_far}");
        if colors % 2 == 0 && colors >= 4 {
            let half = errors[colors as usize / 2];
            assert!(err <= half, "{colors} colors: {err} > {half} with half as many");
        }
        errors.push(err);

        let (pal, idx) = res.remapped(&mut img).unwrap();
        assert!(pal.len() <= colors as usize);
        assert!(idx.iter().all(|&i| usize::from(i) < pal.len()));
        assert!(res.remapping_error().is_some());
    }
}

#[test]
fn fastest_speed_keeps_opaque_colors() {
    let pixels = gradient(32, 32);
    let mut attr = new();
    attr.set_speed(10).unwrap();
    attr.set_max_colors(16).unwrap();
    let mut img = attr.new_image_borrowed(&pixels, 32, 32, 0.).unwrap();
    let mut res = attr.quantize(&mut img).unwrap();
    let (pal, idx) = res.remapped(&mut img).unwrap();
    assert!(pal.len() <= 16);
    assert!(pal.iter().all(|c| c.a == 255), "{pal:?}");
    assert!(idx.iter().all(|&i| usize::from(i) < pal.len()));
}

#[test]
fn posterized_output_stays_opaque() {
    let pixels = gradient(32, 32);
    for bits in 0..=4u8 {
        let mut attr = new();
        attr.set_max_colors(16).unwrap();
        attr.set_min_posterization(bits).unwrap();
        assert_eq!(bits, attr.min_posterization());
        let mut img = attr.new_image_borrowed(&pixels, 32, 32, 0.).unwrap();
        let mut res = attr.quantize(&mut img).unwrap();
        let (pal, _) = res.remapped(&mut img).unwrap();
        assert!(pal.iter().all(|c| c.a == 255), "{bits} bits: {pal:?}");
        if bits > 0 {
            let low = (1u8 << bits) - 1;
            assert!(pal.iter().all(|c| [c.r, c.g, c.b].iter().all(|&v| v & low == v >> (8 - bits))), "{bits} bits: {pal:?}");
        }
    }
    assert_eq!(Err(Error::ValueOutOfRange), new().set_min_posterization(5));
}

#[test]
fn output_gamma_changes_palette() {
    let pixels = gradient(16, 16);
    let mut attr = new();
    attr.set_max_colors(8).unwrap();
    let mut img = attr.new_image_borrowed(&pixels, 16, 16, 0.).unwrap();
    let mut res = attr.quantize(&mut img).unwrap();
    assert!((res.output_gamma() - 0.45455).abs() < 0.001);
    let default_pal = res.palette_vec();

    assert_eq!(Err(Error::ValueOutOfRange), res.set_output_gamma(0.));
    assert_eq!(Err(Error::ValueOutOfRange), res.set_output_gamma(1.));
    res.set_output_gamma(0.8).unwrap();
    assert_eq!(0.8, res.output_gamma());
    let brighter = res.palette_vec();
    assert_eq!(default_pal.len(), brighter.len());
    assert_ne!(default_pal, brighter);

    let (pal, idx) = res.remapped(&mut img).unwrap();
    assert_eq!(0.8, res.output_gamma());
    assert!(idx.iter().all(|&i| usize::from(i) < pal.len()));
}

#[test]
fn premultiplied_palette() {
    let mut pixels = gradient(16, 16);
    for (i, px) in pixels.iter_mut().enumerate() {
        px.a = [0, 80, 160, 255][i % 4];
    }
    let mut attr = new();
    attr.set_max_colors(12).unwrap();
    let mut img = attr.new_image(pixels, 16, 16, 0.).unwrap();
    let mut res = attr.quantize(&mut img).unwrap();
    let straight = res.palette_vec();
    let premultiplied = res.palette_premultiplied();
    assert_eq!(straight.len(), premultiplied.len());
    assert!(premultiplied.iter().any(|c| c.a > 0 && c.a < 255));
    for (s, p) in straight.iter().zip(&premultiplied) {
        assert!(p.r <= p.a && p.g <= p.a && p.b <= p.a, "{p:?}");
        assert_eq!(s.a, p.a);
        if s.a == 255 {
            assert_eq!(s, p);
        }
    }
}

#[test]
fn remapping_quality_follows_remap() {
    let pixels = gradient(32, 32);
    let mut attr = new();
    attr.set_max_colors(8).unwrap();
    let mut img = attr.new_image_borrowed(&pixels, 32, 32, 0.).unwrap();
    let mut res = attr.quantize(&mut img).unwrap();
    assert_eq!(res.quantization_quality(), res.remapping_quality());

    res.set_dithering_level(0.).unwrap();
    res.remapped(&mut img).unwrap();
    let quality = res.remapping_quality().unwrap();
    assert!(quality > 0 && quality < 100, "{quality}");
    assert!(res.remapping_error().unwrap() > 0.);
}

#[test]
fn strided_images_skip_padding() {
    let colors = [
        RGBA::new(255, 0, 0, 255), RGBA::new(0, 255, 0, 255), RGBA::new(0, 0, 255, 255),
        RGBA::new(255, 255, 255, 255), RGBA::new(0, 0, 0, 255), RGBA::new(128, 128, 128, 255),
    ];
    let padding = RGBA::new(255, 0, 255, 255);
    // 3×2 image in rows of 4
    let mut padded = Vec::new();
    for row in colors.chunks(3) {
        padded.extend_from_slice(row);
        padded.push(padding);
    }

    let attr = new();
    assert_eq!(Err(Error::ValueOutOfRange), attr.new_image_stride(padded.clone(), 3, 2, 2, 0.).map(|_| ()));
    assert_eq!(Err(Error::BufferTooSmall), Image::new_stride_copy(&attr, &padded[..6], 3, 2, 4, 0.).map(|_| ()));

    let owned = attr.new_image_stride(padded.clone(), 3, 2, 4, 0.).unwrap();
    let copied = Image::new_stride_copy(&attr, &padded, 3, 2, 4, 0.).unwrap();
    drop(padded);
    for mut img in [owned, copied] {
        assert_eq!((3, 2), (img.width(), img.height()));
        let mut res = attr.quantize(&mut img).unwrap();
        res.set_dithering_level(0.).unwrap();
        let (pal, idx) = res.remapped(&mut img).unwrap();
        assert_eq!(6, pal.len());
        assert!(!pal.contains(&padding));
        for (&i, &expected) in idx.iter().zip(&colors) {
            assert!(max_channel_diff(pal[usize::from(i)], expected) <= 1, "{pal:?}");
        }
    }
}

#[test]
fn log_flush_callback() {
    use std::sync::atomic::{AtomicUsize, Ordering::SeqCst};
    use std::sync::Arc;

    let flushes = Arc::new(AtomicUsize::new(0));
    let mut attr = new();
    let f = flushes.clone();
    attr.set_log_flush_callback(move |_| { f.fetch_add(1, SeqCst); });
    assert_eq!(0, flushes.load(SeqCst));

    // replacing the log callback flushes what the old one buffered
    attr.set_log_callback(|_, _| {});
    assert_eq!(1, flushes.load(SeqCst));

    let pixels = gradient(8, 8);
    let mut img = attr.new_image_borrowed(&pixels, 8, 8, 0.).unwrap();
    attr.quantize(&mut img).unwrap();
    drop(img);
    let before_drop = flushes.load(SeqCst);
    drop(attr);
    assert_eq!(before_drop + 1, flushes.load(SeqCst));
}

#[test]
fn frozen_undithered_remap_is_repeatable() {
    let pixels = gradient(40, 30);
    let mut attr = new();
    attr.set_max_colors(10).unwrap();
    let mut img = attr.new_image_borrowed(&pixels, 40, 30, 0.).unwrap();

    let mut hist = attr.new_histogram();
    hist.add_image(&attr, &mut img).unwrap();
    let mut res = hist.quantize(&attr).unwrap();
    res.set_dithering_level(0.).unwrap();

    let (pal1, idx1) = res.remapped(&mut img).unwrap();
    let (pal2, idx2) = res.remapped(&mut img).unwrap();
    assert_eq!(pal1, pal2);
    assert_eq!(idx1, idx2);
}

#[test]
fn fixed_colors_are_kept() {
    let fixed = [RGBA::new(255, 0, 255, 255), RGBA::new(12, 34, 56, 255)];
    let pixels = gradient(32, 32);
    let mut attr = new();
    attr.set_max_colors(16).unwrap();
    let mut img = attr.new_image_borrowed(&pixels, 32, 32, 0.).unwrap();
    for &c in &fixed {
        img.add_fixed_color(c).unwrap();
    }
    let mut res = attr.quantize(&mut img).unwrap();
    let (pal, _) = res.remapped(&mut img).unwrap();
    for c in fixed {
        assert!(pal.iter().any(|&p| max_channel_diff(p, c) <= 1), "{c:?} missing from {pal:?}");
    }
}

#[test]
fn histogram_entries_match_image() {
    let mut pixels = gradient(8, 8);
    pixels.iter_mut().for_each(|px| *px = px.map(|c| c & 0xF0));

    let mut counts = std::collections::BTreeMap::new();
    for px in &pixels {
        *counts.entry((px.r, px.g, px.b, px.a)).or_insert(0u32) += 1;
    }
    let entries: Vec<_> = counts.into_iter()
        .map(|((r, g, b, a), count)| HistogramEntry { color: RGBA::new(r, g, b, a), count })
        .collect();

    for max_colors in [256, 5] {
        let mut attr = new();
        attr.set_max_colors(max_colors).unwrap();

        let mut img = attr.new_image_borrowed(&pixels, 8, 8, 0.).unwrap();
        let mut from_image = attr.new_histogram();
        from_image.add_image(&attr, &mut img).unwrap();
        let pal1 = from_image.quantize(&attr).unwrap().palette_vec();

        let mut from_entries = attr.new_histogram();
        from_entries.add_colors(&entries, 0.).unwrap();
        let pal2 = from_entries.quantize(&attr).unwrap().palette_vec();

        assert_eq!(pal1.len(), pal2.len());
        for (a, b) in pal1.iter().zip(&pal2) {
            assert!(max_channel_diff(*a, *b) <= 1, "{pal1:?} != {pal2:?}");
        }
    }
}

#[test]
fn output_buffers_are_checked() {
    let pixels = gradient(10, 4);
    let attr = new();
    let mut img = attr.new_image_borrowed(&pixels, 10, 4, 0.).unwrap();
    let mut res = attr.quantize(&mut img).unwrap();
    res.set_dithering_level(0.).unwrap();

    let mut small = vec![0u8; 39];
    assert_eq!(Err(Error::BufferTooSmall), res.remap_into(&mut img, &mut small));

    let mut flat = vec![0u8; 41];
    res.remap_into(&mut img, &mut flat).unwrap();

    assert_eq!(Err(Error::InvalidPointer), res.remap_into_rows(&mut img, &mut []));

    let mut storage = vec![[0u8; 12]; 4];
    let mut rows: Vec<&mut [u8]> = storage.iter_mut().map(|r| &mut r[..]).collect();
    assert_eq!(Err(Error::BufferTooSmall), res.remap_into_rows(&mut img, &mut rows[..3]));
    res.remap_into_rows(&mut img, &mut rows).unwrap();
    for (row, flat_row) in storage.iter().zip(flat.chunks(10)) {
        assert_eq!(&row[..10], flat_row);
    }

    let mut short = vec![[0u8; 9]; 4];
    let mut rows: Vec<&mut [u8]> = short.iter_mut().map(|r| &mut r[..]).collect();
    assert_eq!(Err(Error::BufferTooSmall), res.remap_into_rows(&mut img, &mut rows));
}

#[test]
fn progress_callbacks_can_abort() {
    let pixels = gradient(32, 32);
    let mut attr = new();
    attr.set_progress_callback(|_| ControlFlow::Break);
    let mut img = attr.new_image_borrowed(&pixels, 32, 32, 0.).unwrap();
    assert_eq!(Error::Aborted, attr.quantize(&mut img).unwrap_err());

    let attr = new();
    let mut res = attr.quantize(&mut img).unwrap();
    res.set_progress_callback(|_| ControlFlow::Break);
    assert_eq!(Error::Aborted, res.remapped(&mut img).unwrap_err());
}

#[test]
fn writes_png() {
    let pixels = gradient(24, 24);
    let mut attr = new();
    attr.set_speed(1).unwrap();
    attr.set_max_colors(32).unwrap();
    let mut img = attr.new_image_borrowed(&pixels, 24, 24, 0.).unwrap();
    let mut res = attr.quantize(&mut img).unwrap();
    res.set_dithering_level(1.).unwrap();
    let (pal, idx) = res.remapped(&mut img).unwrap();

    let expanded: Vec<RGBA> = idx.iter().map(|&i| pal[usize::from(i)]).collect();
    let png = lodepng::encode32(&expanded, 24, 24).unwrap();
    let decoded = lodepng::decode32(&png).unwrap();
    assert_eq!((24, 24), (decoded.width, decoded.height));
    assert!(decoded.buffer.iter().all(|px| pal.contains(px)));

    // dithered output stays close to the source on average
    let total: u32 = decoded.buffer.iter().zip(&pixels).map(|(a, b)| u32::from(max_channel_diff(*a, *b))).sum();
    assert!(total / (24 * 24) < 60, "{total}");
}
