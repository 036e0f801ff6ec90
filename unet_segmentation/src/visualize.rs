use std::path::Path;

use image::{imageops, Rgb, RgbImage};
use imageproc::{
    drawing::{draw_filled_rect_mut, draw_hollow_rect_mut, draw_line_segment_mut},
    rect::Rect,
};
use log::debug;
use ndarray::{Array3, ArrayView2};

use crate::{
    error::{Result, SegmentationError},
    training::TrainingHistory,
};

const GAP: u32 = 4;

pub const CHART_WIDTH: u32 = 320;
pub const CHART_HEIGHT: u32 = 240;
const MARGIN: u32 = 16;

const WHITE: Rgb<u8> = Rgb([255, 255, 255]);
const AXIS: Rgb<u8> = Rgb([128, 128, 128]);
const TRAIN: Rgb<u8> = Rgb([31, 119, 180]);
const VALID: Rgb<u8> = Rgb([255, 127, 14]);

/// Stretches the 2nd..98th percentile range of `image` onto `[0, 1]`,
/// clipping values outside it.
pub fn denormalize(image: &Array3<f32>) -> Array3<f32> {
    let mut sorted: Vec<f32> = image.iter().copied().filter(|v| v.is_finite()).collect();
    if sorted.is_empty() {
        return Array3::zeros(image.raw_dim());
    }
    sorted.sort_by(f32::total_cmp);

    let low = percentile(&sorted, 2.0);
    let high = percentile(&sorted, 98.0);
    let range = high - low;
    if range <= f32::EPSILON {
        return Array3::zeros(image.raw_dim());
    }
    image.mapv(|v| ((v - low) / range).clamp(0.0, 1.0))
}

/// Linear interpolation between closest ranks of an ascending slice.
fn percentile(sorted: &[f32], q: f32) -> f32 {
    let rank = q / 100.0 * (sorted.len() - 1) as f32;
    let (lower, upper) = (rank.floor() as usize, rank.ceil() as usize);
    let weight = rank - lower as f32;
    sorted[lower] * (1.0 - weight) + sorted[upper] * weight
}

/// Writes `image` (values in `[0, 1]`) followed by each named mask plane,
/// side by side, into one PNG.
pub fn save_panels<P: AsRef<Path>>(path: P, image: &Array3<f32>, planes: &[(&str, ArrayView2<f32>)]) -> Result<()> {
    let path = path.as_ref();
    let (height, width, _) = image.dim();
    for (name, plane) in planes {
        if plane.dim() != (height, width) {
            return Err(SegmentationError::ShapeMismatch(format!(
                "plane `{name}` is {:?} but the image is {:?}",
                plane.dim(),
                (height, width)
            )));
        }
    }

    let (w, h) = (width as u32, height as u32);
    let panels = 1 + planes.len() as u32;
    let mut canvas = RgbImage::from_pixel(panels * w + (panels - 1) * GAP, h, Rgb([255, 255, 255]));

    imageops::replace(&mut canvas, &to_rgb(image), 0, 0);
    for (i, (name, plane)) in planes.iter().enumerate() {
        let offset = (i as u32 + 1) * (w + GAP);
        let gray = Array3::from_shape_fn((height, width, 3), |(y, x, _)| plane[[y, x]]);
        imageops::replace(&mut canvas, &to_rgb(&gray), offset as i64, 0);
        debug!("panel {} `{name}` at x={offset}", i + 1);
    }

    canvas.save(path).map_err(|err| SegmentationError::image(path, err))
}

/// Writes two line charts of a training run side by side: `iou_score`
/// against `val_iou_score`, then `loss` against `val_loss`. Training curves
/// are blue and validation curves orange.
pub fn save_history_plot<P: AsRef<Path>>(path: P, history: &TrainingHistory) -> Result<()> {
    let path = path.as_ref();
    let (train_iou, valid_iou): (Vec<f64>, Vec<f64>) = history
        .epochs
        .iter()
        .map(|record| (record.train.iou_score, record.valid.iou_score))
        .unzip();
    let (train_loss, valid_loss): (Vec<f64>, Vec<f64>) = history
        .epochs
        .iter()
        .map(|record| (record.train.loss, record.valid.loss))
        .unzip();

    let mut canvas = RgbImage::from_pixel(2 * CHART_WIDTH + GAP, CHART_HEIGHT, WHITE);
    let iou = line_chart(&[(&train_iou[..], TRAIN), (&valid_iou[..], VALID)]);
    let loss = line_chart(&[(&train_loss[..], TRAIN), (&valid_loss[..], VALID)]);
    imageops::replace(&mut canvas, &iou, 0, 0);
    imageops::replace(&mut canvas, &loss, (CHART_WIDTH + GAP) as i64, 0);

    canvas.save(path).map_err(|err| SegmentationError::image(path, err))
}

/// One chart with every series scaled into a shared value range.
fn line_chart(series: &[(&[f64], Rgb<u8>)]) -> RgbImage {
    let mut chart = RgbImage::from_pixel(CHART_WIDTH, CHART_HEIGHT, WHITE);
    let (inner_w, inner_h) = (CHART_WIDTH - 2 * MARGIN, CHART_HEIGHT - 2 * MARGIN);
    draw_hollow_rect_mut(&mut chart, Rect::at(MARGIN as i32, MARGIN as i32).of_size(inner_w, inner_h), AXIS);

    let finite = series.iter().flat_map(|(values, _)| values.iter().copied()).filter(|v| v.is_finite());
    let (mut low, mut high) = finite.fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), v| (lo.min(v), hi.max(v)));
    if low > high {
        return chart;
    }
    if high - low <= f64::EPSILON {
        low -= 0.5;
        high += 0.5;
    }

    let point = |index: usize, count: usize, value: f64| {
        let x = if count > 1 {
            index as f32 / (count - 1) as f32
        } else {
            0.5
        };
        let y = ((value - low) / (high - low)) as f32;
        (
            MARGIN as f32 + x * (inner_w - 1) as f32,
            MARGIN as f32 + (1.0 - y) * (inner_h - 1) as f32,
        )
    };

    for (values, color) in series {
        let points: Vec<(f32, f32)> = values
            .iter()
            .enumerate()
            .filter(|(_, v)| v.is_finite())
            .map(|(i, v)| point(i, values.len(), *v))
            .collect();
        for pair in points.windows(2) {
            draw_line_segment_mut(&mut chart, pair[0], pair[1], *color);
        }
        for (x, y) in &points {
            draw_filled_rect_mut(&mut chart, Rect::at(*x as i32 - 1, *y as i32 - 1).of_size(3, 3), *color);
        }
    }
    chart
}

fn to_rgb(array: &Array3<f32>) -> RgbImage {
    let (height, width, channels) = array.dim();
    RgbImage::from_fn(width as u32, height as u32, |x, y| {
        let value = |c: usize| (array[[y as usize, x as usize, c.min(channels - 1)]] * 255.0).round().clamp(0.0, 255.0) as u8;
        Rgb([value(0), value(1), value(2)])
    })
}

#[cfg(test)]
mod tests {
    use ndarray::Array2;
    use tempfile::tempdir;

    use super::*;
    use crate::{
        metric::Scores,
        training::{EpochRecord, TrainingHistory},
    };

    fn history(losses: &[(f64, f64)]) -> TrainingHistory {
        let epochs = losses
            .iter()
            .enumerate()
            .map(|(i, &(loss, val_loss))| EpochRecord {
                epoch: i + 1,
                learning_rate: 1e-4,
                train: Scores {
                    loss,
                    iou_score: 1.0 - loss,
                    f_score: 1.0 - loss,
                },
                valid: Scores {
                    loss: val_loss,
                    iou_score: 1.0 - val_loss,
                    f_score: 1.0 - val_loss,
                },
            })
            .collect();
        TrainingHistory {
            epochs,
            best_epoch: Some(1),
        }
    }

    #[test]
    fn denormalize_maps_into_unit_range() {
        let image = Array3::from_shape_fn((10, 10, 3), |(y, x, c)| (y * 30 + x * 3 + c) as f32 - 150.0);
        let out = denormalize(&image);

        assert!(out.iter().all(|v| (0.0..=1.0).contains(v)));
        assert_eq!(out[[0, 0, 0]], 0.0);
        assert_eq!(out[[9, 9, 2]], 1.0);
        assert!(out[[5, 5, 0]] > 0.0 && out[[5, 5, 0]] < 1.0);
    }

    #[test]
    fn constant_image_denormalizes_to_zero() {
        let out = denormalize(&Array3::from_elem((2, 2, 3), 4.0));
        assert!(out.iter().all(|v| *v == 0.0));
    }

    #[test]
    fn panels_are_laid_out_side_by_side() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("sample.png");
        let image = Array3::from_elem((6, 5, 3), 1.0);
        let gt = Array2::from_elem((6, 5), 1.0);
        let pred = Array2::zeros((6, 5));

        save_panels(&path, &image, &[("gt", gt.view()), ("pred", pred.view())]).unwrap();

        let saved = image::open(&path).unwrap().into_rgb8();
        assert_eq!(saved.dimensions(), (3 * 5 + 2 * GAP, 6));
        assert_eq!(saved.get_pixel(0, 0).0, [255, 255, 255]);
        assert_eq!(saved.get_pixel(5 + GAP, 3).0, [255, 255, 255]);
        assert_eq!(saved.get_pixel(2 * (5 + GAP), 3).0, [0, 0, 0]);
    }

    #[test]
    fn history_plot_has_two_charts_with_both_curves() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("history.png");
        save_history_plot(&path, &history(&[(0.9, 0.95), (0.6, 0.7), (0.4, 0.5)])).unwrap();

        let saved = image::open(&path).unwrap().into_rgb8();
        assert_eq!(saved.dimensions(), (2 * CHART_WIDTH + GAP, CHART_HEIGHT));
        for color in [TRAIN, VALID] {
            assert!(saved.pixels().any(|p| *p == color));
        }
        // the gap between the charts stays blank
        assert!((0..CHART_HEIGHT).all(|y| *saved.get_pixel(CHART_WIDTH + 1, y) == WHITE));
    }

    #[test]
    fn single_or_empty_history_still_renders() {
        let tmp = tempdir().unwrap();
        for (name, run) in [("one.png", history(&[(0.5, 0.5)])), ("none.png", TrainingHistory::default())] {
            let path = tmp.path().join(name);
            save_history_plot(&path, &run).unwrap();
            let saved = image::open(&path).unwrap().into_rgb8();
            assert_eq!(saved.dimensions(), (2 * CHART_WIDTH + GAP, CHART_HEIGHT));
        }
    }

    #[test]
    fn plane_of_wrong_size_is_rejected() {
        let tmp = tempdir().unwrap();
        let image = Array3::zeros((4, 4, 3));
        let plane = Array2::zeros((3, 4));
        let result = save_panels(tmp.path().join("x.png"), &image, &[("bad", plane.view())]);
        assert!(matches!(result, Err(SegmentationError::ShapeMismatch(_))));
    }
}
