//! PNG chart rendering
//!
//! Charts are drawn straight into an RGB raster: bars, polylines or pie
//! slices, one palette color per category. No text is drawn; the title and
//! category labels travel with the artifact metadata.

use crate::store::value::{as_number, display, get_path};
use image::{ImageFormat, Rgb, RgbImage};
use sdk::errors::EngineError;
use sdk::types::Table;
use serde::{Deserialize, Serialize};
use std::io::Cursor;

const WIDTH: u32 = 800;
const HEIGHT: u32 = 480;
const MARGIN: u32 = 48;

const BACKGROUND: Rgb<u8> = Rgb([255, 255, 255]);
const AXIS: Rgb<u8> = Rgb([64, 64, 64]);
const PALETTE: [Rgb<u8>; 8] = [
    Rgb([66, 133, 244]),
    Rgb([219, 68, 55]),
    Rgb([244, 180, 0]),
    Rgb([15, 157, 88]),
    Rgb([171, 71, 188]),
    Rgb([0, 172, 193]),
    Rgb([255, 112, 67]),
    Rgb([158, 157, 36]),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChartKind {
    Bar,
    Line,
    Pie,
}

impl ChartKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChartKind::Bar => "bar",
            ChartKind::Line => "line",
            ChartKind::Pie => "pie",
        }
    }
}

/// Column mapping for one chart
#[derive(Debug, Clone, PartialEq)]
pub struct ChartSpec {
    pub kind: ChartKind,
    pub x: String,
    /// Summed per category; `None` counts rows
    pub y: Option<String>,
    pub title: Option<String>,
}

/// Chart facility: rows plus mapping in, image bytes out
pub trait ChartRenderer: Send + Sync {
    fn render(&self, table: &Table, spec: &ChartSpec) -> Result<Vec<u8>, EngineError>;

    fn mime(&self) -> &'static str;

    fn extension(&self) -> &'static str;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PngChartRenderer;

impl PngChartRenderer {
    pub fn new() -> Self {
        Self
    }
}

fn invalid(message: impl Into<String>) -> EngineError {
    EngineError::validation("chart.render", message)
}

/// Sum `y` per distinct `x`, categories in order of first appearance
pub fn series(table: &Table, spec: &ChartSpec) -> Result<Vec<(String, f64)>, EngineError> {
    if table.is_empty() {
        return Err(invalid("no rows to plot"));
    }
    if table.column(&spec.x).is_none() {
        return Err(invalid(format!("unknown x column '{}'", spec.x)));
    }
    if let Some(y) = &spec.y {
        match table.column(y) {
            None => return Err(invalid(format!("unknown y column '{}'", y))),
            Some(col) if !col.kind.is_numeric() => {
                return Err(invalid(format!("y column '{}' is not numeric", y)))
            }
            Some(_) => {}
        }
    }

    let mut points: Vec<(String, f64)> = Vec::new();
    for row in &table.rows {
        let label = get_path(row, &spec.x).map(display).unwrap_or_default();
        let value = match &spec.y {
            Some(y) => get_path(row, y).and_then(as_number).unwrap_or(0.0),
            None => 1.0,
        };
        match points.iter_mut().find(|(l, _)| *l == label) {
            Some((_, total)) => *total += value,
            None => points.push((label, value)),
        }
    }
    Ok(points)
}

impl ChartRenderer for PngChartRenderer {
    fn render(&self, table: &Table, spec: &ChartSpec) -> Result<Vec<u8>, EngineError> {
        let points = series(table, spec)?;
        let mut canvas = RgbImage::from_pixel(WIDTH, HEIGHT, BACKGROUND);

        match spec.kind {
            ChartKind::Bar => draw_bars(&mut canvas, &points),
            ChartKind::Line => draw_line(&mut canvas, &points),
            ChartKind::Pie => draw_pie(&mut canvas, &points),
        }

        let mut bytes = Cursor::new(Vec::new());
        canvas
            .write_to(&mut bytes, ImageFormat::Png)
            .map_err(|e| EngineError::Render(format!("PNG encoding failed: {}", e)))?;
        Ok(bytes.into_inner())
    }

    fn mime(&self) -> &'static str {
        super::PNG_MIME
    }

    fn extension(&self) -> &'static str {
        "png"
    }
}

fn plot_area() -> (u32, u32, u32, u32) {
    (MARGIN, MARGIN, WIDTH - MARGIN, HEIGHT - MARGIN)
}

fn draw_axes(canvas: &mut RgbImage) {
    let (left, top, right, bottom) = plot_area();
    fill_rect(canvas, left, bottom, right, bottom + 2, AXIS);
    fill_rect(canvas, left - 2, top, left, bottom + 2, AXIS);
}

fn fill_rect(canvas: &mut RgbImage, x0: u32, y0: u32, x1: u32, y1: u32, color: Rgb<u8>) {
    for y in y0.min(HEIGHT)..y1.min(HEIGHT) {
        for x in x0.min(WIDTH)..x1.min(WIDTH) {
            canvas.put_pixel(x, y, color);
        }
    }
}

fn scale(points: &[(String, f64)]) -> f64 {
    points
        .iter()
        .map(|(_, v)| *v)
        .fold(0.0_f64, f64::max)
        .max(f64::EPSILON)
}

fn bar_height(value: f64, max: f64) -> u32 {
    let (_, top, _, bottom) = plot_area();
    let h = (value.max(0.0) / max) * f64::from(bottom - top);
    h.round() as u32
}

fn draw_bars(canvas: &mut RgbImage, points: &[(String, f64)]) {
    draw_axes(canvas);
    let (left, _, right, bottom) = plot_area();
    let max = scale(points);
    let slot = (right - left) / points.len().max(1) as u32;
    let gap = (slot / 5).max(1);

    for (i, (_, value)) in points.iter().enumerate() {
        let x0 = left + slot * i as u32 + gap;
        let x1 = (left + slot * (i as u32 + 1)).saturating_sub(gap).max(x0 + 1);
        let h = bar_height(*value, max);
        fill_rect(canvas, x0, bottom - h, x1, bottom, PALETTE[i % PALETTE.len()]);
    }
}

fn draw_line(canvas: &mut RgbImage, points: &[(String, f64)]) {
    draw_axes(canvas);
    let (left, _, right, bottom) = plot_area();
    let max = scale(points);
    let step = if points.len() > 1 {
        f64::from(right - left) / (points.len() - 1) as f64
    } else {
        0.0
    };

    let coords: Vec<(i64, i64)> = points
        .iter()
        .enumerate()
        .map(|(i, (_, value))| {
            let x = f64::from(left) + step * i as f64;
            let y = bottom - bar_height(*value, max);
            (x.round() as i64, i64::from(y))
        })
        .collect();

    for pair in coords.windows(2) {
        draw_segment(canvas, pair[0], pair[1], PALETTE[0]);
    }
    for &(x, y) in &coords {
        let (x, y) = (x.max(3) as u32, y.max(3) as u32);
        fill_rect(canvas, x - 3, y - 3, x + 4, y + 4, PALETTE[1]);
    }
}

/// Bresenham with a 3px pen
fn draw_segment(canvas: &mut RgbImage, from: (i64, i64), to: (i64, i64), color: Rgb<u8>) {
    let (mut x, mut y) = from;
    let dx = (to.0 - x).abs();
    let dy = -(to.1 - y).abs();
    let sx = if x < to.0 { 1 } else { -1 };
    let sy = if y < to.1 { 1 } else { -1 };
    let mut err = dx + dy;

    loop {
        for ox in -1..=1 {
            for oy in -1..=1 {
                let (px, py) = (x + ox, y + oy);
                if px >= 0 && py >= 0 && (px as u32) < WIDTH && (py as u32) < HEIGHT {
                    canvas.put_pixel(px as u32, py as u32, color);
                }
            }
        }
        if x == to.0 && y == to.1 {
            break;
        }
        let e2 = 2 * err;
        if e2 >= dy {
            err += dy;
            x += sx;
        }
        if e2 <= dx {
            err += dx;
            y += sy;
        }
    }
}

fn draw_pie(canvas: &mut RgbImage, points: &[(String, f64)]) {
    let total: f64 = points.iter().map(|(_, v)| v.max(0.0)).sum();
    if total <= 0.0 {
        return;
    }

    // Cumulative slice boundaries as fractions of a full turn
    let mut bounds = Vec::with_capacity(points.len());
    let mut acc = 0.0;
    for (_, value) in points {
        acc += value.max(0.0) / total;
        bounds.push(acc);
    }

    let cx = f64::from(WIDTH) / 2.0;
    let cy = f64::from(HEIGHT) / 2.0;
    let radius = f64::from(HEIGHT / 2 - MARGIN);

    for y in 0..HEIGHT {
        for x in 0..WIDTH {
            let dx = f64::from(x) - cx;
            let dy = f64::from(y) - cy;
            if dx * dx + dy * dy > radius * radius {
                continue;
            }
            // Clockwise from twelve o'clock
            let angle = dx.atan2(-dy).rem_euclid(std::f64::consts::TAU);
            let fraction = angle / std::f64::consts::TAU;
            let slice = bounds
                .iter()
                .position(|b| fraction <= *b)
                .unwrap_or(points.len() - 1);
            canvas.put_pixel(x, y, PALETTE[slice % PALETTE.len()]);
        }
    }
}
