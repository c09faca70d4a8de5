//! Box and label drawing shared by detectors and the pipeline overlay.
//!
//! Labels use a built-in 5x7 bitmap font so annotation has no font-file
//! dependency. Characters without a glyph are rendered as blanks.

use video_ingest::Frame;

use crate::detector::Detection;

pub const BOX_COLOR: [u8; 3] = [0, 255, 0];
pub const LABEL_BACKGROUND: [u8; 3] = [0, 0, 0];
pub const FOOTER_COLOR: [u8; 3] = [255, 255, 255];

const GLYPH_ADVANCE: i32 = 6;
const LABEL_HEIGHT: i32 = 8;

/// Draw every detection's box and `LABEL NN%` caption onto the frame.
pub fn draw_detections(mut frame: Frame, detections: &[Detection]) -> Frame {
    if !frame.is_well_formed() {
        return frame;
    }
    let max_x = frame.width as f32 - 1.0;
    let max_y = frame.height as f32 - 1.0;

    for det in detections {
        let left = det.bbox.x1.clamp(0.0, max_x).round() as i32;
        let top = det.bbox.y1.clamp(0.0, max_y).round() as i32;
        let right = det.bbox.x2.clamp(0.0, max_x).round() as i32;
        let bottom = det.bbox.y2.clamp(0.0, max_y).round() as i32;
        draw_rectangle(&mut frame, left, top, right, bottom, BOX_COLOR);
    }

    for det in detections {
        let left = det.bbox.x1.clamp(0.0, max_x).round() as i32;
        let top = det.bbox.y1.clamp(0.0, max_y).round() as i32;
        let text = caption(det);
        let label_y = (top - 12).max(0);
        let text_width = text.chars().count() as i32 * GLYPH_ADVANCE;
        fill_rect(
            &mut frame,
            left,
            label_y,
            left + text_width,
            label_y + LABEL_HEIGHT,
            LABEL_BACKGROUND,
        );
        draw_label(&mut frame, left, label_y, &text, BOX_COLOR);
    }
    frame
}

/// Draw a right-aligned footer line such as `FRAME 000042  FPS 29.8`.
pub fn draw_footer(mut frame: Frame, text: &str) -> Frame {
    if !frame.is_well_formed() {
        return frame;
    }
    let width = frame.width as i32;
    let height = frame.height as i32;
    let text_width = (text.chars().count() as i32 * GLYPH_ADVANCE).min(width);
    let x = (width - text_width - 4).max(0);
    let y = (height - 12).max(0);
    fill_rect(
        &mut frame,
        x,
        y,
        x + text_width + 4,
        y + LABEL_HEIGHT,
        LABEL_BACKGROUND,
    );
    draw_label(&mut frame, x + 2, y, text, FOOTER_COLOR);
    frame
}

fn caption(det: &Detection) -> String {
    let percent = (det.confidence * 100.0).round();
    match &det.location {
        Some(location) => format!("{} {} {percent:.0}%", det.label, location),
        None => format!("{} {percent:.0}%", det.label),
    }
}

fn put(frame: &mut Frame, x: i32, y: i32, color: [u8; 3]) {
    if x < 0 || y < 0 {
        return;
    }
    if let Some(pixel) = frame.pixel_mut(x as u32, y as u32) {
        pixel.copy_from_slice(&color);
    }
}

fn clamp_rect(frame: &Frame, left: i32, top: i32, right: i32, bottom: i32) -> (i32, i32, i32, i32) {
    let max_x = (frame.width as i32).saturating_sub(1);
    let max_y = (frame.height as i32).saturating_sub(1);
    (
        left.clamp(0, max_x),
        top.clamp(0, max_y),
        right.clamp(0, max_x),
        bottom.clamp(0, max_y),
    )
}

pub(crate) fn draw_rectangle(
    frame: &mut Frame,
    left: i32,
    top: i32,
    right: i32,
    bottom: i32,
    color: [u8; 3],
) {
    let (left, top, right, bottom) = clamp_rect(frame, left, top, right, bottom);
    for x in left..=right {
        put(frame, x, top, color);
        put(frame, x, bottom, color);
    }
    for y in top..=bottom {
        put(frame, left, y, color);
        put(frame, right, y, color);
    }
}

pub(crate) fn fill_rect(
    frame: &mut Frame,
    left: i32,
    top: i32,
    right: i32,
    bottom: i32,
    color: [u8; 3],
) {
    let (left, top, right, bottom) = clamp_rect(frame, left, top, right, bottom);
    for y in top..=bottom {
        for x in left..=right {
            put(frame, x, y, color);
        }
    }
}

pub(crate) fn draw_label(frame: &mut Frame, mut x: i32, y: i32, text: &str, color: [u8; 3]) {
    for ch in text.chars().flat_map(|c| c.to_uppercase()) {
        if let Some(glyph) = glyph_bits(ch) {
            for (row, pattern) in glyph.iter().enumerate() {
                for col in 0..5 {
                    if (pattern >> (4 - col)) & 1 == 1 {
                        put(frame, x + col, y + row as i32, color);
                    }
                }
            }
        }
        x += GLYPH_ADVANCE;
    }
}

fn glyph_bits(ch: char) -> Option<[u8; 7]> {
    let rows = match ch {
        'A' => [0b01110, 0b10001, 0b10001, 0b11111, 0b10001, 0b10001, 0b10001],
        'B' => [0b11110, 0b10001, 0b10001, 0b11110, 0b10001, 0b10001, 0b11110],
        'C' => [0b01110, 0b10001, 0b10000, 0b10000, 0b10000, 0b10001, 0b01110],
        'D' => [0b11110, 0b10001, 0b10001, 0b10001, 0b10001, 0b10001, 0b11110],
        'E' => [0b11111, 0b10000, 0b11110, 0b10000, 0b10000, 0b10000, 0b11111],
        'F' => [0b11111, 0b10000, 0b11110, 0b10000, 0b10000, 0b10000, 0b10000],
        'G' => [0b01110, 0b10001, 0b10000, 0b10111, 0b10001, 0b10001, 0b01111],
        'H' => [0b10001, 0b10001, 0b10001, 0b11111, 0b10001, 0b10001, 0b10001],
        'I' => [0b01110, 0b00100, 0b00100, 0b00100, 0b00100, 0b00100, 0b01110],
        'J' => [0b00111, 0b00010, 0b00010, 0b00010, 0b00010, 0b10010, 0b01100],
        'K' => [0b10001, 0b10010, 0b10100, 0b11000, 0b10100, 0b10010, 0b10001],
        'L' => [0b10000, 0b10000, 0b10000, 0b10000, 0b10000, 0b10000, 0b11111],
        'M' => [0b10001, 0b11011, 0b10101, 0b10101, 0b10001, 0b10001, 0b10001],
        'N' => [0b10001, 0b11001, 0b10101, 0b10101, 0b10011, 0b10001, 0b10001],
        'O' => [0b01110, 0b10001, 0b10001, 0b10001, 0b10001, 0b10001, 0b01110],
        'P' => [0b11110, 0b10001, 0b10001, 0b11110, 0b10000, 0b10000, 0b10000],
        'Q' => [0b01110, 0b10001, 0b10001, 0b10001, 0b10101, 0b10010, 0b01101],
        'R' => [0b11110, 0b10001, 0b10001, 0b11110, 0b10100, 0b10010, 0b10001],
        'S' => [0b01111, 0b10000, 0b01110, 0b00001, 0b00001, 0b10001, 0b01110],
        'T' => [0b11111, 0b00100, 0b00100, 0b00100, 0b00100, 0b00100, 0b00100],
        'U' => [0b10001, 0b10001, 0b10001, 0b10001, 0b10001, 0b10001, 0b01110],
        'V' => [0b10001, 0b10001, 0b10001, 0b10001, 0b10001, 0b01010, 0b00100],
        'W' => [0b10001, 0b10001, 0b10001, 0b10101, 0b10101, 0b11011, 0b10001],
        'X' => [0b10001, 0b10001, 0b01010, 0b00100, 0b01010, 0b10001, 0b10001],
        'Y' => [0b10001, 0b10001, 0b01010, 0b00100, 0b00100, 0b00100, 0b00100],
        'Z' => [0b11111, 0b00001, 0b00010, 0b00100, 0b01000, 0b10000, 0b11111],
        '0' => [0b01110, 0b10001, 0b10011, 0b10101, 0b11001, 0b10001, 0b01110],
        '1' => [0b00100, 0b01100, 0b00100, 0b00100, 0b00100, 0b00100, 0b01110],
        '2' => [0b01110, 0b10001, 0b00001, 0b00010, 0b00100, 0b01000, 0b11111],
        '3' => [0b11110, 0b00001, 0b00001, 0b01110, 0b00001, 0b00001, 0b11110],
        '4' => [0b00010, 0b00110, 0b01010, 0b10010, 0b11111, 0b00010, 0b00010],
        '5' => [0b11111, 0b10000, 0b11110, 0b00001, 0b00001, 0b10001, 0b01110],
        '6' => [0b00110, 0b01000, 0b10000, 0b11110, 0b10001, 0b10001, 0b01110],
        '7' => [0b11111, 0b00001, 0b00010, 0b00100, 0b01000, 0b01000, 0b01000],
        '8' => [0b01110, 0b10001, 0b10001, 0b01110, 0b10001, 0b10001, 0b01110],
        '9' => [0b01110, 0b10001, 0b10001, 0b01111, 0b00001, 0b00010, 0b01100],
        '%' => [0b10001, 0b10010, 0b00100, 0b01000, 0b10010, 0b10001, 0b00000],
        '-' => [0, 0, 0, 0b11111, 0, 0, 0],
        ':' => [0, 0b00110, 0b00110, 0, 0b00110, 0b00110, 0],
        '.' => [0, 0, 0, 0, 0, 0b00110, 0b00110],
        ' ' => [0; 7],
        _ => return None,
    };
    Some(rows)
}
