use crate::{
    config::AnnotationConfig,
    detection::DetectedObject,
    image_codec::{encode_jpeg, EncodeError, SharedImage},
};
use ab_glyph::{FontVec, PxScale};
use bytes::Bytes;
use image::{Rgb, RgbImage};
use imageproc::{
    drawing::{draw_filled_rect_mut, draw_hollow_rect_mut, draw_text_mut, text_size},
    rect::Rect,
};
use std::{path::PathBuf, sync::Arc};
use thiserror::Error;

// Box colours cycle through this palette by detection index.
const PALETTE: [[u8; 3]; 20] = [
    [0xFF, 0x38, 0x38],
    [0xFF, 0x9D, 0x97],
    [0xFF, 0x70, 0x1F],
    [0xFF, 0xB2, 0x1D],
    [0xCF, 0xD2, 0x31],
    [0x48, 0xF9, 0x0A],
    [0x92, 0xCC, 0x17],
    [0x3D, 0xDB, 0x86],
    [0x1A, 0x93, 0x34],
    [0x00, 0xD4, 0xBB],
    [0x2C, 0x99, 0xA8],
    [0x00, 0xC2, 0xFF],
    [0x34, 0x45, 0x93],
    [0x64, 0x73, 0xFF],
    [0x00, 0x18, 0xEC],
    [0x84, 0x38, 0xFF],
    [0x52, 0x00, 0x85],
    [0xCB, 0x38, 0xFF],
    [0xFF, 0x95, 0xC8],
    [0xFF, 0x37, 0xC7],
];

const LABEL_TEXT_COLOR: Rgb<u8> = Rgb([255, 255, 255]);
const LABEL_PADDING: i32 = 2;

#[derive(Error, Debug)]
pub enum AnnotateError {
    #[error("Failed to read font file {path:?}: {source}")]
    FontRead {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Invalid font file {0:?}")]
    InvalidFont(PathBuf),
}

pub fn palette_color(index: usize) -> Rgb<u8> {
    Rgb(PALETTE[index % PALETTE.len()])
}

/// Draws labelled detection boxes onto a copy of a frame.
pub struct Annotator {
    font: Option<FontVec>,
    font_size: f32,
    line_thickness: u32,
}

impl Annotator {
    pub fn new(config: &AnnotationConfig) -> Result<Self, AnnotateError> {
        let font = match &config.font_path {
            Some(path) => {
                let data = std::fs::read(path).map_err(|source| AnnotateError::FontRead {
                    path: path.clone(),
                    source,
                })?;
                let font = FontVec::try_from_vec(data)
                    .map_err(|_| AnnotateError::InvalidFont(path.clone()))?;
                Some(font)
            }
            None => {
                tracing::warn!("No annotation font configured, boxes will be drawn without labels");
                None
            }
        };

        Ok(Self {
            font,
            font_size: config.font_size,
            line_thickness: config.line_thickness.max(1),
        })
    }

    /// Boxes only, no label text.
    pub fn without_labels(line_thickness: u32) -> Self {
        Self {
            font: None,
            font_size: 0.0,
            line_thickness: line_thickness.max(1),
        }
    }

    /// Returns a new image; `image` itself is never modified.
    pub fn annotate(&self, image: &RgbImage, objects: &[DetectedObject]) -> RgbImage {
        let mut canvas = image.clone();
        for (index, object) in objects.iter().enumerate() {
            let color = palette_color(index);
            if let Some((x1, y1)) = self.draw_box(&mut canvas, &object.xyxy, color) {
                if let Some(font) = &self.font {
                    self.draw_label(&mut canvas, font, &object.name, x1, y1, color);
                }
            }
        }
        canvas
    }

    fn draw_box(&self, canvas: &mut RgbImage, xyxy: &[f32; 4], color: Rgb<u8>) -> Option<(i32, i32)> {
        let (w, h) = (canvas.width() as i32, canvas.height() as i32);
        if w == 0 || h == 0 {
            return None;
        }

        let x1 = (xyxy[0].floor() as i32).clamp(0, w - 1);
        let y1 = (xyxy[1].floor() as i32).clamp(0, h - 1);
        let x2 = (xyxy[2].ceil() as i32).clamp(0, w - 1);
        let y2 = (xyxy[3].ceil() as i32).clamp(0, h - 1);
        if x1 >= x2 || y1 >= y2 {
            return None;
        }

        for t in 0..self.line_thickness as i32 {
            let width = x2 - x1 + 1 - 2 * t;
            let height = y2 - y1 + 1 - 2 * t;
            if width <= 0 || height <= 0 {
                break;
            }
            let rect = Rect::at(x1 + t, y1 + t).of_size(width as u32, height as u32);
            draw_hollow_rect_mut(canvas, rect, color);
        }

        Some((x1, y1))
    }

    fn draw_label(
        &self,
        canvas: &mut RgbImage,
        font: &FontVec,
        label: &str,
        x1: i32,
        y1: i32,
        color: Rgb<u8>,
    ) {
        let scale = PxScale::from(self.font_size);
        let (text_width, text_height) = text_size(scale, font, label);
        let tag_width = text_width + 2 * LABEL_PADDING as u32;
        let tag_height = text_height + 2 * LABEL_PADDING as u32;
        if tag_width == 0 || tag_height == 0 {
            return;
        }

        // Tag sits above the box, or inside it when the box touches the top edge.
        let tag_y = if y1 >= tag_height as i32 {
            y1 - tag_height as i32
        } else {
            y1
        };

        draw_filled_rect_mut(
            canvas,
            Rect::at(x1, tag_y).of_size(tag_width, tag_height),
            color,
        );
        draw_text_mut(
            canvas,
            LABEL_TEXT_COLOR,
            x1 + LABEL_PADDING,
            tag_y + LABEL_PADDING,
            scale,
            font,
            label,
        );
    }
}

/// Annotates and JPEG-encodes on the blocking pool.
pub async fn render_annotated_jpeg(
    annotator: Arc<Annotator>,
    image: SharedImage,
    objects: Vec<DetectedObject>,
    quality: u8,
) -> Result<Bytes, EncodeError> {
    tokio::task::spawn_blocking(move || {
        let annotated = annotator.annotate(&image, &objects);
        encode_jpeg(&annotated, quality)
    })
    .await
    .map_err(|e| EncodeError::TaskFailed(e.to_string()))?
    .map(Bytes::from)
}
