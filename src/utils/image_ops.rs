use crate::core::errors::{DetectionError, DetectionResult};
use crate::core::types::ApiDetection;
use image::{DynamicImage, Rgba, RgbaImage};
use imageproc::drawing::draw_hollow_rect_mut;
use imageproc::rect::Rect;

/// Asynchronously decode an uploaded image payload using spawn_blocking to
/// avoid blocking the async runtime.
///
/// Undecodable bytes are an input error, not a server fault.
pub async fn decode_image_async(bytes: Vec<u8>) -> DetectionResult<DynamicImage> {
    tokio::task::spawn_blocking(move || {
        image::load_from_memory(&bytes).map_err(DetectionError::InvalidImage)
    })
    .await
    .expect("image decode task panicked")
}

const PALETTE: [Rgba<u8>; 8] = [
    Rgba([0, 255, 0, 255]),
    Rgba([255, 0, 0, 255]),
    Rgba([0, 128, 255, 255]),
    Rgba([255, 200, 0, 255]),
    Rgba([200, 0, 200, 255]),
    Rgba([0, 220, 220, 255]),
    Rgba([255, 128, 0, 255]),
    Rgba([128, 128, 255, 255]),
];

/// Stable per-label colour so the same instrument type is always drawn in the
/// same colour across frames and sessions.
pub fn label_colour(label: &str) -> Rgba<u8> {
    let hash = label
        .bytes()
        .fold(0usize, |acc, b| acc.wrapping_mul(31).wrapping_add(b as usize));
    PALETTE[hash % PALETTE.len()]
}

/// Draw hollow bounding boxes for each detection over the source image.
///
/// Boxes are assumed to be [x1, y1, x2, y2] in the image's own pixel space;
/// degenerate boxes are skipped rather than drawn as artifacts.
pub fn draw_detection_overlay(img: &DynamicImage, detections: &[ApiDetection]) -> RgbaImage {
    let mut canvas = img.to_rgba8();
    let (width, height) = (canvas.width() as f32, canvas.height() as f32);

    for detection in detections {
        let [x1, y1, x2, y2] = detection.bbox;
        let x1 = x1.clamp(0.0, width - 1.0);
        let y1 = y1.clamp(0.0, height - 1.0);
        let x2 = x2.clamp(0.0, width);
        let y2 = y2.clamp(0.0, height);
        if x2 - x1 < 1.0 || y2 - y1 < 1.0 {
            continue;
        }

        let rect = Rect::at(x1 as i32, y1 as i32).of_size((x2 - x1) as u32, (y2 - y1) as u32);
        draw_hollow_rect_mut(&mut canvas, rect, label_colour(&detection.label));
    }

    canvas
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::ImageFormat;
    use std::io::Cursor;

    fn detection(label: &str, bbox: [f32; 4]) -> ApiDetection {
        ApiDetection {
            label: label.to_string(),
            confidence: 0.9,
            bbox,
        }
    }

    #[tokio::test]
    async fn test_decode_valid_png() {
        let img = DynamicImage::ImageRgba8(RgbaImage::from_pixel(
            4,
            4,
            Rgba([255, 0, 0, 255]),
        ));
        let mut png_bytes = Vec::new();
        img.write_to(&mut Cursor::new(&mut png_bytes), ImageFormat::Png)
            .unwrap();

        let decoded = decode_image_async(png_bytes).await.unwrap();
        assert_eq!(decoded.width(), 4);
    }

    #[tokio::test]
    async fn test_decode_garbage_is_invalid_input() {
        let result = decode_image_async(vec![0x00, 0x01, 0x02, 0x03]).await;
        assert!(matches!(result, Err(DetectionError::InvalidImage(_))));
    }

    #[test]
    fn overlay_draws_box_edges() {
        let img = DynamicImage::ImageRgba8(RgbaImage::from_pixel(
            100,
            100,
            Rgba([0, 0, 0, 255]),
        ));
        let detections = vec![detection("Scalpel", [10.0, 10.0, 50.0, 50.0])];

        let canvas = draw_detection_overlay(&img, &detections);
        let colour = label_colour("Scalpel");
        assert_eq!(*canvas.get_pixel(10, 10), colour);
        assert_eq!(*canvas.get_pixel(30, 10), colour);
        // Interior untouched
        assert_eq!(*canvas.get_pixel(30, 30), Rgba([0, 0, 0, 255]));
    }

    #[test]
    fn overlay_tolerates_out_of_bounds_boxes() {
        let img = DynamicImage::ImageRgba8(RgbaImage::from_pixel(
            32,
            32,
            Rgba([0, 0, 0, 255]),
        ));
        let detections = vec![
            detection("Probe", [-10.0, -10.0, 500.0, 500.0]),
            detection("Scalpel", [20.0, 20.0, 20.0, 20.0]),
        ];

        // Must not panic
        let canvas = draw_detection_overlay(&img, &detections);
        assert_eq!(canvas.width(), 32);
    }

    #[test]
    fn label_colour_is_stable() {
        assert_eq!(label_colour("Scalpel"), label_colour("Scalpel"));
    }
}
