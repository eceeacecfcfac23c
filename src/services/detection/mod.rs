use crate::core::config::Config;
use crate::core::errors::{DetectionError, DetectionResult};
use crate::core::labels::Catalog;
use crate::core::types::Detection;
use crate::services::onnx_builder;
use anyhow::{Context, Result};
use image::DynamicImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::Value;
use std::sync::Arc;
use tokio::sync::mpsc::{channel, Receiver, Sender};
use tracing::{debug, info, trace};

/// Session pool for concurrent inference.
///
/// Sessions are stateless, so any request may use any session; the pool only
/// bounds how many inferences run at once while axum multiplexes requests.
struct SessionPool {
    sender: Sender<Session>,
    receiver: Arc<tokio::sync::Mutex<Receiver<Session>>>,
}

impl SessionPool {
    async fn acquire(&self) -> Session {
        let mut receiver = self.receiver.lock().await;
        receiver.recv().await.expect("Session pool exhausted")
    }

    async fn release(&self, session: Session) {
        self.sender
            .send(session)
            .await
            .expect("Failed to return session to pool");
    }
}

/// A raw detection before label resolution, tagged with the index of the
/// model output candidate it came from.
#[derive(Debug, Clone, PartialEq)]
struct RawDetection {
    candidate: usize,
    class_id: usize,
    confidence: f32,
    bbox: [f32; 4],
}

pub struct DetectionService {
    session_pool: Arc<SessionPool>,
    config: Arc<Config>,
    catalog: Arc<Catalog>,
    device_type: String,
}

impl DetectionService {
    pub async fn new(config: Arc<Config>, catalog: Arc<Catalog>) -> Result<Self> {
        let model_path = &config.detection.model_path;
        let model_bytes = std::fs::read(model_path)
            .with_context(|| format!("Failed to read detector model at {model_path}"))?;
        info!(
            "Loaded detector model from {} ({:.1} MB)",
            model_path,
            model_bytes.len() as f64 / 1_048_576.0
        );

        let pool_size = config.detection.session_pool_size;
        let forced_backend = config.detection.inference_backend.clone();

        // First session determines the device type
        let (device_type, first_session) =
            onnx_builder::build_session(&model_bytes, forced_backend.as_deref())?;

        let (sender, receiver) = channel(pool_size);
        sender
            .send(first_session)
            .await
            .map_err(|_| anyhow::anyhow!("Failed to initialize session pool"))?;

        // Create remaining sessions in parallel for faster startup
        if pool_size > 1 {
            let model_bytes = Arc::new(model_bytes);
            let mut tasks = Vec::new();

            for i in 1..pool_size {
                let bytes = Arc::clone(&model_bytes);
                let backend = forced_backend.clone();
                let task = tokio::task::spawn_blocking(move || {
                    debug!("Creating session {} of {}", i + 1, pool_size);
                    onnx_builder::build_session(&bytes, backend.as_deref())
                });
                tasks.push(task);
            }

            for task in tasks {
                let (_, session) = task
                    .await
                    .map_err(|e| anyhow::anyhow!("Failed to spawn session creation: {e}"))??;
                sender
                    .send(session)
                    .await
                    .map_err(|_| anyhow::anyhow!("Failed to add session to pool"))?;
            }
        }

        info!("Detection ready: {} ({} sessions)", device_type, pool_size);

        Ok(Self {
            session_pool: Arc::new(SessionPool {
                sender,
                receiver: Arc::new(tokio::sync::Mutex::new(receiver)),
            }),
            config,
            catalog,
            device_type,
        })
    }

    pub fn device_type(&self) -> &str {
        &self.device_type
    }

    /// Run the detector on one decoded image.
    ///
    /// Returns detections in the model's native candidate order with class
    /// ids resolved to instrument names. Stateless: identical input yields
    /// identical output.
    pub async fn detect(&self, img: &DynamicImage) -> DetectionResult<Vec<Detection>> {
        if img.width() == 0 || img.height() == 0 {
            return Err(DetectionError::InvalidImageSize {
                width: img.width(),
                height: img.height(),
            });
        }

        let detection_start = std::time::Instant::now();
        let target_size = self.config.detection.target_size;
        let input = preprocess_image(img, target_size);

        debug!("Running ONNX inference on {}...", self.device_type);
        let inference_start = std::time::Instant::now();

        // Acquire session from pool, run inference, return the session even
        // when the run fails so the pool never shrinks
        let mut session = self.session_pool.acquire().await;
        let result = run_inference(&mut session, input);
        self.session_pool.release(session).await;
        let (dims, data) = result?;

        debug!(
            "Inference completed in {:.2}ms",
            inference_start.elapsed().as_secs_f64() * 1000.0
        );

        let raw = decode_output(
            &data,
            &dims,
            img.width(),
            img.height(),
            target_size,
            self.config.detection.confidence_threshold,
        )?;
        trace!("{} candidates above confidence threshold", raw.len());

        let kept = nms(raw, self.config.detection.iou_threshold);

        let policy = self.config.detection.unmapped_label_policy;
        let mut detections = Vec::with_capacity(kept.len());
        for raw in kept {
            detections.push(Detection {
                class_id: raw.class_id,
                label: self.catalog.instruments.resolve(raw.class_id, policy)?,
                confidence: raw.confidence,
                bbox: raw.bbox,
            });
        }

        debug!(
            "Detection completed in {:.2}ms: {} instruments",
            detection_start.elapsed().as_secs_f64() * 1000.0,
            detections.len()
        );

        Ok(detections)
    }
}

/// Run one forward pass and copy the first output tensor out of the session.
fn run_inference(
    session: &mut Session,
    input: Array4<f32>,
) -> Result<(Vec<usize>, Vec<f32>), ort::Error> {
    let input_value = Value::from_array(input)?;
    let outputs = session.run(ort::inputs![input_value])?;
    let (shape, data) = outputs[0].try_extract_tensor::<f32>()?;
    Ok((shape.iter().map(|&d| d as usize).collect(), data.to_vec()))
}

/// Resize to the model's square input and normalize to a [1, 3, S, S] tensor.
fn preprocess_image(img: &DynamicImage, target_size: u32) -> Array4<f32> {
    trace!(
        "Preprocessing image: {}x{} -> {}x{}",
        img.width(),
        img.height(),
        target_size,
        target_size
    );

    let resized = img.resize_exact(
        target_size,
        target_size,
        image::imageops::FilterType::Triangle,
    );
    let rgb_img = resized.to_rgb8();

    let target = target_size as usize;
    let mut array = Array4::<f32>::zeros((1, 3, target, target));
    for (x, y, pixel) in rgb_img.enumerate_pixels() {
        array[[0, 0, y as usize, x as usize]] = pixel[0] as f32 / 255.0;
        array[[0, 1, y as usize, x as usize]] = pixel[1] as f32 / 255.0;
        array[[0, 2, y as usize, x as usize]] = pixel[2] as f32 / 255.0;
    }
    array
}

/// Decode the detector's `[1, 4+C, N]` output into thresholded candidates.
///
/// Each column is one candidate: rows 0..4 hold the box center/size in
/// model-input coordinates, rows 4.. hold per-class scores. Boxes are mapped
/// back to original-image pixels and clamped to the image bounds.
fn decode_output(
    data: &[f32],
    dims: &[usize],
    orig_width: u32,
    orig_height: u32,
    target_size: u32,
    conf_threshold: f32,
) -> DetectionResult<Vec<RawDetection>> {
    if dims.len() != 3 || dims[0] != 1 || dims[1] <= 4 {
        return Err(DetectionError::MalformedOutput(format!("{dims:?}")));
    }

    let num_classes = dims[1] - 4;
    let num_candidates = dims[2];
    if data.len() != dims[1] * num_candidates {
        return Err(DetectionError::MalformedOutput(format!(
            "{dims:?} with {} values",
            data.len()
        )));
    }

    let sx = orig_width as f32 / target_size as f32;
    let sy = orig_height as f32 / target_size as f32;

    let mut raw = Vec::new();
    for i in 0..num_candidates {
        let mut class_id = 0;
        let mut confidence = f32::MIN;
        for c in 0..num_classes {
            let score = data[(4 + c) * num_candidates + i];
            if score > confidence {
                confidence = score;
                class_id = c;
            }
        }

        if confidence < conf_threshold {
            continue;
        }

        let cx = data[i];
        let cy = data[num_candidates + i];
        let w = data[2 * num_candidates + i];
        let h = data[3 * num_candidates + i];

        raw.push(RawDetection {
            candidate: i,
            class_id,
            confidence,
            bbox: [
                ((cx - w / 2.0) * sx).clamp(0.0, orig_width as f32),
                ((cy - h / 2.0) * sy).clamp(0.0, orig_height as f32),
                ((cx + w / 2.0) * sx).clamp(0.0, orig_width as f32),
                ((cy + h / 2.0) * sy).clamp(0.0, orig_height as f32),
            ],
        });
    }

    Ok(raw)
}

fn calculate_iou(box1: &[f32; 4], box2: &[f32; 4]) -> f32 {
    let x1 = box1[0].max(box2[0]);
    let y1 = box1[1].max(box2[1]);
    let x2 = box1[2].min(box2[2]);
    let y2 = box1[3].min(box2[3]);

    if x2 <= x1 || y2 <= y1 {
        return 0.0;
    }

    let intersection = (x2 - x1) * (y2 - y1);
    let area1 = (box1[2] - box1[0]) * (box1[3] - box1[1]);
    let area2 = (box2[2] - box2[0]) * (box2[3] - box2[1]);
    let union = area1 + area2 - intersection;

    if union > 0.0 {
        intersection / union
    } else {
        0.0
    }
}

/// Non-maximum suppression.
///
/// Suppression ranks by confidence, but the survivors are returned in the
/// model's native candidate order, not confidence order.
fn nms(detections: Vec<RawDetection>, iou_threshold: f32) -> Vec<RawDetection> {
    if detections.is_empty() {
        return vec![];
    }

    let mut sorted = detections;
    sorted.sort_by(|a, b| {
        b.confidence
            .partial_cmp(&a.confidence)
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let mut keep = Vec::new();
    let mut suppressed = vec![false; sorted.len()];

    for i in 0..sorted.len() {
        if suppressed[i] {
            continue;
        }

        keep.push(sorted[i].clone());

        for j in (i + 1)..sorted.len() {
            if !suppressed[j] && calculate_iou(&sorted[i].bbox, &sorted[j].bbox) > iou_threshold {
                suppressed[j] = true;
            }
        }
    }

    trace!("NMS kept {}/{} detections", keep.len(), sorted.len());
    keep.sort_by_key(|d| d.candidate);
    keep
}

#[cfg(test)]
mod tests {
    use super::*;

    /// One candidate column of a synthetic model output.
    struct Candidate {
        bbox_cxcywh: [f32; 4],
        scores: Vec<f32>,
    }

    /// Assemble a `[1, 4+C, N]` output tensor from candidate columns.
    fn output_tensor(candidates: &[Candidate]) -> (Vec<f32>, Vec<usize>) {
        let num_classes = candidates[0].scores.len();
        let n = candidates.len();
        let mut data = vec![0.0; (4 + num_classes) * n];
        for (i, candidate) in candidates.iter().enumerate() {
            for r in 0..4 {
                data[r * n + i] = candidate.bbox_cxcywh[r];
            }
            for (c, score) in candidate.scores.iter().enumerate() {
                data[(4 + c) * n + i] = *score;
            }
        }
        (data, vec![1, 4 + num_classes, n])
    }

    #[test]
    fn decode_maps_boxes_to_original_pixels() {
        let (data, dims) = output_tensor(&[Candidate {
            bbox_cxcywh: [100.0, 100.0, 40.0, 20.0],
            scores: vec![0.1, 0.9],
        }]);

        // Original image is twice the model input size in both axes
        let raw = decode_output(&data, &dims, 1280, 1280, 640, 0.25).unwrap();
        assert_eq!(raw.len(), 1);
        assert_eq!(raw[0].class_id, 1);
        assert_eq!(raw[0].confidence, 0.9);
        assert_eq!(raw[0].bbox, [160.0, 180.0, 240.0, 220.0]);
    }

    #[test]
    fn decode_filters_below_threshold() {
        let (data, dims) = output_tensor(&[
            Candidate {
                bbox_cxcywh: [100.0, 100.0, 40.0, 20.0],
                scores: vec![0.2, 0.05],
            },
            Candidate {
                bbox_cxcywh: [300.0, 300.0, 40.0, 20.0],
                scores: vec![0.05, 0.8],
            },
        ]);

        let raw = decode_output(&data, &dims, 640, 640, 640, 0.5).unwrap();
        assert_eq!(raw.len(), 1);
        assert_eq!(raw[0].candidate, 1);
    }

    #[test]
    fn decode_clamps_boxes_to_image_bounds() {
        let (data, dims) = output_tensor(&[Candidate {
            bbox_cxcywh: [5.0, 5.0, 40.0, 40.0],
            scores: vec![0.9],
        }]);

        let raw = decode_output(&data, &dims, 640, 640, 640, 0.25).unwrap();
        assert_eq!(raw[0].bbox[0], 0.0);
        assert_eq!(raw[0].bbox[1], 0.0);
    }

    #[test]
    fn decode_rejects_unexpected_shapes() {
        let err = decode_output(&[0.0; 8], &[1, 2, 4], 640, 640, 640, 0.25).unwrap_err();
        assert!(matches!(err, DetectionError::MalformedOutput(_)));

        // Shape and buffer length disagree
        let err = decode_output(&[0.0; 10], &[1, 6, 4], 640, 640, 640, 0.25).unwrap_err();
        assert!(matches!(err, DetectionError::MalformedOutput(_)));
    }

    #[test]
    fn nms_suppresses_overlaps_and_keeps_native_order() {
        let near_duplicate = |candidate, confidence| RawDetection {
            candidate,
            class_id: 0,
            confidence,
            bbox: [100.0, 100.0, 200.0, 200.0],
        };

        let detections = vec![
            // Weaker box overlapping the strongest one: suppressed
            near_duplicate(0, 0.6),
            // Disjoint box, lowest confidence: kept
            RawDetection {
                candidate: 1,
                class_id: 1,
                confidence: 0.3,
                bbox: [400.0, 400.0, 500.0, 500.0],
            },
            near_duplicate(2, 0.95),
        ];

        let kept = nms(detections, 0.45);
        let candidates: Vec<usize> = kept.iter().map(|d| d.candidate).collect();
        // Candidate order, not confidence order
        assert_eq!(candidates, vec![1, 2]);
    }

    #[test]
    fn iou_of_disjoint_boxes_is_zero() {
        assert_eq!(
            calculate_iou(&[0.0, 0.0, 10.0, 10.0], &[20.0, 20.0, 30.0, 30.0]),
            0.0
        );
        assert_eq!(
            calculate_iou(&[0.0, 0.0, 10.0, 10.0], &[0.0, 0.0, 10.0, 10.0]),
            1.0
        );
    }

    #[test]
    fn preprocess_produces_normalized_chw_tensor() {
        let img = DynamicImage::ImageRgb8(image::RgbImage::from_pixel(
            100,
            50,
            image::Rgb([255, 128, 0]),
        ));

        let array = preprocess_image(&img, 320);
        assert_eq!(array.shape(), &[1, 3, 320, 320]);
        assert!((array[[0, 0, 0, 0]] - 1.0).abs() < 1e-6);
        assert!((array[[0, 1, 160, 160]] - 128.0 / 255.0).abs() < 1e-2);
        assert!(array[[0, 2, 319, 319]].abs() < 1e-6);
    }
}
