//! Single-image inspection: decode upload, run the detector, derive OK/NG.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use image::RgbImage;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::error::InferError;
use crate::Config;

/// Inference parameters handed to a [`Detector`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PredictParams {
    pub imgsz: u32,
    pub conf_thres: f32,
    pub iou_thres: f32,
}

/// One box as produced by a model backend.
#[derive(Debug, Clone, PartialEq)]
pub struct RawDetection {
    pub class_name: String,
    pub confidence: f32,
    pub xyxy: [f32; 4],
}

/// Object detection backend. Implementations own the model.
pub trait Detector: Send + Sync {
    fn predict(&self, image: &RgbImage, params: &PredictParams)
        -> Result<Vec<RawDetection>, InferError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Decision {
    #[serde(rename = "OK")]
    Ok,
    #[serde(rename = "NG")]
    Ng,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DetectionOut {
    pub id: String,
    pub cls: String,
    pub conf: f32,
    pub xyxy: [f32; 4],
}

#[derive(Debug, Clone, Default)]
pub struct InferRequest {
    pub image: Bytes,
    pub barcode: Option<String>,
    pub request_id: Option<String>,
    pub imgsz: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InferResponse {
    pub request_id: Option<String>,
    pub barcode: Option<String>,
    pub model_version: String,
    /// `[height, width]` of the uploaded image.
    pub img_shape: [u32; 2],
    pub time_ms: u64,
    pub detections: Vec<DetectionOut>,
    pub suggested_decision: Decision,
}

#[derive(Debug, Clone)]
pub struct InferSettings {
    pub model_version: String,
    pub default_imgsz: u32,
    pub conf_thres: f32,
    pub iou_thres: f32,
    pub ng_classes: HashSet<String>,
}

impl From<&Config> for InferSettings {
    fn from(config: &Config) -> Self {
        Self {
            model_version: config.model_path.clone(),
            default_imgsz: config.default_imgsz,
            conf_thres: config.conf_thres,
            iou_thres: config.iou_thres,
            ng_classes: config.ng_classes.iter().cloned().collect(),
        }
    }
}

/// `NG` iff any detection's class is in the NG set.
pub fn decide<'a>(
    classes: impl IntoIterator<Item = &'a str>,
    ng_classes: &HashSet<String>,
) -> Decision {
    if classes.into_iter().any(|cls| ng_classes.contains(cls)) {
        Decision::Ng
    } else {
        Decision::Ok
    }
}

#[derive(Clone)]
pub struct DetectionService {
    detector: Option<Arc<dyn Detector>>,
    settings: Arc<InferSettings>,
}

impl DetectionService {
    pub fn new(detector: Option<Arc<dyn Detector>>, settings: InferSettings) -> Self {
        Self {
            detector,
            settings: Arc::new(settings),
        }
    }

    pub fn model_loaded(&self) -> bool {
        self.detector.is_some()
    }

    pub fn model_version(&self) -> &str {
        &self.settings.model_version
    }

    #[instrument(skip_all, fields(request_id = ?request.request_id, barcode = ?request.barcode))]
    pub fn infer(&self, request: InferRequest) -> Result<InferResponse, InferError> {
        let detector = self.detector.as_ref().ok_or(InferError::ModelNotLoaded)?;
        if request.image.is_empty() {
            return Err(InferError::EmptyFile);
        }
        let image = image::load_from_memory(&request.image)
            .map_err(InferError::InvalidImage)?
            .to_rgb8();
        let (width, height) = image.dimensions();

        let params = PredictParams {
            imgsz: request.imgsz.filter(|&s| s > 0).unwrap_or(self.settings.default_imgsz),
            conf_thres: self.settings.conf_thres,
            iou_thres: self.settings.iou_thres,
        };

        let started = Instant::now();
        let raw = detector.predict(&image, &params)?;
        let time_ms = started.elapsed().as_millis() as u64;
        metrics::histogram!("qc_infer_time_ms").record(time_ms as f64);

        let detections: Vec<DetectionOut> = raw
            .into_iter()
            .enumerate()
            .map(|(i, d)| DetectionOut {
                id: format!("d{i}"),
                cls: d.class_name,
                conf: d.confidence,
                xyxy: d.xyxy,
            })
            .collect();
        let suggested_decision = decide(
            detections.iter().map(|d| d.cls.as_str()),
            &self.settings.ng_classes,
        );
        debug!(
            detections = detections.len(),
            ?suggested_decision,
            time_ms,
            "inference complete"
        );

        Ok(InferResponse {
            request_id: request.request_id,
            barcode: request.barcode,
            model_version: self.settings.model_version.clone(),
            img_shape: [height, width],
            time_ms,
            detections,
            suggested_decision,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageFormat, Rgb};
    use std::io::Cursor;
    use std::sync::Mutex;

    struct FixedDetector {
        classes: Vec<&'static str>,
        seen: Mutex<Option<PredictParams>>,
    }

    impl FixedDetector {
        fn new(classes: Vec<&'static str>) -> Arc<Self> {
            Arc::new(Self {
                classes,
                seen: Mutex::new(None),
            })
        }
    }

    impl Detector for FixedDetector {
        fn predict(
            &self,
            _image: &RgbImage,
            params: &PredictParams,
        ) -> Result<Vec<RawDetection>, InferError> {
            *self.seen.lock().expect("lock") = Some(*params);
            Ok(self
                .classes
                .iter()
                .map(|cls| RawDetection {
                    class_name: (*cls).to_owned(),
                    confidence: 0.9,
                    xyxy: [1.0, 2.0, 3.0, 4.0],
                })
                .collect())
        }
    }

    fn with_detector(detector: Arc<FixedDetector>) -> DetectionService {
        DetectionService::new(Some(detector as Arc<dyn Detector>), settings())
    }

    fn settings() -> InferSettings {
        InferSettings {
            model_version: "models/best.pt".into(),
            default_imgsz: 640,
            conf_thres: 0.25,
            iou_thres: 0.45,
            ng_classes: ["scratch", "dent"].into_iter().map(String::from).collect(),
        }
    }

    fn png(width: u32, height: u32) -> Bytes {
        let image = RgbImage::from_pixel(width, height, Rgb([90, 90, 90]));
        let mut out = Cursor::new(Vec::new());
        image.write_to(&mut out, ImageFormat::Png).expect("png");
        Bytes::from(out.into_inner())
    }

    fn request() -> InferRequest {
        InferRequest {
            image: png(40, 30),
            barcode: Some("SN-001".into()),
            request_id: Some("req-1".into()),
            imgsz: None,
        }
    }

    #[test]
    fn ng_when_any_class_is_ng() {
        let service = with_detector(FixedDetector::new(vec!["ok_mark", "dent"]));
        let response = service.infer(request()).expect("infer");
        assert_eq!(response.suggested_decision, Decision::Ng);
        assert_eq!(response.detections.len(), 2);
        assert_eq!(response.detections[1].id, "d1");
        assert_eq!(response.detections[1].cls, "dent");
        assert_eq!(response.img_shape, [30, 40]);
        assert_eq!(response.request_id.as_deref(), Some("req-1"));
        assert_eq!(response.barcode.as_deref(), Some("SN-001"));
        assert_eq!(response.model_version, "models/best.pt");
    }

    #[test]
    fn ok_without_ng_classes() {
        let service = with_detector(FixedDetector::new(vec!["ok_mark"]));
        assert_eq!(service.infer(request()).expect("infer").suggested_decision, Decision::Ok);

        let service = with_detector(FixedDetector::new(vec![]));
        let response = service.infer(request()).expect("infer");
        assert!(response.detections.is_empty());
        assert_eq!(response.suggested_decision, Decision::Ok);
    }

    #[test]
    fn imgsz_defaults_and_overrides() {
        let detector = FixedDetector::new(vec![]);
        let service = with_detector(Arc::clone(&detector));

        service.infer(request()).expect("infer");
        assert_eq!(detector.seen.lock().expect("lock").expect("params").imgsz, 640);

        service
            .infer(InferRequest {
                imgsz: Some(1280),
                ..request()
            })
            .expect("infer");
        let params = detector.seen.lock().expect("lock").expect("params");
        assert_eq!(params.imgsz, 1280);
        assert_eq!(params.conf_thres, 0.25);
        assert_eq!(params.iou_thres, 0.45);
    }

    #[test]
    fn rejects_bad_input() {
        let service = with_detector(FixedDetector::new(vec![]));
        let empty = InferRequest {
            image: Bytes::new(),
            ..request()
        };
        assert!(matches!(service.infer(empty), Err(InferError::EmptyFile)));

        let garbage = InferRequest {
            image: Bytes::from_static(b"not an image"),
            ..request()
        };
        assert!(matches!(service.infer(garbage), Err(InferError::InvalidImage(_))));
    }

    #[test]
    fn requires_a_model() {
        let service = DetectionService::new(None, settings());
        assert!(!service.model_loaded());
        assert!(matches!(service.infer(request()), Err(InferError::ModelNotLoaded)));
    }

    #[test]
    fn decision_serializes_upper_case() {
        assert_eq!(serde_json::to_string(&Decision::Ng).expect("json"), "\"NG\"");
        assert_eq!(serde_json::to_string(&Decision::Ok).expect("json"), "\"OK\"");
    }
}
