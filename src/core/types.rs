// Domain types shared between the service, the client, and the tests.

use serde::{Deserialize, Serialize};

/// Measured weights within this tolerance of the tray's expected weight are
/// considered a match.
const WEIGHT_TOLERANCE_KG: f32 = 0.05;

/// One predicted instrument instance.
///
/// Created per inference call; never persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    pub class_id: usize,
    pub label: String,
    /// Confidence score in [0.0, 1.0].
    pub confidence: f32,
    /// [x1, y1, x2, y2] in original-image pixels.
    pub bbox: [f32; 4],
}

/// Wire form of a detection: exactly `{"label", "confidence", "box"}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiDetection {
    pub label: String,
    pub confidence: f32,
    #[serde(rename = "box")]
    pub bbox: [f32; 4],
}

impl From<&Detection> for ApiDetection {
    fn from(detection: &Detection) -> Self {
        Self {
            label: detection.label.clone(),
            confidence: detection.confidence,
            bbox: detection.bbox,
        }
    }
}

/// Expected instrument and count within a tray.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrayItem {
    pub name: String,
    pub expected_count: u32,
}

/// Reference list of expected instruments for an operation.
///
/// Informational metadata; the core inference path never consults it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrayConfiguration {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_weight_kg: Option<f32>,
    pub items: Vec<TrayItem>,
}

/// Aggregated count of one detected instrument type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstrumentCount {
    pub name: String,
    pub count: u32,
}

/// An expected instrument the detector found too few of.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MissingItem {
    pub name: String,
    pub expected: u32,
    pub found: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeightMismatch {
    pub expected_kg: f32,
    pub measured_kg: f32,
}

/// Result of comparing one detection pass against a tray configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrayCheckReport {
    pub tray: String,
    /// The individual detections the report was computed from, in the
    /// model's native output order.
    pub detections: Vec<ApiDetection>,
    pub detected: Vec<InstrumentCount>,
    pub expected: Vec<TrayItem>,
    pub complete: bool,
    pub missing: Vec<MissingItem>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weight_mismatch: Option<WeightMismatch>,
}

/// Aggregate detections into per-instrument counts, highest count first.
pub fn count_instruments(detections: &[Detection]) -> Vec<InstrumentCount> {
    let mut counts: Vec<InstrumentCount> = Vec::new();
    for detection in detections {
        match counts.iter_mut().find(|c| c.name == detection.label) {
            Some(entry) => entry.count += 1,
            None => counts.push(InstrumentCount {
                name: detection.label.clone(),
                count: 1,
            }),
        }
    }
    counts.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.name.cmp(&b.name)));
    counts
}

impl TrayConfiguration {
    /// Compare a detection pass against this tray's reference list.
    pub fn check(
        &self,
        tray_name: &str,
        detections: &[Detection],
        measured_weight_kg: Option<f32>,
    ) -> TrayCheckReport {
        let detected = count_instruments(detections);

        let missing: Vec<MissingItem> = self
            .items
            .iter()
            .filter_map(|item| {
                let found = detected
                    .iter()
                    .find(|c| c.name == item.name)
                    .map(|c| c.count)
                    .unwrap_or(0);
                (found < item.expected_count).then(|| MissingItem {
                    name: item.name.clone(),
                    expected: item.expected_count,
                    found,
                })
            })
            .collect();

        let weight_mismatch = match (self.expected_weight_kg, measured_weight_kg) {
            (Some(expected), Some(measured))
                if (expected - measured).abs() > WEIGHT_TOLERANCE_KG =>
            {
                Some(WeightMismatch {
                    expected_kg: expected,
                    measured_kg: measured,
                })
            }
            _ => None,
        };

        TrayCheckReport {
            tray: tray_name.to_string(),
            detections: detections.iter().map(ApiDetection::from).collect(),
            complete: missing.is_empty() && weight_mismatch.is_none(),
            detected,
            expected: self.items.clone(),
            missing,
            weight_mismatch,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detection(label: &str) -> Detection {
        Detection {
            class_id: 0,
            label: label.to_string(),
            confidence: 0.9,
            bbox: [0.0, 0.0, 10.0, 10.0],
        }
    }

    fn tray(items: &[(&str, u32)], weight: Option<f32>) -> TrayConfiguration {
        TrayConfiguration {
            expected_weight_kg: weight,
            items: items
                .iter()
                .map(|(name, expected_count)| TrayItem {
                    name: name.to_string(),
                    expected_count: *expected_count,
                })
                .collect(),
        }
    }

    #[test]
    fn wire_detection_has_declared_schema() {
        let api = ApiDetection::from(&Detection {
            class_id: 3,
            label: "Scalpel".to_string(),
            confidence: 0.87,
            bbox: [1.0, 2.0, 3.0, 4.0],
        });

        let value = serde_json::to_value(&api).unwrap();
        let object = value.as_object().unwrap();
        let mut keys: Vec<&str> = object.keys().map(String::as_str).collect();
        keys.sort();
        assert_eq!(keys, vec!["box", "confidence", "label"]);
        assert_eq!(object["label"], "Scalpel");
        assert_eq!(object["box"].as_array().unwrap().len(), 4);

        let roundtrip: ApiDetection = serde_json::from_value(value).unwrap();
        assert_eq!(roundtrip, api);
    }

    #[test]
    fn counts_aggregate_and_order_by_frequency() {
        let detections = vec![
            detection("Probe"),
            detection("Scalpel"),
            detection("Scalpel"),
            detection("Kelly Hemostat"),
        ];

        let counts = count_instruments(&detections);
        assert_eq!(
            counts,
            vec![
                InstrumentCount {
                    name: "Scalpel".to_string(),
                    count: 2
                },
                InstrumentCount {
                    name: "Kelly Hemostat".to_string(),
                    count: 1
                },
                InstrumentCount {
                    name: "Probe".to_string(),
                    count: 1
                },
            ]
        );
    }

    #[test]
    fn complete_tray_reports_no_missing_items() {
        let tray = tray(&[("Scalpel", 1), ("Probe", 1)], None);
        let detections = vec![detection("Scalpel"), detection("Probe")];

        let report = tray.check("Minor Set", &detections, None);
        assert!(report.complete);
        assert!(report.missing.is_empty());
        assert!(report.weight_mismatch.is_none());
    }

    #[test]
    fn shortfalls_are_reported_with_counts() {
        let tray = tray(&[("Scalpel", 2), ("Probe", 1)], None);
        let detections = vec![detection("Scalpel")];

        let report = tray.check("Minor Set", &detections, None);
        assert!(!report.complete);
        assert_eq!(
            report.missing,
            vec![
                MissingItem {
                    name: "Scalpel".to_string(),
                    expected: 2,
                    found: 1
                },
                MissingItem {
                    name: "Probe".to_string(),
                    expected: 1,
                    found: 0
                },
            ]
        );
    }

    #[test]
    fn weight_mismatch_flags_out_of_tolerance_values() {
        let tray = tray(&[("Scalpel", 1)], Some(2.0));
        let detections = vec![detection("Scalpel")];

        let matched = tray.check("Minor Set", &detections, Some(2.02));
        assert!(matched.complete);
        assert!(matched.weight_mismatch.is_none());

        let mismatched = tray.check("Minor Set", &detections, Some(2.4));
        assert!(!mismatched.complete);
        assert_eq!(
            mismatched.weight_mismatch,
            Some(WeightMismatch {
                expected_kg: 2.0,
                measured_kg: 2.4
            })
        );
    }

    #[test]
    fn unweighed_trays_skip_the_weight_check() {
        let tray = tray(&[("Scalpel", 1)], None);
        let report = tray.check("Minor Set", &[detection("Scalpel")], Some(3.0));
        assert!(report.complete);
    }
}
