use super::DetectorOutput;
use crate::config::LabelNumbering;
use serde::Serialize;
use std::collections::HashMap;

/// A labelled detection as delivered to the sink: `{"name", "xywh"}`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DetectedObject {
    pub name: String,
    pub xywh: [f32; 4],
    #[serde(skip)]
    pub xyxy: [f32; 4],
}

fn class_name(names: &[String], class_index: u32) -> String {
    names
        .get(class_index as usize)
        .cloned()
        .unwrap_or_else(|| format!("class{}", class_index))
}

/// Gives every detection a label unique within the frame by suffixing the
/// class name with a per-class rank.
///
/// With `Descending`, ranks count down from the class total in detection
/// order, so `[dog, dog, cat]` becomes `[dog_2, dog_1, cat_1]`. `Ascending`
/// yields `[dog_1, dog_2, cat_1]`.
pub fn label_detections(output: &DetectorOutput, numbering: LabelNumbering) -> Vec<DetectedObject> {
    let mut remaining: HashMap<u32, usize> = HashMap::new();
    for detection in &output.detections {
        *remaining.entry(detection.class_index).or_default() += 1;
    }
    let mut seen: HashMap<u32, usize> = HashMap::new();

    output
        .detections
        .iter()
        .map(|detection| {
            let rank = match numbering {
                LabelNumbering::Descending => {
                    let left = remaining.entry(detection.class_index).or_default();
                    let rank = *left;
                    *left = left.saturating_sub(1);
                    rank
                }
                LabelNumbering::Ascending => {
                    let count = seen.entry(detection.class_index).or_default();
                    *count += 1;
                    *count
                }
            };

            DetectedObject {
                name: format!(
                    "{}_{}",
                    class_name(&output.class_names, detection.class_index),
                    rank
                ),
                xywh: detection.xywh,
                xyxy: detection.xyxy,
            }
        })
        .collect()
}
