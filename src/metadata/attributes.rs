use serde_json::{json, Value};

use crate::bbox::BBox;

/// User defined array attributes (the `.zattrs` document).
pub type ArrayAttributes = serde_json::Map<String, Value>;

/// The attribute holding the dimension names of an array.
pub const AXIS_NAMES_ATTRIBUTE: &str = "axis_names";

/// The attribute holding the source bounding box of a crop array.
pub const BBOX_ATTRIBUTE: &str = "bbox";

/// The attributes of a crop array cut from `bbox`.
#[must_use]
pub fn crop_attributes(bbox: &BBox) -> ArrayAttributes {
    let mut attributes = ArrayAttributes::new();
    attributes.insert(
        AXIS_NAMES_ATTRIBUTE.to_string(),
        json!(["t", "c", "z", "y", "x"]),
    );
    attributes.insert(BBOX_ATTRIBUTE.to_string(), json!(bbox));
    attributes
}

/// The attributes of a per-frame background array.
#[must_use]
pub fn background_attributes() -> ArrayAttributes {
    let mut attributes = ArrayAttributes::new();
    attributes.insert(AXIS_NAMES_ATTRIBUTE.to_string(), json!(["t", "c", "z"]));
    attributes.insert(
        "description".to_string(),
        json!("Median of pixels outside all crop bounding boxes"),
    );
    attributes
}

/// Returns the bounding box stored in crop array attributes, if present and well formed.
#[must_use]
pub fn bbox_from_attributes(attributes: &ArrayAttributes) -> Option<BBox> {
    attributes
        .get(BBOX_ATTRIBUTE)
        .and_then(|bbox| serde_json::from_value(bbox.clone()).ok())
}

/// Returns the axis names stored in array attributes, if present and well formed.
#[must_use]
pub fn axis_names_from_attributes(attributes: &ArrayAttributes) -> Option<Vec<String>> {
    attributes
        .get(AXIS_NAMES_ATTRIBUTE)
        .and_then(|names| serde_json::from_value(names.clone()).ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crop_attributes_bbox() {
        let bbox = BBox {
            crop: 7,
            x: 10,
            y: 20,
            w: 30,
            h: 40,
        };
        let attributes = crop_attributes(&bbox);
        assert_eq!(bbox_from_attributes(&attributes), Some(bbox));
        assert_eq!(
            axis_names_from_attributes(&attributes).unwrap(),
            ["t", "c", "z", "y", "x"]
        );
        assert_eq!(
            serde_json::to_string(&attributes).unwrap(),
            r#"{"axis_names":["t","c","z","y","x"],"bbox":{"crop":7,"x":10,"y":20,"w":30,"h":40}}"#
        );
    }

    #[test]
    fn background_attributes_have_no_bbox() {
        let attributes = background_attributes();
        assert!(bbox_from_attributes(&attributes).is_none());
        assert_eq!(axis_names_from_attributes(&attributes).unwrap().len(), 3);
    }
}
