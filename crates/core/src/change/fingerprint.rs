//! Content fingerprints.
//!
//! A fingerprint is the SHA-256 of a canonical JSON rendering of the
//! structurally relevant content. Struct fields serialize in declaration
//! order and maps are ordered, so equal content always hashes equal.

use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::source::{Geometry, InstanceData, SourceElement, Symbology};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint(String);

/// The fingerprinted view of an element. `id` and `last_modified` are not
/// content.
#[derive(Serialize)]
struct ElementContent<'a> {
    element_type: &'a str,
    geometry: &'a Geometry,
    symbology: &'a Symbology,
    properties: Option<&'a InstanceData>,
    code: Option<&'a str>,
    geom_part: Option<&'a str>,
}

impl Fingerprint {
    /// Hash any serializable value under a domain tag.
    pub fn of<T: Serialize + ?Sized>(tag: &str, value: &T) -> Result<Self, serde_json::Error> {
        let mut hasher = Sha256::new();
        hasher.update(tag.as_bytes());
        hasher.update([0u8]);
        serde_json::to_writer(&mut hasher, value)?;
        Ok(Self(hex::encode(hasher.finalize())))
    }

    /// Fingerprint of an element. `geom_part` is the fingerprint of the
    /// shared definition it instances, so editing the definition changes
    /// every instance.
    pub fn of_element(
        element: &SourceElement,
        geom_part: Option<&Fingerprint>,
    ) -> Result<Self, serde_json::Error> {
        Self::of(
            "element",
            &ElementContent {
                element_type: &element.element_type,
                geometry: &element.geometry,
                symbology: &element.symbology,
                properties: element.properties.as_ref(),
                code: element.code.as_deref(),
                geom_part: geom_part.map(Fingerprint::as_str),
            },
        )
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geo::Point3d;

    fn line(id: i64) -> SourceElement {
        SourceElement {
            id,
            element_type: "line".into(),
            geometry: Geometry::Line {
                start: Point3d::ORIGIN,
                end: Point3d::new(1.0, 0.0, 0.0),
            },
            symbology: Symbology::default(),
            properties: None,
            code: None,
            last_modified: None,
        }
    }

    #[test]
    fn test_timestamps_do_not_change_fingerprint() {
        let a = line(1);
        let mut b = line(1);
        b.last_modified = Some("2025-06-01T00:00:00Z".into());
        assert_eq!(
            Fingerprint::of_element(&a, None).unwrap(),
            Fingerprint::of_element(&b, None).unwrap()
        );
    }

    #[test]
    fn test_geometry_and_symbology_change_fingerprint() {
        let base = Fingerprint::of_element(&line(1), None).unwrap();

        let mut moved = line(1);
        moved.geometry = moved
            .geometry
            .transformed(&crate::geo::AffineTransform::translation(Point3d::new(0.0, 1.0, 0.0)));
        assert_ne!(base, Fingerprint::of_element(&moved, None).unwrap());

        let mut recolored = line(1);
        recolored.symbology.color = 3;
        assert_ne!(base, Fingerprint::of_element(&recolored, None).unwrap());

        let mut with_props = line(1);
        with_props.properties = Some(InstanceData {
            schema: "Plant".into(),
            class: "Pipe".into(),
            values: [("diameter".to_string(), serde_json::json!(2.5))].into(),
        });
        assert_ne!(base, Fingerprint::of_element(&with_props, None).unwrap());
    }

    #[test]
    fn test_source_id_is_not_content() {
        assert_eq!(
            Fingerprint::of_element(&line(1), None).unwrap(),
            Fingerprint::of_element(&line(2), None).unwrap()
        );
    }

    #[test]
    fn test_tag_separates_domains() {
        let a = Fingerprint::of("a", &1).unwrap();
        let b = Fingerprint::of("b", &1).unwrap();
        assert_ne!(a, b);
        assert_eq!(a.as_str().len(), 64);
    }
}
