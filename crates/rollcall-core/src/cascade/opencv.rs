//! OpenCV cascade XML (`<opencv_storage><cascade>`, HAAR features, BOOST stages).
//!
//! Only the element structure matters here, so the reader keeps element
//! names, text, and children, and skips attributes, comments, and the
//! XML declaration.

use super::{Cascade, CascadeError, Feature, Node, Stage, WeakClassifier, WeightedRect};

#[derive(Debug, Default)]
struct Element {
    name: String,
    text: String,
    children: Vec<Element>,
}

impl Element {
    fn child(&self, name: &str) -> Option<&Element> {
        self.children.iter().find(|c| c.name == name)
    }

    fn require(&self, name: &str) -> Result<&Element, CascadeError> {
        self.child(name)
            .ok_or_else(|| CascadeError::Xml(format!("<{}> is missing <{name}>", self.name)))
    }

    /// `<_>` list entries.
    fn items(&self) -> impl Iterator<Item = &Element> {
        self.children.iter().filter(|c| c.name == "_")
    }

    fn number<T: std::str::FromStr>(&self, name: &str) -> Result<T, CascadeError> {
        let el = self.require(name)?;
        el.text
            .trim()
            .parse()
            .map_err(|_| CascadeError::Xml(format!("<{name}> is not a number: {:?}", el.text.trim())))
    }
}

fn numbers<T: std::str::FromStr>(el: &Element) -> Result<Vec<T>, CascadeError> {
    el.text
        .split_whitespace()
        .map(|tok| {
            tok.parse()
                .map_err(|_| CascadeError::Xml(format!("<{}> has a bad number {tok:?}", el.name)))
        })
        .collect()
}

/// Build the element tree of `doc` and return its root element.
fn parse_tree(doc: &str) -> Result<Element, CascadeError> {
    let mut stack: Vec<Element> = vec![Element::default()];
    let mut rest = doc;

    while let Some(open) = rest.find('<') {
        if let Some(top) = stack.last_mut() {
            top.text.push_str(&rest[..open]);
        }
        rest = &rest[open..];

        let skip_to = |rest: &str, end: &str| {
            rest.find(end)
                .map(|i| i + end.len())
                .ok_or_else(|| CascadeError::Xml(format!("unterminated markup, expected {end:?}")))
        };
        if rest.starts_with("<!--") {
            rest = &rest[skip_to(rest, "-->")?..];
            continue;
        }
        if rest.starts_with("<?") {
            rest = &rest[skip_to(rest, "?>")?..];
            continue;
        }
        if rest.starts_with("<!") {
            rest = &rest[skip_to(rest, ">")?..];
            continue;
        }

        let close = skip_to(rest, ">")?;
        let tag = &rest[1..close - 1];
        rest = &rest[close..];

        if let Some(name) = tag.strip_prefix('/') {
            let name = name.trim();
            let done = stack
                .pop()
                .filter(|el| el.name == name && !stack.is_empty())
                .ok_or_else(|| CascadeError::Xml(format!("unexpected </{name}>")))?;
            if let Some(parent) = stack.last_mut() {
                parent.children.push(done);
            }
            continue;
        }

        let self_closing = tag.ends_with('/');
        let tag = tag.trim_end_matches('/');
        let name = tag.split_whitespace().next().unwrap_or_default().to_string();
        if name.is_empty() {
            return Err(CascadeError::Xml("empty tag".into()));
        }
        let el = Element {
            name,
            ..Element::default()
        };
        if self_closing {
            if let Some(parent) = stack.last_mut() {
                parent.children.push(el);
            }
        } else {
            stack.push(el);
        }
    }

    if stack.len() != 1 {
        let open = stack.last().map(|el| el.name.clone()).unwrap_or_default();
        return Err(CascadeError::Xml(format!("unclosed <{open}>")));
    }
    let mut document = stack.pop().unwrap_or_default();
    document
        .children
        .pop()
        .filter(|_| document.children.is_empty())
        .ok_or_else(|| CascadeError::Xml("expected exactly one root element".into()))
}

pub(super) fn parse(doc: &str) -> Result<Cascade, CascadeError> {
    let root = parse_tree(doc)?;
    let cascade = match root.child("cascade") {
        Some(cascade) => cascade,
        None if root.name == "cascade" => &root,
        None => {
            return Err(CascadeError::Xml(
                "no <cascade> element (legacy haartraining layouts are not supported)".into(),
            ))
        }
    };

    if let Some(kind) = cascade.child("featureType") {
        if kind.text.trim() != "HAAR" {
            return Err(CascadeError::Xml(format!(
                "unsupported feature type {}",
                kind.text.trim()
            )));
        }
    }
    if let Some(kind) = cascade.child("stageType") {
        if kind.text.trim() != "BOOST" {
            return Err(CascadeError::Xml(format!("unsupported stage type {}", kind.text.trim())));
        }
    }

    let width: u32 = cascade.number("width")?;
    let height: u32 = cascade.number("height")?;
    if width != height {
        return Err(CascadeError::Xml(format!(
            "only square windows are supported, got {width}x{height}"
        )));
    }

    let stages = cascade
        .require("stages")?
        .items()
        .map(parse_stage)
        .collect::<Result<Vec<_>, _>>()?;
    let features = cascade
        .require("features")?
        .items()
        .map(parse_feature)
        .collect::<Result<Vec<_>, _>>()?;

    Ok(Cascade {
        name: "opencv".into(),
        window: width,
        min_variance: 0.0,
        features,
        stages,
    })
}

fn parse_stage(el: &Element) -> Result<Stage, CascadeError> {
    let classifiers = el
        .require("weakClassifiers")?
        .items()
        .map(|weak| {
            let raw: Vec<f64> = numbers(weak.require("internalNodes")?)?;
            if raw.is_empty() || raw.len() % 4 != 0 {
                return Err(CascadeError::Xml(format!(
                    "internalNodes needs groups of 4 values, got {}",
                    raw.len()
                )));
            }
            let nodes = raw
                .chunks_exact(4)
                .map(|n| {
                    let index = |v: f64| {
                        if v.fract() == 0.0 && v.abs() <= i32::MAX as f64 {
                            Ok(v as i32)
                        } else {
                            Err(CascadeError::Xml(format!("bad node reference {v}")))
                        }
                    };
                    let feature = index(n[2])?;
                    Ok(Node {
                        left: index(n[0])?,
                        right: index(n[1])?,
                        feature: usize::try_from(feature)
                            .map_err(|_| CascadeError::Xml(format!("bad feature index {feature}")))?,
                        threshold: n[3],
                    })
                })
                .collect::<Result<Vec<_>, CascadeError>>()?;
            Ok(WeakClassifier {
                nodes,
                leaves: numbers(weak.require("leafValues")?)?,
            })
        })
        .collect::<Result<Vec<_>, CascadeError>>()?;

    Ok(Stage {
        threshold: el.number("stageThreshold")?,
        classifiers,
    })
}

fn parse_feature(el: &Element) -> Result<Feature, CascadeError> {
    if let Some(tilted) = el.child("tilted") {
        if tilted.text.trim() != "0" {
            return Err(CascadeError::Xml("tilted features are not supported".into()));
        }
    }
    let rects = el
        .require("rects")?
        .items()
        .map(|r| {
            let parts: Vec<&str> = r.text.split_whitespace().collect();
            let [x, y, width, height, weight] = parts[..] else {
                return Err(CascadeError::Xml(format!("rect needs 5 values: {:?}", r.text.trim())));
            };
            let int = |s: &str| {
                s.parse::<u32>()
                    .map_err(|_| CascadeError::Xml(format!("bad rect coordinate {s:?}")))
            };
            Ok(WeightedRect {
                x: int(x)?,
                y: int(y)?,
                width: int(width)?,
                height: int(height)?,
                weight: weight
                    .parse()
                    .map_err(|_| CascadeError::Xml(format!("bad rect weight {weight:?}")))?,
            })
        })
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Feature { rects })
}

#[cfg(test)]
pub(super) mod tests {
    use super::*;

    /// The edge model from the JSON tests, as OpenCV writes it.
    pub(in crate::cascade) const EDGE_XML: &str = r#"<?xml version="1.0"?>
<opencv_storage>
<cascade type_id="opencv-cascade-classifier"><stageType>BOOST</stageType>
  <featureType>HAAR</featureType>
  <height>4</height>
  <width>4</width>
  <stageParams>
    <boostType>GAB</boostType>
    <maxWeakCount>1</maxWeakCount></stageParams>
  <featureParams>
    <maxCatCount>0</maxCatCount></featureParams>
  <stageNum>1</stageNum>
  <stages>
    <!-- stage 0 -->
    <_>
      <maxWeakCount>1</maxWeakCount>
      <stageThreshold>1.</stageThreshold>
      <weakClassifiers>
        <_>
          <internalNodes>
            0 -1 0 0.1</internalNodes>
          <leafValues>
            0. 1.</leafValues></_></weakClassifiers></_></stages>
  <features>
    <_>
      <rects>
        <_>
          0 0 4 4 -1.</_>
        <_>
          0 2 4 2 2.</_></rects></_></features></cascade>
</opencv_storage>
"#;

    #[test]
    fn test_parse_opencv_layout() {
        let cascade = parse(EDGE_XML).unwrap();
        assert_eq!(cascade.window, 4);
        assert_eq!(cascade.stages.len(), 1);
        assert_eq!(cascade.stages[0].threshold, 1.0);
        let weak = &cascade.stages[0].classifiers[0];
        assert_eq!(
            weak.nodes,
            vec![Node {
                feature: 0,
                threshold: 0.1,
                left: 0,
                right: -1
            }]
        );
        assert_eq!(weak.leaves, vec![0.0, 1.0]);
        assert_eq!(cascade.features[0].rects[1].weight, 2.0);
        assert_eq!(cascade.features[0].rects[1].y, 2);
    }

    #[test]
    fn test_xml_model_finds_edge() {
        use crate::integral::IntegralImage;
        use image::{GrayImage, Luma};

        let cascade = Cascade::from_opencv_xml(EDGE_XML).unwrap();
        let scaled = cascade.at_scale(2.0);
        let edge = |top: u8, bottom: u8| {
            IntegralImage::new(&GrayImage::from_fn(8, 8, |_, y| {
                Luma([if y < 4 { top } else { bottom }])
            }))
        };
        assert!(scaled.classify(&edge(30, 200), 0, 0));
        assert!(!scaled.classify(&edge(200, 30), 0, 0));
    }

    #[test]
    fn test_tilted_features_rejected() {
        let tilted = EDGE_XML.replace("</rects></_></features>", "</rects><tilted>1</tilted></_></features>");
        assert!(matches!(parse(&tilted), Err(CascadeError::Xml(_))));
    }

    #[test]
    fn test_unbalanced_markup_rejected() {
        let truncated = &EDGE_XML[..EDGE_XML.len() / 2];
        assert!(matches!(parse(truncated), Err(CascadeError::Xml(_))));
        assert!(matches!(parse("<a></b>"), Err(CascadeError::Xml(_))));
    }

    #[test]
    fn test_missing_stages_rejected() {
        let doc = "<opencv_storage><cascade><width>24</width><height>24</height></cascade></opencv_storage>";
        assert!(matches!(parse(doc), Err(CascadeError::Xml(_))));
    }

    #[test]
    fn test_non_square_window_rejected() {
        let doc = EDGE_XML.replace("<height>4</height>", "<height>5</height>");
        assert!(matches!(parse(&doc), Err(CascadeError::Xml(_))));
    }

    #[test]
    fn test_legacy_layout_rejected() {
        let doc = r#"<opencv_storage><haarcascade_frontalface type_id="opencv-haar-classifier">
            <size>24 24</size></haarcascade_frontalface></opencv_storage>"#;
        assert!(matches!(parse(doc), Err(CascadeError::Xml(_))));
    }
}
