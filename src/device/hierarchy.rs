//! Parsing of Android `uiautomator dump` hierarchies into [`UiElement`]s.

use quick_xml::events::{BytesStart, Event};
use quick_xml::reader::Reader;
use std::collections::HashMap;

use super::{Bounds, UiElement};
use crate::error::{BridgeError, BridgeResult};

/// Minimum side length (px) for an anonymous clickable node to be kept
const MIN_CLICKABLE_SIDE: i32 = 10;

#[derive(Debug, Default)]
struct RawNode {
    resource_id: String,
    text: String,
    content_desc: String,
    class: String,
    bounds: Option<Bounds>,
    clickable: bool,
    long_clickable: bool,
    scrollable: bool,
    enabled: bool,
}

/// Parse a uiautomator XML dump.
///
/// Nodes are kept when they carry identity (text, description or resource id),
/// are clickable and larger than 10x10 px, or are input fields. Ids are derived
/// from the resource id, then the description, then `Role:text`, then
/// `Role@x,y` at the node's center; repeated ids get `#2`, `#3`, ... suffixes.
pub fn parse_hierarchy(xml: &str) -> BridgeResult<Vec<UiElement>> {
    let mut reader = Reader::from_str(xml);
    let mut elements = Vec::new();
    let mut seen: HashMap<String, usize> = HashMap::new();

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) | Ok(Event::Empty(e)) => {
                if e.name().as_ref() != b"node" {
                    continue;
                }
                let node = read_node(&e)?;
                if let Some(mut element) = to_element(node) {
                    let count = seen.entry(element.id.clone()).or_insert(0);
                    *count += 1;
                    if *count > 1 {
                        element.id = format!("{}#{}", element.id, count);
                    }
                    elements.push(element);
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => {
                return Err(BridgeError::InvalidOutput(format!(
                    "hierarchy XML error at {}: {}",
                    reader.buffer_position(),
                    e
                )));
            }
            _ => {}
        }
    }

    Ok(elements)
}

/// Cut the XML document out of `uiautomator dump /dev/tty` output, which
/// appends a status line after the closing tag.
pub fn extract_xml(output: &str) -> Option<&str> {
    let start = output.find("<?xml").or_else(|| output.find("<hierarchy"))?;
    let end = output.rfind("</hierarchy>")? + "</hierarchy>".len();
    if end <= start {
        return None;
    }
    Some(&output[start..end])
}

fn read_node(e: &BytesStart<'_>) -> BridgeResult<RawNode> {
    let mut node = RawNode {
        enabled: true,
        ..Default::default()
    };
    for attr in e.attributes() {
        let attr = attr.map_err(|e| BridgeError::InvalidOutput(e.to_string()))?;
        let value = attr
            .unescape_value()
            .map_err(|e| BridgeError::InvalidOutput(e.to_string()))?;
        match attr.key.as_ref() {
            b"resource-id" => node.resource_id = value.trim().to_string(),
            b"text" => node.text = value.trim().to_string(),
            b"content-desc" => node.content_desc = value.trim().to_string(),
            b"class" => node.class = value.to_string(),
            b"bounds" => node.bounds = parse_bounds(&value),
            b"clickable" => node.clickable = value == "true",
            b"long-clickable" => node.long_clickable = value == "true",
            b"scrollable" => node.scrollable = value == "true",
            b"enabled" => node.enabled = value != "false",
            _ => {}
        }
    }
    Ok(node)
}

fn to_element(node: RawNode) -> Option<UiElement> {
    let bounds = node.bounds?;
    let role = short_class_name(&node.class);
    let class_lower = node.class.to_lowercase();
    let is_input = class_lower.contains("edittext") || class_lower.contains("input");
    let has_identity =
        !node.text.is_empty() || !node.content_desc.is_empty() || !node.resource_id.is_empty();
    let large_clickable = node.clickable
        && bounds.width() > MIN_CLICKABLE_SIDE
        && bounds.height() > MIN_CLICKABLE_SIDE;

    if !(has_identity || large_clickable || is_input) {
        return None;
    }

    let id = if !node.resource_id.is_empty() {
        node.resource_id.clone()
    } else if !node.content_desc.is_empty() {
        node.content_desc.clone()
    } else if !node.text.is_empty() {
        format!("{}:{}", role, node.text)
    } else {
        let center = bounds.center();
        format!("{}@{},{}", role, center.x, center.y)
    };

    let label = if node.text.is_empty() {
        node.content_desc.clone()
    } else {
        node.text.clone()
    };

    let interactive =
        node.enabled && (node.clickable || node.long_clickable || node.scrollable || is_input);

    Some(UiElement {
        id,
        bounds,
        role,
        label,
        resource_id: (!node.resource_id.is_empty()).then_some(node.resource_id),
        interactive,
    })
}

/// Parse `[left,top][right,bottom]`
fn parse_bounds(value: &str) -> Option<Bounds> {
    let numbers: Vec<i32> = value
        .split(|c: char| !(c.is_ascii_digit() || c == '-'))
        .filter(|s| !s.is_empty())
        .filter_map(|s| s.parse().ok())
        .collect();
    match numbers.as_slice() {
        [left, top, right, bottom] => Some(Bounds::new(*left, *top, *right, *bottom)),
        _ => None,
    }
}

fn short_class_name(class: &str) -> String {
    let short = class.rsplit('.').next().unwrap_or(class);
    if short.is_empty() {
        "View".to_string()
    } else {
        short.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DUMP: &str = r#"<?xml version='1.0' encoding='UTF-8' standalone='yes' ?>
<hierarchy rotation="0">
  <node index="0" text="" resource-id="" class="android.widget.FrameLayout" content-desc="" clickable="false" enabled="true" scrollable="false" bounds="[0,0][1080,2340]">
    <node index="0" text="Sign in" resource-id="com.app:id/login" class="android.widget.Button" content-desc="" clickable="true" enabled="true" scrollable="false" bounds="[100,900][980,1020]" />
    <node index="1" text="" resource-id="" class="android.widget.EditText" content-desc="" clickable="true" enabled="true" scrollable="false" bounds="[100,600][980,700]" />
    <node index="2" text="" resource-id="" class="android.widget.ImageView" content-desc="Settings" clickable="true" enabled="true" scrollable="false" bounds="[980,40][1060,120]" />
    <node index="3" text="" resource-id="" class="android.view.View" content-desc="" clickable="true" enabled="true" scrollable="false" bounds="[0,0][5,5]" />
    <node index="4" text="Item" resource-id="com.app:id/row" class="android.widget.TextView" content-desc="" clickable="false" enabled="true" scrollable="false" bounds="[0,1200][1080,1300]" />
    <node index="5" text="Item" resource-id="com.app:id/row" class="android.widget.TextView" content-desc="" clickable="false" enabled="true" scrollable="false" bounds="[0,1300][1080,1400]" />
  </node>
</hierarchy>"#;

    #[test]
    fn test_parse_keeps_identified_and_input_nodes() {
        let elements = parse_hierarchy(DUMP).unwrap();
        let ids: Vec<&str> = elements.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(
            ids,
            vec![
                "com.app:id/login",
                "EditText@540,650",
                "Settings",
                "com.app:id/row",
                "com.app:id/row#2"
            ]
        );
    }

    #[test]
    fn test_parse_element_fields() {
        let elements = parse_hierarchy(DUMP).unwrap();
        let login = &elements[0];
        assert_eq!(login.role, "Button");
        assert_eq!(login.label, "Sign in");
        assert_eq!(login.bounds, Bounds::new(100, 900, 980, 1020));
        assert!(login.interactive);
        assert_eq!(login.resource_id.as_deref(), Some("com.app:id/login"));

        let settings = &elements[2];
        assert_eq!(settings.label, "Settings");

        let row = &elements[3];
        assert!(!row.interactive);
    }

    #[test]
    fn test_parse_bounds() {
        assert_eq!(
            parse_bounds("[0,0][1080,2340]"),
            Some(Bounds::new(0, 0, 1080, 2340))
        );
        assert_eq!(parse_bounds("garbage"), None);
    }

    #[test]
    fn test_extract_xml_from_tty_dump() {
        let output = format!("{}UI hierchary dumped to: /dev/tty\n", DUMP);
        let xml = extract_xml(&output).unwrap();
        assert!(xml.starts_with("<?xml"));
        assert!(xml.ends_with("</hierarchy>"));
        assert!(extract_xml("ERROR: could not get idle state.").is_none());
    }

    #[test]
    fn test_invalid_xml_is_reported() {
        let result = parse_hierarchy("<hierarchy><node bounds=\"[0,0][1,1]\" text=\"a></hierarchy>");
        assert!(result.is_err());
    }

    #[test]
    fn test_anonymous_ids_survive_inserted_nodes() {
        let before = r#"<hierarchy>
  <node class="android.widget.ImageButton" clickable="true" bounds="[100,100][300,300]" />
  <node class="android.widget.ImageButton" clickable="true" bounds="[100,1500][300,1700]" />
</hierarchy>"#;
        let after = r#"<hierarchy>
  <node class="android.view.View" clickable="false" bounds="[0,0][1080,80]" />
  <node class="android.widget.ImageButton" clickable="true" bounds="[100,100][300,300]" />
  <node class="android.widget.ImageButton" clickable="true" bounds="[100,1500][300,1700]" />
</hierarchy>"#;
        let ids = |xml: &str| -> Vec<String> {
            parse_hierarchy(xml).unwrap().into_iter().map(|e| e.id).collect()
        };
        assert_eq!(ids(before), vec!["ImageButton@200,200", "ImageButton@200,1600"]);
        assert_eq!(ids(after), ids(before));
    }
}
