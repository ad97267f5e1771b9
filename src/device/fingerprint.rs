//! UI-tree parsing, element scoring, and the composite screen hash (§4.6).
//!
//! The accessibility-tree parser and relevance scorer are a generalization
//! of the device's accessibility-tree sanitizer: reduce a raw UI-tree dump to
//! a ranked, capped list of elements worth showing the LLM, and reduce that
//! same tree (normalized) plus the activity identifier to a stable digest
//! used as screen identity.

use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use tracing::debug;

pub const DEFAULT_MAX_ELEMENTS: usize = 50;
const VISION_FALLBACK_THRESHOLD: usize = 5;

#[derive(Debug, Clone, Serialize)]
pub struct UiElement {
    pub index: usize,
    pub class: String,
    pub class_short: String,
    pub text: String,
    pub content_desc: String,
    pub resource_id: String,
    pub resource_id_short: String,
    pub package: String,
    pub clickable: bool,
    pub long_clickable: bool,
    pub focusable: bool,
    pub scrollable: bool,
    pub checkable: bool,
    pub checked: bool,
    pub enabled: bool,
    pub selected: bool,
    pub editable: bool,
    pub bounds: [i32; 4],
    pub center: (i32, i32),
    pub score: f32,
}

#[derive(Debug, Clone, Serialize)]
pub struct SanitizedScreen {
    pub elements: Vec<UiElement>,
    pub total_found: usize,
    pub foreground_package: Option<String>,
    pub needs_vision_fallback: bool,
    pub raw_count: usize,
    pub interactive_count: usize,
}

/// Reduce a raw `uiautomator dump` XML string to a ranked, capped element list.
pub fn parse_accessibility_xml(xml: &str, max_elements: usize) -> SanitizedScreen {
    let mut elements: Vec<UiElement> = Vec::new();
    let mut package_counts: HashMap<String, usize> = HashMap::new();
    let mut index: usize = 0;

    let mut pos = 0;
    let len = xml.len();

    while pos < len {
        match find_substr(xml, pos, "<node ") {
            Some(start) => {
                let tag_end = match find_substr(xml, start, ">") {
                    Some(e) => e,
                    None => break,
                };
                let tag = &xml[start..=tag_end];

                if let Some(elem) = parse_node_tag(tag, index) {
                    if !elem.package.is_empty() {
                        *package_counts.entry(elem.package.clone()).or_insert(0) += 1;
                    }
                    if is_useful_element(&elem) {
                        index += 1;
                        elements.push(elem);
                    }
                }
                pos = tag_end + 1;
            }
            None => break,
        }
    }

    let raw_count = elements.len();
    let interactive_count = elements
        .iter()
        .filter(|e| e.clickable || e.focusable || e.editable || e.long_clickable || e.scrollable)
        .count();

    for elem in &mut elements {
        elem.score = score_element(elem);
    }
    elements.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));

    let total_found = elements.len();
    let max = if max_elements == 0 { DEFAULT_MAX_ELEMENTS } else { max_elements };
    elements.truncate(max);

    for (i, elem) in elements.iter_mut().enumerate() {
        elem.index = i + 1;
    }

    let foreground_package = package_counts
        .into_iter()
        .max_by_key(|(_, count)| *count)
        .map(|(pkg, _)| pkg)
        .filter(|pkg| !pkg.is_empty());

    let needs_vision_fallback = interactive_count < VISION_FALLBACK_THRESHOLD;
    if needs_vision_fallback {
        debug!(
            "accessibility tree sparse: {} interactive elements (threshold {})",
            interactive_count, VISION_FALLBACK_THRESHOLD
        );
    }

    SanitizedScreen {
        elements,
        total_found,
        foreground_package,
        needs_vision_fallback,
        raw_count,
        interactive_count,
    }
}

fn score_element(elem: &UiElement) -> f32 {
    let mut score: f32 = 0.0;
    if elem.clickable {
        score += 10.0;
    }
    if elem.editable {
        score += 12.0;
    }
    if elem.long_clickable {
        score += 5.0;
    }
    if elem.focusable {
        score += 3.0;
    }
    if elem.scrollable {
        score += 4.0;
    }
    if elem.checkable {
        score += 6.0;
    }
    if !elem.text.is_empty() {
        score += 5.0;
        score += (elem.text.len().min(100) as f32) * 0.02;
    }
    if !elem.content_desc.is_empty() {
        score += 3.0;
    }
    if !elem.resource_id.is_empty() {
        score += 1.0;
    }

    let width = (elem.bounds[2] - elem.bounds[0]).max(0);
    let height = (elem.bounds[3] - elem.bounds[1]).max(0);
    let area = (width as f32) * (height as f32);
    if area > 100.0 {
        score += (area.ln() * 0.5).min(5.0);
    }
    if area < 10.0 {
        score -= 10.0;
    }
    if elem.bounds[0] < -10 || elem.bounds[1] < -10 {
        score -= 20.0;
    }

    let class_lower = elem.class_short.to_lowercase();
    if !elem.clickable
        && !elem.editable
        && matches!(
            class_lower.as_str(),
            "framelayout" | "linearlayout" | "relativelayout" | "constraintlayout" | "view"
        )
    {
        score -= 15.0;
    }
    match class_lower.as_str() {
        "button" | "imagebutton" => score += 3.0,
        "edittext" => score += 4.0,
        "checkbox" | "switch" | "radiobutton" | "togglebutton" => score += 3.0,
        "searchview" => score += 5.0,
        _ => {}
    }
    if !elem.enabled {
        score -= 5.0;
    }
    score
}

fn is_useful_element(elem: &UiElement) -> bool {
    if elem.clickable || elem.editable || elem.long_clickable || elem.scrollable || elem.checkable {
        return true;
    }
    if !elem.text.is_empty() || !elem.content_desc.is_empty() {
        let width = elem.bounds[2] - elem.bounds[0];
        let height = elem.bounds[3] - elem.bounds[1];
        if width > 0 && height > 0 {
            return true;
        }
    }
    false
}

fn parse_node_tag(tag: &str, index: usize) -> Option<UiElement> {
    let text = get_attr(tag, "text").unwrap_or_default();
    let content_desc = get_attr(tag, "content-desc").unwrap_or_default();
    let resource_id = get_attr(tag, "resource-id").unwrap_or_default();
    let class = get_attr(tag, "class").unwrap_or_default();
    let package = get_attr(tag, "package").unwrap_or_default();
    let bounds_str = get_attr(tag, "bounds").unwrap_or_default();
    let bounds = parse_bounds(&bounds_str)?;

    let cx = (bounds[0] + bounds[2]) / 2;
    let cy = (bounds[1] + bounds[3]) / 2;

    let clickable = get_bool_attr(tag, "clickable");
    let long_clickable = get_bool_attr(tag, "long-clickable");
    let focusable = get_bool_attr(tag, "focusable");
    let scrollable = get_bool_attr(tag, "scrollable");
    let checkable = get_bool_attr(tag, "checkable");
    let checked = get_bool_attr(tag, "checked");
    let enabled = get_bool_attr(tag, "enabled");
    let selected = get_bool_attr(tag, "selected");
    let password = get_bool_attr(tag, "password");

    let class_lower = class.to_lowercase();
    let editable = class_lower.contains("edittext")
        || class_lower.contains("searchview")
        || class_lower.contains("autocompletextview")
        || password;

    let class_short = class.rsplit('.').next().unwrap_or(&class).to_string();
    let resource_id_short = resource_id.rsplit('/').next().unwrap_or("").to_string();

    Some(UiElement {
        index,
        class,
        class_short,
        text,
        content_desc,
        resource_id,
        resource_id_short,
        package,
        clickable,
        long_clickable,
        focusable,
        scrollable,
        checkable,
        checked,
        enabled,
        selected,
        editable,
        bounds,
        center: (cx, cy),
        score: 0.0,
    })
}

fn parse_bounds(s: &str) -> Option<[i32; 4]> {
    let mut nums: Vec<i32> = Vec::with_capacity(4);
    let mut current = String::new();
    for ch in s.chars() {
        if ch.is_ascii_digit() || ch == '-' {
            current.push(ch);
        } else if !current.is_empty() {
            if let Ok(n) = current.parse::<i32>() {
                nums.push(n);
            }
            current.clear();
        }
    }
    if !current.is_empty() {
        if let Ok(n) = current.parse::<i32>() {
            nums.push(n);
        }
    }
    if nums.len() >= 4 {
        Some([nums[0], nums[1], nums[2], nums[3]])
    } else {
        None
    }
}

fn get_attr(tag: &str, name: &str) -> Option<String> {
    let pattern = format!("{}=\"", name);
    let start = tag.find(&pattern)? + pattern.len();
    let end = tag[start..].find('"')? + start;
    let raw = &tag[start..end];
    Some(
        raw.replace("&amp;", "&")
            .replace("&lt;", "<")
            .replace("&gt;", ">")
            .replace("&quot;", "\"")
            .replace("&apos;", "'")
            .replace("&#10;", "\n")
            .replace("&#13;", "\r"),
    )
}

fn get_bool_attr(tag: &str, name: &str) -> bool {
    get_attr(tag, name).map(|v| v == "true").unwrap_or(false)
}

fn find_substr(haystack: &str, from: usize, needle: &str) -> Option<usize> {
    if from >= haystack.len() {
        return None;
    }
    haystack[from..].find(needle).map(|i| i + from)
}

/// Computes the composite hash of §4.6: a stable digest over a normalized
/// UI tree (stable element order, ephemeral attributes stripped) plus the
/// activity identifier. Collisions are treated as identity — same screen.
pub fn composite_hash(elements: &[UiElement], activity: &str) -> String {
    let mut normalized = String::with_capacity(elements.len() * 32);
    normalized.push_str(activity);
    normalized.push('\n');
    // Stable order: elements are already deterministically ordered by the
    // parser (document order before scoring reorders the *view*, so hash
    // over resource id + class + rough position, not the LLM-facing score
    // order, which is allowed to vary run to run).
    let mut keys: Vec<String> = elements
        .iter()
        .map(|e| {
            format!(
                "{}|{}|{}|{}x{}",
                e.class_short,
                e.resource_id_short,
                e.content_desc,
                e.bounds[0] / 10,
                e.bounds[1] / 10
            )
        })
        .collect();
    keys.sort();
    for k in keys {
        normalized.push_str(&k);
        normalized.push('\n');
    }
    let mut hasher = Sha256::new();
    hasher.update(normalized.as_bytes());
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE_XML: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<hierarchy rotation="0">
  <node index="0" text="" resource-id="" class="android.widget.FrameLayout" package="com.example" content-desc="" checkable="false" checked="false" clickable="false" enabled="true" focusable="false" focused="false" scrollable="false" long-clickable="false" password="false" selected="false" bounds="[0,0][1080,2400]">
    <node index="0" text="Login" resource-id="com.example:id/login_btn" class="android.widget.Button" package="com.example" content-desc="" checkable="false" checked="false" clickable="true" enabled="true" focusable="true" focused="false" scrollable="false" long-clickable="false" password="false" selected="false" bounds="[400,2000][680,2100]">
    </node>
  </node>
</hierarchy>"#;

    #[test]
    fn parse_extracts_foreground_package() {
        let r = parse_accessibility_xml(SAMPLE_XML, 50);
        assert_eq!(r.foreground_package.as_deref(), Some("com.example"));
        assert_eq!(r.raw_count, 1);
    }

    #[test]
    fn empty_tree_needs_vision_fallback() {
        let r = parse_accessibility_xml("", 50);
        assert!(r.needs_vision_fallback);
        assert_eq!(r.interactive_count, 0);
    }

    #[test]
    fn composite_hash_is_stable_across_identical_trees() {
        let r1 = parse_accessibility_xml(SAMPLE_XML, 50);
        let r2 = parse_accessibility_xml(SAMPLE_XML, 50);
        assert_eq!(
            composite_hash(&r1.elements, "MainActivity"),
            composite_hash(&r2.elements, "MainActivity")
        );
    }

    #[test]
    fn composite_hash_changes_with_activity() {
        let r = parse_accessibility_xml(SAMPLE_XML, 50);
        let h1 = composite_hash(&r.elements, "MainActivity");
        let h2 = composite_hash(&r.elements, "SettingsActivity");
        assert_ne!(h1, h2);
    }

    #[test]
    fn scoring_ranks_clickable_above_plain_text() {
        let button = UiElement {
            index: 0,
            class: "android.widget.Button".into(),
            class_short: "Button".into(),
            text: "OK".into(),
            content_desc: String::new(),
            resource_id: String::new(),
            resource_id_short: String::new(),
            package: String::new(),
            clickable: true,
            long_clickable: false,
            focusable: true,
            scrollable: false,
            checkable: false,
            checked: false,
            enabled: true,
            selected: false,
            editable: false,
            bounds: [400, 1000, 680, 1080],
            center: (540, 1040),
            score: 0.0,
        };
        let textview = UiElement {
            clickable: false,
            focusable: false,
            class_short: "TextView".into(),
            class: "android.widget.TextView".into(),
            ..button.clone()
        };
        assert!(score_element(&button) > score_element(&textview));
    }
}
