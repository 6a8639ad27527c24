use std::sync::OnceLock;

use regex::Regex;

/// Rectangle in dump-space. Only nodes whose reported bounds enclose a
/// positive area get one; everything else keeps `None` and stays out of
/// hit-testing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Bounds {
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
}

impl Bounds {
    pub fn contains(&self, x: i32, y: i32) -> bool {
        x >= self.x && y >= self.y && x < self.x + self.width && y < self.y + self.height
    }

    pub fn area(&self) -> i64 {
        self.width as i64 * self.height as i64
    }
}

#[derive(Debug, Clone, Default)]
pub struct UiNode {
    pub index: usize,
    pub parent: Option<usize>,
    pub children: Vec<usize>,
    pub class_name: String,
    pub resource_id: String,
    pub text: String,
    pub content_desc: String,
    pub package: String,
    pub bounds_raw: String,
    pub rect: Option<Bounds>,
    /// Position among siblings as reported by the dump itself.
    pub child_index: u32,
    pub clickable: bool,
    pub checkable: bool,
    pub checked: bool,
    pub enabled: bool,
    pub focusable: bool,
    pub focused: bool,
    pub scrollable: bool,
    pub long_clickable: bool,
    pub password: bool,
    pub selected: bool,
    /// Flagged `NAF="true"` by the dump, or forced for bare layout wrappers.
    pub naf: bool,
}

impl UiNode {
    pub fn has_valid_bounds(&self) -> bool {
        self.rect.is_some()
    }

    /// Layout containers carry no text, no id and no description. They shape
    /// the tree but make poor locator anchors.
    pub fn is_structural(&self) -> bool {
        self.text.is_empty() && self.resource_id.is_empty() && self.content_desc.is_empty()
    }

    /// Identity that survives tree rebuilds: hashes the attributes that stay
    /// put across dumps of the same screen, so a consumer can re-find its
    /// selection after a fresh dump replaces the arena.
    pub fn fingerprint(&self) -> u64 {
        use std::hash::{Hash, Hasher};
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        self.class_name.hash(&mut hasher);
        self.resource_id.hash(&mut hasher);
        self.text.hash(&mut hasher);
        self.content_desc.hash(&mut hasher);
        self.child_index.hash(&mut hasher);
        self.bounds_raw.hash(&mut hasher);
        hasher.finish()
    }
}

/// Immutable snapshot of one hierarchy dump. Nodes live in a flat arena and
/// reference each other by index, so a whole tree can be shared across
/// threads behind an `Arc` without interior pointers.
#[derive(Debug, Clone, Default)]
pub struct UiTree {
    nodes: Vec<UiNode>,
    root: Option<usize>,
    /// At least one node parsed, none with usable bounds. Flags the snapshot
    /// as partial; hit-testing over it is pointless.
    pub zero_bounds: bool,
    pub source_hash: u64,
    pub xml: String,
}

impl UiTree {
    pub fn root(&self) -> Option<&UiNode> {
        self.root.and_then(|index| self.nodes.get(index))
    }

    pub fn root_index(&self) -> Option<usize> {
        self.root
    }

    pub fn get(&self, index: usize) -> Option<&UiNode> {
        self.nodes.get(index)
    }

    pub fn nodes(&self) -> &[UiNode] {
        &self.nodes
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Walks parent links from (and excluding) the given node up to the root.
    pub fn ancestors(&self, index: usize) -> impl Iterator<Item = &UiNode> + '_ {
        let mut current = self.nodes.get(index).and_then(|node| node.parent);
        std::iter::from_fn(move || {
            let node = self.nodes.get(current?)?;
            current = node.parent;
            Some(node)
        })
    }
}

/// `bounds="[x1,y1][x2,y2]"` into a rectangle. Anything that is not two
/// bracketed pairs, or encloses no area, yields `None`.
pub fn parse_bounds(raw: &str) -> Option<Bounds> {
    static BOUNDS_RE: OnceLock<Regex> = OnceLock::new();
    let re = BOUNDS_RE
        .get_or_init(|| Regex::new(r"\[(-?\d+),(-?\d+)\]\[(-?\d+),(-?\d+)\]").expect("literal"));
    let caps = re.captures(raw)?;
    let x1: i32 = caps[1].parse().ok()?;
    let y1: i32 = caps[2].parse().ok()?;
    let x2: i32 = caps[3].parse().ok()?;
    let y2: i32 = caps[4].parse().ok()?;
    let width = x2.checked_sub(x1)?;
    let height = y2.checked_sub(y1)?;
    if width > 0 && height > 0 {
        Some(Bounds {
            x: x1,
            y: y1,
            width,
            height,
        })
    } else {
        None
    }
}

/// Parses one UIX dump into a tree. Never fails: device-side noise before
/// the first tag, a missing wrapper element, truncated attributes and broken
/// entities all degrade to whatever subtree can be salvaged. An empty tree
/// with `zero_bounds=true` means nothing at all was recoverable.
pub fn parse_uix(raw: &str) -> UiTree {
    let Some(xml) = sanitize_dump(raw) else {
        return UiTree {
            zero_bounds: true,
            ..UiTree::default()
        };
    };

    let mut tree = UiTree {
        source_hash: content_hash::hash64(&xml),
        ..UiTree::default()
    };

    let bytes = xml.as_bytes();
    let mut index: usize = 0;
    // One frame per open element; `node` is None for wrapper tags so child
    // links skip straight to the nearest real node.
    let mut stack: Vec<Option<usize>> = Vec::new();

    while index < bytes.len() {
        if bytes[index] != b'<' {
            index += 1;
            continue;
        }
        if index + 1 >= bytes.len() {
            break;
        }
        match bytes[index + 1] {
            b'/' => {
                index += 2;
                while index < bytes.len() && bytes[index] != b'>' {
                    index += 1;
                }
                if index < bytes.len() {
                    index += 1;
                }
                stack.pop();
            }
            b'!' => {
                index += 2;
                while index + 2 < bytes.len()
                    && !(bytes[index] == b'-'
                        && bytes[index + 1] == b'-'
                        && bytes[index + 2] == b'>')
                {
                    index += 1;
                }
                index = (index + 3).min(bytes.len());
            }
            b'?' => {
                index += 2;
                while index + 1 < bytes.len()
                    && !(bytes[index] == b'?' && bytes[index + 1] == b'>')
                {
                    index += 1;
                }
                index = (index + 2).min(bytes.len());
            }
            _ => {
                let start = index + 1;
                let mut cursor = start;
                while cursor < bytes.len() {
                    let ch = bytes[cursor];
                    if ch == b'/' || ch == b'>' || ch.is_ascii_whitespace() {
                        break;
                    }
                    cursor += 1;
                }
                let tag_name = &xml[start..cursor];
                let (attrs, self_closing, after) = collect_attrs(&xml, bytes, cursor);
                index = after;

                if tag_name == "node" {
                    let parent = stack.iter().rev().find_map(|frame| *frame);
                    let node_index = tree.nodes.len();
                    let node = build_node(node_index, parent, &attrs);
                    tree.nodes.push(node);
                    if let Some(parent_index) = parent {
                        tree.nodes[parent_index].children.push(node_index);
                    } else if tree.root.is_none() {
                        tree.root = Some(node_index);
                    }
                    if !self_closing {
                        stack.push(Some(node_index));
                    }
                } else if !self_closing {
                    stack.push(None);
                }
            }
        }
    }

    tree.zero_bounds = !tree.nodes.iter().any(UiNode::has_valid_bounds);
    tree.xml = xml;
    tree
}

/// Attribute scan from just after the tag name. Malformed attributes end the
/// scan and skip to the tag close, keeping whatever parsed cleanly.
fn collect_attrs(
    xml: &str,
    bytes: &[u8],
    from: usize,
) -> (Vec<(String, String)>, bool, usize) {
    let mut attrs: Vec<(String, String)> = Vec::new();
    let mut self_closing = false;
    let mut cursor = from;
    loop {
        while cursor < bytes.len() && bytes[cursor].is_ascii_whitespace() {
            cursor += 1;
        }
        if cursor >= bytes.len() {
            break;
        }
        let ch = bytes[cursor];
        if ch == b'>' {
            cursor += 1;
            break;
        }
        if ch == b'/' {
            self_closing = true;
            cursor += 1;
            if cursor < bytes.len() && bytes[cursor] == b'>' {
                cursor += 1;
            }
            break;
        }

        let name_start = cursor;
        while cursor < bytes.len()
            && bytes[cursor] != b'='
            && bytes[cursor] != b'>'
            && !bytes[cursor].is_ascii_whitespace()
        {
            cursor += 1;
        }
        let name_end = cursor;
        while cursor < bytes.len() && bytes[cursor].is_ascii_whitespace() {
            cursor += 1;
        }
        if cursor >= bytes.len() || bytes[cursor] != b'=' {
            // Valueless or truncated attribute. Salvage the tag.
            while cursor < bytes.len() && bytes[cursor] != b'>' {
                cursor += 1;
            }
            if cursor < bytes.len() {
                cursor += 1;
            }
            break;
        }
        cursor += 1;
        while cursor < bytes.len() && bytes[cursor].is_ascii_whitespace() {
            cursor += 1;
        }
        if cursor >= bytes.len() {
            break;
        }
        let quote = bytes[cursor];
        if quote != b'"' && quote != b'\'' {
            while cursor < bytes.len() && bytes[cursor] != b'>' {
                cursor += 1;
            }
            if cursor < bytes.len() {
                cursor += 1;
            }
            break;
        }
        cursor += 1;
        let value_start = cursor;
        while cursor < bytes.len() && bytes[cursor] != quote {
            cursor += 1;
        }
        if cursor >= bytes.len() {
            break;
        }
        let value_end = cursor;
        cursor += 1;
        attrs.push((
            xml[name_start..name_end].to_string(),
            unescape_xml(&xml[value_start..value_end]),
        ));
    }
    (attrs, self_closing, cursor)
}

fn build_node(index: usize, parent: Option<usize>, attrs: &[(String, String)]) -> UiNode {
    let get = |name: &str| -> String {
        attrs
            .iter()
            .find(|(attr, _)| attr == name)
            .map(|(_, value)| value.clone())
            .unwrap_or_default()
    };
    let flag = |name: &str| -> bool {
        attrs
            .iter()
            .find(|(attr, _)| attr == name)
            .map(|(_, value)| value == "true")
            .unwrap_or(false)
    };
    let bounds_raw = get("bounds");
    let mut node = UiNode {
        index,
        parent,
        children: Vec::new(),
        class_name: get("class"),
        resource_id: get("resource-id"),
        text: get("text"),
        content_desc: get("content-desc"),
        package: get("package"),
        rect: parse_bounds(&bounds_raw),
        bounds_raw,
        child_index: get("index").parse().unwrap_or(0),
        clickable: flag("clickable"),
        checkable: flag("checkable"),
        checked: flag("checked"),
        enabled: flag("enabled"),
        focusable: flag("focusable"),
        focused: flag("focused"),
        scrollable: flag("scrollable"),
        long_clickable: flag("long-clickable"),
        password: flag("password"),
        selected: flag("selected"),
        naf: flag("NAF"),
    };
    if node.is_structural() {
        node.naf = true;
    }
    node
}

/// Dump output arrives with shell noise, stray declarations and sometimes no
/// wrapper element at all. Trims to the first tag, drops the XML declaration,
/// prefers a complete wrapper block when one exists and synthesizes one
/// around a bare root node.
fn sanitize_dump(raw: &str) -> Option<String> {
    let start = raw.find('<')?;
    let mut trimmed = raw[start..].trim().to_string();
    if trimmed.starts_with("<?") {
        if let Some(end) = trimmed.find("?>") {
            trimmed = trimmed[end + 2..].trim_start().to_string();
        }
    }
    if trimmed.is_empty() {
        return None;
    }
    if let (Some(open), Some(close)) = (trimmed.find("<hierarchy"), trimmed.rfind("</hierarchy>")) {
        if close > open {
            return Some(trimmed[open..close + "</hierarchy>".len()].to_string());
        }
    }
    if trimmed.starts_with("<node") {
        return Some(format!("<hierarchy>{trimmed}</hierarchy>"));
    }
    Some(trimmed)
}

fn unescape_xml(value: &str) -> String {
    if !value.contains('&') {
        return value.to_string();
    }
    let mut out = String::with_capacity(value.len());
    let mut rest = value;
    while let Some(pos) = rest.find('&') {
        out.push_str(&rest[..pos]);
        rest = &rest[pos..];
        let Some(semi) = rest.find(';') else {
            out.push('&');
            rest = &rest[1..];
            continue;
        };
        let entity = &rest[1..semi];
        let replacement = match entity {
            "amp" => Some('&'),
            "lt" => Some('<'),
            "gt" => Some('>'),
            "quot" => Some('"'),
            "apos" => Some('\''),
            _ if entity.starts_with("#x") || entity.starts_with("#X") => {
                u32::from_str_radix(&entity[2..], 16)
                    .ok()
                    .and_then(char::from_u32)
            }
            _ if entity.starts_with('#') => {
                entity[1..].parse::<u32>().ok().and_then(char::from_u32)
            }
            _ => None,
        };
        match replacement {
            Some(ch) => {
                out.push(ch);
                rest = &rest[semi + 1..];
            }
            None => {
                out.push('&');
                rest = &rest[1..];
            }
        }
    }
    out.push_str(rest);
    out
}

pub mod content_hash {
    pub fn hash64(input: &str) -> u64 {
        use std::hash::{Hash, Hasher};
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        input.hash(&mut hasher);
        hasher.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_single_button_dump() {
        let xml = "<hierarchy><node class=\"android.widget.Button\" resource-id=\"app:id/ok\" bounds=\"[10,20][110,70]\"/></hierarchy>";
        let tree = parse_uix(xml);
        assert_eq!(tree.len(), 1);
        assert!(!tree.zero_bounds);
        let root = tree.root().expect("root");
        assert_eq!(root.class_name, "android.widget.Button");
        assert_eq!(root.resource_id, "app:id/ok");
        assert_eq!(
            root.rect,
            Some(Bounds {
                x: 10,
                y: 20,
                width: 100,
                height: 50
            })
        );
    }

    #[test]
    fn wrapper_element_stays_out_of_the_tree() {
        let xml = "<?xml version='1.0' encoding='UTF-8' standalone='yes' ?>\n<hierarchy rotation=\"0\"><node index=\"0\" class=\"android.widget.FrameLayout\" bounds=\"[0,0][100,100]\"><node index=\"0\" class=\"android.widget.TextView\" text=\"Hi\" bounds=\"[0,0][50,30]\"/></node></hierarchy>";
        let tree = parse_uix(xml);
        assert_eq!(tree.len(), 2);
        let root = tree.root().expect("root");
        assert_eq!(root.class_name, "android.widget.FrameLayout");
        assert_eq!(
            root.rect,
            Some(Bounds {
                x: 0,
                y: 0,
                width: 100,
                height: 100
            })
        );
        assert_eq!(root.children.len(), 1);
        let child = tree.get(root.children[0]).expect("child");
        assert_eq!(child.text, "Hi");
        assert_eq!(child.parent, Some(root.index));
    }

    #[test]
    fn leading_noise_and_bare_root_are_recovered() {
        let raw = "ERROR: could not get idle state\n<node class=\"android.view.View\" bounds=\"[0,0][10,10]\"/>";
        let tree = parse_uix(raw);
        assert_eq!(tree.len(), 1);
        assert!(!tree.zero_bounds);
    }

    #[test]
    fn all_invalid_bounds_raise_the_flag_but_keep_nodes() {
        let xml = "<hierarchy><node class=\"a.A\" bounds=\"[0,0][0,0]\"><node class=\"a.B\" bounds=\"[50,50][10,10]\"/></node></hierarchy>";
        let tree = parse_uix(xml);
        assert_eq!(tree.len(), 2);
        assert!(tree.zero_bounds);
        assert!(tree.nodes().iter().all(|node| node.rect.is_none()));
    }

    #[test]
    fn unrecoverable_input_yields_empty_tree() {
        let tree = parse_uix("no xml in here at all");
        assert!(tree.is_empty());
        assert!(tree.root().is_none());
        assert!(tree.zero_bounds);
    }

    #[test]
    fn entities_and_utf8_survive() {
        let xml = "<hierarchy><node text=\"Men&#xFC; &amp; more\" content-desc=\"a &lt; b\" bounds=\"[0,0][10,10]\"/></hierarchy>";
        let tree = parse_uix(xml);
        let root = tree.root().expect("root");
        assert_eq!(root.text, "Menü & more");
        assert_eq!(root.content_desc, "a < b");
    }

    #[test]
    fn capability_flags_parse_from_literals() {
        let xml = "<hierarchy><node index=\"2\" clickable=\"true\" enabled=\"true\" checked=\"false\" long-clickable=\"true\" password=\"true\" bounds=\"[0,0][5,5]\"/></hierarchy>";
        let tree = parse_uix(xml);
        let root = tree.root().expect("root");
        assert!(root.clickable);
        assert!(root.enabled);
        assert!(!root.checked);
        assert!(root.long_clickable);
        assert!(root.password);
        assert_eq!(root.child_index, 2);
    }

    #[test]
    fn truncated_attribute_salvages_the_rest() {
        let xml = "<hierarchy><node class=\"a.A\" bounds=\"[0,0][20,20]\"/><node class=\"a.B\" bounds=\"[0,0][30,30";
        let tree = parse_uix(xml);
        assert!(tree.len() >= 1);
        assert!(!tree.zero_bounds);
    }

    #[test]
    fn bounds_parsing_handles_negatives_and_rejects_empty_rects() {
        let rect = parse_bounds("[-100,-50][100,50]").expect("valid");
        assert_eq!((rect.x, rect.y, rect.width, rect.height), (-100, -50, 200, 100));
        assert!(parse_bounds("[10,10][10,40]").is_none());
        assert!(parse_bounds("[10,10][5,5]").is_none());
        assert!(parse_bounds("not bounds").is_none());
    }

    #[test]
    fn ancestor_walk_reaches_the_root() {
        let xml = "<hierarchy><node resource-id=\"id/a\" bounds=\"[0,0][90,90]\"><node bounds=\"[0,0][80,80]\"><node resource-id=\"id/c\" bounds=\"[0,0][70,70]\"/></node></node></hierarchy>";
        let tree = parse_uix(xml);
        let leaf = tree
            .nodes()
            .iter()
            .find(|node| node.resource_id == "id/c")
            .expect("leaf");
        let chain: Vec<&str> = tree
            .ancestors(leaf.index)
            .map(|node| node.resource_id.as_str())
            .collect();
        assert_eq!(chain, vec!["", "id/a"]);
    }

    #[test]
    fn structural_wrappers_are_flagged() {
        let xml = "<hierarchy><node class=\"android.widget.FrameLayout\" bounds=\"[0,0][10,10]\"><node text=\"Go\" bounds=\"[0,0][5,5]\"/></node></hierarchy>";
        let tree = parse_uix(xml);
        let root = tree.root().expect("root");
        assert!(root.is_structural());
        assert!(!tree.get(root.children[0]).expect("child").is_structural());
    }

    #[test]
    fn naf_comes_from_the_attribute_or_the_wrapper_rule() {
        let xml = "<hierarchy><node NAF=\"true\" text=\"Go\" bounds=\"[0,0][10,10]\"><node class=\"android.widget.FrameLayout\" bounds=\"[0,0][5,5]\"/><node text=\"Stay\" bounds=\"[0,0][4,4]\"/></node></hierarchy>";
        let tree = parse_uix(xml);
        let root = tree.root().expect("root");
        assert!(root.naf);
        assert!(tree.get(root.children[0]).expect("wrapper").naf);
        assert!(!tree.get(root.children[1]).expect("labelled").naf);
    }

    #[test]
    fn fingerprints_survive_a_rebuild_and_track_content() {
        let xml = "<hierarchy><node index=\"0\" class=\"a.A\" text=\"Go\" bounds=\"[0,0][10,10]\"/></hierarchy>";
        let first = parse_uix(xml).root().expect("root").fingerprint();
        let second = parse_uix(xml).root().expect("root").fingerprint();
        assert_eq!(first, second);
        let changed = "<hierarchy><node index=\"0\" class=\"a.A\" text=\"Stop\" bounds=\"[0,0][10,10]\"/></hierarchy>";
        assert_ne!(first, parse_uix(changed).root().expect("root").fingerprint());
    }

    #[test]
    fn identical_dumps_hash_identically() {
        let xml = "<hierarchy><node bounds=\"[0,0][10,10]\"/></hierarchy>";
        let noisy = format!("garbage before\n{xml}");
        assert_eq!(parse_uix(xml).source_hash, parse_uix(&noisy).source_hash);
        let other = "<hierarchy><node bounds=\"[0,0][20,20]\"/></hierarchy>";
        assert_ne!(parse_uix(xml).source_hash, parse_uix(other).source_hash);
    }
}
