use serde::Serialize;

use crate::uix::parser::{UiNode, UiTree};

/// Container ids that appear on practically every screen. Useless as
/// scoping anchors.
const GENERIC_CONTAINER_IDS: [&str; 3] =
    ["android:id/content", "android:id/body", "id/container"];

/// Strategies in rank order. The discriminant order is the priority, so a
/// suggestion list built strategy-by-strategy comes out already ranked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub enum LocatorStrategy {
    Scoped,
    ContentDesc,
    DirectId,
    Text,
}

impl LocatorStrategy {
    pub fn label(&self) -> &'static str {
        match self {
            LocatorStrategy::Scoped => "Scoped (anchored)",
            LocatorStrategy::ContentDesc => "Content-Desc",
            LocatorStrategy::DirectId => "Direct ID",
            LocatorStrategy::Text => "Text Match",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LocatorSuggestion {
    pub strategy: LocatorStrategy,
    pub xpath: String,
}

/// Proposes automation selectors for one node, best first. Strategies are
/// independent; each applies whenever the node carries the attribute it
/// needs.
pub fn suggest_locators(tree: &UiTree, node_index: usize) -> Vec<LocatorSuggestion> {
    let Some(node) = tree.get(node_index) else {
        return Vec::new();
    };
    let mut suggestions = Vec::new();

    if let Some(scoped) = scoped_locator(tree, node) {
        suggestions.push(LocatorSuggestion {
            strategy: LocatorStrategy::Scoped,
            xpath: scoped,
        });
    }

    if !node.content_desc.is_empty() {
        suggestions.push(LocatorSuggestion {
            strategy: LocatorStrategy::ContentDesc,
            xpath: format!(
                "//*[@content-desc={}]",
                escape_xpath_literal(&node.content_desc)
            ),
        });
    }

    if !node.resource_id.is_empty() && !node.resource_id.contains("id/content") {
        suggestions.push(LocatorSuggestion {
            strategy: LocatorStrategy::DirectId,
            xpath: format!("//*[@resource-id='{}']", node.resource_id),
        });
    }

    if !node.text.is_empty() {
        suggestions.push(LocatorSuggestion {
            strategy: LocatorStrategy::Text,
            xpath: format!(
                "//{}[@text={}]",
                node.class_name,
                escape_xpath_literal(&node.text)
            ),
        });
    }

    suggestions
}

/// Walks ancestors for the nearest non-generic resource id and locates the
/// target relative to that anchor.
fn scoped_locator(tree: &UiTree, node: &UiNode) -> Option<String> {
    let anchor = tree.ancestors(node.index).find(|ancestor| {
        !ancestor.resource_id.is_empty()
            && !GENERIC_CONTAINER_IDS
                .iter()
                .any(|generic| ancestor.resource_id.contains(generic))
    })?;

    let target = if !node.text.is_empty() {
        format!(
            "//{}[@text={}]",
            node.class_name,
            escape_xpath_literal(&node.text)
        )
    } else if !node.content_desc.is_empty() {
        format!(
            "//*[@content-desc={}]",
            escape_xpath_literal(&node.content_desc)
        )
    } else if !node.resource_id.is_empty() {
        format!("//*[@resource-id='{}']", node.resource_id)
    } else {
        format!("//{}", node.class_name)
    };

    Some(format!(
        "//*[@resource-id='{}']{target}",
        anchor.resource_id
    ))
}

/// XPath has no escape for a quote inside a same-quoted literal; a text
/// containing a single quote switches to the concat() form.
pub fn escape_xpath_literal(text: &str) -> String {
    if !text.contains('\'') {
        return format!("'{text}'");
    }
    let parts: Vec<String> = text.split('\'').map(|part| format!("'{part}'")).collect();
    format!("concat({})", parts.join(", \"'\", "))
}
