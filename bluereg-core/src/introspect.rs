/*!
 * Introspection Scanner
 * Immediate child node names of a bus object, best effort
 */

use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use std::collections::BTreeSet;
use tracing::{debug, warn};

use crate::bus::Bus;

/// Child node names directly below `path`. A failed introspection is
/// logged and yields an empty set; callers rescan when they need fresh data.
pub async fn find_child_nodes(bus: &dyn Bus, path: &str) -> BTreeSet<String> {
    match bus.introspect(path).await {
        Ok(xml) => parse_child_nodes(&xml),
        Err(err) => {
            warn!("Introspection of {} failed: {}", path, err);
            BTreeSet::new()
        }
    }
}

/// Names of the `<node>` elements one level below the document's root node.
/// Malformed input ends the walk; whatever was collected so far is kept.
pub fn parse_child_nodes(xml: &str) -> BTreeSet<String> {
    let mut reader = Reader::from_str(xml);
    let mut children = BTreeSet::new();
    let mut depth = 0usize;

    loop {
        match reader.read_event() {
            Ok(Event::Start(element)) => {
                if depth == 1 {
                    children.extend(node_name(&element));
                }
                depth += 1;
            }
            Ok(Event::Empty(element)) if depth == 1 => children.extend(node_name(&element)),
            Ok(Event::End(_)) => depth = depth.saturating_sub(1),
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(err) => {
                debug!(
                    "Introspection data malformed at byte {}: {}",
                    reader.buffer_position(),
                    err
                );
                break;
            }
        }
    }

    children
}

fn node_name(element: &BytesStart<'_>) -> Option<String> {
    if element.name().as_ref() != b"node" {
        return None;
    }
    let name = element.try_get_attribute("name").ok()??;
    let name = name.unescape_value().ok()?;
    (!name.is_empty()).then(|| name.into_owned())
}
