//! Upstream events -> downstream text lines.
//!
//! State objects are flattened recursively into one [`WireMessage`] per emitted field. Mapping
//! keys are visited in payload order, every key passes through the session's attribute filter,
//! and each mapping level also yields a merged `key:value` summary line.

use crate::model::{FeedEvent, ServiceCallEvent, StateEvent, WireMessage};
use crate::session::{AttributeFilter, SessionState, SubstitutionMap};
use serde_json::{Map, Value};

pub const MAX_FLATTEN_DEPTH: usize = 16;

const STATE_ATTR: &str = "state";
const ATTRIBUTES_ATTR: &str = "attributes";
const BRIGHTNESS_ATTR: &str = "brightness";
const LEGACY_MIN_BRIGHTNESS: &str = "3";

/// Renders one fan-out event into the lines a session should receive.
pub fn render_event(event: &FeedEvent, state: &SessionState) -> Vec<String> {
    match event {
        FeedEvent::Connected { at } => vec![format!("hass_websocket_connected,{at}\n")],
        FeedEvent::State(event) => flatten_state(event, &state.filter, &state.substitutions)
            .iter()
            .map(WireMessage::to_line)
            .collect(),
        FeedEvent::ServiceCall(call) => service_call_lines(call),
    }
}

pub fn flatten_state(
    event: &StateEvent,
    filter: &AttributeFilter,
    substitutions: &SubstitutionMap,
) -> Vec<WireMessage> {
    let mut flattener = Flattener {
        entity_id: &event.entity_id,
        substitute_id: substitutions
            .alias_for(&event.entity_id)
            .unwrap_or_default()
            .to_string(),
        filter,
        out: Vec::new(),
    };

    if let Some(state) = event.state.as_ref().filter(|v| !v.is_null()) {
        if filter.allows(STATE_ATTR) {
            flattener.emit(&[], STATE_ATTR, legacy_value(STATE_ATTR, state));
        }
    }

    match &event.attributes {
        Some(Value::Object(attributes)) => {
            flattener.flatten_map(&event.entity_id, attributes, &[], 0);
        }
        Some(Value::Array(items)) if filter.allows(ATTRIBUTES_ATTR) => {
            flattener.emit(&[], ATTRIBUTES_ATTR, join_sequence(items));
        }
        Some(Value::Null) | None => {}
        Some(scalar) if filter.allows(ATTRIBUTES_ATTR) => {
            flattener.emit(&[], ATTRIBUTES_ATTR, render_value(scalar));
        }
        Some(_) => {}
    }

    flattener.out
}

pub fn service_call_lines(call: &ServiceCallEvent) -> Vec<String> {
    call.entities
        .iter()
        .map(|entity| {
            format!(
                "type:call_service,entity:{},service:{},domain:{}\n",
                entity, call.service, call.domain
            )
        })
        .collect()
}

struct Flattener<'a> {
    entity_id: &'a str,
    substitute_id: String,
    filter: &'a AttributeFilter,
    out: Vec<WireMessage>,
}

impl Flattener<'_> {
    fn emit(&mut self, parents: &[String], attr_name: &str, value: String) {
        self.out.push(WireMessage {
            entity_id: self.entity_id.to_string(),
            substitute_id: self.substitute_id.clone(),
            parent_keys: parents.to_vec(),
            attr_name: attr_name.to_string(),
            attr_value: single_line(value),
        });
    }

    fn flatten_map(
        &mut self,
        parent_key: &str,
        map: &Map<String, Value>,
        parents: &[String],
        depth: usize,
    ) {
        if depth > MAX_FLATTEN_DEPTH {
            tracing::warn!(
                entity_id = %self.entity_id,
                depth,
                "attribute nesting exceeds limit; deeper levels dropped"
            );
            return;
        }

        let mut merged = Vec::with_capacity(map.len());
        for (key, value) in map {
            merged.push(format!("{key}:{}", render_value(value)));
            if !self.filter.allows(key) {
                continue;
            }
            match value {
                Value::Object(nested) => {
                    self.flatten_map(parent_key, nested, &extend(parents, key), depth + 1);
                }
                Value::Array(items) if items.first().is_some_and(Value::is_object) => {
                    for (index, item) in items.iter().enumerate() {
                        let Value::Object(nested) = item else {
                            tracing::debug!(
                                entity_id = %self.entity_id,
                                key = %key,
                                index,
                                "skipping non-mapping element in mapping sequence"
                            );
                            continue;
                        };
                        let element_key = format!("{}_{index}", self.entity_id);
                        let index_key = index.to_string();
                        self.flatten_map(
                            &element_key,
                            nested,
                            &extend(parents, &index_key),
                            depth + 1,
                        );
                    }
                }
                Value::Array(items) => self.emit(parents, key, join_sequence(items)),
                Value::Null => {}
                scalar => self.emit(parents, key, legacy_value(key, scalar)),
            }
        }

        if self.filter.allows(ATTRIBUTES_ATTR) {
            self.emit(
                &extend(parents, ATTRIBUTES_ATTR),
                parent_key,
                merged.join(","),
            );
        }
    }
}

fn extend(parents: &[String], key: &str) -> Vec<String> {
    let mut chain = Vec::with_capacity(parents.len() + 1);
    chain.extend_from_slice(parents);
    chain.push(key.to_string());
    chain
}

/// Older controllers treat brightness 1 and 2 as off, so they are raised to 3.
fn legacy_value(attr_name: &str, value: &Value) -> String {
    if attr_name == BRIGHTNESS_ATTR {
        if let Some(n) = value.as_f64() {
            if n == 1.0 || n == 2.0 {
                return LEGACY_MIN_BRIGHTNESS.to_string();
            }
        }
    }
    render_value(value)
}

fn join_sequence(items: &[Value]) -> String {
    items.iter().map(render_value).collect::<Vec<_>>().join(",")
}

fn render_value(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        nested => nested.to_string(),
    }
}

// A raw newline would split one message into two downstream lines.
fn single_line(value: String) -> String {
    if value.contains(['\r', '\n']) {
        value.replace(['\r', '\n'], " ")
    } else {
        value
    }
}
