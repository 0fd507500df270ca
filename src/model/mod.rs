use serde_json::{Map, Value};
use std::fmt;

/// A `state_changed` payload reduced to the parts the bridge flattens.
#[derive(Debug, Clone, PartialEq)]
pub struct StateEvent {
    pub entity_id: String,
    pub state: Option<Value>,
    pub attributes: Option<Value>,
}

impl StateEvent {
    /// Builds an event from a feed state object (`{"entity_id", "state", "attributes"}`).
    pub fn from_state_object(object: &Value) -> Option<Self> {
        let entity_id = object.get("entity_id")?.as_str()?.to_string();
        Some(Self {
            entity_id,
            state: object.get("state").filter(|v| !v.is_null()).cloned(),
            attributes: object.get("attributes").filter(|v| !v.is_null()).cloned(),
        })
    }

    /// Builds an event from the compressed form used by entity subscriptions (`{"s", "a"}`).
    pub fn from_compressed(entity_id: &str, object: &Value) -> Self {
        Self {
            entity_id: entity_id.to_string(),
            state: object.get("s").filter(|v| !v.is_null()).cloned(),
            attributes: object.get("a").filter(|v| !v.is_null()).cloned(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ServiceCallEvent {
    pub domain: String,
    pub service: String,
    pub entities: Vec<String>,
}

impl ServiceCallEvent {
    /// Builds a service-call event from the `data` object of a `call_service` event.
    /// Returns `None` when no target entity can be found.
    pub fn from_event_data(data: &Value) -> Option<Self> {
        let mut entities = entity_list(data.get("service_data").and_then(|d| d.get("entity_id")));
        if entities.is_empty() {
            entities = entity_list(data.get("target").and_then(|t| t.get("entity_id")));
        }
        if entities.is_empty() {
            return None;
        }

        Some(Self {
            domain: data.get("domain").and_then(Value::as_str).unwrap_or_default().to_string(),
            service: data.get("service").and_then(Value::as_str).unwrap_or_default().to_string(),
            entities,
        })
    }
}

fn entity_list(value: Option<&Value>) -> Vec<String> {
    match value {
        Some(Value::String(s)) => vec![s.clone()],
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_string)
            .collect(),
        _ => Vec::new(),
    }
}

/// Everything the upstream link fans out to attached sessions.
#[derive(Debug, Clone, PartialEq)]
pub enum FeedEvent {
    Connected { at: String },
    State(StateEvent),
    ServiceCall(ServiceCallEvent),
}

/// One flattened field, rendered as a single downstream line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireMessage {
    pub entity_id: String,
    pub substitute_id: String,
    pub parent_keys: Vec<String>,
    pub attr_name: String,
    pub attr_value: String,
}

impl WireMessage {
    pub fn to_line(&self) -> String {
        format!("{self}\n")
    }
}

impl fmt::Display for WireMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "entity_id={}&substitute_id={}&parent_keys={}&attr_name={}&attr_value={}",
            self.entity_id,
            self.substitute_id,
            self.parent_keys.join("_"),
            self.attr_name,
            self.attr_value
        )
    }
}

/// An inbound downstream line split into its verb and positional arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    pub verb: String,
    pub args: Vec<String>,
    raw: String,
}

impl Command {
    pub fn parse(line: &str) -> Option<Self> {
        let line = line.trim_end_matches(['\r', '\n']);
        if line.trim().is_empty() {
            return None;
        }
        let mut parts = line.split(',');
        let verb = parts.next()?.trim().to_string();
        if verb.is_empty() {
            return None;
        }
        Some(Self {
            verb,
            args: parts.map(|p| p.trim().to_string()).collect(),
            raw: line.to_string(),
        })
    }

    /// The untouched text from argument `position` to the end of the line.
    pub fn raw_from(&self, position: usize) -> Option<&str> {
        self.raw.splitn(position + 2, ',').nth(position + 1)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ServiceCall {
    pub domain: String,
    pub service: String,
    pub entity_id: String,
    pub service_data: Option<Map<String, Value>>,
}

impl ServiceCall {
    pub fn new(domain: &str, service: &str, entity_id: impl Into<String>) -> Self {
        Self {
            domain: domain.to_string(),
            service: service.to_string(),
            entity_id: entity_id.into(),
            service_data: None,
        }
    }

    pub fn with_data(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.service_data
            .get_or_insert_with(Map::new)
            .insert(key.to_string(), value.into());
        self
    }
}

/// A request a session hands to its upstream link.
#[derive(Debug, Clone, PartialEq)]
pub enum UpstreamRequest {
    SubscribeEvents,
    SubscribeEntities(Vec<String>),
    CallService(ServiceCall),
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn wire_message_renders_fixed_key_order() {
        let msg = WireMessage {
            entity_id: "light.kitchen".to_string(),
            substitute_id: "K1".to_string(),
            parent_keys: vec!["attributes".to_string(), "0".to_string()],
            attr_name: "color".to_string(),
            attr_value: "red".to_string(),
        };
        assert_eq!(
            msg.to_line(),
            "entity_id=light.kitchen&substitute_id=K1&parent_keys=attributes_0&attr_name=color&attr_value=red\n"
        );
    }

    #[test]
    fn command_parse_splits_verb_and_args() {
        let cmd = Command::parse("switch_on,light.kitchen\r\n").unwrap();
        assert_eq!(cmd.verb, "switch_on");
        assert_eq!(cmd.args, vec!["light.kitchen".to_string()]);

        let bare = Command::parse("state_filter").unwrap();
        assert!(bare.args.is_empty());

        assert!(Command::parse("   \n").is_none());
        assert!(Command::parse(",light.kitchen").is_none());
    }

    #[test]
    fn raw_tail_keeps_inner_commas_and_spaces() {
        let cmd = Command::parse("play,media_player.tv, {\"a\": \"x, y\"}\n").unwrap();
        assert_eq!(cmd.raw_from(1), Some(" {\"a\": \"x, y\"}"));
        assert_eq!(cmd.raw_from(0), Some("media_player.tv, {\"a\": \"x, y\"}"));
        assert_eq!(cmd.raw_from(3), None);
    }

    #[test]
    fn state_event_skips_null_state() {
        let obj = json!({"entity_id": "sensor.t", "state": null, "attributes": {"unit": "C"}});
        let event = StateEvent::from_state_object(&obj).unwrap();
        assert!(event.state.is_none());
        assert!(event.attributes.is_some());
        assert!(StateEvent::from_state_object(&json!({"state": "on"})).is_none());
    }

    #[test]
    fn service_call_event_accepts_string_list_or_target() {
        let single = json!({"domain": "light", "service": "turn_on", "service_data": {"entity_id": "light.a"}});
        assert_eq!(
            ServiceCallEvent::from_event_data(&single).unwrap().entities,
            vec!["light.a".to_string()]
        );

        let many = json!({"domain": "light", "service": "turn_off", "service_data": {"entity_id": ["light.a", "light.b"]}});
        assert_eq!(ServiceCallEvent::from_event_data(&many).unwrap().entities.len(), 2);

        let target = json!({"domain": "cover", "service": "toggle", "target": {"entity_id": "cover.g"}});
        assert_eq!(
            ServiceCallEvent::from_event_data(&target).unwrap().entities,
            vec!["cover.g".to_string()]
        );

        let none = json!({"domain": "homeassistant", "service": "restart", "service_data": {}});
        assert!(ServiceCallEvent::from_event_data(&none).is_none());
    }
}
