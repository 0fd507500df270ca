use crate::model::{Command, ServiceCall, UpstreamRequest};
use crate::session::{AttributeFilter, Session, SubstitutionMap};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fmt;

/// How the positional arguments after the entity reference become service data.
#[derive(Debug, Clone, Copy, PartialEq)]
enum ArgLayout {
    EntityOnly,
    Text(&'static str),
    OptionalText(&'static str),
    Integer(&'static str),
    Float(&'static str),
    Flag(&'static str),
    /// 0..=100 sent as a 0.0..=1.0 fraction.
    Percent(&'static str),
    FloatRange(&'static str, &'static str),
    /// Integer level; zero switches the entity off instead.
    LevelOrOff(&'static str),
    /// Passed through as text; a value parsing to zero switches the entity off instead.
    ValueOrOff(&'static str),
    /// The untrimmed rest of the line after the entity is a JSON object of service data.
    JsonObject,
}

#[derive(Debug, Clone, Copy)]
struct VerbSpec {
    domain: &'static str,
    service: &'static str,
    layout: ArgLayout,
}

const OFF_SERVICE: &str = "turn_off";

const VERBS: &[(&str, &str, &str, ArgLayout)] = &[
    ("switch_on", "light", "turn_on", ArgLayout::EntityOnly),
    ("switch_off", "light", "turn_off", ArgLayout::EntityOnly),
    ("dimmer_set", "light", "turn_on", ArgLayout::LevelOrOff("brightness_pct")),
    ("socket_on", "switch", "turn_on", ArgLayout::EntityOnly),
    ("socket_off", "switch", "turn_off", ArgLayout::EntityOnly),
    ("fan_on", "fan", "turn_on", ArgLayout::OptionalText("speed")),
    ("fan_off", "fan", "turn_off", ArgLayout::EntityOnly),
    ("fan_set", "fan", "turn_on", ArgLayout::ValueOrOff("speed")),
    ("button_press", "button", "press", ArgLayout::EntityOnly),
    ("alarm_arm_away", "alarm_control_panel", "alarm_arm_away", ArgLayout::OptionalText("code")),
    ("alarm_arm_home", "alarm_control_panel", "alarm_arm_home", ArgLayout::OptionalText("code")),
    ("alarm_disarm", "alarm_control_panel", "alarm_disarm", ArgLayout::OptionalText("code")),
    ("remote_on", "remote", "turn_on", ArgLayout::EntityOnly),
    ("remote_off", "remote", "turn_off", ArgLayout::EntityOnly),
    ("remote_send_command", "remote", "send_command", ArgLayout::Text("command")),
    ("shade_set", "cover", "set_cover_position", ArgLayout::Integer("position")),
    ("open_garage_door", "cover", "open_cover", ArgLayout::EntityOnly),
    ("close_garage_door", "cover", "close_cover", ArgLayout::EntityOnly),
    ("toggle_garage_door", "cover", "toggle", ArgLayout::EntityOnly),
    ("lock_lock", "lock", "lock", ArgLayout::EntityOnly),
    ("unlock_lock", "lock", "unlock", ArgLayout::EntityOnly),
    ("climate_set_hvac_mode", "climate", "set_hvac_mode", ArgLayout::Text("hvac_mode")),
    ("climate_set_single", "climate", "set_temperature", ArgLayout::Float("temperature")),
    (
        "climate_set_temperature_range",
        "climate",
        "set_temperature",
        ArgLayout::FloatRange("target_temp_low", "target_temp_high"),
    ),
    ("media_player_play", "media_player", "media_play", ArgLayout::EntityOnly),
    ("media_player_play_pause", "media_player", "toggle", ArgLayout::EntityOnly),
    ("media_player_pause", "media_player", "media_pause", ArgLayout::EntityOnly),
    ("media_player_stop", "media_player", "media_stop", ArgLayout::EntityOnly),
    ("media_player_next_track", "media_player", "media_next_track", ArgLayout::EntityOnly),
    ("media_player_previous_track", "media_player", "media_previous_track", ArgLayout::EntityOnly),
    ("media_player_volume_up", "media_player", "volume_up", ArgLayout::EntityOnly),
    ("media_player_volume_down", "media_player", "volume_down", ArgLayout::EntityOnly),
    ("media_player_set_volume", "media_player", "volume_set", ArgLayout::Percent("volume_level")),
    ("media_player_select_source", "media_player", "select_source", ArgLayout::Text("source")),
    ("media_player_clear_playlist", "media_player", "clear_playlist", ArgLayout::EntityOnly),
    ("media_player_shuffle_set", "media_player", "shuffle_set", ArgLayout::Flag("shuffle")),
    ("media_player_repeat_set", "media_player", "repeat_set", ArgLayout::Text("repeat")),
    ("media_player_media_seek", "media_player", "media_seek", ArgLayout::Float("seek_position")),
    ("media_player_play_media", "media_player", "play_media", ArgLayout::JsonObject),
];

#[derive(Debug, Clone, PartialEq)]
pub enum DispatchError {
    UnknownVerb(String),
    MissingArgument { verb: String, position: usize },
    InvalidNumber { verb: String, value: String },
    InvalidJson { verb: String, error: String },
    EmptyEntityList(String),
    GenericCallDenied,
}

impl fmt::Display for DispatchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownVerb(verb) => write!(f, "unknown command verb: {verb}"),
            Self::MissingArgument { verb, position } => {
                write!(f, "{verb}: missing argument {position}")
            }
            Self::InvalidNumber { verb, value } => write!(f, "{verb}: not a number: {value}"),
            Self::InvalidJson { verb, error } => write!(f, "{verb}: invalid JSON argument: {error}"),
            Self::EmptyEntityList(verb) => write!(f, "{verb}: no entity ids given"),
            Self::GenericCallDenied => write!(
                f,
                "call_service is disabled (server.enable_generic_call_service = false)"
            ),
        }
    }
}

impl std::error::Error for DispatchError {}

/// Turns inbound command lines into session updates and upstream requests.
#[derive(Debug)]
pub struct CommandDispatcher {
    verbs: HashMap<&'static str, VerbSpec>,
    generic_call_service: bool,
}

impl CommandDispatcher {
    pub fn new(generic_call_service: bool) -> Self {
        let verbs = VERBS
            .iter()
            .map(|&(verb, domain, service, layout)| {
                (
                    verb,
                    VerbSpec {
                        domain,
                        service,
                        layout,
                    },
                )
            })
            .collect();
        Self {
            verbs,
            generic_call_service,
        }
    }

    /// Handles one raw line. Failures are logged and produce no requests.
    pub fn dispatch(&self, line: &str, session: &Session) -> Vec<UpstreamRequest> {
        let Some(command) = Command::parse(line) else {
            return Vec::new();
        };
        tracing::debug!(session_id = %session.id(), verb = %command.verb, args = ?command.args, "command");
        match self.handle(&command, session) {
            Ok(requests) => requests,
            Err(err) => {
                tracing::warn!(
                    session_id = %session.id(),
                    peer = %session.peer(),
                    verb = %command.verb,
                    error = %err,
                    "command dropped"
                );
                Vec::new()
            }
        }
    }

    pub fn handle(
        &self,
        command: &Command,
        session: &Session,
    ) -> Result<Vec<UpstreamRequest>, DispatchError> {
        match command.verb.as_str() {
            "substitute_ids" => Ok(substitute_ids(command, session)),
            "state_filter" => {
                let filter = AttributeFilter::from_tokens(&command.args);
                tracing::info!(session_id = %session.id(), filter = ?filter, "attribute filter replaced");
                session.replace_filter(filter);
                Ok(Vec::new())
            }
            "subscribe_entity" => {
                let entity_ids: Vec<String> = command
                    .args
                    .iter()
                    .filter(|id| !id.is_empty())
                    .cloned()
                    .collect();
                if entity_ids.is_empty() {
                    return Err(DispatchError::EmptyEntityList(command.verb.clone()));
                }
                Ok(vec![UpstreamRequest::SubscribeEntities(entity_ids)])
            }
            "subscribe_events" => Ok(vec![UpstreamRequest::SubscribeEvents]),
            "call_service" => self.generic_call(command, session).map(|call| vec![call]),
            verb => {
                let spec = self
                    .verbs
                    .get(verb)
                    .ok_or_else(|| DispatchError::UnknownVerb(verb.to_string()))?;
                build_call(spec, command, session).map(|call| vec![UpstreamRequest::CallService(call)])
            }
        }
    }

    /// `call_service,<domain>,<service>,<entity>,key=value...`
    fn generic_call(
        &self,
        command: &Command,
        session: &Session,
    ) -> Result<UpstreamRequest, DispatchError> {
        if !self.generic_call_service {
            return Err(DispatchError::GenericCallDenied);
        }
        let domain = required(command, 0)?;
        let service = required(command, 1)?;
        let entity_id = session.resolve(required(command, 2)?);

        let mut call = ServiceCall::new(domain, service, entity_id);
        for pair in command.args.iter().skip(3) {
            match pair.split_once('=') {
                Some((key, value)) if !key.is_empty() => {
                    call = call.with_data(key, value);
                }
                _ => tracing::debug!(verb = %command.verb, arg = %pair, "ignoring malformed key=value argument"),
            }
        }
        Ok(UpstreamRequest::CallService(call))
    }
}

/// `substitute_ids,<alias>,<entity>,...` replaces the alias map and subscribes to the entities.
fn substitute_ids(command: &Command, session: &Session) -> Vec<UpstreamRequest> {
    if command.args.len() % 2 != 0 {
        tracing::warn!(
            session_id = %session.id(),
            dangling = %command.args[command.args.len() - 1],
            "substitute_ids has an unpaired trailing argument; ignoring it"
        );
    }
    let pairs: Vec<(&str, &str)> = command
        .args
        .chunks_exact(2)
        .map(|pair| (pair[0].as_str(), pair[1].as_str()))
        .filter(|(alias, entity)| !alias.is_empty() && !entity.is_empty())
        .collect();
    let entity_ids: Vec<String> = pairs.iter().map(|(_, entity)| entity.to_string()).collect();

    let map = SubstitutionMap::from_pairs(pairs);
    tracing::info!(session_id = %session.id(), aliases = map.len(), "substitution map replaced");
    session.replace_substitutions(map);

    if entity_ids.is_empty() {
        return Vec::new();
    }
    vec![UpstreamRequest::SubscribeEntities(entity_ids)]
}

fn build_call(
    spec: &VerbSpec,
    command: &Command,
    session: &Session,
) -> Result<ServiceCall, DispatchError> {
    let entity_id = session.resolve(required(command, 0)?);
    let call = ServiceCall::new(spec.domain, spec.service, entity_id);

    let call = match spec.layout {
        ArgLayout::EntityOnly => call,
        ArgLayout::Text(key) => call.with_data(key, required(command, 1)?),
        ArgLayout::OptionalText(key) => match command.args.get(1).filter(|v| !v.is_empty()) {
            Some(value) => call.with_data(key, value.as_str()),
            None => call,
        },
        ArgLayout::Integer(key) => call.with_data(key, parse_int(command, 1)?),
        ArgLayout::Float(key) => call.with_data(key, parse_float(command, 1)?),
        ArgLayout::Flag(key) => call.with_data(key, required(command, 1)?.eq_ignore_ascii_case("true")),
        ArgLayout::Percent(key) => call.with_data(key, parse_float(command, 1)? / 100.0),
        ArgLayout::FloatRange(low, high) => call
            .with_data(low, parse_float(command, 1)?)
            .with_data(high, parse_float(command, 2)?),
        ArgLayout::LevelOrOff(key) => match parse_int(command, 1)? {
            0 => ServiceCall {
                service: OFF_SERVICE.to_string(),
                ..call
            },
            level => call.with_data(key, level),
        },
        ArgLayout::ValueOrOff(key) => {
            let value = required(command, 1)?;
            if value.parse::<f64>().is_ok_and(|v| v == 0.0) {
                ServiceCall {
                    service: OFF_SERVICE.to_string(),
                    ..call
                }
            } else {
                call.with_data(key, value)
            }
        }
        ArgLayout::JsonObject => {
            let raw = command
                .raw_from(1)
                .filter(|raw| !raw.trim().is_empty())
                .ok_or_else(|| DispatchError::MissingArgument {
                    verb: command.verb.clone(),
                    position: 1,
                })?;
            let data: Map<String, Value> =
                serde_json::from_str(raw).map_err(|err| DispatchError::InvalidJson {
                    verb: command.verb.clone(),
                    error: err.to_string(),
                })?;
            ServiceCall {
                service_data: Some(data),
                ..call
            }
        }
    };
    Ok(call)
}

fn required(command: &Command, position: usize) -> Result<&str, DispatchError> {
    command
        .args
        .get(position)
        .map(String::as_str)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| DispatchError::MissingArgument {
            verb: command.verb.clone(),
            position,
        })
}

fn parse_int(command: &Command, position: usize) -> Result<i64, DispatchError> {
    let raw = required(command, position)?;
    raw.parse().map_err(|_| DispatchError::InvalidNumber {
        verb: command.verb.clone(),
        value: raw.to_string(),
    })
}

fn parse_float(command: &Command, position: usize) -> Result<f64, DispatchError> {
    let raw = required(command, position)?;
    match raw.parse::<f64>() {
        Ok(v) if v.is_finite() => Ok(v),
        _ => Err(DispatchError::InvalidNumber {
            verb: command.verb.clone(),
            value: raw.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn session() -> Session {
        Session::new("10.0.0.5:40000".parse().unwrap())
    }

    fn call_of(requests: &[UpstreamRequest]) -> &ServiceCall {
        match requests {
            [UpstreamRequest::CallService(call)] => call,
            other => panic!("expected one service call, got {other:?}"),
        }
    }

    #[test]
    fn switch_on_maps_to_light_turn_on() {
        let dispatcher = CommandDispatcher::new(false);
        let requests = dispatcher.dispatch("switch_on,light.kitchen", &session());
        let call = call_of(&requests);
        assert_eq!(call.domain, "light");
        assert_eq!(call.service, "turn_on");
        assert_eq!(call.entity_id, "light.kitchen");
        assert!(call.service_data.is_none());
    }

    #[test]
    fn aliases_resolve_before_dispatch() {
        let dispatcher = CommandDispatcher::new(false);
        let session = session();

        let requests = dispatcher.dispatch("substitute_ids,K1,light.kitchen", &session);
        assert_eq!(
            requests,
            vec![UpstreamRequest::SubscribeEntities(vec!["light.kitchen".to_string()])]
        );

        let requests = dispatcher.dispatch("switch_on,K1", &session);
        assert_eq!(call_of(&requests).entity_id, "light.kitchen");

        let requests = dispatcher.dispatch("switch_on,K9", &session);
        assert_eq!(call_of(&requests).entity_id, "K9");
    }

    #[test]
    fn substitute_ids_replaces_wholesale() {
        let dispatcher = CommandDispatcher::new(false);
        let session = session();
        dispatcher.dispatch("substitute_ids,a1,light.one,a2,light.two", &session);
        dispatcher.dispatch("substitute_ids,b1,switch.three,dangling", &session);

        session.read(|state| {
            assert_eq!(state.substitutions.len(), 1);
            assert_eq!(state.substitutions.entity_for("b1"), Some("switch.three"));
            assert_eq!(state.substitutions.alias_for("light.one"), None);
        });
        assert_eq!(session.resolve("a1"), "a1");

        assert!(dispatcher.dispatch("substitute_ids", &session).is_empty());
        session.read(|state| assert!(state.substitutions.is_empty()));
    }

    #[test]
    fn state_filter_replaces_filter() {
        let dispatcher = CommandDispatcher::new(false);
        let session = session();
        assert!(dispatcher.dispatch("state_filter,brightness,state", &session).is_empty());
        session.read(|state| {
            assert!(state.filter.allows("brightness"));
            assert!(!state.filter.allows("color"));
        });

        dispatcher.dispatch("state_filter", &session);
        session.read(|state| assert_eq!(state.filter, AttributeFilter::All));

        dispatcher.dispatch("state_filter,brightness,all", &session);
        session.read(|state| {
            assert_ne!(state.filter, AttributeFilter::All);
            assert!(state.filter.allows("brightness"));
            assert!(!state.filter.allows("color"));
        });
    }

    #[test]
    fn subscribe_entity_requires_ids() {
        let dispatcher = CommandDispatcher::new(false);
        let session = session();
        assert_eq!(
            dispatcher.handle(&Command::parse("subscribe_entity").unwrap(), &session),
            Err(DispatchError::EmptyEntityList("subscribe_entity".to_string()))
        );
        assert_eq!(
            dispatcher.dispatch("subscribe_entity,light.a,switch.b", &session),
            vec![UpstreamRequest::SubscribeEntities(vec![
                "light.a".to_string(),
                "switch.b".to_string()
            ])]
        );
    }

    #[test]
    fn unknown_verbs_are_dropped() {
        let dispatcher = CommandDispatcher::new(true);
        assert_eq!(
            dispatcher.handle(&Command::parse("warp_drive,ship.one").unwrap(), &session()),
            Err(DispatchError::UnknownVerb("warp_drive".to_string()))
        );
        assert!(dispatcher.dispatch("warp_drive,ship.one", &session()).is_empty());
    }

    #[test]
    fn generic_call_service_honours_flag() {
        let line = "call_service,light,turn_on,K1,brightness=120,transition=1.5,flash=long,on=true";

        let denied = CommandDispatcher::new(false);
        assert_eq!(
            denied.handle(&Command::parse(line).unwrap(), &session()),
            Err(DispatchError::GenericCallDenied)
        );

        let allowed = CommandDispatcher::new(true);
        let session = session();
        session.replace_substitutions(SubstitutionMap::from_pairs([("K1", "light.kitchen")]));
        let requests = allowed.dispatch(line, &session);
        let call = call_of(&requests);
        assert_eq!(call.domain, "light");
        assert_eq!(call.service, "turn_on");
        assert_eq!(call.entity_id, "light.kitchen");
        let data = Value::Object(call.service_data.clone().unwrap());
        assert_eq!(
            data,
            json!({"brightness": "120", "transition": "1.5", "flash": "long", "on": "true"})
        );
    }

    #[test]
    fn generic_call_service_keeps_values_verbatim() {
        let dispatcher = CommandDispatcher::new(true);
        let requests = dispatcher.dispatch(
            "call_service,alarm_control_panel,alarm_disarm,alarm_control_panel.home,code=0123",
            &session(),
        );
        let call = call_of(&requests);
        assert_eq!(call.service_data.as_ref().unwrap()["code"], json!("0123"));
    }

    #[test]
    fn level_zero_turns_off() {
        let dispatcher = CommandDispatcher::new(false);
        let requests = dispatcher.dispatch("dimmer_set,light.den,0", &session());
        let call = call_of(&requests);
        assert_eq!(call.service, "turn_off");
        assert!(call.service_data.is_none());

        let requests = dispatcher.dispatch("dimmer_set,light.den,40", &session());
        let call = call_of(&requests);
        assert_eq!(call.service, "turn_on");
        assert_eq!(call.service_data.as_ref().unwrap()["brightness_pct"], json!(40));

        let requests = dispatcher.dispatch("fan_set,fan.attic,0", &session());
        assert_eq!(call_of(&requests).service, "turn_off");
        let requests = dispatcher.dispatch("fan_set,fan.attic,high", &session());
        assert_eq!(call_of(&requests).service_data.as_ref().unwrap()["speed"], json!("high"));
    }

    #[test]
    fn numeric_arguments_are_validated() {
        let dispatcher = CommandDispatcher::new(false);
        assert_eq!(
            dispatcher.handle(&Command::parse("shade_set,cover.blind,half").unwrap(), &session()),
            Err(DispatchError::InvalidNumber {
                verb: "shade_set".to_string(),
                value: "half".to_string()
            })
        );
        assert_eq!(
            dispatcher.handle(&Command::parse("climate_set_single,climate.hall").unwrap(), &session()),
            Err(DispatchError::MissingArgument {
                verb: "climate_set_single".to_string(),
                position: 1
            })
        );

        let requests = dispatcher.dispatch("media_player_set_volume,media_player.tv,25", &session());
        assert_eq!(call_of(&requests).service_data.as_ref().unwrap()["volume_level"], json!(0.25));

        let requests = dispatcher.dispatch(
            "climate_set_temperature_range,climate.hall,18,22.5",
            &session(),
        );
        let data = call_of(&requests).service_data.clone().unwrap();
        assert_eq!(data["target_temp_low"], json!(18.0));
        assert_eq!(data["target_temp_high"], json!(22.5));
    }

    #[test]
    fn optional_code_is_only_sent_when_given() {
        let dispatcher = CommandDispatcher::new(false);
        let requests = dispatcher.dispatch("alarm_disarm,alarm_control_panel.home", &session());
        assert!(call_of(&requests).service_data.is_none());
        let requests = dispatcher.dispatch("alarm_disarm,alarm_control_panel.home,1234", &session());
        assert_eq!(call_of(&requests).service_data.as_ref().unwrap()["code"], json!("1234"));
    }

    #[test]
    fn play_media_takes_a_json_object() {
        let dispatcher = CommandDispatcher::new(false);
        let requests = dispatcher.dispatch(
            r#"media_player_play_media,media_player.tv,{"media_content_id":"a,b","media_content_type":"music"}"#,
            &session(),
        );
        let call = call_of(&requests);
        assert_eq!(call.service, "play_media");
        let data = call.service_data.clone().unwrap();
        assert_eq!(data["media_content_id"], json!("a,b"));
        assert_eq!(data["media_content_type"], json!("music"));

        let requests = dispatcher.dispatch(
            r#"media_player_play_media,media_player.tv,{"media_content_id": "Hello, World", "media_content_type": "music"}"#,
            &session(),
        );
        let data = call_of(&requests).service_data.clone().unwrap();
        assert_eq!(data["media_content_id"], json!("Hello, World"));

        assert_eq!(
            dispatcher.handle(
                &Command::parse("media_player_play_media,media_player.tv").unwrap(),
                &session()
            ),
            Err(DispatchError::MissingArgument {
                verb: "media_player_play_media".to_string(),
                position: 1
            })
        );

        assert!(matches!(
            dispatcher.handle(
                &Command::parse("media_player_play_media,media_player.tv,[1]").unwrap(),
                &session()
            ),
            Err(DispatchError::InvalidJson { .. })
        ));
    }

    #[test]
    fn registry_has_one_entry_per_verb() {
        let dispatcher = CommandDispatcher::new(false);
        assert_eq!(dispatcher.verbs.len(), VERBS.len());
        for control in ["substitute_ids", "state_filter", "subscribe_entity", "subscribe_events", "call_service"] {
            assert!(!dispatcher.verbs.contains_key(control));
        }
    }

    #[test]
    fn shuffle_flag_is_case_insensitive() {
        let dispatcher = CommandDispatcher::new(false);
        let requests = dispatcher.dispatch("media_player_shuffle_set,media_player.tv,TRUE", &session());
        assert_eq!(call_of(&requests).service_data.as_ref().unwrap()["shuffle"], json!(true));
    }
}
