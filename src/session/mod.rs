use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::{PoisonError, RwLock};
use uuid::Uuid;

pub const FILTER_ALL: &str = "all";

/// Injective entity <-> alias mapping chosen by a downstream peer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubstitutionMap {
    alias_by_entity: HashMap<String, String>,
    entity_by_alias: HashMap<String, String>,
}

impl SubstitutionMap {
    /// Builds a map from `(alias, entity_id)` pairs. A later pair that reuses an alias or an
    /// entity evicts the earlier pairing so both directions stay one-to-one.
    pub fn from_pairs<I, A, E>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (A, E)>,
        A: Into<String>,
        E: Into<String>,
    {
        let mut map = Self::default();
        for (alias, entity) in pairs {
            map.insert(alias.into(), entity.into());
        }
        map
    }

    fn insert(&mut self, alias: String, entity: String) {
        if let Some(previous_entity) = self.entity_by_alias.remove(&alias) {
            self.alias_by_entity.remove(&previous_entity);
        }
        if let Some(previous_alias) = self.alias_by_entity.remove(&entity) {
            self.entity_by_alias.remove(&previous_alias);
        }
        self.entity_by_alias.insert(alias.clone(), entity.clone());
        self.alias_by_entity.insert(entity, alias);
    }

    pub fn alias_for(&self, entity_id: &str) -> Option<&str> {
        self.alias_by_entity.get(entity_id).map(String::as_str)
    }

    pub fn entity_for(&self, alias: &str) -> Option<&str> {
        self.entity_by_alias.get(alias).map(String::as_str)
    }

    /// Alias -> entity, passing unknown references through unchanged.
    pub fn resolve(&self, reference: &str) -> String {
        self.entity_for(reference).unwrap_or(reference).to_string()
    }

    pub fn len(&self) -> usize {
        self.alias_by_entity.len()
    }

    pub fn is_empty(&self) -> bool {
        self.alias_by_entity.is_empty()
    }
}

/// Attribute names a peer wants to receive; `All` matches every name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum AttributeFilter {
    #[default]
    All,
    Only(HashSet<String>),
}

impl AttributeFilter {
    /// No tokens, or exactly `all`, matches everything. Otherwise `all` is an ordinary name.
    pub fn from_tokens<I, S>(tokens: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let names: Vec<String> = tokens
            .into_iter()
            .map(|token| token.as_ref().trim().to_string())
            .filter(|token| !token.is_empty())
            .collect();
        match names.as_slice() {
            [] => Self::All,
            [only] if only == FILTER_ALL => Self::All,
            _ => Self::Only(names.into_iter().collect()),
        }
    }

    pub fn allows(&self, name: &str) -> bool {
        match self {
            Self::All => true,
            Self::Only(names) => names.contains(name),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct SessionState {
    pub substitutions: SubstitutionMap,
    pub filter: AttributeFilter,
}

/// One downstream peer. State is written only by that peer's commands and read by the
/// translation of events delivered to it.
#[derive(Debug)]
pub struct Session {
    id: Uuid,
    peer: SocketAddr,
    state: RwLock<SessionState>,
}

impl Session {
    pub fn new(peer: SocketAddr) -> Self {
        Self {
            id: Uuid::new_v4(),
            peer,
            state: RwLock::new(SessionState::default()),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn read<R>(&self, f: impl FnOnce(&SessionState) -> R) -> R {
        let guard = self.state.read().unwrap_or_else(PoisonError::into_inner);
        f(&guard)
    }

    fn write<R>(&self, f: impl FnOnce(&mut SessionState) -> R) -> R {
        let mut guard = self.state.write().unwrap_or_else(PoisonError::into_inner);
        f(&mut guard)
    }

    pub fn replace_substitutions(&self, substitutions: SubstitutionMap) {
        self.write(|state| state.substitutions = substitutions);
    }

    pub fn replace_filter(&self, filter: AttributeFilter) {
        self.write(|state| state.filter = filter);
    }

    pub fn resolve(&self, reference: &str) -> String {
        self.read(|state| state.substitutions.resolve(reference))
    }
}
