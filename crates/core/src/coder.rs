//! Coder registry: `kind -> decoder`.
//!
//! The store is schema-less, so every kind must be registered before it can be
//! created or decoded. Registration may happen at any time; readers see an
//! immutable snapshot swapped in on each registration.

use std::any::{type_name, TypeId};
use std::sync::Arc;

use arc_swap::ArcSwap;
use rustc_hash::FxHashMap;
use serde_json::Value as Json;

use crate::error::{Error, Result};
use crate::object::{Object, RawObject, Spec};

type ValidateFn = fn(&Json) -> std::result::Result<(), serde_json::Error>;

#[derive(Clone, Copy)]
struct Coder {
    type_id: TypeId,
    type_name: &'static str,
    validate: ValidateFn,
}

fn validate_as<S: Spec>(spec: &Json) -> std::result::Result<(), serde_json::Error> {
    <S as serde::Deserialize>::deserialize(spec).map(|_| ())
}

fn accept_any(_: &Json) -> std::result::Result<(), serde_json::Error> {
    Ok(())
}

#[derive(Default)]
pub struct CoderRegistry {
    coders: ArcSwap<FxHashMap<String, Coder>>,
}

impl CoderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `S` as the decoder for `S::KIND`. Re-registering replaces.
    pub fn register<S: Spec>(&self) -> &Self {
        self.insert(S::KIND, Coder { type_id: TypeId::of::<S>(), type_name: type_name::<S>(), validate: validate_as::<S> });
        self
    }

    /// Register a kind without a typed payload; any JSON spec is accepted and
    /// the kind can only be decoded as a raw object.
    pub fn register_dynamic(&self, kind: &str) -> &Self {
        self.insert(kind, Coder { type_id: TypeId::of::<Json>(), type_name: "serde_json::Value", validate: accept_any });
        self
    }

    fn insert(&self, kind: &str, coder: Coder) {
        self.coders.rcu(|cur| {
            let mut next = FxHashMap::clone(cur);
            next.insert(kind.to_string(), coder);
            next
        });
    }

    pub fn is_registered(&self, kind: &str) -> bool {
        self.coders.load().contains_key(kind)
    }

    pub fn kinds(&self) -> Vec<String> {
        let mut out: Vec<String> = self.coders.load().keys().cloned().collect();
        out.sort();
        out
    }

    /// Fail fast unless the kind is registered and its spec decodes.
    pub fn check(&self, raw: &RawObject) -> Result<()> {
        let coders = self.coders.load();
        let coder = coders.get(&raw.kind).ok_or_else(|| Error::Unregistered(raw.kind.clone()))?;
        (coder.validate)(&raw.spec)?;
        Ok(())
    }

    /// Decode a raw object as `S`. The registered decoder for the document's
    /// kind must be `S` itself.
    pub fn decode<S: Spec>(&self, raw: RawObject) -> Result<Object<S>> {
        let coders = self.coders.load();
        let coder = coders.get(&raw.kind).ok_or_else(|| Error::Unregistered(raw.kind.clone()))?;
        if coder.type_id != TypeId::of::<S>() {
            return Err(Error::KindMismatch { stored: coder.type_name.to_string(), requested: type_name::<S>().to_string() });
        }
        Object::<S>::from_raw(raw)
    }
}

impl std::fmt::Debug for CoderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoderRegistry").field("kinds", &self.kinds()).finish()
    }
}

/// Shared handle passed to the store and reconcilers.
pub type SharedCoders = Arc<CoderRegistry>;
