//! Typed configuration registry
//!
//! Process-wide named variables with change listeners. The runtime itself
//! consumes only a couple of keys (`fiber.stack_size`,
//! `tcp.connect.timeout`); the registry is generic so applications can hang
//! their own knobs off it.
//!
//! A key named `fiber.stack_size` can be overridden at startup with the
//! environment variable `WEFT_FIBER_STACK_SIZE`. Overrides are applied on
//! first lookup and go through the normal listener path.

use crate::env::env_get_opt;
use crate::sync::{Mutex, RwLock};
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, OnceLock};

type Listener<T> = Box<dyn Fn(&T, &T) + Send + Sync>;

/// A single named configuration value.
pub struct ConfigVar<T> {
    name: String,
    description: String,
    value: RwLock<T>,
    listeners: Mutex<Vec<(u64, Listener<T>)>>,
    next_listener_id: Mutex<u64>,
}

impl<T> ConfigVar<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn new(name: &str, value: T, description: &str) -> Self {
        Self {
            name: name.to_string(),
            description: description.to_string(),
            value: RwLock::new(value),
            listeners: Mutex::new(Vec::new()),
            next_listener_id: Mutex::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    /// Current value (cloned under the read lock).
    pub fn value(&self) -> T {
        self.value.read().clone()
    }

    /// Replace the value.
    ///
    /// Listeners run with `(old, new)` before the store is committed; a
    /// listener that re-reads the variable still observes the old value.
    pub fn set(&self, new: T) {
        let old = self.value.read().clone();
        {
            let listeners = self.listeners.lock();
            for (_, cb) in listeners.iter() {
                cb(&old, &new);
            }
        }
        *self.value.write() = new;
    }

    /// Register a change listener; returns a handle usable with
    /// [`ConfigVar::del_listener`].
    pub fn add_listener<F>(&self, cb: F) -> u64
    where
        F: Fn(&T, &T) + Send + Sync + 'static,
    {
        let mut next = self.next_listener_id.lock();
        let id = *next;
        *next += 1;
        self.listeners.lock().push((id, Box::new(cb)));
        id
    }

    pub fn del_listener(&self, id: u64) {
        self.listeners.lock().retain(|(k, _)| *k != id);
    }
}

impl<T> fmt::Debug for ConfigVar<T>
where
    T: Clone + Send + Sync + fmt::Debug + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConfigVar")
            .field("name", &self.name)
            .field("value", &self.value())
            .finish()
    }
}

/// The process-wide registry.
pub struct Config;

fn registry() -> &'static RwLock<HashMap<String, Arc<dyn Any + Send + Sync>>> {
    static REGISTRY: OnceLock<RwLock<HashMap<String, Arc<dyn Any + Send + Sync>>>> =
        OnceLock::new();
    REGISTRY.get_or_init(|| RwLock::new(HashMap::new()))
}

/// `tcp.connect.timeout` -> `WEFT_TCP_CONNECT_TIMEOUT`
fn env_key(name: &str) -> String {
    let mut key = String::with_capacity(name.len() + 5);
    key.push_str("WEFT_");
    for c in name.chars() {
        match c {
            '.' | '-' => key.push('_'),
            c => key.push(c.to_ascii_uppercase()),
        }
    }
    key
}

impl Config {
    /// Look up a variable, creating it with `default` on first use.
    ///
    /// The first lookup applies any `WEFT_*` environment override. Looking up
    /// an existing name with a different `T` is a programmer error.
    pub fn lookup<T>(name: &str, default: T, description: &str) -> Arc<ConfigVar<T>>
    where
        T: Clone + Send + Sync + FromStr + 'static,
    {
        {
            let map = registry().read();
            if let Some(entry) = map.get(name) {
                return entry
                    .clone()
                    .downcast::<ConfigVar<T>>()
                    .unwrap_or_else(|_| {
                        panic!("config var {:?} already registered with another type", name)
                    });
            }
        }

        let mut map = registry().write();
        // Raced with another creator between the locks
        if let Some(entry) = map.get(name) {
            return entry
                .clone()
                .downcast::<ConfigVar<T>>()
                .unwrap_or_else(|_| {
                    panic!("config var {:?} already registered with another type", name)
                });
        }

        let initial = env_get_opt::<T>(&env_key(name)).unwrap_or(default);
        let var = Arc::new(ConfigVar::new(name, initial, description));
        map.insert(name.to_string(), var.clone());
        var
    }

    /// Look up a variable that must already exist.
    pub fn find<T>(name: &str) -> Option<Arc<ConfigVar<T>>>
    where
        T: Clone + Send + Sync + 'static,
    {
        let map = registry().read();
        map.get(name)
            .and_then(|entry| entry.clone().downcast::<ConfigVar<T>>().ok())
    }
}
