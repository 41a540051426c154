//! The host surface exposed to stat scripts: the shared globals map, the
//! advisory script lock, the logger bridge, escaping helpers and the
//! outbound webhooks.

use std::sync::{Arc, Condvar, Mutex};

use rhai::module_resolvers::FileModuleResolver;
use rhai::{Dynamic, Engine, ImmutableString, Map};

use super::escape;
use super::webhooks::WebhookSender;

/// The one process-wide map shared between all scripts. Indexer access goes
/// through the lock one key at a time; multi-key updates use the advisory
/// lock.
pub struct ScriptGlobals {
    map: Arc<Mutex<Map>>,
}

impl ScriptGlobals {
    pub fn new() -> Self {
        Self {
            map: Arc::new(Mutex::new(Map::new())),
        }
    }

    pub fn handle(&self) -> GlobalsHandle {
        GlobalsHandle {
            map: self.map.clone(),
        }
    }
}

impl Default for ScriptGlobals {
    fn default() -> Self {
        Self::new()
    }
}

/// Script-side view of the globals map, pushed into every scope as
/// `_GLOBALS`.
#[derive(Clone)]
pub struct GlobalsHandle {
    map: Arc<Mutex<Map>>,
}

impl GlobalsHandle {
    pub fn get(&self, key: &str) -> Dynamic {
        self.map
            .lock()
            .expect("globals lock poisoned")
            .get(key)
            .cloned()
            .unwrap_or(Dynamic::UNIT)
    }

    pub fn set(&self, key: &str, value: Dynamic) {
        self.map
            .lock()
            .expect("globals lock poisoned")
            .insert(key.into(), value);
    }
}

/// Advisory mutex for scripts. `lock()` blocks until the holder calls
/// `unlock()`; scripts bracket multi-key read-modify-write sequences with
/// the pair. Implemented as a condvar-guarded flag because the acquire and
/// release happen in separate host calls.
pub struct AdvisoryLock {
    held: Mutex<bool>,
    released: Condvar,
}

impl AdvisoryLock {
    pub fn new() -> Self {
        Self {
            held: Mutex::new(false),
            released: Condvar::new(),
        }
    }

    pub fn lock(&self) {
        let mut held = self.held.lock().expect("advisory lock poisoned");
        while *held {
            held = self.released.wait(held).expect("advisory lock poisoned");
        }
        *held = true;
    }

    pub fn unlock(&self) {
        let mut held = self.held.lock().expect("advisory lock poisoned");
        *held = false;
        self.released.notify_one();
    }
}

impl Default for AdvisoryLock {
    fn default() -> Self {
        Self::new()
    }
}

fn script_log(level: &str, message: &str) {
    match level.to_lowercase().as_str() {
        "debug" => log::debug!("{}", message),
        "info" => log::info!("{}", message),
        "warn" | "warning" => log::warn!("{}", message),
        "error" => log::error!("{}", message),
        other => log::warn!(
            "Script logger called with unknown level {:?}: {}",
            other,
            message
        ),
    }
}

/// Builds the engine every stat script runs on: rhai standard library, file
/// imports, and the host bindings. The globals handle itself is pushed into
/// each scope at run time; the engine only learns the type.
pub fn build_engine(advisory: Arc<AdvisoryLock>, webhooks: Arc<WebhookSender>) -> Engine {
    let mut engine = Engine::new();
    engine.set_module_resolver(FileModuleResolver::new());

    engine
        .register_type_with_name::<GlobalsHandle>("Globals")
        .register_indexer_get(|globals: &mut GlobalsHandle, key: ImmutableString| -> Dynamic {
            globals.get(key.as_str())
        })
        .register_indexer_set(
            |globals: &mut GlobalsHandle, key: ImmutableString, value: Dynamic| {
                globals.set(key.as_str(), value);
            },
        );

    engine.register_fn("logger", |level: &str, message: &str| {
        script_log(level, message);
    });

    let advisory_acquire = advisory.clone();
    engine.register_fn("lock", move || advisory_acquire.lock());
    engine.register_fn("unlock", move || advisory.unlock());

    engine.register_fn("tagescape", |s: &str| escape::tag_escape(s));
    engine.register_fn("fieldescape", |s: &str| escape::field_escape(s));

    let discord_hooks = webhooks.clone();
    engine.register_fn("discord_webhook", move |url: &str, content: &str| -> i64 {
        discord_hooks.discord(url, content, None)
    });
    let discord_named_hooks = webhooks.clone();
    engine.register_fn(
        "discord_webhook",
        move |url: &str, content: &str, username: &str| -> i64 {
            discord_named_hooks.discord(url, content, Some(username))
        },
    );
    engine.register_fn("slack_webhook", move |url: &str, text: &str| -> i64 {
        webhooks.slack(url, text)
    });

    engine
}
