//! RCON session manager.
//!
//! Maintains the WebSocket connection to the game server, correlates command
//! responses by identifier, caches responses on request, and fans inbound
//! messages out to registered subscribers. The connection is re-established
//! automatically; subscribers registered for on-connect fire on every
//! successful (re)connect.

pub mod wire;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::broadcast;
use tokio::time::sleep;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

pub use wire::{Command, Response, CALLBACK_ID_FLOOR, FIRE_AND_FORGET_ID};

/// Seconds before an unanswered pending callback is swept.
const CALLBACK_TTL_SECS: u64 = 10;

/// Seconds between reconnect attempts.
const RECONNECT_DELAY_SECS: u64 = 5;

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;
type WsSource = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

/// Receives the response to a command issued with a callback.
pub trait ResponseCallback: Send + Sync {
    fn on_response(&self, response: &Response);
}

impl<F> ResponseCallback for F
where
    F: Fn(&Response) + Send + Sync,
{
    fn on_response(&self, response: &Response) {
        self(response)
    }
}

/// Receives the raw bytes of inbound stream messages.
pub trait MessageCallback: Send + Sync {
    fn on_message(&self, raw: &[u8]);
}

impl<F> MessageCallback for F
where
    F: Fn(&[u8]) + Send + Sync,
{
    fn on_message(&self, raw: &[u8]) {
        self(raw)
    }
}

/// The send surface other subsystems depend on, so they never hold the
/// session type itself.
pub trait CommandSender: Send + Sync {
    /// Fire-and-forget; no response is expected.
    fn send(&self, command: &str);

    /// Issues a command with a correlated response. A fresh response is
    /// cached for `cache_for_seconds` when nonzero; a non-expired cached
    /// response is delivered without any wire traffic.
    fn send_with_callback(
        &self,
        command: &str,
        cache_for_seconds: u64,
        callback: Arc<dyn ResponseCallback>,
    );
}

/// Tunables coming straight out of the config file.
#[derive(Debug, Clone, Default)]
pub struct RconOptions {
    /// Seconds to wait after connecting before on-connect commands go out.
    pub onconnect_delay: u64,
    /// Fan correlated responses out to on-message subscribers too.
    pub call_onmessage_on_invoke: bool,
    /// Drop frames whose decoded Message is empty before any callback runs.
    pub ignore_empty_rcon_messages: bool,
}

/// Process-lifetime session counters.
#[derive(Debug, Default)]
pub struct RconCounters {
    pub commands_run: AtomicU64,
    pub command_timeouts: AtomicU64,
    pub disconnects: AtomicU64,
    pub messages: AtomicU64,
    pub cache_hits: AtomicU64,
    pub cache_misses: AtomicU64,
    pub on_connect_callbacks: AtomicU64,
    pub on_message_callbacks: AtomicU64,
    pub on_invoke_callbacks: AtomicU64,
}

/// Point-in-time copy of the counters, handed to internal stats scripts.
#[derive(Debug, Clone, Copy)]
pub struct CountersSnapshot {
    pub commands_run: u64,
    pub command_timeouts: u64,
    pub disconnects: u64,
    pub messages: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub on_connect_callbacks: u64,
    pub on_message_callbacks: u64,
    pub on_invoke_callbacks: u64,
}

impl RconCounters {
    fn snapshot(&self) -> CountersSnapshot {
        CountersSnapshot {
            commands_run: self.commands_run.load(Ordering::Relaxed),
            command_timeouts: self.command_timeouts.load(Ordering::Relaxed),
            disconnects: self.disconnects.load(Ordering::Relaxed),
            messages: self.messages.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
            on_connect_callbacks: self.on_connect_callbacks.load(Ordering::Relaxed),
            on_message_callbacks: self.on_message_callbacks.load(Ordering::Relaxed),
            on_invoke_callbacks: self.on_invoke_callbacks.load(Ordering::Relaxed),
        }
    }
}

struct PendingCallback {
    ttl_seconds: u64,
    issued_at: u64,
    callback: Arc<dyn ResponseCallback>,
}

#[derive(Clone)]
struct CachedResponse {
    ttl_seconds: u64,
    stored_at: u64,
    response: Response,
}

/// Identifier allocation and the pending registry share one lock so an id is
/// never written to the wire without its callback registered.
struct SendState {
    identifier: i32,
    pending: HashMap<i32, PendingCallback>,
}

#[derive(Clone)]
struct OnConnectCommand {
    command: String,
    callback: Arc<dyn ResponseCallback>,
}

struct Inner {
    url: String,
    host: String,
    port: u16,
    options: RconOptions,
    connected: AtomicBool,
    send_state: Mutex<SendState>,
    cache: Arc<Mutex<HashMap<String, CachedResponse>>>,
    writer: tokio::sync::Mutex<Option<WsSink>>,
    disconnect_gate: tokio::sync::Mutex<()>,
    on_connect: Mutex<Vec<OnConnectCommand>>,
    on_message: Mutex<Vec<Arc<dyn MessageCallback>>>,
    counters: RconCounters,
}

/// Cheap-to-clone handle over the shared session state.
#[derive(Clone)]
pub struct RconClient {
    inner: Arc<Inner>,
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

impl RconClient {
    pub fn new(host: &str, port: u16, password: &str, options: RconOptions) -> Self {
        let url = format!("ws://{}:{}/{}", host, port, password);
        log::info!("Initialized RCON client to {}:{}", host, port);
        Self {
            inner: Arc::new(Inner {
                url,
                host: host.to_string(),
                port,
                options,
                connected: AtomicBool::new(false),
                send_state: Mutex::new(SendState {
                    identifier: CALLBACK_ID_FLOOR,
                    pending: HashMap::new(),
                }),
                cache: Arc::new(Mutex::new(HashMap::new())),
                writer: tokio::sync::Mutex::new(None),
                disconnect_gate: tokio::sync::Mutex::new(()),
                on_connect: Mutex::new(Vec::new()),
                on_message: Mutex::new(Vec::new()),
                counters: RconCounters::default(),
            }),
        }
    }

    pub fn connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }

    pub fn counters_snapshot(&self) -> CountersSnapshot {
        self.inner.counters.snapshot()
    }

    /// Registers a command to be issued after every successful (re)connect.
    pub fn on_connect(&self, command: &str, callback: Arc<dyn ResponseCallback>) {
        self.inner
            .on_connect
            .lock()
            .expect("on_connect lock poisoned")
            .push(OnConnectCommand {
                command: command.to_string(),
                callback,
            });
    }

    /// Registers a subscriber for raw inbound stream messages.
    pub fn on_message(&self, callback: Arc<dyn MessageCallback>) {
        self.inner
            .on_message
            .lock()
            .expect("on_message lock poisoned")
            .push(callback);
    }

    /// Connection maintainer. Runs until the shutdown channel closes, then
    /// forces a disconnect to unblock the reader.
    pub async fn maintain_connection(self, mut shutdown: broadcast::Receiver<()>) {
        tokio::spawn(self.clone().sweep_loop(shutdown.resubscribe()));

        loop {
            if self.connected() {
                tokio::select! {
                    _ = shutdown.recv() => break,
                    _ = sleep(Duration::from_secs(RECONNECT_DELAY_SECS)) => continue,
                }
            }

            log::info!(
                "Connecting to RCON at {}:{}",
                self.inner.host,
                self.inner.port
            );
            match connect_async(&self.inner.url).await {
                Ok((ws_stream, _)) => {
                    let (sink, source) = ws_stream.split();
                    *self.inner.writer.lock().await = Some(sink);
                    self.inner.connected.store(true, Ordering::SeqCst);
                    log::info!("Connected to RCON");

                    tokio::spawn(self.clone().read_loop(source));
                    tokio::spawn(self.clone().run_on_connect());
                }
                Err(e) => {
                    log::error!("Error connecting to RCON: {}", e);
                    tokio::select! {
                        _ = shutdown.recv() => break,
                        _ = sleep(Duration::from_secs(RECONNECT_DELAY_SECS)) => {}
                    }
                }
            }
        }

        log::info!("RCON session shutting down");
        self.disconnect().await;
    }

    /// Issues every registered on-connect command, optionally after the
    /// configured settle delay.
    async fn run_on_connect(self) {
        let delay = self.inner.options.onconnect_delay;
        if delay > 0 {
            log::debug!("Delaying on-connect commands by {}s", delay);
            sleep(Duration::from_secs(delay)).await;
        }

        let subscribers: Vec<OnConnectCommand> = self
            .inner
            .on_connect
            .lock()
            .expect("on_connect lock poisoned")
            .clone();

        for sub in subscribers {
            self.inner
                .counters
                .on_connect_callbacks
                .fetch_add(1, Ordering::Relaxed);
            self.send_with_callback(&sub.command, 0, sub.callback);
        }
    }

    async fn read_loop(self, mut source: WsSource) {
        log::debug!("RCON reader started");
        loop {
            let raw: Vec<u8> = match source.next().await {
                Some(Ok(Message::Text(text))) => text.into_bytes(),
                Some(Ok(Message::Binary(data))) => data,
                Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => continue,
                Some(Ok(Message::Close(_))) => {
                    log::warn!("RCON connection closed by server");
                    break;
                }
                Some(Ok(_)) => continue,
                Some(Err(e)) => {
                    log::error!("RCON read error: {}", e);
                    break;
                }
                None => {
                    log::warn!("RCON stream ended");
                    break;
                }
            };

            self.inner.counters.messages.fetch_add(1, Ordering::Relaxed);
            self.handle_frame(&raw);
            self.sweep_pending();
        }

        self.inner
            .counters
            .disconnects
            .fetch_add(1, Ordering::Relaxed);
        self.disconnect().await;
        log::debug!("RCON reader exited");
    }

    /// Decodes one inbound frame and routes it: fan-out to on-message
    /// subscribers per the correlation policy, then delivery to the pending
    /// callback when the identifier is ours.
    fn handle_frame(&self, raw: &[u8]) {
        let response: Response = match serde_json::from_slice(raw) {
            Ok(r) => r,
            Err(e) => {
                log::warn!("Error decoding RCON frame: {}", e);
                return;
            }
        };

        if self.inner.options.ignore_empty_rcon_messages && response.message.is_empty() {
            return;
        }

        let correlated = response.is_correlated();
        if !correlated || self.inner.options.call_onmessage_on_invoke {
            self.fan_out(raw);
        }

        if !correlated {
            return;
        }

        let pending = self
            .inner
            .send_state
            .lock()
            .expect("send_state lock poisoned")
            .pending
            .remove(&response.identifier);

        match pending {
            Some(entry) => {
                self.inner
                    .counters
                    .on_invoke_callbacks
                    .fetch_add(1, Ordering::Relaxed);
                tokio::spawn(async move {
                    entry.callback.on_response(&response);
                });
            }
            None => {
                log::warn!(
                    "Response for unknown identifier {}, ignoring",
                    response.identifier
                );
            }
        }
    }

    fn fan_out(&self, raw: &[u8]) {
        let subscribers: Vec<Arc<dyn MessageCallback>> = self
            .inner
            .on_message
            .lock()
            .expect("on_message lock poisoned")
            .clone();

        for sub in subscribers {
            self.inner
                .counters
                .on_message_callbacks
                .fetch_add(1, Ordering::Relaxed);
            sub.on_message(raw);
        }
    }

    /// Fallback expiry timer. The reader sweeps after every inbound message,
    /// but a silent connection would otherwise never expire pending
    /// callbacks.
    async fn sweep_loop(self, mut shutdown: broadcast::Receiver<()>) {
        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                _ = sleep(Duration::from_secs(1)) => self.sweep_pending(),
            }
        }
    }

    /// Drops pending callbacks older than their TTL. Runs after every inbound
    /// message and from the fallback timer.
    fn sweep_pending(&self) {
        let now = unix_now();
        let mut state = self
            .inner
            .send_state
            .lock()
            .expect("send_state lock poisoned");

        let before = state.pending.len();
        state.pending.retain(|_, entry| {
            entry.ttl_seconds == 0 || now.saturating_sub(entry.issued_at) < entry.ttl_seconds
        });
        let expired = before - state.pending.len();
        if expired > 0 {
            self.inner
                .counters
                .command_timeouts
                .fetch_add(expired as u64, Ordering::Relaxed);
            log::debug!("Swept {} expired pending callbacks", expired);
        }
    }

    fn cache_lookup(&self, command: &str) -> Option<Response> {
        let mut cache = self.inner.cache.lock().expect("cache lock poisoned");
        let expired = match cache.get(command) {
            Some(entry) => unix_now().saturating_sub(entry.stored_at) >= entry.ttl_seconds,
            None => return None,
        };
        if expired {
            cache.remove(command);
            return None;
        }
        cache.get(command).map(|entry| entry.response.clone())
    }

    /// Serialize idempotent teardown: the second disconnect of a pair is a
    /// warning no-op. Closing the sink drops the socket, which the reader
    /// observes as a read error.
    pub async fn disconnect(&self) {
        let _gate = self.inner.disconnect_gate.lock().await;
        if !self.inner.connected.swap(false, Ordering::SeqCst) {
            log::warn!("Disconnect requested on an already-disconnected session");
            return;
        }

        if let Some(mut sink) = self.inner.writer.lock().await.take() {
            if let Err(e) = sink.close().await {
                log::debug!("Error closing RCON socket: {}", e);
            }
        }
        log::info!("Disconnected RCON client");
    }

    async fn write_frame(self, command: Command) {
        let payload = match serde_json::to_string(&command) {
            Ok(p) => p,
            Err(e) => {
                log::error!("Error encoding RCON command: {}", e);
                return;
            }
        };

        let mut writer = self.inner.writer.lock().await;
        match writer.as_mut() {
            Some(sink) => {
                if let Err(e) = sink.send(Message::Text(payload)).await {
                    log::error!("RCON write error: {}", e);
                }
            }
            None => log::warn!("RCON writer gone, dropping command"),
        }
    }
}

impl CommandSender for RconClient {
    fn send(&self, command: &str) {
        if !self.connected() {
            log::warn!("Client is disconnected, unable to send command");
            return;
        }

        self.inner
            .counters
            .commands_run
            .fetch_add(1, Ordering::Relaxed);
        let frame = Command::new(FIRE_AND_FORGET_ID, command);
        tokio::spawn(self.clone().write_frame(frame));
    }

    fn send_with_callback(
        &self,
        command: &str,
        cache_for_seconds: u64,
        callback: Arc<dyn ResponseCallback>,
    ) {
        if let Some(response) = self.cache_lookup(command) {
            self.inner
                .counters
                .cache_hits
                .fetch_add(1, Ordering::Relaxed);
            log::debug!("Cache hit for command {}", command);
            tokio::spawn(async move {
                callback.on_response(&response);
            });
            return;
        }
        self.inner
            .counters
            .cache_misses
            .fetch_add(1, Ordering::Relaxed);

        if !self.connected() {
            log::warn!("Client is disconnected, dropping command {}", command);
            return;
        }

        let callback: Arc<dyn ResponseCallback> = if cache_for_seconds > 0 {
            Arc::new(CacheWriter {
                command: command.to_string(),
                ttl_seconds: cache_for_seconds,
                cache: self.inner.cache.clone(),
                inner: callback,
            })
        } else {
            callback
        };

        let id = {
            let mut state = self
                .inner
                .send_state
                .lock()
                .expect("send_state lock poisoned");
            state.identifier += 1;
            let id = state.identifier;
            state.pending.insert(
                id,
                PendingCallback {
                    ttl_seconds: CALLBACK_TTL_SECS,
                    issued_at: unix_now(),
                    callback,
                },
            );
            id
        };

        self.inner
            .counters
            .commands_run
            .fetch_add(1, Ordering::Relaxed);
        let frame = Command::new(id, command);
        tokio::spawn(self.clone().write_frame(frame));
    }
}

/// Wraps the user callback for cacheable commands: the first real delivery
/// stores the response before handing it on.
struct CacheWriter {
    command: String,
    ttl_seconds: u64,
    cache: Arc<Mutex<HashMap<String, CachedResponse>>>,
    inner: Arc<dyn ResponseCallback>,
}

impl ResponseCallback for CacheWriter {
    fn on_response(&self, response: &Response) {
        self.cache.lock().expect("cache lock poisoned").insert(
            self.command.clone(),
            CachedResponse {
                ttl_seconds: self.ttl_seconds,
                stored_at: unix_now(),
                response: response.clone(),
            },
        );
        self.inner.on_response(response);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn test_client(options: RconOptions) -> RconClient {
        RconClient::new("localhost", 28016, "secret", options)
    }

    fn counting_callback() -> (Arc<dyn ResponseCallback>, Arc<AtomicUsize>) {
        let count = Arc::new(AtomicUsize::new(0));
        let counted = count.clone();
        let callback: Arc<dyn ResponseCallback> = Arc::new(move |_: &Response| {
            counted.fetch_add(1, Ordering::SeqCst);
        });
        (callback, count)
    }

    fn register_pending(client: &RconClient, id: i32, callback: Arc<dyn ResponseCallback>) {
        client.inner.send_state.lock().unwrap().pending.insert(
            id,
            PendingCallback {
                ttl_seconds: CALLBACK_TTL_SECS,
                issued_at: unix_now(),
                callback,
            },
        );
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    #[test]
    fn endpoint_appends_password_as_path() {
        let client = test_client(RconOptions::default());
        assert_eq!(client.inner.url, "ws://localhost:28016/secret");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn correlated_response_delivers_and_clears_pending() {
        let client = test_client(RconOptions::default());
        let (callback, count) = counting_callback();
        register_pending(&client, 1043, callback);

        let raw = br#"{"Identifier":1043,"Message":"ok","Type":"Generic","Stacktrace":""}"#;
        client.handle_frame(raw);
        settle().await;

        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(client
            .inner
            .send_state
            .lock()
            .unwrap()
            .pending
            .is_empty());
        assert_eq!(client.counters_snapshot().on_invoke_callbacks, 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn low_identifier_never_touches_pending() {
        let client = test_client(RconOptions::default());
        let (callback, count) = counting_callback();
        register_pending(&client, 1043, callback);

        let raw = br#"{"Identifier":0,"Message":"stream","Type":"Generic","Stacktrace":""}"#;
        client.handle_frame(raw);
        settle().await;

        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert_eq!(client.inner.send_state.lock().unwrap().pending.len(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn fan_out_policy_follows_correlation_flag() {
        let seen = Arc::new(AtomicUsize::new(0));
        let seen_sub = seen.clone();
        let client = test_client(RconOptions::default());
        client.on_message(Arc::new(move |_: &[u8]| {
            seen_sub.fetch_add(1, Ordering::SeqCst);
        }));

        client.handle_frame(br#"{"Identifier":0,"Message":"a","Type":"Generic","Stacktrace":""}"#);
        assert_eq!(seen.load(Ordering::SeqCst), 1);

        // Correlated frames are not fanned out by default.
        client
            .handle_frame(br#"{"Identifier":2000,"Message":"b","Type":"Generic","Stacktrace":""}"#);
        assert_eq!(seen.load(Ordering::SeqCst), 1);

        let flagged = test_client(RconOptions {
            call_onmessage_on_invoke: true,
            ..RconOptions::default()
        });
        let seen_flagged = Arc::new(AtomicUsize::new(0));
        let seen_sub = seen_flagged.clone();
        flagged.on_message(Arc::new(move |_: &[u8]| {
            seen_sub.fetch_add(1, Ordering::SeqCst);
        }));
        flagged
            .handle_frame(br#"{"Identifier":2000,"Message":"b","Type":"Generic","Stacktrace":""}"#);
        assert_eq!(seen_flagged.load(Ordering::SeqCst), 1);
        settle().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn empty_messages_suppressed_when_configured() {
        let seen = Arc::new(AtomicUsize::new(0));
        let seen_sub = seen.clone();
        let client = test_client(RconOptions {
            ignore_empty_rcon_messages: true,
            ..RconOptions::default()
        });
        client.on_message(Arc::new(move |_: &[u8]| {
            seen_sub.fetch_add(1, Ordering::SeqCst);
        }));

        client.handle_frame(br#"{"Identifier":0,"Message":"","Type":"Generic","Stacktrace":""}"#);
        assert_eq!(seen.load(Ordering::SeqCst), 0);

        client
            .handle_frame(br#"{"Identifier":0,"Message":"hi","Type":"Generic","Stacktrace":""}"#);
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn sweep_expires_old_pending_entries() {
        let client = test_client(RconOptions::default());
        let (callback, _count) = counting_callback();
        client.inner.send_state.lock().unwrap().pending.insert(
            1001,
            PendingCallback {
                ttl_seconds: CALLBACK_TTL_SECS,
                issued_at: unix_now() - CALLBACK_TTL_SECS - 1,
                callback,
            },
        );

        client.sweep_pending();
        assert!(client.inner.send_state.lock().unwrap().pending.is_empty());
        assert_eq!(client.counters_snapshot().command_timeouts, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_loop_expires_on_a_silent_connection() {
        let client = test_client(RconOptions::default());
        let (callback, _count) = counting_callback();
        client.inner.send_state.lock().unwrap().pending.insert(
            1001,
            PendingCallback {
                ttl_seconds: CALLBACK_TTL_SECS,
                issued_at: unix_now() - CALLBACK_TTL_SECS - 1,
                callback,
            },
        );

        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        tokio::spawn(client.clone().sweep_loop(shutdown_rx));

        // No inbound messages at all; only the fallback timer runs.
        tokio::time::sleep(Duration::from_secs(2)).await;

        assert!(client.inner.send_state.lock().unwrap().pending.is_empty());
        assert_eq!(client.counters_snapshot().command_timeouts, 1);
        let _ = shutdown_tx.send(());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn cache_hit_skips_wire_and_pending() {
        let client = test_client(RconOptions::default());
        let response = Response {
            identifier: 1001,
            message: "cached".to_string(),
            message_type: "Generic".to_string(),
            stacktrace: String::new(),
        };
        client.inner.cache.lock().unwrap().insert(
            "serverinfo".to_string(),
            CachedResponse {
                ttl_seconds: 60,
                stored_at: unix_now(),
                response,
            },
        );

        let (callback, count) = counting_callback();
        client.send_with_callback("serverinfo", 60, callback);
        settle().await;

        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(client.inner.send_state.lock().unwrap().pending.is_empty());
        let counters = client.counters_snapshot();
        assert_eq!(counters.cache_hits, 1);
        assert_eq!(counters.commands_run, 0);
    }

    #[test]
    fn cache_lookup_expires_lazily() {
        let client = test_client(RconOptions::default());
        client.inner.cache.lock().unwrap().insert(
            "fps".to_string(),
            CachedResponse {
                ttl_seconds: 5,
                stored_at: unix_now() - 6,
                response: Response::default(),
            },
        );

        assert!(client.cache_lookup("fps").is_none());
        assert!(client.inner.cache.lock().unwrap().is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn disconnected_send_drops_without_pending() {
        let client = test_client(RconOptions::default());
        let (callback, count) = counting_callback();
        client.send_with_callback("serverinfo", 0, callback);
        settle().await;

        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert!(client.inner.send_state.lock().unwrap().pending.is_empty());
        assert_eq!(client.counters_snapshot().cache_misses, 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn cache_writer_stores_on_first_delivery() {
        let client = test_client(RconOptions::default());
        let (callback, count) = counting_callback();
        let writer = CacheWriter {
            command: "serverinfo".to_string(),
            ttl_seconds: 60,
            cache: client.inner.cache.clone(),
            inner: callback,
        };

        let response = Response {
            identifier: 1001,
            message: "fresh".to_string(),
            message_type: "Generic".to_string(),
            stacktrace: String::new(),
        };
        writer.on_response(&response);

        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(
            client.cache_lookup("serverinfo").unwrap().message,
            "fresh"
        );
    }
}
