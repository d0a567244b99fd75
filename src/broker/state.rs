//! Application state and the single writer
//!
//! All aggregate broker state — subscription index, retained store, session
//! table, client registry, registered scripts — lives behind one
//! reader-writer lock and is mutated only through [`ChangeRequest`]s. A
//! dedicated writer thread drains the primary queue; an internal queue,
//! stored inside the locked state, lets an executing request enqueue
//! follow-up work (session-resume re-subscribes, retain updates produced
//! during dispatch) that runs before the write guard is released.
//!
//! Dispatch order: scripts receive a publish before any connection
//! subscriber, so a Sync script can abort delivery to connections and the
//! retain update for that publish.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use ahash::AHashMap;
use bytes::Bytes;
use crossbeam_queue::SegQueue;
use parking_lot::{Mutex, RwLock};
use smallvec::SmallVec;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::broker::connection::{ClientConnection, ConnectionId, ConnectionState};
use crate::broker::retained::RetainedStore;
use crate::broker::subscriptions::{Subscriber, SubscriptionIndex};
use crate::broker::BrokerConfig;
use crate::protocol::{ConnAck, ConnectReturnCode, Packet, QoS};
use crate::scripts::{
    ScriptCtor, ScriptEntry, ScriptInitOutputs, ScriptInitReturn, ScriptRunInput,
    ScriptRunOutputs, ScriptRunType, SyncAction, SyncRendezvous,
};
use crate::session::SessionTable;

/// How a change request is submitted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestMode {
    /// Enqueue for the writer thread
    Async,
    /// Acquire the write lock and execute on the calling thread
    Sync,
    /// Equivalent to `Sync` today; reserved for an idle short-circuit
    SyncWhenIdle,
}

/// A state mutation, executed under the exclusive state lock
pub enum ChangeRequest {
    Subscribe {
        subscriber: Subscriber,
        filter: String,
        qos: Option<QoS>,
    },
    Unsubscribe {
        subscriber: Subscriber,
        filter: String,
    },
    Publish {
        topic: String,
        payload: Bytes,
        qos: QoS,
        retain: bool,
    },
    Retain {
        topic: String,
        payload: Bytes,
        qos: QoS,
    },
    Login {
        connection: Arc<ClientConnection>,
        client_id: String,
        clean_session: bool,
    },
    Disconnect {
        connection: ConnectionId,
    },
    AddScript {
        name: String,
        // `ScriptCtor`/`ScriptInitOutputs` carry `FnOnce` callbacks that are
        // `Send` but not `Sync`; wrapping them lets `ChangeRequest` itself
        // be `Sync`, which `Arc<AppShared>` requires.
        ctor: Mutex<Option<ScriptCtor>>,
        status: Mutex<Option<ScriptInitOutputs>>,
    },
    RemoveScript {
        name: String,
    },
    Cleanup,
}

/// Everything guarded by the state lock
struct StateInner {
    subscriptions: SubscriptionIndex,
    retained: RetainedStore,
    sessions: SessionTable,
    clients: AHashMap<ConnectionId, Arc<ClientConnection>>,
    scripts: AHashMap<String, ScriptEntry>,
    /// Requests enqueued from within an executing request; drained before
    /// the write guard is released
    internal: VecDeque<ChangeRequest>,
}

struct AppShared {
    inner: RwLock<StateInner>,
    queue: SegQueue<ChangeRequest>,
    running: AtomicBool,
    worker: Mutex<Option<std::thread::JoinHandle<()>>>,
    sync_script_timeout: Duration,
}

/// Cloneable handle to the application state
#[derive(Clone)]
pub struct AppState {
    shared: Arc<AppShared>,
}

impl AppState {
    /// Create the state and spawn the writer thread
    pub fn new(config: &BrokerConfig) -> Self {
        let shared = Arc::new(AppShared {
            inner: RwLock::new(StateInner {
                subscriptions: SubscriptionIndex::new(),
                retained: RetainedStore::new(),
                sessions: SessionTable::new(),
                clients: AHashMap::new(),
                scripts: AHashMap::new(),
                internal: VecDeque::new(),
            }),
            queue: SegQueue::new(),
            running: AtomicBool::new(true),
            worker: Mutex::new(None),
            sync_script_timeout: config.sync_script_timeout,
        });

        let worker_shared = shared.clone();
        let handle = std::thread::Builder::new()
            .name("state-writer".to_string())
            .spawn(move || writer_loop(worker_shared))
            .expect("failed to spawn state writer thread");
        *shared.worker.lock() = Some(handle);

        Self { shared }
    }

    /// Submit a change request
    pub fn request_change(&self, req: ChangeRequest, mode: RequestMode) {
        match mode {
            RequestMode::Async => self.shared.queue.push(req),
            RequestMode::Sync | RequestMode::SyncWhenIdle => execute(&self.shared, req),
        }
    }

    /// Add an accepted connection to the client registry
    pub fn register_connection(&self, conn: Arc<ClientConnection>) {
        let mut inner = self.shared.inner.write();
        info!(connection = %conn.id(), addr = %conn.addr(), "new connection");
        inner.clients.insert(conn.id(), conn);
    }

    /// Stop the writer thread and wait for it to exit
    pub fn shutdown(&self) {
        self.shared.running.store(false, Ordering::Release);
        if let Some(handle) = self.shared.worker.lock().take() {
            let _ = handle.join();
        }
    }

    pub fn connection_count(&self) -> usize {
        self.shared.inner.read().clients.len()
    }

    pub fn session_count(&self) -> usize {
        self.shared.inner.read().sessions.len()
    }

    pub fn retained_count(&self) -> usize {
        self.shared.inner.read().retained.len()
    }

    pub fn subscription_count(&self) -> usize {
        self.shared.inner.read().subscriptions.len()
    }
}

/// Drain the primary queue, sleeping briefly when idle
fn writer_loop(shared: Arc<AppShared>) {
    while shared.running.load(Ordering::Acquire) {
        while let Some(req) = shared.queue.pop() {
            execute(&shared, req);
        }
        std::thread::sleep(Duration::from_millis(1));
    }
}

/// Execute one request under the write lock, then drain the internal queue
/// before releasing the guard
fn execute(shared: &Arc<AppShared>, req: ChangeRequest) {
    let mut inner = shared.inner.write();
    apply(shared, &mut inner, req);
    while let Some(follow_up) = inner.internal.pop_front() {
        apply(shared, &mut inner, follow_up);
    }
}

fn apply(shared: &Arc<AppShared>, inner: &mut StateInner, req: ChangeRequest) {
    match req {
        ChangeRequest::Subscribe {
            subscriber,
            filter,
            qos,
        } => apply_subscribe(shared, inner, subscriber, filter, qos),
        ChangeRequest::Unsubscribe { subscriber, filter } => {
            apply_unsubscribe(inner, subscriber, &filter)
        }
        ChangeRequest::Publish {
            topic,
            payload,
            qos,
            retain,
        } => apply_publish(shared, inner, topic, payload, qos, retain),
        ChangeRequest::Retain {
            topic,
            payload,
            qos,
        } => inner.retained.set(topic, payload, qos),
        ChangeRequest::Login {
            connection,
            client_id,
            clean_session,
        } => apply_login(shared, inner, connection, client_id, clean_session),
        ChangeRequest::Disconnect { connection } => {
            if let Some(conn) = inner.clients.get(&connection).cloned() {
                logout(shared, inner, &conn);
            }
        }
        ChangeRequest::AddScript { name, ctor, status } => {
            let ctor = ctor.into_inner().expect("ctor present");
            let status = status.into_inner().expect("status present");
            apply_add_script(inner, name, ctor, status)
        }
        ChangeRequest::RemoveScript { name } => apply_remove_script(inner, &name),
        ChangeRequest::Cleanup => apply_cleanup(shared, inner),
    }
}

fn apply_subscribe(
    shared: &Arc<AppShared>,
    inner: &mut StateInner,
    subscriber: Subscriber,
    filter: String,
    qos: Option<QoS>,
) {
    inner
        .subscriptions
        .insert(subscriber.clone(), filter.clone(), qos);

    replay_retained(shared, inner, &subscriber, &filter, qos);

    // mirror into the persistent session so the subscription survives
    // reconnects
    if let Subscriber::Connection(id) = &subscriber {
        if let Some(conn) = inner.clients.get(id) {
            if let Some(session) = conn.session() {
                let mut state = session.lock();
                if !state.clean_session {
                    state.store_subscription(&filter, qos.unwrap_or(QoS::AtMostOnce));
                }
            }
        }
    }
}

/// Deliver matching retained messages to a freshly inserted subscription
fn replay_retained(
    shared: &Arc<AppShared>,
    inner: &StateInner,
    subscriber: &Subscriber,
    filter: &str,
    qos: Option<QoS>,
) {
    use crate::topic::{filter_matches, split_levels, FilterKind};

    match FilterKind::classify(filter) {
        FilterKind::Simple => {
            if let Some(msg) = inner.retained.get(filter) {
                deliver_retained(shared, inner, subscriber, filter, msg, qos);
            }
        }
        FilterKind::Wildcard => {
            let levels = split_levels(filter);
            for (topic, msg) in inner.retained.iter() {
                if filter_matches(&levels, topic) {
                    deliver_retained(shared, inner, subscriber, topic, msg, qos);
                }
            }
        }
        FilterKind::Omni => {
            for (topic, msg) in inner.retained.iter() {
                if !topic.starts_with('$') {
                    deliver_retained(shared, inner, subscriber, topic, msg, qos);
                }
            }
        }
    }
}

fn deliver_retained(
    shared: &Arc<AppShared>,
    inner: &StateInner,
    subscriber: &Subscriber,
    topic: &str,
    msg: &crate::broker::retained::RetainedMessage,
    qos: Option<QoS>,
) {
    match subscriber {
        Subscriber::Connection(id) => {
            if let Some(conn) = inner.clients.get(id) {
                conn.publish(
                    topic,
                    &msg.payload,
                    msg.qos,
                    qos.unwrap_or(QoS::AtMostOnce),
                    true,
                );
            }
        }
        Subscriber::Script(name) => {
            let input = ScriptRunInput {
                topic: topic.to_string(),
                payload: msg.payload.clone(),
                retained: true,
            };
            // replay cannot be vetoed, so never block on the script
            run_script(shared, inner, name, input, false);
        }
    }
}

fn apply_unsubscribe(inner: &mut StateInner, subscriber: Subscriber, filter: &str) {
    inner.subscriptions.remove(&subscriber, filter);

    if let Subscriber::Connection(id) = &subscriber {
        if let Some(conn) = inner.clients.get(id) {
            if let Some(session) = conn.session() {
                let mut state = session.lock();
                if !state.clean_session {
                    state.remove_subscription(filter);
                }
            }
        }
    }
}

fn apply_publish(
    shared: &Arc<AppShared>,
    inner: &mut StateInner,
    topic: String,
    payload: Bytes,
    qos: QoS,
    retain: bool,
) {
    debug!(topic = %topic, qos = ?qos, retain, "publish");

    let mut script_targets: SmallVec<[String; 4]> = SmallVec::new();
    let mut conn_targets: SmallVec<[(ConnectionId, QoS); 16]> = SmallVec::new();

    for sub in inner.subscriptions.matches(&topic) {
        match &sub.subscriber {
            Subscriber::Script(name) => script_targets.push(name.clone()),
            Subscriber::Connection(id) => {
                let Some(granted) = sub.qos else { continue };
                conn_targets.push((*id, granted));
            }
        }
    }

    // scripts run first so any of them can abort delivery to connections
    let mut action = SyncAction::Continue;
    for name in &script_targets {
        let input = ScriptRunInput {
            topic: topic.clone(),
            payload: payload.clone(),
            retained: false,
        };
        if run_script(shared, inner, name, input, true) == SyncAction::AbortPublish {
            action = SyncAction::AbortPublish;
        }
    }
    if action == SyncAction::AbortPublish {
        debug!(topic = %topic, "publish aborted by script");
        return;
    }

    for (id, granted) in conn_targets {
        if let Some(conn) = inner.clients.get(&id) {
            conn.publish(&topic, &payload, qos, granted, false);
        }
    }

    if retain {
        inner.internal.push_back(ChangeRequest::Retain {
            topic,
            payload,
            qos,
        });
    }
}

fn apply_login(
    shared: &Arc<AppShared>,
    inner: &mut StateInner,
    conn: Arc<ClientConnection>,
    client_id: String,
    clean_session: bool,
) {
    let mut client_id = client_id;
    if client_id.is_empty() {
        // the handler already enforced clean_session for empty ids;
        // synthesize a unique one from the remote endpoint
        let base = format!("{}:{}", conn.addr().ip(), conn.addr().port());
        client_id = base.clone();
        while inner.sessions.contains(&client_id) {
            client_id = format!("{}-{}", base, Uuid::new_v4().simple());
        }
    }

    let mut session_present = false;

    if let Some(existing) = inner.sessions.get(&client_id).cloned() {
        let (bound_connection, existing_clean) = {
            let state = existing.lock();
            (state.current_connection, state.clean_session)
        };

        // depose the previous holder of this client id
        if let Some(old_id) = bound_connection {
            if let Some(old_conn) = inner.clients.get(&old_id).cloned() {
                warn!(client_id = %client_id, "already logged in, closing old connection");
                logout(shared, inner, &old_conn);
            }
        }

        if clean_session || existing_clean {
            let session = inner.sessions.insert(client_id.clone(), clean_session);
            session.lock().current_connection = Some(conn.id());
            conn.set_session(session);
        } else {
            session_present = true;
            {
                let mut state = existing.lock();
                state.current_connection = Some(conn.id());
                state.last_disconnect = None;
            }
            conn.set_session(existing.clone());

            // re-enter the stored subscriptions through the internal queue
            // so retained messages replay; CONNACK below is enqueued first
            let stored = existing.lock().subscriptions.clone();
            for sub in stored {
                inner.internal.push_back(ChangeRequest::Subscribe {
                    subscriber: Subscriber::Connection(conn.id()),
                    filter: sub.filter,
                    qos: Some(sub.qos),
                });
            }
        }
    } else {
        let session = inner.sessions.insert(client_id.clone(), clean_session);
        session.lock().current_connection = Some(conn.id());
        conn.set_session(session);
    }

    conn.set_client_id(&client_id);
    conn.set_state(ConnectionState::Connected);

    info!(client_id = %client_id, addr = %conn.addr(), "logged in");

    // only now is the session-present flag known
    conn.send_packet(&Packet::ConnAck(ConnAck {
        session_present,
        return_code: ConnectReturnCode::Accepted,
    }));
}

fn logout(shared: &Arc<AppShared>, inner: &mut StateInner, conn: &Arc<ClientConnection>) {
    if conn.state() == ConnectionState::LoggedOut {
        return;
    }

    // the will goes out before the client's own state is torn down
    if let Some(will) = conn.take_will() {
        apply_publish(
            shared,
            inner,
            will.topic,
            will.payload,
            will.qos,
            will.retain,
        );
    }

    inner
        .subscriptions
        .remove_subscriber(&Subscriber::Connection(conn.id()));

    if let Some(session) = conn.clear_session() {
        let destroy = {
            let mut state = session.lock();
            if state.clean_session {
                true
            } else {
                state.current_connection = None;
                state.last_disconnect = Some(Instant::now());
                false
            }
        };
        if destroy {
            inner.sessions.remove(session.client_id());
        }
    }

    conn.set_state(ConnectionState::LoggedOut);
    conn.send_queue().close();

    info!(client_id = %conn.client_id(), connection = %conn.id(), "logged out");
}

fn apply_add_script(
    inner: &mut StateInner,
    name: String,
    ctor: ScriptCtor,
    status: ScriptInitOutputs,
) {
    if inner.scripts.contains_key(&name) {
        apply_remove_script(inner, &name);
    }

    let mut script = ctor();

    // the init callbacks record the declared run type and forward to the
    // caller's status outputs
    let init_return: Arc<Mutex<Option<ScriptInitReturn>>> = Arc::new(Mutex::new(None));
    let cell = init_return.clone();
    let forward_success = status.success;
    let forward_error = status.error;
    let script_name = name.clone();
    script.init(ScriptInitOutputs {
        success: Box::new(move |ret| {
            *cell.lock() = Some(ret);
            forward_success(ret);
        }),
        error: Box::new(move |msg| {
            warn!(script = %script_name, "script init failed: {}", msg);
            forward_error(msg);
        }),
    });

    let run_type = match *init_return.lock() {
        Some(ret) => ret.run_type,
        None => ScriptRunType::Async,
    };

    info!(script = %name, run_type = ?run_type, "script registered");
    inner.scripts.insert(name, ScriptEntry { script, run_type });
}

fn apply_remove_script(inner: &mut StateInner, name: &str) {
    if let Some(entry) = inner.scripts.remove(name) {
        entry.script.force_quit();
        inner
            .subscriptions
            .remove_subscriber(&Subscriber::Script(name.to_string()));
        info!(script = %name, "script removed");
    }
}

/// Keep-alive sweep and reaping of logged-out connections
fn apply_cleanup(shared: &Arc<AppShared>, inner: &mut StateInner) {
    let now = Instant::now();

    let stale: Vec<Arc<ClientConnection>> = inner
        .clients
        .values()
        .filter(|conn| {
            if conn.state() == ConnectionState::LoggedOut {
                return false;
            }
            if conn.send_queue().has_send_error() {
                return true;
            }
            let keep_alive = conn.keep_alive_secs();
            keep_alive > 0
                && now.duration_since(conn.last_recv())
                    > Duration::from_secs(keep_alive as u64 * 2)
        })
        .cloned()
        .collect();

    for conn in stale {
        debug!(client_id = %conn.client_id(), connection = %conn.id(), "cleanup logout");
        logout(shared, inner, &conn);
    }

    inner
        .clients
        .retain(|_, conn| conn.state() != ConnectionState::LoggedOut);
}

/// Run a script for one publish. Blocks on the rendezvous only for Sync
/// scripts on the live dispatch path (`wait_sync`); retained replays and
/// Async scripts are fire-and-forget.
fn run_script(
    shared: &Arc<AppShared>,
    inner: &StateInner,
    name: &str,
    input: ScriptRunInput,
    wait_sync: bool,
) -> SyncAction {
    let Some(entry) = inner.scripts.get(name) else {
        return SyncAction::Continue;
    };

    let handle = AppState {
        shared: shared.clone(),
    };

    if entry.run_type == ScriptRunType::Sync && wait_sync {
        let rendezvous = SyncRendezvous::new();

        let action_cell = rendezvous.clone();
        let success_cell = rendezvous.clone();
        let error_cell = rendezvous.clone();
        let script_name = name.to_string();
        entry.script.run(
            input,
            ScriptRunOutputs {
                publish: publish_callback(handle.clone()),
                subscribe: subscribe_callback(handle.clone(), name.to_string()),
                unsubscribe: unsubscribe_callback(handle, name.to_string()),
                sync_action: Box::new(move |action| action_cell.set_action(action)),
                success: Box::new(move || success_cell.complete()),
                error: Box::new(move |msg| {
                    warn!(script = %script_name, "script failed: {}", msg);
                    error_cell.complete();
                }),
            },
        );

        let (action, completed) = rendezvous.wait(shared.sync_script_timeout);
        if !completed {
            warn!(script = %name, "script did not answer within deadline");
        }
        action
    } else {
        let script_name = name.to_string();
        entry.script.run(
            input,
            ScriptRunOutputs {
                publish: publish_callback(handle.clone()),
                subscribe: subscribe_callback(handle.clone(), name.to_string()),
                unsubscribe: unsubscribe_callback(handle, name.to_string()),
                sync_action: Box::new(|_| {}),
                success: Box::new(|| {}),
                error: Box::new(move |msg| {
                    warn!(script = %script_name, "script failed: {}", msg);
                }),
            },
        );
        SyncAction::Continue
    }
}

// The script-facing callbacks enqueue asynchronously: the writer may be
// holding the state lock when a script is invoked, so they must never
// acquire it themselves.

fn publish_callback(handle: AppState) -> Box<dyn Fn(String, Bytes, QoS, bool) + Send + Sync> {
    Box::new(move |topic, payload, qos, retain| {
        handle.request_change(
            ChangeRequest::Publish {
                topic,
                payload,
                qos,
                retain,
            },
            RequestMode::Async,
        );
    })
}

fn subscribe_callback(handle: AppState, name: String) -> Box<dyn Fn(String) + Send + Sync> {
    Box::new(move |filter| {
        handle.request_change(
            ChangeRequest::Subscribe {
                subscriber: Subscriber::Script(name.clone()),
                filter,
                qos: None,
            },
            RequestMode::Async,
        );
    })
}

fn unsubscribe_callback(handle: AppState, name: String) -> Box<dyn Fn(String) + Send + Sync> {
    Box::new(move |filter| {
        handle.request_change(
            ChangeRequest::Unsubscribe {
                subscriber: Subscriber::Script(name.clone()),
                filter,
            },
            RequestMode::Async,
        );
    })
}
