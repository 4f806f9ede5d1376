//! Per-plugin RPC peer.
//!
//! An [`RpcPeer`] is the broker-side endpoint of one plugin's frame
//! stream: it tracks the peer's lifecycle phase, exports the broker's
//! local interface to it, mirrors the interface the peer publishes, and
//! correlates outbound calls with their reply callbacks.
//!
//! The peer never executes user code; frames either address the exported
//! local interface or the reference store.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

use gantry_core::{Callable, Error, Result, RpcValue};

use crate::completer::{Completer, error_to_fault};
use crate::envelope::{DecodeContext, EncodeContext, decode, encode};
use crate::frame::{Frame, Packet};
use crate::interface::{LocalInterface, ProxyFactory, build_remote};
use crate::store::ReferenceStore;

/// Default window a caller waits for an unready peer before failing with
/// `PluginNotReady`.
pub const DEFAULT_READY_TIMEOUT: Duration = Duration::from_secs(10);

/// Default bound of the pending-call table.
pub const DEFAULT_MAX_IN_FLIGHT: usize = 4096;

/// Lifecycle phase of a peer, from the broker's view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerPhase {
    /// Connected, `initialized` frame not seen yet.
    PendingInit,
    /// Initialized, interface not published yet.
    AwaitingInterface,
    /// Interface handshake complete.
    Ready,
    /// Disconnect requested or kill in progress.
    Terminating,
    /// Torn down; pending calls rejected.
    Gone,
}

/// Lifecycle notifications surfaced to the connection layer.
pub trait PeerEvents: Send + Sync {
    /// The peer announced itself with its effective config.
    fn on_initialized(&self, _config: serde_json::Value) {}

    /// The peer asked for a graceful shutdown.
    fn on_disconnect_request(&self) {}

    /// The peer reported its shutdown outcome.
    fn on_disconnected(&self, _details: serde_json::Value) {}

    /// Log or progress record from the peer or its supervisor pipeline.
    fn on_log(&self, _details: serde_json::Value) {}
}

struct NoEvents;

impl PeerEvents for NoEvents {}

/// Broker-side endpoint of one plugin's frame stream.
pub struct RpcPeer {
    id: String,
    outbound: mpsc::Sender<Packet>,
    store: Arc<ReferenceStore>,
    local: RwLock<LocalInterface>,
    remote: RwLock<Option<RpcValue>>,
    plugin_interfaces: Mutex<HashMap<String, BTreeMap<String, Callable>>>,
    pending: Mutex<HashMap<u64, PendingCall>>,
    next_call_id: AtomicU64,
    max_in_flight: usize,
    phase_tx: watch::Sender<PeerPhase>,
    executing: Mutex<Option<Arc<Completer>>>,
    events: RwLock<Arc<dyn PeerEvents>>,
}

struct PendingCall {
    completer: Arc<Completer>,
    reference_ids: Vec<u64>,
}

impl RpcPeer {
    /// Creates a peer whose outbound packets are drained from the given
    /// channel by the connection layer.
    pub fn new(id: impl Into<String>, outbound: mpsc::Sender<Packet>) -> Arc<Self> {
        let (phase_tx, _) = watch::channel(PeerPhase::PendingInit);
        Arc::new(Self {
            id: id.into(),
            outbound,
            store: Arc::new(ReferenceStore::new()),
            local: RwLock::new(LocalInterface::new()),
            remote: RwLock::new(None),
            plugin_interfaces: Mutex::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
            next_call_id: AtomicU64::new(1),
            max_in_flight: DEFAULT_MAX_IN_FLIGHT,
            phase_tx,
            executing: Mutex::new(None),
            events: RwLock::new(Arc::new(NoEvents)),
        })
    }

    /// Plugin id this peer belongs to.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The peer's reference store.
    pub fn store(&self) -> &Arc<ReferenceStore> {
        &self.store
    }

    /// Installs the lifecycle event handler.
    pub fn set_events(&self, events: Arc<dyn PeerEvents>) {
        *self.events.write() = events;
    }

    /// Replaces the exported local interface.
    pub fn set_local_interface(&self, interface: LocalInterface) {
        *self.local.write() = interface;
    }

    /// Current lifecycle phase.
    pub fn phase(&self) -> PeerPhase {
        *self.phase_tx.borrow()
    }

    /// Snapshot of the mirrored remote interface, once published.
    pub fn remote_interface(&self) -> Option<RpcValue> {
        self.remote.read().clone()
    }

    fn set_phase(&self, phase: PeerPhase) {
        let _ = self.phase_tx.send(phase);
    }

    /// Waits until the peer is `Ready`; fails with `PluginNotReady` after
    /// the deadline or `PluginGone` on terminal phases.
    pub async fn wait_ready(&self, deadline: Duration) -> Result<()> {
        let mut rx = self.phase_tx.subscribe();
        let wait = async {
            loop {
                match *rx.borrow_and_update() {
                    PeerPhase::Ready => return Ok(()),
                    PeerPhase::Gone | PeerPhase::Terminating => {
                        return Err(Error::PluginGone(self.id.clone()));
                    }
                    _ => {}
                }
                if rx.changed().await.is_err() {
                    return Err(Error::PluginGone(self.id.clone()));
                }
            }
        };
        match tokio::time::timeout(deadline, wait).await {
            Ok(result) => result,
            Err(_) => Err(Error::PluginNotReady(self.id.clone())),
        }
    }

    /// Waits until the peer reaches `Gone`; returns false on timeout.
    pub async fn wait_gone(&self, deadline: Duration) -> bool {
        let mut rx = self.phase_tx.subscribe();
        let wait = async {
            loop {
                if *rx.borrow_and_update() == PeerPhase::Gone {
                    return;
                }
                if rx.changed().await.is_err() {
                    return;
                }
            }
        };
        tokio::time::timeout(deadline, wait).await.is_ok()
    }

    async fn send(&self, packet: Packet) -> Result<()> {
        self.outbound
            .send(packet)
            .await
            .map_err(|_| Error::PluginGone(format!("{}: channel closed", self.id)))
    }

    // -------------------------------------------------------------------------
    // Outbound calls
    // -------------------------------------------------------------------------

    /// Calls a named method on the remote peer and awaits its reply.
    pub async fn call_remote(
        self: &Arc<Self>,
        name: &str,
        plugin_id: Option<&str>,
        args: Vec<RpcValue>,
    ) -> Result<RpcValue> {
        self.call_remote_with_deadline(name, plugin_id, args, DEFAULT_READY_TIMEOUT)
            .await
    }

    /// Like [`call_remote`], with a caller-chosen readiness deadline.
    ///
    /// [`call_remote`]: RpcPeer::call_remote
    pub async fn call_remote_with_deadline(
        self: &Arc<Self>,
        name: &str,
        plugin_id: Option<&str>,
        args: Vec<RpcValue>,
        ready_deadline: Duration,
    ) -> Result<RpcValue> {
        self.wait_ready(ready_deadline).await?;
        let (frame, attachments, call_id, rx) =
            self.prepare_call(|args_value, promise| Frame::Method {
                name: name.to_string(),
                pid: plugin_id.map(String::from),
                args: args_value,
                promise: Some(promise),
            }, args)?;
        self.send(Packet::with_attachments(frame, attachments)).await?;
        self.await_reply(call_id, rx).await
    }

    /// Invokes an anonymous remote callback by its reference-store id on
    /// the remote side.
    pub async fn call_callback(
        self: &Arc<Self>,
        callback_id: u64,
        args: Vec<RpcValue>,
    ) -> Result<RpcValue> {
        let (frame, attachments, call_id, rx) =
            self.prepare_call(|args_value, promise| Frame::Callback {
                id: callback_id,
                args: args_value,
                promise: Some(promise),
            }, args)?;
        self.send(Packet::with_attachments(frame, attachments)).await?;
        self.await_reply(call_id, rx).await
    }

    /// Fires a remote callback without awaiting a reply (promise
    /// surfaces).
    pub async fn notify_callback(
        self: &Arc<Self>,
        callback_id: u64,
        args: Vec<RpcValue>,
    ) -> Result<()> {
        let (args_value, attachments) = {
            let local = self.local.read();
            let mut ctx = EncodeContext::new(&self.store).with_interface(&local);
            let args_value = encode(&RpcValue::List(args), &mut ctx);
            (args_value, ctx.attachments)
        };
        self.send(Packet::with_attachments(
            Frame::Callback {
                id: callback_id,
                args: args_value,
                promise: None,
            },
            attachments,
        ))
        .await
    }

    fn prepare_call(
        self: &Arc<Self>,
        build: impl FnOnce(serde_json::Value, serde_json::Value) -> Frame,
        args: Vec<RpcValue>,
    ) -> Result<(
        Frame,
        Vec<Vec<u8>>,
        u64,
        tokio::sync::oneshot::Receiver<Result<RpcValue>>,
    )> {
        let (args_value, attachments, mut reference_ids) = {
            let local = self.local.read();
            let mut ctx = EncodeContext::new(&self.store).with_interface(&local);
            let args_value = encode(&RpcValue::List(args), &mut ctx);
            for (pid, slots) in ctx.plugin_interfaces.drain(..) {
                self.plugin_interfaces.lock().insert(pid, slots);
            }
            (args_value, ctx.attachments, ctx.stored_ids)
        };

        {
            let pending = self.pending.lock();
            if pending.len() >= self.max_in_flight {
                // roll back parked callbacks before failing
                for id in &reference_ids {
                    let _ = self.store.dispose(*id);
                }
                return Err(Error::TooManyInFlight);
            }
        }

        let (completer, rx) = Completer::new();
        let (resolve, reject) = completer.surfaces();
        let resolve_id = self.store.put(resolve);
        let reject_id = self.store.put(reject);
        reference_ids.push(resolve_id);
        reference_ids.push(reject_id);
        let promise = serde_json::json!([
            { "__jailed_type__": "callback", "__value__": "f", "num": resolve_id },
            { "__jailed_type__": "callback", "__value__": "f", "num": reject_id },
        ]);

        let call_id = self.next_call_id.fetch_add(1, Ordering::SeqCst);
        self.pending.lock().insert(
            call_id,
            PendingCall {
                completer,
                reference_ids,
            },
        );
        Ok((build(args_value, promise), attachments, call_id, rx))
    }

    async fn await_reply(
        &self,
        call_id: u64,
        rx: tokio::sync::oneshot::Receiver<Result<RpcValue>>,
    ) -> Result<RpcValue> {
        let outcome = match rx.await {
            Ok(outcome) => outcome,
            Err(_) => Err(Error::PluginGone(self.id.clone())),
        };
        if let Some(call) = self.pending.lock().remove(&call_id) {
            for id in call.reference_ids {
                // the fired surface is already consumed; release the rest
                let _ = self.store.dispose(id);
            }
        }
        outcome
    }

    /// Rejects every pending call and drops the reference store; the peer
    /// is unusable afterwards.
    pub fn mark_gone(&self) {
        self.set_phase(PeerPhase::Gone);
        let pending: Vec<PendingCall> = self.pending.lock().drain().map(|(_, c)| c).collect();
        for call in &pending {
            call.completer.reject(Error::PluginGone(self.id.clone()));
        }
        if let Some(executing) = self.executing.lock().take() {
            executing.reject(Error::PluginGone(self.id.clone()));
        }
        self.store.clear();
        debug!(plugin = %self.id, rejected = pending.len(), "Peer marked gone");
    }

    /// Moves the peer into the terminating phase.
    pub fn begin_termination(&self) {
        self.set_phase(PeerPhase::Terminating);
    }

    // -------------------------------------------------------------------------
    // Handshake
    // -------------------------------------------------------------------------

    /// Publishes the local interface to the peer.
    pub async fn send_interface(&self) -> Result<()> {
        let api = self.local.read().publish();
        self.send(Packet::frame(Frame::SetInterface { api })).await
    }

    /// Asks the peer to publish its interface.
    pub async fn request_remote(&self) -> Result<()> {
        self.send(Packet::frame(Frame::GetInterface)).await
    }

    /// Sends a graceful shutdown request.
    pub async fn send_disconnect(&self) -> Result<()> {
        self.send(Packet::frame(Frame::Disconnect)).await
    }

    /// Runs a script in the peer; resolves on `executeSuccess`, fails on
    /// `executeFailure`. One script at a time.
    pub async fn execute(&self, code: serde_json::Value) -> Result<()> {
        let rx = {
            let mut executing = self.executing.lock();
            if executing.is_some() {
                return Err(Error::BadRequest("another script is executing".into()));
            }
            let (completer, rx) = Completer::new();
            *executing = Some(completer);
            rx
        };
        self.send(Packet::frame(Frame::Execute { code })).await?;
        match rx.await {
            Ok(outcome) => outcome.map(|_| ()),
            Err(_) => Err(Error::PluginGone(self.id.clone())),
        }
    }

    // -------------------------------------------------------------------------
    // Inbound dispatch
    // -------------------------------------------------------------------------

    /// Dispatches one inbound packet from the peer's channel.
    pub async fn handle_packet(self: &Arc<Self>, packet: Packet) -> Result<()> {
        let Some(frame) = packet.frame else {
            return Ok(());
        };
        match frame {
            Frame::Initialized { config, error } => {
                if let Some(error) = error {
                    warn!(plugin = %self.id, error = %error, "Peer failed to initialize");
                    self.mark_gone();
                    return Ok(());
                }
                self.set_phase(PeerPhase::AwaitingInterface);
                let events = Arc::clone(&*self.events.read());
                events.on_initialized(config);
            }
            Frame::GetInterface => {
                self.send_interface().await?;
            }
            Frame::SetInterface { api } => {
                let proxies = PeerProxies(Arc::downgrade(self));
                let remote = build_remote(&api, &proxies);
                *self.remote.write() = Some(remote);
                self.set_phase(PeerPhase::Ready);
                self.send(Packet::frame(Frame::InterfaceSetAsRemote)).await?;
                debug!(plugin = %self.id, entries = api.len(), "Mirrored peer interface");
            }
            Frame::InterfaceSetAsRemote => {
                debug!(plugin = %self.id, "Peer acknowledged our interface");
            }
            Frame::Method {
                name,
                pid,
                args,
                promise,
            } => {
                self.handle_invocation(
                    InvocationTarget::Named { name, pid },
                    args,
                    promise,
                    packet.attachments,
                )
                .await;
            }
            Frame::Callback { id, args, promise } => {
                self.handle_invocation(
                    InvocationTarget::Reference(id),
                    args,
                    promise,
                    packet.attachments,
                )
                .await;
            }
            Frame::Execute { .. } => {
                // the broker routes scripts to workers, it never runs them
                warn!(plugin = %self.id, "Refusing execute frame addressed to the broker");
                self.send(Packet::frame(Frame::ExecuteFailure {
                    error: "the broker does not execute scripts".into(),
                }))
                .await?;
            }
            Frame::ExecuteSuccess => {
                if let Some(completer) = self.executing.lock().take() {
                    completer.resolve(RpcValue::Null);
                }
            }
            Frame::ExecuteFailure { error } => {
                if let Some(completer) = self.executing.lock().take() {
                    completer.reject(Error::LaunchFailed(error));
                }
            }
            Frame::Disconnect => {
                self.set_phase(PeerPhase::Terminating);
                let events = Arc::clone(&*self.events.read());
                events.on_disconnect_request();
            }
            Frame::Disconnected { details } => {
                let events = Arc::clone(&*self.events.read());
                events.on_disconnected(details);
                self.mark_gone();
            }
            Frame::Logging { details } => {
                let events = Arc::clone(&*self.events.read());
                events.on_log(details);
            }
            Frame::Message { .. } => {
                debug!(plugin = %self.id, "Dropping unrouted message frame");
            }
        }
        Ok(())
    }

    async fn handle_invocation(
        self: &Arc<Self>,
        target: InvocationTarget,
        args: serde_json::Value,
        promise: Option<serde_json::Value>,
        attachments: Vec<Vec<u8>>,
    ) {
        let proxies = PeerProxies(Arc::downgrade(self));
        let ctx = DecodeContext::new(&proxies, &attachments);
        let promise_ctx = DecodeContext::new(&proxies, &attachments).without_reply();
        let (resolve, reject) = match promise.as_ref().map(|p| decode_promise(p, &promise_ctx)) {
            Some(Ok(pair)) => (Some(pair.0), Some(pair.1)),
            Some(Err(e)) => {
                warn!(plugin = %self.id, error = %e, "Dropping call with malformed promise");
                return;
            }
            None => (None, None),
        };

        let outcome = self.resolve_target(&target).and_then(|callable| {
            let decoded = decode(&args, &ctx)?;
            let args = match decoded {
                RpcValue::List(items) => items,
                RpcValue::Null => Vec::new(),
                other => vec![other],
            };
            Ok((callable, args))
        });

        let peer_id = self.id.clone();
        match outcome {
            Ok((callable, args)) => {
                tokio::spawn(async move {
                    let result = callable.call(args).await;
                    deliver_outcome(&peer_id, result, resolve, reject).await;
                });
            }
            Err(error) => {
                warn!(plugin = %peer_id, error = %error, "Invocation failed before dispatch");
                tokio::spawn(async move {
                    deliver_outcome(&peer_id, Err(error), resolve, reject).await;
                });
            }
        }
    }

    fn resolve_target(&self, target: &InvocationTarget) -> Result<Callable> {
        match target {
            InvocationTarget::Named { name, pid: None } => {
                self.local.read().get_callable(name)
            }
            InvocationTarget::Named {
                name,
                pid: Some(pid),
            } => self
                .plugin_interfaces
                .lock()
                .get(pid)
                .and_then(|slots| slots.get(name).cloned())
                .ok_or_else(|| Error::NotFound(format!("plugin interface {pid}/{name}"))),
            InvocationTarget::Reference(id) => self.store.fetch(*id),
        }
    }
}

enum InvocationTarget {
    Named { name: String, pid: Option<String> },
    Reference(u64),
}

fn decode_promise(
    promise: &serde_json::Value,
    ctx: &DecodeContext<'_>,
) -> Result<(Callable, Callable)> {
    let decoded = decode(promise, ctx)?;
    let items = decoded
        .as_list()
        .ok_or_else(|| Error::BadRequest("promise must be a [resolve, reject] pair".into()))?;
    match items {
        [RpcValue::Callable(resolve), RpcValue::Callable(reject)] => {
            Ok((resolve.clone(), reject.clone()))
        }
        _ => Err(Error::BadRequest(
            "promise must be a [resolve, reject] pair".into(),
        )),
    }
}

async fn deliver_outcome(
    peer_id: &str,
    result: Result<RpcValue>,
    resolve: Option<Callable>,
    reject: Option<Callable>,
) {
    match result {
        Ok(value) => {
            if let Some(resolve) = resolve
                && let Err(e) = resolve.call(vec![value]).await
            {
                debug!(plugin = %peer_id, error = %e, "Failed to deliver resolution");
            }
        }
        Err(error) => {
            warn!(plugin = %peer_id, error = %error, "Invocation failed");
            if let Some(reject) = reject
                && let Err(e) = reject
                    .call(vec![RpcValue::Fault(error_to_fault(&error))])
                    .await
            {
                debug!(plugin = %peer_id, error = %e, "Failed to deliver rejection");
            }
        }
    }
}

impl std::fmt::Debug for RpcPeer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcPeer")
            .field("id", &self.id)
            .field("phase", &self.phase())
            .field("pending", &self.pending.lock().len())
            .finish()
    }
}

/// Proxy factory backed by a weak peer handle; proxies outlive the peer
/// gracefully by failing with `PluginGone`.
pub struct PeerProxies(pub Weak<RpcPeer>);

impl ProxyFactory for PeerProxies {
    fn remote_method(&self, name: &str, plugin_id: Option<&str>) -> Callable {
        let weak = self.0.clone();
        let name = name.to_string();
        let plugin_id = plugin_id.map(String::from);
        Callable::named(name.clone(), move |args| {
            let weak = weak.clone();
            let name = name.clone();
            let plugin_id = plugin_id.clone();
            Box::pin(async move {
                let peer = weak
                    .upgrade()
                    .ok_or_else(|| Error::PluginGone(name.clone()))?;
                peer.call_remote(&name, plugin_id.as_deref(), args).await
            })
        })
    }

    fn remote_callback(&self, id: u64, with_reply: bool) -> Callable {
        let weak = self.0.clone();
        Callable::new(move |args| {
            let weak = weak.clone();
            Box::pin(async move {
                let peer = weak
                    .upgrade()
                    .ok_or_else(|| Error::PluginGone(format!("callback {id}")))?;
                if with_reply {
                    peer.call_callback(id, args).await
                } else {
                    peer.notify_callback(id, args).await?;
                    Ok(RpcValue::Null)
                }
            })
        })
    }
}

/// Bundles keyword arguments into the single positional argument the
/// protocol transports them as.
pub fn kwargs<I, K>(pairs: I) -> Vec<RpcValue>
where
    I: IntoIterator<Item = (K, RpcValue)>,
    K: Into<String>,
{
    vec![RpcValue::map(pairs)]
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Wires two peers back to back, pumping each outbound queue into the
    /// other's dispatcher.
    fn link() -> (Arc<RpcPeer>, Arc<RpcPeer>) {
        let (tx_a, mut rx_a) = mpsc::channel::<Packet>(64);
        let (tx_b, mut rx_b) = mpsc::channel::<Packet>(64);
        let peer_a = RpcPeer::new("peer-a", tx_a);
        let peer_b = RpcPeer::new("peer-b", tx_b);

        let b = Arc::clone(&peer_b);
        tokio::spawn(async move {
            while let Some(packet) = rx_a.recv().await {
                let _ = b.handle_packet(packet).await;
            }
        });
        let a = Arc::clone(&peer_a);
        tokio::spawn(async move {
            while let Some(packet) = rx_b.recv().await {
                let _ = a.handle_packet(packet).await;
            }
        });
        (peer_a, peer_b)
    }

    fn echo_interface() -> LocalInterface {
        let mut interface = LocalInterface::new();
        interface.register_fn(
            "echo",
            Callable::named("echo", |args| {
                Box::pin(async move { Ok(args.into_iter().next().unwrap_or_default()) })
            }),
        );
        interface.register_fn(
            "fail",
            Callable::named("fail", |_| {
                Box::pin(async { Err(Error::NotFound("nothing here".into())) })
            }),
        );
        interface
    }

    async fn handshake(caller: &Arc<RpcPeer>, callee: &Arc<RpcPeer>) {
        callee.set_local_interface(echo_interface());
        // drive the callee through the broker-side state machine
        callee
            .handle_packet(Packet::frame(Frame::Initialized {
                config: serde_json::json!({}),
                error: None,
            }))
            .await
            .unwrap();
        caller.request_remote().await.unwrap();
        caller.wait_ready(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test]
    async fn remote_echo_round_trip() {
        let (caller, callee) = link();
        handshake(&caller, &callee).await;

        let remote = caller.remote_interface().unwrap();
        let echo = remote.get("echo").unwrap().as_callable().unwrap().clone();
        let out = echo.call(vec![RpcValue::from("hi")]).await.unwrap();
        assert_eq!(out, RpcValue::from("hi"));
    }

    #[tokio::test]
    async fn remote_error_preserves_kind() {
        let (caller, callee) = link();
        handshake(&caller, &callee).await;

        let err = caller
            .call_remote("fail", None, Vec::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "NotFound");
    }

    #[tokio::test]
    async fn unready_peer_times_out_with_plugin_not_ready() {
        let (tx, _rx) = mpsc::channel(8);
        let peer = RpcPeer::new("slow", tx);
        let err = peer
            .call_remote_with_deadline("echo", None, Vec::new(), Duration::from_millis(50))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "PluginNotReady");
    }

    #[tokio::test]
    async fn pending_calls_rejected_when_peer_goes_away() {
        let (caller, callee) = link();
        handshake(&caller, &callee).await;

        // export a function on the callee that never answers
        let mut silent = LocalInterface::new();
        silent.register_fn(
            "hang",
            Callable::named("hang", |_| {
                Box::pin(async {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    Ok(RpcValue::Null)
                })
            }),
        );
        callee.set_local_interface(silent);

        let in_flight = {
            let caller = Arc::clone(&caller);
            tokio::spawn(async move { caller.call_remote("hang", None, Vec::new()).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        caller.mark_gone();
        let err = in_flight.await.unwrap().unwrap_err();
        assert_eq!(err.kind(), "PluginGone");
    }

    #[tokio::test]
    async fn callback_argument_can_be_invoked_once() {
        let (caller, callee) = link();
        handshake(&caller, &callee).await;

        // export a function that calls the callback it receives
        let mut iface = echo_interface();
        iface.register_fn(
            "apply",
            Callable::named("apply", |args| {
                Box::pin(async move {
                    let callback = args[0].as_callable().cloned().ok_or_else(|| {
                        Error::BadRequest("expected a callback".into())
                    })?;
                    callback.call(vec![RpcValue::Int(21)]).await
                })
            }),
        );
        callee.set_local_interface(iface);

        let double = Callable::new(|args| {
            Box::pin(async move {
                let n = args[0].as_int().unwrap_or(0);
                Ok(RpcValue::Int(n * 2))
            })
        });
        let out = caller
            .call_remote("apply", None, vec![RpcValue::Callable(double)])
            .await
            .unwrap();
        assert_eq!(out, RpcValue::Int(42));
    }
}
