//! Client-side call state machine.
//!
//! A [`CallAgent`] task exclusively owns the current call session. User
//! actions, inbound signaling, channel events and media acquisition results
//! all arrive on one queue and are handled to completion one at a time;
//! negotiation operations are awaited inline.
//!
//! Media acquisition runs in its own task and re-enters the queue tagged
//! with the session epoch, so a capture that completes after the call it
//! was acquired for has ended is released instead of resurrecting it.

use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};

use parley_shared::constants::ICE_SERVERS;
use parley_shared::protocol::{
    CallInvite, CallSignal, ClientEvent, HangUpSignal, IceCandidate, IceSignal, SdpSignal,
    SessionDescription,
};
use parley_shared::types::IdentityId;

use crate::backend::{
    ChannelEvent, ChannelState, LocalCapture, MediaBackend, MediaError, NegotiationChannel,
    NegotiationError,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    Idle,
    Calling,
    Receiving,
    InCall,
}

/// Things the user interface should hear about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallNotice {
    IncomingCall {
        from: IdentityId,
        caller_name: String,
    },
    RemoteAudio {
        from: IdentityId,
    },
    MediaFailed(String),
    NegotiationFailed(String),
    /// A call from `from` was turned away because another call is active.
    Busy {
        from: IdentityId,
    },
    Ended {
        peer: IdentityId,
    },
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CallError {
    #[error("Another call is already in progress")]
    Busy,

    #[error("No incoming call to answer")]
    NotRinging,

    #[error("Call agent has stopped")]
    AgentGone,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Caller,
    Callee,
}

type Reply = oneshot::Sender<Result<(), CallError>>;

enum Input<B: MediaBackend> {
    Initiate {
        peer: IdentityId,
        caller_name: String,
        reply: Reply,
    },
    Accept {
        reply: Reply,
    },
    Reject {
        reply: Reply,
    },
    End,
    Signal(CallSignal),
    Channel {
        epoch: u64,
        event: ChannelEvent,
    },
    MediaReady {
        epoch: u64,
        result: Result<B::Capture, MediaError>,
    },
}

struct Session<B: MediaBackend> {
    epoch: u64,
    peer: IdentityId,
    role: Role,
    caller_name: Option<String>,
    capture: Option<B::Capture>,
    channel: Option<B::Channel>,
    /// Offer that arrived before the channel existed; latest wins.
    pending_offer: Option<SessionDescription>,
}

/// Cloneable front end to a running [`CallAgent`].
pub struct CallHandle<B: MediaBackend> {
    inbox: mpsc::UnboundedSender<Input<B>>,
    state: watch::Receiver<CallState>,
}

impl<B: MediaBackend> Clone for CallHandle<B> {
    fn clone(&self) -> Self {
        Self {
            inbox: self.inbox.clone(),
            state: self.state.clone(),
        }
    }
}

impl<B: MediaBackend> CallHandle<B> {
    /// Ring `peer`. Fails with [`CallError::Busy`] unless idle.
    pub async fn initiate_call(
        &self,
        peer: IdentityId,
        caller_name: impl Into<String>,
    ) -> Result<(), CallError> {
        let caller_name = caller_name.into();
        self.request(|reply| Input::Initiate {
            peer,
            caller_name,
            reply,
        })
        .await
    }

    pub async fn accept_call(&self) -> Result<(), CallError> {
        self.request(|reply| Input::Accept { reply }).await
    }

    pub async fn reject_call(&self) -> Result<(), CallError> {
        self.request(|reply| Input::Reject { reply }).await
    }

    /// Hang up whatever call is active. No-op when idle.
    pub fn end_call(&self) {
        let _ = self.inbox.send(Input::End);
    }

    /// Feed an inbound signaling event from the relay.
    pub fn handle_signal(&self, signal: CallSignal) {
        let _ = self.inbox.send(Input::Signal(signal));
    }

    pub fn state(&self) -> CallState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<CallState> {
        self.state.clone()
    }

    async fn request(&self, make: impl FnOnce(Reply) -> Input<B>) -> Result<(), CallError> {
        let (tx, rx) = oneshot::channel();
        self.inbox
            .send(make(tx))
            .map_err(|_| CallError::AgentGone)?;
        rx.await.map_err(|_| CallError::AgentGone)?
    }
}

pub struct CallAgent<B: MediaBackend> {
    local_id: IdentityId,
    backend: Arc<B>,
    signals: mpsc::Sender<ClientEvent>,
    notices: mpsc::UnboundedSender<CallNotice>,
    state: watch::Sender<CallState>,
    /// Re-entry point for spawned work; weak so the agent stops once every
    /// handle is dropped.
    inbox: mpsc::WeakUnboundedSender<Input<B>>,
    ice_servers: Vec<String>,
    session: Option<Session<B>>,
    next_epoch: u64,
}

impl<B: MediaBackend> CallAgent<B> {
    /// Start an agent using the default ICE servers.
    pub fn spawn(
        local_id: IdentityId,
        backend: Arc<B>,
        signals: mpsc::Sender<ClientEvent>,
    ) -> (CallHandle<B>, mpsc::UnboundedReceiver<CallNotice>) {
        let ice_servers = ICE_SERVERS.iter().map(|s| s.to_string()).collect();
        Self::spawn_with_ice_servers(local_id, backend, signals, ice_servers)
    }

    pub fn spawn_with_ice_servers(
        local_id: IdentityId,
        backend: Arc<B>,
        signals: mpsc::Sender<ClientEvent>,
        ice_servers: Vec<String>,
    ) -> (CallHandle<B>, mpsc::UnboundedReceiver<CallNotice>) {
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        let (notice_tx, notice_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(CallState::Idle);

        let agent = CallAgent {
            local_id,
            backend,
            signals,
            notices: notice_tx,
            state: state_tx,
            inbox: inbox_tx.downgrade(),
            ice_servers,
            session: None,
            next_epoch: 0,
        };
        tokio::spawn(agent.run(inbox_rx));

        (
            CallHandle {
                inbox: inbox_tx,
                state: state_rx,
            },
            notice_rx,
        )
    }

    async fn run(mut self, mut inbox: mpsc::UnboundedReceiver<Input<B>>) {
        debug!(local = %self.local_id, "Call agent started");
        while let Some(input) = inbox.recv().await {
            self.handle(input).await;
        }
        self.teardown(true).await;
        debug!(local = %self.local_id, "Call agent stopped");
    }

    async fn handle(&mut self, input: Input<B>) {
        match input {
            Input::Initiate {
                peer,
                caller_name,
                reply,
            } => {
                let result = self.initiate(peer, caller_name).await;
                let _ = reply.send(result);
            }
            Input::Accept { reply } => {
                let _ = reply.send(self.accept());
            }
            Input::Reject { reply } => {
                let result = self.reject().await;
                let _ = reply.send(result);
            }
            Input::End => {
                if self.session.is_some() {
                    info!("Ending call");
                    self.teardown(true).await;
                }
            }
            Input::Signal(signal) => self.on_signal(signal).await,
            Input::Channel { epoch, event } => self.on_channel_event(epoch, event).await,
            Input::MediaReady { epoch, result } => self.on_media_ready(epoch, result).await,
        }
    }

    // -----------------------------------------------------------------------
    // User actions
    // -----------------------------------------------------------------------

    async fn initiate(&mut self, peer: IdentityId, caller_name: String) -> Result<(), CallError> {
        if let Some(session) = &self.session {
            warn!(peer = %peer, busy_with = %session.peer, "Call already in progress");
            return Err(CallError::Busy);
        }

        info!(peer = %peer, "Placing call");
        let epoch = self.begin_session(peer.clone(), Role::Caller, None);
        self.set_state(CallState::Calling);
        self.emit(ClientEvent::CallUser(CallInvite {
            recipient_id: peer,
            caller_name,
        }))
        .await;
        self.acquire_media(epoch);
        Ok(())
    }

    fn accept(&mut self) -> Result<(), CallError> {
        if self.current_state() != CallState::Receiving {
            return Err(CallError::NotRinging);
        }
        let Some(session) = &self.session else {
            return Err(CallError::NotRinging);
        };

        info!(peer = %session.peer, "Accepting call");
        let epoch = session.epoch;
        self.set_state(CallState::InCall);
        self.acquire_media(epoch);
        Ok(())
    }

    async fn reject(&mut self) -> Result<(), CallError> {
        if self.current_state() != CallState::Receiving {
            return Err(CallError::NotRinging);
        }
        info!("Rejecting call");
        self.teardown(false).await;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Inbound signaling
    // -----------------------------------------------------------------------

    async fn on_signal(&mut self, signal: CallSignal) {
        match signal {
            CallSignal::IncomingCall { from, caller_name } => {
                self.on_incoming_call(from, caller_name).await
            }
            CallSignal::Offer { sdp, caller } => self.on_offer(sdp, caller).await,
            CallSignal::Answer { sdp, callee } => self.on_answer(sdp, callee).await,
            CallSignal::IceCandidate { candidate, from } => {
                self.on_remote_candidate(candidate, from).await
            }
            CallSignal::HangUp => {
                if self.session.is_some() {
                    info!("Remote hung up");
                    // No hang-up goes back. A busy reply is itself a
                    // hang-up and carries no sender, so echoing one could
                    // end the caller's unrelated call.
                    self.teardown(false).await;
                } else {
                    debug!("Hang-up while idle ignored");
                }
            }
        }
    }

    async fn on_incoming_call(&mut self, from: IdentityId, caller_name: String) {
        let state = self.current_state();
        if let Some(session) = self.session.as_mut() {
            if session.peer == from && state == CallState::Receiving {
                debug!(from = %from, "Caller metadata refreshed");
                session.caller_name = Some(caller_name.clone());
                self.notify(CallNotice::IncomingCall { from, caller_name });
                return;
            }

            warn!(from = %from, busy_with = %session.peer, "Rejecting call while busy");
            self.notify(CallNotice::Busy { from: from.clone() });
            self.emit(ClientEvent::HangUp(HangUpSignal { target: from }))
                .await;
            return;
        }

        info!(from = %from, caller_name = %caller_name, "Incoming call");
        self.begin_session(from.clone(), Role::Callee, Some(caller_name.clone()));
        self.set_state(CallState::Receiving);
        self.notify(CallNotice::IncomingCall { from, caller_name });
    }

    async fn on_offer(&mut self, sdp: SessionDescription, caller: IdentityId) {
        let Some(session) = self.session.as_mut() else {
            warn!(caller = %caller, "Offer without a call dropped");
            return;
        };
        if session.peer != caller {
            warn!(caller = %caller, peer = %session.peer, "Offer from another peer dropped");
            return;
        }
        if session.channel.is_none() {
            debug!(caller = %caller, "Buffering offer until the channel exists");
            session.pending_offer = Some(sdp);
            return;
        }
        self.answer_offer(sdp).await;
    }

    async fn on_answer(&mut self, sdp: SessionDescription, callee: IdentityId) {
        if self.current_state() != CallState::Calling {
            debug!(callee = %callee, "Answer outside of an outgoing call ignored");
            return;
        }
        let Some(session) = &self.session else {
            return;
        };
        if session.peer != callee {
            warn!(callee = %callee, peer = %session.peer, "Answer from another peer dropped");
            return;
        }
        let Some(channel) = &session.channel else {
            warn!(callee = %callee, "Answer before our offer dropped");
            return;
        };

        let result = channel.apply_answer(sdp).await;
        match result {
            Ok(()) => {
                info!(peer = %callee, "Call answered");
                self.set_state(CallState::InCall);
            }
            Err(e) => self.negotiation_failed(e).await,
        }
    }

    async fn on_remote_candidate(&mut self, candidate: IceCandidate, from: IdentityId) {
        let channel = self
            .session
            .as_ref()
            .filter(|s| s.peer == from)
            .and_then(|s| s.channel.as_ref());
        let Some(channel) = channel else {
            debug!(from = %from, "ICE candidate without a channel dropped");
            return;
        };
        if let Err(e) = channel.add_ice_candidate(candidate).await {
            warn!(from = %from, error = %e, "Failed to apply remote candidate");
        }
    }

    // -----------------------------------------------------------------------
    // Media and channel
    // -----------------------------------------------------------------------

    fn acquire_media(&self, epoch: u64) {
        let Some(inbox) = self.inbox.upgrade() else {
            return;
        };
        let backend = self.backend.clone();
        tokio::spawn(async move {
            let result = backend.acquire_audio().await;
            if let Err(mpsc::error::SendError(Input::MediaReady {
                result: Ok(mut capture),
                ..
            })) = inbox.send(Input::MediaReady { epoch, result })
            {
                capture.stop();
            }
        });
    }

    async fn on_media_ready(&mut self, epoch: u64, result: Result<B::Capture, MediaError>) {
        let state = self.current_state();
        let session = self.session.as_mut().filter(|s| {
            let expected = match s.role {
                Role::Caller => CallState::Calling,
                Role::Callee => CallState::InCall,
            };
            s.epoch == epoch && state == expected
        });
        let Some(session) = session else {
            if let Ok(mut capture) = result {
                debug!(epoch, "Releasing capture acquired for an ended call");
                capture.stop();
            }
            return;
        };

        match result {
            Ok(capture) => session.capture = Some(capture),
            Err(e) => {
                warn!(error = %e, "Audio capture failed");
                self.notify(CallNotice::MediaFailed(e.to_string()));
                self.teardown(true).await;
                return;
            }
        }

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let opened = self.backend.open_channel(&self.ice_servers, events_tx).await;
        let channel = match opened {
            Ok(channel) => channel,
            Err(e) => {
                self.negotiation_failed(e).await;
                return;
            }
        };
        self.forward_channel_events(epoch, events_rx);

        let attached = match self.session.as_ref().and_then(|s| s.capture.as_ref()) {
            Some(capture) => channel.attach_local(capture).await,
            None => Err(NegotiationError::Closed),
        };
        if let Err(e) = attached {
            channel.close().await;
            self.negotiation_failed(e).await;
            return;
        }

        let Some(session) = self.session.as_mut() else {
            channel.close().await;
            return;
        };
        session.channel = Some(channel);
        let peer = session.peer.clone();
        let role = session.role;
        let pending = session.pending_offer.take();

        match role {
            Role::Caller => self.send_offer(peer).await,
            Role::Callee => {
                if let Some(offer) = pending {
                    debug!(peer = %peer, "Applying buffered offer");
                    self.answer_offer(offer).await;
                }
            }
        }
    }

    fn forward_channel_events(&self, epoch: u64, mut events: mpsc::UnboundedReceiver<ChannelEvent>) {
        let inbox = self.inbox.clone();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let Some(inbox) = inbox.upgrade() else {
                    break;
                };
                if inbox.send(Input::Channel { epoch, event }).is_err() {
                    break;
                }
            }
        });
    }

    async fn on_channel_event(&mut self, epoch: u64, event: ChannelEvent) {
        let Some(session) = self.session.as_ref().filter(|s| s.epoch == epoch) else {
            debug!(epoch, ?event, "Stale channel event ignored");
            return;
        };
        let peer = session.peer.clone();

        match event {
            ChannelEvent::LocalCandidate(candidate) => {
                self.emit(ClientEvent::IceCandidate(IceSignal {
                    candidate,
                    target: peer,
                }))
                .await;
            }
            ChannelEvent::RemoteTrack => {
                info!(peer = %peer, "Remote audio available");
                self.notify(CallNotice::RemoteAudio { from: peer });
            }
            ChannelEvent::StateChanged(state) if state.is_terminal() => {
                warn!(peer = %peer, ?state, "Negotiation channel ended");
                if state == ChannelState::Failed {
                    self.notify(CallNotice::NegotiationFailed("connection failed".into()));
                }
                self.teardown(true).await;
            }
            ChannelEvent::StateChanged(state) => {
                debug!(peer = %peer, ?state, "Negotiation channel state");
            }
        }
    }

    async fn send_offer(&mut self, peer: IdentityId) {
        let Some(channel) = self.session.as_ref().and_then(|s| s.channel.as_ref()) else {
            return;
        };
        let result = channel.create_offer().await;
        match result {
            Ok(offer) => {
                self.emit(ClientEvent::Offer(SdpSignal {
                    sdp: offer,
                    target: peer,
                }))
                .await
            }
            Err(e) => self.negotiation_failed(e).await,
        }
    }

    async fn answer_offer(&mut self, offer: SessionDescription) {
        let Some(session) = &self.session else {
            return;
        };
        let Some(channel) = &session.channel else {
            return;
        };
        let peer = session.peer.clone();

        let result = channel.accept_offer(offer).await;
        match result {
            Ok(answer) => {
                self.emit(ClientEvent::Answer(SdpSignal {
                    sdp: answer,
                    target: peer.clone(),
                }))
                .await;
                info!(peer = %peer, "Answered offer");
                self.set_state(CallState::InCall);
            }
            Err(e) => self.negotiation_failed(e).await,
        }
    }

    async fn negotiation_failed(&mut self, error: NegotiationError) {
        warn!(error = %error, "Negotiation failed");
        self.notify(CallNotice::NegotiationFailed(error.to_string()));
        self.teardown(true).await;
    }

    // -----------------------------------------------------------------------
    // Session bookkeeping
    // -----------------------------------------------------------------------

    fn begin_session(&mut self, peer: IdentityId, role: Role, caller_name: Option<String>) -> u64 {
        self.next_epoch += 1;
        self.session = Some(Session {
            epoch: self.next_epoch,
            peer,
            role,
            caller_name,
            capture: None,
            channel: None,
            pending_offer: None,
        });
        self.next_epoch
    }

    /// Release everything the session holds and return to idle.
    ///
    /// A hang-up goes to the peer only when `notify_peer` is set and we were
    /// calling or in a call. The session is taken first, so this runs at
    /// most once per session.
    async fn teardown(&mut self, notify_peer: bool) {
        let Some(mut session) = self.session.take() else {
            return;
        };
        let prior = self.current_state();

        if let Some(channel) = session.channel.take() {
            channel.close().await;
        }
        if let Some(mut capture) = session.capture.take() {
            capture.stop();
        }
        if session.pending_offer.take().is_some() {
            debug!(peer = %session.peer, "Discarded buffered offer");
        }

        if notify_peer && matches!(prior, CallState::Calling | CallState::InCall) {
            self.emit(ClientEvent::HangUp(HangUpSignal {
                target: session.peer.clone(),
            }))
            .await;
        }

        self.set_state(CallState::Idle);
        info!(
            peer = %session.peer,
            caller_name = session.caller_name.as_deref().unwrap_or(""),
            ?prior,
            "Call session closed"
        );
        self.notify(CallNotice::Ended { peer: session.peer });
    }

    fn current_state(&self) -> CallState {
        *self.state.borrow()
    }

    fn set_state(&self, next: CallState) {
        let prior = self.state.send_replace(next);
        if prior != next {
            debug!(from = ?prior, to = ?next, "Call state changed");
        }
    }

    async fn emit(&self, event: ClientEvent) {
        let name = event.name();
        if self.signals.send(event).await.is_err() {
            warn!(event = name, "Signaling transport gone, event dropped");
        }
    }

    fn notify(&self, notice: CallNotice) {
        let _ = self.notices.send(notice);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    use async_trait::async_trait;
    use tokio::sync::Semaphore;
    use tokio::time::timeout;

    use super::*;

    const WAIT: Duration = Duration::from_secs(2);

    #[derive(Default)]
    struct Script {
        log: Mutex<Vec<String>>,
        captures: Mutex<Vec<Arc<AtomicBool>>>,
        channel_events: Mutex<Option<mpsc::UnboundedSender<ChannelEvent>>>,
    }

    impl Script {
        fn record(&self, entry: impl Into<String>) {
            self.log.lock().unwrap().push(entry.into());
        }
    }

    struct FakeCapture {
        stopped: Arc<AtomicBool>,
    }

    impl LocalCapture for FakeCapture {
        fn stop(&mut self) {
            self.stopped.store(true, Ordering::SeqCst);
        }
    }

    struct FakeChannel {
        script: Arc<Script>,
    }

    #[async_trait]
    impl NegotiationChannel for FakeChannel {
        type Capture = FakeCapture;

        async fn attach_local(&self, _capture: &FakeCapture) -> Result<(), NegotiationError> {
            self.script.record("attach");
            Ok(())
        }

        async fn create_offer(&self) -> Result<SessionDescription, NegotiationError> {
            self.script.record("create_offer");
            Ok(SessionDescription::offer("local-offer"))
        }

        async fn accept_offer(
            &self,
            offer: SessionDescription,
        ) -> Result<SessionDescription, NegotiationError> {
            self.script.record(format!("accept_offer:{}", offer.sdp));
            Ok(SessionDescription::answer("local-answer"))
        }

        async fn apply_answer(&self, answer: SessionDescription) -> Result<(), NegotiationError> {
            self.script.record(format!("apply_answer:{}", answer.sdp));
            Ok(())
        }

        async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), NegotiationError> {
            self.script.record(format!("ice:{}", candidate.candidate));
            Ok(())
        }

        async fn close(&self) {
            self.script.record("close");
        }
    }

    struct FakeBackend {
        script: Arc<Script>,
        /// Each acquisition consumes one permit.
        gate: Arc<Semaphore>,
        fail_audio: bool,
    }

    impl FakeBackend {
        fn open() -> Self {
            Self {
                script: Arc::default(),
                gate: Arc::new(Semaphore::new(Semaphore::MAX_PERMITS)),
                fail_audio: false,
            }
        }

        fn gated() -> Self {
            Self {
                gate: Arc::new(Semaphore::new(0)),
                ..Self::open()
            }
        }

        fn failing() -> Self {
            Self {
                fail_audio: true,
                ..Self::open()
            }
        }
    }

    #[async_trait]
    impl MediaBackend for FakeBackend {
        type Capture = FakeCapture;
        type Channel = FakeChannel;

        async fn acquire_audio(&self) -> Result<FakeCapture, MediaError> {
            let permit = self.gate.acquire().await.map_err(|_| MediaError::NoInput)?;
            permit.forget();
            if self.fail_audio {
                return Err(MediaError::Denied("microphone blocked".into()));
            }
            let stopped = Arc::new(AtomicBool::new(false));
            self.script.captures.lock().unwrap().push(stopped.clone());
            self.script.record("acquire");
            Ok(FakeCapture { stopped })
        }

        async fn open_channel(
            &self,
            ice_servers: &[String],
            events: mpsc::UnboundedSender<ChannelEvent>,
        ) -> Result<FakeChannel, NegotiationError> {
            assert!(!ice_servers.is_empty());
            self.script.record("open");
            *self.script.channel_events.lock().unwrap() = Some(events);
            Ok(FakeChannel {
                script: self.script.clone(),
            })
        }
    }

    struct Rig {
        handle: CallHandle<FakeBackend>,
        notices: mpsc::UnboundedReceiver<CallNotice>,
        signals: mpsc::Receiver<ClientEvent>,
        script: Arc<Script>,
        gate: Arc<Semaphore>,
    }

    impl Rig {
        fn new(backend: FakeBackend) -> Self {
            let (signals_tx, signals) = mpsc::channel(32);
            let script = backend.script.clone();
            let gate = backend.gate.clone();
            let (handle, notices) = CallAgent::spawn("me".into(), Arc::new(backend), signals_tx);
            Self {
                handle,
                notices,
                signals,
                script,
                gate,
            }
        }

        async fn next_signal(&mut self) -> ClientEvent {
            timeout(WAIT, self.signals.recv())
                .await
                .expect("timed out waiting for a signal")
                .expect("signal channel closed")
        }

        async fn next_notice(&mut self) -> CallNotice {
            timeout(WAIT, self.notices.recv())
                .await
                .expect("timed out waiting for a notice")
                .expect("notice channel closed")
        }

        async fn wait_state(&self, target: CallState) {
            let mut rx = self.handle.subscribe();
            timeout(WAIT, rx.wait_for(|s| *s == target))
                .await
                .expect("timed out waiting for state")
                .expect("agent stopped");
        }

        /// Let the agent and its helper tasks drain.
        async fn settle(&self) {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        fn log(&self) -> Vec<String> {
            self.script.log.lock().unwrap().clone()
        }

        fn capture_stopped(&self, index: usize) -> bool {
            self.script.captures.lock().unwrap()[index].load(Ordering::SeqCst)
        }

        fn inject(&self, event: ChannelEvent) {
            self.script
                .channel_events
                .lock()
                .unwrap()
                .as_ref()
                .expect("no channel opened")
                .send(event)
                .unwrap();
        }

        fn ring(&self, from: &str, caller_name: &str) {
            self.handle.handle_signal(CallSignal::IncomingCall {
                from: from.into(),
                caller_name: caller_name.into(),
            });
        }

        fn offer(&self, from: &str, sdp: &str) {
            self.handle.handle_signal(CallSignal::Offer {
                sdp: SessionDescription::offer(sdp),
                caller: from.into(),
            });
        }

        /// Drive an outgoing call to `bob` into `InCall`, consuming its signals.
        async fn connected_caller(&mut self) {
            self.handle.initiate_call("bob".into(), "Me").await.unwrap();
            assert!(matches!(self.next_signal().await, ClientEvent::CallUser(_)));
            assert!(matches!(self.next_signal().await, ClientEvent::Offer(_)));
            self.handle.handle_signal(CallSignal::Answer {
                sdp: SessionDescription::answer("remote-answer"),
                callee: "bob".into(),
            });
            self.wait_state(CallState::InCall).await;
        }
    }

    fn candidate(value: &str) -> IceCandidate {
        IceCandidate {
            candidate: value.into(),
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
            username_fragment: None,
        }
    }

    #[tokio::test]
    async fn test_outgoing_call_reaches_in_call() {
        let mut rig = Rig::new(FakeBackend::open());

        rig.handle.initiate_call("bob".into(), "Me").await.unwrap();
        assert_eq!(rig.handle.state(), CallState::Calling);
        assert_eq!(
            rig.next_signal().await,
            ClientEvent::CallUser(CallInvite {
                recipient_id: "bob".into(),
                caller_name: "Me".into(),
            })
        );
        assert_eq!(
            rig.next_signal().await,
            ClientEvent::Offer(SdpSignal {
                sdp: SessionDescription::offer("local-offer"),
                target: "bob".into(),
            })
        );

        rig.handle.handle_signal(CallSignal::Answer {
            sdp: SessionDescription::answer("remote-answer"),
            callee: "bob".into(),
        });
        rig.wait_state(CallState::InCall).await;
        assert_eq!(
            rig.log(),
            vec![
                "acquire",
                "open",
                "attach",
                "create_offer",
                "apply_answer:remote-answer"
            ]
        );

        rig.inject(ChannelEvent::LocalCandidate(candidate("c1")));
        assert_eq!(
            rig.next_signal().await,
            ClientEvent::IceCandidate(IceSignal {
                candidate: candidate("c1"),
                target: "bob".into(),
            })
        );

        rig.inject(ChannelEvent::RemoteTrack);
        assert_eq!(
            rig.next_notice().await,
            CallNotice::RemoteAudio { from: "bob".into() }
        );
    }

    #[tokio::test]
    async fn test_offer_before_media_is_buffered_and_applied() {
        let mut rig = Rig::new(FakeBackend::gated());

        rig.ring("alice", "Alice");
        rig.wait_state(CallState::Receiving).await;
        assert_eq!(
            rig.next_notice().await,
            CallNotice::IncomingCall {
                from: "alice".into(),
                caller_name: "Alice".into(),
            }
        );

        rig.offer("alice", "first");
        rig.offer("alice", "second");
        rig.handle.accept_call().await.unwrap();
        rig.settle().await;
        assert!(rig.log().is_empty());

        rig.gate.add_permits(1);
        assert_eq!(
            rig.next_signal().await,
            ClientEvent::Answer(SdpSignal {
                sdp: SessionDescription::answer("local-answer"),
                target: "alice".into(),
            })
        );
        rig.wait_state(CallState::InCall).await;
        assert_eq!(
            rig.log(),
            vec!["acquire", "open", "attach", "accept_offer:second"]
        );
    }

    #[tokio::test]
    async fn test_offer_with_channel_is_answered_immediately() {
        let mut rig = Rig::new(FakeBackend::open());
        rig.ring("alice", "Alice");
        rig.handle.accept_call().await.unwrap();
        rig.settle().await;
        assert_eq!(rig.log(), vec!["acquire", "open", "attach"]);

        rig.offer("alice", "late");
        assert!(matches!(rig.next_signal().await, ClientEvent::Answer(_)));
        assert_eq!(rig.log().last().map(String::as_str), Some("accept_offer:late"));
    }

    #[tokio::test]
    async fn test_channel_failure_tears_down_once() {
        let mut rig = Rig::new(FakeBackend::open());
        rig.connected_caller().await;

        rig.inject(ChannelEvent::StateChanged(ChannelState::Failed));
        rig.wait_state(CallState::Idle).await;
        assert_eq!(
            rig.next_signal().await,
            ClientEvent::HangUp(HangUpSignal {
                target: "bob".into()
            })
        );
        assert!(rig.capture_stopped(0));

        // Late events from the dead channel and a duplicate remote hang-up
        // change nothing.
        rig.inject(ChannelEvent::StateChanged(ChannelState::Closed));
        rig.handle.handle_signal(CallSignal::HangUp);
        rig.settle().await;
        assert!(rig.signals.try_recv().is_err());
        assert_eq!(rig.log().iter().filter(|e| *e == "close").count(), 1);
        assert_eq!(rig.handle.state(), CallState::Idle);

        assert_eq!(
            rig.next_notice().await,
            CallNotice::NegotiationFailed("connection failed".into())
        );
        assert_eq!(
            rig.next_notice().await,
            CallNotice::Ended { peer: "bob".into() }
        );
    }

    #[tokio::test]
    async fn test_media_failure_returns_to_idle() {
        let mut rig = Rig::new(FakeBackend::failing());

        rig.handle.initiate_call("bob".into(), "Me").await.unwrap();
        assert!(matches!(rig.next_signal().await, ClientEvent::CallUser(_)));
        rig.wait_state(CallState::Idle).await;
        assert_eq!(
            rig.next_signal().await,
            ClientEvent::HangUp(HangUpSignal {
                target: "bob".into()
            })
        );
        assert!(matches!(rig.next_notice().await, CallNotice::MediaFailed(_)));
        assert!(rig.log().is_empty());

        // The machine is usable again.
        rig.handle.initiate_call("bob".into(), "Me").await.unwrap();
    }

    #[tokio::test]
    async fn test_second_call_is_refused_while_busy() {
        let mut rig = Rig::new(FakeBackend::open());
        rig.handle.initiate_call("bob".into(), "Me").await.unwrap();

        assert_eq!(
            rig.handle.initiate_call("carol".into(), "Me").await,
            Err(CallError::Busy)
        );

        rig.ring("carol", "Carol");
        let busy_signal = loop {
            match rig.next_signal().await {
                ClientEvent::HangUp(signal) => break signal,
                _ => continue,
            }
        };
        assert_eq!(busy_signal.target.as_str(), "carol");
        assert_eq!(
            rig.next_notice().await,
            CallNotice::Busy {
                from: "carol".into()
            }
        );
        assert_eq!(rig.handle.state(), CallState::Calling);
    }

    #[tokio::test]
    async fn test_repeated_ring_refreshes_caller() {
        let mut rig = Rig::new(FakeBackend::open());
        rig.ring("alice", "Alice");
        rig.ring("alice", "Alice Liddell");
        rig.settle().await;

        assert!(matches!(rig.next_notice().await, CallNotice::IncomingCall { .. }));
        assert_eq!(
            rig.next_notice().await,
            CallNotice::IncomingCall {
                from: "alice".into(),
                caller_name: "Alice Liddell".into(),
            }
        );
        assert!(rig.signals.try_recv().is_err());
        assert_eq!(rig.handle.state(), CallState::Receiving);
    }

    #[tokio::test]
    async fn test_remote_hang_up_in_call_is_not_echoed() {
        let mut rig = Rig::new(FakeBackend::open());
        rig.connected_caller().await;

        rig.handle.handle_signal(CallSignal::HangUp);
        rig.wait_state(CallState::Idle).await;
        rig.settle().await;

        assert!(rig.signals.try_recv().is_err());
        assert!(rig.capture_stopped(0));
        assert_eq!(rig.log().iter().filter(|e| *e == "close").count(), 1);
        assert_eq!(
            rig.next_notice().await,
            CallNotice::Ended { peer: "bob".into() }
        );
    }

    #[tokio::test]
    async fn test_hang_up_during_acquisition_releases_capture() {
        let mut rig = Rig::new(FakeBackend::gated());
        rig.ring("alice", "Alice");
        rig.handle.accept_call().await.unwrap();

        rig.handle.handle_signal(CallSignal::HangUp);
        rig.wait_state(CallState::Idle).await;

        rig.gate.add_permits(1);
        rig.settle().await;
        assert_eq!(rig.log(), vec!["acquire"]);
        assert!(rig.capture_stopped(0));
        assert!(rig.signals.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_reject_discards_buffered_offer() {
        let mut rig = Rig::new(FakeBackend::open());
        rig.ring("alice", "Alice");
        rig.offer("alice", "pending");

        rig.handle.reject_call().await.unwrap();
        assert_eq!(rig.handle.state(), CallState::Idle);
        assert_eq!(rig.handle.accept_call().await, Err(CallError::NotRinging));

        rig.settle().await;
        assert!(rig.log().is_empty());
        assert!(rig.signals.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_ice_before_channel_is_dropped() {
        let mut rig = Rig::new(FakeBackend::gated());
        rig.ring("alice", "Alice");
        rig.handle.handle_signal(CallSignal::IceCandidate {
            candidate: candidate("early"),
            from: "alice".into(),
        });
        rig.handle.accept_call().await.unwrap();
        rig.gate.add_permits(1);
        rig.settle().await;

        rig.handle.handle_signal(CallSignal::IceCandidate {
            candidate: candidate("late"),
            from: "alice".into(),
        });
        rig.settle().await;

        let log = rig.log();
        assert!(log.contains(&"ice:late".to_string()));
        assert!(!log.contains(&"ice:early".to_string()));
        assert!(rig.signals.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_local_end_call_notifies_peer() {
        let mut rig = Rig::new(FakeBackend::open());
        rig.connected_caller().await;

        rig.handle.end_call();
        assert_eq!(
            rig.next_signal().await,
            ClientEvent::HangUp(HangUpSignal {
                target: "bob".into()
            })
        );
        rig.wait_state(CallState::Idle).await;

        rig.handle.end_call();
        rig.settle().await;
        assert!(rig.signals.try_recv().is_err());
    }
}
