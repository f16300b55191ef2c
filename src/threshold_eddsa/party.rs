//! Per-validator protocol endpoint.
//!
//! A [Party] owns the protocol state machines and talks to the transport
//! through explicit bounded channels: outbound frames go into the
//! [OutboundFrame] channel bound at [init](Party::init), inbound frames come
//! in through [on_message](Party::on_message). All protocol state transitions
//! happen on the task that called [run_dkg](Party::run_dkg) or
//! [run_sign](Party::run_sign); `on_message` and cancellation only enqueue.
//!
//! One session at a time: a second `run_*` while a session is active fails
//! with [SessionError::Inconsistent]. Every `init` advances this party's wire
//! epoch; outbound frames are stamped with it. Inbound frames are screened
//! against the highest epoch seen from their sender within the session, so a
//! frame captured from one of the sender's earlier sessions is dropped on
//! sight instead of poisoning the current round.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use round_based::{Msg, StateMachine};
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::time::{self, Instant};
use tracing::{debug, info, warn, Instrument};

use crate::basic_eddsa::EddsaSignature;
use crate::threshold_eddsa::state_machine::keygen::{self, Keygen, LocalKey};
use crate::threshold_eddsa::state_machine::sign::{self, Sign};
use crate::threshold_eddsa::wire::{Frame, WireMessage};
use crate::threshold_eddsa::{PartyId, PeerSet};

const KEYGEN_DEADLINE: Duration = Duration::from_secs(30);
const SIGN_DEADLINE: Duration = Duration::from_secs(15);

/// Inbound queue capacity per session, in messages per peer. Sessions need at
/// most one message per peer per round; anything past this bound is a flood.
const INBOX_FACTOR: usize = 4;

/// Caller-tunable session parameters.
#[derive(Clone, Copy, Debug, Default)]
pub struct SessionOptions {
    /// Overrides the default session deadline (30 s keygen, 15 s signing).
    pub deadline: Option<Duration>,
}

/// Creates the two halves of a one-shot session cancellation.
pub fn cancel_pair() -> (CancelHandle, CancelToken) {
    let (tx, rx) = watch::channel(false);
    (CancelHandle { tx }, CancelToken { rx })
}

pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

impl CancelHandle {
    /// Aborts the session at its next suspension point. Calling this more
    /// than once has the same effect as calling it once.
    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }
}

#[derive(Clone)]
pub struct CancelToken {
    rx: watch::Receiver<bool>,
}

impl CancelToken {
    async fn cancelled(&mut self) {
        loop {
            if *self.rx.borrow() {
                return;
            }
            if self.rx.changed().await.is_err() {
                // the handle is gone; this session can no longer be cancelled
                std::future::pending::<()>().await;
            }
        }
    }
}

/// Where the transport must deliver an outbound frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Recipient {
    /// Every session peer except the sender.
    Broadcast,
    /// Exactly this peer.
    Peer(PartyId),
}

/// One frame handed to the transport. The bytes must reach the destination
/// unmodified; per-sender delivery order must be preserved.
#[derive(Clone, Debug)]
pub struct OutboundFrame {
    pub recipient: Recipient,
    pub bytes: Vec<u8>,
}

/// Session outcome surfaced to the caller. The core never retries; on any
/// error the session is over and its ephemeral secrets are already scrubbed.
#[derive(Debug, Error)]
pub enum SessionError {
    /// A precondition of the requested operation doesn't hold yet
    #[error("party is not ready: {0}")]
    NotReady(String),
    /// A named peer sent something unacceptable and the session is over
    #[error("protocol violation by party {party}: {reason}")]
    Protocol { party: PartyId, reason: String },
    /// Local state is contradictory (bad share blob, mismatched peer sets,
    /// overlapping sessions)
    #[error("local state is inconsistent: {0}")]
    Inconsistent(String),
    /// The session deadline elapsed before the protocol completed
    #[error("session deadline elapsed")]
    Timeout,
    /// The caller aborted the session
    #[error("session cancelled")]
    Cancelled,
}

/// A single validator's protocol endpoint.
pub struct Party {
    id: PartyId,
    span: tracing::Span,
    inner: Mutex<Inner>,
    in_session: AtomicBool,
}

struct Inner {
    key: Option<Arc<LocalKey>>,
    session: Option<SessionBinding>,
    epoch: u16,
}

struct SessionBinding {
    peers: PeerSet,
    threshold: u16,
    epoch: u16,
    outgoing: mpsc::Sender<OutboundFrame>,
    inbox_tx: mpsc::Sender<Frame>,
    inbox_rx: Option<mpsc::Receiver<Frame>>,
    peer_epochs: HashMap<PartyId, u16>,
    flooded: Option<PartyId>,
}

struct SessionCtx {
    peers: PeerSet,
    threshold: u16,
    epoch: u16,
    outgoing: mpsc::Sender<OutboundFrame>,
    inbox: mpsc::Receiver<Frame>,
}

impl Party {
    pub fn new(id: PartyId) -> Self {
        Party {
            id,
            span: tracing::info_span!("party", id = id.get()),
            inner: Mutex::new(Inner {
                key: None,
                session: None,
                epoch: 0,
            }),
            in_session: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> PartyId {
        self.id
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Bind the party to the peer set, threshold and outbound channel of the
    /// next session. May be called repeatedly; every call resets leftover
    /// session state (the local key survives) and advances the wire epoch.
    pub fn init(
        &self,
        peers: PeerSet,
        threshold: u16,
        outgoing: mpsc::Sender<OutboundFrame>,
    ) -> Result<(), SessionError> {
        if !peers.contains(self.id) {
            return Err(SessionError::Inconsistent(
                "local party is missing from the peer set".into(),
            ));
        }
        if self.in_session.load(Ordering::SeqCst) {
            return Err(SessionError::Inconsistent(
                "cannot rebind while a session is running".into(),
            ));
        }

        let mut inner = self.lock();
        inner.epoch = inner.epoch.wrapping_add(1);
        let (inbox_tx, inbox_rx) = mpsc::channel(INBOX_FACTOR * peers.len());
        inner.session = Some(SessionBinding {
            peers,
            threshold,
            epoch: inner.epoch,
            outgoing,
            inbox_tx,
            inbox_rx: Some(inbox_rx),
            peer_epochs: HashMap::new(),
            flooded: None,
        });
        debug!(parent: &self.span, epoch = inner.epoch, "bound to a new session");
        Ok(())
    }

    /// Non-blocking inbound entry point for the transport. `from` must be the
    /// authenticated sender of the frame; it is cross-checked against the
    /// envelope's self-declared sender. Frames that don't belong to the
    /// active session (no session, stale epoch, misrouted recipient) are
    /// dropped without effect.
    pub fn on_message(
        &self,
        raw: &[u8],
        from: PartyId,
        broadcast: bool,
    ) -> Result<(), SessionError> {
        let frame = Frame::decode(raw).map_err(|err| self.fault(from, err))?;
        if frame.sender != from {
            return Err(self.fault(from, FrameFault("frame sender doesn't match the transport sender")));
        }
        if frame.broadcast != broadcast {
            return Err(self.fault(from, FrameFault("frame broadcast flag doesn't match the delivery")));
        }
        if let Some(recipient) = frame.recipient {
            if recipient != self.id {
                debug!(parent: &self.span, to = recipient.get(), "dropping misrouted frame");
                return Ok(());
            }
        }

        let mut inner = self.lock();
        let session = match inner.session.as_mut() {
            Some(session) => session,
            None => {
                debug!(parent: &self.span, from = from.get(), "no active session; frame dropped");
                return Ok(());
            }
        };
        if !session.peers.contains(from) {
            return Err(SessionError::Protocol {
                party: from,
                reason: "sender is not a session peer".into(),
            });
        }
        // per-sender epochs are monotonic; anything below the highest epoch
        // seen from this sender belongs to one of its earlier sessions
        match session.peer_epochs.get(&from) {
            Some(&pinned) if frame.epoch < pinned => {
                debug!(
                    parent: &self.span,
                    from = from.get(),
                    epoch = frame.epoch,
                    "stale epoch; frame dropped"
                );
                return Ok(());
            }
            _ => {
                session.peer_epochs.insert(from, frame.epoch);
            }
        }

        match session.inbox_tx.try_send(frame) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                if session.flooded.is_none() {
                    session.flooded = Some(from);
                }
                Err(SessionError::Protocol {
                    party: from,
                    reason: "inbound queue overflow".into(),
                })
            }
            // the session task has already terminated
            Err(mpsc::error::TrySendError::Closed(_)) => Ok(()),
        }
    }

    /// Runs one distributed key generation session to completion. The
    /// resulting local key is retained by the party and returned; persist it
    /// with [LocalKey::to_bytes].
    pub async fn run_dkg(
        &self,
        cancel: CancelToken,
        options: SessionOptions,
    ) -> Result<LocalKey, SessionError> {
        let _guard = self.enter_session()?;
        let ctx = self.take_session()?;
        let machine = Keygen::new(self.id, ctx.peers.clone(), ctx.threshold)
            .map_err(|err| SessionError::Inconsistent(err.to_string()))?;
        let deadline = Instant::now() + options.deadline.unwrap_or(KEYGEN_DEADLINE);

        let result = self.supervise(machine, ctx, cancel, deadline).await;
        self.finish_session();

        match result {
            Ok(key) => {
                self.lock().key = Some(Arc::new(key.clone()));
                info!(parent: &self.span, "keygen session completed");
                Ok(key)
            }
            Err(err) => {
                warn!(parent: &self.span, %err, "keygen session failed");
                Err(err)
            }
        }
    }

    /// Runs one signing session over `digest` with the quorum bound at
    /// [init](Party::init). Requires a local key.
    pub async fn run_sign(
        &self,
        cancel: CancelToken,
        digest: [u8; 32],
        options: SessionOptions,
    ) -> Result<EddsaSignature, SessionError> {
        let _guard = self.enter_session()?;
        let key = self.lock().key.clone().ok_or_else(|| {
            SessionError::NotReady("no local key; run keygen or set_share first".into())
        })?;
        let ctx = self.take_session()?;
        let machine = Sign::new(
            digest,
            self.id,
            ctx.peers.clone(),
            ctx.threshold,
            (*key).clone(),
        )
        .map_err(|err| match err {
            sign::Error::TooFewParties => SessionError::NotReady(err.to_string()),
            other => SessionError::Inconsistent(other.to_string()),
        })?;
        let deadline = Instant::now() + options.deadline.unwrap_or(SIGN_DEADLINE);

        let result = self.supervise(machine, ctx, cancel, deadline).await;
        self.finish_session();

        match result {
            Ok(signature) => {
                info!(parent: &self.span, "signing session completed");
                Ok(signature)
            }
            Err(err) => {
                warn!(parent: &self.span, %err, "signing session failed");
                Err(err)
            }
        }
    }

    /// Restore a previously saved share blob, re-validating every structural
    /// and curve invariant.
    pub fn set_share(&self, blob: &[u8]) -> Result<(), SessionError> {
        let key =
            LocalKey::from_bytes(blob).map_err(|err| SessionError::Inconsistent(err.to_string()))?;
        if key.id() != self.id {
            return Err(SessionError::Inconsistent(
                "share blob belongs to a different party".into(),
            ));
        }
        self.lock().key = Some(Arc::new(key));
        Ok(())
    }

    pub fn local_key(&self) -> Option<Arc<LocalKey>> {
        self.lock().key.clone()
    }

    /// The 32-byte Ed25519 group public key, once a local key is set.
    pub fn group_public_key(&self) -> Result<[u8; 32], SessionError> {
        self.lock()
            .key
            .as_ref()
            .map(|key| key.public_key().compress().to_bytes())
            .ok_or_else(|| {
                SessionError::NotReady("no local key; run keygen or set_share first".into())
            })
    }

    fn enter_session(&self) -> Result<SessionGuard<'_>, SessionError> {
        if self
            .in_session
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(SessionError::Inconsistent(
                "another session is already running on this party".into(),
            ));
        }
        Ok(SessionGuard { party: self })
    }

    fn take_session(&self) -> Result<SessionCtx, SessionError> {
        let mut inner = self.lock();
        let binding = inner
            .session
            .as_mut()
            .ok_or_else(|| SessionError::NotReady("init has not been called".into()))?;
        let inbox = binding.inbox_rx.take().ok_or_else(|| {
            SessionError::Inconsistent("session was already consumed; call init again".into())
        })?;
        Ok(SessionCtx {
            peers: binding.peers.clone(),
            threshold: binding.threshold,
            epoch: binding.epoch,
            outgoing: binding.outgoing.clone(),
            inbox,
        })
    }

    fn finish_session(&self) {
        self.lock().session = None;
    }

    fn take_flood(&self) -> Option<PartyId> {
        self.lock().session.as_mut().and_then(|s| s.flooded.take())
    }

    async fn supervise<SM>(
        &self,
        machine: SM,
        ctx: SessionCtx,
        mut cancel: CancelToken,
        deadline: Instant,
    ) -> Result<SM::Output, SessionError>
    where
        SM: StateMachine,
        SM::MessageBody: WireMessage,
        SM::Err: SessionMachineError,
    {
        // dropping the drive future on cancellation or deadline drops the
        // state machine, which scrubs its ephemeral secrets
        async {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(SessionError::Cancelled),
                _ = time::sleep_until(deadline) => Err(SessionError::Timeout),
                result = self.drive(machine, ctx, deadline) => result,
            }
        }
        .instrument(self.span.clone())
        .await
    }

    async fn drive<SM>(
        &self,
        mut machine: SM,
        mut ctx: SessionCtx,
        deadline: Instant,
    ) -> Result<SM::Output, SessionError>
    where
        SM: StateMachine,
        SM::MessageBody: WireMessage,
        SM::Err: SessionMachineError,
    {
        let my_index = ctx
            .peers
            .position(self.id)
            .map(|pos| pos as u16 + 1)
            .ok_or_else(|| {
                SessionError::Inconsistent("local party is missing from the peer set".into())
            })?;

        loop {
            self.flush_outgoing(&mut machine, &ctx, deadline).await?;

            if machine.wants_to_proceed() {
                if let Err(err) = machine.proceed() {
                    return Err(self.verdict(err, None));
                }
                debug!(round = machine.current_round(), "advanced protocol round");
                continue;
            }

            if machine.is_finished() {
                return match machine.pick_output() {
                    Some(Ok(output)) => Ok(output),
                    Some(Err(err)) => Err(self.verdict(err, None)),
                    None => Err(SessionError::Inconsistent(
                        "state machine finished without an output".into(),
                    )),
                };
            }

            if let Some(party) = self.take_flood() {
                return Err(SessionError::Protocol {
                    party,
                    reason: "inbound queue overflow".into(),
                });
            }

            let frame = match ctx.inbox.recv().await {
                Some(frame) => frame,
                None => {
                    return Err(SessionError::Inconsistent("inbound channel closed".into()))
                }
            };

            if frame.protocol != SM::MessageBody::PROTOCOL {
                return Err(SessionError::Protocol {
                    party: frame.sender,
                    reason: "frame belongs to a different protocol".into(),
                });
            }
            let sender_index = match ctx.peers.position(frame.sender) {
                Some(pos) => pos as u16 + 1,
                None => {
                    return Err(SessionError::Protocol {
                        party: frame.sender,
                        reason: "sender is not a session peer".into(),
                    })
                }
            };
            let body = match frame.open::<SM::MessageBody>() {
                Ok(body) => body,
                Err(err) => return Err(self.fault(frame.sender, err)),
            };
            let receiver = if frame.broadcast { None } else { Some(my_index) };

            if let Err(err) = machine.handle_incoming(Msg {
                sender: sender_index,
                receiver,
                body,
            }) {
                if let ErrorClass::Stale = err.classify() {
                    debug!(from = frame.sender.get(), "ignoring stale frame");
                } else {
                    return Err(self.verdict(err, Some(frame.sender)));
                }
            }
        }
    }

    async fn flush_outgoing<SM>(
        &self,
        machine: &mut SM,
        ctx: &SessionCtx,
        deadline: Instant,
    ) -> Result<(), SessionError>
    where
        SM: StateMachine,
        SM::MessageBody: WireMessage,
    {
        let messages: Vec<Msg<SM::MessageBody>> = machine.message_queue().drain(..).collect();
        for msg in messages {
            let recipient = msg
                .receiver
                .map(|index| ctx.peers.id_at(usize::from(index) - 1));
            let frame = Frame::for_message(&msg.body, ctx.epoch, self.id, recipient);
            let outbound = OutboundFrame {
                recipient: recipient.map(Recipient::Peer).unwrap_or(Recipient::Broadcast),
                bytes: frame.encode(),
            };
            match time::timeout_at(deadline, ctx.outgoing.send(outbound)).await {
                Ok(Ok(())) => {}
                Ok(Err(_)) => {
                    return Err(SessionError::Inconsistent(
                        "transport channel closed".into(),
                    ))
                }
                Err(_) => return Err(SessionError::Timeout),
            }
        }
        Ok(())
    }

    fn verdict<E: SessionMachineError>(&self, err: E, sender: Option<PartyId>) -> SessionError {
        match err.classify() {
            ErrorClass::Fault(party) => self.fault(party, err),
            ErrorClass::FaultSender => match sender {
                Some(party) => self.fault(party, err),
                None => SessionError::Inconsistent(err.to_string()),
            },
            ErrorClass::Stale | ErrorClass::Internal => SessionError::Inconsistent(err.to_string()),
        }
    }

    fn fault<E: std::error::Error>(&self, party: PartyId, err: E) -> SessionError {
        warn!(parent: &self.span, party = party.get(), %err, "peer failed the protocol");
        SessionError::Protocol {
            party,
            reason: err.to_string(),
        }
    }
}

struct SessionGuard<'a> {
    party: &'a Party,
}

impl Drop for SessionGuard<'_> {
    fn drop(&mut self) {
        self.party.in_session.store(false, Ordering::SeqCst);
    }
}

#[derive(Debug, Error)]
#[error("{0}")]
struct FrameFault(&'static str);

/// How a state machine error translates into a session outcome.
enum ErrorClass {
    /// Replay of an already-finished round; drop it
    Stale,
    /// The message just handled is at fault; blame its sender
    FaultSender,
    /// A specific peer misbehaved
    Fault(PartyId),
    /// Our own invariants broke
    Internal,
}

trait SessionMachineError: std::error::Error {
    fn classify(&self) -> ErrorClass;
}

impl SessionMachineError for keygen::Error {
    fn classify(&self) -> ErrorClass {
        match self {
            keygen::Error::ReceivedOutOfOrderMessage { .. } => ErrorClass::Stale,
            keygen::Error::HandleMessage(_) => ErrorClass::FaultSender,
            keygen::Error::ProceedRound(proceed) => match proceed.culprit() {
                Some(party) => ErrorClass::Fault(party),
                None => ErrorClass::Internal,
            },
            _ => ErrorClass::Internal,
        }
    }
}

impl SessionMachineError for sign::Error {
    fn classify(&self) -> ErrorClass {
        match self {
            sign::Error::ReceivedOutOfOrderMessage { .. } => ErrorClass::Stale,
            sign::Error::HandleMessage(_) => ErrorClass::FaultSender,
            sign::Error::ProceedRound(proceed) => match proceed.culprit() {
                Some(party) => ErrorClass::Fault(party),
                None => ErrorClass::Internal,
            },
            _ => ErrorClass::Internal,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(i: u16) -> PartyId {
        PartyId::new(i).unwrap()
    }

    #[test]
    fn cancel_is_idempotent() {
        let (handle, mut token) = cancel_pair();
        handle.cancel();
        handle.cancel();
        assert!(*token.rx.borrow_and_update());
    }

    #[test]
    fn frames_are_dropped_while_dormant() {
        let party = Party::new(id(1));
        let frame = Frame {
            protocol: crate::threshold_eddsa::wire::PROTOCOL_SIGN,
            round: 1,
            epoch: 1,
            sender: id(2),
            broadcast: true,
            recipient: None,
            payload: vec![0u8; 32],
        };
        // a dormant party ignores the frame instead of erroring
        party.on_message(&frame.encode(), id(2), true).unwrap();
    }

    #[tokio::test]
    async fn inbound_queue_overflow_names_the_flooder() {
        let party = Party::new(id(1));
        let peers = PeerSet::new(vec![id(1), id(2)]).unwrap();
        let (outgoing, _keep_rx) = mpsc::channel(4);
        party.init(peers, 1, outgoing).unwrap();

        let frame = Frame {
            protocol: crate::threshold_eddsa::wire::PROTOCOL_SIGN,
            round: 1,
            epoch: 1,
            sender: id(2),
            broadcast: true,
            recipient: None,
            payload: vec![0u8; 32],
        }
        .encode();

        // the queue holds 4 * n frames; one more marks the sender as a flooder
        for _ in 0..8 {
            party.on_message(&frame, id(2), true).unwrap();
        }
        let err = party.on_message(&frame, id(2), true).unwrap_err();
        assert!(matches!(err, SessionError::Protocol { party, .. } if party == id(2)));
    }

    #[test]
    fn sender_mismatch_is_rejected() {
        let party = Party::new(id(1));
        let frame = Frame {
            protocol: crate::threshold_eddsa::wire::PROTOCOL_SIGN,
            round: 1,
            epoch: 1,
            sender: id(3),
            broadcast: true,
            recipient: None,
            payload: vec![0u8; 32],
        };
        let err = party.on_message(&frame.encode(), id(2), true).unwrap_err();
        assert!(matches!(err, SessionError::Protocol { party, .. } if party == id(2)));
    }
}
