use crate::replica;
use crate::replica::{
    LeaderTimerTick, LeadershipTransferError, MemberId, PersistContinuation, PersistenceError, RaftMessage, RaftRole,
    RaftState, ServerChangeReply, ServerChangeRequest, SnapshotMetadata, SnapshotRequestError,
    SubmitError, SubmitOutput, SwitchBehaviorError, Term, TimeoutKind,
};
use bytes::Bytes;
use std::convert::Infallible;
use std::error::Error;
use std::fmt::Debug;
use tokio::sync::{mpsc, oneshot};

// Disk interaction from the replica task is synchronous except where the persistence provider
// hands completion back as an event. Application state machine lives inside the replica.
#[derive(Debug)]
pub(crate) enum Event {
    // Any role: message from another member, dispatched by the current role.
    Raft(RaftMessage),

    // Leader: append, replicate and answer once applied.
    // Others: reject with leader hint.
    Submit(Bytes, Callback<SubmitOutput, SubmitError>),

    // Leader: run through the membership state machine.
    // Others: forward to the leader or answer NoLeader.
    ServerChange(ServerChangeRequest, oneshot::Sender<ServerChangeReply>),

    RequestLeadership(Option<MemberId>, Callback<(), LeadershipTransferError>),
    GetState(Callback<RaftState, Infallible>),
    CaptureSnapshot(Callback<(), SnapshotRequestError>),
    SwitchBehavior(RaftRole, Term, Callback<(), SwitchBehaviorError>),
    Shutdown(oneshot::Sender<()>),

    // Follower/Candidate: no leader contact for a full election timeout.
    FollowerTimeout,

    // Leader: send AppendEntries to one peer.
    LeaderTimer(LeaderTimerTick),

    // Cancellable one-shot timeouts, checked by id on arrival.
    Timeout(TimeoutKind),

    // Completions handed back by the persistence provider.
    PersistCompleted(PersistContinuation, Result<(), PersistenceError>),
    SnapshotSaved(Result<SnapshotMetadata, PersistenceError>),

    // State machine state captured for a snapshot in progress.
    CaptureSnapshotReply(Bytes),

    // Leader: check whether a voting majority is still reachable.
    IsolatedLeaderCheck,
}

#[derive(Debug)]
pub(crate) struct Callback<O: Debug, E: Error>(oneshot::Sender<Result<O, E>>);

impl<O: Debug, E: Error> Callback<O, E> {
    #[cfg(test)]
    pub(crate) fn new(sender: oneshot::Sender<Result<O, E>>) -> Self {
        Callback(sender)
    }

    pub(crate) fn send(self, message: Result<O, E>) {
        let _ = self.0.send(message);
    }
}

#[derive(Debug, thiserror::Error)]
#[error("Replica actor is dead RIP")]
pub struct ActorExited;

#[derive(Clone)]
pub(crate) struct ActorClient {
    sender: mpsc::Sender<Event>,
}

impl ActorClient {
    pub(crate) fn new(buffer_size: usize) -> (Self, mpsc::Receiver<Event>) {
        let (tx, rx) = mpsc::channel(buffer_size);
        (ActorClient { sender: tx }, rx)
    }

    pub(crate) fn weak(&self) -> WeakActorClient {
        WeakActorClient {
            sender: self.sender.downgrade(),
        }
    }

    pub(crate) async fn submit(&self, data: Bytes) -> Result<SubmitOutput, SubmitError> {
        let (tx, rx) = oneshot::channel();
        self.send(Event::Submit(data, Callback(tx)))
            .await
            .map_err(|_| SubmitError::ActorExited)?;

        rx.await.unwrap_or(Err(SubmitError::ActorExited))
    }

    pub(crate) async fn change_servers(&self, request: ServerChangeRequest) -> Result<ServerChangeReply, ActorExited> {
        let (tx, rx) = oneshot::channel();
        self.send(Event::ServerChange(request, tx)).await?;

        rx.await.map_err(|_| ActorExited)
    }

    pub(crate) async fn request_leadership(&self, target: Option<MemberId>) -> Result<(), LeadershipTransferError> {
        let (tx, rx) = oneshot::channel();
        self.send(Event::RequestLeadership(target, Callback(tx)))
            .await
            .map_err(|_| LeadershipTransferError::ActorExited)?;

        rx.await.unwrap_or(Err(LeadershipTransferError::ActorExited))
    }

    pub(crate) async fn get_state(&self) -> Result<RaftState, ActorExited> {
        let (tx, rx) = oneshot::channel();
        self.send(Event::GetState(Callback(tx))).await?;

        match rx.await {
            Ok(Ok(state)) => Ok(state),
            Ok(Err(never)) => match never {},
            Err(_) => Err(ActorExited),
        }
    }

    pub(crate) async fn capture_snapshot(&self) -> Result<(), SnapshotRequestError> {
        let (tx, rx) = oneshot::channel();
        self.send(Event::CaptureSnapshot(Callback(tx)))
            .await
            .map_err(|_| SnapshotRequestError::ActorExited)?;

        rx.await.unwrap_or(Err(SnapshotRequestError::ActorExited))
    }

    pub(crate) async fn switch_behavior(&self, role: RaftRole, term: Term) -> Result<(), SwitchBehaviorError> {
        let (tx, rx) = oneshot::channel();
        self.send(Event::SwitchBehavior(role, term, Callback(tx)))
            .await
            .map_err(|_| SwitchBehaviorError::ActorExited)?;

        rx.await.unwrap_or(Err(SwitchBehaviorError::ActorExited))
    }

    /// Resolves once the replica task stopped. Also resolves if it was already gone.
    pub(crate) async fn shutdown(&self) {
        let (tx, rx) = oneshot::channel();
        if self.send(Event::Shutdown(tx)).await.is_ok() {
            let _ = rx.await;
        }
    }

    async fn send(&self, event: Event) -> Result<(), ActorExited> {
        self.sender.send(event).await.map_err(|_| ActorExited)
    }
}

/// WeakActorClient is held by everything the replica owns that posts back into its mailbox
/// (timers, persistence callbacks, transport), so those never keep the replica task alive.
#[derive(Clone, Debug)]
pub(crate) struct WeakActorClient {
    sender: mpsc::WeakSender<Event>,
}

impl WeakActorClient {
    pub(crate) async fn follower_timeout(&self) -> Result<(), ActorExited> {
        self.send(Event::FollowerTimeout).await
    }

    pub(crate) async fn leader_timer(&self, tick: LeaderTimerTick) -> Result<(), ActorExited> {
        self.send(Event::LeaderTimer(tick)).await
    }

    pub(crate) async fn timeout(&self, kind: TimeoutKind) -> Result<(), ActorExited> {
        self.send(Event::Timeout(kind)).await
    }

    /// Posts without waiting. If the mailbox is full the send continues on a spawned task, so the
    /// caller may be the replica task itself.
    pub(crate) fn deliver(&self, event: Event) {
        let sender = match self.sender.upgrade() {
            Some(sender) => sender,
            None => return,
        };
        match sender.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(event)) => {
                tokio::task::spawn(async move {
                    let _ = sender.send(event).await;
                });
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {}
        }
    }

    async fn send(&self, event: Event) -> Result<(), ActorExited> {
        let sender = self.sender.upgrade().ok_or(ActorExited)?;
        sender.send(event).await.map_err(|_| ActorExited)
    }
}

/// ReplicaActor is replica logic in actor model.
pub(crate) struct ReplicaActor {
    logger: slog::Logger,
    receiver: mpsc::Receiver<Event>,
    replica: replica::Replica,
}

impl ReplicaActor {
    pub(crate) fn new(logger: slog::Logger, receiver: mpsc::Receiver<Event>, replica: replica::Replica) -> Self {
        ReplicaActor {
            logger,
            receiver,
            replica,
        }
    }

    pub(crate) async fn run_event_loop(mut self) {
        self.replica.start();
        while let Some(event) = self.receiver.recv().await {
            self.handle_event(event);
            if self.replica.is_stopped() {
                break;
            }
        }
        slog::info!(self.logger, "Replica event loop exited");
    }

    // This must NOT be async. Any long running work must be spawned on another actor
    // and/or come as a callback to this actor.
    fn handle_event(&mut self, event: Event) {
        match event {
            Event::Raft(message) => self.replica.handle_raft_message(message),
            Event::Submit(data, callback) => self.replica.submit(data, callback),
            Event::ServerChange(request, reply) => self.replica.handle_server_change(request, reply),
            Event::RequestLeadership(target, callback) => self.replica.request_leadership(target, callback),
            Event::GetState(callback) => callback.send(Ok(self.replica.get_state())),
            Event::CaptureSnapshot(callback) => callback.send(self.replica.capture_snapshot()),
            Event::SwitchBehavior(role, term, callback) => callback.send(self.replica.switch_behavior(role, term)),
            Event::Shutdown(done) => self.replica.shutdown(done),
            Event::FollowerTimeout => self.replica.follower_timeout(),
            Event::LeaderTimer(tick) => self.replica.leader_timer(tick),
            Event::Timeout(kind) => self.replica.handle_timeout(kind),
            Event::PersistCompleted(continuation, result) => self.replica.persist_completed(continuation, result),
            Event::SnapshotSaved(result) => self.replica.snapshot_saved(result),
            Event::CaptureSnapshotReply(state) => self.replica.capture_snapshot_reply(state),
            Event::IsolatedLeaderCheck => self.replica.isolated_leader_check(),
        }
        self.replica.after_event();
    }

    /// Handles everything queued right now without waiting. Returns how many events ran.
    #[cfg(test)]
    pub(crate) fn pump(&mut self) -> usize {
        let mut handled = 0;
        while let Ok(event) = self.receiver.try_recv() {
            self.handle_event(event);
            handled += 1;
            if self.replica.is_stopped() {
                break;
            }
        }
        handled
    }

    #[cfg(test)]
    pub(crate) fn replica(&self) -> &replica::Replica {
        &self.replica
    }

    #[cfg(test)]
    pub(crate) fn replica_mut(&mut self) -> &mut replica::Replica {
        &mut self.replica
    }
}
