use crate::replica::{MemberId, RaftRole, Term};
use tokio::sync::watch;

/// What an observer needs to know about the member's role, published on every role or leader
/// change.
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) struct ElectionStateSnapshot {
    pub(crate) role: RaftRole,
    pub(crate) term: Term,
    pub(crate) leader_id: Option<MemberId>,
}

pub(super) fn new(initial_state: ElectionStateSnapshot) -> (ElectionStateChangeNotifier, ElectionStateChangeListener) {
    let (snd, rcv) = watch::channel(initial_state);

    (ElectionStateChangeNotifier { snd }, ElectionStateChangeListener { rcv })
}

pub(super) struct ElectionStateChangeNotifier {
    snd: watch::Sender<ElectionStateSnapshot>,
}

impl ElectionStateChangeNotifier {
    pub(super) fn notify_new_state(&self, new_state: ElectionStateSnapshot) {
        // Skip no-op updates so listeners only wake on real changes.
        if *self.snd.borrow() != new_state {
            let _ = self.snd.send(new_state);
        }
    }
}

#[derive(Clone)]
pub(crate) struct ElectionStateChangeListener {
    rcv: watch::Receiver<ElectionStateSnapshot>,
}

impl ElectionStateChangeListener {
    /// Waits for the next change. Intermediate changes between two calls are collapsed into the
    /// latest one. `None` once the replica is gone.
    pub(crate) async fn next(&mut self) -> Option<ElectionStateSnapshot> {
        match self.rcv.changed().await {
            Ok(_) => Some(self.rcv.borrow().clone()),
            Err(_) => None,
        }
    }

    pub(crate) fn current(&self) -> ElectionStateSnapshot {
        self.rcv.borrow().clone()
    }
}
