use crate::actor::{Event, WeakActorClient};
use crate::replica::messages::RaftMessage;
use crate::replica::peers::MemberId;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

/// RaftTransport carries messages between members. Delivery is best effort: raft tolerates loss,
/// duplication is up to the implementation to avoid. `to_address` is the peer's configured or
/// resolved address, `None` if neither is known.
pub trait RaftTransport: Send + Sync {
    fn send(&self, from: &MemberId, to: &MemberId, to_address: Option<&str>, message: RaftMessage);
}

/// RaftInbox hands messages from a transport to one member. It doesn't keep the member alive.
#[derive(Clone, Debug)]
pub struct RaftInbox {
    actor_client: WeakActorClient,
}

impl RaftInbox {
    pub(crate) fn new(actor_client: WeakActorClient) -> Self {
        RaftInbox { actor_client }
    }

    pub fn deliver(&self, message: RaftMessage) {
        self.actor_client.deliver(Event::Raft(message));
    }
}

/// LocalTransport connects members running in the same process. Members can be isolated to
/// simulate network partitions.
#[derive(Clone)]
pub struct LocalTransport {
    logger: slog::Logger,
    inner: Arc<Mutex<Registry>>,
}

#[derive(Default)]
struct Registry {
    members: HashMap<MemberId, RaftInbox>,
    isolated: HashSet<MemberId>,
}

impl LocalTransport {
    pub fn new(logger: slog::Logger) -> Self {
        LocalTransport {
            logger,
            inner: Arc::new(Mutex::new(Registry::default())),
        }
    }

    pub fn register(&self, member_id: MemberId, inbox: RaftInbox) {
        self.lock().members.insert(member_id, inbox);
    }

    pub fn unregister(&self, member_id: &MemberId) {
        self.lock().members.remove(member_id);
    }

    /// Drops every message to or from `member_id` until `heal` is called.
    pub fn isolate(&self, member_id: &MemberId) {
        slog::info!(self.logger, "Isolating {}", member_id);
        self.lock().isolated.insert(member_id.clone());
    }

    pub fn heal(&self, member_id: &MemberId) {
        slog::info!(self.logger, "Healing {}", member_id);
        self.lock().isolated.remove(member_id);
    }

    fn lock(&self) -> MutexGuard<'_, Registry> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl RaftTransport for LocalTransport {
    // Members are looked up by id, the address only matters to networked transports.
    fn send(&self, from: &MemberId, to: &MemberId, _to_address: Option<&str>, message: RaftMessage) {
        let target = {
            let registry = self.lock();
            if registry.isolated.contains(from) || registry.isolated.contains(to) {
                slog::trace!(self.logger, "Dropping {} from {} to {}: isolated", message.name(), from, to);
                return;
            }
            registry.members.get(to).cloned()
        };

        match target {
            Some(inbox) => inbox.deliver(message),
            None => slog::debug!(self.logger, "Dropping {} from {} to unknown member {}", message.name(), from, to),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actor::ActorClient;

    fn logger() -> slog::Logger {
        slog::Logger::root(slog::Discard, slog::o!())
    }

    #[tokio::test]
    async fn isolated_members_neither_send_nor_receive() {
        let transport = LocalTransport::new(logger());
        let (a, mut a_rx) = ActorClient::new(10);
        let (b, mut b_rx) = ActorClient::new(10);
        let (id_a, id_b) = (MemberId::new("a"), MemberId::new("b"));
        transport.register(id_a.clone(), RaftInbox::new(a.weak()));
        transport.register(id_b.clone(), RaftInbox::new(b.weak()));

        transport.send(&id_a, &id_b, None, RaftMessage::TimeoutNow);
        assert!(matches!(b_rx.try_recv(), Ok(Event::Raft(RaftMessage::TimeoutNow))));

        transport.isolate(&id_a);
        transport.send(&id_a, &id_b, None, RaftMessage::TimeoutNow);
        transport.send(&id_b, &id_a, None, RaftMessage::TimeoutNow);
        assert!(b_rx.try_recv().is_err());
        assert!(a_rx.try_recv().is_err());

        transport.heal(&id_a);
        transport.send(&id_b, &id_a, None, RaftMessage::TimeoutNow);
        assert!(matches!(a_rx.try_recv(), Ok(Event::Raft(RaftMessage::TimeoutNow))));
    }
}
