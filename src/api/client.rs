use crate::actor::{ActorClient, ActorExited};
use crate::replica::{
    LeadershipTransferError, MemberId, RaftRole, RaftState, ServerChangeReply, ServerChangeRequest,
    SnapshotRequestError, SubmitError, SubmitOutput, SwitchBehaviorError, Term,
};
use bytes::Bytes;
use std::collections::BTreeMap;

/// RaftClient is the application's handle to its local raft member. Every call is answered by
/// the member's task. Cloning is cheap and clones talk to the same member.
#[derive(Clone)]
pub struct RaftClient {
    actor_client: ActorClient,
}

impl RaftClient {
    pub(crate) fn new(actor_client: ActorClient) -> Self {
        RaftClient { actor_client }
    }

    /// Replicates `data`. Resolves once the entry is applied to the local state machine.
    pub async fn submit(&self, data: Bytes) -> Result<SubmitOutput, SubmitError> {
        self.actor_client.submit(data).await
    }

    pub async fn add_server(
        &self,
        member_id: MemberId,
        address: Option<String>,
        voting: bool,
    ) -> Result<ServerChangeReply, ActorExited> {
        self.actor_client
            .change_servers(ServerChangeRequest::AddServer {
                id: member_id,
                address,
                voting,
            })
            .await
    }

    pub async fn remove_server(&self, member_id: MemberId) -> Result<ServerChangeReply, ActorExited> {
        self.actor_client
            .change_servers(ServerChangeRequest::RemoveServer { id: member_id })
            .await
    }

    pub async fn change_servers_voting_status(
        &self,
        voting: BTreeMap<MemberId, bool>,
    ) -> Result<ServerChangeReply, ActorExited> {
        self.actor_client
            .change_servers(ServerChangeRequest::ChangeServersVotingStatus {
                voting,
                servers_visited: Vec::new(),
            })
            .await
    }

    /// Hands leadership to `target`, or to any caught up voting follower. Only a leader can.
    pub async fn request_leadership(&self, target: Option<MemberId>) -> Result<(), LeadershipTransferError> {
        self.actor_client.request_leadership(target).await
    }

    pub async fn get_state(&self) -> Result<RaftState, ActorExited> {
        self.actor_client.get_state().await
    }

    pub async fn capture_snapshot(&self) -> Result<(), SnapshotRequestError> {
        self.actor_client.capture_snapshot().await
    }

    /// Forces the member into `role` at `term`. Requires elections to be disabled.
    pub async fn switch_behavior(&self, role: RaftRole, term: Term) -> Result<(), SwitchBehaviorError> {
        self.actor_client.switch_behavior(role, term).await
    }

    /// Stops the member. A leader tries to hand over leadership first.
    pub async fn shutdown(&self) {
        self.actor_client.shutdown().await
    }
}
