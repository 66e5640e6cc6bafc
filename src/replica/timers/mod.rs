mod follower_timer;
mod leader_timer;
mod scheduled;

#[cfg(test)]
mod mailbox_probe;

pub(crate) use follower_timer::FollowerTimerHandle;
pub(crate) use leader_timer::LeaderTimerHandle;
pub(crate) use scheduled::{ScheduledTimeout, TimeoutKind};
