//! Hook runner contract.
//!
//! Rule execution (running commands inside application pods) is an external
//! capability.  The only piece the controllers care about is the optional
//! background-command termination handle: a rule whose actions are marked
//! `background` keeps running after `execute` returns, until the returned
//! sender is signaled.

use async_trait::async_trait;
use tokio::sync::oneshot;

use crate::crd::group_volume_snapshot::GroupVolumeSnapshot;
use crate::crd::rule::Rule;
use crate::error::Result;

/// Which side of the snapshot a rule is being run for.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RulePhase {
    PreExec,
    PostExec,
}

#[async_trait]
pub trait RuleExecutor: Send + Sync {
    /// Run every action of the rule against the owner's namespace.  When any
    /// action ran in the background, the returned sender terminates it;
    /// dropping the sender unblocks the background command as well, so a
    /// lost handle degrades to termination, never to a leak on our side.
    async fn execute(
        &self,
        rule: &Rule,
        phase: RulePhase,
        owner: &GroupVolumeSnapshot,
        namespace: &str,
    ) -> Result<Option<oneshot::Sender<()>>>;
}
