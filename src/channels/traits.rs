use crate::channels::notices::{BountyWonNotice, NewBountyNotice};
use async_trait::async_trait;

/// Announcement sink for bounty events. Failures are reported to the caller,
/// which logs them; they never undo the state change being announced.
#[async_trait]
pub trait Announcer: Send + Sync {
    /// Stable identifier for logs (e.g. `discord`, `log`).
    fn id(&self) -> &'static str;

    async fn announce_new_bounty(&self, notice: &NewBountyNotice) -> anyhow::Result<()>;

    async fn announce_bounty_won(&self, notice: &BountyWonNotice) -> anyhow::Result<()>;
}
