//! Remote ref sync
//!
//! Cross-machine sharing over nothing but plain git remotes: local heads
//! are published under an owner-scoped namespace, and subscribed owners'
//! namespaces are fetched into `refs/quipu/remotes/`. No merge or conflict
//! logic lives here - the single-writer assumption stands.

use crate::gitdb::{GitDb, Result};

/// Push `refs/quipu/local/heads/*` to `refs/quipu/<owner>/heads/*` on the
/// remote.
pub fn push_refs(git: &GitDb, remote: &str, owner_id: &str) -> Result<()> {
    let refspec = format!(
        "refs/quipu/local/heads/*:refs/quipu/{}/heads/*",
        owner_id
    );
    tracing::debug!(remote, refspec = %refspec, "pushing quipu refs");
    git.push(remote, &refspec)
}

/// Fetch each subscribed owner's namespace into
/// `refs/quipu/remotes/<owner>/heads/*`.
pub fn fetch_refs(git: &GitDb, remote: &str, subscriptions: &[String]) -> Result<()> {
    for owner in subscriptions {
        let refspec = format!(
            "refs/quipu/{owner}/heads/*:refs/quipu/remotes/{owner}/heads/*",
            owner = owner
        );
        tracing::debug!(remote, refspec = %refspec, "fetching quipu refs");
        git.fetch(remote, &refspec)?;
    }
    Ok(())
}
