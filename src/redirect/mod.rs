//! Redirect-Aware Chain Operations
//!
//! While the store re-partitions itself, blocks answer some commands with control
//! sentinels instead of data. This module is the one place that reacts to them, and
//! both façades (hash table and file) run their commands through it.
//!
//! ## Resolution Rules
//! - `!exporting!<chain>`: replay the same command, marked `!redirected`, against the
//!   named chain; repeat until something else comes back.
//! - `!block_moved`: the caller's partition map is stale. Surfaced as
//!   [`Resolution::Refresh`] so the façade can reload the map and redo the operation.
//! - `!redo`: surfaced as [`Resolution::Redo`]; the caller resends.
//! - Everything else, including the façade-specific split sentinels, is handed back
//!   untouched as [`Resolution::Done`].

pub mod batch;
pub mod scope;

pub use batch::dispatch_batch;
pub use scope::RedirectScope;

use crate::error::{ClientError, Result};
use crate::protocol::{CommandSet, Reply, Sentinel};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    Done(Reply),
    Refresh,
    Redo,
}

/// Follows redirects starting from a reply already received for `op(args)`.
pub async fn resolve<Op: CommandSet>(
    scope: &mut RedirectScope<'_>,
    op: Op,
    args: &[Vec<u8>],
    mut reply: Reply,
) -> Result<Resolution> {
    let max_hops = scope.max_redo();
    let mut hops = 0;

    loop {
        match reply {
            Reply::Sentinel(Sentinel::Exporting(chain)) => {
                hops += 1;
                if hops > max_hops {
                    return Err(ClientError::RedoLimitExceeded(max_hops));
                }
                tracing::debug!("{} redirected to exporting target {}", op.name(), chain);
                let target = scope.client_for(&chain).await?;
                reply = target.run_redirected(op, args.to_vec()).await?;
            }
            Reply::Sentinel(Sentinel::BlockMoved) => {
                tracing::debug!("{} hit a moved block", op.name());
                return Ok(Resolution::Refresh);
            }
            Reply::Sentinel(Sentinel::Redo) => return Ok(Resolution::Redo),
            other => return Ok(Resolution::Done(other)),
        }
    }
}
