use super::scope::RedirectScope;
use super::{Resolution, resolve};
use crate::error::{ClientError, Result};
use crate::protocol::CommandSet;
use crate::routing::PartitionRouter;

use std::collections::BTreeMap;

/// Runs one batch step for the elements listed in `pending`.
///
/// `groups[i]` is the argument group of element `i`, key first. Elements are grouped
/// by partition with their positions preserved, one request per partition is sent
/// before any response is awaited, and every element's reply then goes through the
/// same redirect resolution as a single-key call. Results come back tagged with the
/// element's position.
pub async fn dispatch_batch<Op: CommandSet>(
    scope: &mut RedirectScope<'_>,
    router: &PartitionRouter,
    op: Op,
    groups: &[Vec<Vec<u8>>],
    pending: &[usize],
) -> Result<Vec<(usize, Resolution)>> {
    let mut by_partition: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
    for &position in pending {
        let key = groups[position].first().ok_or_else(|| {
            ClientError::InvalidArguments(format!("batch element {position} has no key"))
        })?;
        by_partition
            .entry(router.route(key))
            .or_default()
            .push(position);
    }

    let mut in_flight = Vec::with_capacity(by_partition.len());
    for (&partition, positions) in &by_partition {
        let args: Vec<Vec<u8>> = positions
            .iter()
            .flat_map(|&p| groups[p].iter().cloned())
            .collect();
        let sent = scope.known(partition)?.send(op, args.clone()).await;
        in_flight.push((partition, positions, args, sent));
    }

    // Drain every partition before looking at any result so nothing is left in flight.
    let mut received = Vec::with_capacity(in_flight.len());
    for (partition, positions, args, sent) in in_flight {
        let replies = match scope.known(partition) {
            Ok(client) => client.finish_batch(op, args, sent).await,
            Err(e) => Err(e),
        };
        received.push((positions, replies));
    }

    let mut resolved = Vec::with_capacity(pending.len());
    for (positions, replies) in received {
        let replies = replies?;
        if replies.len() != positions.len() {
            return Err(ClientError::MalformedResponse(format!(
                "{} results for a batch of {}",
                replies.len(),
                positions.len()
            )));
        }
        for (&position, reply) in positions.iter().zip(replies) {
            let resolution = resolve(scope, op, &groups[position], reply).await?;
            resolved.push((position, resolution));
        }
    }

    tracing::trace!(
        "{} batch of {} element(s) over {} partition(s)",
        op.name(),
        pending.len(),
        by_partition.len()
    );
    Ok(resolved)
}
