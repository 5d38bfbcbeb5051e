// =============================================================================
// Stream Merger - N bounded candle streams into one
// =============================================================================

use tokio::sync::mpsc;
use tracing::debug;

/// Merge `sources` into one bounded channel of `capacity`.
///
/// One forwarding task per source. Items reach the output in first-ready order
/// across sources while each source keeps its own order. The output closes
/// once every source has closed. A slow consumer back-pressures every source;
/// nothing is dropped.
pub fn merge<T: Send + 'static>(
    sources: Vec<mpsc::Receiver<T>>,
    capacity: usize,
) -> mpsc::Receiver<T> {
    let (tx, rx) = mpsc::channel(capacity.max(1));

    for (index, mut source) in sources.into_iter().enumerate() {
        let tx = tx.clone();
        tokio::spawn(async move {
            let mut forwarded: u64 = 0;
            while let Some(item) = source.recv().await {
                if tx.send(item).await.is_err() {
                    debug!(source = index, "merged output dropped; forwarder stopping");
                    return;
                }
                forwarded += 1;
            }
            debug!(source = index, forwarded, "merge source closed");
        });
    }

    rx
}
