use crate::error::ProxyError;
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

/// Bidirectionally copy bytes between `client` and `upstream` until either
/// side half-closes, observing `cancel` at the single suspension point.
pub async fn copy_bidirectional(
    mut client: TcpStream,
    mut upstream: TcpStream,
    cancel: &CancellationToken,
) -> Result<(), ProxyError> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(ProxyError::Cancelled),
        result = tokio::io::copy_bidirectional(&mut client, &mut upstream) => {
            result.map(|_| ()).map_err(|e| ProxyError::Transport(e.to_string()))
        }
    }
}
