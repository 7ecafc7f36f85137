use std::io;

use tokio::io::{AsyncRead, AsyncReadExt};

/// Drains `reader` to the end, keeping at most `max_bytes`. The rest is read and
/// discarded so a chatty child never blocks on a full pipe.
pub(super) async fn read_stream_capture<R: AsyncRead + Unpin>(
    mut reader: R,
    max_bytes: usize,
) -> io::Result<(Vec<u8>, bool)> {
    let mut kept = Vec::new();
    let mut truncated = false;
    let mut chunk = [0u8; 8192];
    loop {
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        let room = max_bytes.saturating_sub(kept.len());
        if n > room {
            truncated = true;
        }
        kept.extend_from_slice(&chunk[..n.min(room)]);
    }
    Ok((kept, truncated))
}
