//! Newline-delimited JSON transport over a byte stream.
//!
//! Used by the `assistant-host` binary to serve the bridge on stdin/stdout.
//! Stdout is reserved for frames; logs go to stderr.

use super::channel::{channel_pair, Channel};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, BufWriter};
use tokio::sync::mpsc;

/// Wrap a reader/writer pair as a [`Channel`].
///
/// One task reads lines into `incoming`, another writes everything sent on
/// `outgoing` as one line each. Both stop when their side closes.
pub fn stdio_channel<R, W>(reader: R, writer: W, capacity: usize) -> Channel
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (local, remote) = channel_pair(capacity);
    let (to_local, from_local) = remote.split();
    tokio::spawn(read_lines(reader, to_local));
    tokio::spawn(write_lines(writer, from_local));
    local
}

async fn read_lines<R>(reader: R, tx: mpsc::Sender<String>)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                if tx.send(line.to_string()).await.is_err() {
                    break;
                }
            }
            Ok(None) => {
                log::info!("Bridge: input closed (EOF)");
                break;
            }
            Err(e) => {
                log::error!("Bridge: failed to read input: {}", e);
                break;
            }
        }
    }
}

async fn write_lines<W>(writer: W, mut rx: mpsc::Receiver<String>)
where
    W: AsyncWrite + Unpin,
{
    let mut writer = BufWriter::new(writer);
    while let Some(line) = rx.recv().await {
        let written: std::io::Result<()> = async {
            writer.write_all(line.as_bytes()).await?;
            writer.write_all(b"\n").await?;
            writer.flush().await
        }
        .await;
        if let Err(e) = written {
            log::error!("Bridge: failed to write output: {}", e);
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_lines_in_and_out() {
        let (near, far) = tokio::io::duplex(1024);
        let (near_read, near_write) = tokio::io::split(near);
        let channel = stdio_channel(near_read, near_write, 8);
        let (outgoing, mut incoming) = channel.split();

        let (far_read, mut far_write) = tokio::io::split(far);
        far_write.write_all(b"{\"a\":1}\n\n{\"b\":2}\n").await.unwrap();
        assert_eq!(incoming.recv().await.unwrap(), "{\"a\":1}");
        assert_eq!(incoming.recv().await.unwrap(), "{\"b\":2}");

        outgoing.send("{\"c\":3}".to_string()).await.unwrap();
        let mut far_lines = BufReader::new(far_read).lines();
        assert_eq!(far_lines.next_line().await.unwrap().unwrap(), "{\"c\":3}");
    }
}
