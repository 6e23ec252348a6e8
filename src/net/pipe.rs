use super::{ReadTransport, WriteTransport};
use crate::common::{Buffer, Result};

/// Copies from `reader` to `writer` until the reader reports end of
/// stream, reusing one buffer for the whole session. Whatever the buffer
/// already holds is flushed first, which is how a handler's rewritten
/// handshake bytes become the first thing on the wire.
pub async fn pipe<R, W>(reader: &mut R, writer: &mut W, buf: &mut Buffer) -> Result<()>
where
    R: ReadTransport + ?Sized,
    W: WriteTransport + ?Sized,
{
    loop {
        writer.write(buf).await?;
        if reader.read(buf).await? == 0 {
            break;
        }
    }
    writer.write(buf).await?;
    Ok(())
}

/// Runs both directions concurrently and finishes with whichever direction
/// finishes first; the other future is dropped, cancelling its pending
/// socket I/O. A proxy treats one closed half as the end of the session;
/// half-close is not forwarded.
pub async fn bidirectional_pipe<AR, AW, BR, BW>(
    a_reader: &mut AR,
    a_writer: &mut AW,
    b_reader: &mut BR,
    b_writer: &mut BW,
    buf_ab: &mut Buffer,
    buf_ba: &mut Buffer,
) -> Result<()>
where
    AR: ReadTransport + ?Sized,
    AW: WriteTransport + ?Sized,
    BR: ReadTransport + ?Sized,
    BW: WriteTransport + ?Sized,
{
    tokio::select! {
        res = pipe(a_reader, b_writer, buf_ab) => res,
        res = pipe(b_reader, a_writer, buf_ba) => res,
    }
}
