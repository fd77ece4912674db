//! In-memory driving helpers.

use std::io;

use corewcf::connection::Connection;
use futures::FutureExt as _;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream, duplex};

/// Duplex buffer used when a test does not pick one.
pub const DEFAULT_CAPACITY: usize = 4096;

/// Read buffer of connections created by these helpers.
pub const CONNECTION_BUFFER: usize = 256;

/// A server-side [`Connection`] and the raw client stream talking to it.
#[must_use]
pub fn connection_pair(capacity: usize) -> (Connection, DuplexStream) {
    let (server, client) = duplex(capacity);
    (Connection::new(server, CONNECTION_BUFFER), client)
}

/// Run `server_fn` on a fresh connection, write each chunk to its client
/// half, shut the client's write side, and return every byte the server
/// wrote.
///
/// A panic in the server surfaces as an `io::Error` beginning with
/// `"server task failed"`.
///
/// ```rust
/// use corewcf::connection::Connection;
/// use corewcf_testing::drive;
///
/// async fn greet(mut server: Connection) { let _ = server.write_all(&[0x0B]).await; }
///
/// # async fn demo() -> std::io::Result<()> {
/// let bytes = drive(greet, vec![vec![0]]).await?;
/// assert_eq!(bytes, [0x0B]);
/// # Ok(())
/// # }
/// ```
///
/// # Errors
///
/// Returns an error if writing or reading the client half fails, or if the
/// server panics.
pub async fn drive<F, Fut>(server_fn: F, chunks: Vec<Vec<u8>>) -> io::Result<Vec<u8>>
where
    F: FnOnce(Connection) -> Fut,
    Fut: Future<Output = ()> + Send,
{
    drive_with_capacity(server_fn, chunks, DEFAULT_CAPACITY).await
}

/// [`drive`] with an explicit duplex buffer size.
///
/// # Errors
///
/// As [`drive`].
pub async fn drive_with_capacity<F, Fut>(
    server_fn: F,
    chunks: Vec<Vec<u8>>,
    capacity: usize,
) -> io::Result<Vec<u8>>
where
    F: FnOnce(Connection) -> Fut,
    Fut: Future<Output = ()> + Send,
{
    let (server, mut client) = connection_pair(capacity);

    let server_fut = async {
        match std::panic::AssertUnwindSafe(server_fn(server))
            .catch_unwind()
            .await
        {
            Ok(()) => Ok(()),
            Err(panic) => {
                let panic_msg = corewcf::panic::format_panic(panic.as_ref());
                Err(io::Error::other(format!("server task failed: {panic_msg}")))
            }
        }
    };

    let client_fut = async {
        for chunk in &chunks {
            client.write_all(chunk).await?;
        }
        client.shutdown().await?;

        let mut buf = Vec::new();
        client.read_to_end(&mut buf).await?;
        io::Result::Ok(buf)
    };

    let ((), buf) = tokio::try_join!(server_fut, client_fut)?;
    Ok(buf)
}
