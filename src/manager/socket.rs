//! The synchronised duplex conduit to the manager.

use std::{
    io::{self, Read, Write},
    net::{Shutdown, TcpStream},
    sync::Mutex,
    time::Duration,
};

use bytes::BytesMut;
use thiserror::Error;

use crate::{
    codec::decode::{take_line, MessageDecoder},
    manager::lock,
    message::Message,
};

/// The port Asterisk serves the manager interface on unless configured otherwise.
pub const DEFAULT_PORT: u16 = 5038;

const UNKNOWN_SERVER: &str = "<unknown>";

/// A transport-layer failure. Any read or write failure after connect closes the
/// socket as a side effect.
#[derive(Debug, Error)]
pub enum SocketError {
    #[error("connection to the manager could not be established: {0}")]
    Connect(#[source] io::Error),
    #[error("connection to the manager broken while reading data: {0}")]
    Read(#[source] io::Error),
    #[error("connection to the manager broken while writing data: {0}")]
    Write(#[source] io::Error),
    #[error("the manager socket is closed")]
    Closed,
}

#[derive(Debug)]
struct ReadHalf {
    stream: TcpStream,
    buffer: BytesMut,
    decoder: MessageDecoder,
}

#[derive(Debug)]
struct WriteHalf {
    stream: TcpStream,
    connected: bool,
}

/// A TCP connection to the manager with independent read and write locks, so that a
/// blocked reader can never stall a sender and vice versa.
///
/// The configured read timeout bounds how long [`SynchronisedSocket::read_message`]
/// blocks; it exists to let the reader task notice shutdown, and expiring is not an
/// error. The `connected` flag lives under the write lock.
#[derive(Debug)]
pub struct SynchronisedSocket {
    read_half: Mutex<ReadHalf>,
    write_half: Mutex<WriteHalf>,
    server: (String, String),
}

impl SynchronisedSocket {
    /// Connects and consumes the one-line greeting.
    ///
    /// A greeting containing `/` is split into server name and version; anything else
    /// is recorded as `<unknown>`.
    pub fn connect(host: &str, port: u16, read_timeout: Duration) -> Result<Self, SocketError> {
        let stream = TcpStream::connect((host, port)).map_err(SocketError::Connect)?;
        stream
            .set_read_timeout(Some(read_timeout))
            .map_err(SocketError::Connect)?;
        let write_stream = stream.try_clone().map_err(SocketError::Connect)?;

        let mut read_half = ReadHalf {
            stream,
            buffer: BytesMut::new(),
            decoder: MessageDecoder::new(),
        };
        let greeting = read_half.read_line()?.ok_or_else(|| {
            SocketError::Connect(io::Error::new(
                io::ErrorKind::TimedOut,
                "timed out waiting for the server greeting",
            ))
        })?;

        let server = match greeting.trim().split_once('/') {
            Some((name, version)) => (name.trim().to_owned(), version.trim().to_owned()),
            None => (UNKNOWN_SERVER.to_owned(), UNKNOWN_SERVER.to_owned()),
        };

        Ok(Self {
            read_half: Mutex::new(read_half),
            write_half: Mutex::new(WriteHalf {
                stream: write_stream,
                connected: true,
            }),
            server,
        })
    }

    /// The server name and version taken from the greeting.
    pub fn server_info(&self) -> (&str, &str) {
        (&self.server.0, &self.server.1)
    }

    pub fn is_connected(&self) -> bool {
        lock(&self.write_half).connected
    }

    /// Reads one full message, or `None` when the read timeout expired first.
    ///
    /// Partial input survives the timeout; the next call resumes where this one
    /// stopped.
    pub fn read_message(&self) -> Result<Option<Message>, SocketError> {
        if !self.is_connected() {
            return Err(SocketError::Closed);
        }

        let mut half = lock(&self.read_half);
        loop {
            if let Some(line) = take_line(&mut half.buffer) {
                if let Some(message) = half.decoder.feed(&line) {
                    return Ok(Some(message));
                }
                continue;
            }

            let mut chunk = [0u8; 4096];
            match half.stream.read(&mut chunk) {
                Ok(0) => {
                    drop(half);
                    self.close();
                    return Err(SocketError::Closed);
                }
                Ok(count) => half.buffer.extend_from_slice(&chunk[..count]),
                Err(error) if is_timeout(&error) => return Ok(None),
                Err(error) => {
                    drop(half);
                    self.close();
                    return Err(SocketError::Read(error));
                }
            }
        }
    }

    /// Writes an entire encoded record.
    pub fn send(&self, bytes: &[u8]) -> Result<(), SocketError> {
        let mut half = lock(&self.write_half);
        if !half.connected {
            return Err(SocketError::Closed);
        }

        let result = half.stream.write_all(bytes).and_then(|()| half.stream.flush());
        if let Err(error) = result {
            half.connected = false;
            let _ = half.stream.shutdown(Shutdown::Both);
            return Err(SocketError::Write(error));
        }
        Ok(())
    }

    /// Closes the connection. Repeated calls are no-ops.
    pub fn close(&self) {
        let mut half = lock(&self.write_half);
        half.connected = false;
        let _ = half.stream.shutdown(Shutdown::Both);
    }
}

fn is_timeout(error: &io::Error) -> bool {
    matches!(
        error.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
    )
}

impl ReadHalf {
    fn read_line(&mut self) -> Result<Option<String>, SocketError> {
        loop {
            if let Some(line) = take_line(&mut self.buffer) {
                return Ok(Some(line));
            }
            let mut chunk = [0u8; 4096];
            match self.stream.read(&mut chunk) {
                Ok(0) => return Err(SocketError::Closed),
                Ok(count) => self.buffer.extend_from_slice(&chunk[..count]),
                Err(error) if is_timeout(&error) => return Ok(None),
                Err(error) => return Err(SocketError::Read(error)),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{net::TcpListener, thread};

    use super::*;

    fn serve(payload: &'static [u8]) -> (u16, thread::JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let handle = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            stream.write_all(payload).unwrap();
            // Hold the connection open long enough for the client to finish reading.
            thread::sleep(Duration::from_millis(500));
        });
        (port, handle)
    }

    #[test]
    fn greeting_is_split_on_slash() {
        let (port, handle) = serve(b"Asterisk Call Manager/5.0.2\r\n");
        let socket =
            SynchronisedSocket::connect("127.0.0.1", port, Duration::from_secs(1)).unwrap();
        assert_eq!(socket.server_info(), ("Asterisk Call Manager", "5.0.2"));
        handle.join().unwrap();
    }

    #[test]
    fn greeting_without_slash_is_unknown() {
        let (port, handle) = serve(b"hello\r\n");
        let socket =
            SynchronisedSocket::connect("127.0.0.1", port, Duration::from_secs(1)).unwrap();
        assert_eq!(socket.server_info(), ("<unknown>", "<unknown>"));
        handle.join().unwrap();
    }

    #[test]
    fn messages_are_read_and_timeouts_are_soft() {
        let (port, handle) =
            serve(b"Asterisk Call Manager/5.0.2\r\nEvent: FullyBooted\r\nPrivilege: system,all\r\n\r\n");
        let socket =
            SynchronisedSocket::connect("127.0.0.1", port, Duration::from_millis(100)).unwrap();

        let message = loop {
            match socket.read_message().unwrap() {
                Some(message) => break message,
                None => continue,
            }
        };
        assert_eq!(message.name(), "FullyBooted");

        // Nothing further is queued, so the read times out softly.
        assert!(matches!(socket.read_message(), Ok(None)));
        handle.join().unwrap();
    }

    #[test]
    fn close_is_idempotent_and_breaks_reads() {
        let (port, handle) = serve(b"Asterisk Call Manager/5.0.2\r\n");
        let socket =
            SynchronisedSocket::connect("127.0.0.1", port, Duration::from_secs(1)).unwrap();

        socket.close();
        socket.close();
        assert!(!socket.is_connected());
        assert!(matches!(socket.read_message(), Err(SocketError::Closed)));
        handle.join().unwrap();
    }
}
