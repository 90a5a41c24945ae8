//! Byte-oriented server-to-server channel.
//!
//! A thin wrapper over a blocking TCP stream with a poll (read) timeout.
//! The channel carries the connect command and the 32-bit handshake
//! integers; everything above that (framing, multiplexing) lives in
//! [`conn`](crate::conn).

use {
    log::debug,
    std::{
        io::{self, Read, Write},
        net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs},
        time::Duration,
    },
};

/// Commands understood by the connection listener on the remote side.
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectCommand {
    /// Establish a server-to-server session.
    ServerServerConnect = 1,
}

/// A connected TCP channel.
pub struct Channel {
    stream: TcpStream,
    name: String,
    peer: String,
}

impl Channel {
    /// Connect to `host:port`, apply the poll timeout and send the connect
    /// command.  The timeout bounds both the TCP connect and every
    /// subsequent read.
    pub fn connect(
        host: &str,
        port: u16,
        command: ConnectCommand,
        poll_timeout: Duration,
    ) -> io::Result<Self> {
        let addr = resolve(host, port)?;
        let stream = TcpStream::connect_timeout(&addr, poll_timeout)?;
        let mut channel = Self::setup(stream, format!("{host}:{port}"), poll_timeout)?;
        channel.send_int(command as i32)?;
        debug!("channel connected to {}", channel.peer);
        Ok(channel)
    }

    /// Wrap an already-accepted stream (the listening side of the
    /// handshake).
    pub fn from_stream(stream: TcpStream, poll_timeout: Duration) -> io::Result<Self> {
        let peer = stream
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "?".to_string());
        Self::setup(stream, peer, poll_timeout)
    }

    fn setup(stream: TcpStream, peer: String, poll_timeout: Duration) -> io::Result<Self> {
        stream.set_nodelay(true)?;
        stream.set_read_timeout(Some(poll_timeout))?;
        Ok(Self {
            stream,
            name: String::new(),
            peer,
        })
    }

    /// Assign a human-readable name included in the channel id.
    pub fn set_channel_name(&mut self, name: impl Into<String>) {
        self.name = name.into();
    }

    /// Identifier used in log lines, `"<name>:<host>:<port>"`.
    pub fn channel_id(&self) -> String {
        if self.name.is_empty() {
            self.peer.clone()
        } else {
            format!("{}:{}", self.name, self.peer)
        }
    }

    /// Send one little-endian 32-bit integer.
    pub fn send_int(&mut self, value: i32) -> io::Result<()> {
        self.stream.write_all(&value.to_le_bytes())
    }

    /// Receive one little-endian 32-bit integer.  A poll timeout surfaces
    /// as an error; the handshake peer is expected to answer promptly.
    pub fn recv_int(&mut self) -> io::Result<i32> {
        let mut buf = [0u8; 4];
        self.stream.read_exact(&mut buf)?;
        Ok(i32::from_le_bytes(buf))
    }

    /// Write raw bytes.
    pub fn send_bytes(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.stream.write_all(bytes)
    }

    /// Clone the underlying stream, e.g. for a dedicated reader thread.
    pub fn try_clone_stream(&self) -> io::Result<TcpStream> {
        self.stream.try_clone()
    }

    /// Shut down one or both halves of the stream.
    pub fn shutdown(&self, how: Shutdown) -> io::Result<()> {
        self.stream.shutdown(how)
    }
}

fn resolve(host: &str, port: u16) -> io::Result<SocketAddr> {
    (host, port)
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, format!("no address for {host}")))
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use {
        super::*,
        std::{net::TcpListener, thread, time::Duration},
    };

    const POLL: Duration = Duration::from_millis(1000);

    #[test]
    fn test_connect_sends_command_and_ints_roundtrip() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        let peer = thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let mut channel = Channel::from_stream(stream, POLL).unwrap();
            assert_eq!(
                channel.recv_int().unwrap(),
                ConnectCommand::ServerServerConnect as i32
            );
            let value = channel.recv_int().unwrap();
            channel.send_int(value).unwrap();
        });

        let mut channel =
            Channel::connect("127.0.0.1", port, ConnectCommand::ServerServerConnect, POLL).unwrap();
        channel.send_int(7).unwrap();
        assert_eq!(channel.recv_int().unwrap(), 7);
        peer.join().unwrap();
    }

    #[test]
    fn test_connect_refused() {
        // Port 1 on localhost is assumed closed.
        let result = Channel::connect("127.0.0.1", 1, ConnectCommand::ServerServerConnect, POLL);
        assert!(result.is_err());
    }

    #[test]
    fn test_channel_id_includes_name() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let accepter = thread::spawn(move || listener.accept().unwrap());

        let mut channel =
            Channel::connect("127.0.0.1", port, ConnectCommand::ServerServerConnect, POLL).unwrap();
        channel.set_channel_name("TS_PS_comm");
        assert!(channel.channel_id().starts_with("TS_PS_comm:127.0.0.1:"));
        accepter.join().unwrap();
    }
}
