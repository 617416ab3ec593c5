//! Hand-rolled MPD control client (spec §4.8): the line protocol is a
//! handful of newline-terminated commands over a plain TCP socket, so no
//! external MPD client crate is pulled in — grounded in the same
//! "roll our own wire format" idiom as `ipc.rs`'s length-prefixed framing.

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

use crate::error::CoreError;

pub struct MpdClient {
    stream: BufReader<TcpStream>,
}

impl MpdClient {
    /// Connects and consumes the `OK MPD <version>` banner.
    pub async fn connect(port: u16) -> Result<Self, CoreError> {
        let stream = TcpStream::connect(("127.0.0.1", port)).await?;
        let mut client = Self { stream: BufReader::new(stream) };
        let banner = client.read_line().await?;
        if !banner.starts_with("OK MPD") {
            return Err(CoreError::Io(format!("unexpected MPD banner: {banner}")));
        }
        Ok(client)
    }

    async fn read_line(&mut self) -> Result<String, CoreError> {
        let mut line = String::new();
        self.stream.read_line(&mut line).await?;
        Ok(line.trim_end().to_string())
    }

    /// Sends one command and reads until `OK`/`ACK` terminates the response.
    async fn command(&mut self, line: &str) -> Result<Vec<String>, CoreError> {
        self.stream.get_mut().write_all(format!("{line}\n").as_bytes()).await?;
        let mut lines = Vec::new();
        loop {
            let reply = self.read_line().await?;
            if reply == "OK" {
                return Ok(lines);
            }
            if let Some(detail) = reply.strip_prefix("ACK ") {
                return Err(CoreError::Io(format!("MPD error: {detail}")));
            }
            lines.push(reply);
        }
    }

    pub async fn play(&mut self) -> Result<(), CoreError> {
        self.command("play").await.map(|_| ())
    }

    pub async fn pause(&mut self) -> Result<(), CoreError> {
        self.command("pause 1").await.map(|_| ())
    }

    pub async fn next(&mut self) -> Result<(), CoreError> {
        self.command("next").await.map(|_| ())
    }

    pub async fn previous(&mut self) -> Result<(), CoreError> {
        self.command("previous").await.map(|_| ())
    }

    /// Sets the MPD mixer volume (0-100), applied to the underlying sink on
    /// first start only (spec §4.8).
    pub async fn set_volume(&mut self, pct: u8) -> Result<(), CoreError> {
        self.command(&format!("setvol {}", pct.min(100))).await.map(|_| ())
    }

    pub async fn close(mut self) {
        let _ = self.command("close").await;
    }
}
