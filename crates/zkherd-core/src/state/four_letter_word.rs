//! ZooKeeper four-letter-word status protocol.
//!
//! The server answers a four character command sent over its client port
//! with plain text and then closes the connection.

use async_trait::async_trait;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;

use super::ProbeResult;

/// Commands understood by the supervised server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FourLetterWord {
    /// Liveness probe, answered with `imok`
    Ruok,
    /// Brief server status
    Srvr,
    Stat,
    Conf,
    Cons,
    Envi,
    Mntr,
    Wchs,
}

impl FourLetterWord {
    pub fn as_str(&self) -> &'static str {
        match self {
            FourLetterWord::Ruok => "ruok",
            FourLetterWord::Srvr => "srvr",
            FourLetterWord::Stat => "stat",
            FourLetterWord::Conf => "conf",
            FourLetterWord::Cons => "cons",
            FourLetterWord::Envi => "envi",
            FourLetterWord::Mntr => "mntr",
            FourLetterWord::Wchs => "wchs",
        }
    }
}

impl fmt::Display for FourLetterWord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FourLetterWord {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let word = match s.trim().to_ascii_lowercase().as_str() {
            "ruok" => FourLetterWord::Ruok,
            "srvr" => FourLetterWord::Srvr,
            "stat" => FourLetterWord::Stat,
            "conf" => FourLetterWord::Conf,
            "cons" => FourLetterWord::Cons,
            "envi" => FourLetterWord::Envi,
            "mntr" => FourLetterWord::Mntr,
            "wchs" => FourLetterWord::Wchs,
            other => return Err(format!("unsupported four letter word: {}", other)),
        };
        Ok(word)
    }
}

/// Sends a four-letter word to the supervised server.
///
/// Implementations never fail: an unreachable server yields an empty
/// response, which callers treat as "no answer".
#[async_trait]
pub trait StatusProtocol: Send + Sync {
    async fn send(&self, word: FourLetterWord) -> String;
}

/// [`StatusProtocol`] over a TCP connection to the client port.
#[derive(Debug, Clone)]
pub struct TcpStatusProtocol {
    addr: String,
    timeout: Duration,
}

impl TcpStatusProtocol {
    pub fn new(host: &str, port: u16, timeout: Duration) -> Self {
        Self {
            addr: format!("{}:{}", host, port),
            timeout,
        }
    }

    async fn exchange(&self, word: FourLetterWord) -> std::io::Result<String> {
        let mut stream = TcpStream::connect(&self.addr).await?;
        stream.write_all(word.as_str().as_bytes()).await?;
        stream.shutdown().await?;

        let mut response = String::new();
        stream.read_to_string(&mut response).await?;
        Ok(response)
    }
}

#[async_trait]
impl StatusProtocol for TcpStatusProtocol {
    async fn send(&self, word: FourLetterWord) -> String {
        match tokio::time::timeout(self.timeout, self.exchange(word)).await {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => {
                debug!("Four letter word {} to {} failed: {}", word, self.addr, e);
                String::new()
            }
            Err(_) => {
                debug!("Four letter word {} to {} timed out", word, self.addr);
                String::new()
            }
        }
    }
}

/// Interprets the text of a `srvr` response.
///
/// The patterns are tied to the server's own output format, so they are kept
/// here as data rather than spread across callers.
#[derive(Debug, Clone)]
pub struct StatusMatcher {
    pub liveness_token: String,
    pub not_serving: String,
    pub mode_prefix: String,
    pub leader_mode: String,
}

impl Default for StatusMatcher {
    fn default() -> Self {
        Self {
            liveness_token: "imok".to_string(),
            not_serving: "not currently serving".to_string(),
            mode_prefix: "mode".to_string(),
            leader_mode: "leader".to_string(),
        }
    }
}

impl StatusMatcher {
    pub fn is_alive(&self, ruok_response: &str) -> bool {
        ruok_response.trim() == self.liveness_token
    }

    /// Classifies a status dump from a server that passed the liveness probe.
    pub fn classify(&self, srvr_response: &str) -> ProbeResult {
        for line in srvr_response.lines() {
            let lower = line.trim().to_ascii_lowercase();
            if lower.contains(&self.not_serving) {
                return ProbeResult::NotServing;
            }
            if lower.starts_with(&self.mode_prefix) {
                let is_leader = lower
                    .split_once(':')
                    .map(|(_, mode)| mode.trim() == self.leader_mode)
                    .unwrap_or(false);
                return ProbeResult::Serving { is_leader };
            }
        }
        ProbeResult::Alive
    }
}
