use thiserror::Error;

pub type Result<T, E = Error> = core::result::Result<T, E>;

/// Error kinds recognised by the core (see the error handling table: Timeout,
/// MalformedEndpoint, TransportClosed, DeviceError are surfaced; UnmappedSource and
/// FanoutSendError are not exceptions here — they're represented in-band as `None`
/// return values and swallowed sends, respectively).
#[derive(Debug, Error)]
pub enum Error {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("serde: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("config: {0}")]
    Config(String),
    #[error("protocol: {0}")]
    Protocol(String),
    /// A read/write deadline elapsed. Benign in steady-state loops.
    #[error("timeout")]
    Timeout,
    /// JSON decode, base64 decode, or wrong arity while parsing an endpoint or gossip
    /// message. The offending message is dropped, not propagated to a caller that would
    /// abort a loop over it — this variant exists so call sites can log and continue.
    #[error("malformed endpoint: {0}")]
    MalformedEndpoint(String),
    /// The signal bus reported a non-timeout read/write failure; reader/prober tasks
    /// should terminate.
    #[error("transport closed: {0}")]
    TransportClosed(String),
    /// Virtual-interface read/write failure. Fatal for the owning pump task.
    #[error("device error: {0}")]
    Device(String),
    /// Config-file watcher setup or a watch-path registration failed.
    #[error("notify: {0}")]
    Notify(#[from] notify::Error),
}

impl Error {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }
    pub fn malformed(msg: impl Into<String>) -> Self {
        Self::MalformedEndpoint(msg.into())
    }
    pub fn transport_closed(msg: impl Into<String>) -> Self {
        Self::TransportClosed(msg.into())
    }
    pub fn device(msg: impl Into<String>) -> Self {
        Self::Device(msg.into())
    }

    /// True for errors steady-state loops should treat as soft and continue past.
    pub fn is_benign(&self) -> bool {
        matches!(self, Error::Timeout | Error::MalformedEndpoint(_))
    }
}

impl From<toml::de::Error> for Error {
    fn from(e: toml::de::Error) -> Self {
        Error::Config(e.to_string())
    }
}
