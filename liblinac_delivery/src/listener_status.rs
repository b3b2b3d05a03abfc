/// Where an IcomListener is in its connection cycle
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum ListenerState {
    #[default]
    Connecting,
    Connected,
    Flushed,
    Reconnecting,
}

/// Progress message sent by an IcomListener to whoever drives it
#[derive(Debug, Clone, Default)]
pub struct ListenerStatus {
    pub ip: String,
    pub state: ListenerState,
    pub flushes: u64,
    pub bytes_written: u64,
}

impl ListenerStatus {
    pub fn new(ip: &str, state: ListenerState, flushes: u64, bytes_written: u64) -> Self {
        Self {
            ip: ip.to_string(),
            state,
            flushes,
            bytes_written,
        }
    }
}
