use std::io::Read;
use std::net::TcpStream;
use std::path::{Path, PathBuf};
use std::sync::mpsc::Sender;
use std::time::Duration;

use time::macros::format_description;
use time::OffsetDateTime;

use super::config::Config;
use super::constants::{HOLDING_DIR, PROCESSING_DIR};
use super::error::ListenerError;
use super::listener_status::{ListenerState, ListenerStatus};

/// Name of the file a flush taken at `now` is stored under
pub fn flush_file_name(ip: &str, now: OffsetDateTime) -> Result<String, ListenerError> {
    let stamp = now.format(format_description!(
        "[year][month][day]_[hour][minute][second]_[subsecond digits:6]"
    ))?;
    Ok(format!("{ip}_{stamp}.txt"))
}

/// Records the iCom stream of one linac to disk.
///
/// Each flush collects a fixed number of socket reads, writes them to the holding directory
/// and renames the file into the processing directory, so anything watching processing only
/// ever sees complete files. Socket errors drop the connection and the next flush reconnects.
#[derive(Debug)]
pub struct IcomListener {
    ip: String,
    port: u16,
    reads_per_flush: usize,
    read_size: usize,
    reconnect_delay: Duration,
    holding_dir: PathBuf,
    processing_dir: PathBuf,
    stream: Option<TcpStream>,
    flushes: u64,
    bytes_written: u64,
}

impl IcomListener {
    pub fn new(config: &Config, ip: &str, data_dir: &Path) -> Result<Self, ListenerError> {
        let holding_dir = data_dir.join(HOLDING_DIR);
        let processing_dir = data_dir.join(PROCESSING_DIR);
        std::fs::create_dir_all(&holding_dir)?;
        std::fs::create_dir_all(&processing_dir)?;

        Ok(Self {
            ip: ip.to_string(),
            port: config.icom_port,
            reads_per_flush: config.icom_reads_per_flush,
            read_size: config.icom_read_size,
            reconnect_delay: Duration::from_secs(config.icom_reconnect_delay_secs),
            holding_dir,
            processing_dir,
            stream: None,
            flushes: 0,
            bytes_written: 0,
        })
    }

    pub fn processing_dir(&self) -> &Path {
        &self.processing_dir
    }

    fn status(&self, state: ListenerState) -> ListenerStatus {
        ListenerStatus::new(&self.ip, state, self.flushes, self.bytes_written)
    }

    /// Block until a connection is open
    fn connect(&mut self, tx: &Sender<ListenerStatus>) -> Result<TcpStream, ListenerError> {
        loop {
            if let Some(stream) = self.stream.take() {
                return Ok(stream);
            }
            tx.send(self.status(ListenerState::Connecting))?;
            match TcpStream::connect((self.ip.as_str(), self.port)) {
                Ok(stream) => {
                    spdlog::info!("Connected to iCom at {}:{}", self.ip, self.port);
                    tx.send(self.status(ListenerState::Connected))?;
                    self.stream = Some(stream);
                }
                Err(e) => {
                    spdlog::warn!(
                        "Could not connect to iCom at {}:{} ({e}), retrying in {}s",
                        self.ip,
                        self.port,
                        self.reconnect_delay.as_secs()
                    );
                    std::thread::sleep(self.reconnect_delay);
                }
            }
        }
    }

    /// Read up to reads_per_flush chunks. Any error is returned with the bytes read before it.
    fn read_chunk(&self, stream: &mut TcpStream) -> (Vec<u8>, Option<std::io::Error>) {
        let mut data = Vec::new();
        let mut buffer = vec![0u8; self.read_size];
        for _ in 0..self.reads_per_flush {
            match stream.read(&mut buffer) {
                Ok(0) => {
                    return (
                        data,
                        Some(std::io::Error::new(
                            std::io::ErrorKind::ConnectionAborted,
                            "iCom connection closed by the linac",
                        )),
                    )
                }
                Ok(n) => data.extend_from_slice(&buffer[..n]),
                Err(e) => return (data, Some(e)),
            }
        }
        (data, None)
    }

    /// Write one flush via the holding directory
    pub fn write_flush(&mut self, data: &[u8]) -> Result<PathBuf, ListenerError> {
        let now = OffsetDateTime::now_local().unwrap_or_else(|_| OffsetDateTime::now_utc());
        let name = flush_file_name(&self.ip, now)?;
        let holding = self.holding_dir.join(&name);
        let processing = self.processing_dir.join(&name);
        std::fs::write(&holding, data)?;
        std::fs::rename(&holding, &processing)?;

        self.flushes += 1;
        self.bytes_written += data.len() as u64;
        spdlog::debug!(
            "Flushed {} of iCom data to {}",
            human_bytes::human_bytes(data.len() as f64),
            processing.to_string_lossy()
        );
        Ok(processing)
    }

    /// Collect and write the next flush, reconnecting as needed
    pub fn next_flush(&mut self, tx: &Sender<ListenerStatus>) -> Result<PathBuf, ListenerError> {
        loop {
            let mut stream = self.connect(tx)?;
            let (data, error) = self.read_chunk(&mut stream);
            match error {
                None => self.stream = Some(stream),
                Some(e) => {
                    spdlog::warn!("Lost iCom connection to {} ({e})", self.ip);
                    tx.send(self.status(ListenerState::Reconnecting))?;
                }
            }

            if !data.is_empty() {
                let path = self.write_flush(&data)?;
                tx.send(self.status(ListenerState::Flushed))?;
                return Ok(path);
            }
            if self.stream.is_none() {
                std::thread::sleep(self.reconnect_delay);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::net::TcpListener;
    use std::sync::mpsc::channel;
    use time::macros::datetime;

    #[test]
    fn test_flush_file_name() {
        let now = datetime!(2019-06-14 03:21:08.123456 UTC);
        assert_eq!(
            flush_file_name("192.168.100.200", now).unwrap(),
            "192.168.100.200_20190614_032108_123456.txt"
        );
    }

    #[test]
    fn test_listen_to_stream() {
        let server = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = server.local_addr().unwrap().port();
        let handle = std::thread::spawn(move || {
            let (mut socket, _) = server.accept().unwrap();
            socket.write_all(b"2019-06-1412:00:01 record").unwrap();
        });

        let dir = tempfile::tempdir().unwrap();
        let config = Config {
            icom_port: port,
            icom_reads_per_flush: 1000,
            icom_read_size: 8,
            icom_reconnect_delay_secs: 0,
            ..Config::default()
        };
        let mut listener = IcomListener::new(&config, "127.0.0.1", dir.path()).unwrap();
        let (tx, rx) = channel();
        let path = listener.next_flush(&tx).unwrap();
        handle.join().unwrap();

        assert_eq!(path.parent().unwrap(), listener.processing_dir());
        assert_eq!(std::fs::read(&path).unwrap(), b"2019-06-1412:00:01 record");
        assert_eq!(
            std::fs::read_dir(dir.path().join(HOLDING_DIR)).unwrap().count(),
            0
        );

        let states: Vec<ListenerState> = rx.try_iter().map(|s| s.state).collect();
        assert_eq!(states.first(), Some(&ListenerState::Connecting));
        assert_eq!(states.last(), Some(&ListenerState::Flushed));
    }
}
