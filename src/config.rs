use std::time::Duration;

/// Fine-grained configuration of the staged server
#[derive(Debug, Clone)]
pub struct Config {
    pub(crate) port: u16,
    pub(crate) reader_threads: usize,
    pub(crate) handler_threads: usize,
    pub(crate) writer_threads: usize,
    pub(crate) max_connections: u64,
    pub(crate) max_events: usize,
    pub(crate) poll_timeout: Duration,
    pub(crate) read_chunk: usize,
}

impl Config {
    pub fn new() -> Config {
        Config {
            port: 0,
            reader_threads: 2,
            handler_threads: 2,
            writer_threads: 2,
            max_connections: 10_000,
            max_events: 1024,
            poll_timeout: Duration::from_millis(50),
            read_chunk: 2048,
        }
    }

    pub fn port(&mut self, port: u16) -> &mut Self {
        self.port = port;
        self
    }

    /// Worker counts for the three HTTP stages. Zero means the stage
    /// runs inline on the caller, which is useful in tests.
    pub fn stage_threads(&mut self, reader: usize, handler: usize,
                         writer: usize)
        -> &mut Self
    {
        self.reader_threads = reader;
        self.handler_threads = handler;
        self.writer_threads = writer;
        self
    }

    /// Cap used both for the RLIMIT_NOFILE raise and the epoll event
    /// buffer sizing.
    pub fn max_connections(&mut self, limit: u64) -> &mut Self {
        self.max_connections = limit;
        self
    }

    pub fn poll_timeout(&mut self, timeout: Duration) -> &mut Self {
        self.poll_timeout = timeout;
        self
    }

    /// How many bytes a single `read` may pull into the receive
    /// window.
    pub fn read_chunk(&mut self, bytes: usize) -> &mut Self {
        self.read_chunk = bytes;
        self
    }

    pub fn done(&mut self) -> Config {
        self.clone()
    }
}

impl Default for Config {
    fn default() -> Config {
        Config::new()
    }
}
