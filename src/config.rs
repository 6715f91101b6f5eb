//! Configuration for the coordinator and both transports

use std::net::SocketAddr;
use std::time::Duration;

#[cfg(feature = "serialization")]
use serde::{Deserialize, Serialize};

use crate::codec::Codec;
use crate::partition::EdgePolicy;
use crate::worker::WorkerConfig;

/// Group mailbox configuration
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serialization", derive(Serialize, Deserialize))]
pub struct ChannelConfig {
    /// Buffer capacity
    pub capacity: usize,

    /// Whether to use bounded or unbounded channels
    pub bounded: bool,

    /// Timeout for send/receive operations (None = block forever)
    pub timeout: Option<Duration>,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            capacity: 16,
            bounded: true,
            timeout: None,
        }
    }
}

impl ChannelConfig {
    /// Create a new channel configuration with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the capacity
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    /// Set whether the channel is bounded
    pub fn with_bounded(mut self, bounded: bool) -> Self {
        self.bounded = bounded;
        self
    }

    /// Set the timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Group transport configuration
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serialization", derive(Serialize, Deserialize))]
pub struct GroupConfig {
    /// Number of worker ranks (the coordinator is an extra participant)
    pub num_workers: usize,

    /// Mailbox settings for every rank
    pub channel: ChannelConfig,

    /// Thread template for every rank
    pub worker: WorkerConfig,

    /// Pin rank `i` to core `i % cores`
    pub pin_workers: bool,
}

impl Default for GroupConfig {
    fn default() -> Self {
        Self {
            num_workers: num_cpus::get(),
            channel: ChannelConfig::default(),
            worker: WorkerConfig::default(),
            pin_workers: false,
        }
    }
}

impl GroupConfig {
    /// Create a new group configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the number of worker ranks
    pub fn with_num_workers(mut self, num: usize) -> Self {
        self.num_workers = num;
        self
    }

    /// Set the mailbox configuration
    pub fn with_channel(mut self, channel: ChannelConfig) -> Self {
        self.channel = channel;
        self
    }

    /// Set the worker thread template
    pub fn with_worker_config(mut self, worker: WorkerConfig) -> Self {
        self.worker = worker;
        self
    }

    /// Enable CPU pinning
    pub fn with_pinning(mut self, enable: bool) -> Self {
        self.pin_workers = enable;
        self
    }

    /// Total participants including the coordinator
    pub fn group_size(&self) -> usize {
        self.num_workers + 1
    }
}

/// Peer transport configuration
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serialization", derive(Serialize, Deserialize))]
pub struct PeerConfig {
    /// Worker endpoints; endpoint `i` serves worker `i + 1`
    pub endpoints: Vec<SocketAddr>,

    /// Time allowed to establish a connection
    pub connect_timeout: Duration,

    /// Socket read/write timeout
    pub io_timeout: Duration,

    /// Time the coordinator waits for a worker's result
    pub collect_timeout: Duration,

    /// Extra attempts after a retryable failure
    pub max_retries: u32,

    /// Pause between attempts
    pub retry_backoff: Duration,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            endpoints: Vec::new(),
            connect_timeout: Duration::from_secs(5),
            io_timeout: Duration::from_secs(30),
            collect_timeout: Duration::from_secs(30),
            max_retries: 2,
            retry_backoff: Duration::from_millis(200),
        }
    }
}

impl PeerConfig {
    /// Create a configuration for the given endpoints
    pub fn new(endpoints: Vec<SocketAddr>) -> Self {
        Self {
            endpoints,
            ..Self::default()
        }
    }

    /// Set the connect timeout
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set the socket timeout
    pub fn with_io_timeout(mut self, timeout: Duration) -> Self {
        self.io_timeout = timeout;
        self
    }

    /// Set the collect timeout
    pub fn with_collect_timeout(mut self, timeout: Duration) -> Self {
        self.collect_timeout = timeout;
        self
    }

    /// Set the retry budget
    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    /// Set the pause between attempts
    pub fn with_retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff = backoff;
        self
    }
}

/// Coordinator configuration
#[derive(Debug, Clone, Copy, Default)]
#[cfg_attr(feature = "serialization", derive(Serialize, Deserialize))]
pub struct CoordinatorConfig {
    /// Encoding for band payloads
    pub codec: Codec,

    /// Overlap fetch policy at the image edges
    pub edge_policy: EdgePolicy,
}

impl CoordinatorConfig {
    /// Create a new coordinator configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the payload codec
    pub fn with_codec(mut self, codec: Codec) -> Self {
        self.codec = codec;
        self
    }

    /// Set the edge policy
    pub fn with_edge_policy(mut self, policy: EdgePolicy) -> Self {
        self.edge_policy = policy;
        self
    }
}
