//! Default values for every configuration section
//!
//! Kept in one place so the serde defaults, the documentation and the
//! runtime structs built from them agree.

/// Node identity and membership defaults
pub mod node {
    pub const LISTEN_ADDR: &str = "0.0.0.0:7400";

    pub const GROUP: &str = "default";

    /// Attempts to claim the machine id lock before giving up
    pub const LOCK_ATTEMPTS: u32 = 5;

    pub const LOCK_BASE_DELAY_MS: u64 = 100;

    /// Attempts to open a session to a newly announced peer
    pub const DIAL_ATTEMPTS: u32 = 3;

    pub const DIAL_BASE_DELAY_MS: u64 = 200;

    pub const KEEP_ALIVE_INTERVAL_MS: u64 = 5_000;
}

/// Dispatch engine defaults
pub mod serial {
    /// Ring buffer size in bytes (power of two)
    pub const RING_CAPACITY: usize = 1 << 20;

    /// Drain interval in microseconds
    pub const TICK_US: u64 = 10;

    pub const UNSUBSCRIBE_TIMEOUT_TICKS: u32 = 10_000;

    pub const CONTROL_QUEUE_DEPTH: usize = 64;

    pub const SHUTDOWN_SETTLE_TICKS: u32 = 10;

    /// Frames a join-all slot buffers while a sibling channel is silent
    pub const BAG_SLOT_DEPTH: usize = 1024;

    /// Seconds before a shut down engine releases its handlers
    pub const RELEASE_GRACE_SECS: u64 = 300;
}

/// Routing table and admission gate defaults
pub mod cluster {
    pub const MAX_IDENTITIES: usize = 1024;

    /// Consecutive remote send failures that open the admission gate
    pub const GATE_FAILURE_THRESHOLD: u32 = 5;

    pub const GATE_RECOVERY_MS: u64 = 30_000;
}

/// Socket defaults
pub mod transport {
    pub const CONNECT_TIMEOUT_MS: u64 = 5_000;

    /// Per read/write deadline on an established session
    pub const IO_DEADLINE_MS: u64 = 10_000;

    pub const HEARTBEAT_INTERVAL_MS: u64 = 3_000;

    pub const SEND_QUEUE_DEPTH: usize = 1024;

    pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

    pub const READ_BUFFER_SIZE: usize = 65536;
}

pub mod logging {
    pub const LEVEL: &str = "info";
}
