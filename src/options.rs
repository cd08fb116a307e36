use crate::codec::MAX_PAYLOAD_READ;

/// Default capacity of the queues between a connection and its handler.
pub const QUEUE_CAPACITY: usize = 512;

/// Default number of bytes reserved for each socket read.
pub const READ_BUFFER_SIZE: usize = 8 * 1024;

/// Configuration applied to every connection a [`Server`](crate::Server) accepts.
///
/// # Example
/// ```rust
/// use yawc_server::Options;
///
/// let options = Options::default()
///     .with_max_payload_read(64 * 1024)
///     .with_queue_capacity(32);
/// ```
#[derive(Debug, Clone)]
pub struct Options {
    /// Maximum allowed payload size for incoming frames, in bytes.
    ///
    /// A frame announcing a larger payload is a protocol error and the connection is
    /// closed before anything is allocated for it.
    ///
    /// Default: 1 MiB (1,048,576 bytes) as defined in [`MAX_PAYLOAD_READ`]
    pub max_payload_read: usize,

    /// Capacity of the inbound and of the outbound payload queue.
    ///
    /// A full inbound queue stops the connection from reading the socket until the
    /// handler catches up; a full outbound queue makes [`Outbound::send`](crate::Outbound::send)
    /// wait.
    ///
    /// Default: 512 payloads
    pub queue_capacity: usize,

    /// Number of bytes reserved for each read from the socket.
    ///
    /// Default: 8 KiB
    pub read_buffer_size: usize,

    /// Whether `TCP_NODELAY` is set on accepted sockets.
    ///
    /// Default: `true`
    pub no_delay: bool,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            max_payload_read: MAX_PAYLOAD_READ,
            queue_capacity: QUEUE_CAPACITY,
            read_buffer_size: READ_BUFFER_SIZE,
            no_delay: true,
        }
    }
}

impl Options {
    /// Sets the maximum allowed payload size for incoming frames.
    pub fn with_max_payload_read(self, size: usize) -> Self {
        Self {
            max_payload_read: size,
            ..self
        }
    }

    /// Sets the capacity of the payload queues. A capacity of 0 is raised to 1.
    pub fn with_queue_capacity(self, capacity: usize) -> Self {
        Self {
            queue_capacity: capacity.max(1),
            ..self
        }
    }

    /// Sets the number of bytes reserved per socket read. A size of 0 is raised to 1.
    pub fn with_read_buffer_size(self, size: usize) -> Self {
        Self {
            read_buffer_size: size.max(1),
            ..self
        }
    }

    /// Disables `TCP_NODELAY`, letting the kernel coalesce small frames.
    pub fn with_delay(self) -> Self {
        Self {
            no_delay: false,
            ..self
        }
    }
}

/// Socket options for [`Server::listen_with_options`](crate::Server::listen_with_options).
#[derive(Debug, Clone)]
pub struct ListenOptions {
    /// Sets `SO_REUSEADDR` before binding.
    ///
    /// Default: `true`
    pub reuse_address: bool,

    /// Maximum number of pending connections.
    ///
    /// Default: 1024
    pub backlog: u32,
}

impl Default for ListenOptions {
    fn default() -> Self {
        Self {
            reuse_address: true,
            backlog: 1024,
        }
    }
}

impl ListenOptions {
    pub fn with_reuse_address(self, reuse_address: bool) -> Self {
        Self {
            reuse_address,
            ..self
        }
    }

    pub fn with_backlog(self, backlog: u32) -> Self {
        Self { backlog, ..self }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let options = Options::default();
        assert_eq!(options.max_payload_read, 1024 * 1024);
        assert_eq!(options.queue_capacity, 512);
        assert_eq!(options.read_buffer_size, 8192);
        assert!(options.no_delay);

        let listen = ListenOptions::default();
        assert!(listen.reuse_address);
        assert_eq!(listen.backlog, 1024);
    }

    #[test]
    fn test_builders() {
        let options = Options::default()
            .with_max_payload_read(10)
            .with_queue_capacity(0)
            .with_read_buffer_size(0)
            .with_delay();
        assert_eq!(options.max_payload_read, 10);
        assert_eq!(options.queue_capacity, 1);
        assert_eq!(options.read_buffer_size, 1);
        assert!(!options.no_delay);

        let listen = ListenOptions::default()
            .with_reuse_address(false)
            .with_backlog(16);
        assert!(!listen.reuse_address);
        assert_eq!(listen.backlog, 16);
    }
}
