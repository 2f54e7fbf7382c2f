//! Engine configuration.

use morango_core::capabilities::{
    self, Capabilities, ALLOW_CERTIFICATE_PUSHING, ASYNC_OPERATIONS, FSIC_V2_FORMAT,
    GZIP_BUFFER_POST,
};

/// Identity fields of the machine and database this engine runs against.
/// Feeds the instance-id derivation; if any field changes, so does the id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceIdentity {
    pub platform: String,
    pub hostname: String,
    pub sysversion: String,
    pub node_id: String,
    pub db_path: String,
    pub system_id: String,
}

impl Default for InstanceIdentity {
    fn default() -> Self {
        Self {
            platform: std::env::consts::OS.to_string(),
            hostname: std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string()),
            sysversion: env!("CARGO_PKG_VERSION").to_string(),
            node_id: String::new(),
            db_path: ":memory:".to_string(),
            system_id: String::new(),
        }
    }
}

/// Tunables for the sync engine, mirrored on both client and server sides.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub instance_identity: InstanceIdentity,
    /// Run a serialization pass before queuing outgoing data.
    pub serialize_before_queuing: bool,
    /// Run a deserialization pass after dequeuing incoming data.
    pub deserialize_after_dequeuing: bool,
    /// Serve the shared public key and accept pushed certificate chains.
    pub allow_certificate_pushing: bool,
    /// Disable stage-driven remote operations (legacy peers).
    pub disallow_async_operations: bool,
    /// Records per buffer chunk on the wire.
    pub chunk_size: usize,
    /// gzip level for buffer pushes.
    pub compresslevel: u32,
    /// HTTP retry attempts for the client connection.
    pub retries: u32,
    /// Backoff factor: sleep `factor * 2^(n-1)` seconds between retries.
    pub backoff_factor: f64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            instance_identity: InstanceIdentity::default(),
            serialize_before_queuing: true,
            deserialize_after_dequeuing: true,
            allow_certificate_pushing: false,
            disallow_async_operations: false,
            chunk_size: 500,
            compresslevel: 9,
            retries: 7,
            backoff_factor: 0.3,
        }
    }
}

impl EngineConfig {
    /// The capability set this engine advertises.
    #[must_use]
    pub fn capabilities(&self) -> Capabilities {
        let mut set = Capabilities::new();
        set.insert(GZIP_BUFFER_POST.to_string());
        set.insert(FSIC_V2_FORMAT.to_string());
        if self.allow_certificate_pushing {
            set.insert(ALLOW_CERTIFICATE_PUSHING.to_string());
        }
        if !self.disallow_async_operations {
            set.insert(ASYNC_OPERATIONS.to_string());
        }
        set
    }

    /// Render the capability header value for outgoing requests.
    #[must_use]
    pub fn capabilities_header(&self) -> String {
        capabilities::render_capabilities(&self.capabilities())
    }
}
