/// Default timeout for shell commands.
pub const SHELL_TIMEOUT_SECS: u64 = 60;
/// Upper bound a caller may request for a shell command.
pub const MAX_TIMEOUT_SECS: u64 = 600;
/// Fixed timeout for file operations.
pub const FILE_TIMEOUT_SECS: u64 = 30;

/// Application-level ping cadence on the executor connection.
pub const PING_INTERVAL_SECS: u64 = 25;
/// Silence on the executor connection longer than this tears the session down.
pub const LIVENESS_GRACE_SECS: u64 = 60;
/// How long the agent waits past a ping interval for any frame from the relay
/// before treating the connection as dead.
pub const PONG_TIMEOUT_SECS: u64 = 10;
/// Base delay between executor reconnect attempts.
pub const RECONNECT_DELAY_SECS: u64 = 5;

/// Ceiling for captured output and file contents. Decimal, not 1 MiB: deployed
/// agents have always cut at one million bytes.
pub const MAX_OUTPUT_BYTES: usize = 1_000_000;
/// Appended after output that was cut at the ceiling.
pub const TRUNCATION_MARKER: &str = "\n[output truncated]";

/// WebSocket path the agent connects to.
pub const AGENT_WS_PATH: &str = "/ws/agent";
