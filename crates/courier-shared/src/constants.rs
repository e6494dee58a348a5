/// Application name
pub const APP_NAME: &str = "courier";

/// Default TCP port the server listens on
pub const DEFAULT_PORT: u16 = 9999;

/// Maximum length of a single frame in bytes (256 KiB), newline excluded
pub const MAX_FRAME_SIZE: usize = 262_144;

/// Frame terminator on the wire
pub const FRAME_DELIMITER: u8 = b'\n';

/// Sender name used when a stored message's author no longer resolves
pub const UNKNOWN_SENDER: &str = "unknown";
