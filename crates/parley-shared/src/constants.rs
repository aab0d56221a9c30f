/// Protocol version advertised by `/health` and `/info`.
pub const PROTOCOL_VERSION: &str = "/parley/1.0.0";

/// Default HTTP / WebSocket port (server)
pub const DEFAULT_HTTP_PORT: u16 = 8080;

/// Path of the WebSocket handshake route.
pub const SOCKET_PATH: &str = "/socket";

/// Query parameter carrying the credential token on the handshake.
pub const TOKEN_QUERY_PARAM: &str = "token";

/// Maximum inbound WebSocket frame size in bytes (256 KiB)
pub const MAX_FRAME_SIZE: usize = 262_144;

/// Maximum chat message content length in bytes (64 KiB)
pub const MAX_CONTENT_SIZE: usize = 65_536;

/// Default lifetime of an issued credential token (7 days)
pub const DEFAULT_TOKEN_TTL_SECS: u64 = 7 * 24 * 60 * 60;

/// How long a remote typing indicator stays visible without a refresh.
pub const TYPING_INDICATOR_SECS: u64 = 3;

/// ICE rendezvous servers used for every call.
pub const ICE_SERVERS: &[&str] = &["stun:stun1.l.google.com:19302"];
