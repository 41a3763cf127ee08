pub mod network {
    pub const TIMEOUT_API_REQUEST_MS: u64 = 30_000;
    pub const TIMEOUT_PROBE_MS: u64 = 10_000;
    pub const MAX_REDIRECTS: usize = 5;
    pub const USER_AGENT: &str = "apilink/1.0";
}

pub mod retry {
    pub const MAX_ATTEMPTS: usize = 3;
    pub const BASE_DELAY_MS: u64 = 250;
    pub const MAX_DELAY_MS: u64 = 5_000;
    pub const JITTER: f64 = 0.2;
    pub const STATUS_CODES: &[u16] = &[408, 429, 500, 502, 503, 504];
    pub const IDEMPOTENT_METHODS: &[&str] = &["GET", "HEAD"];
}

pub mod security {
    pub const MAX_RESPONSE_BYTES: u64 = 10 * 1024 * 1024;
    pub const ERROR_SNIPPET_BYTES: usize = 2_048;
}

pub mod preview {
    pub const MAX_ROWS: usize = 10;
    pub const MAX_KEYS: usize = 10;
    pub const MAX_DEPTH: usize = 3;
    pub const TRUNCATE_LENGTH: usize = 100;
}

pub mod protocols {
    pub const ALLOWED_HTTP: &[&str] = &["http", "https"];
}
