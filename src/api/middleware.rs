// Request logging and response compression for the listener.

use actix_web::middleware::{Compress, Logger};

/// Access log line per notification, without headers (the secret travels in one).
pub fn setup_middleware() -> (Logger, Compress) {
    let logger = Logger::new(r#"%a "%r" %s %b %Dms"#);
    let compress = Compress::default();
    (logger, compress)
}
