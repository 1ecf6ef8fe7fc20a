//! Protocol managers: authenticated rate-limited HTTP and SFTP access.

mod auth;
mod gate;
mod http;
mod limit;
mod sftp;

pub use auth::{AuthError, AuthMechanism, OAuthConfig};
pub use gate::{Gate, InvalidTimeOfDay, OncePerIntervalGate, ScheduledDailyGate};
pub use http::{HttpConfig, HttpError, HttpManager, HttpResponse};
pub use limit::RateLimiter;
pub use sftp::{DirEntry, FileAttrs, SftpClient, SftpConfig, SftpError, SftpManager};

#[cfg(test)]
pub(crate) mod testserver;
