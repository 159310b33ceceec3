//! Per-user connection requirements, checked at the end of backend
//! preparation when `router_require_enforce` is on.

use tracing::debug;

use super::context::ClientChannelInfo;
use crate::config::RequireConfig;

/// Requirements fetched for the authenticated user
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequiredAttributes {
    pub ssl: bool,
    pub x509: bool,
    pub issuer: Option<String>,
    pub subject: Option<String>,
}

impl From<&RequireConfig> for RequiredAttributes {
    fn from(config: &RequireConfig) -> Self {
        Self {
            ssl: config.ssl,
            x509: config.x509,
            issuer: config.issuer.clone(),
            subject: config.subject.clone(),
        }
    }
}

/// Check the client channel against the user's requirements.
///
/// An issuer or subject requirement implies a certificate, which implies
/// TLS; each level is checked independently so the log names the first
/// missing piece.
pub fn enforce(channel: &ClientChannelInfo, required: &RequiredAttributes) -> bool {
    let needs_cert =
        required.x509 || required.issuer.is_some() || required.subject.is_some();

    if (required.ssl || needs_cert) && !channel.tls {
        debug!("Connection requirement failed: TLS required");
        return false;
    }

    if needs_cert && channel.x509_issuer.is_none() && channel.x509_subject.is_none() {
        debug!("Connection requirement failed: client certificate required");
        return false;
    }

    if let Some(issuer) = &required.issuer {
        if channel.x509_issuer.as_deref() != Some(issuer.as_str()) {
            debug!("Connection requirement failed: issuer mismatch");
            return false;
        }
    }

    if let Some(subject) = &required.subject {
        if channel.x509_subject.as_deref() != Some(subject.as_str()) {
            debug!("Connection requirement failed: subject mismatch");
            return false;
        }
    }

    true
}
