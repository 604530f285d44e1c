use crate::base::neterror::NetError;
use std::fmt;
use url::Url;

/// Whether a group's sockets may be used for credentialed traffic.
///
/// Sockets from different privacy modes are never shared, so the mode is
/// part of the group key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum PrivacyMode {
    #[default]
    Disabled,
    Enabled,
}

/// Opaque traffic-accounting tag applied to a group's sockets.
///
/// Sockets with different tags are never shared.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct SocketTag(pub u32);

/// Identifies a connection group: destination plus the attributes that make
/// sockets non-interchangeable. Equality defines group identity; ordering
/// defines the deterministic iteration order of the pool's group map.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct GroupId {
    scheme: String,
    host: String,
    port: u16,
    privacy_mode: PrivacyMode,
    socket_tag: SocketTag,
}

impl GroupId {
    pub fn new(scheme: &str, host: &str, port: u16) -> Self {
        GroupId {
            scheme: scheme.to_string(),
            host: host.to_string(),
            port,
            privacy_mode: PrivacyMode::default(),
            socket_tag: SocketTag::default(),
        }
    }

    pub fn with_privacy_mode(mut self, privacy_mode: PrivacyMode) -> Self {
        self.privacy_mode = privacy_mode;
        self
    }

    pub fn with_socket_tag(mut self, socket_tag: SocketTag) -> Self {
        self.socket_tag = socket_tag;
        self
    }

    pub fn from_url(url: &Url) -> Result<Self, NetError> {
        Ok(GroupId {
            scheme: url.scheme().to_string(),
            host: url.host_str().ok_or(NetError::InvalidUrl)?.to_string(),
            port: url.port_or_known_default().ok_or(NetError::InvalidUrl)?,
            privacy_mode: PrivacyMode::default(),
            socket_tag: SocketTag::default(),
        })
    }

    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn privacy_mode(&self) -> PrivacyMode {
        self.privacy_mode
    }

    pub fn socket_tag(&self) -> SocketTag {
        self.socket_tag
    }

    /// True if the destination scheme carries TLS state, in which case the
    /// group must be refreshed on SSL configuration changes for its server.
    pub fn is_cryptographic(&self) -> bool {
        self.scheme == "https" || self.scheme == "wss"
    }
}

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}:{}", self.scheme, self.host, self.port)?;
        if self.privacy_mode == PrivacyMode::Enabled {
            write!(f, " <pm>")?;
        }
        if self.socket_tag != SocketTag::default() {
            write!(f, " <tag={}>", self.socket_tag.0)?;
        }
        Ok(())
    }
}
