use crate::Entity;

/// Where the dashboard itself is served from; instance links are built relative to it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostInfo {
    pub scheme: String,
    pub hostname: String,
    /// Port the dashboard is served on, when not the scheme default.
    pub port: Option<u16>,
}

impl HostInfo {
    pub fn origin(&self) -> String {
        match self.port {
            Some(port) => format!("{}://{}:{port}", self.scheme, self.hostname),
            None => format!("{}://{}", self.scheme, self.hostname),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UrlPurpose {
    /// Direct link opened in a separate window.
    Open,
    /// Embedded view inside the tools pane.
    View,
}

/// Link to a running instance, or `None` while it is not started.
pub fn instance_url(entity: &Entity, host: &HostInfo, purpose: UrlPurpose) -> Option<String> {
    if !entity.status.is_started() {
        return None;
    }

    if entity.persistent_mode {
        let port = entity.persistent_port?;
        let base = format!("{}://{}:{port}", host.scheme, host.hostname);
        return Some(match purpose {
            UrlPurpose::View => format!("{base}/vnc.html?resize=remote"),
            UrlPurpose::Open => base,
        });
    }

    if entity.use_custom_hostname {
        if let Some(custom) = entity.hostname.as_deref() {
            return Some(if custom.starts_with("http") {
                custom.to_string()
            } else {
                format!("http://{custom}")
            });
        }
    }

    if purpose == UrlPurpose::Open {
        if let Some(port) = entity.port {
            return Some(format!("{}://{}:{port}/", host.scheme, host.hostname));
        }
    }

    Some(format!("{}/instance/{}/", host.origin(), instance_slug(&entity.name)))
}

/// Reverse-proxy path segment for an instance name.
pub fn instance_slug(name: &str) -> String {
    name.to_lowercase()
        .chars()
        .map(|ch| {
            if ch.is_ascii_lowercase() || ch.is_ascii_digit() || ch == '-' {
                ch
            } else {
                '-'
            }
        })
        .collect()
}
