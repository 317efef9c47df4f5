//! Container engine endpoint parsing
//!
//! The scheme decides the transport: `unix://` and bare absolute paths are
//! local sockets, `tcp://` and `http://` are plain TCP, `npipe://` is a
//! Windows named pipe.

use crate::errors::ExecError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEndpoint {
    /// Whatever the engine client considers its local default.
    LocalDefault,
    UnixSocket(String),
    Tcp { address: String, tls: bool },
    NamedPipe(String),
}

impl EngineEndpoint {
    pub fn parse(raw: &str) -> Result<Self, ExecError> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Ok(EngineEndpoint::LocalDefault);
        }

        if let Some(path) = raw.strip_prefix("unix://") {
            if path.is_empty() {
                return Err(ExecError::Config(format!("Empty socket path in endpoint '{}'", raw)));
            }
            return Ok(EngineEndpoint::UnixSocket(path.to_string()));
        }
        if let Some(pipe) = raw.strip_prefix("npipe://") {
            if pipe.is_empty() {
                return Err(ExecError::Config(format!("Empty pipe name in endpoint '{}'", raw)));
            }
            return Ok(EngineEndpoint::NamedPipe(pipe.replace('/', "\\")));
        }
        for (scheme, tls) in [("tcp://", false), ("http://", false), ("https://", true)] {
            if let Some(address) = raw.strip_prefix(scheme) {
                let address = address.trim_end_matches('/');
                if address.is_empty() {
                    return Err(ExecError::Config(format!("Missing host in endpoint '{}'", raw)));
                }
                let address = if address.contains(':') {
                    address.to_string()
                } else {
                    format!("{}:{}", address, if tls { 2376 } else { 2375 })
                };
                return Ok(EngineEndpoint::Tcp { address, tls });
            }
        }
        if raw.starts_with('/') {
            return Ok(EngineEndpoint::UnixSocket(raw.to_string()));
        }

        Err(ExecError::Config(format!(
            "Unsupported container engine endpoint '{}'",
            raw
        )))
    }

    pub fn label(&self) -> String {
        match self {
            EngineEndpoint::LocalDefault => "local-default".to_string(),
            EngineEndpoint::UnixSocket(path) => format!("unix://{}", path),
            EngineEndpoint::Tcp { address, tls: false } => format!("tcp://{}", address),
            EngineEndpoint::Tcp { address, tls: true } => format!("https://{}", address),
            EngineEndpoint::NamedPipe(pipe) => format!("npipe://{}", pipe.replace('\\', "/")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unix_socket_forms() {
        assert_eq!(
            EngineEndpoint::parse("unix:///var/run/docker.sock").unwrap(),
            EngineEndpoint::UnixSocket("/var/run/docker.sock".to_string())
        );
        assert_eq!(
            EngineEndpoint::parse("/run/user/1000/docker.sock").unwrap(),
            EngineEndpoint::UnixSocket("/run/user/1000/docker.sock".to_string())
        );
    }

    #[test]
    fn test_tcp_forms_get_default_ports() {
        assert_eq!(
            EngineEndpoint::parse("tcp://10.0.0.5").unwrap(),
            EngineEndpoint::Tcp { address: "10.0.0.5:2375".to_string(), tls: false }
        );
        assert_eq!(
            EngineEndpoint::parse("http://docker.internal:2380/").unwrap(),
            EngineEndpoint::Tcp { address: "docker.internal:2380".to_string(), tls: false }
        );
        assert_eq!(
            EngineEndpoint::parse("https://engine.example").unwrap(),
            EngineEndpoint::Tcp { address: "engine.example:2376".to_string(), tls: true }
        );
    }

    #[test]
    fn test_named_pipe() {
        let endpoint = EngineEndpoint::parse("npipe:////./pipe/docker_engine").unwrap();
        assert_eq!(
            endpoint,
            EngineEndpoint::NamedPipe(r"\\.\pipe\docker_engine".to_string())
        );
        assert_eq!(endpoint.label(), "npipe:////./pipe/docker_engine");
    }

    #[test]
    fn test_empty_means_local_default() {
        assert_eq!(EngineEndpoint::parse("  ").unwrap(), EngineEndpoint::LocalDefault);
    }

    #[test]
    fn test_rejects_unknown_schemes() {
        for raw in ["ssh://user@host", "ftp://x", "docker.sock", "unix://", "tcp://"] {
            assert!(
                matches!(EngineEndpoint::parse(raw), Err(ExecError::Config(_))),
                "expected rejection for {}",
                raw
            );
        }
    }
}
