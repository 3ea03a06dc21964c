//! Network probes behind the health checker

use async_trait::async_trait;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;

use crate::models::{HubError, HubResult, ProbeTarget};

/// A single reachability check against one target; returns the observed latency
#[async_trait]
pub trait Probe: Send + Sync {
    async fn probe(&self, target: &ProbeTarget) -> HubResult<Duration>;
}

/// HTTP GET probe sharing one pooled client across all checks
#[derive(Debug, Clone)]
pub struct HttpProbe {
    client: reqwest::Client,
}

impl HttpProbe {
    pub fn new(pool_size: usize, timeout: Duration) -> HubResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .pool_max_idle_per_host(pool_size)
            .pool_idle_timeout(Duration::from_secs(90))
            .user_agent(concat!("mesh-hub/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| HubError::NetworkError(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self { client })
    }

    async fn get(&self, url: &str, expected_status: Option<u16>) -> HubResult<Duration> {
        let started = Instant::now();
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| HubError::ProbeFailed(format!("GET {}: {}", url, e)))?;
        let elapsed = started.elapsed();

        let status = response.status();
        let accepted = match expected_status {
            Some(expected) => status.as_u16() == expected || status.is_success(),
            None => status.is_success(),
        };
        if accepted {
            Ok(elapsed)
        } else {
            Err(HubError::ProbeFailed(format!(
                "GET {} returned {}",
                url,
                status.as_u16()
            )))
        }
    }
}

/// Plain TCP connect probe
#[derive(Debug, Clone)]
pub struct TcpProbe {
    timeout: Duration,
}

impl TcpProbe {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    async fn connect(&self, host: &str, port: u16) -> HubResult<Duration> {
        let started = Instant::now();
        match tokio::time::timeout(self.timeout, TcpStream::connect((host, port))).await {
            Ok(Ok(_stream)) => Ok(started.elapsed()),
            Ok(Err(e)) => Err(HubError::ProbeFailed(format!(
                "tcp://{}:{}: {}",
                host, port, e
            ))),
            Err(_) => Err(HubError::ProbeFailed(format!(
                "tcp://{}:{}: timed out after {:?}",
                host, port, self.timeout
            ))),
        }
    }
}

/// Dispatches each target to the matching probe kind
#[derive(Debug, Clone)]
pub struct NetworkProbe {
    http: HttpProbe,
    tcp: TcpProbe,
}

impl NetworkProbe {
    pub fn new(pool_size: usize, timeout: Duration) -> HubResult<Self> {
        Ok(Self {
            http: HttpProbe::new(pool_size, timeout)?,
            tcp: TcpProbe::new(timeout),
        })
    }
}

#[async_trait]
impl Probe for NetworkProbe {
    async fn probe(&self, target: &ProbeTarget) -> HubResult<Duration> {
        match target {
            ProbeTarget::Http {
                url,
                expected_status,
            } => self.http.get(url, *expected_status).await,
            ProbeTarget::Tcp { host, port } => self.tcp.connect(host, *port).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Serve `status_line` to every connection
    async fn http_stub(status_line: &'static str) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let mut buf = [0u8; 1024];
                    let _ = socket.read(&mut buf).await;
                    let response = format!(
                        "HTTP/1.1 {}\r\ncontent-length: 2\r\nconnection: close\r\n\r\nok",
                        status_line
                    );
                    let _ = socket.write_all(response.as_bytes()).await;
                    let _ = socket.shutdown().await;
                });
            }
        });
        format!("http://{}/health", address)
    }

    fn probe() -> NetworkProbe {
        NetworkProbe::new(4, Duration::from_secs(2)).unwrap()
    }

    #[tokio::test]
    async fn test_http_probe_success() {
        let url = http_stub("200 OK").await;
        assert!(probe().probe(&ProbeTarget::http(url)).await.is_ok());
    }

    #[tokio::test]
    async fn test_http_probe_rejects_server_error() {
        let url = http_stub("503 Service Unavailable").await;
        let err = probe().probe(&ProbeTarget::http(url)).await.unwrap_err();
        assert!(matches!(err, HubError::ProbeFailed(_)));
    }

    #[tokio::test]
    async fn test_http_probe_expected_status() {
        let url = http_stub("418 I'm a teapot").await;
        let target = ProbeTarget::Http {
            url,
            expected_status: Some(418),
        };
        assert!(probe().probe(&target).await.is_ok());
    }

    #[tokio::test]
    async fn test_tcp_probe() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        assert!(probe()
            .probe(&ProbeTarget::tcp("127.0.0.1", port))
            .await
            .is_ok());

        drop(listener);
        assert!(probe()
            .probe(&ProbeTarget::tcp("127.0.0.1", port))
            .await
            .is_err());
    }
}
