//! 工具函数模块

use crate::error::{FlareError, Result};
use rand::Rng;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{sleep, timeout};
use tracing::debug;

/// 在 `[min, max]` 中随机选择一个可以在回环地址上绑定的端口
pub fn rand_port(min: u16, max: u16, attempts: u32) -> Result<u16> {
    check_range(min, max)?;
    let mut rng = rand::thread_rng();

    for _ in 0..attempts {
        let port = rng.gen_range(min..=max);
        match std::net::TcpListener::bind((Ipv4Addr::LOCALHOST, port)) {
            Ok(_) => return Ok(port),
            Err(e) => debug!(port, error = %e, "Port probe failed"),
        }
    }

    Err(FlareError::configuration(format!(
        "no free port in {}-{} after {} attempts",
        min, max, attempts
    )))
}

/// 在 `[min, max]` 中随机选择端口并直接绑定，返回已绑定的监听器
pub async fn bind_in_range(host: IpAddr, min: u16, max: u16, attempts: u32) -> Result<TcpListener> {
    check_range(min, max)?;

    for _ in 0..attempts {
        let port = rand::thread_rng().gen_range(min..=max);
        match TcpListener::bind(SocketAddr::new(host, port)).await {
            Ok(listener) => return Ok(listener),
            Err(e) => debug!(host = %host, port, error = %e, "Bind attempt failed"),
        }
    }

    Err(FlareError::configuration(format!(
        "failed to bind {} in port range {}-{} after {} attempts",
        host, min, max, attempts
    )))
}

fn check_range(min: u16, max: u16) -> Result<()> {
    if min == 0 || min > max {
        return Err(FlareError::configuration(format!(
            "invalid port range {}-{}",
            min, max
        )));
    }
    Ok(())
}

/// 未指定地址（`0.0.0.0`、`::`）替换为对应的回环地址
pub fn advertised_ip(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V4(v4) if v4.is_unspecified() => IpAddr::V4(Ipv4Addr::LOCALHOST),
        IpAddr::V6(v6) if v6.is_unspecified() => IpAddr::V6(Ipv6Addr::LOCALHOST),
        other => other,
    }
}

/// `host:port`，IPv6 地址带方括号
pub fn join_host_port(host: &str, port: u16) -> String {
    if host.contains(':') && !host.starts_with('[') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}

/// 等待服务启动就绪（通过 TCP 连接重试）
///
/// 使用指数退避重试连接，直到服务真正可以接受连接，总耗时不超过 10 秒。
pub async fn wait_for_server_ready(address: SocketAddr) -> Result<()> {
    const MAX_RETRIES: u32 = 30;
    const INITIAL_DELAY_MS: u64 = 50;
    const MAX_DELAY_MS: u64 = 500;
    const TOTAL_TIMEOUT: Duration = Duration::from_secs(10);

    let start = std::time::Instant::now();
    let mut delay_ms = INITIAL_DELAY_MS;

    for attempt in 1..=MAX_RETRIES {
        if start.elapsed() > TOTAL_TIMEOUT {
            return Err(FlareError::timeout(format!(
                "server {} not ready after {:?}",
                address, TOTAL_TIMEOUT
            )));
        }

        match timeout(Duration::from_millis(100), TcpStream::connect(address)).await {
            Ok(Ok(_)) => {
                debug!(
                    address = %address,
                    attempts = attempt,
                    elapsed_ms = start.elapsed().as_millis() as u64,
                    "Server is ready"
                );
                return Ok(());
            }
            Ok(Err(e)) => {
                debug!(address = %address, attempt, error = %e, "Connection attempt failed, retrying...");
            }
            Err(_) => {
                debug!(address = %address, attempt, "Connection attempt timed out, retrying...");
            }
        }

        sleep(Duration::from_millis(delay_ms)).await;
        delay_ms = (delay_ms * 2).min(MAX_DELAY_MS);
    }

    Err(FlareError::timeout(format!(
        "server {} not ready after {} attempts",
        address, MAX_RETRIES
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rand_port_stays_in_range() {
        let port = rand_port(20000, 50000, 100).unwrap();
        assert!((20000..=50000).contains(&port));
    }

    #[test]
    fn inverted_range_is_rejected() {
        assert!(rand_port(5000, 4000, 10).is_err());
    }

    #[test]
    fn unspecified_hosts_become_loopback() {
        assert_eq!(advertised_ip("0.0.0.0".parse().unwrap()), IpAddr::V4(Ipv4Addr::LOCALHOST));
        assert_eq!(advertised_ip("::".parse().unwrap()), IpAddr::V6(Ipv6Addr::LOCALHOST));
        assert_eq!(advertised_ip("10.0.0.5".parse().unwrap()), "10.0.0.5".parse::<IpAddr>().unwrap());
        assert_eq!(join_host_port("::1", 80), "[::1]:80");
    }

    #[tokio::test]
    async fn wait_for_bound_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        wait_for_server_ready(addr).await.unwrap();
    }
}
