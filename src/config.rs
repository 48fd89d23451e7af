// ============================================================================
// src/config.rs - Socket layer configuration
// ============================================================================
//!
//! ソケット層の設定値。`NetContext` 構築時に渡す。

/// `listen()` の最大バックログ
pub const SOMAXCONN: u8 = 4;

/// DNS サーバーの最大数
pub const DNS_MAX_SERVERS: usize = 2;

/// ping 設定
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PingConfig {
    /// 送信するエコー要求の数
    pub count: u32,
    /// 要求間隔（ミリ秒）
    pub interval_ms: u32,
    /// 応答待ちタイムアウト（ミリ秒）
    pub timeout_ms: u32,
    /// 送信時のTTL
    pub ttl: u8,
}

impl Default for PingConfig {
    fn default() -> Self {
        Self {
            count: 4,
            interval_ms: 1000,
            timeout_ms: 3000,
            ttl: 64,
        }
    }
}

/// ソケット層設定
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetConfig {
    /// 新規ソケットの既定タイムアウト（`None` = ブロッキング）
    pub default_timeout_ms: Option<u32>,
    /// 名前解決の待ち時間
    pub dns_timeout_ms: u32,
    /// `create_server` の既定バックログ
    pub listen_backlog: u8,
    /// `listen()` に渡せる最大バックログ
    pub max_listen_backlog: u8,
    /// ソケット毎の受信キュー上限（バイト）
    pub rx_queue_limit: usize,
    /// ping 設定
    pub ping: PingConfig,
}

impl Default for NetConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: None,
            dns_timeout_ms: 5000,
            listen_backlog: 1,
            max_listen_backlog: SOMAXCONN,
            rx_queue_limit: 16 * 1024,
            ping: PingConfig::default(),
        }
    }
}

impl NetConfig {
    pub fn with_default_timeout(mut self, timeout_ms: Option<u32>) -> Self {
        self.default_timeout_ms = timeout_ms;
        self
    }

    pub fn with_dns_timeout(mut self, timeout_ms: u32) -> Self {
        self.dns_timeout_ms = timeout_ms;
        self
    }

    pub fn with_rx_queue_limit(mut self, limit: usize) -> Self {
        self.rx_queue_limit = limit;
        self
    }

    pub fn with_ping(mut self, ping: PingConfig) -> Self {
        self.ping = ping;
        self
    }

    /// バックログを [0, max_listen_backlog] に丸める
    pub fn clamp_backlog(&self, backlog: i32) -> u8 {
        backlog.clamp(0, self.max_listen_backlog as i32) as u8
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = NetConfig::default();
        assert_eq!(cfg.default_timeout_ms, None);
        assert_eq!(cfg.ping.count, 4);
        assert_eq!(cfg.ping.interval_ms, 1000);
        assert_eq!(cfg.ping.timeout_ms, 3000);
    }

    #[test]
    fn test_clamp_backlog() {
        let cfg = NetConfig::default();
        assert_eq!(cfg.clamp_backlog(-3), 0);
        assert_eq!(cfg.clamp_backlog(2), 2);
        assert_eq!(cfg.clamp_backlog(100), SOMAXCONN);
    }
}
