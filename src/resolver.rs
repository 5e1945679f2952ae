//! SNI → 后端地址的路由解析
//!
//! 中继核心只依赖 [`RouteResolver`] 这一个能力：`resolve(name)` 成功给出
//! 后端地址，失败则意味着丢弃该 datagram、不建立会话。实现可以是静态
//! 路由表、远程分配器，或者 [`ResolverChain`] 的按序组合。

use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::RwLock;
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug)]
pub enum ResolveError {
    /// 没有任何路由匹配该 SNI
    #[error("No route for SNI '{0}'")]
    NoRoute(String),
}

/// 路由解析能力
///
/// 实现必须允许并发调用；内部如有可变状态需自行加锁。
#[async_trait]
pub trait RouteResolver: Send + Sync {
    async fn resolve(&self, name: &str) -> Result<SocketAddr, ResolveError>;
}

/// 路由条目：域名模式 → 后端地址
#[derive(Debug, Clone)]
struct RouteEntry {
    pattern: String,
    target: SocketAddr,
}

/// 静态路由表
///
/// 模式支持多个 `*` 的通配符，例如：
/// - `game.example.com` 精确匹配
/// - `*.example.com` 只匹配子域名，不匹配 `example.com` 自身
/// - `*example.com` 匹配自身和子域名
/// - `*.prod.*.internal` 匹配 `web.prod.db.internal`
///
/// [`StaticResolver::update_route`] / [`StaticResolver::remove_route`] 是留给
/// 外部组件 (路由管理 API、集群同步总线) 的并发安全写入钩子。
#[derive(Debug, Default)]
pub struct StaticResolver {
    routes: RwLock<Vec<RouteEntry>>,
}

impl StaticResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// 插入或更新一条路由
    ///
    /// 同一模式的旧条目被替换，保证钩子幂等。
    pub fn update_route(&self, pattern: &str, target: SocketAddr) {
        let mut routes = self.routes.write().expect("route table lock poisoned");
        if let Some(entry) = routes.iter_mut().find(|e| e.pattern == pattern) {
            entry.target = target;
        } else {
            routes.push(RouteEntry {
                pattern: pattern.to_string(),
                target,
            });
        }
    }

    /// 删除一条路由，返回是否存在
    pub fn remove_route(&self, pattern: &str) -> bool {
        let mut routes = self.routes.write().expect("route table lock poisoned");
        let before = routes.len();
        routes.retain(|e| e.pattern != pattern);
        routes.len() != before
    }

    pub fn len(&self) -> usize {
        self.routes.read().expect("route table lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 灵活通配符匹配
    ///
    /// 按 `*` 分割模式后在 hostname 中依次查找各片段；
    /// 最后一个片段必须匹配到末尾，除非模式以 `*` 结尾。
    fn match_pattern(hostname: &str, pattern: &str) -> bool {
        if pattern == "*" {
            return true;
        }

        // 无通配符的模式按精确相等处理
        if !pattern.contains('*') {
            return hostname == pattern;
        }

        let parts: Vec<&str> = pattern.split('*').collect();
        let mut pos = 0;

        for (i, part) in parts.iter().enumerate() {
            if part.is_empty() {
                continue;
            }

            if let Some(idx) = hostname[pos..].find(part) {
                pos += idx + part.len();

                if i == parts.len() - 1 {
                    if pattern.ends_with('*') {
                        return true;
                    }
                    return pos == hostname.len();
                }
            } else {
                return false;
            }
        }

        true
    }
}

#[async_trait]
impl RouteResolver for StaticResolver {
    async fn resolve(&self, name: &str) -> Result<SocketAddr, ResolveError> {
        let routes = self.routes.read().expect("route table lock poisoned");

        for entry in routes.iter() {
            if Self::match_pattern(name, &entry.pattern) {
                debug!(
                    "SNI '{}' matched route pattern '{}' -> {}",
                    name, entry.pattern, entry.target
                );
                return Ok(entry.target);
            }
        }

        Err(ResolveError::NoRoute(name.to_string()))
    }
}

/// 按声明顺序组合多个 resolver，第一个成功者胜出
pub struct ResolverChain {
    resolvers: Vec<std::sync::Arc<dyn RouteResolver>>,
}

impl ResolverChain {
    pub fn new(resolvers: Vec<std::sync::Arc<dyn RouteResolver>>) -> Self {
        Self { resolvers }
    }
}

#[async_trait]
impl RouteResolver for ResolverChain {
    async fn resolve(&self, name: &str) -> Result<SocketAddr, ResolveError> {
        for resolver in &self.resolvers {
            if let Ok(target) = resolver.resolve(name).await {
                return Ok(target);
            }
        }
        Err(ResolveError::NoRoute(name.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn addr(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    fn resolver_with(patterns: &[(&str, &str)]) -> StaticResolver {
        let r = StaticResolver::new();
        for (pattern, target) in patterns {
            r.update_route(pattern, addr(target));
        }
        r
    }

    #[tokio::test]
    async fn test_exact_match() {
        let r = resolver_with(&[("game.example.com", "10.0.0.5:7777")]);
        assert_eq!(
            r.resolve("game.example.com").await.unwrap(),
            addr("10.0.0.5:7777")
        );
        assert!(r.resolve("example.com").await.is_err());
        assert!(r.resolve("game.example.org").await.is_err());
        // 精确模式不做后缀匹配
        assert!(r.resolve("xgame.example.com").await.is_err());
    }

    #[tokio::test]
    async fn test_wildcard_with_self() {
        let r = resolver_with(&[("*google.com", "10.0.0.1:443")]);
        assert!(r.resolve("google.com").await.is_ok()); // 自身
        assert!(r.resolve("www.google.com").await.is_ok()); // 子域名
        assert!(r.resolve("evil.com").await.is_err());
    }

    #[tokio::test]
    async fn test_wildcard_subdomain_only() {
        let r = resolver_with(&[("*.google.com", "10.0.0.1:443")]);
        assert!(r.resolve("google.com").await.is_err()); // 不包括自身
        assert!(r.resolve("mail.google.com").await.is_ok());
    }

    #[tokio::test]
    async fn test_multi_wildcard() {
        let r = resolver_with(&[("*.prod.*.internal", "10.0.0.1:443")]);
        assert!(r.resolve("web.prod.db.internal").await.is_ok());
        assert!(r.resolve("web.dev.db.internal").await.is_err()); // 第二段不是 prod
        assert!(r.resolve("web.prod.db.com").await.is_err()); // 不是 .internal 结尾
    }

    #[tokio::test]
    async fn test_first_match_wins() {
        let r = resolver_with(&[
            ("game.example.com", "10.0.0.5:7777"),
            ("*.example.com", "10.0.0.9:7777"),
        ]);
        assert_eq!(
            r.resolve("game.example.com").await.unwrap(),
            addr("10.0.0.5:7777")
        );
        assert_eq!(
            r.resolve("lobby.example.com").await.unwrap(),
            addr("10.0.0.9:7777")
        );
    }

    #[tokio::test]
    async fn test_update_route_replaces() {
        let r = resolver_with(&[("game.example.com", "10.0.0.5:7777")]);
        r.update_route("game.example.com", addr("10.0.0.6:7777"));

        assert_eq!(r.len(), 1);
        assert_eq!(
            r.resolve("game.example.com").await.unwrap(),
            addr("10.0.0.6:7777")
        );
    }

    #[tokio::test]
    async fn test_remove_route() {
        let r = resolver_with(&[("game.example.com", "10.0.0.5:7777")]);
        assert!(r.remove_route("game.example.com"));
        assert!(!r.remove_route("game.example.com"));
        assert!(r.resolve("game.example.com").await.is_err());
    }

    #[tokio::test]
    async fn test_chain_order() {
        let first = Arc::new(resolver_with(&[("game.example.com", "10.0.0.5:7777")]));
        let second = Arc::new(resolver_with(&[
            ("game.example.com", "10.0.0.6:7777"),
            ("lobby.example.com", "10.0.0.7:7777"),
        ]));

        let chain = ResolverChain::new(vec![first as Arc<dyn RouteResolver>, second]);

        // 第一个 resolver 命中即返回
        assert_eq!(
            chain.resolve("game.example.com").await.unwrap(),
            addr("10.0.0.5:7777")
        );
        // 第一个失败时落到第二个
        assert_eq!(
            chain.resolve("lobby.example.com").await.unwrap(),
            addr("10.0.0.7:7777")
        );
        assert!(matches!(
            chain.resolve("nope.example").await,
            Err(ResolveError::NoRoute(_))
        ));
    }
}
