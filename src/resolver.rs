//! Target Resolver (C4): rewrites a logical `user@host[:port]` target via
//! the wiring (TLW) service when one is configured; a no-op otherwise.

use async_trait::async_trait;

use crate::errors::ConnectionError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedTarget {
    pub user: Option<String>,
    pub host: String,
    pub port: Option<u16>,
}

impl ResolvedTarget {
    pub fn parse(raw: &str) -> Self {
        let (user, rest) = match raw.split_once('@') {
            Some((u, r)) => (Some(u.to_string()), r),
            None => (None, raw),
        };
        let (host, port) = match rest.rsplit_once(':') {
            Some((h, p)) => (h.to_string(), p.parse().ok()),
            None => (rest.to_string(), None),
        };
        ResolvedTarget { user, host, port }
    }

    pub fn to_string_addr(&self) -> String {
        match (&self.user, self.port) {
            (Some(u), Some(p)) => format!("{u}@{}:{p}", self.host),
            (Some(u), None) => format!("{u}@{}", self.host),
            (None, Some(p)) => format!("{}:{p}", self.host),
            (None, None) => self.host.clone(),
        }
    }
}

/// The `OpenDutPort`-style RPC a wiring service exposes. Out of scope per
/// §1 as a concrete implementation; only the interface is depended on here.
#[async_trait]
pub trait WiringClient: Send + Sync {
    async fn open_dut_port(&self, target: &ResolvedTarget) -> Result<ResolvedTarget, ConnectionError>;
}

/// No-op resolver used when no wiring service is configured (§4.4).
pub struct NoopResolver;

#[async_trait]
impl WiringClient for NoopResolver {
    async fn open_dut_port(&self, target: &ResolvedTarget) -> Result<ResolvedTarget, ConnectionError> {
        Ok(target.clone())
    }
}

pub struct TargetResolver {
    wiring: Option<Box<dyn WiringClient>>,
}

impl TargetResolver {
    pub fn new(wiring: Option<Box<dyn WiringClient>>) -> Self {
        TargetResolver { wiring }
    }

    /// Resolves the primary target and, identically, any companion targets
    /// (additional DUTs referenced by roles).
    pub async fn resolve(&self, raw_target: &str) -> Result<ResolvedTarget, ConnectionError> {
        let parsed = ResolvedTarget::parse(raw_target);
        match &self.wiring {
            Some(client) => client.open_dut_port(&parsed).await,
            None => Ok(parsed),
        }
    }

    pub async fn resolve_companions(
        &self,
        raw_targets: &[String],
    ) -> Result<Vec<ResolvedTarget>, ConnectionError> {
        let mut resolved = Vec::with_capacity(raw_targets.len());
        for raw in raw_targets {
            resolved.push(self.resolve(raw).await?);
        }
        Ok(resolved)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_user_host_port() {
        let t = ResolvedTarget::parse("root@100.90.1.2:22");
        assert_eq!(t.user.as_deref(), Some("root"));
        assert_eq!(t.host, "100.90.1.2");
        assert_eq!(t.port, Some(22));
    }

    #[test]
    fn parses_host_only() {
        let t = ResolvedTarget::parse("dut-name");
        assert_eq!(t.user, None);
        assert_eq!(t.host, "dut-name");
        assert_eq!(t.port, None);
    }

    #[tokio::test]
    async fn noop_resolver_passes_target_through() {
        let resolver = TargetResolver::new(None);
        let resolved = resolver.resolve("root@dut:22").await.unwrap();
        assert_eq!(resolved.to_string_addr(), "root@dut:22");
    }

    struct FakeWiring;

    #[async_trait]
    impl WiringClient for FakeWiring {
        async fn open_dut_port(&self, target: &ResolvedTarget) -> Result<ResolvedTarget, ConnectionError> {
            Ok(ResolvedTarget {
                user: target.user.clone(),
                host: "127.0.0.1".to_string(),
                port: Some(2222),
            })
        }
    }

    #[tokio::test]
    async fn wiring_resolver_rewrites_host_and_port() {
        let resolver = TargetResolver::new(Some(Box::new(FakeWiring)));
        let resolved = resolver.resolve("root@dut-logical-name").await.unwrap();
        assert_eq!(resolved.to_string_addr(), "root@127.0.0.1:2222");
    }

    #[tokio::test]
    async fn resolves_companion_targets() {
        let resolver = TargetResolver::new(Some(Box::new(FakeWiring)));
        let resolved = resolver
            .resolve_companions(&["dut-a".to_string(), "dut-b".to_string()])
            .await
            .unwrap();
        assert_eq!(resolved.len(), 2);
        assert_eq!(resolved[0].host, "127.0.0.1");
    }
}
