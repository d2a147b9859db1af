//! Declarative configuration.
//!
//! Factory trees and gateway settings can be deserialized with serde and turned into live
//! objects:
//!
//! ```
//! use tcpgate::{config::FactoryConfig, factory::ConnectionFactory};
//!
//! let config: FactoryConfig = serde_json::from_str(
//!     r#"{
//!         "caching": {
//!             "pool_size": 4,
//!             "target": { "reactor": { "host": "127.0.0.1", "port": 9000, "single_use": true } }
//!         }
//!     }"#,
//! )
//! .unwrap();
//! let factory = config.build();
//! assert!(!factory.is_running());
//! assert!(!factory.is_single_use());
//! ```

use std::{num::NonZeroUsize, sync::Arc, time::Duration};

use serde::{Deserialize, Serialize};

use crate::{
    connection::{
        blocking::BlockingConnectionFactory, reactor::ReactorConnectionFactory, TcpConfig,
    },
    factory::{
        CachingConnectionFactory, ConnectionFactory, FailoverConnectionFactory, PoolExhaustion,
        SharedFactory,
    },
    gateway::{GatewayBuilder, OutboundGateway, DEFAULT_REMOTE_TIMEOUT},
};

/// A connection factory, possibly wrapping others.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FactoryConfig {
    /// A [`BlockingConnectionFactory`].
    Blocking(TcpConfig),
    /// A [`ReactorConnectionFactory`].
    Reactor(TcpConfig),
    /// A [`CachingConnectionFactory`] over another factory.
    Caching(CachingConfig),
    /// A [`FailoverConnectionFactory`] over a list of factories.
    Failover(FailoverConfig),
}

/// Settings of a [`CachingConnectionFactory`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachingConfig {
    /// The pooled factory.
    pub target: Box<FactoryConfig>,
    /// Maximum number of connections.
    pub pool_size: NonZeroUsize,
    /// What to do when every connection is checked out.
    #[serde(default)]
    pub exhaustion: PoolExhaustion,
}

/// Settings of a [`FailoverConnectionFactory`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailoverConfig {
    /// Candidate factories, tried in order.
    pub candidates: Vec<FactoryConfig>,
    /// Overrides whether failover connections are single-use.
    #[serde(default)]
    pub single_use: Option<bool>,
}

impl FactoryConfig {
    /// Builds the described factory tree. Every factory is created stopped.
    pub fn build(&self) -> SharedFactory {
        match self {
            FactoryConfig::Blocking(tcp) => Arc::new(BlockingConnectionFactory::new(tcp.clone())),
            FactoryConfig::Reactor(tcp) => Arc::new(ReactorConnectionFactory::new(tcp.clone())),
            FactoryConfig::Caching(caching) => Arc::new(
                CachingConnectionFactory::new(caching.target.build(), caching.pool_size.get())
                    .exhaustion(caching.exhaustion),
            ),
            FactoryConfig::Failover(failover) => {
                let candidates = failover.candidates.iter().map(FactoryConfig::build).collect();
                let factory = FailoverConnectionFactory::new(candidates);
                Arc::new(match failover.single_use {
                    Some(single_use) => factory.single_use(single_use),
                    None => factory,
                })
            }
        }
    }
}

/// Settings of an [`OutboundGateway`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Bound on the whole call: acquisition, sending and the wait for a reply.
    pub request_timeout: Option<Duration>,
    /// Bound on the wait for a reply once sent.
    pub remote_timeout: Duration,
    /// Whether an expired remote timeout is an error.
    pub requires_reply: bool,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        GatewayConfig {
            request_timeout: None,
            remote_timeout: DEFAULT_REMOTE_TIMEOUT,
            requires_reply: true,
        }
    }
}

impl GatewayConfig {
    /// Returns a gateway builder over `factory` carrying these settings.
    pub fn builder(&self, factory: impl ConnectionFactory) -> GatewayBuilder {
        let builder = OutboundGateway::builder(factory)
            .remote_timeout(self.remote_timeout)
            .requires_reply(self.requires_reply);
        match self.request_timeout {
            Some(timeout) => builder.request_timeout(timeout),
            None => builder,
        }
    }
}
