// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Source of the `DD-API-KEY` header value.

use std::fmt::Debug;
use std::sync::Arc;
use std::{future::Future, pin::Pin};
use tokio::sync::OnceCell;

pub type ApiKeyResolverFn =
    Arc<dyn Fn() -> Pin<Box<dyn Future<Output = String> + Send>> + Send + Sync>;

/// Either a fixed key or an async resolver (secret store, KMS, ...) that is
/// called once, on first use, and cached for the life of the agent.
#[derive(Clone)]
pub enum ApiKeyFactory {
    Static(String),
    Dynamic {
        resolver_fn: ApiKeyResolverFn,
        api_key: Arc<OnceCell<String>>,
    },
}

impl ApiKeyFactory {
    pub fn new_from_resolver(resolver_fn: ApiKeyResolverFn) -> Self {
        Self::Dynamic {
            resolver_fn,
            api_key: Arc::new(OnceCell::new()),
        }
    }

    pub fn new_from_static_key(api_key: &str) -> Self {
        Self::Static(api_key.trim().to_string())
    }

    pub async fn get_api_key(&self) -> &str {
        match self {
            Self::Static(api_key) => api_key,
            Self::Dynamic {
                resolver_fn,
                api_key,
            } => {
                api_key
                    .get_or_init(|| async { (resolver_fn)().await.trim().to_string() })
                    .await
            }
        }
    }
}

// never print the key itself
impl Debug for ApiKeyFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Static(_) => write!(f, "ApiKeyFactory::Static"),
            Self::Dynamic { .. } => write!(f, "ApiKeyFactory::Dynamic"),
        }
    }
}
