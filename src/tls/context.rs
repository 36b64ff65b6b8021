//! Long-lived TLS contexts (spec.md §4.2 `ctx` parameter): wrap the
//! `rustls` config plus, for servers, the async-resumption signal wired in
//! by `tls::resumption::async_resumption_setup_ctx`.

use crate::tls::resumption::{async_resumption_setup_ctx, AsyncResumptionSignal};
use std::sync::Arc;

#[derive(Clone)]
pub struct ServerContext {
    pub config: Arc<rustls::ServerConfig>,
    pub resumption_signal: Option<Arc<AsyncResumptionSignal>>,
}

impl ServerContext {
    pub fn new(mut config: rustls::ServerConfig) -> Self {
        let resumption_signal = async_resumption_setup_ctx(&mut config);
        Self { config: Arc::new(config), resumption_signal }
    }
}

#[derive(Clone)]
pub struct ClientContext {
    pub config: Arc<rustls::ClientConfig>,
}

impl ClientContext {
    pub fn new(config: rustls::ClientConfig) -> Self {
        Self { config: Arc::new(config) }
    }
}
