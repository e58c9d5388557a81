//! Combined client.

use secrecy::SecretString;

use crate::gateway::client::{GatewayClient, GatewayOptions};
use crate::rest::client::{RestClient, RestClientOptions, RestError};

/// Owns one bot token and exposes a REST dispatcher and a gateway client
/// built from it.
#[derive(Clone)]
pub struct Client {
    rest: RestClient,
    gateway: GatewayClient,
}

impl Client {
    pub fn new(token: SecretString) -> Result<Self, RestError> {
        Self::with_options(token, RestClientOptions::default(), GatewayOptions::default())
    }

    pub fn with_options(
        token: SecretString,
        rest_options: RestClientOptions,
        gateway_options: GatewayOptions,
    ) -> Result<Self, RestError> {
        Ok(Self {
            rest: RestClient::with_options(token.clone(), rest_options)?,
            gateway: GatewayClient::with_options(token, gateway_options),
        })
    }

    pub fn rest(&self) -> &RestClient {
        &self.rest
    }

    pub fn gateway(&self) -> &GatewayClient {
        &self.gateway
    }

    /// Rejects further REST calls. Open gateway connections are stopped by
    /// their own handles.
    pub fn close(&self) {
        self.rest.close();
    }
}
