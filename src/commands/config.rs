use anyhow::Result;
use std::path::Path;

use crate::{
    client::ApiClient,
    config::{ClientConfig, ConfigOverrides, api_token},
    runtime::Runtime,
    transport::HttpTransport,
};

/// Everything a command needs: the runtime and the resolved client settings.
pub struct Config<R: Runtime> {
    pub runtime: R,
    pub client: ClientConfig,
}

impl<R: Runtime> Config<R> {
    /// Resolves defaults, the config file and command-line overrides.
    pub fn new(runtime: R, config_path: Option<&Path>, overrides: &ConfigOverrides) -> Result<Self> {
        let file_config = ClientConfig::load(&runtime, config_path)?;
        let client = overrides.apply(file_config)?;
        Ok(Self { runtime, client })
    }

    /// Builds an HTTP-backed client, authenticating with `PAGEFETCH_TOKEN` when set.
    pub fn into_api_client(self) -> Result<ApiClient<HttpTransport, R>> {
        let token = api_token(&self.runtime);
        let transport = HttpTransport::from_config(&self.client, token.as_deref())?;
        Ok(ApiClient::new(transport, self.runtime, &self.client))
    }
}
