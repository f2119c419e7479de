//! HTTP transport between members

use crate::server::PROTOBUF_CONTENT_TYPE;
use async_trait::async_trait;
use kvmesh_cluster::Transport;
use kvmesh_common::config::TransportConfig;
use kvmesh_common::{Error, Member, Result};
use kvmesh_proto::messages::decode_message;
use kvmesh_proto::{SystemMessage, SystemResponse};
use prost::Message;
use reqwest::header::CONTENT_TYPE;

/// Sends system messages to `POST http://{member}/v1/system`
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    /// Create a transport with the configured request timeout
    pub fn new(config: &TransportConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()
            .map_err(|e| Error::configuration(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { client })
    }

    fn url(target: &Member) -> String {
        format!("http://{}/v1/system", target.name())
    }
}

fn request_error(target: &Member, err: &reqwest::Error) -> Error {
    if err.is_timeout() {
        Error::Timeout
    } else {
        Error::ConnectionFailed(format!("{target}: {err}"))
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn request(&self, target: &Member, message: SystemMessage) -> Result<Vec<u8>> {
        let response = self
            .client
            .post(Self::url(target))
            .header(CONTENT_TYPE, PROTOBUF_CONTENT_TYPE)
            .body(message.encode_to_vec())
            .send()
            .await
            .map_err(|e| request_error(target, &e))?;

        if !response.status().is_success() {
            return Err(Error::ServiceUnavailable(format!(
                "{target} returned status {}",
                response.status()
            )));
        }
        let body = response
            .bytes()
            .await
            .map_err(|e| request_error(target, &e))?;
        decode_message::<SystemResponse>(&body)?.into_result()
    }
}
