//! Generic device API on top of [`TapoClient`].
//!
//! Every call goes through [`TapoClient::send`], so sessions, protocol
//! selection and retries are handled below this layer. Results are returned
//! as raw JSON; no per-model mapping is done here.

use serde_json::Value;
use tapo_protocol::{TapoRequest, TapoResponse};

use crate::error::{ClientError, Result};
use crate::http::{HttpChannel, ReqwestChannel};
use crate::orchestrator::TapoClient;

/// Thin request helpers for one device.
pub struct ApiClient<C: HttpChannel = ReqwestChannel> {
    client: TapoClient<C>,
}

impl<C: HttpChannel> ApiClient<C> {
    pub fn new(client: TapoClient<C>) -> Self {
        Self { client }
    }

    /// The underlying client.
    pub fn client(&self) -> &TapoClient<C> {
        &self.client
    }

    pub async fn get_device_info(&self) -> Result<Value> {
        self.call(TapoRequest::get_device_info()).await
    }

    pub async fn set_device_info(&self, params: Value) -> Result<Value> {
        self.call(TapoRequest::set_device_info(params)).await
    }

    pub async fn get_child_device_list(&self) -> Result<Value> {
        self.call(TapoRequest::get_child_device_list()).await
    }

    /// Runs `request` on the child device `child_id` through its hub.
    ///
    /// The request travels as a one-element `multipleRequest` inside
    /// `control_child`.
    pub async fn control_child(&self, child_id: &str, request: TapoRequest) -> Result<Value> {
        let wrapped = TapoRequest::multiple_request(vec![request]);
        let result = self
            .call(TapoRequest::control_child(child_id, wrapped))
            .await?;
        unwrap_child_result(&result)
    }

    /// Sends `request` as is and returns the whole response envelope.
    pub async fn execute_raw(&self, request: &TapoRequest) -> Result<TapoResponse> {
        self.client.send(request).await
    }

    async fn call(&self, request: TapoRequest) -> Result<Value> {
        Ok(self.client.send(&request).await?.result)
    }
}

/// Extracts the child's answer from `responseData.result.responses[0]`.
///
/// The answer is the first response's `result`, or the response itself when
/// it has none.
fn unwrap_child_result(result: &Value) -> Result<Value> {
    let responses = result
        .get("responseData")
        .and_then(|data| data.get("result"))
        .and_then(|data| data.get("responses"))
        .and_then(Value::as_array)
        .ok_or_else(|| {
            ClientError::MalformedResponse("control_child reply has no responses".to_string())
        })?;

    let first = responses.first().ok_or_else(|| {
        ClientError::MalformedResponse("empty responses from child".to_string())
    })?;
    Ok(first.get("result").unwrap_or(first).clone())
}
