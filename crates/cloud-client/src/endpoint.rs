use std::str::FromStr;

use serde_json::{Map, Value};

use crate::transport::{ApiRequest, Params};

/// Name under which the API expects the token, as header or parameter.
pub const TOKEN_KEY: &str = "tokenId";

const V2_REALTIME_URL: &str = "https://www.solaxcloud.com/api/v2/dataAccess/realtimeInfo/get";
const V1_REALTIME_URL: &str =
    "https://www.solaxcloud.com/proxyApp/proxy/api/getRealtimeInfo.do";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    Get,
    Post,
}

/// How the serial (and a parameter-borne token) is sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamMode {
    Query,
    Form,
    Json,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenPlacement {
    Header,
    Param,
}

/// One way of asking the cloud for a device's realtime data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointVariant {
    pub name: String,
    pub method: HttpMethod,
    pub url: String,
    pub params: ParamMode,
    /// Parameter carrying the serial, `sn` or `wifiSn` depending on the API version.
    pub serial_key: String,
    pub token_placement: TokenPlacement,
}

impl EndpointVariant {
    pub fn new(
        name: impl Into<String>,
        method: HttpMethod,
        url: impl Into<String>,
        params: ParamMode,
        serial_key: impl Into<String>,
        token_placement: TokenPlacement,
    ) -> Self {
        Self {
            name: name.into(),
            method,
            url: url.into(),
            params,
            serial_key: serial_key.into(),
            token_placement,
        }
    }

    pub fn build_request(&self, token: &str, serial: &str) -> ApiRequest {
        let mut pairs = vec![(self.serial_key.clone(), serial.to_string())];
        let mut headers = Vec::new();
        match self.token_placement {
            TokenPlacement::Header => headers.push((TOKEN_KEY.to_string(), token.to_string())),
            TokenPlacement::Param => pairs.insert(0, (TOKEN_KEY.to_string(), token.to_string())),
        }

        let params = match self.params {
            ParamMode::Query => Params::Query(pairs),
            ParamMode::Form => Params::Form(pairs),
            ParamMode::Json => Params::Json(Value::Object(
                pairs
                    .into_iter()
                    .map(|(key, value)| (key, Value::String(value)))
                    .collect::<Map<String, Value>>(),
            )),
        };

        ApiRequest {
            method: self.method,
            url: self.url.clone(),
            headers,
            params,
        }
    }
}

impl FromStr for HttpMethod {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "get" => Ok(HttpMethod::Get),
            "post" => Ok(HttpMethod::Post),
            other => Err(format!("unsupported http method {other:?}")),
        }
    }
}

impl FromStr for ParamMode {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "query" => Ok(ParamMode::Query),
            "form" => Ok(ParamMode::Form),
            "json" => Ok(ParamMode::Json),
            other => Err(format!("unsupported parameter mode {other:?}")),
        }
    }
}

impl FromStr for TokenPlacement {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "header" => Ok(TokenPlacement::Header),
            "param" | "params" => Ok(TokenPlacement::Param),
            other => Err(format!("unsupported token placement {other:?}")),
        }
    }
}

/// Known SolaX realtime endpoints, newest first.
pub fn default_endpoints() -> Vec<EndpointVariant> {
    vec![
        EndpointVariant::new(
            "v2-json",
            HttpMethod::Post,
            V2_REALTIME_URL,
            ParamMode::Json,
            "wifiSn",
            TokenPlacement::Header,
        ),
        EndpointVariant::new(
            "v1-query",
            HttpMethod::Get,
            V1_REALTIME_URL,
            ParamMode::Query,
            "sn",
            TokenPlacement::Param,
        ),
        EndpointVariant::new(
            "v1-form",
            HttpMethod::Post,
            V1_REALTIME_URL,
            ParamMode::Form,
            "sn",
            TokenPlacement::Param,
        ),
    ]
}
