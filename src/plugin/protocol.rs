//! Wire schema spoken between the host and pricing plugins.
//!
//! Every frame on a plugin socket is one [`Envelope`]. The host assigns
//! `call_id`; the plugin echoes it on the response so concurrent calls on one
//! connection can complete in any order.

use std::collections::HashMap;

/// Oldest protocol version this host speaks.
pub const MIN_PROTOCOL_VERSION: u32 = 1;

/// Newest protocol version this host speaks.
pub const MAX_PROTOCOL_VERSION: u32 = 2;

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Envelope {
    #[prost(uint64, tag = "1")]
    pub call_id: u64,
    #[prost(oneof = "envelope::Body", tags = "2, 3, 4, 5, 6, 7, 8")]
    pub body: Option<envelope::Body>,
}

pub mod envelope {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Body {
        #[prost(message, tag = "2")]
        NegotiateRequest(super::NegotiateRequest),
        #[prost(message, tag = "3")]
        NegotiateResponse(super::NegotiateResponse),
        #[prost(message, tag = "4")]
        PingRequest(super::PingRequest),
        #[prost(message, tag = "5")]
        PingResponse(super::PingResponse),
        #[prost(message, tag = "6")]
        PriceRequest(super::PriceRequest),
        #[prost(message, tag = "7")]
        PriceResponse(super::PriceResponse),
        #[prost(message, tag = "8")]
        ErrorResponse(super::ErrorResponse),
    }

    impl Body {
        /// Short name used in logs and protocol errors
        pub fn kind(&self) -> &'static str {
            match self {
                Body::NegotiateRequest(_) => "NegotiateRequest",
                Body::NegotiateResponse(_) => "NegotiateResponse",
                Body::PingRequest(_) => "PingRequest",
                Body::PingResponse(_) => "PingResponse",
                Body::PriceRequest(_) => "PriceRequest",
                Body::PriceResponse(_) => "PriceResponse",
                Body::ErrorResponse(_) => "ErrorResponse",
            }
        }
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct NegotiateRequest {
    #[prost(uint32, tag = "1")]
    pub host_min_protocol: u32,
    #[prost(uint32, tag = "2")]
    pub host_max_protocol: u32,
    #[prost(string, tag = "3")]
    pub host_version: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct NegotiateResponse {
    #[prost(string, tag = "1")]
    pub plugin_name: String,
    #[prost(string, tag = "2")]
    pub plugin_version: String,
    #[prost(uint32, tag = "3")]
    pub protocol_version: u32,
    /// Resource-type patterns the plugin claims to price
    #[prost(string, repeated, tag = "4")]
    pub capabilities: Vec<String>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PingRequest {
    #[prost(uint64, tag = "1")]
    pub nonce: u64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PingResponse {
    #[prost(uint64, tag = "1")]
    pub nonce: u64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Resource {
    #[prost(string, tag = "1")]
    pub resource_type: String,
    #[prost(string, tag = "2")]
    pub id: String,
    #[prost(string, tag = "3")]
    pub region: String,
    #[prost(map = "string, string", tag = "4")]
    pub tags: HashMap<String, String>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct TimeWindow {
    #[prost(int64, tag = "1")]
    pub start_unix: i64,
    #[prost(int64, tag = "2")]
    pub end_unix: i64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum WireAccuracy {
    Unspecified = 0,
    Projected = 1,
    Actual = 2,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PriceRequest {
    #[prost(message, optional, tag = "1")]
    pub resource: Option<Resource>,
    #[prost(enumeration = "WireAccuracy", tag = "2")]
    pub accuracy: i32,
    #[prost(message, optional, tag = "3")]
    pub window: Option<TimeWindow>,
    #[prost(bool, tag = "4")]
    pub credentials_present: bool,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PriceResponse {
    #[prost(oneof = "price_response::Outcome", tags = "1, 2")]
    pub outcome: Option<price_response::Outcome>,
}

pub mod price_response {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Outcome {
        #[prost(message, tag = "1")]
        Estimate(super::Estimate),
        #[prost(message, tag = "2")]
        Error(super::PriceError),
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Estimate {
    /// Monthly cost in `currency`
    #[prost(double, tag = "1")]
    pub amount: f64,
    #[prost(string, tag = "2")]
    pub currency: String,
    #[prost(double, tag = "3")]
    pub unit_price: f64,
    #[prost(string, tag = "4")]
    pub billing_detail: String,
}

/// A typed per-resource failure reported by the plugin itself
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PriceError {
    #[prost(string, tag = "1")]
    pub code: String,
    #[prost(string, tag = "2")]
    pub message: String,
}

/// Protocol-level failure (unknown request kind, malformed body)
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ErrorResponse {
    #[prost(string, tag = "1")]
    pub message: String,
}

impl PriceResponse {
    pub fn estimate(amount: f64, currency: impl Into<String>) -> Self {
        Self {
            outcome: Some(price_response::Outcome::Estimate(Estimate {
                amount,
                currency: currency.into(),
                unit_price: 0.0,
                billing_detail: String::new(),
            })),
        }
    }

    pub fn error(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            outcome: Some(price_response::Outcome::Error(PriceError {
                code: code.into(),
                message: message.into(),
            })),
        }
    }
}
