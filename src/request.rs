//! Request descriptors and the method vocabulary.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::TollgateError;

/// HTTP methods the router distinguishes.
///
/// Anything outside this vocabulary is gated by the root bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Method {
    Get,
    Put,
    Patch,
    Post,
    Delete,
}

impl Method {
    /// All recognized methods, in declaration order.
    pub const ALL: [Method; 5] = [
        Method::Get,
        Method::Put,
        Method::Patch,
        Method::Post,
        Method::Delete,
    ];

    /// The lowercase name used in configuration keys.
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "get",
            Method::Put => "put",
            Method::Patch => "patch",
            Method::Post => "post",
            Method::Delete => "delete",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Method {
    type Err = TollgateError;

    /// Case-insensitive parse, so `"GET"` and `"get"` are the same method.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "get" => Ok(Method::Get),
            "put" => Ok(Method::Put),
            "patch" => Ok(Method::Patch),
            "post" => Ok(Method::Post),
            "delete" => Ok(Method::Delete),
            other => Err(TollgateError::Config(format!(
                "Unknown method name: {}",
                other
            ))),
        }
    }
}

/// Selects which bucket a configuration call applies to: one method's
/// bucket, or the root bucket (`all`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Selector {
    /// The root bucket shared by every request.
    All,
    /// The bucket dedicated to a single method.
    Method(Method),
}

impl From<Method> for Selector {
    fn from(method: Method) -> Self {
        Selector::Method(method)
    }
}

impl FromStr for Selector {
    type Err = TollgateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.eq_ignore_ascii_case("all") {
            Ok(Selector::All)
        } else {
            s.parse::<Method>().map(Selector::Method)
        }
    }
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Selector::All => write!(f, "all"),
            Selector::Method(m) => write!(f, "{}", m),
        }
    }
}

/// An outgoing request descriptor.
///
/// Carries only what the router needs to pick a bucket (method and URL) plus
/// an opaque body the wrapped transport may care about. The limiter forwards
/// the descriptor unmodified.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    url: String,
    method: Method,
    body: Option<String>,
}

impl Request {
    /// A request with the default method (GET).
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            method: Method::Get,
            body: None,
        }
    }

    /// A GET request.
    pub fn get(url: impl Into<String>) -> Self {
        Self::new(url)
    }

    /// A POST request.
    pub fn post(url: impl Into<String>) -> Self {
        Self::new(url).with_method(Method::Post)
    }

    /// Set the method.
    pub fn with_method(mut self, method: Method) -> Self {
        self.method = method;
        self
    }

    /// Attach an opaque body for the transport.
    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = Some(body.into());
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn method(&self) -> Method {
        self.method
    }

    pub fn body(&self) -> Option<&str> {
        self.body.as_deref()
    }
}

impl fmt::Display for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.method, self.url)
    }
}
