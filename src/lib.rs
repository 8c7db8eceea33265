use std::{env, fmt, time::Duration};

#[cfg(all(feature = "reqwest", feature = "ureq"))]
compile_error!("Features 'reqwest' and 'ureq' are mutually exclusive.");

#[cfg(not(any(feature = "reqwest", feature = "ureq")))]
compile_error!("One of the features 'reqwest' and 'ureq' must be enabled.");

#[cfg(feature = "ureq")]
use std::io::Read;

use serde_json::Value;
use tracing::{debug, warn};

const OPENAI_API_KEY: &str = "OPENAI_API_KEY";
const OPENAI_API_BASE: &str = "OPENAI_API_BASE";
const OPENAI_BASE_URL: &str = "OPENAI_BASE_URL";

pub const DEFAULT_ENDPOINT: &str = "https://globalai.vip/v1/chat/completions";
pub const DEFAULT_MODEL: &str = "gpt-3.5-turbo";
pub const DEFAULT_PROMPT: &str = "你好，这是一个测试。请回复'测试成功'。";
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Shipped in place of a real key. Anything starting with
/// [`PLACEHOLDER_KEY_PREFIX`] is treated as "not configured yet".
pub const PLACEHOLDER_API_KEY: &str = "sk-你的密钥填在这里";
pub const PLACEHOLDER_KEY_PREFIX: &str = "sk-你的密钥";

const KEY_PREVIEW_CHARS: usize = 10;

pub const ROLE_USER: &str = "user";

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("The API key is still the placeholder, set OPENAI_API_KEY or replace the default key")]
    MissingCredential,

    #[error("The configuration contains errors: {0}")]
    BadConfigurationError(String),

    #[error("Failed to serialize request: {0}")]
    SerializationError(serde_json::Error),
}

/// Anything that went wrong before a response arrived.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("request timed out: {0}")]
    Timeout(String),

    #[error("connection failed: {0}")]
    Connect(String),

    #[error("{0}")]
    Other(String),
}

#[derive(Debug, serde::Serialize)]
pub struct Message {
    pub content: String,
    pub role: String,
}

/// Chat completions request body.
///
/// Only what the probe sends is modelled. Some OpenAI-compatible servers
/// reject options they don't know, so nothing else goes on the wire.
#[derive(Debug, serde::Serialize)]
pub struct ChatCompletions {
    pub model: String,
    pub messages: Vec<Message>,
    /// Must be 'false': Only non-streaming is supported.
    pub stream: bool,
}

impl ChatCompletions {
    pub fn single_prompt(model: &str, prompt: &str) -> Self {
        Self {
            model: model.to_string(),
            messages: vec![Message {
                content: prompt.to_string(),
                role: ROLE_USER.to_string(),
            }],
            stream: false,
        }
    }
}

/// What the probe needs to know to send its one request.
#[derive(Clone)]
pub struct ProbeConfig {
    pub endpoint: String,
    pub model_name: String,
    pub api_key: String,
    pub prompt_message: String,
    pub timeout: Duration,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_ENDPOINT.into(),
            model_name: DEFAULT_MODEL.into(),
            api_key: PLACEHOLDER_API_KEY.into(),
            prompt_message: DEFAULT_PROMPT.into(),
            timeout: DEFAULT_TIMEOUT,
        }
    }
}

impl ProbeConfig {
    /// Builds the configuration from the defaults, overridden by whatever
    /// `lookup` returns for `OPENAI_API_KEY` and `OPENAI_API_BASE` (falling
    /// back to `OPENAI_BASE_URL`).
    ///
    /// Empty values count as unset. A base URI replaces the endpoint with
    /// `<base>/chat/completions`.
    ///
    /// # Arguments
    ///
    /// * `lookup`: Returns the value of an environment variable, or `None`.
    pub fn from_lookup<F>(lookup: F) -> ProbeConfig
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |name: &str| lookup(name).filter(|value| !value.is_empty());
        let mut config = ProbeConfig::default();

        if let Some(token) = non_empty(OPENAI_API_KEY) {
            config.api_key = token;
        }

        if let Some(base_uri) = non_empty(OPENAI_API_BASE).or_else(|| non_empty(OPENAI_BASE_URL)) {
            config.endpoint = format!("{}/chat/completions", base_uri.trim_end_matches('/'));
        }

        config
    }

    /// Same as [`ProbeConfig::from_lookup`], reading the process environment.
    pub fn from_env() -> ProbeConfig {
        Self::from_lookup(|name| env::var(name).ok())
    }

    pub fn has_placeholder_key(&self) -> bool {
        self.api_key.starts_with(PLACEHOLDER_KEY_PREFIX)
    }

    /// First ten characters of the key, followed by `...`.
    pub fn key_preview(&self) -> String {
        let head: String = self.api_key.chars().take(KEY_PREVIEW_CHARS).collect();
        format!("{}...", head)
    }

    /// The lines printed before the request goes out.
    pub fn banner(&self) -> String {
        format!(
            "Testing model: {}\nAPI endpoint: {}\nAPI key (first {} chars): {}\n",
            self.model_name,
            self.endpoint,
            KEY_PREVIEW_CHARS,
            self.key_preview()
        )
    }
}

impl fmt::Debug for ProbeConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProbeConfig")
            .field("endpoint", &self.endpoint)
            .field("model_name", &self.model_name)
            .field("api_key", &self.key_preview())
            .field("prompt_message", &self.prompt_message)
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// Status and undecoded body of whatever the server sent back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawResponse {
    pub status: u16,
    pub body: String,
}

pub trait Transport {
    /// POSTs `body` as JSON to `url`, authenticated with `token`.
    ///
    /// Any HTTP status is a response. Only failures that leave no response
    /// to look at are errors.
    fn post_json(
        &self,
        url: &str,
        token: &str,
        body: String,
    ) -> Result<RawResponse, TransportError>;
}

fn is_timeout(error: &(dyn std::error::Error + 'static)) -> bool {
    let mut current = Some(error);

    while let Some(err) = current {
        if let Some(io) = err.downcast_ref::<std::io::Error>() {
            if matches!(
                io.kind(),
                std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock
            ) {
                return true;
            }
        }
        current = err.source();
    }

    false
}

impl From<std::io::Error> for TransportError {
    fn from(error: std::io::Error) -> Self {
        if is_timeout(&error) {
            TransportError::Timeout(error.to_string())
        } else {
            TransportError::Other(error.to_string())
        }
    }
}

#[cfg(feature = "ureq")]
impl From<ureq::Transport> for TransportError {
    fn from(error: ureq::Transport) -> Self {
        let message = error.to_string();

        if is_timeout(&error) {
            return TransportError::Timeout(message);
        }

        match error.kind() {
            ureq::ErrorKind::Dns | ureq::ErrorKind::ConnectionFailed => {
                TransportError::Connect(message)
            }
            _ => TransportError::Other(message),
        }
    }
}

#[cfg(feature = "ureq")]
pub struct HttpTransport {
    client: ureq::Agent,
}

#[cfg(feature = "ureq")]
impl HttpTransport {
    pub fn new(timeout: Duration) -> Result<HttpTransport, Error> {
        let client = ureq::AgentBuilder::new()
            .timeout(timeout)
            .try_proxy_from_env(false)
            .build();

        Ok(Self { client })
    }
}

#[cfg(feature = "ureq")]
impl Transport for HttpTransport {
    fn post_json(
        &self,
        url: &str,
        token: &str,
        body: String,
    ) -> Result<RawResponse, TransportError> {
        let request = self
            .client
            .post(url)
            .set("Content-Type", "application/json")
            .set("Authorization", &format!("Bearer {}", token));

        // ureq reports 4xx/5xx as errors, but they still carry a response.
        let response = match request.send_string(&body) {
            Ok(response) | Err(ureq::Error::Status(_, response)) => response,
            Err(ureq::Error::Transport(transport)) => return Err(transport.into()),
        };

        let status = response.status();

        // into_string() caps bodies at 10 MB; whatever arrived is still a response.
        let mut bytes = Vec::new();
        response.into_reader().read_to_end(&mut bytes)?;
        let body = String::from_utf8_lossy(&bytes).into_owned();

        Ok(RawResponse { status, body })
    }
}

#[cfg(feature = "reqwest")]
impl From<reqwest::Error> for TransportError {
    fn from(error: reqwest::Error) -> Self {
        let message = error.to_string();

        if error.is_timeout() {
            TransportError::Timeout(message)
        } else if error.is_connect() {
            TransportError::Connect(message)
        } else {
            TransportError::Other(message)
        }
    }
}

#[cfg(feature = "reqwest")]
pub struct HttpTransport {
    client: reqwest::blocking::Client,
}

#[cfg(feature = "reqwest")]
impl HttpTransport {
    pub fn new(timeout: Duration) -> Result<HttpTransport, Error> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .no_proxy()
            .build()
            .map_err(|e| Error::BadConfigurationError(e.to_string()))?;

        Ok(Self { client })
    }
}

#[cfg(feature = "reqwest")]
impl Transport for HttpTransport {
    fn post_json(
        &self,
        url: &str,
        token: &str,
        body: String,
    ) -> Result<RawResponse, TransportError> {
        let mut authorization = reqwest::header::HeaderValue::from_str(&format!("Bearer {}", token))
            .map_err(|e| TransportError::Other(e.to_string()))?;
        authorization.set_sensitive(true);

        let response = self
            .client
            .post(url)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .header(reqwest::header::AUTHORIZATION, authorization)
            .body(body)
            .send()?;

        let status = response.status().as_u16();
        let body = response.text()?;

        Ok(RawResponse { status, body })
    }
}

/// `choices[0].message.content`, if the body has one.
pub fn reply_text(body: &Value) -> Option<&str> {
    body.get("choices")?
        .get(0)?
        .get("message")?
        .get("content")?
        .as_str()
}

/// How a probe ended. Exactly one per run.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Success {
        http_status: u16,
        reply_text: String,
        raw_body: Value,
    },
    ApplicationFailure {
        http_status: u16,
        raw_body: Value,
    },
    MalformedResponse {
        http_status: u16,
        raw_text: String,
    },
    TransportFailure {
        message: String,
    },
}

impl Outcome {
    /// Sorts a transport result into an outcome. First match wins: transport
    /// error, body that isn't JSON, 200 with a reply, anything else.
    pub fn classify(response: Result<RawResponse, TransportError>) -> Outcome {
        let RawResponse { status, body } = match response {
            Ok(response) => response,
            Err(error) => {
                return Outcome::TransportFailure {
                    message: error.to_string(),
                }
            }
        };

        let raw_body: Value = match serde_json::from_str(&body) {
            Ok(value) => value,
            Err(_) => {
                return Outcome::MalformedResponse {
                    http_status: status,
                    raw_text: body,
                }
            }
        };

        if status == 200 {
            if let Some(reply) = reply_text(&raw_body) {
                return Outcome::Success {
                    http_status: status,
                    reply_text: reply.to_string(),
                    raw_body,
                };
            }
        }

        Outcome::ApplicationFailure {
            http_status: status,
            raw_body,
        }
    }

    pub fn http_status(&self) -> Option<u16> {
        match self {
            Outcome::Success { http_status, .. }
            | Outcome::ApplicationFailure { http_status, .. }
            | Outcome::MalformedResponse { http_status, .. } => Some(*http_status),
            Outcome::TransportFailure { .. } => None,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success { .. })
    }

    /// The report printed for this outcome. Same outcome, same text.
    pub fn render(&self) -> String {
        self.to_string()
    }
}

fn write_body(f: &mut fmt::Formatter<'_>, status: u16, body: &Value) -> fmt::Result {
    // serde_json leaves non-ASCII alone and indents by two spaces.
    let pretty = serde_json::to_string_pretty(body).map_err(|_| fmt::Error)?;

    writeln!(f, "HTTP status: {}", status)?;
    writeln!(f)?;
    writeln!(f, "--- Response body ---")?;
    writeln!(f, "{}", pretty)?;
    writeln!(f)
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Success {
                http_status,
                reply_text,
                raw_body,
            } => {
                write_body(f, *http_status, raw_body)?;
                writeln!(f, "✅ Test passed! The model is available.")?;
                write!(f, "Reply: {}", reply_text)
            }
            Outcome::ApplicationFailure {
                http_status,
                raw_body,
            } => {
                write_body(f, *http_status, raw_body)?;
                write!(f, "❌ Test failed. Check the error details above.")
            }
            Outcome::MalformedResponse {
                http_status,
                raw_text,
            } => {
                writeln!(f, "HTTP status: {}", http_status)?;
                writeln!(f, "Response is not valid JSON:")?;
                write!(f, "{}", raw_text)
            }
            Outcome::TransportFailure { message } => write!(f, "Request failed: {}", message),
        }
    }
}

pub struct Prober<T = HttpTransport> {
    config: ProbeConfig,
    transport: T,
}

impl Prober<HttpTransport> {
    /// Creates a new `Prober` talking HTTP, with the timeout from `config`.
    ///
    /// Proxy settings from the environment are ignored, so the probe always
    /// goes straight to the endpoint.
    ///
    /// # Returns
    ///
    /// A `Result` containing the new `Prober`, or an `Error` if the HTTP
    /// client could not be set up.
    pub fn new(config: ProbeConfig) -> Result<Prober, Error> {
        let transport = HttpTransport::new(config.timeout)?;
        Ok(Self { config, transport })
    }
}

impl<T: Transport> Prober<T> {
    pub fn with_transport(config: ProbeConfig, transport: T) -> Prober<T> {
        Self { config, transport }
    }

    pub fn config(&self) -> &ProbeConfig {
        &self.config
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Sends the one chat completion request and classifies what came back.
    ///
    /// The key is checked first: while it is still the shipped placeholder,
    /// nothing is sent and `Error::MissingCredential` is returned.
    ///
    /// # Returns
    ///
    /// A `Result` containing the `Outcome` of the request. Transport
    /// failures, bad bodies and API errors are outcomes, not errors.
    ///
    /// # Example
    ///
    /// ```rust,no_run
    /// use model_probe::{ProbeConfig, Prober};
    ///
    /// let prober = Prober::new(ProbeConfig::from_env()).unwrap();
    /// let outcome = prober.run().unwrap();
    ///
    /// println!("{}", outcome);
    /// ```
    pub fn run(&self) -> Result<Outcome, Error> {
        if self.config.has_placeholder_key() {
            return Err(Error::MissingCredential);
        }

        let request =
            ChatCompletions::single_prompt(&self.config.model_name, &self.config.prompt_message);
        let body = serde_json::to_string(&request).map_err(Error::SerializationError)?;

        debug!(
            endpoint = %self.config.endpoint,
            model = %self.config.model_name,
            "sending chat completion request"
        );

        let response = self
            .transport
            .post_json(&self.config.endpoint, &self.config.api_key, body);
        let outcome = Outcome::classify(response);

        match &outcome {
            Outcome::TransportFailure { message } => {
                warn!(error = %message, "chat completion request failed");
            }
            other => {
                debug!(
                    status = other.http_status(),
                    success = other.is_success(),
                    "chat completion response received"
                );
            }
        }

        Ok(outcome)
    }
}
