//! Deployment descriptors for TGI managed endpoints.
//!
//! Endpoint naming, the regional container image, the container environment
//! and the generation parameters sent with every request.

use chrono::{DateTime, Utc};
use lazy_static::lazy_static;
use regex::Regex;
use serde::Serialize;
use serde_json::{json, Value as JsonValue};
use std::collections::BTreeMap;

use conductor_core::{BackendConfig, ConfigError};

/// Region used when the config does not name one.
pub const DEFAULT_REGION: &str = "us-east-1";

/// Repository and tag of the Hugging Face TGI inference image.
pub const TGI_IMAGE: &str =
    "huggingface-pytorch-tgi-inference:2.1.1-tgi1.3.1-gpu-py310-cu121-ubuntu20.04-v1.0";

/// Suffix of every endpoint base name.
pub const ENDPOINT_SUFFIX: &str = "-tgi-streaming";

/// Longest endpoint name the control plane accepts.
pub const ENDPOINT_NAME_MAX: usize = 63;

lazy_static! {
    static ref ENDPOINT_NAME: Regex =
        Regex::new(r"^[a-zA-Z0-9](-*[a-zA-Z0-9])*$").expect("valid endpoint name pattern");
    static ref INVALID_NAME_CHARS: Regex =
        Regex::new(r"[^a-zA-Z0-9-]+").expect("valid character class");
}

/// ECR account hosting the TGI image in `region`.
pub fn ecr_account(region: &str) -> Option<&'static str> {
    Some(match region {
        "af-south-1" => "626614931356",
        "il-central-1" => "780543022126",
        "ap-east-1" => "871362719292",
        "ap-northeast-1" | "ap-northeast-2" => "763104351884",
        "ap-northeast-3" => "364406365360",
        "ap-south-1" => "763104351884",
        "ap-south-2" => "772153158452",
        "ap-southeast-1" | "ap-southeast-2" => "763104351884",
        "ap-southeast-3" => "907027046896",
        "ap-southeast-4" => "457447274322",
        "ca-central-1" => "763104351884",
        "cn-north-1" | "cn-northwest-1" => "727897471807",
        "eu-central-1" => "763104351884",
        "eu-central-2" => "380420809688",
        "eu-north-1" | "eu-west-1" | "eu-west-2" | "eu-west-3" => "763104351884",
        "eu-south-1" => "692866216735",
        "eu-south-2" => "503227376785",
        "me-south-1" => "217643126080",
        "me-central-1" => "914824155844",
        "sa-east-1" => "763104351884",
        "us-east-1" | "us-east-2" => "763104351884",
        "us-gov-east-1" => "446045086412",
        "us-gov-west-1" => "442386744353",
        "us-iso-east-1" => "886529160074",
        "us-isob-east-1" => "094389454867",
        "us-west-1" | "us-west-2" => "763104351884",
        _ => return None,
    })
}

/// Full URI of the TGI image for `region`.
pub fn tgi_image_uri(region: &str) -> Result<String, ConfigError> {
    let account = ecr_account(region).ok_or_else(|| ConfigError::InvalidField {
        field: "region".to_string(),
        expected: "a region with a published TGI image",
    })?;
    Ok(format!("{account}.dkr.ecr.{region}.amazonaws.com/{TGI_IMAGE}"))
}

/// Endpoint base name for a model id.
///
/// Keeps the first two `-`-separated segments, drops the organization
/// prefix, and appends [`ENDPOINT_SUFFIX`]:
/// `mistralai/Mistral-7B-v0.1` becomes `Mistral-7B-tgi-streaming`.
pub fn endpoint_base_name(model_id: &str) -> Result<String, ConfigError> {
    let head = model_id.split('-').take(2).collect::<Vec<_>>().join("-");
    let name = head.split('/').nth(1).unwrap_or(head.as_str());
    let name = INVALID_NAME_CHARS.replace_all(name, "-");
    let name = name.trim_matches('-');

    let base = format!("{name}{ENDPOINT_SUFFIX}");
    validate_endpoint_name(&base)?;
    Ok(base)
}

/// Unique endpoint name: `{base}-{YYYY-MM-DD-HH-MM-SS-mmm}`.
///
/// The base is shortened so the whole name fits [`ENDPOINT_NAME_MAX`].
pub fn timestamped_name(base: &str, now: DateTime<Utc>) -> String {
    let stamp = now.format("%Y-%m-%d-%H-%M-%S-%3f").to_string();
    let room = ENDPOINT_NAME_MAX - stamp.len() - 1;
    let base = base.get(..room).unwrap_or(base).trim_end_matches('-');
    format!("{base}-{stamp}")
}

/// Check a name against the endpoint naming rules.
pub fn validate_endpoint_name(name: &str) -> Result<(), ConfigError> {
    if name.len() > ENDPOINT_NAME_MAX || !ENDPOINT_NAME.is_match(name) {
        return Err(ConfigError::ValidationError(format!(
            "'{name}' is not a valid endpoint name"
        )));
    }
    Ok(())
}

/// Container sizing for a TGI deployment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TgiLimits {
    pub num_gpus: u64,
    pub max_input_length: u64,
    pub max_total_tokens: u64,
    pub max_batch_total_tokens: u64,
}

impl TgiLimits {
    /// Read limits from a backend config.
    pub fn from_config(config: &BackendConfig) -> Result<Self, ConfigError> {
        Ok(Self {
            num_gpus: config.u64_or("number_of_gpu", 1)?,
            max_input_length: config.u64_or("max_input_length", 2048)?,
            max_total_tokens: config.u64_or("max_total_length", 4096)?,
            max_batch_total_tokens: config.u64_or("max_batch_total_tokens", 8192)?,
        })
    }

    /// Container environment for serving `model_id`, without secrets.
    pub fn environment(&self, model_id: &str) -> BTreeMap<String, String> {
        BTreeMap::from([
            ("HF_MODEL_ID".to_string(), model_id.to_string()),
            ("SM_NUM_GPUS".to_string(), self.num_gpus.to_string()),
            ("MAX_INPUT_LENGTH".to_string(), self.max_input_length.to_string()),
            ("MAX_TOTAL_TOKENS".to_string(), self.max_total_tokens.to_string()),
            (
                "MAX_BATCH_TOTAL_TOKENS".to_string(),
                self.max_batch_total_tokens.to_string(),
            ),
        ])
    }
}

/// Generation parameters sent with every TGI request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InferenceParams {
    pub top_p: f64,
    pub top_k: u64,
    pub stop: Vec<String>,
    pub do_sample: bool,
    pub temperature: f64,
    pub max_new_tokens: u64,
    pub return_full_text: bool,
    pub repetition_penalty: f64,
}

impl InferenceParams {
    /// Read parameters from a backend config, with defaults.
    pub fn from_config(config: &BackendConfig) -> Result<Self, ConfigError> {
        Ok(Self {
            top_p: config.f64_or("top_p", 0.6)?,
            top_k: config.u64_or("top_k", 50)?,
            stop: config.str_list_or("stop", &["</s>"])?,
            do_sample: config.bool_or("do_sample", true)?,
            temperature: config.f64_or("temperature", 0.9)?,
            max_new_tokens: config.u64_or("max_new_tokens", 512)?,
            return_full_text: config.bool_or("return_full_text", false)?,
            repetition_penalty: config.f64_or("repetition_penalty", 1.03)?,
        })
    }

    /// Request body for `query`.
    pub fn payload(&self, query: &str, stream: bool) -> JsonValue {
        json!({
            "inputs": query,
            "parameters": self,
            "stream": stream,
        })
    }
}
