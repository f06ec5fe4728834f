use serde::{Deserialize, Serialize};

/// Caller-facing request for a single generation call
#[derive(Debug, Clone)]
pub struct GenerateRequest {
    /// Durable file reference returned by the intake service
    pub file_uri: String,
    /// MIME type of the referenced file
    pub mime_type: String,
    /// Instruction text sent alongside the file part
    pub prompt: String,
}

/// Generation parameters sent with every call
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationConfig {
    pub temperature: f64,
    pub top_k: u32,
    pub top_p: f64,
    pub max_output_tokens: u32,
    pub response_mime_type: String,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            temperature: 0.3,
            top_k: 32,
            top_p: 0.95,
            max_output_tokens: 16384,
            response_mime_type: "application/json".to_string(),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct WireGenerateRequest {
    pub contents: Vec<WireContent>,
    pub generation_config: GenerationConfig,
}

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct WireContent {
    pub parts: Vec<WirePart>,
}

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct WirePart {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_data: Option<WireFileData>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct WireFileData {
    pub mime_type: String,
    pub file_uri: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct WireGenerateResponse {
    #[serde(default)]
    pub candidates: Vec<WireCandidate>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct WireCandidate {
    pub content: Option<WireContent>,
}

impl WireGenerateRequest {
    pub fn from_request(req: &GenerateRequest) -> Self {
        Self {
            contents: vec![WireContent {
                parts: vec![
                    WirePart {
                        file_data: Some(WireFileData {
                            mime_type: req.mime_type.clone(),
                            file_uri: req.file_uri.clone(),
                        }),
                        text: None,
                    },
                    WirePart {
                        file_data: None,
                        text: Some(req.prompt.clone()),
                    },
                ],
            }],
            generation_config: GenerationConfig::default(),
        }
    }
}

impl WireGenerateResponse {
    /// First candidate's first text part, if any.
    pub fn first_text(self) -> Option<String> {
        self.candidates
            .into_iter()
            .next()?
            .content?
            .parts
            .into_iter()
            .find_map(|part| part.text)
    }
}
